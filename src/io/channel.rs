// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2024 Juan Palacios <jpalaciosdev@gmail.com>

//! Buffered duplex channel whose writes never block.
//!
//! Bridging a request stream into a program and its response stream back out
//! through two bounded transports (pipes, sockets) deadlocks as soon as both
//! sides wait for buffer space at the same time. A [`BufferedChannel`]
//! absorbs whatever the transport doesn't accept into an unbounded queue of
//! pending bytes and keeps flushing that queue while the caller is blocked
//! reading, so the peer is never starved of input.
//!
//! Pending bytes are flushed opportunistically on every [`write`],
//! [`read`] and [`try_flush`] call, and completely on [`drain`] and
//! [`close`]. Nothing is flushed between calls.
//!
//! [`write`]: BufferedChannel::write
//! [`read`]: BufferedChannel::read
//! [`try_flush`]: BufferedChannel::try_flush
//! [`drain`]: BufferedChannel::drain
//! [`close`]: BufferedChannel::close

use std::{
    collections::VecDeque,
    io,
    os::fd::{AsRawFd, RawFd},
};

use super::{fd::Fd, poll};

/// A duplex channel over a read end and a write end.
///
/// Dropping the channel releases both ends and discards any pending bytes;
/// use [`BufferedChannel::close`] to deliver them first.
pub struct BufferedChannel {
    reader: Fd,
    writer: Option<Fd>,
    pending: VecDeque<u8>,
    finishing: bool,
}

impl BufferedChannel {
    /// Creates a channel taking ownership of `reader` and `writer`.
    ///
    /// The write end is switched to non-blocking mode. No I/O is performed.
    ///
    /// # Errors
    ///
    /// If the write end can't be configured, an error variant will be
    /// returned and both ends are released.
    pub fn open(reader: Fd, writer: Fd) -> io::Result<Self> {
        writer.set_nonblocking(true)?;

        Ok(BufferedChannel {
            reader,
            writer: Some(writer),
            pending: VecDeque::new(),
            finishing: false,
        })
    }

    /// Creates a channel whose both directions are the same `connection`.
    ///
    /// # Errors
    ///
    /// If the connection can't be duplicated (usually because the descriptor
    /// table is full), an error variant will be returned and the connection
    /// is released.
    pub fn duplex(connection: Fd) -> io::Result<Self> {
        let writer = connection.try_clone()?;
        Self::open(connection, writer)
    }

    /// Number of bytes accepted by [`BufferedChannel::write`] that haven't
    /// been handed to the system yet.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Writes `data` without blocking.
    ///
    /// Bytes that the system doesn't accept right away are queued behind the
    /// already pending ones. Returns the length of `data`, as every byte will
    /// be delivered eventually.
    ///
    /// # Errors
    ///
    /// An error variant will be returned on unrecoverable write failures or
    /// when the channel no longer accepts writes (see
    /// [`BufferedChannel::finish_writes`]).
    pub fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.finishing {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "The channel no longer accepts writes",
            ));
        }

        if !self.pending.is_empty() {
            self.try_flush()?;
        }

        let mut written = 0;
        if self.pending.is_empty() {
            if let Some(writer) = &self.writer {
                written = match writer.write(data) {
                    Ok(count) => count,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
                    Err(e) => return Err(e),
                };
            }
        }

        if written < data.len() {
            self.pending.extend(&data[written..]);
            log::trace!(
                "Queued {} bytes, {} pending",
                data.len() - written,
                self.pending.len()
            );
        }

        Ok(data.len())
    }

    /// Hands as many pending bytes to the system as it accepts without
    /// blocking.
    ///
    /// # Errors
    ///
    /// If this function encounters any form of I/O error, an error variant will be
    /// returned.
    pub fn try_flush(&mut self) -> io::Result<()> {
        if let Some(writer) = &self.writer {
            while !self.pending.is_empty() {
                let (front, _) = self.pending.as_slices();
                match writer.write(front) {
                    Ok(0) => break,
                    Ok(count) => {
                        self.pending.drain(..count);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(e),
                }
            }
        }

        if self.finishing && self.pending.is_empty() {
            self.release_writer()?;
        }

        Ok(())
    }

    /// Reads into `buffer`, blocking until some data or the end of stream is
    /// available. Pending bytes keep being flushed while waiting.
    ///
    /// Returns the number of bytes read, zero meaning the end of stream.
    ///
    /// # Errors
    ///
    /// An error variant will be returned on unrecoverable failures on either
    /// direction.
    pub fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        if buffer.is_empty() {
            return Ok(0);
        }

        loop {
            self.try_flush()?;

            let mut entries = [
                poll::entry(self.reader.as_raw_fd(), libc::POLLIN),
                poll::entry(self.pending_writer_fd(), libc::POLLOUT),
            ];
            poll::wait(&mut entries, None)?;

            if entries.iter().any(|e| e.revents & libc::POLLNVAL != 0) {
                return Err(io::Error::from_raw_os_error(libc::EBADF));
            }

            if entries[0].revents & poll::READ_READY != 0 {
                match self.reader.read(buffer) {
                    Ok(count) => return Ok(count),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e),
                }
            }
        }
    }

    /// Blocks until every pending byte has been handed to the system.
    ///
    /// # Errors
    ///
    /// If this function encounters any form of I/O error, an error variant will be
    /// returned.
    pub fn drain(&mut self) -> io::Result<()> {
        loop {
            self.try_flush()?;
            if self.pending.is_empty() {
                return Ok(());
            }

            let mut entries = [poll::entry(self.pending_writer_fd(), libc::POLLOUT)];
            poll::wait(&mut entries, None)?;
        }
    }

    /// Stops accepting writes. The write end is shut down and released as soon
    /// as the pending bytes are flushed, so the peer observes the end of
    /// stream while the read end stays usable.
    ///
    /// # Errors
    ///
    /// If this function encounters any form of I/O error, an error variant will be
    /// returned.
    pub fn finish_writes(&mut self) -> io::Result<()> {
        self.finishing = true;
        self.try_flush()
    }

    /// Delivers all pending bytes and releases both ends.
    ///
    /// The ends are released even if delivering fails.
    ///
    /// # Errors
    ///
    /// An error variant will be returned if the pending bytes couldn't be
    /// delivered or any end failed to close.
    pub fn close(mut self) -> io::Result<()> {
        let drained = self.drain();
        if let Err(e) = &drained {
            log::debug!("Discarding {} pending bytes: {}", self.pending.len(), e);
        }

        let BufferedChannel { reader, writer, .. } = self;
        let reader_closed = reader.close();
        let writer_closed = writer.map_or(Ok(()), Fd::close);

        drained.and(reader_closed).and(writer_closed)
    }

    fn pending_writer_fd(&self) -> RawFd {
        match &self.writer {
            Some(writer) if !self.pending.is_empty() => writer.as_raw_fd(),
            _ => -1,
        }
    }

    fn release_writer(&mut self) -> io::Result<()> {
        match self.writer.take() {
            Some(writer) => {
                let shutdown = writer.shutdown_write();
                shutdown.and(writer.close())
            }
            None => Ok(()),
        }
    }
}

impl io::Read for BufferedChannel {
    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        BufferedChannel::read(self, buffer)
    }
}

impl io::Write for BufferedChannel {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        BufferedChannel::write(self, data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.drain()
    }
}
