// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2024 Juan Palacios <jpalaciosdev@gmail.com>

//! This module contains `Fd`, an owned file descriptor built around the
//! [`libc`] descriptor calls. Most `Fd` methods are direct calls to their ffi
//! counterparts.
//!
//! Every descriptor created here is marked close-on-exec, so a dispatched
//! process only inherits the descriptors it has been explicitly given.
//!
//! [`libc`]: https://docs.rs/libc/latest/libc/

use std::{
    io, mem,
    os::{
        fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd},
        unix::net::UnixStream,
    },
    ptr,
};

/// Helper macro to call a libc ffi function.
/// The resulting value is returned into a [std::io::Result].
macro_rules! ffi_call {
    // trailing comma is accepted
    ($name: ident( $( $arg: expr ),* $(,)? )) => {{
        let result = libc::$name($($arg, )*);
        match result {
            -1 => Err(std::io::Error::last_os_error()),
            _ =>  Ok(result),
        }
    }};
}

/// Repeats `call` while it fails with [`io::ErrorKind::Interrupted`].
pub(crate) fn retry_interrupted<T>(mut call: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match call() {
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            result => return result,
        }
    }
}

/// An owned open file descriptor.
#[derive(Debug)]
pub struct Fd(libc::c_int);

impl Fd {
    /// Attempts to create a new pipe, returning its `(read, write)` ends.
    ///
    /// # Errors
    ///
    /// If this function encounters any form of I/O error, an error variant will be
    /// returned.
    pub fn pipe() -> io::Result<(Fd, Fd)> {
        let mut fds: [libc::c_int; 2] = [-1; 2];

        // Safety: `fds` is a properly allocated array of two descriptors, as
        // required by `pipe2`.
        unsafe { ffi_call!(pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC))? };

        Ok((Fd(fds[0]), Fd(fds[1])))
    }

    /// Accepts one pending connection from `listener`.
    ///
    /// Blocks when there is no pending connection and `listener` is in
    /// blocking mode.
    ///
    /// # Errors
    ///
    /// If this function encounters any form of I/O error, an error variant will be
    /// returned.
    pub fn accept(listener: &impl AsRawFd) -> io::Result<Fd> {
        let listener = listener.as_raw_fd();

        // Safety: Null address pointers are allowed by `accept4` when the peer
        // address is not wanted.
        retry_interrupted(|| unsafe {
            ffi_call!(accept4(
                listener,
                ptr::null_mut(),
                ptr::null_mut(),
                libc::SOCK_CLOEXEC,
            ))
        })
        .map(Fd)
    }

    /// Attempts to duplicate the descriptor.
    ///
    /// Both descriptors refer to the same open file description, thus they
    /// share offsets and status flags.
    ///
    /// # Errors
    ///
    /// If this function encounters any form of I/O error, an error variant will be
    /// returned.
    pub fn try_clone(&self) -> io::Result<Fd> {
        // Safety: It's safe to call the ffi function in this context as it
        // won't produce undefined behaviour on the Rust side upon a failure.
        unsafe { ffi_call!(fcntl(self.0, libc::F_DUPFD_CLOEXEC, 0)) }.map(Fd)
    }

    /// Switches the open file description in or out of non-blocking mode.
    ///
    /// # Errors
    ///
    /// If this function encounters any form of I/O error, an error variant will be
    /// returned.
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        // Safety: It's safe to call the ffi function in this context as it
        // won't produce undefined behaviour on the Rust side upon a failure.
        let flags = unsafe { ffi_call!(fcntl(self.0, libc::F_GETFL)) }?;
        let new_flags = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };

        if new_flags != flags {
            // Safety: Same as above.
            unsafe { ffi_call!(fcntl(self.0, libc::F_SETFL, new_flags)) }?;
        }

        Ok(())
    }

    /// Reads into `buffer`, returning the number of bytes read.
    ///
    /// # Errors
    ///
    /// If this function encounters any form of I/O error, an error variant will be
    /// returned. A would-block condition is reported as
    /// [`io::ErrorKind::WouldBlock`].
    pub fn read(&self, buffer: &mut [u8]) -> io::Result<usize> {
        // Safety: `buffer` is allocated and its size is passed as length.
        retry_interrupted(|| unsafe {
            ffi_call!(read(self.0, buffer.as_mut_ptr() as *mut _, buffer.len()))
        })
        .map(|count| count as usize)
    }

    /// Writes from `data`, returning the number of bytes written.
    ///
    /// # Errors
    ///
    /// If this function encounters any form of I/O error, an error variant will be
    /// returned. A would-block condition is reported as
    /// [`io::ErrorKind::WouldBlock`].
    pub fn write(&self, data: &[u8]) -> io::Result<usize> {
        // Safety: `data` is allocated and initialized and its size is passed
        // as length.
        retry_interrupted(|| unsafe {
            ffi_call!(write(self.0, data.as_ptr() as *const _, data.len()))
        })
        .map(|count| count as usize)
    }

    /// Shuts down the sending direction of a socket, so its peer reads an end
    /// of stream. Does nothing on descriptors that are not connected sockets.
    ///
    /// # Errors
    ///
    /// If this function encounters any form of I/O error, an error variant will be
    /// returned.
    pub fn shutdown_write(&self) -> io::Result<()> {
        // Safety: It's safe to call the ffi function in this context as it
        // won't produce undefined behaviour on the Rust side upon a failure.
        match unsafe { ffi_call!(shutdown(self.0, libc::SHUT_WR)) } {
            Ok(_) => Ok(()),
            Err(error)
                if matches!(error.raw_os_error(), Some(libc::ENOTSOCK | libc::ENOTCONN)) =>
            {
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    /// Closes the descriptor, reporting any error instead of logging it.
    ///
    /// The descriptor is released even when an error is returned.
    ///
    /// # Errors
    ///
    /// If this function encounters any form of I/O error, an error variant will be
    /// returned.
    pub fn close(self) -> io::Result<()> {
        let fd = self.into_raw_fd();

        // Safety: `fd` was owned by this instance, which no longer exists.
        unsafe { ffi_call!(close(fd)) }.map(|_| ())
    }
}

impl AsRawFd for Fd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl IntoRawFd for Fd {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.0;
        mem::forget(self);
        fd
    }
}

impl FromRawFd for Fd {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Fd(fd)
    }
}

impl From<OwnedFd> for Fd {
    fn from(fd: OwnedFd) -> Self {
        Fd(fd.into_raw_fd())
    }
}

impl From<UnixStream> for Fd {
    fn from(stream: UnixStream) -> Self {
        OwnedFd::from(stream).into()
    }
}

impl From<Fd> for OwnedFd {
    fn from(fd: Fd) -> Self {
        // Safety: The raw descriptor is open and owned by nobody else.
        unsafe { OwnedFd::from_raw_fd(fd.into_raw_fd()) }
    }
}

impl io::Read for &Fd {
    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        Fd::read(*self, buffer)
    }
}

impl io::Write for &Fd {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        Fd::write(*self, data)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        // Safety: A Fd instance always have a valid open file descriptor.
        if let Err(e) = unsafe { ffi_call!(close(self.0)) } {
            log::error!("An error occur while closing descriptor {}: {}", self.0, e);
        }
    }
}
