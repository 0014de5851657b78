// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2024 Juan Palacios <jpalaciosdev@gmail.com>

//! Readiness wait built around [`libc::poll`].
//!
//! [`libc::poll`]: https://docs.rs/libc/latest/libc/fn.poll.html

use std::{io, os::fd::RawFd, time::Duration};

use super::fd::retry_interrupted;

/// Events after which a read on the descriptor won't block.
pub(crate) const READ_READY: libc::c_short = libc::POLLIN | libc::POLLHUP | libc::POLLERR;

/// Creates a poll entry watching `fd` for `events`.
///
/// Entries with negative descriptors are skipped by [`wait`].
pub(crate) fn entry(fd: RawFd, events: libc::c_short) -> libc::pollfd {
    libc::pollfd {
        fd,
        events,
        revents: 0,
    }
}

/// Waits until at least one of the `entries` is ready or `timeout` expires.
/// Waits forever when there is no `timeout`.
///
/// Returns the number of ready entries, which is zero on timeout.
///
/// # Errors
///
/// If this function encounters any form of I/O error, an error variant will be
/// returned.
pub(crate) fn wait(entries: &mut [libc::pollfd], timeout: Option<Duration>) -> io::Result<usize> {
    let timeout = match timeout {
        Some(duration) => duration.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
        None => -1,
    };

    // Safety: `entries` is an allocated and initialized slice and its size
    // is passed as the number of entries.
    retry_interrupted(|| unsafe {
        ffi_call!(poll(
            entries.as_mut_ptr(),
            entries.len() as libc::nfds_t,
            timeout,
        ))
    })
    .map(|count| count as usize)
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;

    use super::*;
    use crate::io::Fd;

    #[test]
    fn wait_times_out_when_nothing_is_ready() {
        let (reader, _writer) = Fd::pipe().unwrap();
        let mut entries = [entry(reader.as_raw_fd(), libc::POLLIN)];

        assert_eq!(0, wait(&mut entries, Some(Duration::from_millis(10))).unwrap());
        assert_eq!(0, entries[0].revents);
    }

    #[test]
    fn wait_reports_readable_entries() {
        let (reader, writer) = Fd::pipe().unwrap();
        let (idle, _idle_writer) = Fd::pipe().unwrap();
        writer.write(b"x").unwrap();

        let mut entries = [
            entry(idle.as_raw_fd(), libc::POLLIN),
            entry(reader.as_raw_fd(), libc::POLLIN),
        ];

        assert_eq!(1, wait(&mut entries, None).unwrap());
        assert_eq!(0, entries[0].revents);
        assert_ne!(0, entries[1].revents & READ_READY);
    }

    #[test]
    fn wait_reports_hang_up_as_read_ready() {
        let (reader, writer) = Fd::pipe().unwrap();
        drop(writer);

        let mut entries = [entry(reader.as_raw_fd(), libc::POLLIN)];
        assert_eq!(1, wait(&mut entries, None).unwrap());
        assert_ne!(0, entries[0].revents & READ_READY);
    }

    #[test]
    fn wait_skips_negative_descriptors() {
        let (_reader, writer) = Fd::pipe().unwrap();
        let mut entries = [
            entry(-1, libc::POLLIN),
            entry(writer.as_raw_fd(), libc::POLLOUT),
        ];

        assert_eq!(1, wait(&mut entries, None).unwrap());
        assert_eq!(0, entries[0].revents);
        assert_ne!(0, entries[1].revents & libc::POLLOUT);
    }
}
