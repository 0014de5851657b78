// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2024 Juan Palacios <jpalaciosdev@gmail.com>

//! Connection multiplexer workflows.

use std::{
    collections::HashSet,
    io,
    os::fd::AsRawFd,
    time::{Duration, Instant},
};

use super::{Interest, Slot, SlotId, WatchSet};
use crate::io::{poll, Fd};

/// Number of slots allocated by [`poll_ready`] for an empty watch set.
pub const INITIAL_SLOTS: usize = 8;

/// Waits until a watched connection can be read without blocking and returns
/// its slot. A connection whose peer has closed it is reported as well, as
/// reading it returns the end of stream right away.
///
/// New connections are accepted from `listener` into free slots while
/// waiting; the watch set doubles its size when there is none. `closed`
/// names a slot whose connection is closed and freed before waiting.
///
/// An empty `watch_set` is first replaced by [`INITIAL_SLOTS`] slots with
/// the listener in the first one.
///
/// # Errors
///
/// If this function encounters any form of I/O error, an error variant will be
/// returned. Connections installed in `watch_set` are left untouched.
pub fn poll_ready(
    listener: &impl AsRawFd,
    watch_set: &mut WatchSet,
    closed: Option<SlotId>,
) -> io::Result<SlotId> {
    let mut closed = closed;
    loop {
        if let Some(slot) = poll_ready_timeout(listener, watch_set, closed.take(), None)? {
            return Ok(slot);
        }
    }
}

/// Same as [`poll_ready`], but gives up waiting when `timeout` expires,
/// returning `None`.
///
/// Only read readiness is reported. A connection watched for
/// [`Interest::WRITABLE`] that is merely writable stops being watched for
/// writing until this call returns. An invalid descriptor is reported as
/// ready, reading it fails right away.
///
/// # Errors
///
/// If this function encounters any form of I/O error, an error variant will be
/// returned. Connections installed in `watch_set` are left untouched.
pub fn poll_ready_timeout(
    listener: &impl AsRawFd,
    watch_set: &mut WatchSet,
    closed: Option<SlotId>,
    timeout: Option<Duration>,
) -> io::Result<Option<SlotId>> {
    if let Some(slot) = closed {
        watch_set.close(slot)?;
        log::debug!("Closed connection on slot {}", slot);
    }

    if watch_set.is_empty() {
        *watch_set = WatchSet::with_listener(INITIAL_SLOTS);
    }

    let deadline = timeout.map(|timeout| Instant::now() + timeout);
    let mut write_ready = HashSet::<usize>::new();
    loop {
        let mut entries = watch_set.poll_entries(listener.as_raw_fd());
        for &index in &write_ready {
            if let Some(entry) = entries.get_mut(index) {
                entry.events &= !libc::POLLOUT;
            }
        }

        let remaining =
            deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
        if poll::wait(&mut entries, remaining)? == 0 {
            return Ok(None);
        }

        // Connections go first, lowest slot wins.
        let mut listener_ready = false;
        for (index, entry) in entries.iter().enumerate() {
            if entry.revents == 0 {
                continue;
            }

            match watch_set.get(SlotId::from(index)) {
                Some(Slot::Active { .. })
                    if entry.revents & (poll::READ_READY | libc::POLLNVAL) != 0 =>
                {
                    return Ok(Some(SlotId::from(index)))
                }
                Some(Slot::Active { .. }) => {
                    write_ready.insert(index);
                }
                Some(Slot::Listener) => listener_ready = true,
                _ => {}
            }
        }

        if listener_ready {
            if watch_set.first_free().is_none() {
                watch_set.grow(watch_set.len());
            }
            accept_pending(listener, watch_set)?;
        }

        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Ok(None);
        }
    }
}

/// Accepts a connection from a listener reported ready. Failures that only
/// mean the pending connection went away are not errors, the wait goes on.
fn accept_pending(
    listener: &impl AsRawFd,
    watch_set: &mut WatchSet,
) -> io::Result<Option<SlotId>> {
    match accept_one(listener, watch_set, Interest::READABLE) {
        Err(e) if is_transient_accept_error(&e) => {
            log::debug!("Connection went away before being accepted: {}", e);
            Ok(None)
        }
        result => result,
    }
}

fn is_transient_accept_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::ConnectionAborted
    ) || matches!(error.raw_os_error(), Some(libc::EPROTO))
}

/// Accepts exactly one connection from `listener` into the first free slot
/// of `watch_set`, watching it for `interest`.
///
/// `listener` must have a pending connection. Returns the slot of the new
/// connection, or `None` without accepting anything when there is no free
/// slot.
///
/// # Errors
///
/// If accepting the connection fails, an error variant will be returned.
pub fn accept_one(
    listener: &impl AsRawFd,
    watch_set: &mut WatchSet,
    interest: Interest,
) -> io::Result<Option<SlotId>> {
    if watch_set.first_free().is_none() {
        return Ok(None);
    }

    let connection = Fd::accept(listener)?;
    let fd = connection.as_raw_fd();

    match watch_set.install(connection, interest) {
        Ok(slot) => {
            log::debug!("Accepted descriptor {} into slot {}", fd, slot);
            Ok(Some(slot))
        }
        Err(_) => Err(io::Error::new(
            io::ErrorKind::Other,
            format!("No free slot for descriptor {}", fd),
        )),
    }
}
