// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2024 Juan Palacios <jpalaciosdev@gmail.com>

//! Connection multiplexer domain model.

use std::{
    fmt, io, mem,
    ops::BitOr,
    os::fd::{AsRawFd, RawFd},
};

use crate::io::{poll, Fd};

/// Identity of a slot in a [`WatchSet`]. It's the slot position, which
/// never changes while the slot is occupied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(usize);

/// Readiness events a connection is watched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(libc::c_short);

/// Watch set entry.
#[derive(Debug)]
pub enum Slot {
    /// The listening endpoint.
    Listener,
    /// An accepted connection.
    Active { connection: Fd, interest: Interest },
    /// No endpoint, can be reused.
    Free,
}

/// Index-stable arena of watched endpoints.
///
/// A slot only becomes free when its connection is explicitly released or
/// closed, so an open connection is never reassigned.
#[derive(Debug, Default)]
pub struct WatchSet(Vec<Slot>);

// --- Implementations

impl From<usize> for SlotId {
    fn from(value: usize) -> Self {
        SlotId(value)
    }
}

impl SlotId {
    /// Slot position in the watch set.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Interest {
    pub const READABLE: Interest = Interest(libc::POLLIN);
    pub const WRITABLE: Interest = Interest(libc::POLLOUT);

    /// Raw poll events.
    pub fn events(self) -> libc::c_short {
        self.0
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Self) -> Self::Output {
        Interest(self.0 | rhs.0)
    }
}

impl WatchSet {
    /// Creates an empty watch set.
    pub fn new() -> Self {
        WatchSet(Vec::new())
    }

    /// Creates a watch set of `slots` slots, the first one holding the
    /// listening endpoint and the rest free.
    pub fn with_listener(slots: usize) -> Self {
        let mut set = WatchSet(vec![Slot::Listener]);
        set.grow(slots.saturating_sub(1));
        set
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Appends `additional` free slots.
    pub fn grow(&mut self, additional: usize) {
        self.0.extend((0..additional).map(|_| Slot::Free));
        log::debug!("Watch set grown to {} slots", self.0.len());
    }

    /// Returns the first free slot, if any.
    pub fn first_free(&self) -> Option<SlotId> {
        self.0
            .iter()
            .position(|slot| matches!(slot, Slot::Free))
            .map(SlotId)
    }

    pub fn get(&self, slot: SlotId) -> Option<&Slot> {
        self.0.get(slot.0)
    }

    /// Returns the connection held by `slot`, if any.
    pub fn connection(&self, slot: SlotId) -> Option<&Fd> {
        match self.get(slot) {
            Some(Slot::Active { connection, .. }) => Some(connection),
            _ => None,
        }
    }

    /// Iterates over the occupied connection slots.
    pub fn active(&self) -> impl Iterator<Item = (SlotId, &Fd)> {
        self.0
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Active { connection, .. } => Some((SlotId(index), connection)),
                _ => None,
            })
    }

    /// Installs `connection` into the first free slot.
    ///
    /// # Errors
    ///
    /// When there is no free slot, the connection is given back.
    pub fn install(&mut self, connection: Fd, interest: Interest) -> Result<SlotId, Fd> {
        match self.first_free() {
            Some(slot) => {
                self.0[slot.0] = Slot::Active {
                    connection,
                    interest,
                };
                Ok(slot)
            }
            None => Err(connection),
        }
    }

    /// Takes the connection out of `slot`, leaving the slot free. The caller
    /// becomes the connection owner.
    pub fn release(&mut self, slot: SlotId) -> Option<Fd> {
        let entry = self.0.get_mut(slot.0)?;
        if !matches!(entry, Slot::Active { .. }) {
            return None;
        }

        match mem::replace(entry, Slot::Free) {
            Slot::Active { connection, .. } => Some(connection),
            _ => None,
        }
    }

    /// Closes the connection held by `slot`, leaving the slot free.
    ///
    /// # Errors
    ///
    /// An error variant will be returned if `slot` holds no connection or
    /// closing it fails. The slot is free in the latter case.
    pub fn close(&mut self, slot: SlotId) -> io::Result<()> {
        match self.release(slot) {
            Some(connection) => connection.close(),
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Slot {} holds no connection", slot),
            )),
        }
    }

    /// Builds the poll entries for the slots, in slot order. `listener` is
    /// the descriptor watched by listener slots.
    pub(crate) fn poll_entries(&self, listener: RawFd) -> Vec<libc::pollfd> {
        self.0
            .iter()
            .map(|slot| match slot {
                Slot::Listener => poll::entry(listener, libc::POLLIN),
                Slot::Active {
                    connection,
                    interest,
                } => poll::entry(connection.as_raw_fd(), interest.events()),
                Slot::Free => poll::entry(-1, 0),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> Fd {
        let (reader, _writer) = Fd::pipe().unwrap();
        reader
    }

    #[test]
    fn with_listener_reserves_the_first_slot() {
        let set = WatchSet::with_listener(4);
        assert_eq!(4, set.len());
        assert!(matches!(set.get(SlotId(0)), Some(Slot::Listener)));
        assert_eq!(Some(SlotId(1)), set.first_free());
        assert_eq!(0, set.active().count());
    }

    #[test]
    fn install_takes_the_first_free_slot() {
        let mut set = WatchSet::with_listener(4);
        assert_eq!(SlotId(1), set.install(connection(), Interest::READABLE).unwrap());
        assert_eq!(SlotId(2), set.install(connection(), Interest::READABLE).unwrap());

        set.release(SlotId(1)).unwrap();
        assert_eq!(SlotId(1), set.install(connection(), Interest::READABLE).unwrap());
    }

    #[test]
    fn install_gives_the_connection_back_when_full() {
        let mut set = WatchSet::with_listener(2);
        set.install(connection(), Interest::READABLE).unwrap();

        let rejected = connection();
        let raw = rejected.as_raw_fd();
        let given_back = set.install(rejected, Interest::READABLE).unwrap_err();
        assert_eq!(raw, given_back.as_raw_fd());
    }

    #[test]
    fn release_transfers_the_connection_and_frees_the_slot() {
        let mut set = WatchSet::with_listener(3);
        let fd = connection();
        let raw = fd.as_raw_fd();
        let slot = set.install(fd, Interest::READABLE).unwrap();

        let released = set.release(slot).unwrap();
        assert_eq!(raw, released.as_raw_fd());
        assert!(matches!(set.get(slot), Some(Slot::Free)));
        assert!(set.release(slot).is_none());
        assert!(set.release(SlotId(0)).is_none());
    }

    #[test]
    fn close_requires_an_occupied_slot() {
        let mut set = WatchSet::with_listener(3);
        let slot = set.install(connection(), Interest::READABLE).unwrap();

        set.close(slot).unwrap();
        assert_eq!(
            io::ErrorKind::InvalidInput,
            set.close(slot).unwrap_err().kind()
        );
        assert_eq!(
            io::ErrorKind::InvalidInput,
            set.close(SlotId(0)).unwrap_err().kind()
        );
        assert_eq!(
            io::ErrorKind::InvalidInput,
            set.close(SlotId(10)).unwrap_err().kind()
        );
    }

    #[test]
    fn grow_appends_free_slots_keeping_occupied_ones() {
        let mut set = WatchSet::with_listener(2);
        let slot = set.install(connection(), Interest::READABLE).unwrap();
        let raw = set.connection(slot).unwrap().as_raw_fd();
        assert_eq!(None, set.first_free());

        set.grow(2);
        assert_eq!(4, set.len());
        assert_eq!(Some(SlotId(2)), set.first_free());
        assert_eq!(raw, set.connection(slot).unwrap().as_raw_fd());
    }

    #[test]
    fn poll_entries_follow_slot_order() {
        let mut set = WatchSet::with_listener(3);
        set.grow(1);
        let fd = connection();
        let raw = fd.as_raw_fd();
        set.install(fd, Interest::READABLE | Interest::WRITABLE)
            .unwrap();

        let entries = set.poll_entries(42);
        assert_eq!(4, entries.len());
        assert_eq!((42, libc::POLLIN), (entries[0].fd, entries[0].events));
        assert_eq!(
            (raw, libc::POLLIN | libc::POLLOUT),
            (entries[1].fd, entries[1].events)
        );
        assert_eq!(-1, entries[2].fd);
        assert_eq!(-1, entries[3].fd);
    }

    #[test]
    fn new_watch_set_is_empty() {
        let set = WatchSet::new();
        assert!(set.is_empty());
        assert_eq!(None, set.first_free());
    }
}
