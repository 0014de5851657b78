// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2024 Juan Palacios <jpalaciosdev@gmail.com>

//! Connection multiplexer bounded context.

pub mod domain;
pub mod workflow;

pub use domain::{Interest, Slot, SlotId, WatchSet};
pub use workflow::{accept_one, poll_ready, poll_ready_timeout, INITIAL_SLOTS};
