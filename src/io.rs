// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2024 Juan Palacios <jpalaciosdev@gmail.com>

//! Input / Output primitives and related modules.

#[macro_use]
mod fd;

pub mod channel;
pub mod dispatch;
pub(crate) mod poll;

pub use channel::BufferedChannel;
pub use dispatch::{dispatch, DispatchError, Dispatched, ReconcileError};
pub use fd::Fd;
