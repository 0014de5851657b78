// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2024 Juan Palacios <jpalaciosdev@gmail.com>

//! Building blocks for single-threaded, non-blocking, connection
//! multiplexing services.
//!
//! - [`mux`] waits on a listening socket and its accepted connections,
//!   reporting one readable connection at a time.
//! - [`io::BufferedChannel`] stages outbound bytes without ever blocking.
//! - [`io::dispatch`] hands a connection over to an external program.

pub mod io;
pub mod mux;
