// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2024 Juan Palacios <jpalaciosdev@gmail.com>

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use core::fmt;
use muxd::{
    io::{self, BufferedChannel, Dispatched, Fd, ReconcileError},
    mux::{self, SlotId, WatchSet},
};
use std::{
    collections::{hash_map::Entry, HashMap},
    ffi::OsString,
    fs,
    io::Write,
    mem,
    os::unix::net::UnixListener,
    path::{Path, PathBuf},
    sync::{self, atomic},
    time::Duration,
};
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

const ARG_SOCKET_NAME: &str = "socket";
const ARG_COMMAND_NAME: &str = "command";
const ARG_NOCOLOR_NAME: &str = "nocolor";

/// How long to wait for connections before checking for a stop request.
const STOP_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// How long to wait for connections while replies are waiting to be sent.
const FLUSH_INTERVAL: Duration = Duration::from_millis(10);

fn main() -> Result<()> {
    simple_logger::init_with_env().context("Couldn't setup logger")?;

    let args = cmdline_args();
    let stop = sync::Arc::new(atomic::AtomicBool::new(false));

    let stop_handle = stop.clone();
    ctrlc::set_handler(move || {
        stop_handle.store(true, atomic::Ordering::Relaxed);
    })
    .context("Couldn't set Ctrl-C handler")?;

    let socket_path = args
        .get_one::<PathBuf>(ARG_SOCKET_NAME)
        .context("Missing socket path")?;
    let command = args
        .get_many::<OsString>(ARG_COMMAND_NAME)
        .map(|values| values.cloned().collect::<Vec<_>>())
        .unwrap_or_default();

    let listener = create_listener(socket_path)?;
    log::info!("Listening on {}", socket_path.display());

    let mut stdout = StandardStream::stdout(ColorChoice::Always);
    let mut line_color = ColorSpec::new();

    let mut watch_set = WatchSet::new();
    let mut children = Vec::new();
    let mut echo = Echo::default();
    let mut closed = None;
    let result = loop {
        let timeout = if echo.has_pending() {
            FLUSH_INTERVAL
        } else {
            STOP_CHECK_INTERVAL
        };

        let ready = match mux::poll_ready_timeout(
            &listener,
            &mut watch_set,
            closed.take(),
            Some(timeout),
        ) {
            Ok(ready) => ready,
            Err(e) => break Err(e).context("Couldn't wait for connections"),
        };

        let mut events = Vec::new();
        if let Some(slot) = ready {
            let event = match command.split_first() {
                Some((program, program_args)) => {
                    handle_dispatch(slot, program, program_args, &mut watch_set, &mut children)
                }
                None => echo.handle(slot, &watch_set, &mut closed),
            };
            events.extend(event);
        }
        events.extend(echo.flush(&mut watch_set));
        events.extend(reap_children(&mut children));

        for event in events {
            if let Err(e) = print_output_line(event, &args, &mut stdout, &mut line_color) {
                log::error!("{}", e);
            }
        }

        if stop.load(atomic::Ordering::Relaxed) {
            break Ok(());
        }
    };

    if !children.is_empty() {
        log::warn!("Leaving {} dispatched processes running", children.len());
    }
    if let Err(e) = fs::remove_file(socket_path) {
        log::error!("Couldn't remove {}: {}", socket_path.display(), e);
    }

    result
}

fn create_listener(path: &Path) -> Result<UnixListener> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            return Err(e).with_context(|| format!("Couldn't remove {}", path.display()))
        }
        _ => {}
    }

    UnixListener::bind(path).with_context(|| format!("Couldn't listen on {}", path.display()))
}

fn cmdline_args() -> ArgMatches {
    Command::new(env!("CARGO_CRATE_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .about("Serves connections on a Unix socket, echoing them or handing them to a command")
        .arg(
            Arg::new(ARG_NOCOLOR_NAME)
                .long("no-color")
                .action(ArgAction::SetTrue)
                .help("Do not colorize output"),
        )
        .arg(
            Arg::new(ARG_SOCKET_NAME)
                .required(true)
                .value_parser(clap::value_parser!(PathBuf))
                .help("Path of the listening socket"),
        )
        .arg(
            Arg::new(ARG_COMMAND_NAME)
                .num_args(1..)
                .trailing_var_arg(true)
                .allow_hyphen_values(true)
                .value_parser(clap::value_parser!(OsString))
                .help("Command serving each connection through its standard input and output"),
        )
        .get_matches()
}

enum Event {
    Dispatch(u32, SlotId),
    Close(SlotId),
    Exit(u32, Result<(), ReconcileError>),
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Dispatch(pid, slot) => write!(f, "Dispatch({}) slot {}", pid, slot),
            Event::Close(slot) => write!(f, "Close({})", slot),
            Event::Exit(pid, Ok(())) => write!(f, "Exit({}) ok", pid),
            Event::Exit(pid, Err(e)) => write!(f, "Exit({}) {}", pid, e),
        }
    }
}

/// Echo mode state. Replies are staged per slot, so a client that doesn't
/// read them can't stall the other connections.
#[derive(Default)]
struct Echo {
    replies: HashMap<SlotId, BufferedChannel>,
    closing: Vec<BufferedChannel>,
}

impl Echo {
    fn has_pending(&self) -> bool {
        !self.closing.is_empty() || self.replies.values().any(|reply| reply.pending() > 0)
    }

    fn handle(
        &mut self,
        slot: SlotId,
        watch_set: &WatchSet,
        closed: &mut Option<SlotId>,
    ) -> Option<Event> {
        let connection = watch_set.connection(slot)?;
        let mut buffer = [0u8; 16 * 1024];

        let echoed = connection.read(&mut buffer).and_then(|count| {
            if count > 0 {
                self.reply(slot, connection)?.write(&buffer[..count])?;
            }
            Ok(count)
        });

        match echoed {
            Ok(0) => {
                self.finish(slot);
                *closed = Some(slot);
                Some(Event::Close(slot))
            }
            Ok(_) => None,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => None,
            Err(e) => {
                log::error!("Closing slot {} after an error: {}", slot, e);
                self.replies.remove(&slot);
                *closed = Some(slot);
                Some(Event::Close(slot))
            }
        }
    }

    fn reply(&mut self, slot: SlotId, connection: &Fd) -> std::io::Result<&mut BufferedChannel> {
        match self.replies.entry(slot) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let reply = BufferedChannel::duplex(connection.try_clone()?)?;
                Ok(entry.insert(reply))
            }
        }
    }

    /// Keeps delivering the reply of `slot` after its client stopped sending.
    fn finish(&mut self, slot: SlotId) {
        if let Some(mut reply) = self.replies.remove(&slot) {
            match reply.finish_writes() {
                Ok(()) => self.closing.push(reply),
                Err(e) => log::debug!("Dropping reply for slot {}: {}", slot, e),
            }
        }
    }

    /// Hands pending replies to the system without blocking. Slots whose
    /// reply can't be delivered are closed.
    fn flush(&mut self, watch_set: &mut WatchSet) -> Vec<Event> {
        let mut failed = Vec::new();
        for (slot, reply) in self.replies.iter_mut() {
            if let Err(e) = reply.try_flush() {
                log::error!("Closing slot {} after an error: {}", slot, e);
                failed.push(*slot);
            }
        }

        let mut events = Vec::new();
        for slot in failed {
            self.replies.remove(&slot);
            if let Err(e) = watch_set.close(slot) {
                log::error!("An error occur while closing slot {}: {}", slot, e);
            }
            events.push(Event::Close(slot));
        }

        for mut reply in mem::take(&mut self.closing) {
            match reply.try_flush() {
                Ok(()) if reply.pending() > 0 => self.closing.push(reply),
                Ok(()) => {
                    if let Err(e) = reply.close() {
                        log::debug!("An error occur while closing a reply: {}", e);
                    }
                }
                Err(e) => log::debug!("Dropping undeliverable reply: {}", e),
            }
        }

        events
    }
}

fn handle_dispatch(
    slot: SlotId,
    program: &OsString,
    args: &[OsString],
    watch_set: &mut WatchSet,
    children: &mut Vec<Dispatched>,
) -> Option<Event> {
    let connection = watch_set.release(slot)?;

    match io::dispatch(program, args, connection) {
        Ok(child) => {
            let event = Event::Dispatch(child.id(), slot);
            children.push(child);
            Some(event)
        }
        Err(error) => {
            log::error!("Couldn't dispatch slot {}: {}", slot, error);
            if let Err(e) = error.into_connection().close() {
                log::error!("An error occur while closing slot {}: {}", slot, e);
            }
            None
        }
    }
}

fn reap_children(children: &mut Vec<Dispatched>) -> Vec<Event> {
    let mut events = Vec::new();
    children.retain_mut(|child| match child.try_reconcile() {
        Some(Err(ReconcileError::Wait(e))) => {
            log::error!("Couldn't check process {}: {}", child.id(), e);
            true
        }
        Some(result) => {
            events.push(Event::Exit(child.id(), result));
            false
        }
        None => true,
    });
    events
}

fn print_output_line(
    event: Event,
    args: &ArgMatches,
    stdout: &mut StandardStream,
    line_color: &mut ColorSpec,
) -> std::io::Result<()> {
    if !args.get_flag(ARG_NOCOLOR_NAME) {
        if let Err(e) = match event {
            Event::Exit(_, Err(_)) => stdout.set_color(line_color.set_fg(Some(Color::Red))),
            Event::Exit(_, Ok(())) => stdout.set_color(line_color.set_fg(Some(Color::Green))),
            Event::Dispatch(..) | Event::Close(_) => stdout.reset(),
        } {
            log::error!("Couldn't setup output color: {}", e);
        }
    }

    writeln!(stdout, "{}", event)
}
