// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2024 Juan Palacios <jpalaciosdev@gmail.com>

//! Hands accepted connections over to external programs.
//!
//! A dispatched program reads requests from its standard input and writes
//! responses to its standard output, both bound to the connection, much like
//! services started by `inetd`.

use std::{
    error,
    ffi::OsStr,
    fmt, io,
    os::{
        fd::{AsRawFd, OwnedFd, RawFd},
        unix::process::ExitStatusExt,
    },
    process::{Child, Command, ExitStatus, Stdio},
};

use super::fd::Fd;

/// A running program bound to a connection.
///
/// The program owns the connection. The handle must be reconciled once the
/// program terminates.
#[derive(Debug)]
pub struct Dispatched {
    child: Child,
    connection: RawFd,
    reconciled: bool,
}

/// A program couldn't be started for a connection.
///
/// The connection wasn't transferred and still belongs to the caller.
#[derive(Debug)]
pub struct DispatchError {
    error: io::Error,
    connection: Fd,
}

/// A dispatched program couldn't be reconciled or didn't succeed.
#[derive(Debug)]
pub enum ReconcileError {
    /// Waiting for the program failed.
    Wait(io::Error),
    /// The program exited with a non-zero code.
    Exited(i32),
    /// The program was terminated by a signal.
    Signaled(i32),
}

/// Starts `command` with `args`, binding its standard input and output to
/// `connection`.
///
/// `command` is searched in the `PATH` directories when it doesn't contain a
/// slash. `args` don't include the program name. On success the connection
/// is owned by the new process and the caller's descriptor is closed.
///
/// # Errors
///
/// If the process can't be created, an error holding the untouched
/// `connection` will be returned. No process is left running in that case.
pub fn dispatch<I, S>(
    command: impl AsRef<OsStr>,
    args: I,
    connection: Fd,
) -> Result<Dispatched, DispatchError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let command = command.as_ref();

    // The command only lives inside the closure, so the duplicated
    // descriptors are closed in this process once it's spawned.
    let spawned = connection.try_clone().and_then(|input| {
        let output = connection.try_clone()?;
        Command::new(command)
            .args(args)
            .stdin(Stdio::from(OwnedFd::from(input)))
            .stdout(Stdio::from(OwnedFd::from(output)))
            .spawn()
    });

    match spawned {
        Ok(child) => {
            let fd = connection.as_raw_fd();
            log::debug!(
                "Dispatched descriptor {} to {:?} (pid {})",
                fd,
                command,
                child.id()
            );

            if let Err(e) = connection.close() {
                log::error!("An error occur while closing dispatched descriptor {}: {}", fd, e);
            }

            Ok(Dispatched {
                child,
                connection: fd,
                reconciled: false,
            })
        }
        Err(error) => Err(DispatchError { error, connection }),
    }
}

impl Dispatched {
    /// Process ID of the program.
    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Number of the descriptor transferred to the program. It's no longer
    /// open in this process.
    pub fn connection(&self) -> RawFd {
        self.connection
    }

    /// Waits for the program to terminate.
    ///
    /// # Errors
    ///
    /// An error variant will be returned if waiting fails or the program
    /// didn't exit with a zero status.
    pub fn reconcile(mut self) -> Result<(), ReconcileError> {
        let status = self.child.wait().map_err(ReconcileError::Wait);
        self.reconciled = true;

        log::debug!("Reconciled process {}: {:?}", self.child.id(), status);
        status.and_then(exit_result)
    }

    /// Checks whether the program has terminated, without blocking.
    ///
    /// Returns `None` while the program is running, otherwise the same
    /// result [`Dispatched::reconcile`] would return.
    pub fn try_reconcile(&mut self) -> Option<Result<(), ReconcileError>> {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.reconciled = true;
                Some(exit_result(status))
            }
            Ok(None) => None,
            Err(e) => Some(Err(ReconcileError::Wait(e))),
        }
    }
}

impl Drop for Dispatched {
    fn drop(&mut self) {
        if !self.reconciled {
            log::warn!("Process {} was never reconciled", self.child.id());
        }
    }
}

fn exit_result(status: ExitStatus) -> Result<(), ReconcileError> {
    if status.success() {
        return Ok(());
    }

    match (status.code(), status.signal()) {
        (Some(code), _) => Err(ReconcileError::Exited(code)),
        (None, Some(signal)) => Err(ReconcileError::Signaled(signal)),
        (None, None) => Err(ReconcileError::Wait(io::Error::new(
            io::ErrorKind::Other,
            format!("Unexpected process status: {}", status),
        ))),
    }
}

impl DispatchError {
    /// Kind of the underlying I/O error.
    pub fn kind(&self) -> io::ErrorKind {
        self.error.kind()
    }

    /// Gives back the connection that couldn't be dispatched.
    pub fn into_connection(self) -> Fd {
        self.connection
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Couldn't start process: {}", self.error)
    }
}

impl error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        Some(&self.error)
    }
}

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileError::Wait(e) => write!(f, "Couldn't wait for process: {}", e),
            ReconcileError::Exited(code) => write!(f, "Process exited with code {}", code),
            ReconcileError::Signaled(signal) => {
                write!(f, "Process terminated by signal {}", signal)
            }
        }
    }
}

impl error::Error for ReconcileError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            ReconcileError::Wait(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        os::unix::net::UnixStream,
        thread,
        time::Duration,
    };

    use super::*;

    const NO_ARGS: [&str; 0] = [];

    #[test]
    fn dispatched_sed_filters_the_connection() {
        let (local, mut remote) = UnixStream::pair().unwrap();
        let sed = dispatch("sed", ["-u", "-e", "s,x,y,g"], local.into()).unwrap();
        assert!(sed.id() > 0);

        let mut buffer = [0u8; 6];
        remote.write_all(b"hello\n").unwrap();
        remote.read_exact(&mut buffer).unwrap();
        assert_eq!(b"hello\n", &buffer);

        let mut buffer = [0u8; 5];
        remote.write_all(b"xyzx\n").unwrap();
        remote.read_exact(&mut buffer).unwrap();
        assert_eq!(b"yyzy\n", &buffer);

        drop(remote);
        sed.reconcile().unwrap();
    }

    #[test]
    fn failed_dispatch_gives_the_connection_back() {
        let (local, mut remote) = UnixStream::pair().unwrap();

        let error = dispatch("muxd-missing-program", NO_ARGS, local.into()).unwrap_err();
        assert_eq!(io::ErrorKind::NotFound, error.kind());

        let connection = error.into_connection();
        assert_eq!(2, connection.write(b"ok").unwrap());

        let mut buffer = [0u8; 2];
        remote.read_exact(&mut buffer).unwrap();
        assert_eq!(b"ok", &buffer);
    }

    #[test]
    fn connection_is_closed_once_the_program_is_reconciled() {
        let (local, mut remote) = UnixStream::pair().unwrap();
        dispatch("true", NO_ARGS, local.into())
            .unwrap()
            .reconcile()
            .unwrap();

        let mut buffer = [0u8; 1];
        assert_eq!(0, remote.read(&mut buffer).unwrap());
    }

    #[test]
    fn non_zero_exit_is_a_reconcile_error() {
        let (local, _remote) = UnixStream::pair().unwrap();
        let result = dispatch("false", NO_ARGS, local.into()).unwrap().reconcile();
        assert!(matches!(result, Err(ReconcileError::Exited(1))));
    }

    #[test]
    fn termination_by_signal_is_a_reconcile_error() {
        let (local, _remote) = UnixStream::pair().unwrap();
        let result = dispatch("sh", ["-c", "kill -9 $$"], local.into())
            .unwrap()
            .reconcile();
        assert!(matches!(result, Err(ReconcileError::Signaled(libc::SIGKILL))));
    }

    #[test]
    fn try_reconcile_reports_nothing_while_the_program_runs() {
        let (local, remote) = UnixStream::pair().unwrap();
        let mut cat = dispatch("cat", NO_ARGS, local.into()).unwrap();
        assert!(cat.try_reconcile().is_none());

        drop(remote);
        let result = loop {
            if let Some(result) = cat.try_reconcile() {
                break result;
            }
            thread::sleep(Duration::from_millis(10));
        };
        assert!(result.is_ok());
    }

    #[test]
    fn reconcile_errors_are_displayed() {
        assert_eq!(
            "Process exited with code 3",
            ReconcileError::Exited(3).to_string()
        );
        assert_eq!(
            "Process terminated by signal 15",
            ReconcileError::Signaled(15).to_string()
        );
    }
}
