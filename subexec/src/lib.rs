// Copyright 2025 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
// Arc<Mutex> can be more clear than needing to grok Orderings:
#![allow(clippy::mutex_atomic)]

use std::collections::BTreeMap;
use std::io;
use std::ops::{Deref, DerefMut};
use std::os::unix::io::{FromRawFd, RawFd};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};

use errorlog::ErrorLog;
use nix::pty::openpty;
use nix::sys::signal;
use nix::unistd::{dup, getpgid, Pid};
use runtime::Failure;
use task_executor::Executor;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};

#[derive(Clone, Debug, Default)]
pub struct LaunchOptions {
    /// Capture the child's stdout over a separate pipe and return it on success. Otherwise
    /// stdout is intermingled with the captured stderr.
    pub capture_stdout: bool,
    pub stdin_bytes: Vec<u8>,
    pub cwd: Option<PathBuf>,
    /// When present, replaces the child's environment entirely.
    pub env: Option<BTreeMap<String, String>>,
}

///
/// Execute `argv` as a child process, asynchronously.
///
/// The child's stderr (and, unless captured, stdout) runs against a pseudo-terminal rather than
/// a pipe, so tools keep emitting ANSI colour into the captured output. On a zero exit status,
/// the captured stdout (or the empty string) is returned, and any stderr output is shown via
/// the error log; a non-zero exit status becomes a logged error carrying the captured output,
/// marking the run as aborting.
///
pub async fn launch(
    log: &ErrorLog,
    executor: &Executor,
    argv: Vec<String>,
    options: LaunchOptions,
) -> Result<String, Failure> {
    // Cooperative abort point: no new children once the run is coming down.
    log.raise_if_aborting()?;

    if argv.is_empty() {
        return Err(Failure::Invariant("Cannot launch an empty argv.".to_owned()));
    }
    let cmdline = argv.join(" ");
    if let Some(cwd) = &options.cwd {
        eprintln!("(in {})", cwd.display());
    }
    eprintln!("{cmdline}\n");
    log::debug!("Launching: {cmdline}");

    let pty = openpty(None, None).map_err(Failure::wrapped)?;
    let (master, slave) = (pty.master, pty.slave);

    let mut command = Command::new(&argv[0]);
    command.args(&argv[1..]);
    command.stdin(Stdio::piped());
    // Stdio takes ownership of the fds: the parent's copies are closed at spawn, leaving the
    // child as the only writer of the pty slave.
    command.stderr(unsafe { Stdio::from_raw_fd(slave) });
    if options.capture_stdout {
        command.stdout(Stdio::piped());
    } else {
        let slave_for_stdout = dup(slave).map_err(Failure::wrapped)?;
        command.stdout(unsafe { Stdio::from_raw_fd(slave_for_stdout) });
    }
    if let Some(cwd) = &options.cwd {
        command.current_dir(cwd);
    }
    if let Some(env) = &options.env {
        command.env_clear().envs(env);
    }

    let mut child = match ManagedChild::spawn(command) {
        Ok(child) => child,
        Err(e) => {
            let _ = nix::unistd::close(master);
            return Err(log.logged_error(cmdline, e));
        }
    };

    // Drain the pty master on a blocking thread: EOF (or EIO) arrives once the child has
    // exited and every slave fd is closed.
    let mut pty_reader = executor.blocking(move || read_until_closed(master));

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(&options.stdin_bytes).await;
        drop(stdin);
    }

    let stdout = child.stdout.take();
    let read_stdout = async {
        let mut buf = Vec::new();
        if let Some(mut stdout) = stdout {
            let _ = stdout.read_to_end(&mut buf).await;
        }
        buf
    };
    let (out_bytes, status) = tokio::join!(read_stdout, child.wait());
    let status = status.map_err(Failure::wrapped)?;

    let err_bytes = pty_reader.recv().await.ok_or_else(|| {
        Failure::Invariant("The output reader died without reporting.".to_owned())
    })?;
    let err = String::from_utf8_lossy(&err_bytes).into_owned();
    let out = String::from_utf8_lossy(&out_bytes).into_owned();

    if status.success() {
        if !err.is_empty() {
            log.show(&cmdline, &err);
        }
        Ok(out)
    } else {
        Err(log.logged_error(cmdline, err))
    }
}

fn read_until_closed(fd: RawFd) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0_u8; 6 * 8192];
    loop {
        match nix::unistd::read(fd, &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
        }
    }
    let _ = nix::unistd::close(fd);
    out
}

///
/// A child process running in its own PGID, with a drop implementation that will kill that
/// PGID if the child has not already been waited for.
///
pub struct ManagedChild {
    child: Child,
    reaped: AtomicBool,
}

impl ManagedChild {
    pub fn spawn(mut command: Command) -> Result<ManagedChild, String> {
        // Set `kill_on_drop` to encourage `tokio` to `wait` the process via its own "reaping"
        // mechanism:
        //   see https://docs.rs/tokio/1/tokio/process/struct.Command.html#method.kill_on_drop
        command.kill_on_drop(true);

        // Adjust the Command to create its own PGID as it starts, to make it safe to kill the
        // PGID later.
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid().map(|_sid| ()).map_err(|e| {
                    io::Error::other(format!("Could not create new pgid: {e}"))
                })
            });
        }

        let child = command
            .spawn()
            .map_err(|e| format!("Error executing process: {e}"))?;
        Ok(ManagedChild {
            child,
            reaped: AtomicBool::new(false),
        })
    }

    fn get_pgid(&self) -> Result<Pid, String> {
        let pid = self.id().ok_or_else(|| "Process had no PID.".to_owned())?;
        let pgid = getpgid(Some(Pid::from_raw(pid as i32)))
            .map_err(|e| format!("Could not get process group id of child process: {e}"))?;
        Ok(pgid)
    }

    /// Kill the process's unique PGID or return an error if we don't have a PID or cannot kill.
    pub fn kill_pgid(&mut self) -> Result<(), String> {
        let pgid = self.get_pgid()?;
        // The negative PGID signals the entire process group.
        signal::kill(Pid::from_raw(-pgid.as_raw()), signal::Signal::SIGKILL)
            .map_err(|e| format!("Failed to interrupt child process group: {e}"))?;
        self.reaped.store(true, Ordering::SeqCst);
        Ok(())
    }

    ///
    /// Wait for the child to exit, releasing the drop-time kill.
    ///
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        let status = self.child.wait().await;
        if status.is_ok() {
            self.reaped.store(true, Ordering::SeqCst);
        }
        status
    }
}

impl Deref for ManagedChild {
    type Target = Child;

    fn deref(&self) -> &Child {
        &self.child
    }
}

impl DerefMut for ManagedChild {
    fn deref_mut(&mut self) -> &mut Child {
        &mut self.child
    }
}

/// Implements drop by killing the process group.
impl Drop for ManagedChild {
    fn drop(&mut self) {
        if !self.reaped.load(Ordering::SeqCst) {
            let _ = self.kill_pgid();
        }
    }
}
