// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! PTY allocation and agent-child supervision.
//!
//! The child is spawned via `forkpty`, which makes it a session leader with
//! the PTY slave as controlling terminal; its process group id therefore
//! equals its PID. All signals are delivered to the group (negative pid) so
//! that shells and their descendants are covered.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;

use anyhow::{bail, Context};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::pty::{forkpty, ForkptyResult, Winsize};
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execvp, Pid};
use tokio::io::unix::AsyncFd;

/// How the agent child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

/// What to exec on the PTY.
#[derive(Debug, Clone)]
pub struct PtyCommand {
    /// argv; must be non-empty.
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    /// Extra environment for the child, applied on top of the inherited one.
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
}

/// Newtype wrapper around `OwnedFd` for use with `AsyncFd`.
#[derive(Debug)]
pub struct PtyFd(pub OwnedFd);

impl AsRawFd for PtyFd {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.0.as_raw_fd()
    }
}

/// A PTY master plus the child process group it controls.
pub struct Pty {
    master: AsyncFd<PtyFd>,
    child_pid: Pid,
}

impl Pty {
    /// Spawn a child process on a new PTY in its own process group.
    // forkpty requires unsafe: post-fork child is partially initialized
    #[allow(unsafe_code)]
    pub fn spawn(cmd: &PtyCommand) -> anyhow::Result<Self> {
        if cmd.argv.is_empty() {
            bail!("empty command");
        }
        let winsize = Winsize {
            ws_col: cmd.cols,
            ws_row: cmd.rows,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        // SAFETY: forkpty is unsafe because the child is in a
        // partially-initialized state after fork. We only set env, chdir,
        // and exec.
        let result = unsafe { forkpty(&winsize, None) }.context("forkpty failed")?;

        match result {
            ForkptyResult::Child => {
                std::env::set_var("TERM", "xterm-256color");
                for (key, value) in &cmd.env {
                    std::env::set_var(key, value);
                }
                if std::env::set_current_dir(&cmd.cwd).is_err() {
                    // Missing cwd must not abort the exec; agents report
                    // their own working-directory errors.
                    let _ = std::env::set_current_dir("/");
                }

                let c_args: Vec<CString> = cmd
                    .argv
                    .iter()
                    .map(|s| CString::new(s.as_bytes()))
                    .collect::<Result<_, _>>()
                    .context("invalid command argument")?;

                execvp(&c_args[0], &c_args).context("execvp failed")?;
                unreachable!();
            }
            ForkptyResult::Parent { child, master } => {
                set_nonblocking(&master)?;
                let master = AsyncFd::new(PtyFd(master)).context("AsyncFd::new failed")?;
                Ok(Self { master, child_pid: child })
            }
        }
    }

    pub fn child_pid(&self) -> i32 {
        self.child_pid.as_raw()
    }

    /// Read a chunk from the master. `Ok(0)` or `EIO` means the slave side
    /// is gone and the child should be reaped.
    pub async fn read_chunk(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.master.readable().await?;
            match guard.try_io(|inner| {
                nix::unistd::read(&inner.get_ref().0, buf).map_err(io_err)
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Write all bytes to the master.
    pub async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let mut offset = 0;
        while offset < data.len() {
            let mut guard = self.master.writable().await?;
            match guard.try_io(|inner| {
                nix::unistd::write(&inner.get_ref().0, &data[offset..]).map_err(io_err)
            }) {
                Ok(Ok(n)) => offset += n,
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    // TIOCSWINSZ ioctl requires unsafe for the libc::ioctl call
    #[allow(unsafe_code)]
    pub fn resize(&self, cols: u16, rows: u16) -> anyhow::Result<()> {
        let ws = Winsize { ws_col: cols, ws_row: rows, ws_xpixel: 0, ws_ypixel: 0 };

        // SAFETY: TIOCSWINSZ is a well-defined ioctl that sets the window
        // size on the PTY master fd; the Winsize struct is fully initialized.
        let ret = unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &ws) };
        if ret < 0 {
            bail!("TIOCSWINSZ ioctl failed: {}", io::Error::last_os_error());
        }
        Ok(())
    }

    /// Deliver a signal to the child's process group.
    pub fn signal_group(&self, sig: Signal) -> anyhow::Result<()> {
        killpg(self.child_pid, sig).context("killpg failed")?;
        Ok(())
    }

    /// Reap the child on a blocking thread, returning its exit status.
    pub async fn wait_exit(&self) -> anyhow::Result<ExitStatus> {
        let pid = self.child_pid;
        tokio::task::spawn_blocking(move || wait_for_exit(pid))
            .await
            .context("join wait thread")?
    }

    /// Non-blocking check whether the child has already been reaped.
    pub fn try_wait(&self) -> Option<ExitStatus> {
        match waitpid(self.child_pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => Some(ExitStatus { code: Some(code), signal: None }),
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                Some(ExitStatus { code: None, signal: Some(sig as i32) })
            }
            _ => None,
        }
    }
}

impl Drop for Pty {
    fn drop(&mut self) {
        // Best-effort teardown if the owner never called remove().
        let _ = killpg(self.child_pid, Signal::SIGHUP);
        let _ = kill(self.child_pid, Signal::SIGKILL);
        let _ = waitpid(self.child_pid, Some(WaitPidFlag::WNOHANG));
    }
}

/// Parse a POSIX signal name ("SIGTERM", "TERM", "15") for group delivery.
pub fn parse_signal(name: &str) -> Option<Signal> {
    let upper = name.to_uppercase();
    let bare = upper.strip_prefix("SIG").unwrap_or(&upper);
    match bare {
        "HUP" | "1" => Some(Signal::SIGHUP),
        "INT" | "2" => Some(Signal::SIGINT),
        "QUIT" | "3" => Some(Signal::SIGQUIT),
        "KILL" | "9" => Some(Signal::SIGKILL),
        "USR1" | "10" => Some(Signal::SIGUSR1),
        "USR2" | "12" => Some(Signal::SIGUSR2),
        "TERM" | "15" => Some(Signal::SIGTERM),
        "CONT" | "18" => Some(Signal::SIGCONT),
        "STOP" | "19" => Some(Signal::SIGSTOP),
        "TSTP" | "20" => Some(Signal::SIGTSTP),
        "WINCH" | "28" => Some(Signal::SIGWINCH),
        _ => None,
    }
}

/// Set the given file descriptor to non-blocking mode.
pub fn set_nonblocking<Fd: std::os::fd::AsFd>(fd: &Fd) -> io::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(io_err)?;
    let flags = OFlag::from_bits_truncate(flags);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).map_err(io_err)?;
    Ok(())
}

fn io_err(e: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

/// Block until the child exits and convert to our `ExitStatus`.
fn wait_for_exit(pid: Pid) -> anyhow::Result<ExitStatus> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => {
                return Ok(ExitStatus { code: Some(code), signal: None });
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                return Ok(ExitStatus { code: None, signal: Some(sig as i32) });
            }
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(nix::errno::Errno::ECHILD) => {
                // Already reaped (e.g. by try_wait).
                return Ok(ExitStatus { code: None, signal: None });
            }
            Err(e) => bail!("waitpid failed: {e}"),
        }
    }
}

#[cfg(test)]
#[path = "pty_tests.rs"]
mod tests;
