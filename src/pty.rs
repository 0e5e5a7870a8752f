//! Pseudo-terminal process host
//!
//! Owns one pty pair and the shell spawned on its slave side. The master is
//! non-blocking and driven through tokio's `AsyncFd`; the slave becomes the
//! child's stdin/stdout/stderr and controlling terminal.

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::process::ExitStatus;

use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::libc;
use nix::pty::{openpty, OpenptyResult, Winsize};
use tokio::io::unix::AsyncFd;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Terminal columns before the client sends a pty-req.
pub const DEFAULT_COLS: u32 = 80;

/// Terminal rows before the client sends a pty-req.
pub const DEFAULT_ROWS: u32 = 24;

const MAX_DIMENSION: u32 = u16::MAX as u32;

const DEFAULT_TERM: &str = "xterm-256color";

/// A shell attached to a pseudo-terminal
pub struct PtyProcess {
    master: AsyncFd<OwnedFd>,
    child: Mutex<Child>,
    pid: Option<u32>,
}

impl PtyProcess {
    /// Allocate a pty and spawn `program` on it.
    ///
    /// The caller owns teardown of whatever channel it was opening when this
    /// fails.
    pub fn spawn(program: &str, args: &[String], cols: u32, rows: u32) -> Result<Self> {
        let OpenptyResult { master, slave } =
            openpty(&winsize(cols, rows), None).map_err(|e| Error::Pty(format!("openpty: {e}")))?;

        // The child must not inherit the master, or closing it here would never hang up the shell
        fcntl(master.as_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
            .map_err(|e| Error::Pty(format!("F_SETFD: {e}")))?;
        set_nonblocking(master.as_fd())?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env("TERM", DEFAULT_TERM)
            .stdin(slave.try_clone()?)
            .stdout(slave.try_clone()?)
            .stderr(slave.try_clone()?)
            .kill_on_drop(true);

        // SAFETY: only async-signal-safe calls between fork and exec
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid().map_err(io::Error::from)?;
                // stdin is the slave by now
                if libc::ioctl(0, libc::TIOCSCTTY, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd
            .spawn()
            .map_err(|e| Error::Pty(format!("failed to spawn {program}: {e}")))?;
        drop(slave);

        let pid = child.id();
        info!(program, ?pid, "shell spawned on pty");

        Ok(Self {
            master: AsyncFd::new(master)?,
            child: Mutex::new(child),
            pid,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Read shell output. Returns 0 once the slave side is gone.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.master.readable().await?;

            match guard.try_io(|inner| {
                // SAFETY: fd is owned by `inner` and buf is a valid slice
                let n = unsafe {
                    libc::read(inner.get_ref().as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                // Linux reports a hung-up slave as EIO rather than EOF
                Ok(Err(e)) if e.raw_os_error() == Some(libc::EIO) => return Ok(0),
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.master.writable().await?;

            match guard.try_io(|inner| {
                // SAFETY: fd is owned by `inner` and buf is a valid slice
                let n = unsafe {
                    libc::write(inner.get_ref().as_raw_fd(), buf.as_ptr().cast(), buf.len())
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    pub async fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf).await?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Set the terminal size. Values above `u16::MAX` are clamped.
    pub fn resize(&self, cols: u32, rows: u32) -> io::Result<()> {
        let ws = winsize(cols, rows);
        // SAFETY: valid fd and a valid winsize
        let rc = unsafe { libc::ioctl(self.master.get_ref().as_raw_fd(), libc::TIOCSWINSZ, &ws) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        debug!(cols = ws.ws_col, rows = ws.ws_row, "pty resized");
        Ok(())
    }

    /// Current terminal size as `(cols, rows)`
    pub fn size(&self) -> io::Result<(u16, u16)> {
        let mut ws = winsize(0, 0);
        // SAFETY: valid fd and a writable winsize
        let rc =
            unsafe { libc::ioctl(self.master.get_ref().as_raw_fd(), libc::TIOCGWINSZ, &mut ws) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((ws.ws_col, ws.ws_row))
    }

    /// Reap the shell, killing it first if it is still running.
    ///
    /// Exit anomalies are logged here and never propagated.
    pub async fn shutdown(&self) -> Option<ExitStatus> {
        let mut child = self.child.lock().await;

        let killed = match child.try_wait() {
            Ok(Some(_)) => false,
            Ok(None) => {
                if let Err(e) = child.start_kill() {
                    warn!(pid = ?self.pid, error = %e, "failed to kill shell");
                }
                true
            }
            Err(e) => {
                warn!(pid = ?self.pid, error = %e, "failed to poll shell");
                false
            }
        };

        match child.wait().await {
            Ok(status) if status.success() => {
                debug!(pid = ?self.pid, "shell exited");
                Some(status)
            }
            Ok(status) if killed => {
                debug!(pid = ?self.pid, %status, "shell killed");
                Some(status)
            }
            Ok(status) => {
                warn!(pid = ?self.pid, %status, "shell exited abnormally");
                Some(status)
            }
            Err(e) => {
                warn!(pid = ?self.pid, error = %e, "failed to wait for shell");
                None
            }
        }
    }
}

impl std::fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyProcess")
            .field("fd", &self.master.get_ref().as_raw_fd())
            .field("pid", &self.pid)
            .finish()
    }
}

fn winsize(cols: u32, rows: u32) -> Winsize {
    Winsize {
        ws_row: rows.min(MAX_DIMENSION) as u16,
        ws_col: cols.min(MAX_DIMENSION) as u16,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

fn set_nonblocking(fd: BorrowedFd<'_>) -> Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(|e| Error::Pty(format!("F_GETFL: {e}")))?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(|e| Error::Pty(format!("F_SETFL: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh() -> PtyProcess {
        PtyProcess::spawn("/bin/sh", &[], DEFAULT_COLS, DEFAULT_ROWS).expect("spawn /bin/sh")
    }

    async fn read_until(pty: &PtyProcess, needle: &str) -> String {
        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        let read = async {
            loop {
                let n = pty.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                out.extend_from_slice(&buf[..n]);
                if String::from_utf8_lossy(&out).contains(needle) {
                    break;
                }
            }
        };
        let _ = tokio::time::timeout(Duration::from_secs(5), read).await;
        String::from_utf8_lossy(&out).into_owned()
    }

    #[test]
    fn test_winsize_clamping() {
        let ws = winsize(100_000, 24);
        assert_eq!(ws.ws_col, u16::MAX);
        assert_eq!(ws.ws_row, 24);
    }

    #[tokio::test]
    async fn test_spawn_initial_size() {
        let pty = sh();
        assert_eq!(pty.size().unwrap(), (80, 24));
        assert!(pty.pid().is_some());
        pty.shutdown().await;
    }

    #[tokio::test]
    async fn test_resize_idempotent() {
        let pty = sh();
        pty.resize(132, 50).unwrap();
        let once = pty.size().unwrap();
        pty.resize(132, 50).unwrap();
        assert_eq!(pty.size().unwrap(), once);
        assert_eq!(once, (132, 50));
        pty.shutdown().await;
    }

    #[tokio::test]
    async fn test_shell_echo() {
        let pty = sh();
        pty.write_all(b"echo pty-$((40+2))\n").await.unwrap();
        let out = read_until(&pty, "pty-42").await;
        assert!(out.contains("pty-42"), "output: {out:?}");
        pty.shutdown().await;
    }

    #[tokio::test]
    async fn test_stty_sees_resize() {
        let pty = sh();
        pty.resize(100, 30).unwrap();
        pty.write_all(b"stty size\n").await.unwrap();
        let out = read_until(&pty, "30 100").await;
        assert!(out.contains("30 100"), "output: {out:?}");
        pty.shutdown().await;
    }

    #[tokio::test]
    async fn test_shell_exit_reads_eof() {
        let pty = sh();
        pty.write_all(b"exit 0\n").await.unwrap();
        let mut buf = [0u8; 256];
        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while pty.read(&mut buf).await.unwrap() > 0 {}
        })
        .await;
        assert!(drained.is_ok(), "pty never reported EOF");
        let status = pty.shutdown().await.expect("exit status");
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_shutdown_kills_running_shell() {
        let pty = sh();
        let status = pty.shutdown().await.expect("exit status");
        assert!(!status.success());
    }

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let result = PtyProcess::spawn("/nonexistent/shell", &[], DEFAULT_COLS, DEFAULT_ROWS);
        assert!(matches!(result, Err(Error::Pty(_))));
    }
}
