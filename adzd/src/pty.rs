//! Host-side pseudo-terminal plumbing.
//!
//! Every attach stream is the master half of a PTY pair whose slave half is
//! handed to the container runtime client as stdio. Resizing sets the window
//! size on the master and nudges the client with SIGWINCH, which it forwards
//! to the remote TTY.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};

use anyhow::Context;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::pty::{Winsize, openpty};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::io::unix::AsyncFd;

pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// The master half of a PTY pair, readable and writable from async tasks.
pub struct PtyMaster {
    fd: AsyncFd<OwnedFd>,
}

/// Open a PTY pair. Returns the master wrapper and the raw slave fd; the
/// caller hands the slave to a child process and must drop its own copies
/// after spawning, or the master never sees end-of-stream.
pub fn pair(cols: u16, rows: u16) -> anyhow::Result<(PtyMaster, OwnedFd)> {
    let winsize = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let pty = openpty(Some(&winsize), None).context("openpty failed")?;

    set_nonblocking(&pty.master)?;
    let master = PtyMaster {
        fd: AsyncFd::new(pty.master).context("register pty master with reactor")?,
    };
    Ok((master, pty.slave))
}

fn set_nonblocking(fd: &OwnedFd) -> anyhow::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).context("F_GETFL on pty master")?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).context("F_SETFL on pty master")?;
    Ok(())
}

impl PtyMaster {
    /// Read a chunk of TTY output. Returns 0 at end-of-stream. EIO after the
    /// slave side closes is the platform's way of saying the same thing, so
    /// callers should treat it as EOF as well.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            let result = guard.try_io(|inner| {
                let n = unsafe {
                    libc::read(inner.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(read) => return read,
                Err(_would_block) => continue,
            }
        }
    }

    /// Write the whole buffer to the TTY's input side.
    pub async fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let mut guard = self.fd.writable().await?;
            let result = guard.try_io(|inner| {
                let n = unsafe {
                    libc::write(inner.as_raw_fd(), buf.as_ptr().cast(), buf.len())
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match result {
                Ok(Ok(0)) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(Ok(n)) => buf = &buf[n..],
                Ok(Err(err)) => return Err(err),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    /// Set the PTY window size. The runtime client picks the change up on
    /// SIGWINCH and forwards it to the remote TTY.
    pub fn resize(&self, cols: u16, rows: u16) -> io::Result<()> {
        let winsize = libc::winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let rc = unsafe {
            libc::ioctl(self.fd.get_ref().as_raw_fd(), libc::TIOCSWINSZ, &winsize)
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Deliver SIGWINCH to the runtime client that owns the slave side.
pub fn notify_resize(pid: i32) {
    let _ = kill(Pid::from_raw(pid), Signal::SIGWINCH);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use std::time::Duration;
    use tokio::process::Command;

    #[tokio::test]
    async fn round_trips_bytes_through_a_child() {
        let (master, slave) = pair(DEFAULT_COLS, DEFAULT_ROWS).unwrap();
        let stdin = slave.try_clone().unwrap();
        let stdout = slave.try_clone().unwrap();
        let mut child = Command::new("cat")
            .stdin(Stdio::from(stdin))
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(slave))
            .spawn()
            .unwrap();

        master.write_all(b"ping\n").await.unwrap();

        let mut collected = Vec::new();
        let mut buf = [0u8; 1024];
        let deadline = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let n = master.read(&mut buf).await.unwrap();
                collected.extend_from_slice(&buf[..n]);
                if collected.windows(4).any(|w| w == b"ping".as_slice()) {
                    break;
                }
            }
        });
        deadline.await.expect("echo within deadline");

        child.kill().await.ok();
        let _ = child.wait().await;
    }

    #[tokio::test]
    async fn resize_succeeds_on_open_master() {
        let (master, _slave) = pair(DEFAULT_COLS, DEFAULT_ROWS).unwrap();
        master.resize(120, 40).unwrap();
    }
}
