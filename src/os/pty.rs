//! Pseudo-terminal allocation.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::pty::{openpty, Winsize};
use nix::unistd::ttyname;
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::session::WindowSize;

nix::ioctl_write_ptr_bad!(tiocswinsz, nix::libc::TIOCSWINSZ, Winsize);
nix::ioctl_read_bad!(tiocgwinsz, nix::libc::TIOCGWINSZ, Winsize);
nix::ioctl_write_int_bad!(tiocsctty, nix::libc::TIOCSCTTY);

/// An open master/slave pair.
#[derive(Debug)]
pub struct Pty {
    master: File,
    slave: File,
    tty_path: PathBuf,
}

impl Pty {
    /// Allocate a pseudo-terminal with the given initial size.
    pub fn open(size: WindowSize) -> io::Result<Self> {
        let winsize = to_winsize(size);
        let pair = openpty(&winsize, None)?;
        set_cloexec(&pair.master)?;
        set_cloexec(&pair.slave)?;
        let tty_path = ttyname(pair.slave.as_fd())?;
        Ok(Self {
            master: File::from(pair.master),
            slave: File::from(pair.slave),
            tty_path,
        })
    }

    /// Device node of the slave side, e.g. `/dev/pts/3`.
    pub fn tty_path(&self) -> &Path {
        &self.tty_path
    }

    pub fn slave(&self) -> &File {
        &self.slave
    }

    /// Close the slave side and keep the master. Must be called once the child
    /// holds its own copies, otherwise the master never sees the hangup.
    pub fn into_master(self) -> (File, PathBuf) {
        drop(self.slave);
        (self.master, self.tty_path)
    }
}

fn set_cloexec(fd: &OwnedFd) -> io::Result<()> {
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok(())
}

fn to_winsize(size: WindowSize) -> Winsize {
    Winsize {
        ws_row: size.rows,
        ws_col: size.cols,
        ws_xpixel: size.pixel_width,
        ws_ypixel: size.pixel_height,
    }
}

/// Apply a window size to a terminal (master or slave side).
pub fn set_window_size(terminal: &impl AsRawFd, size: WindowSize) -> io::Result<()> {
    let winsize = to_winsize(size);
    // SAFETY: TIOCSWINSZ reads a winsize struct that outlives the call.
    unsafe { tiocswinsz(terminal.as_raw_fd(), &winsize) }?;
    Ok(())
}

/// Current window size of a terminal.
pub fn window_size(terminal: &impl AsRawFd) -> io::Result<WindowSize> {
    let mut winsize = to_winsize(WindowSize::default());
    // SAFETY: TIOCGWINSZ writes into the winsize struct we own.
    unsafe { tiocgwinsz(terminal.as_raw_fd(), &mut winsize) }?;
    Ok(WindowSize {
        cols: winsize.ws_col,
        rows: winsize.ws_row,
        pixel_width: winsize.ws_xpixel,
        pixel_height: winsize.ws_ypixel,
    })
}

/// Make the terminal on `fd` the controlling terminal of the calling session
/// leader. Meant for a forked child between `setsid` and exec.
pub fn set_controlling_terminal(fd: RawFd) -> io::Result<()> {
    // SAFETY: TIOCSCTTY takes a plain integer argument.
    unsafe { tiocsctty(fd, 0) }?;
    Ok(())
}

/// Reading a master whose slave side is fully closed fails with EIO on Linux.
pub fn is_hangup(err: &io::Error) -> bool {
    err.raw_os_error() == Some(nix::libc::EIO)
}

/// Non-blocking master side registered with the tokio reactor. Clones share
/// the descriptor, so one task can read while another writes or resizes.
#[derive(Clone)]
pub struct PtyMaster {
    fd: Arc<AsyncFd<File>>,
}

impl PtyMaster {
    /// Must be called within a tokio runtime.
    pub fn new(master: File) -> io::Result<Self> {
        let flags = fcntl(master.as_raw_fd(), FcntlArg::F_GETFL)?;
        let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
        fcntl(master.as_raw_fd(), FcntlArg::F_SETFL(flags))?;
        Ok(Self {
            fd: Arc::new(AsyncFd::new(master)?),
        })
    }

    pub fn set_window_size(&self, size: WindowSize) -> io::Result<()> {
        set_window_size(self.fd.get_ref(), size)
    }

    pub fn window_size(&self) -> io::Result<WindowSize> {
        window_size(self.fd.get_ref())
    }
}

impl AsyncRead for PtyMaster {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.fd.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| inner.get_ref().read(unfilled)) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for PtyMaster {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.fd.poll_write_ready(cx))?;
            match guard.try_io(|inner| inner.get_ref().write(buf)) {
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
