//! Local terminal: raw mode, alternate screen, and async stdin

use std::io::{self, Write};
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};

use crossterm::{
    cursor::Show,
    execute,
    style::ResetColor,
    terminal::{self, Clear, ClearType, EnterAlternateScreen, LeaveAlternateScreen},
};
use tokio::io::unix::AsyncFd;
use tracing::debug;

use crate::core::pty;

/// Raw mode plus alternate screen, undone on drop
pub struct RawTerminal {
    active: bool,
}

impl RawTerminal {
    pub fn enter() -> io::Result<Self> {
        terminal::enable_raw_mode()?;

        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen, Clear(ClearType::All))?;
        stdout.flush()?;
        Ok(Self { active: true })
    }

    /// Restore the terminal now rather than at drop time.
    pub fn leave(&mut self) -> io::Result<()> {
        if !self.active {
            return Ok(());
        }
        self.active = false;
        restore()
    }
}

impl Drop for RawTerminal {
    fn drop(&mut self) {
        let _ = self.leave();
    }
}

/// Put the terminal back into cooked mode on the main screen.
///
/// Safe to call more than once; the panic hook uses it too.
pub fn restore() -> io::Result<()> {
    let mut stdout = io::stdout();
    write!(stdout, "\x1b[?2026l\x1b[?1l\x1b[0m")?;
    execute!(stdout, ResetColor, Show, LeaveAlternateScreen)?;
    stdout.flush()?;
    terminal::disable_raw_mode()
}

/// Terminal size as (width, height), 80x24 when it cannot be read
pub fn size() -> (u16, u16) {
    terminal::size().unwrap_or((80, 24))
}

/// Non-blocking reader over a duplicate of fd 0
pub struct StdinReader {
    fd: AsyncFd<OwnedFd>,
    /// File status flags to put back on drop
    flags: libc::c_int,
}

impl StdinReader {
    pub fn new() -> io::Result<Self> {
        // SAFETY: fcntl on fd 0; a successful F_DUPFD_CLOEXEC returns a fresh descriptor.
        let fd = unsafe { libc::fcntl(libc::STDIN_FILENO, libc::F_DUPFD_CLOEXEC, 0) };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        // SAFETY: fd is valid.
        let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
        if flags == -1 {
            return Err(io::Error::last_os_error());
        }
        pty::set_nonblocking(fd.as_raw_fd())?;

        Ok(Self {
            fd: AsyncFd::new(fd)?,
            flags,
        })
    }

    /// Read the next chunk; `Ok(0)` at end of input.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| pty::read(inner.get_ref().as_fd(), buf)) {
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

impl Drop for StdinReader {
    fn drop(&mut self) {
        debug!("Restoring stdin flags");
        // SAFETY: fd is still open; flags came from the same file description.
        unsafe {
            libc::fcntl(self.fd.get_ref().as_raw_fd(), libc::F_SETFL, self.flags);
        }
    }
}
