//! Unix pseudo-terminal pairs and child process bootstrap
//!
//! A `Pty` is opened with its window size already set on the slave side; no
//! process runs until a `Spawner` forks one onto it. Everything the child needs
//! (argv, envp, fd limit) is prepared before `fork` so the child only makes
//! async-signal-safe calls.

use std::ffi::{CString, OsStr};
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

/// Process id of a pane's child
pub type Pid = libc::pid_t;

/// Highest descriptor the child bothers closing
const MAX_CLOSE_FD: libc::rlim_t = 65_536;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Failed to open pseudo terminal: {0}")]
    Open(#[source] io::Error),

    #[error("Failed to configure pseudo terminal: {0}")]
    Configure(#[source] io::Error),

    #[error("Failed to resize pseudo terminal: {0}")]
    Resize(#[source] io::Error),

    #[error("Failed to fork: {0}")]
    Fork(#[source] io::Error),

    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Invalid argument for exec: {0:?}")]
    InvalidArgument(String),

    #[error("Process already started")]
    AlreadySpawned,
}

pub type Result<T> = std::result::Result<T, PtyError>;

/// What to run inside a pane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Parse a shell-style command line (whitespace separated, no quoting)
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut words = line.split_whitespace();
        let program = words.next()?;
        Some(Self {
            program: program.to_string(),
            args: words.map(str::to_string).collect(),
            env: Vec::new(),
        })
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Master side of a pty pair (plus the slave until a child owns it)
pub struct Pty {
    master: OwnedFd,
    slave: Option<OwnedFd>,
}

impl Pty {
    /// Allocate a pty pair with the given window size.
    pub fn open(rows: u16, cols: u16) -> Result<Self> {
        let mut master: RawFd = -1;
        let mut slave: RawFd = -1;
        let mut size = winsize(rows, cols);

        // SAFETY: out-pointers are valid; name and termios may be null.
        let rc = unsafe {
            libc::openpty(
                &mut master,
                &mut slave,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                &mut size,
            )
        };
        if rc != 0 {
            return Err(PtyError::Open(io::Error::last_os_error()));
        }

        // SAFETY: openpty succeeded, both descriptors are fresh and ours.
        let (master, slave) = unsafe { (OwnedFd::from_raw_fd(master), OwnedFd::from_raw_fd(slave)) };

        set_cloexec(master.as_raw_fd()).map_err(PtyError::Configure)?;
        set_cloexec(slave.as_raw_fd()).map_err(PtyError::Configure)?;
        set_nonblocking(master.as_raw_fd()).map_err(PtyError::Configure)?;

        Ok(Self {
            master,
            slave: Some(slave),
        })
    }

    /// Duplicate the master descriptor for an I/O task.
    pub fn clone_master(&self) -> Result<OwnedFd> {
        self.master.try_clone().map_err(PtyError::Configure)
    }

    /// Push a new window size; the child receives SIGWINCH.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        let size = winsize(rows, cols);
        // SAFETY: TIOCSWINSZ reads a winsize from a valid pointer.
        let rc = unsafe { libc::ioctl(self.master.as_raw_fd(), libc::TIOCSWINSZ, &size) };
        if rc == -1 {
            return Err(PtyError::Resize(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Build everything the child needs to run `command` on the slave side.
    ///
    /// The returned `Spawner` owns the slave; the fork itself happens in
    /// `Spawner::fork`, which may run on another thread.
    pub fn prepare_spawn(&mut self, command: &CommandSpec) -> Result<Spawner> {
        if self.slave.is_none() {
            return Err(PtyError::AlreadySpawned);
        }

        let program = resolve_program(&command.program)
            .ok_or_else(|| PtyError::CommandNotFound(command.program.clone()))?;
        let program = cstring(program.as_os_str())?;

        let mut argv = vec![cstring(OsStr::new(&command.program))?];
        for arg in &command.args {
            argv.push(cstring(OsStr::new(arg))?);
        }
        let envp = build_env(&command.env)?;

        let slave = self.slave.take().ok_or(PtyError::AlreadySpawned)?;
        Ok(Spawner {
            slave,
            program,
            argv,
            envp,
            max_fd: fd_limit(),
            label: command.program.clone(),
        })
    }
}

/// A prepared child process, ready to fork.
///
/// `fork` blocks for as long as the kernel takes to copy the parent, so the
/// session runs it on the blocking pool.
pub struct Spawner {
    slave: OwnedFd,
    program: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    max_fd: libc::c_int,
    label: String,
}

impl Spawner {
    /// Fork and exec.
    ///
    /// The child becomes a session leader with the slave as its controlling
    /// terminal and stdio, with every other descriptor closed. The parent
    /// drops its slave handle so reads on the master end with EIO once the
    /// child is gone.
    pub fn fork(self) -> Result<Pid> {
        let mut argv: Vec<*const libc::c_char> = self.argv.iter().map(|s| s.as_ptr()).collect();
        argv.push(std::ptr::null());
        let mut envp: Vec<*const libc::c_char> = self.envp.iter().map(|s| s.as_ptr()).collect();
        envp.push(std::ptr::null());

        let slave_fd = self.slave.as_raw_fd();

        // SAFETY: the child only calls async-signal-safe functions below.
        let pid = unsafe { libc::fork() };
        match pid {
            -1 => Err(PtyError::Fork(io::Error::last_os_error())),
            // The master is close-on-exec and falls in the child's close sweep.
            0 => unsafe { exec_child(slave_fd, self.max_fd, self.program.as_ptr(), &argv, &envp) },
            pid => {
                debug!("Forked pid {} for {}", pid, self.label);
                Ok(pid)
            }
        }
    }
}

/// Child half of `Spawner::fork`; never returns.
///
/// # Safety
///
/// Must only be called in a freshly forked child.
unsafe fn exec_child(
    slave: RawFd,
    max_fd: libc::c_int,
    program: *const libc::c_char,
    argv: &[*const libc::c_char],
    envp: &[*const libc::c_char],
) -> ! {
    libc::setsid();
    libc::ioctl(slave, libc::TIOCSCTTY as _, 0);

    libc::dup2(slave, 0);
    libc::dup2(slave, 1);
    libc::dup2(slave, 2);

    for fd in 3..max_fd {
        libc::close(fd);
    }

    // Dispositions the runtime changed would otherwise leak into the child.
    let mut mask: libc::sigset_t = std::mem::zeroed();
    libc::sigemptyset(&mut mask);
    libc::sigprocmask(libc::SIG_SETMASK, &mask, std::ptr::null_mut());
    libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    libc::signal(libc::SIGINT, libc::SIG_DFL);
    libc::signal(libc::SIGQUIT, libc::SIG_DFL);

    libc::execve(program, argv.as_ptr(), envp.as_ptr());
    libc::_exit(127)
}

/// Block until `pid` exits and return its raw wait status.
///
/// Must run on a blocking worker, never on the event loop.
pub fn wait_for_exit(pid: Pid) -> io::Result<i32> {
    let mut status: libc::c_int = 0;
    loop {
        // SAFETY: status is a valid out-pointer.
        let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
        if rc == pid {
            return Ok(status);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Read from a non-blocking master; `WouldBlock` is passed through.
pub fn read(fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: the buffer is valid for buf.len() bytes.
    let n = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Write to a non-blocking master; `WouldBlock` is passed through.
pub fn write(fd: BorrowedFd<'_>, data: &[u8]) -> io::Result<usize> {
    // SAFETY: the buffer is valid for data.len() bytes.
    let n = unsafe { libc::write(fd.as_raw_fd(), data.as_ptr().cast(), data.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Send a signal to a child; errors (e.g. already reaped) are ignored by callers.
pub fn signal(pid: Pid, signal: libc::c_int) -> io::Result<()> {
    // SAFETY: plain syscall.
    if unsafe { libc::kill(pid, signal) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn winsize(rows: u16, cols: u16) -> libc::winsize {
    libc::winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we own.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags == -1 || libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Put a descriptor into non-blocking mode
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a valid descriptor.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags == -1 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn fd_limit() -> libc::c_int {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: limit is a valid out-pointer.
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    let max = if rc == 0 { limit.rlim_cur } else { 1024 };
    max.min(MAX_CLOSE_FD) as libc::c_int
}

fn cstring(s: &OsStr) -> Result<CString> {
    CString::new(s.as_bytes()).map_err(|_| PtyError::InvalidArgument(s.to_string_lossy().into_owned()))
}

fn build_env(extra: &[(String, String)]) -> Result<Vec<CString>> {
    let mut vars: Vec<(std::ffi::OsString, std::ffi::OsString)> = std::env::vars_os()
        .filter(|(k, _)| !extra.iter().any(|(key, _)| OsStr::new(key) == k.as_os_str()))
        .collect();
    vars.extend(extra.iter().map(|(k, v)| (k.into(), v.into())));

    vars.iter()
        .map(|(k, v)| {
            let mut entry = k.as_bytes().to_vec();
            entry.push(b'=');
            entry.extend_from_slice(v.as_bytes());
            CString::new(entry).map_err(|_| PtyError::InvalidArgument(k.to_string_lossy().into_owned()))
        })
        .collect()
}

/// Look a program up on PATH the way execvp would.
fn resolve_program(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        return Some(PathBuf::from(program));
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_parsing() {
        let spec = CommandSpec::from_command_line("  /bin/sh -c  true ").unwrap();
        assert_eq!(spec.program, "/bin/sh");
        assert_eq!(spec.args, vec!["-c", "true"]);
        assert!(CommandSpec::from_command_line("   ").is_none());
    }

    #[test]
    fn test_resolve_program() {
        assert_eq!(resolve_program("/bin/sh"), Some(PathBuf::from("/bin/sh")));
        assert!(resolve_program("sh").is_some());
        assert!(resolve_program("definitely-not-a-real-program-xyz").is_none());
    }

    #[test]
    fn test_env_override() {
        let env = build_env(&[("TILEMUX_TEST_VAR".into(), "7".into())]).unwrap();
        let hits: Vec<_> = env
            .iter()
            .filter(|e| e.as_bytes().starts_with(b"TILEMUX_TEST_VAR="))
            .collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].as_bytes(), b"TILEMUX_TEST_VAR=7");
    }

    #[test]
    fn test_spawn_and_wait() {
        let mut pty = Pty::open(24, 80).unwrap();
        let spec = CommandSpec::from_command_line("/bin/sh -c exit").unwrap();
        let spawner = pty.prepare_spawn(&spec).unwrap();
        assert!(matches!(pty.prepare_spawn(&spec), Err(PtyError::AlreadySpawned)));

        // Fork from a worker thread, the way the session does.
        let pid = std::thread::spawn(move || spawner.fork()).join().unwrap().unwrap();
        let status = wait_for_exit(pid).unwrap();
        assert!(libc::WIFEXITED(status));
    }

    #[test]
    fn test_missing_command() {
        let mut pty = Pty::open(24, 80).unwrap();
        let spec = CommandSpec::new("definitely-not-a-real-program-xyz");
        assert!(matches!(pty.prepare_spawn(&spec), Err(PtyError::CommandNotFound(_))));
        // The slave stays with the pty for another attempt.
        assert!(pty.prepare_spawn(&CommandSpec::new("/bin/sh")).is_ok());
    }

    #[test]
    fn test_master_read_write() {
        use std::os::fd::AsFd;

        let pty = Pty::open(24, 80).unwrap();
        let master = pty.clone_master().unwrap();
        let mut buf = [0u8; 64];
        // Nothing written yet, so a non-blocking read would block.
        let err = read(master.as_fd(), &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert_eq!(write(master.as_fd(), b"x").unwrap(), 1);
    }

    #[test]
    fn test_resize() {
        let pty = Pty::open(10, 20).unwrap();
        pty.resize(30, 100).unwrap();
    }
}
