//! Pane - one child process on a pty, plus its emulated screen

use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::layout::{CellPosition, Location};
use crate::core::pty::{self, CommandSpec, Pid, Pty, PtyError, Spawner};
use crate::core::term::{PaneDiff, Screen, Snapshot};

/// Unique identifier for a pane
pub type PaneId = u64;

/// Environment variable naming the pane a child runs in
pub const PANE_ENV_VAR: &str = "TILEMUX_PANE";

static NEXT_PANE_ID: AtomicU64 = AtomicU64::new(1);

/// Descriptors handed to the session's per-pane I/O tasks
pub struct PaneIo {
    /// Duplicate of the pty master
    pub master: OwnedFd,
    /// Keystrokes queued by `write_input`
    pub input: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// A single pane containing a terminal session
pub struct Pane {
    /// Unique identifier
    pub id: PaneId,
    /// Command run in the pane
    pub command: CommandSpec,
    /// Geometry, set only by the window's layout tree
    location: Location,
    pty: Pty,
    screen: Screen,
    pid: Option<Pid>,
    input_tx: mpsc::UnboundedSender<Vec<u8>>,
    input_rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl Pane {
    /// Allocate the pty and screen; no process runs yet.
    pub fn new(command: CommandSpec, rows: u16, cols: u16) -> Result<Self, PtyError> {
        let rows = rows.max(1);
        let cols = cols.max(1);
        let id = NEXT_PANE_ID.fetch_add(1, Ordering::Relaxed);
        let (input_tx, input_rx) = mpsc::unbounded_channel();

        Ok(Self {
            id,
            command,
            location: Location::new(0, 0, cols, rows),
            pty: Pty::open(rows, cols)?,
            screen: Screen::new(rows, cols),
            pid: None,
            input_tx,
            input_rx: Some(input_rx),
        })
    }

    /// Prepare the child process; the caller forks it with `Spawner::fork`.
    pub fn prepare_start(&mut self) -> Result<Spawner, PtyError> {
        let command = self
            .command
            .clone()
            .env(PANE_ENV_VAR, self.id.to_string());
        self.pty.prepare_spawn(&command)
    }

    /// Record the forked child
    pub fn set_process_id(&mut self, pid: Pid) {
        self.pid = Some(pid);
    }

    /// Hand out the master descriptor and input queue (once).
    pub fn take_io(&mut self) -> Result<Option<PaneIo>, PtyError> {
        let Some(input) = self.input_rx.take() else {
            return Ok(None);
        };
        Ok(Some(PaneIo {
            master: self.pty.clone_master()?,
            input,
        }))
    }

    pub fn process_id(&self) -> Option<Pid> {
        self.pid
    }

    /// Queue keystrokes for the child's stdin
    pub fn write_input(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if self.input_tx.send(data.to_vec()).is_err() {
            debug!("Pane {} input closed, dropping {} bytes", self.id, data.len());
        }
    }

    /// Best-effort hangup of the child; exit is observed by the waiter.
    pub fn kill_process(&self) {
        if let Some(pid) = self.pid {
            if let Err(e) = pty::signal(pid, libc::SIGHUP) {
                warn!("Failed to signal pid {} of pane {}: {}", pid, self.id, e);
            }
        }
    }

    /// Feed child output into the screen; emulator replies go back as input.
    pub fn feed(&mut self, data: &[u8]) {
        self.screen.feed(data);
        let replies = self.screen.take_responses();
        self.write_input(&replies);
    }

    pub fn location(&self) -> Location {
        self.location
    }

    /// Apply a rectangle from the layout tree. Returns whether it changed.
    pub fn set_location(&mut self, location: Location) -> bool {
        if location == self.location {
            return false;
        }
        self.location = location;

        let rows = location.height.max(1);
        let cols = location.width.max(1);
        self.screen.resize(rows, cols);
        if let Err(e) = self.pty.resize(rows, cols) {
            warn!("Pane {}: {}", self.id, e);
        }
        true
    }

    /// Cursor as (row, col) within the pane
    pub fn cursor_position(&self) -> (u16, u16) {
        self.screen.cursor_position()
    }

    pub fn cursor_hidden(&self) -> bool {
        self.screen.cursor_hidden()
    }

    pub fn application_cursor_keys(&self) -> bool {
        self.screen.application_cursor_keys()
    }

    pub fn title(&self) -> &str {
        self.screen.title()
    }

    pub fn is_inside(&self, x: i32, y: i32) -> bool {
        self.location.contains(x, y)
    }

    pub fn cell_position(&self, x: i32, y: i32) -> CellPosition {
        self.location.cell_position(x, y)
    }

    pub fn dump_diff(&self, previous: Option<&Snapshot>) -> PaneDiff {
        self.screen.dump_diff(previous)
    }

    /// Display name: the child's title, or its program name
    pub fn display_title(&self) -> String {
        let title = self.screen.title();
        if !title.is_empty() {
            return title.to_string();
        }
        std::path::Path::new(&self.command.program)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.command.program.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pane() -> Pane {
        Pane::new(CommandSpec::new("/bin/sh"), 24, 80).unwrap()
    }

    #[test]
    fn test_ids_increase() {
        let a = pane();
        let b = pane();
        assert!(b.id > a.id);
    }

    #[test]
    fn test_set_location_resizes_screen() {
        let mut p = pane();
        assert!(p.set_location(Location::new(5, 2, 30, 10)));
        assert!(!p.set_location(Location::new(5, 2, 30, 10)));
        assert_eq!(p.screen.size(), (10, 30));
        assert!(p.is_inside(5, 2));
        assert!(p.is_inside(34, 11));
        assert!(!p.is_inside(35, 11));
        assert!(!p.is_inside(4, 2));
    }

    #[test]
    fn test_feed_queues_replies() {
        let mut p = pane();
        let mut io = p.take_io().unwrap().unwrap();
        assert!(p.take_io().unwrap().is_none());

        p.feed(b"hi\x1b[6n");
        assert_eq!(p.cursor_position(), (0, 2));
        assert_eq!(io.input.try_recv().unwrap(), b"\x1b[1;3R".to_vec());
    }

    #[test]
    fn test_display_title() {
        let mut p = pane();
        assert_eq!(p.display_title(), "sh");
        p.feed(b"\x1b]0;build\x07");
        assert_eq!(p.display_title(), "build");
    }

    #[test]
    fn test_start_is_prepared_once() {
        let mut p = pane();
        assert!(p.prepare_start().is_ok());
        assert!(matches!(p.prepare_start(), Err(PtyError::AlreadySpawned)));
        assert_eq!(p.process_id(), None);
        p.set_process_id(4242);
        assert_eq!(p.process_id(), Some(4242));
    }
}
