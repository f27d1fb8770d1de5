//! Session - windows, attached renderers, and the repaint loop
//!
//! The session lives in an `Rc<RefCell<_>>` on a single-threaded runtime.
//! Nothing holds a borrow across an `.await`: repaints compose every client's
//! bytes under a short borrow and only then await the backends.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::os::fd::{AsFd, OwnedFd};
use std::rc::Rc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::io::unix::AsyncFd;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::invalidate::{Redraw, RepaintScheduler};
use super::layout::{Direction, Location, Orientation};
use super::pane::{PaneId, PaneIo};
use super::window::{Window, WindowError, WindowId};
use crate::config::Config;
use crate::core::pty::{self, CommandSpec, Pid, Spawner};
use crate::core::term::{PaneDiff, Snapshot};
use crate::ui::input::{Command, CommandTarget};
use crate::ui::renderer::{Composer, RenderView, RendererBackend, RendererId};
use crate::ui::statusbar::{StatusBar, WindowLabel};

/// Size used while no client is attached
pub const DEFAULT_SIZE: (u16, u16) = (80, 40);

/// Smallest layout area, before the status bar row is taken
pub const MIN_SIZE: (u16, u16) = (10, 3);

const STATUS_BAR_HEIGHT: u16 = 1;

const READ_BUFFER_SIZE: usize = 16 * 1024;

pub type SessionHandle = Rc<RefCell<Session>>;

/// Pane lifecycle notifications consumed by `SessionDriver::run`
pub enum SessionEvent {
    PaneStarting { pane: PaneId, spawner: Spawner, io: PaneIo },
    PaneExited { pane: PaneId },
}

struct RendererEntry {
    id: RendererId,
    backend: Rc<dyn RendererBackend>,
    composer: Composer,
}

/// Output of one renderer for the current repaint
struct RenderJob {
    id: RendererId,
    backend: Rc<dyn RendererBackend>,
    output: Vec<u8>,
}

/// The multiplexer state shared by every client
pub struct Session {
    shell: CommandSpec,
    status_bar: StatusBar,
    windows: Vec<Window>,
    active_window: Option<WindowId>,
    renderers: Vec<RendererEntry>,
    next_renderer_id: RendererId,
    /// Panes whose process has not been reaped yet
    runners: HashSet<PaneId>,
    scheduler: RepaintScheduler,
    repaint: Rc<Notify>,
    /// Last rendered grid per pane
    snapshots: HashMap<PaneId, Snapshot>,
    events: mpsc::UnboundedSender<SessionEvent>,
    size: (u16, u16),
}

impl Session {
    /// Create an empty session and the driver that runs it.
    pub fn new(config: &Config) -> (SessionHandle, SessionDriver) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let repaint = Rc::new(Notify::new());

        let session = Rc::new(RefCell::new(Self {
            shell: config.shell_command(),
            status_bar: StatusBar::new(config.status_bar.clone()),
            windows: Vec::new(),
            active_window: None,
            renderers: Vec::new(),
            next_renderer_id: 1,
            runners: HashSet::new(),
            scheduler: RepaintScheduler::default(),
            repaint: repaint.clone(),
            snapshots: HashMap::new(),
            events: events_tx.clone(),
            size: DEFAULT_SIZE,
        }));

        let driver = SessionDriver {
            session: session.clone(),
            events: events_rx,
            events_tx,
            repaint,
            tasks: HashMap::new(),
        };
        (session, driver)
    }

    /// Mark parts of the screen dirty and wake the repaint loop once.
    pub fn invalidate(&mut self, parts: Redraw) {
        if self.scheduler.invalidate(parts) {
            debug!("Scheduling repaint: {:?}", self.scheduler.pending());
            self.repaint.notify_one();
        }
    }

    /// Session size as (width, height), status bar included
    pub fn size(&self) -> (u16, u16) {
        self.size
    }

    /// Size the layout to the smallest attached client.
    pub fn update_size(&mut self) {
        let sizes: Vec<(u16, u16)> = self.renderers.iter().map(|r| r.backend.get_size()).collect();
        let (width, height) = if sizes.is_empty() {
            DEFAULT_SIZE
        } else {
            (
                sizes.iter().map(|s| s.0).min().unwrap_or(DEFAULT_SIZE.0),
                sizes.iter().map(|s| s.1).min().unwrap_or(DEFAULT_SIZE.1),
            )
        };
        let width = width.max(MIN_SIZE.0);
        let height = height.max(MIN_SIZE.1);
        self.size = (width, height);

        let area = self.layout_area();
        for window in &mut self.windows {
            if let Err(e) = window.set_location(area) {
                error!("Failed to resize window {}: {}", window.id, e);
            }
        }
        debug!("Session size {}x{}", width, height);
        self.invalidate(Redraw::ALL);
    }

    fn layout_area(&self) -> Location {
        Location::new(0, 0, self.size.0, self.size.1 - STATUS_BAR_HEIGHT)
    }

    pub fn add_renderer(&mut self, backend: Rc<dyn RendererBackend>) -> RendererId {
        let id = self.next_renderer_id;
        self.next_renderer_id += 1;
        self.renderers.push(RendererEntry {
            id,
            backend,
            composer: Composer::new(),
        });
        info!("Renderer {} attached", id);
        self.update_size();
        id
    }

    pub fn remove_renderer(&mut self, id: RendererId) {
        let before = self.renderers.len();
        self.renderers.retain(|r| r.id != id);
        if self.renderers.len() != before {
            info!("Renderer {} detached", id);
            self.update_size();
        }
    }

    pub fn renderer_count(&self) -> usize {
        self.renderers.len()
    }

    pub fn windows(&self) -> &[Window] {
        &self.windows
    }

    pub fn active_window(&self) -> Option<&Window> {
        let id = self.active_window?;
        self.windows.iter().find(|w| w.id == id)
    }

    fn active_window_mut(&mut self) -> Option<&mut Window> {
        let id = self.active_window?;
        self.windows.iter_mut().find(|w| w.id == id)
    }

    /// No pane process is left running
    pub fn is_finished(&self) -> bool {
        self.runners.is_empty()
    }

    /// Open a window with one pane running the configured shell.
    pub fn create_new_window(&mut self) -> Result<WindowId, WindowError> {
        let mut window = Window::new(self.layout_area());
        let (pane, _) = window.create_new_pane(self.shell.clone(), Orientation::Horizontal)?;
        let id = window.id;

        self.windows.push(window);
        self.active_window = Some(id);
        info!("Created window {}", id);
        self.start_pane(id, pane);
        self.invalidate(Redraw::ALL);
        Ok(id)
    }

    /// Split the active pane; `vertical` places the new pane to the right.
    pub fn split_pane(&mut self, vertical: bool) -> Result<(), WindowError> {
        let orientation = if vertical {
            Orientation::Horizontal
        } else {
            Orientation::Vertical
        };
        let shell = self.shell.clone();
        let Some(window) = self.active_window_mut() else {
            return Ok(());
        };
        let window_id = window.id;
        let (pane, redraw) = window.create_new_pane(shell, orientation)?;

        self.start_pane(window_id, pane);
        self.invalidate(redraw);
        Ok(())
    }

    /// Prepare the pane's process and hand it to the driver, which forks it
    /// on the blocking pool.
    ///
    /// A spawn failure is reported as an immediate exit.
    fn start_pane(&mut self, window: WindowId, pane_id: PaneId) {
        let Some(pane) = self
            .windows
            .iter_mut()
            .find(|w| w.id == window)
            .and_then(|w| w.pane_mut(pane_id))
        else {
            return;
        };

        let prepared = match pane.take_io() {
            Ok(Some(io)) => pane.prepare_start().map(|spawner| (spawner, io)),
            Ok(None) => {
                warn!("Pane {} was already started", pane_id);
                return;
            }
            Err(e) => Err(e),
        };

        let event = match prepared {
            Ok((spawner, io)) => SessionEvent::PaneStarting { pane: pane_id, spawner, io },
            Err(e) => {
                error!("Failed to start pane {}: {}", pane_id, e);
                SessionEvent::PaneExited { pane: pane_id }
            }
        };
        self.runners.insert(pane_id);
        if self.events.send(event).is_err() {
            warn!("Session driver is gone; pane {} not tracked", pane_id);
        }
    }

    /// Record the pid of a pane whose process was forked.
    pub fn pane_forked(&mut self, pane_id: PaneId, pid: Pid) {
        let pane = self.windows.iter_mut().find_map(|w| w.pane_mut(pane_id));
        match pane {
            Some(pane) => {
                info!("Pane {} running pid {}", pane_id, pid);
                pane.set_process_id(pid);
            }
            None => debug!("Pane {} is gone before pid {} was recorded", pane_id, pid),
        }
    }

    /// Tear down a pane whose process ended.
    pub fn pane_exited(&mut self, pane_id: PaneId) {
        self.runners.remove(&pane_id);
        self.snapshots.remove(&pane_id);

        let Some(index) = self.windows.iter().position(|w| w.contains_pane(pane_id)) else {
            return;
        };
        let window = &mut self.windows[index];
        info!("Pane {} exited (window {})", pane_id, window.id);

        if window.pane_count() > 1 && window.active_pane_id() == Some(pane_id) {
            window.focus_next();
        }
        if let Err(e) = window.remove_pane(pane_id) {
            error!("Failed to remove pane {}: {}", pane_id, e);
        }

        if window.is_empty() {
            let window_id = window.id;
            self.windows.remove(index);
            info!("Window {} closed", window_id);
            if self.active_window == Some(window_id) {
                self.active_window = self.windows.first().map(|w| w.id);
            }
        }
        self.invalidate(Redraw::ALL);
    }

    pub fn focus_next_window(&mut self) {
        if self.windows.is_empty() {
            return;
        }
        let index = self
            .active_window
            .and_then(|id| self.windows.iter().position(|w| w.id == id))
            .map(|i| i + 1)
            .unwrap_or(0);
        self.active_window = Some(self.windows[index % self.windows.len()].id);
        self.invalidate(Redraw::ALL);
    }

    /// Hang up the active pane's process; teardown follows its exit.
    pub fn kill_current_pane(&mut self) {
        if let Some(pane) = self.active_window().and_then(Window::active_pane) {
            info!("Killing pane {}", pane.id);
            pane.kill_process();
        }
    }

    pub fn resize_current_tile(&mut self, direction: Direction, amount: u16) {
        let Some(window) = self.active_window_mut() else {
            return;
        };
        match window.resize_active_tile(direction, amount) {
            Ok(redraw) => self.invalidate(redraw),
            Err(e) => error!("Failed to resize tile: {}", e),
        }
    }

    pub fn move_focus(&mut self, direction: Direction) {
        let redraw = self
            .active_window_mut()
            .map(|w| w.move_focus(direction))
            .unwrap_or_default();
        self.invalidate(redraw);
    }

    pub fn focus_next_pane(&mut self) {
        let redraw = self
            .active_window_mut()
            .map(Window::focus_next)
            .unwrap_or_default();
        self.invalidate(redraw);
    }

    pub fn send_input_to_current_pane(&mut self, data: &[u8]) {
        if let Some(pane) = self.active_window().and_then(Window::active_pane) {
            pane.write_input(data);
        }
    }

    pub fn redraw(&mut self) {
        self.invalidate(Redraw::ALL);
    }

    /// Run the child's output through the pane's emulator.
    pub fn feed_pane(&mut self, pane_id: PaneId, data: &[u8]) {
        let active = self.active_window;
        let Some(window) = self.windows.iter_mut().find(|w| w.contains_pane(pane_id)) else {
            return;
        };
        let visible = Some(window.id) == active;
        if let Some(pane) = window.pane_mut(pane_id) {
            pane.feed(data);
        }
        if visible {
            self.invalidate(Redraw::PANES | Redraw::CURSOR);
        }
    }

    /// Human-readable listing for `GetSessions`
    pub fn sessions_text(&self) -> String {
        let mut text = format!(
            "0: {} windows ({} clients) [{}x{}]\n",
            self.windows.len(),
            self.renderers.len(),
            self.size.0,
            self.size.1
        );
        for (index, window) in self.windows.iter().enumerate() {
            let loc = window.location();
            text.push_str(&format!(
                "  {}: {} [{}x{}] {} panes{}\n",
                index + 1,
                window.name(),
                loc.width,
                loc.height,
                window.pane_count(),
                if Some(window.id) == self.active_window { " (active)" } else { "" }
            ));
        }
        text
    }

    /// JSON description of every window and pane for `GetSessionInfo`
    pub fn session_info(&self) -> Value {
        let mut windows = Map::new();
        for window in &self.windows {
            let mut panes = Map::new();
            for pane in window.panes() {
                let loc = pane.location();
                panes.insert(
                    pane.id.to_string(),
                    json!({
                        "x": loc.x,
                        "y": loc.y,
                        "sx": loc.width,
                        "sy": loc.height,
                        "process_id": pane.process_id(),
                        "active": window.active_pane_id() == Some(pane.id),
                    }),
                );
            }
            windows.insert(
                window.id.to_string(),
                json!({
                    "active": Some(window.id) == self.active_window,
                    "panes": panes,
                }),
            );
        }
        json!({ "windows": windows })
    }

    fn window_labels(&self) -> Vec<WindowLabel> {
        self.windows
            .iter()
            .enumerate()
            .map(|(index, w)| WindowLabel {
                index: index + 1,
                name: w.name(),
                active: Some(w.id) == self.active_window,
            })
            .collect()
    }

    /// Compose every renderer's output and advance the snapshots.
    ///
    /// Returns `None` when no repaint was scheduled.
    fn prepare_repaint(&mut self) -> Option<Vec<RenderJob>> {
        let parts = self.scheduler.begin()?;
        if self.renderers.is_empty() {
            return Some(Vec::new());
        }

        let mut diffs: HashMap<PaneId, PaneDiff> = HashMap::new();
        if parts.contains(Redraw::PANES) {
            if let Some(window) = self.active_window() {
                for pane in window.panes() {
                    let previous = if parts.contains(Redraw::CLEAR_FIRST) {
                        None
                    } else {
                        self.snapshots.get(&pane.id)
                    };
                    diffs.insert(pane.id, pane.dump_diff(previous));
                }
            }
        }

        let status_left = self.status_bar.left_text(&self.window_labels());
        let status_right = self.status_bar.right_text();
        let active = self.active_window.and_then(|id| self.windows.iter().find(|w| w.id == id));
        let view = RenderView {
            window: active,
            diffs: &diffs,
            status_left: &status_left,
            status_right: &status_right,
        };

        let mut jobs = Vec::with_capacity(self.renderers.len());
        for entry in &mut self.renderers {
            let size = entry.backend.get_size();
            match entry.composer.compose(&view, parts, size) {
                Ok(output) => jobs.push(RenderJob {
                    id: entry.id,
                    backend: entry.backend.clone(),
                    output,
                }),
                Err(e) => error!("Failed to compose output for renderer {}: {}", entry.id, e),
            }
        }

        for (pane, diff) in diffs {
            self.snapshots.insert(pane, diff.snapshot);
        }
        Some(jobs)
    }

    /// Drop renderers whose write failed and reschedule if needed.
    fn finish_repaint(&mut self, failed: &[RendererId]) {
        if !failed.is_empty() {
            self.renderers.retain(|r| !failed.contains(&r.id));
            self.update_size();
        }
        if self.scheduler.finish() {
            self.repaint.notify_one();
        }
    }
}

impl CommandTarget for Session {
    fn send_to_active_pane(&mut self, data: &[u8]) {
        self.send_input_to_current_pane(data);
    }

    fn run(&mut self, command: Command) {
        let result = match command {
            Command::NewWindow => self.create_new_window().map(|_| ()),
            Command::SplitStacked => self.split_pane(false),
            Command::SplitSideBySide => self.split_pane(true),
            Command::NextWindow => {
                self.focus_next_window();
                Ok(())
            }
            Command::KillPane => {
                self.kill_current_pane();
                Ok(())
            }
            Command::Resize(direction, amount) => {
                self.resize_current_tile(direction, amount);
                Ok(())
            }
            Command::Focus(direction) => {
                self.move_focus(direction);
                Ok(())
            }
            Command::FocusNextPane => {
                self.focus_next_pane();
                Ok(())
            }
            Command::Redraw => {
                self.redraw();
                Ok(())
            }
            Command::Detach => {
                debug!("Detach has no meaning for this client");
                Ok(())
            }
        };
        if let Err(e) = result {
            error!("{:?} failed: {}", command, e);
        }
    }
}

/// Runs the session: pane I/O, process reaping, repaints and the clock.
pub struct SessionDriver {
    session: SessionHandle,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    repaint: Rc<Notify>,
    tasks: HashMap<PaneId, Vec<JoinHandle<()>>>,
}

impl SessionDriver {
    /// Drive the session until the last pane process has exited.
    ///
    /// Must run inside a `LocalSet`.
    pub async fn run(mut self) {
        let mut clock = tokio::time::interval(Duration::from_secs(1));
        clock.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.session.borrow().is_finished() {
            tokio::select! {
                Some(event) = self.events.recv() => self.handle_event(event),
                _ = self.repaint.notified() => self.repaint().await,
                _ = clock.tick() => self.session.borrow_mut().invalidate(Redraw::STATUS_BAR),
            }
        }

        for (_, handles) in self.tasks.drain() {
            handles.iter().for_each(JoinHandle::abort);
        }
        // Flush the final state (e.g. the last window closing) to clients.
        self.repaint().await;
        info!("Session finished");
    }

    fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::PaneStarting { pane, spawner, io } => self.spawn_pane_tasks(pane, spawner, io),
            SessionEvent::PaneExited { pane } => {
                if let Some(handles) = self.tasks.remove(&pane) {
                    handles.iter().for_each(JoinHandle::abort);
                }
                self.session.borrow_mut().pane_exited(pane);
            }
        }
    }

    fn spawn_pane_tasks(&mut self, pane: PaneId, spawner: Spawner, io: PaneIo) {
        let events = self.events_tx.clone();
        let process = tokio::task::spawn_local(run_pane_process(self.session.clone(), events, pane, spawner));

        let fd = match AsyncFd::new(io.master) {
            Ok(fd) => Rc::new(fd),
            Err(e) => {
                error!("Failed to register pane {} with the reactor: {}", pane, e);
                self.tasks.insert(pane, vec![process]);
                return;
            }
        };
        let reader = tokio::task::spawn_local(pump_output(self.session.clone(), pane, fd.clone()));
        let writer = tokio::task::spawn_local(pump_input(pane, fd, io.input));
        self.tasks.insert(pane, vec![process, reader, writer]);
    }

    async fn repaint(&mut self) {
        let Some(jobs) = self.session.borrow_mut().prepare_repaint() else {
            return;
        };

        let mut failed = Vec::new();
        for job in jobs {
            if let Err(e) = job.backend.write_output(job.output).await {
                warn!("Renderer {} write failed, removing it: {}", job.id, e);
                failed.push(job.id);
            }
        }

        self.session.borrow_mut().finish_repaint(&failed);
    }
}

/// Fork the pane's process and reap it, both on the blocking pool, then
/// report the exit.
async fn run_pane_process(
    session: SessionHandle,
    events: mpsc::UnboundedSender<SessionEvent>,
    pane: PaneId,
    spawner: Spawner,
) {
    match tokio::task::spawn_blocking(move || spawner.fork()).await {
        Ok(Ok(pid)) => {
            session.borrow_mut().pane_forked(pane, pid);
            match tokio::task::spawn_blocking(move || pty::wait_for_exit(pid)).await {
                Ok(Ok(status)) => debug!("Pane {} pid {} exited with status {:#x}", pane, pid, status),
                Ok(Err(e)) => warn!("waitpid({}) failed: {}", pid, e),
                Err(e) => warn!("Waiter for pid {} failed: {}", pid, e),
            }
        }
        Ok(Err(e)) => error!("Failed to start pane {}: {}", pane, e),
        Err(e) => error!("Fork task for pane {} failed: {}", pane, e),
    }
    let _ = events.send(SessionEvent::PaneExited { pane });
}

/// Feed the pty master's output into the pane until EOF or EIO.
async fn pump_output(session: SessionHandle, pane: PaneId, fd: Rc<AsyncFd<OwnedFd>>) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let mut guard = match fd.readable().await {
            Ok(guard) => guard,
            Err(e) => {
                warn!("Pane {} poll failed: {}", pane, e);
                return;
            }
        };
        match guard.try_io(|inner| pty::read(inner.get_ref().as_fd(), &mut buf)) {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => session.borrow_mut().feed_pane(pane, &buf[..n]),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Ok(Err(e)) => {
                // EIO once the child side is closed.
                debug!("Pane {} output closed: {}", pane, e);
                break;
            }
            Err(_would_block) => {}
        }
    }
}

/// Write queued keystrokes to the pty master.
async fn pump_input(pane: PaneId, fd: Rc<AsyncFd<OwnedFd>>, mut input: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(data) = input.recv().await {
        let mut written = 0;
        while written < data.len() {
            let mut guard = match fd.writable().await {
                Ok(guard) => guard,
                Err(e) => {
                    warn!("Pane {} poll failed: {}", pane, e);
                    return;
                }
            };
            match guard.try_io(|inner| pty::write(inner.get_ref().as_fd(), &data[written..])) {
                Ok(Ok(n)) => written += n,
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Ok(Err(e)) => {
                    debug!("Pane {} input closed: {}", pane, e);
                    return;
                }
                Err(_would_block) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ui::renderer::PipeBackend;
    use tokio::io::AsyncReadExt;

    fn config(shell: &str) -> Config {
        Config {
            shell: Some(shell.to_string()),
            ..Config::default()
        }
    }

    /// Renderer that records every write
    struct Recording {
        size: (u16, u16),
        writes: RefCell<Vec<Vec<u8>>>,
    }

    impl Recording {
        fn new(size: (u16, u16)) -> Rc<Self> {
            Rc::new(Self {
                size,
                writes: RefCell::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait(?Send)]
    impl RendererBackend for Recording {
        fn get_size(&self) -> (u16, u16) {
            self.size
        }

        async fn write_output(&self, data: Vec<u8>) -> std::io::Result<()> {
            self.writes.borrow_mut().push(data);
            Ok(())
        }
    }

    /// Renderer whose connection is gone
    struct Broken;

    #[async_trait::async_trait(?Send)]
    impl RendererBackend for Broken {
        fn get_size(&self) -> (u16, u16) {
            (20, 5)
        }

        async fn write_output(&self, _data: Vec<u8>) -> std::io::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"))
        }
    }

    #[tokio::test]
    async fn test_failed_write_removes_only_that_renderer() {
        let (session, mut driver) = Session::new(&config("/bin/sh"));
        let healthy = Recording::new((60, 20));
        session.borrow_mut().add_renderer(healthy.clone());
        session.borrow_mut().add_renderer(Rc::new(Broken));
        session.borrow_mut().create_new_window().unwrap();
        assert_eq!(session.borrow().size(), (20, 5));

        driver.repaint().await;
        assert_eq!(session.borrow().renderer_count(), 1);
        assert_eq!(healthy.writes.borrow().len(), 1);
        // The layout grows back to the remaining client.
        assert_eq!(session.borrow().size(), (60, 20));

        // Removing the renderer rescheduled a full repaint.
        driver.repaint().await;
        assert_eq!(healthy.writes.borrow().len(), 2);
        assert!(String::from_utf8_lossy(&healthy.writes.borrow()[1]).contains("\x1b[2J"));
    }

    /// Run one scheduled repaint the way the driver does
    async fn repaint_once(session: &SessionHandle) -> usize {
        let Some(jobs) = session.borrow_mut().prepare_repaint() else {
            return 0;
        };
        let n = jobs.len();
        for job in jobs {
            job.backend.write_output(job.output).await.unwrap();
        }
        session.borrow_mut().finish_repaint(&[]);
        n
    }

    #[test]
    fn test_update_size_takes_minimum() {
        let (session, _driver) = Session::new(&config("/bin/sh"));
        let mut s = session.borrow_mut();
        assert_eq!(s.size(), DEFAULT_SIZE);

        s.add_renderer(Recording::new((100, 40)));
        s.add_renderer(Recording::new((80, 24)));
        assert_eq!(s.size(), (80, 24));
        assert_eq!(s.layout_area(), Location::new(0, 0, 80, 23));
    }

    #[test]
    fn test_update_size_clamps() {
        let (session, _driver) = Session::new(&config("/bin/sh"));
        let mut s = session.borrow_mut();
        let id = s.add_renderer(Recording::new((4, 1)));
        assert_eq!(s.size(), MIN_SIZE);
        s.remove_renderer(id);
        assert_eq!(s.size(), DEFAULT_SIZE);
    }

    #[test]
    fn test_split_sizes() {
        let (session, _driver) = Session::new(&config("/bin/sh"));
        let mut s = session.borrow_mut();
        s.add_renderer(Recording::new((80, 24)));
        s.create_new_window().unwrap();
        s.split_pane(true).unwrap();

        let widths: Vec<u16> = s.active_window().unwrap().panes().map(|p| p.location().width).collect();
        assert_eq!(widths, vec![40, 39]);
    }

    #[tokio::test]
    async fn test_invalidations_coalesce_into_one_repaint() {
        let (session, _driver) = Session::new(&config("/bin/sh"));
        let renderer = Recording::new((80, 24));
        session.borrow_mut().add_renderer(renderer.clone());
        repaint_once(&session).await;
        renderer.writes.borrow_mut().clear();

        session.borrow_mut().invalidate(Redraw::CURSOR);
        session.borrow_mut().invalidate(Redraw::BORDERS);
        assert_eq!(repaint_once(&session).await, 1);
        assert_eq!(repaint_once(&session).await, 0);
        assert_eq!(renderer.writes.borrow().len(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_while_running_repaints_once_more() {
        let (session, _driver) = Session::new(&config("/bin/sh"));
        session.borrow_mut().add_renderer(Recording::new((80, 24)));

        let jobs = session.borrow_mut().prepare_repaint().unwrap();
        session.borrow_mut().invalidate(Redraw::PANES);
        session.borrow_mut().invalidate(Redraw::CURSOR);
        for job in jobs {
            job.backend.write_output(job.output).await.unwrap();
        }
        session.borrow_mut().finish_repaint(&[]);

        assert_eq!(session.borrow().scheduler.pending(), Redraw::PANES | Redraw::CURSOR);
        assert_eq!(repaint_once(&session).await, 1);
        assert_eq!(repaint_once(&session).await, 0);
    }

    #[tokio::test]
    async fn test_attach_forces_full_repaint_and_second_diff_is_empty() {
        let (session, _driver) = Session::new(&config("/bin/sh"));
        let first = Recording::new((30, 10));
        session.borrow_mut().add_renderer(first.clone());
        session.borrow_mut().create_new_window().unwrap();
        let pane = session.borrow().active_window().unwrap().active_pane_id().unwrap();
        session.borrow_mut().feed_pane(pane, b"hello");
        repaint_once(&session).await;
        assert!(String::from_utf8_lossy(&first.writes.borrow()[0]).contains("hello"));

        // A second client of the same size still gets everything.
        let second = Recording::new((30, 10));
        session.borrow_mut().add_renderer(second.clone());
        repaint_once(&session).await;
        let attached = String::from_utf8(second.writes.borrow()[0].clone()).unwrap();
        assert!(attached.contains("\x1b[2J"));
        assert!(attached.contains("hello"));

        session.borrow_mut().invalidate(Redraw::PANES);
        repaint_once(&session).await;
        let idle = String::from_utf8(second.writes.borrow()[1].clone()).unwrap();
        assert!(!idle.contains("hello"));
        assert!(!idle.contains("\x1b[2J"));
    }

    #[test]
    fn test_pane_exit_removes_window() {
        let (session, _driver) = Session::new(&config("/bin/sh"));
        let mut s = session.borrow_mut();
        let first = s.create_new_window().unwrap();
        let second = s.create_new_window().unwrap();
        assert_eq!(s.active_window().map(|w| w.id), Some(second));

        let pane = s.active_window().unwrap().active_pane_id().unwrap();
        s.pane_exited(pane);
        assert_eq!(s.windows().len(), 1);
        assert_eq!(s.active_window().map(|w| w.id), Some(first));

        let pane = s.active_window().unwrap().active_pane_id().unwrap();
        s.pane_exited(pane);
        assert!(s.windows().is_empty());
        assert!(s.active_window().is_none());
        assert!(s.is_finished());
    }

    #[test]
    fn test_exit_of_active_pane_focuses_sibling() {
        let (session, _driver) = Session::new(&config("/bin/sh"));
        let mut s = session.borrow_mut();
        s.create_new_window().unwrap();
        let first = s.active_window().unwrap().active_pane_id().unwrap();
        s.split_pane(false).unwrap();
        let second = s.active_window().unwrap().active_pane_id().unwrap();

        s.pane_exited(second);
        let window = s.active_window().unwrap();
        assert_eq!(window.active_pane_id(), Some(first));
        assert_eq!(window.pane(first).unwrap().location().height, 39);
    }

    #[test]
    fn test_session_info_shape() {
        let (session, _driver) = Session::new(&config("/bin/sh"));
        let mut s = session.borrow_mut();
        let window = s.create_new_window().unwrap();
        let pane = s.active_window().unwrap().active_pane_id().unwrap();

        let info = s.session_info();
        let entry = &info["windows"][window.to_string()];
        assert_eq!(entry["active"], true);
        let pane_info = &entry["panes"][pane.to_string()];
        assert_eq!(pane_info["sx"], 80);
        assert_eq!(pane_info["sy"], 39);
        assert_eq!(pane_info["active"], true);
        // Forked by the driver, which is not running here.
        assert!(pane_info["process_id"].is_null());

        assert!(s.sessions_text().starts_with("0: 1 windows"));
    }

    #[tokio::test]
    async fn test_run_returns_after_last_pane_exits() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (session, driver) = Session::new(&config("/bin/sh -c exit"));
                let (client, mut server) = tokio::io::duplex(1 << 16);
                session
                    .borrow_mut()
                    .add_renderer(Rc::new(PipeBackend::new(client, (40, 12))));
                session.borrow_mut().create_new_window().unwrap();

                // Drain the renderer so writes never stall.
                tokio::task::spawn_local(async move {
                    let mut buf = [0u8; 4096];
                    while matches!(server.read(&mut buf).await, Ok(n) if n > 0) {}
                });

                tokio::time::timeout(Duration::from_secs(10), driver.run())
                    .await
                    .expect("session did not finish");

                let s = session.borrow();
                assert!(s.windows().is_empty());
                assert!(s.active_window().is_none());
            })
            .await;
    }

    #[tokio::test]
    async fn test_spawn_failure_tears_pane_down() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (session, driver) = Session::new(&config("definitely-not-a-real-program-xyz"));
                session.borrow_mut().create_new_window().unwrap();
                tokio::time::timeout(Duration::from_secs(5), driver.run())
                    .await
                    .expect("session did not finish");
                assert!(session.borrow().windows().is_empty());
            })
            .await;
    }

    #[tokio::test]
    async fn test_driver_forks_and_reaps() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let (session, driver) = Session::new(&config("/bin/cat"));
                session.borrow_mut().create_new_window().unwrap();
                let driver = tokio::task::spawn_local(driver.run());

                let pid = tokio::time::timeout(Duration::from_secs(5), async {
                    loop {
                        let pid = session
                            .borrow()
                            .active_window()
                            .and_then(Window::active_pane)
                            .and_then(|p| p.process_id());
                        if let Some(pid) = pid {
                            return pid;
                        }
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                })
                .await
                .expect("pane never forked");
                let info = session.borrow().session_info();
                assert_eq!(info.to_string().matches(&format!("\"process_id\":{}", pid)).count(), 1);

                session.borrow().active_window().unwrap().active_pane().unwrap().kill_process();
                tokio::time::timeout(Duration::from_secs(10), driver)
                    .await
                    .expect("session did not finish")
                    .unwrap();

                // The driver waited on the child, so nothing is left to reap.
                // SAFETY: plain syscall on our own child pid.
                let rc = unsafe { libc::waitpid(pid, std::ptr::null_mut(), libc::WNOHANG) };
                assert_eq!(rc, -1);
            })
            .await;
    }
}
