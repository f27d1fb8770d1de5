//! Session server
//!
//! Every accepted connection gets a writer task draining its outbox and a
//! reader loop answering the client's calls against the shared session.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, UnixListener, UnixStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::protocol::{self, Command, FrameDecoder, Message, Outbound, ProtocolError, OUTBOX_CAPACITY};
use super::{Endpoint, Stream};
use crate::ui::input::{self, CommandTarget, InputDispatcher, Variant};
use crate::ui::renderer::{NetworkBackend, RendererId};
use crate::wm::session::{SessionDriver, SessionHandle, DEFAULT_SIZE};

pub type ConnectionId = u64;

/// Time given to connections to flush `DetachClient` at shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

const READ_BUFFER_SIZE: usize = 8192;

type Registry = Rc<RefCell<HashMap<ConnectionId, mpsc::Sender<Outbound>>>>;

enum Listener {
    Unix { listener: UnixListener, path: PathBuf },
    Tcp(TcpListener),
}

impl Listener {
    async fn bind(endpoint: &Endpoint) -> anyhow::Result<Self> {
        match endpoint {
            Endpoint::Unix(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("failed to create {}", parent.display()))?;
                }
                if path.exists() {
                    std::fs::remove_file(path)
                        .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
                }
                let listener = UnixListener::bind(path)
                    .with_context(|| format!("failed to bind {}", path.display()))?;
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
                Ok(Listener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
            Endpoint::Tcp(addr) => {
                let listener = TcpListener::bind(addr.as_str())
                    .await
                    .with_context(|| format!("failed to bind {}", addr))?;
                Ok(Listener::Tcp(listener))
            }
        }
    }

    async fn accept(&self) -> io::Result<Box<dyn Stream>> {
        match self {
            Listener::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                validate_peer(&stream)?;
                Ok(Box::new(stream))
            }
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                debug!("TCP connection from {}", addr);
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
        }
    }

    fn socket_path(&self) -> Option<&Path> {
        match self {
            Listener::Unix { path, .. } => Some(path),
            Listener::Tcp(_) => None,
        }
    }
}

/// Reject Unix peers running as another user
#[cfg(target_os = "linux")]
fn validate_peer(stream: &UnixStream) -> io::Result<()> {
    let cred = stream.peer_cred()?;
    // SAFETY: getuid has no failure mode.
    let uid = unsafe { libc::getuid() };
    if cred.uid() != uid {
        warn!("Rejecting connection from uid {}", cred.uid());
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("peer uid {} does not match {}", cred.uid(), uid),
        ));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn validate_peer(_stream: &UnixStream) -> io::Result<()> {
    Ok(())
}

/// Serves one session to any number of clients
pub struct Server {
    session: SessionHandle,
    endpoint: Endpoint,
    connections: Registry,
    next_connection: ConnectionId,
}

impl Server {
    pub fn new(session: SessionHandle, endpoint: Endpoint) -> Self {
        Self {
            session,
            endpoint,
            connections: Rc::new(RefCell::new(HashMap::new())),
            next_connection: 1,
        }
    }

    /// Accept clients until the session ends or the process is interrupted.
    ///
    /// Must run inside a `LocalSet`.
    pub async fn run(mut self, driver: SessionDriver) -> anyhow::Result<()> {
        let listener = Listener::bind(&self.endpoint).await?;
        info!("Listening on {}", self.endpoint);

        let mut session_done = tokio::task::spawn_local(driver.run());
        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        loop {
            tokio::select! {
                result = &mut session_done => {
                    if let Err(e) = result {
                        error!("Session driver failed: {}", e);
                    }
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok(stream) => handles.push(self.spawn_connection(stream)),
                    Err(e) => warn!("Accept failed: {}", e),
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted");
                    break;
                }
                _ = terminate.recv() => {
                    info!("Terminated");
                    break;
                }
            }
            handles.retain(|h| !h.is_finished());
        }

        self.shutdown(handles).await;
        if let Some(path) = listener.socket_path() {
            if let Err(e) = std::fs::remove_file(path) {
                warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
        info!("Server stopped");
        Ok(())
    }

    fn spawn_connection(&mut self, stream: Box<dyn Stream>) -> JoinHandle<()> {
        let id = self.next_connection;
        self.next_connection += 1;
        info!("Client {} connected", id);
        tokio::task::spawn_local(serve_connection(
            id,
            self.session.clone(),
            self.connections.clone(),
            stream,
        ))
    }

    /// Tell every client the session is gone and let them flush.
    async fn shutdown(&self, handles: Vec<JoinHandle<()>>) {
        for outbox in self.connections.borrow().values() {
            let _ = outbox.try_send(Outbound::Call(Command::DetachClient));
            let _ = outbox.try_send(Outbound::Close);
        }
        for mut handle in handles {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                debug!("Connection did not close in time");
                handle.abort();
            }
        }
    }
}

/// Per-connection state on the server side
struct Connection {
    id: ConnectionId,
    session: SessionHandle,
    outbox: mpsc::Sender<Outbound>,
    /// Raised when the outbox is full; the connection is then dropped
    stalled: Rc<Notify>,
    /// Client size shared with its renderer
    size: Rc<Cell<(u16, u16)>>,
    renderer: Option<RendererId>,
    dispatcher: InputDispatcher,
}

/// Run one client connection to completion.
async fn serve_connection<S>(id: ConnectionId, session: SessionHandle, registry: Registry, stream: S)
where
    S: Stream + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let (outbox, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
    registry.borrow_mut().insert(id, outbox.clone());
    let stalled = Rc::new(Notify::new());

    let mut writer_task = tokio::task::spawn_local(protocol::write_outbound(writer, outbox_rx));
    let mut connection = Connection {
        id,
        session,
        outbox,
        stalled: stalled.clone(),
        size: Rc::new(Cell::new(DEFAULT_SIZE)),
        renderer: None,
        dispatcher: InputDispatcher::new(Variant::Server),
    };

    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    debug!("Client {} closed the connection", id);
                    break;
                }
                Ok(n) => {
                    decoder.push(&buf[..n]);
                    if let Err(e) = connection.drain(&mut decoder) {
                        warn!("Client {}: {}", id, e);
                        break;
                    }
                }
                Err(e) => {
                    debug!("Client {} read failed: {}", id, e);
                    break;
                }
            },
            result = &mut writer_task => {
                if let Ok(Err(e)) = result {
                    debug!("Client {} write failed: {}", id, e);
                }
                break;
            }
            _ = stalled.notified() => {
                warn!("Client {} stopped reading, disconnecting", id);
                break;
            }
        }
    }

    connection.detach_renderer();
    registry.borrow_mut().remove(&id);
    let _ = connection.outbox.try_send(Outbound::Close);
    if !writer_task.is_finished() && tokio::time::timeout(SHUTDOWN_GRACE, &mut writer_task).await.is_err() {
        writer_task.abort();
    }
    info!("Client {} disconnected", id);
}

impl Connection {
    /// Handle every complete frame; an error closes the connection.
    fn drain(&mut self, decoder: &mut FrameDecoder) -> protocol::Result<()> {
        while let Some(payload) = decoder.next_frame()? {
            match protocol::parse_message(&payload) {
                Ok(Message::Call { id, command }) => self.handle_call(id, command),
                Ok(other) => debug!("Client {}: ignoring {:?}", self.id, other),
                Err(ProtocolError::Malformed { id: Some(id), reason }) => {
                    warn!("Client {}: malformed call {}: {}", self.id, id, reason);
                    self.send(Message::Error { id, message: reason });
                }
                Err(e) => warn!("Client {}: dropping frame: {}", self.id, e),
            }
        }
        Ok(())
    }

    fn send(&self, msg: Message) {
        self.queue(Outbound::Message(msg));
    }

    fn queue(&self, item: Outbound) {
        if self.outbox.try_send(item).is_err() {
            self.stalled.notify_one();
        }
    }

    fn handle_call(&mut self, id: u64, command: Command) {
        debug!("Client {} call {}: {:?}", self.id, id, command);
        let mut detach = false;
        let response = match command {
            Command::AttachClient => {
                self.attach();
                Message::Answer { id }
            }
            Command::SendKeyStrokes { data } => match self.renderer {
                None => Message::Error {
                    id,
                    message: "client is not attached".to_string(),
                },
                Some(_) => {
                    let mut session = self.session.borrow_mut();
                    let mut target = ClientTarget {
                        target: &mut *session,
                        detach: false,
                    };
                    self.dispatcher.process(&data, &mut target);
                    detach = target.detach;
                    Message::Answer { id }
                }
            },
            Command::SetSize { width, height } => {
                self.size.set((width, height));
                if self.renderer.is_some() {
                    self.session.borrow_mut().update_size();
                }
                Message::Answer { id }
            }
            Command::GetSessions => Message::Reply {
                id,
                text: self.session.borrow().sessions_text(),
            },
            Command::GetSessionInfo => {
                let info = self.session.borrow().session_info();
                match serde_json::to_string_pretty(&info) {
                    Ok(text) => Message::Reply { id, text },
                    Err(e) => Message::Error { id, message: e.to_string() },
                }
            }
            Command::NewWindow => match self.session.borrow_mut().create_new_window() {
                Ok(_) => Message::Answer { id },
                Err(e) => Message::Error { id, message: e.to_string() },
            },
            Command::WriteOutput { .. } | Command::DetachClient => Message::Error {
                id,
                message: "not a server command".to_string(),
            },
        };
        self.send(response);

        if detach {
            info!("Client {} detached", self.id);
            self.detach_renderer();
            self.queue(Outbound::Call(Command::DetachClient));
            self.queue(Outbound::Close);
        }
    }

    fn attach(&mut self) {
        if self.renderer.is_some() {
            return;
        }
        let backend = NetworkBackend::new(self.outbox.clone(), self.size.clone(), self.stalled.clone());
        let renderer = self.session.borrow_mut().add_renderer(Rc::new(backend));
        self.renderer = Some(renderer);
    }

    fn detach_renderer(&mut self) {
        if let Some(renderer) = self.renderer.take() {
            self.session.borrow_mut().remove_renderer(renderer);
        }
    }
}

/// Routes a client's keys to the session, catching `Detach`
struct ClientTarget<'a> {
    target: &'a mut dyn CommandTarget,
    detach: bool,
}

impl CommandTarget for ClientTarget<'_> {
    fn send_to_active_pane(&mut self, data: &[u8]) {
        self.target.send_to_active_pane(data);
    }

    fn run(&mut self, command: input::Command) {
        match command {
            input::Command::Detach => self.detach = true,
            other => self.target.run(other),
        }
    }
}
