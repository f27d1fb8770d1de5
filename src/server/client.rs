//! Terminal client for a running server

use anyhow::{bail, Context};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::protocol::{self, Command, FrameDecoder, Message, Outbound, OUTBOX_CAPACITY};
use super::Endpoint;
use crate::ui::renderer::{RendererBackend, StdoutBackend};
use crate::ui::terminal::{self, RawTerminal, StdinReader};

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Why an attached session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    Detached,
    ConnectionClosed,
}

/// Attach the local terminal to the server's session.
///
/// Must run inside a `LocalSet`.
pub async fn attach(endpoint: &Endpoint) -> anyhow::Result<AttachOutcome> {
    let stream = endpoint
        .connect()
        .await
        .with_context(|| format!("no server at {}", endpoint))?;
    let (mut reader, writer) = tokio::io::split(stream);
    let (outbox, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
    let writer_task = tokio::task::spawn_local(protocol::write_outbound(writer, outbox_rx));

    let mut raw = RawTerminal::enter().context("failed to set up the terminal")?;
    let stdout = StdoutBackend::new();

    let (width, height) = terminal::size();
    send_call(&outbox, Command::SetSize { width, height }).await?;
    send_call(&outbox, Command::AttachClient).await?;
    info!("Attached to {} at {}x{}", endpoint, width, height);

    let input = tokio::task::spawn_local(forward_stdin(outbox.clone()));
    let resize = tokio::task::spawn_local(forward_resize(outbox.clone()));

    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let outcome = 'session: loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break AttachOutcome::ConnectionClosed,
            Ok(n) => n,
            Err(e) => {
                debug!("Server read failed: {}", e);
                break AttachOutcome::ConnectionClosed;
            }
        };
        decoder.push(&buf[..n]);

        loop {
            let payload = match decoder.next_frame() {
                Ok(Some(payload)) => payload,
                Ok(None) => break,
                Err(e) => {
                    warn!("Server stream corrupt: {}", e);
                    break 'session AttachOutcome::ConnectionClosed;
                }
            };
            match protocol::parse_message(&payload) {
                Ok(Message::Call { id, command: Command::WriteOutput { data } }) => {
                    stdout.write_output(data).await?;
                    let _ = outbox.send(Outbound::Message(Message::Answer { id })).await;
                }
                Ok(Message::Call { id, command: Command::DetachClient }) => {
                    let _ = outbox.send(Outbound::Message(Message::Answer { id })).await;
                    break 'session AttachOutcome::Detached;
                }
                Ok(Message::Call { id, command }) => {
                    debug!("Unsupported call from server: {:?}", command);
                    let _ = outbox
                        .send(Outbound::Message(Message::Error {
                            id,
                            message: "not a client command".to_string(),
                        }))
                        .await;
                }
                Ok(Message::Error { id, message }) => warn!("Call {} failed: {}", id, message),
                Ok(other) => debug!("Server: {:?}", other),
                Err(e) => warn!("Dropping frame from server: {}", e),
            }
        }
    };

    input.abort();
    resize.abort();
    let _ = outbox.send(Outbound::Close).await;
    let _ = writer_task.await;

    raw.leave()?;
    info!("Client finished: {:?}", outcome);
    Ok(outcome)
}

async fn send_call(outbox: &mpsc::Sender<Outbound>, command: Command) -> anyhow::Result<()> {
    outbox
        .send(Outbound::Call(command))
        .await
        .map_err(|_| anyhow::anyhow!("connection writer stopped"))
}

/// Forward raw stdin bytes; a character split across reads stays intact.
async fn forward_stdin(outbox: mpsc::Sender<Outbound>) {
    let stdin = match StdinReader::new() {
        Ok(stdin) => stdin,
        Err(e) => {
            warn!("Cannot read stdin: {}", e);
            return;
        }
    };
    let mut buf = vec![0u8; 4096];
    loop {
        match stdin.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let data = buf[..n].to_vec();
                if send_call(&outbox, Command::SendKeyStrokes { data }).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("stdin read failed: {}", e);
                break;
            }
        }
    }
}

async fn forward_resize(outbox: mpsc::Sender<Outbound>) {
    let mut winch = match signal(SignalKind::window_change()) {
        Ok(winch) => winch,
        Err(e) => {
            warn!("Cannot watch SIGWINCH: {}", e);
            return;
        }
    };
    while winch.recv().await.is_some() {
        let (width, height) = terminal::size();
        debug!("Terminal resized to {}x{}", width, height);
        if send_call(&outbox, Command::SetSize { width, height }).await.is_err() {
            break;
        }
    }
}

/// Run one control command and return the server's text reply, if any.
pub async fn run_command(endpoint: &Endpoint, command: Command) -> anyhow::Result<Option<String>> {
    let mut stream = endpoint
        .connect()
        .await
        .with_context(|| format!("no server at {}", endpoint))?;

    let frame = protocol::encode(&Message::Call { id: 1, command })?;
    stream.write_all(&frame).await?;
    let reply = await_reply(&mut stream, 1).await;

    let _ = stream.shutdown().await;
    reply
}

async fn await_reply<R: AsyncRead + Unpin>(mut reader: R, id: u64) -> anyhow::Result<Option<String>> {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        while let Some(payload) = decoder.next_frame()? {
            match protocol::parse_message(&payload)? {
                Message::Answer { id: r } if r == id => return Ok(None),
                Message::Reply { id: r, text } if r == id => return Ok(Some(text)),
                Message::Error { id: r, message } if r == id => bail!("server error: {}", message),
                other => debug!("Ignoring {:?}", other),
            }
        }
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            bail!("server closed the connection");
        }
        decoder.push(&buf[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_await_reply_skips_unrelated_messages() {
        let (mut server, client) = tokio::io::duplex(4096);
        for msg in [
            Message::Call {
                id: 1,
                command: Command::WriteOutput { data: b"x".to_vec() },
            },
            Message::Answer { id: 9 },
            Message::Reply {
                id: 1,
                text: "0: 1 windows".into(),
            },
        ] {
            server.write_all(&protocol::encode(&msg).unwrap()).await.unwrap();
        }

        let reply = await_reply(client, 1).await.unwrap();
        assert_eq!(reply.as_deref(), Some("0: 1 windows"));
    }

    #[tokio::test]
    async fn test_await_reply_errors() {
        let (mut server, client) = tokio::io::duplex(4096);
        let msg = Message::Error {
            id: 1,
            message: "client is not attached".into(),
        };
        server.write_all(&protocol::encode(&msg).unwrap()).await.unwrap();
        let err = await_reply(client, 1).await.unwrap_err();
        assert!(err.to_string().contains("not attached"));

        let (server, client) = tokio::io::duplex(64);
        drop(server);
        assert!(await_reply(client, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_answer_means_no_text() {
        let (mut server, client) = tokio::io::duplex(64);
        server
            .write_all(&protocol::encode(&Message::Answer { id: 1 }).unwrap())
            .await
            .unwrap();
        assert_eq!(await_reply(client, 1).await.unwrap(), None);
    }
}
