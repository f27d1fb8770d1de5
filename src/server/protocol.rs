//! Control-plane wire format
//!
//! ```text
//! +----------------+------------------------------------------+
//! | Length (4)     | JSON Payload (variable, <= 65535 bytes)  |
//! | big-endian u32 | Message                                  |
//! +----------------+------------------------------------------+
//! ```
//!
//! Every `Call` is answered with `Answer`, `Reply` (for commands that return
//! text) or `Error`, carrying the call's id.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Largest JSON payload accepted or produced
pub const MAX_FRAME_SIZE: usize = 65_535;

/// Bytes of terminal output per `WriteOutput` call.
///
/// Byte payloads travel as JSON arrays, at most four characters per byte,
/// so this keeps the worst case under `MAX_FRAME_SIZE`.
pub const OUTPUT_CHUNK_SIZE: usize = 8_000;

/// Frames queued per connection before the peer counts as stalled
pub const OUTBOX_CAPACITY: usize = 256;

const HEADER_SIZE: usize = 4;

const MIN_BUFFER_CAPACITY: usize = 4096;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    FrameTooLarge(usize),

    #[error("malformed message: {reason}")]
    Malformed { id: Option<u64>, reason: String },

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Commands either side may call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "args")]
pub enum Command {
    /// Server to client: raw terminal output
    WriteOutput { data: Vec<u8> },
    /// Server to client: the session is gone or the client detached
    DetachClient,
    /// Register the caller as a renderer
    AttachClient,
    /// Client keyboard input, passed through byte for byte
    SendKeyStrokes { data: Vec<u8> },
    SetSize { width: u16, height: u16 },
    GetSessions,
    GetSessionInfo,
    NewWindow,
}

/// One frame's payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    Call { id: u64, command: Command },
    Answer { id: u64 },
    Reply { id: u64, text: String },
    Error { id: u64, message: String },
}

/// Queued for a connection's writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A call; the writer assigns its id
    Call(Command),
    Message(Message),
    /// Flush and shut the connection down
    Close,
}

/// Encode a message as a length-prefixed frame
pub fn encode(msg: &Message) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(msg)?;
    if json.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(json.len()));
    }

    let mut buf = Vec::with_capacity(HEADER_SIZE + json.len());
    buf.extend_from_slice(&(json.len() as u32).to_be_bytes());
    buf.extend_from_slice(&json);
    Ok(buf)
}

/// Parse a frame payload, recovering the call id from otherwise invalid input
/// when possible.
pub fn parse_message(payload: &[u8]) -> Result<Message> {
    serde_json::from_slice(payload).map_err(|e| {
        let id = serde_json::from_slice::<serde_json::Value>(payload)
            .ok()
            .and_then(|v| v.get("id").and_then(serde_json::Value::as_u64));
        ProtocolError::Malformed {
            id,
            reason: e.to_string(),
        }
    })
}

/// Buffers incoming bytes and yields complete frame payloads
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    read_pos: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MIN_BUFFER_CAPACITY),
            read_pos: 0,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        if self.read_pos > self.buffer.len() / 2 && self.read_pos > MIN_BUFFER_CAPACITY {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    fn available(&self) -> usize {
        self.buffer.len() - self.read_pos
    }

    /// Next complete payload, `Ok(None)` when more bytes are needed.
    ///
    /// An oversized length is fatal for the stream.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.available() < HEADER_SIZE {
            return Ok(None);
        }
        let header = &self.buffer[self.read_pos..self.read_pos + HEADER_SIZE];
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(len));
        }
        if self.available() < HEADER_SIZE + len {
            return Ok(None);
        }

        let start = self.read_pos + HEADER_SIZE;
        let payload = self.buffer[start..start + len].to_vec();
        self.read_pos = start + len;
        Ok(Some(payload))
    }
}

/// Drain a connection's outbox onto the wire until `Close` or the channel ends.
///
/// Calls are numbered from 1 in the order they are written.
pub async fn write_outbound<W>(mut writer: W, mut outbox: mpsc::Receiver<Outbound>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut next_id: u64 = 1;
    while let Some(item) = outbox.recv().await {
        let msg = match item {
            Outbound::Call(command) => {
                let id = next_id;
                next_id += 1;
                Message::Call { id, command }
            }
            Outbound::Message(msg) => msg,
            Outbound::Close => break,
        };
        match encode(&msg) {
            Ok(frame) => writer.write_all(&frame).await?,
            Err(e) => error!("Dropping outgoing message: {}", e),
        }
    }
    writer.flush().await?;
    writer.shutdown().await?;
    debug!("Connection writer closed");
    Ok(())
}
