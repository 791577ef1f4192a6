//! Wire format of the remote file bridge.
//!
//! Every message is one JSON object:
//!
//! ```text
//! {"command": 1, "param": {"offset": 0, "length": 65536}, "requestId": "7"}
//! ```
//!
//! `command` is 1 (ReadAt), 2 (Size), 3 (Name) or 4 (Done). How messages are
//! framed is up to the [`Channel`]; [`JsonLinesChannel`] puts one object per
//! line on any byte stream.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LinesCodec};

use crate::error::{Error, Result};

/// Upper bound for one framed message. A 1 MiB read encodes to ~1.4 MB.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum CommandKind {
    ReadAt,
    Size,
    Name,
    Done,
}

impl From<CommandKind> for i32 {
    fn from(kind: CommandKind) -> Self {
        match kind {
            CommandKind::ReadAt => 1,
            CommandKind::Size => 2,
            CommandKind::Name => 3,
            CommandKind::Done => 4,
        }
    }
}

impl TryFrom<i32> for CommandKind {
    type Error = String;

    fn try_from(value: i32) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(CommandKind::ReadAt),
            2 => Ok(CommandKind::Size),
            3 => Ok(CommandKind::Name),
            4 => Ok(CommandKind::Done),
            other => Err(format!("unknown command {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub command: CommandKind,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub param: Map<String, Value>,
    #[serde(rename = "requestId")]
    pub request_id: String,
}

impl Command {
    pub fn new(command: CommandKind, request_id: impl Into<String>, param: Map<String, Value>) -> Self {
        Self {
            command,
            param,
            request_id: request_id.into(),
        }
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Duplex message channel to the peer holding the file.
#[async_trait]
pub trait Channel: Send {
    async fn send(&mut self, command: &Command) -> Result<()>;

    /// Wait for the next message. A closed channel is a transport error.
    async fn recv(&mut self) -> Result<Command>;
}

/// Newline-delimited JSON over a byte stream (TCP, pipes, in-memory duplex).
pub struct JsonLinesChannel<T> {
    framed: Framed<T, LinesCodec>,
}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> JsonLinesChannel<T> {
    pub fn new(io: T) -> Self {
        Self {
            framed: Framed::new(io, LinesCodec::new_with_max_length(MAX_FRAME_LEN)),
        }
    }
}

#[async_trait]
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Channel for JsonLinesChannel<T> {
    async fn send(&mut self, command: &Command) -> Result<()> {
        let line = serde_json::to_string(command)
            .map_err(|e| Error::Transport(format!("encode message: {e}")))?;
        self.framed
            .send(line)
            .await
            .map_err(|e| Error::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Command> {
        let line = match self.framed.next().await {
            Some(Ok(line)) => line,
            Some(Err(e)) => return Err(Error::Transport(e.to_string())),
            None => return Err(Error::Transport("channel closed".to_string())),
        };
        serde_json::from_str(&line).map_err(|e| Error::Transport(format!("malformed message: {e}")))
    }
}
