//! A file that lives on the remote peer.
//!
//! The browser keeps the selected file and the server pulls byte ranges from
//! it on demand, so a package can be parsed without being uploaded in full
//! first. Each call sends one request with a fresh correlation id and waits
//! for the matching reply; anything else on the channel at that point is a
//! protocol error for the session.

use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Map, Value, json};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::ReadAt;
use super::channel::{Channel, Command, CommandKind};
use crate::error::{Error, Result};

/// Largest range asked of the peer in one request. Base64 inflates it by a
/// third, which keeps every reply well inside one channel frame.
pub const MAX_READ_LEN: usize = 1024 * 1024;

pub struct RemoteFile<C> {
    channel: Mutex<C>,
    next_id: AtomicU64,
    size: StdMutex<Option<u64>>,
    offset: AtomicU64,
    deadline: Option<Duration>,
    cancel: CancellationToken,
}

impl<C: Channel> RemoteFile<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel: Mutex::new(channel),
            next_id: AtomicU64::new(1),
            size: StdMutex::new(None),
            offset: AtomicU64::new(0),
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Bound every blocking exchange. Without a deadline a call waits until
    /// the peer replies or the channel fails.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Abort blocking exchanges once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn known_size(&self) -> Option<u64> {
        *self.size.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Total size of the remote file, fetched once per session.
    pub async fn size(&self) -> Result<u64> {
        if let Some(size) = self.known_size() {
            return Ok(size);
        }

        let reply = self.request(CommandKind::Size, Map::new()).await?;
        let size = match reply.param.get("size") {
            Some(Value::Number(n)) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
            _ => None,
        }
        .ok_or_else(|| Error::Transport("size reply without a usable size".to_string()))?;

        *self.size.lock().unwrap_or_else(|e| e.into_inner()) = Some(size);
        Ok(size)
    }

    /// File name as chosen on the peer.
    pub async fn name(&self) -> Result<String> {
        let reply = self.request(CommandKind::Name, Map::new()).await?;
        reply
            .param
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::Transport("name reply without a name".to_string()))
    }

    /// Read up to `buf.len()` bytes at `offset` from the peer, at most
    /// [`MAX_READ_LEN`] per call.
    ///
    /// An empty payload is the peer's end-of-data signal and surfaces as
    /// [`Error::EndOfData`], never as a zero-length success.
    pub async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.known_size().is_some_and(|size| offset >= size) {
            return Err(Error::EndOfData);
        }

        let len = buf.len().min(MAX_READ_LEN);
        let buf = &mut buf[..len];
        let mut param = Map::new();
        param.insert("offset".to_string(), json!(offset));
        param.insert("length".to_string(), json!(buf.len()));
        let reply = self.request(CommandKind::ReadAt, param).await?;

        let data = reply
            .param
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Transport("readAt reply without data".to_string()))?;
        if data.is_empty() {
            return Err(Error::EndOfData);
        }

        let bytes = STANDARD
            .decode(data)
            .map_err(|e| Error::Transport(format!("invalid base64 payload: {e}")))?;
        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        self.offset.store(offset + n as u64, Ordering::Relaxed);
        Ok(n)
    }

    /// Sequential read continuing after the previous [`read_at`](Self::read_at).
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let offset = self.offset.load(Ordering::Relaxed);
        self.read_at(offset, buf).await
    }

    /// Hand the final package metadata to the peer. No reply is expected.
    pub async fn done(&self, result: Map<String, Value>) -> Result<()> {
        let id = self.next_request_id();
        let command = Command::new(CommandKind::Done, id, result);
        let mut channel = self.channel.lock().await;
        self.guard(channel.send(&command)).await
    }

    fn next_request_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    async fn request(&self, kind: CommandKind, param: Map<String, Value>) -> Result<Command> {
        let id = self.next_request_id();
        let command = Command::new(kind, id.clone(), param);

        let mut channel = self.channel.lock().await;
        let reply = self
            .guard(async {
                channel.send(&command).await?;
                channel.recv().await
            })
            .await?;
        drop(channel);

        trace!(command = ?kind, request_id = %id, "bridge reply received");

        if reply.command != kind || reply.request_id != id {
            return Err(Error::ProtocolMismatch {
                expected: kind,
                expected_id: id,
                received: reply.command,
                received_id: reply.request_id,
            });
        }
        Ok(reply)
    }

    async fn guard<T>(&self, exchange: impl Future<Output = Result<T>>) -> Result<T> {
        let bounded = async {
            match self.deadline {
                Some(deadline) => tokio::time::timeout(deadline, exchange)
                    .await
                    .map_err(|_| Error::DeadlineElapsed)?,
                None => exchange.await,
            }
        };
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = bounded => result,
        }
    }
}

#[async_trait]
impl<C: Channel> ReadAt for RemoteFile<C> {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        RemoteFile::read_at(self, offset, buf).await
    }

    async fn size(&self) -> Result<u64> {
        RemoteFile::size(self).await
    }
}
