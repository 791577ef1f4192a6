//! Random access over a forward-only byte stream.
//!
//! An upload body can only be read front to back, but a zip archive keeps
//! its directory at the end. [`SeekableCache`] sits between the two: every
//! read that reaches past the bytes seen so far pulls exactly the missing
//! span from the stream and appends it to a growable cache, held in memory
//! or spooled to a private temporary file. Cached bytes are never evicted,
//! so the stream is read at most once.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;
use tracing::trace;

use super::ReadAt;
use crate::error::{Error, Result};

/// Largest single read issued against the wrapped stream while growing.
const GROWTH_PIECE: usize = 1024 * 1024;

/// Where grown bytes are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpoolMode {
    #[default]
    Memory,
    Disk,
}

enum Backing {
    Memory(Vec<u8>),
    Disk(NamedTempFile),
    Released,
}

impl Backing {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Backing::Memory(buf) => buf.extend_from_slice(data),
            Backing::Disk(file) => {
                let file: &mut File = file.as_file_mut();
                file.seek(SeekFrom::End(0))?;
                file.write_all(data)?;
            }
            Backing::Released => return Err(Error::Closed),
        }
        Ok(())
    }

    fn copy_out(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self {
            Backing::Memory(data) => {
                let start = offset as usize;
                buf.copy_from_slice(&data[start..start + buf.len()]);
            }
            Backing::Disk(file) => {
                let file: &mut File = file.as_file_mut();
                file.seek(SeekFrom::Start(offset))?;
                file.read_exact(buf)?;
            }
            Backing::Released => return Err(Error::Closed),
        }
        Ok(())
    }
}

struct State<S> {
    source: Option<S>,
    backing: Backing,
    /// Bytes cached so far.
    len: u64,
    /// Cursor for [`SeekableCache::read`].
    pos: u64,
}

impl<S: AsyncRead + Unpin + Send> State<S> {
    async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if matches!(self.backing, Backing::Released) {
            return Err(Error::Closed);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let end = offset.saturating_add(buf.len() as u64);
        if end > self.len {
            self.grow(end - self.len).await?;
        }

        let available = self.len.saturating_sub(offset);
        if available == 0 {
            return Err(Error::EndOfData);
        }
        let n = (buf.len() as u64).min(available) as usize;
        self.backing.copy_out(offset, &mut buf[..n])?;
        Ok(n)
    }

    /// Pull `more` bytes from the stream. Whatever arrives before a failure
    /// is kept and counted.
    async fn grow(&mut self, more: u64) -> Result<()> {
        let Some(source) = self.source.as_mut() else {
            return Ok(());
        };

        let mut piece = vec![0u8; (more as usize).min(GROWTH_PIECE)];
        let mut remaining = more;
        let mut exhausted = false;
        let mut failure = None;

        while remaining > 0 {
            let want = (remaining as usize).min(piece.len());
            match source.read(&mut piece[..want]).await {
                Ok(0) => {
                    exhausted = true;
                    break;
                }
                Ok(n) => {
                    self.backing.append(&piece[..n])?;
                    self.len += n as u64;
                    remaining -= n as u64;
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        trace!(
            requested = more,
            cached = self.len,
            exhausted,
            "cache grown"
        );

        if exhausted {
            self.source = None;
        }
        match failure {
            Some(source) => Err(Error::CacheGrowth {
                cached: self.len,
                source,
            }),
            None => Ok(()),
        }
    }
}

/// Seekable, random-access view over a forward-only stream.
///
/// All operations on one cache serialize through a single lock, and growth
/// followed by the copy-out happens under that lock, so concurrent readers
/// never observe a half-grown cache.
pub struct SeekableCache<S> {
    state: Mutex<State<S>>,
}

impl<S: AsyncRead + Unpin + Send> SeekableCache<S> {
    /// Wrap `source`, keeping grown bytes according to `mode`.
    pub fn open(source: S, mode: SpoolMode) -> Result<Self> {
        let backing = match mode {
            SpoolMode::Memory => Backing::Memory(Vec::new()),
            SpoolMode::Disk => Backing::Disk(
                tempfile::Builder::new()
                    .prefix("seekbuf-")
                    .tempfile()?,
            ),
        };
        Ok(Self {
            state: Mutex::new(State {
                source: Some(source),
                backing,
                len: 0,
                pos: 0,
            }),
        })
    }

    /// Copy the window at `offset` into `buf`, growing the cache first if the
    /// window reaches past it.
    pub async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.state.lock().await;
        state.read_at(offset, buf).await
    }

    /// Read at the cursor and advance it by the bytes read.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.state.lock().await;
        let pos = state.pos;
        let n = state.read_at(pos, buf).await?;
        state.pos += n as u64;
        Ok(n)
    }

    /// Move the cursor. Never pulls from the stream; the next read does.
    pub async fn seek(&self, from: SeekFrom) -> Result<u64> {
        let mut state = self.state.lock().await;
        let target = match from {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(delta) => state.pos as i128 + delta as i128,
            SeekFrom::End(delta) => state.len as i128 + delta as i128,
        };
        if target < 0 || target > u64::MAX as i128 {
            return Err(Error::InvalidSeek(target));
        }
        state.pos = target as u64;
        Ok(state.pos)
    }

    /// Number of bytes cached so far. This only reaches the stream's total
    /// length once reads have grown the cache that far.
    pub async fn cached_len(&self) -> u64 {
        self.state.lock().await.len
    }

    /// Drop the cached bytes and the stream. A disk spool's file is removed.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.source = None;
        match std::mem::replace(&mut state.backing, Backing::Released) {
            Backing::Disk(file) => file.close()?,
            Backing::Memory(_) | Backing::Released => {}
        }
        Ok(())
    }

    #[cfg(test)]
    async fn spool_path(&self) -> Option<std::path::PathBuf> {
        match &self.state.lock().await.backing {
            Backing::Disk(file) => Some(file.path().to_path_buf()),
            _ => None,
        }
    }
}

#[async_trait]
impl<S: AsyncRead + Unpin + Send> ReadAt for SeekableCache<S> {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        SeekableCache::read_at(self, offset, buf).await
    }

    async fn size(&self) -> Result<u64> {
        Ok(self.cached_len().await)
    }
}
