mod cache;
pub mod channel;
mod http;
mod local;
mod remote;

pub use cache::{SeekableCache, SpoolMode};
pub use channel::{Channel, Command, CommandKind, JsonLinesChannel};
pub use http::HttpRangeReader;
pub use local::LocalFileReader;
pub use remote::{MAX_READ_LEN, RemoteFile};

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Trait for random access reading from a data source
#[async_trait]
pub trait ReadAt: Send + Sync {
    /// Read data at the specified offset into the buffer.
    ///
    /// Returns the number of bytes copied, which may be less than the buffer
    /// when the source ends inside the window or caps a single read. Reading a
    /// non-empty buffer at or past the end yields [`Error::EndOfData`].
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Get the size of the data source as currently known
    async fn size(&self) -> Result<u64>;

    /// Fill the whole buffer from `offset`, failing with
    /// [`Error::UnexpectedEof`] if the source ends first.
    async fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read_at(offset + filled as u64, &mut buf[filled..]).await {
                Ok(0) | Err(Error::EndOfData) => return Err(Error::UnexpectedEof),
                Ok(n) => filled += n,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Fully buffered bytes, such as an encoded icon.
#[async_trait]
impl ReadAt for Vec<u8> {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let len = self.len() as u64;
        if offset >= len {
            return Err(Error::EndOfData);
        }
        let start = offset as usize;
        let n = buf.len().min(self.len() - start);
        buf[..n].copy_from_slice(&self[start..start + n]);
        Ok(n)
    }

    async fn size(&self) -> Result<u64> {
        Ok(self.len() as u64)
    }
}
