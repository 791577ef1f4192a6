use flate2::Crc;
use flate2::read::DeflateDecoder;
use std::io::Read;
use std::sync::Arc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::io::ReadAt;

use super::parser::ZipParser;
use super::structures::{CompressionMethod, ZipFileEntry};

/// Cap on the up-front allocation for an inflated entry; the buffer still
/// grows past it when the entry really is larger.
const MAX_PREALLOC: u64 = 64 * 1024 * 1024;

/// An opened archive: the central directory is read once, entries are
/// inflated on demand.
pub struct ZipArchive<R: ReadAt + ?Sized> {
    parser: ZipParser<R>,
    entries: Vec<ZipFileEntry>,
}

impl<R: ReadAt + ?Sized> ZipArchive<R> {
    /// Open `size` bytes of `reader` as a zip archive.
    pub async fn open(reader: Arc<R>, size: u64) -> Result<Self> {
        let parser = ZipParser::new(reader, size);
        let entries = parser.list_files().await?;
        debug!(entries = entries.len(), size, "archive opened");
        Ok(Self { parser, entries })
    }

    /// All entries in central directory order
    pub fn entries(&self) -> &[ZipFileEntry] {
        &self.entries
    }

    /// Find an entry by its exact path
    pub fn find(&self, name: &str) -> Option<&ZipFileEntry> {
        self.entries.iter().find(|e| e.file_name == name)
    }

    /// Extract file data to memory, checking its CRC-32
    pub async fn read(&self, entry: &ZipFileEntry) -> Result<Vec<u8>> {
        let data_offset = self.parser.get_data_offset(entry).await?;
        let raw = self
            .parser
            .read_data(data_offset, entry.compressed_size, &entry.file_name)
            .await?;

        let data = match entry.compression_method {
            CompressionMethod::Stored => raw,
            CompressionMethod::Deflate => {
                let mut out = Vec::with_capacity(entry.uncompressed_size.min(MAX_PREALLOC) as usize);
                DeflateDecoder::new(raw.as_slice())
                    .take(entry.uncompressed_size.saturating_add(1))
                    .read_to_end(&mut out)
                    .map_err(|e| {
                        Error::ContainerOpen(format!("cannot inflate {}: {e}", entry.file_name))
                    })?;
                if out.len() as u64 > entry.uncompressed_size {
                    return Err(Error::ContainerOpen(format!(
                        "{} inflates past its declared size of {} bytes",
                        entry.file_name, entry.uncompressed_size
                    )));
                }
                out
            }
            CompressionMethod::Unknown(method) => {
                return Err(Error::ContainerOpen(format!(
                    "unsupported compression method {method} for {}",
                    entry.file_name
                )));
            }
        };

        let mut crc = Crc::new();
        crc.update(&data);
        if crc.sum() != entry.crc32 {
            return Err(Error::ContainerOpen(format!(
                "CRC mismatch for {}",
                entry.file_name
            )));
        }

        Ok(data)
    }
}
