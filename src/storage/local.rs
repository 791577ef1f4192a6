use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::debug;

use super::{MetadataReader, Storage};
use crate::error::{Error, Result};
use crate::io::ReadAt;

/// Copy granularity for `save`.
const CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// Objects stored as plain files below a root directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map an object name to a path, refusing anything outside the root.
    fn resolve(&self, name: &str) -> Result<PathBuf> {
        let relative = Path::new(name);
        let plain = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if name.is_empty() || !plain {
            return Err(Error::InvalidName(name.to_string()));
        }
        Ok(self.root.join(relative))
    }

    /// Remove now-empty directories between `path` and the root.
    async fn prune(&self, path: &Path) {
        let mut dir = path.parent();
        while let Some(d) = dir {
            if d == self.root || !d.starts_with(&self.root) {
                break;
            }
            if fs::remove_dir(d).await.is_err() {
                break;
            }
            dir = d.parent();
        }
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn save(&self, name: &str, source: &dyn ReadAt, size: u64) -> Result<()> {
        let path = self.resolve(name)?;
        let parent = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(parent).await?;

        // Written beside the target and renamed into place once complete;
        // dropping the temp path on any error removes the partial copy.
        let (file, temp) = tempfile::Builder::new()
            .prefix(".partial-")
            .tempfile_in(parent)?
            .into_parts();
        let copied = async {
            let mut writer = BufWriter::with_capacity(CHUNK_SIZE, fs::File::from_std(file));
            let mut buf = vec![0u8; CHUNK_SIZE.min(size as usize)];
            let mut offset = 0u64;
            while offset < size {
                let want = (size - offset).min(buf.len() as u64) as usize;
                source.read_exact_at(offset, &mut buf[..want]).await?;
                writer.write_all(&buf[..want]).await?;
                offset += want as u64;
            }
            writer.flush().await?;
            Ok::<_, Error>(())
        }
        .await;
        if let Err(e) = copied {
            drop(temp);
            self.prune(&path).await;
            return Err(e);
        }

        temp.persist(&path).map_err(|e| e.error)?;
        debug!(name, size, "object saved");
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let path = self.resolve(name)?;
        fs::remove_file(&path).await?;
        self.prune(&path).await;
        Ok(())
    }

    async fn move_object(&self, from: &str, to: &str) -> Result<()> {
        let source = self.resolve(from)?;
        let dest = self.resolve(to)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&source, &dest).await?;
        self.prune(&source).await;
        Ok(())
    }

    async fn open_metadata(&self, name: &str) -> Result<MetadataReader> {
        let file = fs::File::open(self.resolve(name)?).await?;
        Ok(Box::new(file))
    }
}
