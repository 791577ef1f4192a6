//! Where package artifacts end up.
//!
//! The pipeline only ever calls [`Storage::save`]; the remaining operations
//! serve whatever lists, deletes and links stored packages.

mod local;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::error::{Error, Result};
use crate::io::ReadAt;

pub use local::LocalStorage;

pub type MetadataReader = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait Storage: Send + Sync {
    /// Create or overwrite `name` with the first `size` bytes of `source`.
    async fn save(&self, name: &str, source: &dyn ReadAt, size: u64) -> Result<()>;

    async fn delete(&self, name: &str) -> Result<()>;

    /// Rename an object. Backends without rename may copy then delete.
    async fn move_object(&self, from: &str, to: &str) -> Result<()>;

    /// Stream a stored object back.
    async fn open_metadata(&self, name: &str) -> Result<MetadataReader>;

    /// Public address of `name` below `base`.
    fn public_url(&self, base: &str, name: &str) -> Result<String> {
        join_url(base, name)
    }
}

/// Append `name` to the path of `base`, keeping its query and fragment.
pub fn join_url(base: &str, name: &str) -> Result<String> {
    let mut url =
        reqwest::Url::parse(base).map_err(|e| Error::InvalidUrl(format!("{base}: {e}")))?;
    if url.cannot_be_a_base() {
        return Err(Error::InvalidUrl(format!("{base}: cannot carry a path")));
    }
    let path = format!(
        "{}/{}",
        url.path().trim_end_matches('/'),
        name.trim_start_matches('/')
    );
    url.set_path(&path);
    Ok(url.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url() {
        assert_eq!(
            join_url("https://dl.example.com", "com.demo/1/ipa.ipa").unwrap(),
            "https://dl.example.com/com.demo/1/ipa.ipa"
        );
        assert_eq!(
            join_url("https://dl.example.com/files/?sig=1", "/a b.png").unwrap(),
            "https://dl.example.com/files/a%20b.png?sig=1"
        );
        assert!(matches!(join_url("not a url", "x"), Err(Error::InvalidUrl(_))));
        assert!(matches!(join_url("mailto:ops@example.com", "x"), Err(Error::InvalidUrl(_))));
    }
}
