use async_trait::async_trait;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode, Url};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use super::ReadAt;
use crate::error::{Error, Result};

const MAX_RETRY: u32 = 10;

/// A package already published on a web server, read with Range requests.
pub struct HttpRangeReader {
    client: Client,
    url: Url,
    size: u64,
    transferred_bytes: AtomicU64,
}

impl HttpRangeReader {
    /// Probe `url` for its size and Range support.
    ///
    /// Servers that omit `Content-Length` from HEAD are asked for the first
    /// byte and the size is taken from `Content-Range`.
    pub async fn new(url: String) -> Result<Self> {
        let url = Url::parse(&url).map_err(|e| Error::InvalidUrl(format!("{url}: {e}")))?;
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        let resp = client.head(url.clone()).send().await?;
        if !resp.status().is_success() {
            return Err(Error::Transport(format!("HEAD {url}: {}", resp.status())));
        }

        let ranges = resp
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("none");
        let length = resp
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());

        let size = match length {
            Some(size) if ranges.contains("bytes") => size,
            _ => {
                debug!(%url, "probing size with a one-byte range");
                let resp = client.get(url.clone()).header(RANGE, "bytes=0-0").send().await?;
                if resp.status() != StatusCode::PARTIAL_CONTENT {
                    return Err(Error::Transport(format!(
                        "{url} does not support Range requests"
                    )));
                }
                resp.headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(content_range_total)
                    .ok_or_else(|| Error::Transport(format!("{url} did not report its size")))?
            }
        };

        Ok(Self {
            client,
            url,
            size,
            transferred_bytes: AtomicU64::new(0),
        })
    }

    /// Last path segment of the URL, used to guess the package type.
    pub fn file_name(&self) -> Option<&str> {
        self.url
            .path_segments()?
            .next_back()
            .filter(|s| !s.is_empty())
    }

    /// Get total bytes transferred from network
    pub fn transferred_bytes(&self) -> u64 {
        self.transferred_bytes.load(Ordering::Relaxed)
    }

    /// GET `bytes=start-end`, retrying connection failures with a growing pause.
    async fn fetch_range(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        let mut attempt = 0;
        loop {
            let sent = self
                .client
                .get(self.url.clone())
                .header(RANGE, format!("bytes={start}-{end}"))
                .send()
                .await;

            match sent {
                Ok(resp) if resp.status() == StatusCode::PARTIAL_CONTENT => {
                    return Ok(resp.bytes().await?.to_vec());
                }
                Ok(resp) => {
                    return Err(Error::Transport(format!(
                        "range {start}-{end}: {}",
                        resp.status()
                    )));
                }
                Err(e) if e.is_timeout() || e.is_connect() => {
                    attempt += 1;
                    if attempt >= MAX_RETRY {
                        return Err(Error::Transport(format!(
                            "range {start}-{end}: giving up after {attempt} attempts"
                        )));
                    }
                    warn!(url = %self.url, attempt, error = %e, "range request failed, retrying");
                    tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Total length from `bytes 0-0/12345`; `*` means unknown.
fn content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

#[async_trait]
impl ReadAt for HttpRangeReader {
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if offset >= self.size {
            return Err(Error::EndOfData);
        }

        let end = (offset + buf.len() as u64 - 1).min(self.size - 1);
        let wanted = (end - offset + 1) as usize;

        let mut received = 0;
        while received < wanted {
            let bytes = self.fetch_range(offset + received as u64, end).await?;
            if bytes.is_empty() {
                break;
            }
            let n = bytes.len().min(wanted - received);
            buf[received..received + n].copy_from_slice(&bytes[..n]);
            received += n;
            self.transferred_bytes.fetch_add(n as u64, Ordering::Relaxed);
        }

        Ok(received)
    }

    async fn size(&self) -> Result<u64> {
        Ok(self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_range_total() {
        assert_eq!(content_range_total("bytes 0-0/12345"), Some(12345));
        assert_eq!(content_range_total("bytes 0-0/*"), None);
        assert_eq!(content_range_total("garbage"), None);
    }
}
