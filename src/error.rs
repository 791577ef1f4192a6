//! Error type shared by every layer of the ingestion pipeline.

use thiserror::Error;

use crate::io::channel::CommandKind;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// No manifest entry matched inside the package.
    #[error("package manifest not found")]
    ManifestNotFound,

    /// The bytes are not a well-formed archive or container.
    #[error("invalid package container: {0}")]
    ContainerOpen(String),

    /// The manifest was found but could not be decoded.
    #[error("malformed manifest: {0}")]
    Manifest(String),

    /// Selecting or decoding an icon failed. Never aborts a parse.
    #[error("icon decode failed: {0}")]
    IconDecode(String),

    /// A bridge reply did not answer the request that was sent.
    #[error(
        "unexpected reply: sent {expected:?} #{expected_id}, received {received:?} #{received_id}"
    )]
    ProtocolMismatch {
        expected: CommandKind,
        expected_id: String,
        received: CommandKind,
        received_id: String,
    },

    /// The bridge channel closed or carried a malformed message.
    #[error("transport error: {0}")]
    Transport(String),

    /// Pulling more bytes into the cache failed. Bytes cached before the
    /// failure stay valid.
    #[error("cache growth failed after {cached} bytes: {source}")]
    CacheGrowth {
        cached: u64,
        #[source]
        source: std::io::Error,
    },

    /// The read started at or past the end of the source.
    #[error("end of data")]
    EndOfData,

    /// The source ended before a fixed-size read was satisfied.
    #[error("unexpected end of data")]
    UnexpectedEof,

    #[error("source is closed")]
    Closed,

    #[error("invalid seek to position {0}")]
    InvalidSeek(i128),

    #[error("deadline elapsed while waiting for the remote peer")]
    DeadlineElapsed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("unknown package type: {0}")]
    UnknownPackageType(String),

    #[error("invalid storage name: {0}")]
    InvalidName(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

