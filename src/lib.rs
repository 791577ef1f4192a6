//! # ipa-server
//!
//! Core of a self-hosted distribution server for iOS (`.ipa`) and Android
//! (`.apk`) packages.
//!
//! An upload arrives either as a forward-only stream or as a file that
//! stays on the uploading peer. Both become a random-access [`ReadAt`]
//! source: streams through the [`SeekableCache`], peer files through the
//! [`RemoteFile`] bridge. The zip reader only touches the ranges it needs,
//! the package parsers extract name, version, identifier, build, channel
//! and icon, and the [`Ingestor`] stores the package and its icon.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ipa_server::{Ingestor, InstallManifest, LocalStorage, SpoolMode};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let storage = Arc::new(LocalStorage::new("./upload"));
//!     let ingestor = Ingestor::new(storage, InstallManifest::default())
//!         .with_public_url("https://dl.example.com/");
//!
//!     let file = tokio::fs::File::open("Demo.ipa").await?;
//!     let size = file.metadata().await?.len();
//!     let app = ingestor
//!         .ingest_upload(file, size, Some("Demo.ipa"), SpoolMode::Disk)
//!         .await?;
//!     println!("{} {} ({})", app.name, app.version, app.identifier);
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod error;
pub mod ingest;
pub mod install;
pub mod io;
pub mod package;
pub mod storage;
pub mod zip;

pub use error::{Error, Result};
pub use ingest::Ingestor;
pub use install::{InstallItem, InstallManifest};
pub use io::{
    Channel, HttpRangeReader, JsonLinesChannel, LocalFileReader, ReadAt, RemoteFile,
    SeekableCache, SpoolMode,
};
pub use package::{AppInfo, Package, PackageKind};
pub use storage::{LocalStorage, Storage};
pub use zip::{ZipArchive, ZipFileEntry};
