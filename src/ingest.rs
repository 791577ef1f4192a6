//! The upload pipeline: parse a package, then persist it.
//!
//! Parsing happens before anything is stored, so a rejected upload leaves
//! no trace in storage. The package itself must be saved; the icon and the
//! install manifest are written best-effort.

use image::ImageFormat;
use serde_json::Value;
use std::io::Cursor;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::install::{InstallItem, InstallManifest};
use crate::io::{Channel, ReadAt, RemoteFile, SeekableCache, SpoolMode};
use crate::package::{self, AppInfo, Package, PackageKind};
use crate::storage::Storage;

pub struct Ingestor<S: ?Sized> {
    storage: Arc<S>,
    manifest: InstallManifest,
    public_url: Option<String>,
}

impl<S: Storage + ?Sized> Ingestor<S> {
    pub fn new(storage: Arc<S>, manifest: InstallManifest) -> Self {
        Self {
            storage,
            manifest,
            public_url: None,
        }
    }

    /// Base URL under which stored objects are served. Install manifests
    /// are only written when this is set.
    pub fn with_public_url(mut self, base: impl Into<String>) -> Self {
        self.public_url = Some(base.into());
        self
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Parse `size` bytes of `source` as `kind` and store the result.
    pub async fn ingest(
        &self,
        source: Arc<dyn ReadAt>,
        size: u64,
        kind: PackageKind,
    ) -> Result<AppInfo> {
        let package = package::parse(source.clone(), size, kind).await?;
        let icon = encode_icon(package.as_ref());

        let mut app = AppInfo::new(package.as_ref(), kind);
        app.none_icon = icon.is_none();

        self.storage
            .save(&app.package_storage_name(), source.as_ref(), size)
            .await?;

        if let (Some(name), Some(png)) = (app.icon_storage_name(), icon) {
            let len = png.len() as u64;
            if let Err(e) = self.storage.save(&name, &png, len).await {
                warn!(%name, error = %e, "cannot store icon");
            }
        }

        if kind == PackageKind::Ipa
            && let Some(base) = &self.public_url
            && let Err(e) = self.save_install_manifest(&app, base).await
        {
            warn!(identifier = %app.identifier, error = %e, "cannot store install manifest");
        }

        info!(
            id = %app.id,
            identifier = %app.identifier,
            version = %app.version,
            build = %app.build,
            size = app.size,
            "package stored"
        );
        Ok(app)
    }

    /// Ingest a forward-only upload stream of `size` bytes.
    ///
    /// The stream is wrapped in a [`SeekableCache`]; `name` (when given)
    /// selects the package type, otherwise it is sniffed from the archive.
    pub async fn ingest_upload<T>(
        &self,
        stream: T,
        size: u64,
        name: Option<&str>,
        mode: SpoolMode,
    ) -> Result<AppInfo>
    where
        T: AsyncRead + Unpin + Send + 'static,
    {
        let cache = Arc::new(SeekableCache::open(stream, mode)?);
        let result = async {
            let kind = PackageKind::detect(cache.clone(), size, name).await?;
            self.ingest(cache.clone(), size, kind).await
        }
        .await;
        if let Err(e) = cache.close().await {
            warn!(error = %e, "cannot release upload cache");
        }
        result
    }

    /// Ingest a file held by the remote peer, then report the stored
    /// metadata back to it.
    pub async fn ingest_remote<C>(&self, remote: Arc<RemoteFile<C>>) -> Result<AppInfo>
    where
        C: Channel + 'static,
    {
        let size = remote.size().await?;
        let name = remote.name().await?;
        info!(%name, size, "remote upload started");

        let kind = PackageKind::detect(remote.clone(), size, Some(&name)).await?;
        let app = self.ingest(remote.clone(), size, kind).await?;

        let Value::Object(result) =
            serde_json::to_value(&app).map_err(|e| Error::Transport(e.to_string()))?
        else {
            return Err(Error::Transport("package metadata is not an object".to_string()));
        };
        // package already stored
        if let Err(e) = remote.done(result).await {
            warn!(id = %app.id, error = %e, "cannot report result to peer");
        }
        Ok(app)
    }

    async fn save_install_manifest(&self, app: &AppInfo, base: &str) -> Result<()> {
        let pkg = self.storage.public_url(base, &app.package_storage_name())?;
        let icon = match app.icon_storage_name() {
            Some(name) => self.storage.public_url(base, &name)?,
            None => String::new(),
        };
        let xml = self
            .manifest
            .render(&InstallItem {
                pkg,
                icon,
                identifier: app.identifier.clone(),
                version: app.version.clone(),
                name: app.name.clone(),
            })
            .into_bytes();
        let len = xml.len() as u64;
        self.storage
            .save(&app.manifest_storage_name(), &xml, len)
            .await
    }
}

/// PNG bytes of the package icon; `None` when there is none or it cannot
/// be encoded.
fn encode_icon(package: &dyn Package) -> Option<Vec<u8>> {
    let icon = package.icon()?;
    let mut png = Vec::new();
    match icon.write_to(&mut Cursor::new(&mut png), ImageFormat::Png) {
        Ok(()) => Some(png),
        Err(e) => {
            warn!(error = %e, "cannot encode icon as PNG");
            None
        }
    }
}
