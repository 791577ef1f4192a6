//! Android application packages.
//!
//! Metadata comes from the compiled `AndroidManifest.xml`; labels and the
//! launcher icon usually point into `resources.arsc`.

mod arsc;
mod axml;
mod chunk;

use image::DynamicImage;
use std::sync::Arc;
use tracing::{debug, warn};

use super::Package;
use crate::error::{Error, Result};
use crate::io::ReadAt;
use crate::zip::ZipArchive;

pub use arsc::ResourceTable;
pub use axml::{AttrValue, Element, XmlDocument};

use axml::attr;

const MANIFEST: &str = "AndroidManifest.xml";
const RESOURCES: &str = "resources.arsc";

/// Icons are looked up for this screen density (dpi).
pub const ICON_DENSITY: u16 = 720;

/// Values taken from the manifest, with references already resolved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    pub package: String,
    pub version_name: String,
    pub version_code: String,
    pub label: String,
    pub channel: String,
    /// Unresolved `android:icon` of the application.
    pub icon: Option<u32>,
}

impl Manifest {
    pub fn from_document(doc: &XmlDocument, table: Option<&ResourceTable>) -> Result<Self> {
        let root = doc
            .root()
            .filter(|e| e.name == "manifest")
            .ok_or_else(|| Error::Manifest("root element is not <manifest>".to_string()))?;
        let text = |value: Option<&AttrValue>| render(value, table);

        let mut manifest = Manifest {
            package: text(root.attr("package", 0)),
            version_name: text(root.attr("versionName", attr::VERSION_NAME)),
            version_code: text(root.attr("versionCode", attr::VERSION_CODE)),
            ..Default::default()
        };

        if let Some((app_index, app)) = doc.children_named(0, "application").next() {
            manifest.label = text(app.attr("label", attr::LABEL));
            manifest.icon = match app.attr("icon", attr::ICON) {
                Some(AttrValue::Reference(id)) => Some(*id),
                _ => None,
            };
            manifest.channel = doc
                .children_named(app_index, "meta-data")
                .find(|(_, meta)| text(meta.attr("name", attr::NAME)) == "channel")
                .map(|(_, meta)| text(meta.attr("value", attr::VALUE)))
                .unwrap_or_default();
        }
        Ok(manifest)
    }
}

fn render(value: Option<&AttrValue>, table: Option<&ResourceTable>) -> String {
    match value {
        Some(AttrValue::String(s)) => s.clone(),
        Some(AttrValue::Int(i)) => i.to_string(),
        Some(AttrValue::Bool(b)) => b.to_string(),
        Some(AttrValue::Reference(id)) => table
            .and_then(|t| t.resolve_string(*id))
            .unwrap_or_default(),
        Some(AttrValue::Other(_)) | None => String::new(),
    }
}

/// A parsed Android package.
#[derive(Debug)]
pub struct Apk {
    manifest: Manifest,
    icon: Option<DynamicImage>,
    size: u64,
}

impl Apk {
    pub async fn parse<R: ReadAt + ?Sized>(reader: Arc<R>, size: u64) -> Result<Self> {
        let archive = ZipArchive::open(reader, size).await?;
        let entry = archive.find(MANIFEST).ok_or(Error::ManifestNotFound)?;
        let doc = XmlDocument::parse(&archive.read(entry).await?)?;

        let table = match archive.find(RESOURCES) {
            Some(entry) => match archive
                .read(entry)
                .await
                .and_then(|data| ResourceTable::parse(&data))
            {
                Ok(table) => Some(table),
                Err(e) => {
                    warn!(error = %e, "cannot read resource table, references stay unresolved");
                    None
                }
            },
            None => None,
        };

        let manifest = Manifest::from_document(&doc, table.as_ref())?;
        debug!(package = %manifest.package, version = %manifest.version_name, "manifest decoded");

        let icon = match (manifest.icon, &table) {
            (Some(id), Some(table)) => load_icon(&archive, table, id).await,
            _ => None,
        };
        Ok(Self {
            manifest,
            icon,
            size,
        })
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }
}

async fn load_icon<R: ReadAt + ?Sized>(
    archive: &ZipArchive<R>,
    table: &ResourceTable,
    id: u32,
) -> Option<DynamicImage> {
    for path in table.resolve_files(id, ICON_DENSITY) {
        let lower = path.to_ascii_lowercase();
        if !(lower.ends_with(".png") || lower.ends_with(".webp")) {
            debug!(%path, "icon variant is not a bitmap, skipped");
            continue;
        }
        let Some(entry) = archive.find(&path) else {
            debug!(%path, "icon variant missing from archive");
            continue;
        };
        match archive
            .read(entry)
            .await
            .and_then(|data| image::load_from_memory(&data).map_err(|e| Error::IconDecode(e.to_string())))
        {
            Ok(icon) => return Some(icon),
            Err(e) => warn!(%path, error = %e, "cannot decode icon"),
        }
    }
    None
}

impl Package for Apk {
    fn name(&self) -> &str {
        &self.manifest.label
    }

    fn version(&self) -> &str {
        &self.manifest.version_name
    }

    fn identifier(&self) -> &str {
        &self.manifest.package
    }

    fn build(&self) -> &str {
        &self.manifest.version_code
    }

    fn channel(&self) -> &str {
        &self.manifest.channel
    }

    fn icon(&self) -> Option<&DynamicImage> {
        self.icon.as_ref()
    }

    fn size(&self) -> u64 {
        self.size
    }
}
