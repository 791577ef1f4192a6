//! Package metadata extraction.
//!
//! Both supported formats are zip containers with very different insides.
//! Each variant implements [`Package`]; callers pick the variant with
//! [`PackageKind`] and get a `Box<dyn Package>` back from [`parse`].

pub mod apk;
mod car;
mod cgbi;
pub mod ipa;

use chrono::{DateTime, Utc};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::io::ReadAt;
use crate::zip::{ZipArchive, ZipFileEntry};

pub use apk::Apk;
pub use ipa::Ipa;

/// Metadata common to every package format.
pub trait Package: Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> &str;
    fn identifier(&self) -> &str;
    fn build(&self) -> &str;
    fn channel(&self) -> &str;
    /// The application icon, if one could be decoded.
    fn icon(&self) -> Option<&DynamicImage>;
    /// Declared size of the uploaded bytes.
    fn size(&self) -> u64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum PackageKind {
    Ipa,
    Apk,
}

impl From<PackageKind> for u8 {
    fn from(kind: PackageKind) -> Self {
        match kind {
            PackageKind::Ipa => 0,
            PackageKind::Apk => 1,
        }
    }
}

impl TryFrom<u8> for PackageKind {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(PackageKind::Ipa),
            1 => Ok(PackageKind::Apk),
            other => Err(format!("unknown package type {other}")),
        }
    }
}

impl PackageKind {
    /// Pick the kind from a file name extension, ignoring case.
    pub fn from_name(name: &str) -> Option<Self> {
        let ext = name.rsplit_once('.')?.1.to_ascii_lowercase();
        match ext.as_str() {
            "ipa" => Some(PackageKind::Ipa),
            "apk" => Some(PackageKind::Apk),
            _ => None,
        }
    }

    /// Guess the kind from the archive's entry list.
    pub fn sniff(entries: &[ZipFileEntry]) -> Option<Self> {
        if entries.iter().any(|e| e.file_name == "AndroidManifest.xml") {
            Some(PackageKind::Apk)
        } else if entries.iter().any(|e| e.file_name.starts_with("Payload/")) {
            Some(PackageKind::Ipa)
        } else {
            None
        }
    }

    /// Use the name when it is conclusive, otherwise look inside the archive.
    pub async fn detect<R>(reader: Arc<R>, size: u64, name: Option<&str>) -> Result<Self>
    where
        R: ReadAt + ?Sized,
    {
        if let Some(kind) = name.and_then(Self::from_name) {
            return Ok(kind);
        }
        let archive = ZipArchive::open(reader, size).await?;
        let kind = Self::sniff(archive.entries())
            .ok_or_else(|| Error::UnknownPackageType(name.unwrap_or_default().to_string()))?;
        debug!(?kind, "package type sniffed from entries");
        Ok(kind)
    }

    pub fn extension(&self) -> &'static str {
        match self {
            PackageKind::Ipa => "ipa",
            PackageKind::Apk => "apk",
        }
    }
}

/// Parse `size` bytes of `reader` as a package of the given kind.
pub async fn parse<R>(reader: Arc<R>, size: u64, kind: PackageKind) -> Result<Box<dyn Package>>
where
    R: ReadAt + ?Sized,
{
    let package: Box<dyn Package> = match kind {
        PackageKind::Ipa => Box::new(Ipa::parse(reader, size).await?),
        PackageKind::Apk => Box::new(Apk::parse(reader, size).await?),
    };
    Ok(package)
}

/// The record kept for every stored package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    pub identifier: String,
    pub build: String,
    pub channel: String,
    pub date: DateTime<Utc>,
    pub size: u64,
    pub none_icon: bool,
    #[serde(rename = "type")]
    pub kind: PackageKind,
}

impl AppInfo {
    pub fn new(package: &dyn Package, kind: PackageKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: package.name().to_string(),
            version: package.version().to_string(),
            identifier: package.identifier().to_string(),
            build: package.build().to_string(),
            channel: package.channel().to_string(),
            date: Utc::now(),
            size: package.size(),
            none_icon: package.icon().is_none(),
            kind,
        }
    }

    fn object_dir(&self) -> String {
        format!("{}/{}", self.identifier, self.id)
    }

    /// Where the package bytes are stored, e.g. `com.example/<id>/ipa.ipa`.
    pub fn package_storage_name(&self) -> String {
        let ext = self.kind.extension();
        format!("{}/{ext}.{ext}", self.object_dir())
    }

    /// Where the icon is stored; `None` for packages without one.
    pub fn icon_storage_name(&self) -> Option<String> {
        (!self.none_icon).then(|| format!("{}/icon.png", self.object_dir()))
    }

    pub fn manifest_storage_name(&self) -> String {
        format!("{}/manifest.plist", self.object_dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zip::CompressionMethod;
    use serde_json::json;

    fn entry(name: &str) -> ZipFileEntry {
        ZipFileEntry {
            file_name: name.to_string(),
            compression_method: CompressionMethod::Stored,
            compressed_size: 0,
            uncompressed_size: 0,
            crc32: 0,
            lfh_offset: 0,
            is_directory: name.ends_with('/'),
        }
    }

    struct Fixed(Option<DynamicImage>);

    impl Package for Fixed {
        fn name(&self) -> &str {
            "Demo"
        }
        fn version(&self) -> &str {
            "1.2"
        }
        fn identifier(&self) -> &str {
            "com.example.demo"
        }
        fn build(&self) -> &str {
            "12"
        }
        fn channel(&self) -> &str {
            ""
        }
        fn icon(&self) -> Option<&DynamicImage> {
            self.0.as_ref()
        }
        fn size(&self) -> u64 {
            1024
        }
    }

    #[test]
    fn test_kind_from_name() {
        assert_eq!(PackageKind::from_name("Demo.IPA"), Some(PackageKind::Ipa));
        assert_eq!(PackageKind::from_name("release/app.apk"), Some(PackageKind::Apk));
        assert_eq!(PackageKind::from_name("archive.zip"), None);
        assert_eq!(PackageKind::from_name("ipa"), None);
    }

    #[test]
    fn test_kind_sniffed_from_entries() {
        let ios = [entry("Payload/"), entry("Payload/Demo.app/Info.plist")];
        let android = [entry("AndroidManifest.xml"), entry("classes.dex")];
        assert_eq!(PackageKind::sniff(&ios), Some(PackageKind::Ipa));
        assert_eq!(PackageKind::sniff(&android), Some(PackageKind::Apk));
        assert_eq!(PackageKind::sniff(&[entry("readme.txt")]), None);
    }

    #[test]
    fn test_app_info_json_and_storage_names() {
        let info = AppInfo::new(&Fixed(None), PackageKind::Ipa);
        assert!(info.none_icon);
        assert_eq!(info.icon_storage_name(), None);
        assert_eq!(
            info.package_storage_name(),
            format!("com.example.demo/{}/ipa.ipa", info.id)
        );

        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["noneIcon"], json!(true));
        assert_eq!(value["type"], json!(0));
        assert_eq!(value["identifier"], json!("com.example.demo"));
        assert_eq!(value["size"], json!(1024));

        let with_icon = AppInfo::new(
            &Fixed(Some(DynamicImage::new_rgba8(1, 1))),
            PackageKind::Apk,
        );
        assert!(!with_icon.none_icon);
        assert!(with_icon.package_storage_name().ends_with("/apk.apk"));
        assert!(with_icon.icon_storage_name().unwrap().ends_with("/icon.png"));
        assert_ne!(info.id, with_icon.id);
    }
}
