//! iOS application archives.
//!
//! Everything of interest lives in `Payload/<App>.app/`: the `Info.plist`
//! manifest, loose icon PNGs and, in newer builds, an `Assets.car` catalog.

use image::{DynamicImage, ImageFormat};
use plist::{Dictionary, Value};
use regex::Regex;
use std::io::Cursor;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

use super::{Package, car, cgbi};
use crate::error::{Error, Result};
use crate::io::ReadAt;
use crate::zip::{ZipArchive, ZipFileEntry};

fn manifest_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^Payload/[^/]+\.app/Info\.plist$").expect("valid regex"))
}

// Payload/Demo.app/Icon.png, Payload/Demo.app/Icon-72.png
fn legacy_icon_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^Payload/[^/]+\.app/Icon-?_?\w*(\d+(\.\d+)?)?\.png$").expect("valid regex")
    })
}

// Payload/Demo.app/AppIcon_TikTok76x76@2x~ipad.png
fn modern_icon_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^Payload/[^/]+\.app/AppIcon-?_?\w*?(\d+(\.\d+)?)x(\d+(\.\d+)?)(@\dx)?(~ipad)?\.png$")
            .expect("valid regex")
    })
}

fn asset_catalog_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^Payload/[^/]+\.app/Assets\.car$").expect("valid regex"))
}

/// Entries of interest found in one pass over the archive.
#[derive(Debug, Default)]
pub struct Classified<'a> {
    pub manifest: Option<&'a ZipFileEntry>,
    pub icons: Vec<&'a ZipFileEntry>,
    pub asset_catalog: Option<&'a ZipFileEntry>,
}

pub fn classify(entries: &[ZipFileEntry]) -> Classified<'_> {
    let mut found = Classified::default();
    for entry in entries {
        let name = entry.file_name.as_str();
        if manifest_pattern().is_match(name) {
            if let Some(previous) = found.manifest {
                debug!(previous = %previous.file_name, name, "several manifests, keeping the last");
            }
            found.manifest = Some(entry);
        } else if legacy_icon_pattern().is_match(name) || modern_icon_pattern().is_match(name) {
            found.icons.push(entry);
        } else if asset_catalog_pattern().is_match(name) {
            found.asset_catalog = Some(entry);
        }
    }
    found
}

/// Declared pixel size of an icon file, or `None` when its name carries
/// no usable size.
pub fn icon_size(path: &str) -> Option<u32> {
    if let Some(caps) = modern_icon_pattern().captures(path) {
        let width: f64 = caps.get(1)?.as_str().parse().ok()?;
        let scale = match caps.get(5).map(|m| m.as_str()) {
            Some("@2x") => 2.0,
            Some("@3x") => 3.0,
            _ => 1.0,
        };
        return Some((width * scale) as u32);
    }
    if legacy_icon_pattern().is_match(path) {
        let base = path.rsplit('/').next()?.strip_suffix(".png")?;
        return match base.rsplit_once('-') {
            Some((_, suffix)) => suffix.parse::<f64>().ok().map(|s| s as u32),
            None => Some(160),
        };
    }
    None
}

/// The biggest declared icon; ties keep the earlier entry. When no name
/// yields a size the first candidate is used.
pub fn select_icon<'a>(candidates: &[&'a ZipFileEntry]) -> Option<&'a ZipFileEntry> {
    let mut best: Option<(&ZipFileEntry, u32)> = None;
    for &candidate in candidates {
        match icon_size(&candidate.file_name) {
            Some(size) if best.is_none_or(|(_, max)| size > max) => best = Some((candidate, size)),
            Some(_) => {}
            None => debug!(name = %candidate.file_name, "icon name carries no size, skipped"),
        }
    }
    best.map(|(entry, _)| entry)
        .or_else(|| candidates.first().copied())
}

/// Fields read from `Info.plist`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InfoPlist {
    pub display_name: String,
    pub bundle_name: String,
    pub executable: String,
    pub short_version: String,
    pub identifier: String,
    pub version: String,
    pub channel: String,
    pub minimum_os_version: String,
    pub supported_platforms: Vec<String>,
    pub device_family: Vec<u64>,
}

fn string(dict: &Dictionary, key: &str) -> String {
    match dict.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Integer(i)) => i
            .as_signed()
            .map(|v| v.to_string())
            .or_else(|| i.as_unsigned().map(|v| v.to_string()))
            .unwrap_or_default(),
        Some(Value::Real(r)) => r.to_string(),
        _ => String::new(),
    }
}

impl InfoPlist {
    /// Decode an XML or binary property list.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let value = Value::from_reader(Cursor::new(data))
            .map_err(|e| Error::Manifest(format!("Info.plist: {e}")))?;
        let dict = value
            .as_dictionary()
            .ok_or_else(|| Error::Manifest("Info.plist is not a dictionary".to_string()))?;

        let supported_platforms = dict
            .get("CFBundleSupportedPlatforms")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_string)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let device_family = match dict.get("UIDeviceFamily") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_unsigned_integer)
                .collect(),
            Some(other) => other.as_unsigned_integer().into_iter().collect(),
            None => Vec::new(),
        };

        Ok(Self {
            display_name: string(dict, "CFBundleDisplayName"),
            bundle_name: string(dict, "CFBundleName"),
            executable: string(dict, "CFBundleExecutable"),
            short_version: string(dict, "CFBundleShortVersionString"),
            identifier: string(dict, "CFBundleIdentifier"),
            version: string(dict, "CFBundleVersion"),
            channel: string(dict, "channel"),
            minimum_os_version: string(dict, "MinimumOSVersion"),
            supported_platforms,
            device_family,
        })
    }

    /// First non-empty of display name, bundle name and executable.
    pub fn name(&self) -> &str {
        [&self.display_name, &self.bundle_name, &self.executable]
            .into_iter()
            .find(|s| !s.is_empty())
            .map_or("", String::as_str)
    }
}

/// A parsed iOS archive.
#[derive(Debug)]
pub struct Ipa {
    info: InfoPlist,
    icon: Option<DynamicImage>,
    size: u64,
}

impl Ipa {
    pub async fn parse<R: ReadAt + ?Sized>(reader: Arc<R>, size: u64) -> Result<Self> {
        let archive = ZipArchive::open(reader, size).await?;
        let found = classify(archive.entries());
        let manifest = found.manifest.ok_or(Error::ManifestNotFound)?;
        let info = InfoPlist::from_bytes(&archive.read(manifest).await?)?;
        debug!(
            identifier = %info.identifier,
            icons = found.icons.len(),
            asset_catalog = found.asset_catalog.is_some(),
            "manifest decoded"
        );

        let icon = load_icon(&archive, &found).await;
        Ok(Self { info, icon, size })
    }

    pub fn info(&self) -> &InfoPlist {
        &self.info
    }
}

/// Loose icons above this are not worth reading.
const MAX_ICON_LEN: u64 = 16 * 1024 * 1024;
const MAX_ASSET_CATALOG_LEN: u64 = 128 * 1024 * 1024;

fn within(entry: &ZipFileEntry, limit: u64) -> Result<()> {
    if entry.uncompressed_size > limit || entry.compressed_size > limit {
        return Err(Error::IconDecode(format!(
            "{} is larger than {limit} bytes",
            entry.file_name
        )));
    }
    Ok(())
}

async fn load_icon<R: ReadAt + ?Sized>(
    archive: &ZipArchive<R>,
    found: &Classified<'_>,
) -> Option<DynamicImage> {
    let entry = select_icon(&found.icons)?;
    let decoded = match within(entry, MAX_ICON_LEN) {
        Ok(()) => archive.read(entry).await.and_then(|data| decode_icon(&data)),
        Err(e) => Err(e),
    };
    match decoded {
        Ok(icon) => return Some(icon),
        Err(e) => warn!(name = %entry.file_name, error = %e, "cannot decode icon"),
    }

    let catalog = found.asset_catalog?;
    let extracted = match within(catalog, MAX_ASSET_CATALOG_LEN) {
        Ok(()) => archive.read(catalog).await.and_then(|data| car::app_icon(&data)),
        Err(e) => Err(e),
    };
    match extracted {
        Ok(icon) => Some(icon),
        Err(e) => {
            warn!(error = %e, "no icon in asset catalog");
            None
        }
    }
}

fn decode_icon(data: &[u8]) -> Result<DynamicImage> {
    match image::load_from_memory_with_format(data, ImageFormat::Png) {
        Ok(icon) if !cgbi::is_cgbi(data) => Ok(icon),
        Ok(_) => cgbi::decode(data),
        Err(png_err) => cgbi::decode(data)
            .map_err(|e| Error::IconDecode(format!("not a PNG ({png_err}) nor CgBI ({e})"))),
    }
}

impl Package for Ipa {
    fn name(&self) -> &str {
        self.info.name()
    }

    fn version(&self) -> &str {
        &self.info.short_version
    }

    fn identifier(&self) -> &str {
        &self.info.identifier
    }

    fn build(&self) -> &str {
        &self.info.version
    }

    fn channel(&self) -> &str {
        &self.info.channel
    }

    fn icon(&self) -> Option<&DynamicImage> {
        self.icon.as_ref()
    }

    fn size(&self) -> u64 {
        self.size
    }
}
