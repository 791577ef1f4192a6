//! Minimal reader for compiled asset catalogs (`Assets.car`).
//!
//! Newer bundles ship the app icon only inside the catalog. The file is a
//! BOM store (big-endian) whose `RENDITIONS` tree maps rendition keys to CSI
//! records (little-endian). Only the records needed to recover an icon are
//! understood: raw embedded image files and ARGB bitmaps stored either
//! uncompressed or zlib-compressed.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use flate2::read::ZlibDecoder;
use image::{DynamicImage, RgbaImage};
use std::io::Read;
use tracing::debug;

use crate::error::{Error, Result};

const BOM_MAGIC: &[u8] = b"BOMStore";
const BOM_HEADER_LEN: usize = 32;
const CSI_MAGIC: &[u8] = b"ISTC";
const CSI_HEADER_LEN: usize = 184;
const CSI_NAME: std::ops::Range<usize> = 40..168;
const BITMAP_MAGIC: &[u8] = b"MLEC";
const RAW_MAGIC: &[u8] = b"DWAR";
const PIXEL_FORMAT_ARGB: u32 = u32::from_be_bytes(*b"ARGB");
const PIXEL_FORMAT_DATA: u32 = u32::from_be_bytes(*b"DATA");
/// Largest decoded bitmap accepted, padding included.
const MAX_BITMAP_LEN: usize = 64 * 1024 * 1024;

fn invalid(msg: impl Into<String>) -> Error {
    Error::IconDecode(format!("asset catalog: {}", msg.into()))
}

fn slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    offset
        .checked_add(len)
        .and_then(|end| data.get(offset..end))
        .ok_or_else(|| invalid("record out of bounds"))
}

struct Bom<'a> {
    data: &'a [u8],
    blocks: Vec<(u32, u32)>,
    vars: Vec<(String, u32)>,
}

impl<'a> Bom<'a> {
    fn parse(data: &'a [u8]) -> Result<Self> {
        let header = slice(data, 0, BOM_HEADER_LEN)?;
        if &header[..8] != BOM_MAGIC {
            return Err(invalid("not a BOM store"));
        }
        let index_offset = BigEndian::read_u32(&header[16..20]) as usize;
        let vars_offset = BigEndian::read_u32(&header[24..28]) as usize;

        let count = BigEndian::read_u32(slice(data, index_offset, 4)?) as usize;
        let table = slice(data, index_offset + 4, count.saturating_mul(8))?;
        let blocks = table
            .chunks_exact(8)
            .map(|b| (BigEndian::read_u32(&b[0..4]), BigEndian::read_u32(&b[4..8])))
            .collect();

        let count = BigEndian::read_u32(slice(data, vars_offset, 4)?) as usize;
        let mut pos = vars_offset + 4;
        let mut vars = Vec::new();
        for _ in 0..count {
            let head = slice(data, pos, 5)?;
            let index = BigEndian::read_u32(&head[0..4]);
            let name_len = head[4] as usize;
            let name = slice(data, pos + 5, name_len)?;
            vars.push((String::from_utf8_lossy(name).into_owned(), index));
            pos += 5 + name_len;
        }

        Ok(Self { data, blocks, vars })
    }

    fn block(&self, index: u32) -> Result<&'a [u8]> {
        let &(address, len) = self
            .blocks
            .get(index as usize)
            .ok_or_else(|| invalid(format!("missing block {index}")))?;
        slice(self.data, address as usize, len as usize)
    }

    fn var(&self, name: &str) -> Option<u32> {
        self.vars.iter().find(|(n, _)| n == name).map(|(_, i)| *i)
    }

    /// Values stored in the leaves of a BOM tree, in key order.
    fn tree_values(&self, tree_index: u32) -> Result<Vec<&'a [u8]>> {
        let tree = self.block(tree_index)?;
        if tree.len() < 12 || &tree[..4] != b"tree" {
            return Err(invalid("bad tree header"));
        }
        let mut node = BigEndian::read_u32(&tree[8..12]);

        // descend along the first child to the leftmost leaf
        let mut hops = 0;
        loop {
            let paths = self.block(node)?;
            if paths.len() < 12 {
                return Err(invalid("short paths block"));
            }
            if BigEndian::read_u16(&paths[0..2]) != 0 {
                break;
            }
            if paths.len() < 20 {
                return Err(invalid("empty branch"));
            }
            node = BigEndian::read_u32(&paths[12..16]);
            hops += 1;
            if hops > self.blocks.len() {
                return Err(invalid("tree does not terminate"));
            }
        }

        let mut values = Vec::new();
        let mut visited = 0;
        while node != 0 {
            let paths = self.block(node)?;
            if paths.len() < 12 {
                return Err(invalid("short paths block"));
            }
            let count = BigEndian::read_u16(&paths[2..4]) as usize;
            let forward = BigEndian::read_u32(&paths[4..8]);
            let pairs = slice(paths, 12, count * 8)?;
            for pair in pairs.chunks_exact(8) {
                values.push(self.block(BigEndian::read_u32(&pair[0..4]))?);
            }
            node = forward;
            visited += 1;
            if visited > self.blocks.len() {
                return Err(invalid("leaf chain does not terminate"));
            }
        }
        Ok(values)
    }
}

struct Rendition<'a> {
    name: String,
    width: u32,
    height: u32,
    pixel_format: u32,
    payload: &'a [u8],
}

impl<'a> Rendition<'a> {
    fn parse(record: &'a [u8]) -> Result<Self> {
        let header = slice(record, 0, CSI_HEADER_LEN)?;
        if &header[..4] != CSI_MAGIC {
            return Err(invalid("not a CSI record"));
        }
        let name = &header[CSI_NAME];
        let name_len = name.iter().position(|&b| b == 0).unwrap_or(name.len());
        let tlv_len = LittleEndian::read_u32(&header[168..172]) as usize;
        let payload_len = LittleEndian::read_u32(&header[180..184]) as usize;

        Ok(Self {
            name: String::from_utf8_lossy(&name[..name_len]).into_owned(),
            width: LittleEndian::read_u32(&header[12..16]),
            height: LittleEndian::read_u32(&header[16..20]),
            pixel_format: LittleEndian::read_u32(&header[24..28]),
            payload: slice(record, CSI_HEADER_LEN + tlv_len, payload_len)?,
        })
    }

    fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    fn decode(&self) -> Result<DynamicImage> {
        let magic = self.payload.get(..4).ok_or_else(|| invalid("empty rendition"))?;
        if magic == RAW_MAGIC {
            let len = LittleEndian::read_u32(slice(self.payload, 8, 4)?) as usize;
            let file = slice(self.payload, 12, len)?;
            return image::load_from_memory(file).map_err(|e| invalid(e.to_string()));
        }
        if magic == BITMAP_MAGIC && self.pixel_format == PIXEL_FORMAT_ARGB {
            return self.decode_bitmap();
        }
        Err(invalid(format!(
            "unsupported rendition {:?} for {}",
            String::from_utf8_lossy(magic),
            self.name
        )))
    }

    fn decode_bitmap(&self) -> Result<DynamicImage> {
        let head = slice(self.payload, 0, 16)?;
        let compression = LittleEndian::read_u32(&head[8..12]);
        let len = LittleEndian::read_u32(&head[12..16]) as usize;
        let body = slice(self.payload, 16, len)?;

        let expected = (self.width as usize)
            .checked_mul(self.height as usize)
            .and_then(|area| area.checked_mul(4))
            .filter(|len| *len <= MAX_BITMAP_LEN)
            .ok_or_else(|| {
                invalid(format!("bitmap {}x{} is too large", self.width, self.height))
            })?;
        let pixels = match compression {
            0 => body.to_vec(),
            2 => {
                let mut out = Vec::new();
                ZlibDecoder::new(body)
                    .take(MAX_BITMAP_LEN as u64 + 1)
                    .read_to_end(&mut out)
                    .map_err(|e| invalid(format!("cannot inflate {}: {e}", self.name)))?;
                if out.len() > MAX_BITMAP_LEN {
                    return Err(invalid(format!("{} inflates past the size limit", self.name)));
                }
                out
            }
            other => return Err(invalid(format!("compression {other} is not supported"))),
        };

        let (width, height) = (self.width as usize, self.height as usize);
        if height == 0 || pixels.len() / height < width * 4 {
            return Err(invalid(format!("bitmap too short for {width}x{height}")));
        }
        // rows may be padded
        let stride = pixels.len() / height;
        let mut rgba = Vec::with_capacity(expected);
        for row in pixels.chunks_exact(stride).take(height) {
            for px in row[..width * 4].chunks_exact(4) {
                let (b, g, r, a) = (px[0], px[1], px[2], px[3]);
                rgba.extend_from_slice(&[unpremultiply(r, a), unpremultiply(g, a), unpremultiply(b, a), a]);
            }
        }
        RgbaImage::from_raw(self.width, self.height, rgba)
            .map(DynamicImage::ImageRgba8)
            .ok_or_else(|| invalid("pixel buffer does not match dimensions"))
    }
}

fn unpremultiply(c: u8, a: u8) -> u8 {
    if a == 0 {
        return 0;
    }
    ((c as u32 * 255 + a as u32 / 2) / a as u32).min(255) as u8
}

/// Extract the largest `AppIcon` image from a compiled asset catalog.
pub fn app_icon(data: &[u8]) -> Result<DynamicImage> {
    let bom = Bom::parse(data)?;
    let tree = bom
        .var("RENDITIONS")
        .ok_or_else(|| invalid("no RENDITIONS tree"))?;

    let mut best: Option<Rendition> = None;
    for record in bom.tree_values(tree)? {
        let Ok(rendition) = Rendition::parse(record) else {
            continue;
        };
        if !rendition.name.starts_with("AppIcon")
            || !matches!(rendition.pixel_format, PIXEL_FORMAT_ARGB | PIXEL_FORMAT_DATA)
        {
            continue;
        }
        if best.as_ref().is_none_or(|b| rendition.area() > b.area()) {
            best = Some(rendition);
        }
    }

    let best = best.ok_or_else(|| invalid("no AppIcon rendition"))?;
    debug!(name = %best.name, width = best.width, height = best.height, "icon taken from asset catalog");
    best.decode()
}
