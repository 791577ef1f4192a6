//! Decoder for the compressed PNG variant found in iOS bundles.
//!
//! Xcode rewrites bundle PNGs: a `CgBI` chunk precedes `IHDR`, the image
//! data is raw deflate without a zlib header, channels are stored as BGRA
//! and colors are premultiplied by alpha. Standard decoders reject these
//! files, so the steps are undone here before handing pixels to `image`.

use byteorder::{BigEndian, ByteOrder};
use flate2::read::DeflateDecoder;
use image::{DynamicImage, RgbImage, RgbaImage};
use std::io::Read;

use crate::error::{Error, Result};

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

/// Largest decoded scanline buffer accepted.
const MAX_RAW_LEN: usize = 256 * 1024 * 1024;

fn invalid(msg: impl Into<String>) -> Error {
    Error::IconDecode(msg.into())
}

struct Header {
    width: u32,
    height: u32,
    bit_depth: u8,
    color_type: u8,
    interlace: u8,
}

struct Chunks<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for Chunks<'a> {
    type Item = Result<(&'a [u8], &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos + 8 > self.data.len() {
            return None;
        }
        let len = BigEndian::read_u32(&self.data[self.pos..]) as usize;
        let kind = &self.data[self.pos + 4..self.pos + 8];
        let start = self.pos + 8;
        // body plus the trailing CRC
        let Some(end) = start.checked_add(len).filter(|end| end + 4 <= self.data.len()) else {
            self.pos = self.data.len();
            return Some(Err(invalid("truncated PNG chunk")));
        };
        self.pos = end + 4;
        Some(Ok((kind, &self.data[start..end])))
    }
}

fn chunks(data: &[u8]) -> Result<Chunks<'_>> {
    if !data.starts_with(PNG_SIGNATURE) {
        return Err(invalid("missing PNG signature"));
    }
    Ok(Chunks {
        data,
        pos: PNG_SIGNATURE.len(),
    })
}

/// True when the file carries the `CgBI` marker chunk.
pub fn is_cgbi(data: &[u8]) -> bool {
    chunks(data)
        .ok()
        .and_then(|mut c| c.next())
        .is_some_and(|chunk| matches!(chunk, Ok((kind, _)) if kind == b"CgBI"))
}

pub fn decode(data: &[u8]) -> Result<DynamicImage> {
    let mut header = None;
    let mut idat = Vec::new();
    let mut marked = false;

    for chunk in chunks(data)? {
        let (kind, body) = chunk?;
        match kind {
            b"CgBI" => marked = true,
            b"IHDR" => {
                if body.len() < 13 {
                    return Err(invalid("short IHDR"));
                }
                header = Some(Header {
                    width: BigEndian::read_u32(&body[0..4]),
                    height: BigEndian::read_u32(&body[4..8]),
                    bit_depth: body[8],
                    color_type: body[9],
                    interlace: body[12],
                });
            }
            b"IDAT" => idat.extend_from_slice(body),
            b"IEND" => break,
            _ => {}
        }
    }

    if !marked {
        return Err(invalid("no CgBI chunk"));
    }
    let header = header.ok_or_else(|| invalid("missing IHDR"))?;
    if header.bit_depth != 8 || header.interlace != 0 {
        return Err(invalid(format!(
            "unsupported bit depth {} / interlace {}",
            header.bit_depth, header.interlace
        )));
    }
    let channels = match header.color_type {
        2 => 3,
        6 => 4,
        other => return Err(invalid(format!("unsupported color type {other}"))),
    };

    let stride = (header.width as usize)
        .checked_mul(channels)
        .ok_or_else(|| invalid("image too wide"))?;
    let raw_len = (stride + 1)
        .checked_mul(header.height as usize)
        .filter(|len| *len <= MAX_RAW_LEN)
        .ok_or_else(|| invalid("image too large"))?;

    let mut raw = Vec::with_capacity(raw_len);
    DeflateDecoder::new(idat.as_slice())
        .take(raw_len as u64)
        .read_to_end(&mut raw)
        .map_err(|e| invalid(format!("cannot inflate image data: {e}")))?;
    if raw.len() < raw_len {
        return Err(invalid("image data ends early"));
    }

    let mut pixels = unfilter(&raw, stride, channels, header.height as usize)?;
    for px in pixels.chunks_exact_mut(channels) {
        px.swap(0, 2);
        if channels == 4 {
            unpremultiply(px);
        }
    }

    let image = if channels == 4 {
        RgbaImage::from_raw(header.width, header.height, pixels).map(DynamicImage::ImageRgba8)
    } else {
        RgbImage::from_raw(header.width, header.height, pixels).map(DynamicImage::ImageRgb8)
    };
    image.ok_or_else(|| invalid("pixel buffer does not match dimensions"))
}

fn unpremultiply(px: &mut [u8]) {
    let alpha = px[3] as u32;
    if alpha == 0 {
        px[..3].fill(0);
        return;
    }
    for c in &mut px[..3] {
        *c = ((*c as u32 * 255 + alpha / 2) / alpha).min(255) as u8;
    }
}

/// Undo per-scanline PNG filtering, dropping the filter bytes.
fn unfilter(raw: &[u8], stride: usize, bpp: usize, height: usize) -> Result<Vec<u8>> {
    let mut out = vec![0u8; stride * height];
    for row in 0..height {
        let line = &raw[row * (stride + 1)..(row + 1) * (stride + 1)];
        let filter = line[0];
        let src = &line[1..];
        let (done, rest) = out.split_at_mut(row * stride);
        let prev = if row == 0 {
            None
        } else {
            Some(&done[(row - 1) * stride..])
        };
        let cur = &mut rest[..stride];

        for i in 0..stride {
            let left = if i >= bpp { cur[i - bpp] } else { 0 };
            let up = prev.map_or(0, |p| p[i]);
            let up_left = match prev {
                Some(p) if i >= bpp => p[i - bpp],
                _ => 0,
            };
            let predicted = match filter {
                0 => 0,
                1 => left,
                2 => up,
                3 => ((left as u16 + up as u16) / 2) as u8,
                4 => paeth(left, up, up_left),
                other => return Err(invalid(format!("bad filter type {other} in row {row}"))),
            };
            cur[i] = src[i].wrapping_add(predicted);
        }
    }
    Ok(out)
}

fn paeth(a: u8, b: u8, c: u8) -> u8 {
    let p = a as i16 + b as i16 - c as i16;
    let pa = (p - a as i16).abs();
    let pb = (p - b as i16).abs();
    let pc = (p - c as i16).abs();
    if pa <= pb && pa <= pc {
        a
    } else if pb <= pc {
        b
    } else {
        c
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flate2::Crc;
    use flate2::write::DeflateEncoder;
    use image::GenericImageView;
    use std::io::Write;

    fn chunk(out: &mut Vec<u8>, kind: &[u8; 4], body: &[u8]) {
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(kind);
        out.extend_from_slice(body);
        let mut crc = Crc::new();
        crc.update(kind);
        crc.update(body);
        out.extend_from_slice(&crc.sum().to_be_bytes());
    }

    /// Encode filtered BGRA scanlines the way Xcode does.
    pub(crate) fn build_cgbi(width: u32, height: u32, scanlines: &[u8]) -> Vec<u8> {
        let mut out = PNG_SIGNATURE.to_vec();
        chunk(&mut out, b"CgBI", &[0x50, 0x00, 0x20, 0x06]);
        let mut ihdr = Vec::new();
        ihdr.extend_from_slice(&width.to_be_bytes());
        ihdr.extend_from_slice(&height.to_be_bytes());
        ihdr.extend_from_slice(&[8, 6, 0, 0, 0]);
        chunk(&mut out, b"IHDR", &ihdr);

        let mut encoder = DeflateEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(scanlines).unwrap();
        chunk(&mut out, b"IDAT", &encoder.finish().unwrap());
        chunk(&mut out, b"IEND", &[]);
        out
    }

    #[test]
    fn test_decodes_swapped_premultiplied_pixels() {
        // 2x2 image. Row 0 unfiltered, row 1 uses the Up filter.
        #[rustfmt::skip]
        let scanlines = [
            0, 0, 0, 255, 255, 0, 0, 64, 128,
            2, 255, 0, 0, 0, 0, 0, 0, 0,
        ];
        let data = build_cgbi(2, 2, &scanlines);
        assert!(is_cgbi(&data));

        let img = decode(&data).unwrap();
        assert_eq!(img.dimensions(), (2, 2));
        assert_eq!(img.get_pixel(0, 0).0, [255, 0, 0, 255]);
        assert_eq!(img.get_pixel(1, 0).0, [128, 0, 0, 128]);
        // blue added on top of the red above
        assert_eq!(img.get_pixel(0, 1).0, [255, 0, 255, 255]);
        assert_eq!(img.get_pixel(1, 1).0, [128, 0, 0, 128]);
    }

    #[test]
    fn test_plain_png_is_not_cgbi() {
        let mut png = Vec::new();
        DynamicImage::new_rgba8(1, 1)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        assert!(!is_cgbi(&png));
        assert!(matches!(decode(&png), Err(Error::IconDecode(_))));
        assert!(matches!(decode(b"not a png"), Err(Error::IconDecode(_))));
    }

    #[test]
    fn test_truncated_image_data() {
        let mut data = build_cgbi(4, 4, &[0; 5]);
        assert!(matches!(decode(&data), Err(Error::IconDecode(_))));
        data.truncate(20);
        assert!(decode(&data).is_err());
    }

    #[test]
    fn test_paeth_predictor() {
        assert_eq!(paeth(10, 20, 10), 20);
        assert_eq!(paeth(20, 10, 10), 20);
        assert_eq!(paeth(0, 0, 0), 0);
    }
}
