//! Chunk framing shared by binary XML and the resource table.
//!
//! Every structure starts with a little-endian header of
//! `type: u16, header_size: u16, size: u32`; containers nest chunks
//! directly after their own header.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

pub const STRING_POOL: u16 = 0x0001;
pub const TABLE: u16 = 0x0002;
pub const XML: u16 = 0x0003;
pub const XML_START_ELEMENT: u16 = 0x0102;
pub const XML_END_ELEMENT: u16 = 0x0103;
pub const XML_RESOURCE_MAP: u16 = 0x0180;
pub const TABLE_PACKAGE: u16 = 0x0200;
pub const TABLE_TYPE: u16 = 0x0201;

pub const NO_INDEX: u32 = 0xFFFF_FFFF;

const UTF8_FLAG: u32 = 1 << 8;

pub fn malformed(msg: impl Into<String>) -> Error {
    Error::Manifest(msg.into())
}

/// Bounds-checked sub-slice.
pub fn bytes(data: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    offset
        .checked_add(len)
        .and_then(|end| data.get(offset..end))
        .ok_or_else(|| malformed(format!("{len} bytes at {offset} run past the chunk")))
}

pub fn u16_at(data: &[u8], offset: usize) -> Result<u16> {
    Ok(LittleEndian::read_u16(bytes(data, offset, 2)?))
}

pub fn u32_at(data: &[u8], offset: usize) -> Result<u32> {
    Ok(LittleEndian::read_u32(bytes(data, offset, 4)?))
}

#[derive(Debug, Clone, Copy)]
pub struct Chunk<'a> {
    pub kind: u16,
    pub header_size: usize,
    /// The whole chunk, header included.
    pub data: &'a [u8],
}

impl<'a> Chunk<'a> {
    pub fn parse(data: &'a [u8], offset: usize) -> Result<Self> {
        let kind = u16_at(data, offset)?;
        let header_size = u16_at(data, offset + 2)? as usize;
        let size = u32_at(data, offset + 4)? as usize;
        if header_size < 8 || size < header_size {
            return Err(malformed(format!(
                "chunk {kind:#06x} has header {header_size} and size {size}"
            )));
        }
        Ok(Self {
            kind,
            header_size,
            data: bytes(data, offset, size)?,
        })
    }

    /// Chunks nested after this chunk's header.
    pub fn children(&self) -> Children<'a> {
        Children {
            data: self.data,
            pos: self.header_size,
        }
    }
}

pub struct Children<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Children<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl<'a> Iterator for Children<'a> {
    type Item = Result<Chunk<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos + 8 > self.data.len() {
            return None;
        }
        let chunk = Chunk::parse(self.data, self.pos);
        match &chunk {
            Ok(c) => self.pos += c.data.len(),
            Err(_) => self.pos = self.data.len(),
        }
        Some(chunk)
    }
}

/// A decoded string pool. Styles are ignored.
#[derive(Debug, Clone, Default)]
pub struct StringPool {
    strings: Vec<String>,
}

impl StringPool {
    pub fn parse(chunk: &Chunk<'_>) -> Result<Self> {
        let data = chunk.data;
        let count = u32_at(data, 8)? as usize;
        let flags = u32_at(data, 16)?;
        let strings_start = u32_at(data, 20)? as usize;
        let offsets = bytes(data, chunk.header_size, count.saturating_mul(4))?;

        let strings = offsets
            .chunks_exact(4)
            .map(|o| {
                let at = strings_start + LittleEndian::read_u32(o) as usize;
                if flags & UTF8_FLAG != 0 {
                    utf8_string(data, at)
                } else {
                    utf16_string(data, at)
                }
            })
            .collect::<Result<_>>()?;
        Ok(Self { strings })
    }

    pub fn get(&self, index: u32) -> Option<&str> {
        self.strings.get(index as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }
}

fn utf8_len(data: &[u8], at: &mut usize) -> Result<usize> {
    let first = bytes(data, *at, 1)?[0] as usize;
    *at += 1;
    if first & 0x80 == 0 {
        return Ok(first);
    }
    let second = bytes(data, *at, 1)?[0] as usize;
    *at += 1;
    Ok(((first & 0x7F) << 8) | second)
}

fn utf8_string(data: &[u8], mut at: usize) -> Result<String> {
    let _chars = utf8_len(data, &mut at)?;
    let len = utf8_len(data, &mut at)?;
    Ok(String::from_utf8_lossy(bytes(data, at, len)?).into_owned())
}

fn utf16_string(data: &[u8], mut at: usize) -> Result<String> {
    let mut len = u16_at(data, at)? as usize;
    at += 2;
    if len & 0x8000 != 0 {
        len = ((len & 0x7FFF) << 16) | u16_at(data, at)? as usize;
        at += 2;
    }
    let units: Vec<u16> = bytes(data, at, len.saturating_mul(2))?
        .chunks_exact(2)
        .map(LittleEndian::read_u16)
        .collect();
    Ok(String::from_utf16_lossy(&units))
}

/// A typed value (`Res_value`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResValue {
    pub data_type: u8,
    pub data: u32,
}

impl ResValue {
    pub const REFERENCE: u8 = 0x01;
    pub const STRING: u8 = 0x03;
    pub const INT_DEC: u8 = 0x10;
    pub const INT_HEX: u8 = 0x11;
    pub const BOOLEAN: u8 = 0x12;

    /// Parse the 8-byte `size, res0, dataType, data` layout.
    pub fn parse(data: &[u8], offset: usize) -> Result<Self> {
        let raw = bytes(data, offset, 8)?;
        Ok(Self {
            data_type: raw[3],
            data: LittleEndian::read_u32(&raw[4..8]),
        })
    }
}
