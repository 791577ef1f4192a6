//! Compiled binary XML (`AndroidManifest.xml`).

use super::chunk::{
    self, Chunk, NO_INDEX, ResValue, StringPool, XML, XML_END_ELEMENT, XML_RESOURCE_MAP,
    XML_START_ELEMENT, bytes, malformed, u16_at, u32_at,
};
use crate::error::Result;

/// Framework attribute ids, used when attribute names are stripped.
pub mod attr {
    pub const LABEL: u32 = 0x0101_0001;
    pub const ICON: u32 = 0x0101_0002;
    pub const NAME: u32 = 0x0101_0003;
    pub const VALUE: u32 = 0x0101_0024;
    pub const VERSION_CODE: u32 = 0x0101_021b;
    pub const VERSION_NAME: u32 = 0x0101_021c;
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    String(String),
    Reference(u32),
    Int(i32),
    Bool(bool),
    Other(ResValue),
}

#[derive(Debug, Clone)]
pub struct Attribute {
    pub name: String,
    pub resource_id: Option<u32>,
    pub value: AttrValue,
}

#[derive(Debug, Clone)]
pub struct Element {
    pub name: String,
    pub parent: Option<usize>,
    pub attributes: Vec<Attribute>,
}

impl Element {
    /// Look an attribute up by framework id, falling back to its name.
    pub fn attr(&self, name: &str, id: u32) -> Option<&AttrValue> {
        self.attributes
            .iter()
            .find(|a| a.resource_id == Some(id))
            .or_else(|| self.attributes.iter().find(|a| a.name == name))
            .map(|a| &a.value)
    }
}

/// Start elements in document order; parents are indices into the same list.
#[derive(Debug, Clone, Default)]
pub struct XmlDocument {
    pub elements: Vec<Element>,
}

impl XmlDocument {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let root = Chunk::parse(data, 0)?;
        if root.kind != XML {
            return Err(malformed(format!("not binary XML (chunk {:#06x})", root.kind)));
        }

        let mut pool = StringPool::default();
        let mut resource_ids: Vec<u32> = Vec::new();
        let mut elements: Vec<Element> = Vec::new();
        let mut open: Vec<usize> = Vec::new();

        for child in root.children() {
            let child = child?;
            match child.kind {
                chunk::STRING_POOL => pool = StringPool::parse(&child)?,
                XML_RESOURCE_MAP => {
                    resource_ids = child.data[child.header_size..]
                        .chunks_exact(4)
                        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                        .collect();
                }
                XML_START_ELEMENT => {
                    let element = start_element(&child, &pool, &resource_ids, open.last().copied())?;
                    open.push(elements.len());
                    elements.push(element);
                }
                XML_END_ELEMENT => {
                    open.pop();
                }
                _ => {}
            }
        }

        if elements.is_empty() {
            return Err(malformed("binary XML has no elements"));
        }
        Ok(Self { elements })
    }

    pub fn root(&self) -> Option<&Element> {
        self.elements.first()
    }

    /// Elements named `name` whose parent is the element at `parent`.
    pub fn children_named<'a>(
        &'a self,
        parent: usize,
        name: &'a str,
    ) -> impl Iterator<Item = (usize, &'a Element)> + 'a {
        self.elements
            .iter()
            .enumerate()
            .filter(move |(_, e)| e.parent == Some(parent) && e.name == name)
    }
}

fn pool_string(pool: &StringPool, index: u32) -> String {
    if index == NO_INDEX {
        return String::new();
    }
    pool.get(index).unwrap_or_default().to_string()
}

fn start_element(
    chunk: &Chunk<'_>,
    pool: &StringPool,
    resource_ids: &[u32],
    parent: Option<usize>,
) -> Result<Element> {
    // attribute extension follows the 16-byte node header
    let ext = chunk.header_size;
    let data = chunk.data;
    let name = pool_string(pool, u32_at(data, ext + 4)?);
    let attr_start = u16_at(data, ext + 8)? as usize;
    let attr_size = u16_at(data, ext + 10)? as usize;
    let attr_count = u16_at(data, ext + 12)? as usize;
    if attr_size < 20 {
        return Err(malformed(format!("attribute size {attr_size} in <{name}>")));
    }

    let mut attributes = Vec::with_capacity(attr_count);
    for i in 0..attr_count {
        let at = ext + attr_start + i * attr_size;
        let raw = bytes(data, at, attr_size)?;
        let name_index = u32_at(raw, 4)?;
        let raw_value = u32_at(raw, 8)?;
        let typed = ResValue::parse(raw, 12)?;

        let value = match typed.data_type {
            ResValue::STRING => AttrValue::String(pool_string(pool, typed.data)),
            _ if raw_value != NO_INDEX => AttrValue::String(pool_string(pool, raw_value)),
            ResValue::REFERENCE => AttrValue::Reference(typed.data),
            ResValue::INT_DEC | ResValue::INT_HEX => AttrValue::Int(typed.data as i32),
            ResValue::BOOLEAN => AttrValue::Bool(typed.data != 0),
            _ => AttrValue::Other(typed),
        };

        attributes.push(Attribute {
            name: pool_string(pool, name_index),
            resource_id: resource_ids.get(name_index as usize).copied(),
            value,
        });
    }

    Ok(Element {
        name,
        parent,
        attributes,
    })
}
