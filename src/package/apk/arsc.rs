//! Compiled resource table (`resources.arsc`).
//!
//! Only simple values are kept: enough to turn a label reference into a
//! string and an icon reference into per-density file paths.

use std::cmp::Reverse;

use super::chunk::{
    self, Chunk, NO_INDEX, ResValue, StringPool, TABLE, TABLE_PACKAGE, TABLE_TYPE, bytes,
    malformed, u16_at, u32_at,
};
use crate::error::Result;

const FLAG_SPARSE: u8 = 0x01;
const FLAG_OFFSET16: u8 = 0x02;

const ENTRY_COMPLEX: u16 = 0x0001;
const ENTRY_COMPACT: u16 = 0x0008;

const DENSITY_DEFAULT: u16 = 0;
const DENSITY_ANY: u16 = 0xFFFE;
const DENSITY_NONE: u16 = 0xFFFF;

/// Reference chains longer than this are treated as cycles.
const MAX_REFERENCE_DEPTH: usize = 8;

/// The parts of `ResTable_config` that matter here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub density: u16,
    /// No qualifier set at all.
    pub is_default: bool,
}

#[derive(Debug)]
struct TypeChunk {
    package_id: u8,
    type_id: u8,
    config: Config,
    entries: Vec<(u16, ResValue)>,
}

#[derive(Debug, Default)]
pub struct ResourceTable {
    strings: StringPool,
    types: Vec<TypeChunk>,
}

impl ResourceTable {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let root = Chunk::parse(data, 0)?;
        if root.kind != TABLE {
            return Err(malformed(format!("not a resource table (chunk {:#06x})", root.kind)));
        }

        let mut table = Self::default();
        for child in root.children() {
            let child = child?;
            match child.kind {
                chunk::STRING_POOL => table.strings = StringPool::parse(&child)?,
                TABLE_PACKAGE => {
                    let package_id = u32_at(child.data, 8)? as u8;
                    for inner in child.children() {
                        let inner = inner?;
                        if inner.kind == TABLE_TYPE {
                            table.types.push(parse_type(&inner, package_id)?);
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(table)
    }

    /// Every value recorded for a resource id, one per configuration.
    pub fn values(&self, id: u32) -> impl Iterator<Item = (Config, ResValue)> + '_ {
        let package_id = (id >> 24) as u8;
        let type_id = (id >> 16) as u8;
        let entry = id as u16;
        self.types
            .iter()
            .filter(move |t| t.package_id == package_id && t.type_id == type_id)
            .filter_map(move |t| {
                t.entries
                    .iter()
                    .find(|(index, _)| *index == entry)
                    .map(|(_, value)| (t.config, *value))
            })
    }

    /// Resolve a string resource in the default configuration, following
    /// references.
    pub fn resolve_string(&self, id: u32) -> Option<String> {
        let mut id = id;
        for _ in 0..MAX_REFERENCE_DEPTH {
            let mut values: Vec<_> = self.values(id).collect();
            values.sort_by_key(|(config, _)| !config.is_default);
            let (_, value) = values.first()?;
            match value.data_type {
                ResValue::STRING => return self.strings.get(value.data).map(str::to_string),
                ResValue::REFERENCE => id = value.data,
                _ => return None,
            }
        }
        None
    }

    /// File paths for a drawable or mipmap, best density for `target` first.
    pub fn resolve_files(&self, id: u32, target: u16) -> Vec<String> {
        let mut files: Vec<(u16, String)> = self
            .values(id)
            .filter_map(|(config, value)| {
                let path = match value.data_type {
                    ResValue::STRING => self.strings.get(value.data).map(str::to_string),
                    ResValue::REFERENCE => self.resolve_string(value.data),
                    _ => None,
                }?;
                Some((config.density, path))
            })
            .collect();
        files.sort_by_key(|(density, _)| density_rank(*density, target));
        files.into_iter().map(|(_, path)| path).collect()
    }
}

/// Closest density first; on equal distance the higher one wins.
fn density_rank(density: u16, target: u16) -> (u32, Reverse<u16>) {
    match density {
        DENSITY_ANY => (u32::MAX - 1, Reverse(0)),
        DENSITY_NONE => (u32::MAX, Reverse(0)),
        _ => {
            let effective = if density == DENSITY_DEFAULT { 160 } else { density };
            (effective.abs_diff(target) as u32, Reverse(effective))
        }
    }
}

fn parse_type(chunk: &Chunk<'_>, package_id: u8) -> Result<TypeChunk> {
    let data = chunk.data;
    let head = bytes(data, 8, 12)?;
    let type_id = head[0];
    let flags = head[1];
    let entry_count = u32_at(head, 4)? as usize;
    let entries_start = u32_at(head, 8)? as usize;

    let config_size = u32_at(data, 20)? as usize;
    let config = bytes(data, 20, config_size.max(4))?;
    let density = if config.len() >= 16 { u16_at(config, 14)? } else { 0 };
    let is_default = config[4..].iter().all(|&b| b == 0);

    let offsets = data.get(chunk.header_size..).unwrap_or_default();
    let mut slots: Vec<(u16, usize)> = Vec::new();
    if flags & FLAG_SPARSE != 0 {
        for pair in bytes(offsets, 0, entry_count.saturating_mul(4))?.chunks_exact(4) {
            let index = u16::from_le_bytes([pair[0], pair[1]]);
            let offset = u16::from_le_bytes([pair[2], pair[3]]) as usize * 4;
            slots.push((index, offset));
        }
    } else if flags & FLAG_OFFSET16 != 0 {
        for (index, raw) in bytes(offsets, 0, entry_count.saturating_mul(2))?
            .chunks_exact(2)
            .enumerate()
        {
            let raw = u16::from_le_bytes([raw[0], raw[1]]);
            if raw != 0xFFFF {
                slots.push((index as u16, raw as usize * 4));
            }
        }
    } else {
        for (index, raw) in bytes(offsets, 0, entry_count.saturating_mul(4))?
            .chunks_exact(4)
            .enumerate()
        {
            let raw = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
            if raw != NO_INDEX {
                slots.push((index as u16, raw as usize));
            }
        }
    }

    let mut entries = Vec::with_capacity(slots.len());
    for (index, offset) in slots {
        let at = entries_start + offset;
        let size = u16_at(data, at)?;
        let flags = u16_at(data, at + 2)?;
        if flags & ENTRY_COMPACT != 0 {
            let value = ResValue {
                data_type: (flags >> 8) as u8,
                data: u32_at(data, at + 4)?,
            };
            entries.push((index, value));
        } else if flags & ENTRY_COMPLEX == 0 {
            entries.push((index, ResValue::parse(data, at + size as usize)?));
        }
    }

    Ok(TypeChunk {
        package_id,
        type_id,
        config: Config {
            density,
            is_default,
        },
        entries,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::Error;
    use crate::package::apk::chunk::tests::{chunk, string_pool};

    #[derive(Clone, Copy)]
    pub(crate) enum Layout {
        Dense,
        Offset16,
        Sparse,
    }

    pub(crate) struct TypeSpec {
        pub(crate) id: u8,
        pub(crate) density: u16,
        pub(crate) language: Option<[u8; 2]>,
        pub(crate) layout: Layout,
        /// `(compact, value)` per entry index; `None` leaves a hole.
        pub(crate) entries: Vec<Option<(bool, ResValue)>>,
    }

    pub(crate) fn string(index: u32) -> Option<(bool, ResValue)> {
        Some((false, ResValue { data_type: ResValue::STRING, data: index }))
    }

    pub(crate) fn reference(id: u32) -> Option<(bool, ResValue)> {
        Some((false, ResValue { data_type: ResValue::REFERENCE, data: id }))
    }

    fn type_chunk(spec: &TypeSpec) -> Vec<u8> {
        let mut entries = Vec::new();
        let mut slots = Vec::new();
        for (index, entry) in spec.entries.iter().enumerate() {
            let Some((compact, value)) = entry else {
                slots.push((index, None));
                continue;
            };
            slots.push((index, Some(entries.len())));
            if *compact {
                entries.extend_from_slice(&(index as u16).to_le_bytes());
                let flags = ENTRY_COMPACT | ((value.data_type as u16) << 8);
                entries.extend_from_slice(&flags.to_le_bytes());
                entries.extend_from_slice(&value.data.to_le_bytes());
            } else {
                entries.extend_from_slice(&8u16.to_le_bytes());
                entries.extend_from_slice(&0u16.to_le_bytes());
                entries.extend_from_slice(&(index as u32).to_le_bytes());
                entries.extend_from_slice(&8u16.to_le_bytes());
                entries.push(0);
                entries.push(value.data_type);
                entries.extend_from_slice(&value.data.to_le_bytes());
            }
        }

        let mut offsets = Vec::new();
        let (flags, count) = match spec.layout {
            Layout::Dense => {
                for (_, at) in &slots {
                    let raw = at.map_or(NO_INDEX, |a| a as u32);
                    offsets.extend_from_slice(&raw.to_le_bytes());
                }
                (0, slots.len())
            }
            Layout::Offset16 => {
                for (_, at) in &slots {
                    let raw = at.map_or(0xFFFF, |a| (a / 4) as u16);
                    offsets.extend_from_slice(&raw.to_le_bytes());
                }
                (FLAG_OFFSET16, slots.len())
            }
            Layout::Sparse => {
                let present: Vec<_> = slots.iter().filter_map(|(i, at)| Some((*i, (*at)?))).collect();
                for (index, at) in &present {
                    offsets.extend_from_slice(&(*index as u16).to_le_bytes());
                    offsets.extend_from_slice(&((at / 4) as u16).to_le_bytes());
                }
                (FLAG_SPARSE, present.len())
            }
        };

        let mut config = vec![0u8; 64];
        config[..4].copy_from_slice(&64u32.to_le_bytes());
        if let Some(lang) = spec.language {
            config[8..10].copy_from_slice(&lang);
        }
        config[14..16].copy_from_slice(&spec.density.to_le_bytes());

        let header_size = 8 + 12 + config.len();
        let mut header = vec![spec.id, flags, 0, 0];
        header.extend_from_slice(&(count as u32).to_le_bytes());
        header.extend_from_slice(&((header_size + offsets.len()) as u32).to_le_bytes());
        header.extend_from_slice(&config);

        let mut body = offsets;
        body.extend_from_slice(&entries);
        chunk(TABLE_TYPE, &header, &body)
    }

    /// A table with one package (id 0x7f) holding the given type chunks.
    pub(crate) fn build_table(strings: &[&str], types: &[TypeSpec]) -> Vec<u8> {
        let mut header = 0x7fu32.to_le_bytes().to_vec();
        header.extend_from_slice(&[0; 256]);
        header.extend_from_slice(&[0; 20]);
        let mut package = string_pool(&["string", "mipmap"], false);
        package.extend(string_pool(&["app_name", "ic_launcher"], true));
        for spec in types {
            package.extend(type_chunk(spec));
        }

        let mut body = string_pool(strings, true);
        body.extend(chunk(TABLE_PACKAGE, &header, &package));
        chunk(TABLE, &1u32.to_le_bytes(), &body)
    }

    fn sample() -> ResourceTable {
        let strings = [
            "Demo",
            "Démo",
            "res/mipmap-mdpi/ic.png",
            "res/mipmap-xxhdpi/ic.png",
            "res/mipmap-xxxhdpi/ic.png",
            "res/mipmap-anydpi-v26/ic.xml",
        ];
        let mipmap = |density, layout, index| TypeSpec {
            id: 2,
            density,
            language: None,
            layout,
            entries: vec![string(index)],
        };
        let types = [
            TypeSpec {
                id: 1,
                density: 0,
                language: Some(*b"fr"),
                layout: Layout::Dense,
                entries: vec![string(1)],
            },
            TypeSpec {
                id: 1,
                density: 0,
                language: None,
                layout: Layout::Offset16,
                entries: vec![string(0), None, reference(0x7f01_0000)],
            },
            mipmap(DENSITY_ANY, Layout::Dense, 5),
            mipmap(160, Layout::Sparse, 2),
            mipmap(480, Layout::Dense, 3),
            TypeSpec {
                id: 2,
                density: 640,
                language: None,
                layout: Layout::Sparse,
                entries: vec![None, None, Some((true, ResValue { data_type: ResValue::STRING, data: 4 }))],
            },
        ];
        ResourceTable::parse(&build_table(&strings, &types)).unwrap()
    }

    #[test]
    fn test_strings_resolve_in_default_config() {
        let table = sample();
        assert_eq!(table.values(0x7f01_0000).count(), 2);
        assert_eq!(table.resolve_string(0x7f01_0000).as_deref(), Some("Demo"));
        assert_eq!(table.resolve_string(0x7f01_0002).as_deref(), Some("Demo"));
        assert_eq!(table.resolve_string(0x7f01_0001), None);
        assert_eq!(table.resolve_string(0x7f05_0000), None);
    }

    #[test]
    fn test_files_ordered_by_density() {
        let table = sample();
        assert_eq!(
            table.resolve_files(0x7f02_0000, 720),
            [
                "res/mipmap-xxhdpi/ic.png",
                "res/mipmap-mdpi/ic.png",
                "res/mipmap-anydpi-v26/ic.xml"
            ]
        );
        assert_eq!(
            table.resolve_files(0x7f02_0002, 720),
            ["res/mipmap-xxxhdpi/ic.png"]
        );
    }

    #[test]
    fn test_density_rank_prefers_higher_on_ties() {
        assert!(density_rank(800, 720) < density_rank(640, 720));
        assert!(density_rank(640, 720) < density_rank(480, 720));
        assert!(density_rank(DENSITY_DEFAULT, 720) < density_rank(DENSITY_ANY, 720));
        assert!(density_rank(DENSITY_ANY, 720) < density_rank(DENSITY_NONE, 720));
    }

    #[test]
    fn test_self_reference_terminates() {
        let table = ResourceTable::parse(&build_table(
            &[],
            &[TypeSpec {
                id: 1,
                density: 0,
                language: None,
                layout: Layout::Dense,
                entries: vec![reference(0x7f01_0000)],
            }],
        ))
        .unwrap();
        assert_eq!(table.resolve_string(0x7f01_0000), None);
    }

    #[test]
    fn test_rejects_other_chunks() {
        let xml = chunk(crate::package::apk::chunk::XML, &[], &[]);
        assert!(matches!(ResourceTable::parse(&xml), Err(Error::Manifest(_))));
    }
}
