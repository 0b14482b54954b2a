//! The item definition table sent in `ItemDefs`.
//!
//! Inflated layout: `u8 version` (0), `u16 count`, `count` u16-prefixed
//! definitions, `u16 alias count`, then alias pairs of u16-prefixed strings.
//! A definition starts with `u8 version`, `u8 type` and the item name.

use super::ContentError;
use crate::protocol::{zlib_compress, zlib_decompress, Decoder, Encoder};
use bytes::Bytes;

const TABLE_VERSION: u8 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemDef {
    pub name: String,
    pub def: Bytes,
}

impl ItemDef {
    /// Returns a copy of this definition registered under another name.
    pub fn renamed(&self, name: &str) -> Result<Self, ContentError> {
        let mut decoder = Decoder::new(&self.def);
        let version = decoder.read_u8()?;
        let kind = decoder.read_u8()?;
        decoder.read_string()?;

        let mut def = Vec::with_capacity(self.def.len() + name.len());
        let mut encoder = Encoder::new(&mut def);
        encoder.write_u8(version);
        encoder.write_u8(kind);
        encoder.write_string(name);
        encoder.write_slice(decoder.buffer());
        Ok(Self {
            name: name.to_owned(),
            def: def.into(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alias {
    pub name: String,
    pub convert_to: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemTable {
    pub defs: Vec<ItemDef>,
    pub aliases: Vec<Alias>,
}

pub fn parse(compressed: &[u8]) -> Result<ItemTable, ContentError> {
    let (raw, _) = zlib_decompress(compressed)?;
    let mut decoder = Decoder::new(&raw);
    let version = decoder.read_u8()?;
    if version != TABLE_VERSION {
        return Err(ContentError::TableVersion(version));
    }

    let count = decoder.read_u16()?;
    let mut table = ItemTable::default();
    for _ in 0..count {
        let def = decoder.read_bytes16()?;
        let mut def_decoder = Decoder::new(def);
        def_decoder.read_u8()?;
        def_decoder.read_u8()?;
        let name = def_decoder.read_string()?.to_owned();
        table.defs.push(ItemDef {
            name,
            def: Bytes::copy_from_slice(def),
        });
    }

    let alias_count = decoder.read_u16()?;
    for _ in 0..alias_count {
        table.aliases.push(Alias {
            name: decoder.read_string()?.to_owned(),
            convert_to: decoder.read_string()?.to_owned(),
        });
    }
    Ok(table)
}

fn table_len(what: &'static str, count: usize) -> Result<u16, ContentError> {
    u16::try_from(count).map_err(|_| ContentError::TableTooLarge { what, count })
}

pub fn serialize(table: &ItemTable) -> Result<Bytes, ContentError> {
    let mut raw = Vec::new();
    let mut encoder = Encoder::new(&mut raw);
    encoder.write_u8(TABLE_VERSION);
    encoder.write_u16(table_len("item definitions", table.defs.len())?);
    for def in &table.defs {
        encoder.write_bytes16(&def.def);
    }
    encoder.write_u16(table_len("item aliases", table.aliases.len())?);
    for alias in &table.aliases {
        encoder.write_string(&alias.name);
        encoder.write_string(&alias.convert_to);
    }
    Ok(zlib_compress(&raw).into())
}

/// Builds a minimal serialized definition; enough for tests and fakes.
pub fn simple_def(name: &str, extra: &[u8]) -> Bytes {
    let mut def = Vec::new();
    let mut encoder = Encoder::new(&mut def);
    encoder.write_u8(6);
    encoder.write_u8(3);
    encoder.write_string(name);
    encoder.write_slice(extra);
    def.into()
}
