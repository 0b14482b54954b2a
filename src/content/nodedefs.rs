//! The node definition table sent in `NodeDefs`.
//!
//! Inflated layout: `u8 version`, `u16 count`, then a u32-prefixed blob of
//! `count` entries, each a `u16` content id followed by the u16-prefixed
//! serialized definition. The definition itself starts with its own version
//! byte and the u16-prefixed node name.

use crate::protocol::{zlib_compress, zlib_decompress, Decoder, Encoder};
use super::ContentError;
use bytes::Bytes;

const TABLE_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDef {
    pub id: u16,
    pub name: String,
    /// The whole serialized definition, name included.
    pub def: Bytes,
}

pub fn parse(compressed: &[u8]) -> Result<Vec<NodeDef>, ContentError> {
    let (raw, _) = zlib_decompress(compressed)?;
    let mut decoder = Decoder::new(&raw);
    let version = decoder.read_u8()?;
    if version != TABLE_VERSION {
        return Err(ContentError::TableVersion(version));
    }
    let count = decoder.read_u16()?;
    let mut entries = Decoder::new(decoder.read_bytes32()?);

    let mut defs = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let id = entries.read_u16()?;
        let def = entries.read_bytes16()?;
        let mut def_decoder = Decoder::new(def);
        let _def_version = def_decoder.read_u8()?;
        let name = def_decoder.read_string()?.to_owned();
        defs.push(NodeDef {
            id,
            name,
            def: Bytes::copy_from_slice(def),
        });
    }
    Ok(defs)
}

pub fn serialize(defs: &[NodeDef]) -> Result<Bytes, ContentError> {
    let count = u16::try_from(defs.len()).map_err(|_| ContentError::TableTooLarge {
        what: "node definitions",
        count: defs.len(),
    })?;

    let mut entries = Vec::new();
    let mut encoder = Encoder::new(&mut entries);
    for def in defs {
        encoder.write_u16(def.id);
        encoder.write_bytes16(&def.def);
    }

    let mut raw = Vec::with_capacity(entries.len() + 7);
    let mut encoder = Encoder::new(&mut raw);
    encoder.write_u8(TABLE_VERSION);
    encoder.write_u16(count);
    encoder.write_bytes32(&entries);
    Ok(zlib_compress(&raw).into())
}

/// Builds a minimal serialized definition; enough for tests and fakes.
pub fn simple_def(name: &str, extra: &[u8]) -> Bytes {
    let mut def = Vec::new();
    let mut encoder = Encoder::new(&mut def);
    encoder.write_u8(13);
    encoder.write_string(name);
    encoder.write_slice(extra);
    def.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_survives_serialization() {
        let defs = vec![
            NodeDef {
                id: 5,
                name: "default:stone".into(),
                def: simple_def("default:stone", &[1, 2, 3]),
            },
            NodeDef {
                id: 126,
                name: "air".into(),
                def: simple_def("air", &[]),
            },
        ];
        assert_eq!(parse(&serialize(&defs).unwrap()).unwrap(), defs);
    }

    #[test]
    fn rejects_unknown_table_version() {
        let raw = zlib_compress(&[9, 0, 0]);
        assert!(matches!(parse(&raw), Err(ContentError::TableVersion(9))));
    }
}
