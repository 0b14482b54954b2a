//! In-place content id rewriting of map blocks and inventories.

use super::ContentError;
use crate::protocol::{zlib_compress, zlib_decompress, zstd_compress, zstd_decompress};
use bytes::{BufMut, Bytes, BytesMut};

/// Nodes per map block.
pub const NODE_COUNT: usize = 16 * 16 * 16;

/// `u8 flags`, `u16 lighting`, `u8 content width`, `u8 params width`.
const BLOCK_HEADER_SIZE: usize = 5;
const NODES_SIZE: usize = NODE_COUNT * 4;

/// Rewrites the param0 column of a serialized block with `map`.
///
/// Version 28 blocks carry their node array as a zlib stream after the
/// header. Version 29 blocks are one zstd frame holding the header and the
/// raw node array. Anything past the node array is kept byte for byte.
pub fn rewrite_block(
    data: &[u8],
    ser_ver: u8,
    map: impl Fn(u16) -> u16,
) -> Result<Bytes, ContentError> {
    if ser_ver >= 29 {
        let (mut raw, consumed) = zstd_decompress(data)?;
        let nodes = nodes_mut(&mut raw)?;
        rewrite_param0(&mut nodes[..NODE_COUNT * 2], &map);

        let compressed = zstd_compress(&raw)?;
        let mut out = BytesMut::with_capacity(compressed.len() + data.len() - consumed);
        out.put_slice(&compressed);
        out.put_slice(&data[consumed..]);
        Ok(out.freeze())
    } else {
        if data.len() < BLOCK_HEADER_SIZE {
            return Err(ContentError::BadBlock("truncated header"));
        }
        check_widths(&data[..BLOCK_HEADER_SIZE])?;
        let (mut nodes, consumed) = zlib_decompress(&data[BLOCK_HEADER_SIZE..])?;
        if nodes.len() != NODES_SIZE {
            return Err(ContentError::BadBlock("wrong node array size"));
        }
        rewrite_param0(&mut nodes[..NODE_COUNT * 2], &map);

        let compressed = zlib_compress(&nodes);
        let rest = &data[BLOCK_HEADER_SIZE + consumed..];
        let mut out = BytesMut::with_capacity(BLOCK_HEADER_SIZE + compressed.len() + rest.len());
        out.put_slice(&data[..BLOCK_HEADER_SIZE]);
        out.put_slice(&compressed);
        out.put_slice(rest);
        Ok(out.freeze())
    }
}

fn check_widths(header: &[u8]) -> Result<(), ContentError> {
    if header[3] != 2 || header[4] != 2 {
        return Err(ContentError::BadBlock("unsupported content or params width"));
    }
    Ok(())
}

fn nodes_mut(raw: &mut [u8]) -> Result<&mut [u8], ContentError> {
    if raw.len() < BLOCK_HEADER_SIZE + NODES_SIZE {
        return Err(ContentError::BadBlock("truncated node array"));
    }
    check_widths(&raw[..BLOCK_HEADER_SIZE])?;
    Ok(&mut raw[BLOCK_HEADER_SIZE..BLOCK_HEADER_SIZE + NODES_SIZE])
}

fn rewrite_param0(param0: &mut [u8], map: impl Fn(u16) -> u16) {
    for cell in param0.chunks_exact_mut(2) {
        let id = u16::from_be_bytes([cell[0], cell[1]]);
        cell.copy_from_slice(&map(id).to_be_bytes());
    }
}

/// Appends a `hand` list naming `hand` unless the inventory already has one.
pub fn add_hand_list(inv: &[u8], hand: &str) -> Option<Bytes> {
    let text = std::str::from_utf8(inv).ok()?;
    if text.contains("List hand ") {
        return None;
    }
    let end = text.rfind("EndInventory")?;
    // `EndInventoryList` lines also contain the marker.
    if text[end..].starts_with("EndInventoryList") {
        return None;
    }

    let mut out = String::with_capacity(text.len() + hand.len() + 48);
    out.push_str(&text[..end]);
    out.push_str("List hand 1\nWidth 0\nItem ");
    out.push_str(hand);
    out.push_str("\nEndInventoryList\n");
    out.push_str(&text[end..]);
    Some(out.into())
}
