//! zlib and zstd helpers for definition tables and map blocks.
//!
//! Serialization version 28 compresses with zlib, 29 and later with zstd.
//! Both decompressors report how many input bytes the stream used so the
//! caller can keep whatever follows it untouched.

use super::BUFFER_LIMIT;
use flate2::Compression;
use std::io::{Read, Write};

/// Definition tables are compressed once at startup, so spend the time.
const ZLIB_LEVEL: Compression = Compression::best();

const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("decompressed data exceeds {BUFFER_LIMIT} bytes")]
    TooLarge,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub fn zlib_compress(data: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), ZLIB_LEVEL);
    // Writes into a Vec cannot fail.
    let _ = encoder.write_all(data);
    encoder.finish().unwrap_or_default()
}

/// Inflates one zlib stream at the start of `data`.
///
/// Returns the output and the number of input bytes consumed.
pub fn zlib_decompress(data: &[u8]) -> Result<(Vec<u8>, usize), CompressionError> {
    let mut decoder = flate2::bufread::ZlibDecoder::new(data);
    let mut output = Vec::new();
    (&mut decoder)
        .take(BUFFER_LIMIT as u64 + 1)
        .read_to_end(&mut output)?;
    if output.len() > BUFFER_LIMIT {
        return Err(CompressionError::TooLarge);
    }
    Ok((output, decoder.total_in() as usize))
}

pub fn zstd_compress(data: &[u8]) -> Result<Vec<u8>, CompressionError> {
    Ok(zstd::stream::encode_all(data, ZSTD_LEVEL)?)
}

/// Decodes one zstd frame at the start of `data`.
///
/// Returns the output and the number of input bytes consumed.
pub fn zstd_decompress(data: &[u8]) -> Result<(Vec<u8>, usize), CompressionError> {
    let mut input = data;
    let mut output = Vec::new();
    {
        let decoder = zstd::stream::read::Decoder::with_buffer(&mut input)?.single_frame();
        decoder
            .take(BUFFER_LIMIT as u64 + 1)
            .read_to_end(&mut output)?;
    }
    if output.len() > BUFFER_LIMIT {
        return Err(CompressionError::TooLarge);
    }
    Ok((output, data.len() - input.len()))
}
