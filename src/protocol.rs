//! The opcode-tagged application protocol carried inside transport messages.

mod compression;
mod decoder;
mod encoder;
pub mod packet;

pub use compression::{
    zlib_compress, zlib_decompress, zstd_compress, zstd_decompress, CompressionError,
};
pub use decoder::{Decode, DecodeError, Decoder, Unknown};
pub use encoder::{Encode, Encoder};

/// Oldest map serialization version the proxy understands (zlib blocks).
pub const SER_VER_MIN: u8 = 28;
/// Newest map serialization version the proxy understands (zstd blocks).
pub const SER_VER_MAX: u8 = 29;
pub const PROTO_VER_MIN: u16 = 37;
pub const PROTO_VER_MAX: u16 = 42;

/// Limit to avoid out-of-memory DOS.
const BUFFER_LIMIT: usize = 32 * 1024 * 1024; // 32 MiB

/// Decodes a whole message, ignoring bytes the type does not model.
pub fn decode_message<T: Decode>(data: &[u8]) -> Result<T, DecodeError> {
    T::decode(&mut Decoder::new(data))
}
