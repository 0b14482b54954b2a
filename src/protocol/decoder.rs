use std::{convert::Infallible, num::TryFromIntError, str::Utf8Error, string::FromUtf16Error};

/// Why a message could not be decoded.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("need at least {0} more bytes")]
    EndOfStream(usize),
    #[error("invalid boolean pattern {0} - expected either 0 or 1")]
    InvalidBool(u8),
    #[error("invalid discriminant {0}")]
    InvalidDiscriminant(i64),
    #[error("string exceeds max allowed length")]
    StringTooLong,
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
    #[error(transparent)]
    Utf8(#[from] Utf8Error),
    #[error(transparent)]
    Utf16(#[from] FromUtf16Error),
    #[error(transparent)]
    IntConversion(#[from] TryFromIntError),
    /// Special variant for derive macro integer conversions to work.
    /// Cannot occur.
    #[error(transparent)]
    Infallible(#[from] Infallible),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = DecodeError> = std::result::Result<T, E>;

/// Blobs announced with a u32 length are capped to this.
const MAX_BLOB_LENGTH: usize = 64 * 1024 * 1024;

macro_rules! read_be {
    ($($name:ident -> $ty:ty),* $(,)?) => {
        $(
            #[doc = concat!("Reads a big-endian `", stringify!($ty), "`.")]
            pub fn $name(&mut self) -> Result<$ty> {
                self.consume().map(<$ty>::from_be_bytes)
            }
        )*
    };
}

/// Cursor over one message. Reads borrow from the underlying buffer.
#[derive(Debug)]
pub struct Decoder<'a> {
    buffer: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer }
    }

    /// The unread part of the message.
    pub fn buffer(&self) -> &'a [u8] {
        self.buffer
    }

    pub fn is_finished(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Fails unless the whole buffer was consumed.
    pub fn finish(&self) -> Result<()> {
        if self.buffer.is_empty() {
            Ok(())
        } else {
            Err(DecodeError::TrailingBytes(self.buffer.len()))
        }
    }

    pub fn consume_slice(&mut self, n: usize) -> Result<&'a [u8]> {
        if n <= self.buffer.len() {
            let (data, buffer) = self.buffer.split_at(n);
            self.buffer = buffer;
            Ok(data)
        } else {
            Err(DecodeError::EndOfStream(n - self.buffer.len()))
        }
    }

    /// Consumes everything left in the buffer.
    pub fn consume_rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buffer)
    }

    pub fn consume<const N: usize>(&mut self) -> Result<[u8; N]> {
        let data = self.consume_slice(N)?;
        let mut array = [0; N];
        array.copy_from_slice(data);
        Ok(array)
    }

    read_be! {
        read_u8 -> u8,
        read_i8 -> i8,
        read_u16 -> u16,
        read_i16 -> i16,
        read_u32 -> u32,
        read_i32 -> i32,
        read_u64 -> u64,
        read_i64 -> i64,
        read_f32 -> f32,
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            x => Err(DecodeError::InvalidBool(x)),
        }
    }

    /// Reads a u16-length-prefixed byte blob.
    pub fn read_bytes16(&mut self) -> Result<&'a [u8]> {
        let length = usize::from(self.read_u16()?);
        self.consume_slice(length)
    }

    /// Reads a u32-length-prefixed byte blob.
    pub fn read_bytes32(&mut self) -> Result<&'a [u8]> {
        let length = usize::try_from(self.read_u32()?)?;
        if length > MAX_BLOB_LENGTH {
            return Err(DecodeError::StringTooLong);
        }
        self.consume_slice(length)
    }

    pub fn read_string(&mut self) -> Result<&'a str> {
        Ok(std::str::from_utf8(self.read_bytes16()?)?)
    }

    pub fn read_long_string(&mut self) -> Result<&'a str> {
        Ok(std::str::from_utf8(self.read_bytes32()?)?)
    }

    /// Reads a string of UTF-16 code units prefixed with their count.
    pub fn read_wide_string(&mut self) -> Result<String> {
        let length = usize::from(self.read_u16()?);
        let bytes = self.consume_slice(length * 2)?;
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        Ok(String::from_utf16(&units)?)
    }
}

/// A type that can be read from a [`Decoder`].
pub trait Decode: Sized {
    fn decode(decoder: &mut Decoder) -> Result<Self>;
}

/// A catch-all variant payload built from a discriminant the enum does not know.
pub trait Unknown: Sized {
    fn from_unknown(discriminant: i64, decoder: &mut Decoder) -> Result<Self>;
}

macro_rules! decode_with {
    ($($read:ident: $ty:ty),* $(,)?) => {
        $(
            impl Decode for $ty {
                fn decode(decoder: &mut Decoder) -> Result<Self> {
                    decoder.$read()
                }
            }
        )*
    };
}

decode_with! {
    read_u8: u8,
    read_i8: i8,
    read_u16: u16,
    read_i16: i16,
    read_u32: u32,
    read_i32: i32,
    read_u64: u64,
    read_i64: i64,
    read_f32: f32,
    read_bool: bool,
}

impl Decode for String {
    fn decode(decoder: &mut Decoder) -> Result<Self> {
        decoder.read_string().map(str::to_owned)
    }
}

impl Decode for [u8; 16] {
    fn decode(decoder: &mut Decoder) -> Result<Self> {
        decoder.consume()
    }
}

impl<T: Decode> Decode for Box<T> {
    fn decode(decoder: &mut Decoder) -> Result<Self> {
        T::decode(decoder).map(Box::new)
    }
}

impl Decode for () {
    fn decode(_decoder: &mut Decoder) -> Result<Self> {
        Ok(())
    }
}
