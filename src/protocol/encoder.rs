macro_rules! write_be {
    ($($name:ident: $ty:ty),* $(,)?) => {
        $(
            pub fn $name(&mut self, x: $ty) {
                self.buffer.extend_from_slice(&x.to_be_bytes());
            }
        )*
    };
}

/// Appends the wire form of values to a message buffer.
#[derive(Debug)]
pub struct Encoder<'a> {
    buffer: &'a mut Vec<u8>,
}

impl<'a> Encoder<'a> {
    pub fn new(buffer: &'a mut Vec<u8>) -> Self {
        Self { buffer }
    }

    write_be! {
        write_u8: u8,
        write_i8: i8,
        write_u16: u16,
        write_i16: i16,
        write_u32: u32,
        write_i32: i32,
        write_u64: u64,
        write_i64: i64,
        write_f32: f32,
    }

    pub fn write_bool(&mut self, x: bool) {
        self.write_u8(u8::from(x));
    }

    /// Writes bytes without a length prefix.
    pub fn write_slice(&mut self, slice: &[u8]) {
        self.buffer.extend_from_slice(slice);
    }

    /// Writes a u16-length-prefixed byte blob, truncating past `u16::MAX`.
    pub fn write_bytes16(&mut self, slice: &[u8]) {
        let length = u16::try_from(slice.len()).unwrap_or(u16::MAX);
        self.write_u16(length);
        self.write_slice(&slice[..usize::from(length)]);
    }

    /// Writes a u32-length-prefixed byte blob.
    pub fn write_bytes32(&mut self, slice: &[u8]) {
        let length = u32::try_from(slice.len()).unwrap_or(u32::MAX);
        self.write_u32(length);
        self.write_slice(&slice[..length as usize]);
    }

    pub fn write_string(&mut self, x: &str) {
        self.write_bytes16(x.as_bytes());
    }

    pub fn write_long_string(&mut self, x: &str) {
        self.write_bytes32(x.as_bytes());
    }

    /// Writes a string as UTF-16 code units prefixed with their count.
    pub fn write_wide_string(&mut self, x: &str) {
        let units: Vec<u16> = x.encode_utf16().take(usize::from(u16::MAX)).collect();
        self.write_u16(units.len() as u16);
        for unit in units {
            self.write_u16(unit);
        }
    }
}

/// A type that can be written to an [`Encoder`].
pub trait Encode {
    fn encode(&self, encoder: &mut Encoder);

    /// Encodes into a fresh buffer.
    fn encode_to_vec(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        self.encode(&mut Encoder::new(&mut buffer));
        buffer
    }
}

macro_rules! encode_with {
    ($($write:ident: $ty:ty),* $(,)?) => {
        $(
            impl Encode for $ty {
                fn encode(&self, encoder: &mut Encoder) {
                    encoder.$write(*self);
                }
            }
        )*
    };
}

encode_with! {
    write_u8: u8,
    write_i8: i8,
    write_u16: u16,
    write_i16: i16,
    write_u32: u32,
    write_i32: i32,
    write_u64: u64,
    write_i64: i64,
    write_f32: f32,
    write_bool: bool,
}

impl Encode for String {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_string(self);
    }
}

impl Encode for [u8; 16] {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_slice(self);
    }
}

impl<T: Encode> Encode for Box<T> {
    fn encode(&self, encoder: &mut Encoder) {
        (**self).encode(encoder);
    }
}

impl Encode for () {
    fn encode(&self, _encoder: &mut Encoder) {}
}
