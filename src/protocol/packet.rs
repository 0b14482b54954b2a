//! Application commands in both directions.
//!
//! Only the commands the proxy inspects or rewrites are modelled field by
//! field. Everything else decodes into [`RawCmd`], which keeps the opcode
//! and the untouched payload so forwarding stays lossless.

use crate::protocol::{decoder, Decode, Decoder, Encode, Encoder, Unknown};
use bytes::Bytes;
use mt_multiproxy_macros::{Decode, Encode};

pub mod to_clt;
pub mod to_srv;

pub use to_clt::ToCltCmd;
pub use to_srv::ToSrvCmd;

/// A top-level command enum of one direction.
pub trait Command: Encode + Decode + AsRef<str> {
    /// The channel this command travels on.
    fn channel(&self) -> u8;
}

impl Command for ToCltCmd {
    fn channel(&self) -> u8 {
        ToCltCmd::channel(self)
    }
}

impl Command for ToSrvCmd {
    fn channel(&self) -> u8 {
        ToSrvCmd::channel(self)
    }
}

/// A command the proxy does not model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCmd {
    pub opcode: u16,
    pub data: Bytes,
}

impl Unknown for RawCmd {
    fn from_unknown(discriminant: i64, decoder: &mut Decoder) -> decoder::Result<Self> {
        Ok(Self {
            opcode: u16::try_from(discriminant)?,
            data: Bytes::copy_from_slice(decoder.consume_rest()),
        })
    }
}

impl Encode for RawCmd {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_u16(self.opcode);
        encoder.write_slice(&self.data);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Encode, Decode)]
pub struct V3F32 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// A map block or node position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Encode, Decode)]
pub struct V3I16 {
    pub x: i16,
    pub y: i16,
    pub z: i16,
}

/// A string sent as UTF-16 code units.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WideString(pub String);

impl From<&str> for WideString {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl Encode for WideString {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_wide_string(&self.0);
    }
}

impl Decode for WideString {
    fn decode(decoder: &mut Decoder) -> decoder::Result<Self> {
        decoder.read_wide_string().map(Self)
    }
}

bitflags::bitflags! {
    /// Authentication mechanisms offered in `Hello`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AuthMechs: u32 {
        const LEGACY_PASSWD = 1;
        const SRP = 2;
        const FIRST_SRP = 4;
    }
}

impl Encode for AuthMechs {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_u32(self.bits());
    }
}

impl Decode for AuthMechs {
    fn decode(decoder: &mut Decoder) -> decoder::Result<Self> {
        Ok(Self::from_bits_retain(decoder.read_u32()?))
    }
}

/// Reason sent with an access denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::FromRepr, strum::Display)]
#[repr(u8)]
pub enum KickReason {
    WrongPasswd = 0,
    UnexpectedData = 1,
    SrvIsSingleplayer = 2,
    UnsupportedVer = 3,
    BadNameChars = 4,
    BadName = 5,
    TooManyClts = 6,
    EmptyPasswd = 7,
    AlreadyConnected = 8,
    SrvErr = 9,
    Custom = 10,
    Shutdown = 11,
    Crash = 12,
}

impl KickReason {
    /// Whether the denial carries a custom message and a reconnect hint.
    pub fn has_custom_text(self) -> bool {
        matches!(self, Self::Custom | Self::Shutdown | Self::Crash)
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::WrongPasswd => "Invalid password",
            Self::UnexpectedData => "Unexpected data",
            Self::SrvIsSingleplayer => "Server is in singleplayer mode",
            Self::UnsupportedVer => "Unsupported client version",
            Self::BadNameChars => "Invalid characters in player name",
            Self::BadName => "Player name not allowed",
            Self::TooManyClts => "Too many clients",
            Self::EmptyPasswd => "Empty passwords are not allowed",
            Self::AlreadyConnected => "Another client is already connected with this name",
            Self::SrvErr => "Internal server error",
            Self::Custom => "",
            Self::Shutdown => "Server shutting down",
            Self::Crash => "The server has experienced an internal error",
        }
    }
}

/// Mod channel state change sent to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr)]
#[repr(u8)]
pub enum ModChanSignal {
    JoinOk = 0,
    JoinFail = 1,
    LeaveOk = 2,
    LeaveFail = 3,
    NotRegistered = 4,
    SetState = 5,
}

impl Encode for ModChanSignal {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_u8(*self as u8);
    }
}

impl Decode for ModChanSignal {
    fn decode(decoder: &mut Decoder) -> decoder::Result<Self> {
        let x = decoder.read_u8()?;
        Self::from_repr(x).ok_or(decoder::DecodeError::InvalidDiscriminant(x.into()))
    }
}
