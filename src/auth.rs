//! SRP password handshakes in both directions.
//!
//! [`client::login`] authenticates the proxy against a backend on behalf of
//! a player. [`server::accept_login`] authenticates a player against the
//! proxy's own credential store.

use crate::{
    credentials::StoreError,
    protocol::{packet::KickReason, DecodeError},
    transport::PeerError,
};
use std::ops::RangeInclusive;

pub mod client;
pub mod server;
pub mod srp;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error("malformed handshake message: {0}")]
    Malformed(#[from] DecodeError),
    #[error("denied: {0}")]
    Denied(String),
    #[error("client denied with {0}")]
    DeniedClient(KickReason),
    #[error("versions do not match: wanted ser_ver {wanted_ser_ver:?} proto {wanted_proto_ver:?}, got {ser_ver} / {proto_ver}")]
    VersionMismatch {
        wanted_ser_ver: RangeInclusive<u8>,
        wanted_proto_ver: RangeInclusive<u16>,
        ser_ver: u8,
        proto_ver: u16,
    },
    #[error("no supported authentication mechanism offered")]
    NoMechanism,
    #[error(transparent)]
    Srp(#[from] srp::SrpError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("handshake timed out")]
    TimedOut,
}

/// Checks a player name: 1 to 20 characters of `[A-Za-z0-9_-]`.
pub fn validate_name(name: &str) -> Result<(), KickReason> {
    if name.is_empty() || name.len() > 20 {
        return Err(KickReason::BadName);
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(KickReason::BadNameChars);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names() {
        assert_eq!(validate_name("sam_the-1"), Ok(()));
        assert_eq!(validate_name(""), Err(KickReason::BadName));
        assert_eq!(validate_name(&"a".repeat(21)), Err(KickReason::BadName));
        assert_eq!(validate_name("sam!"), Err(KickReason::BadNameChars));
        assert_eq!(validate_name("säm"), Err(KickReason::BadNameChars));
    }
}
