use super::{srp, validate_name, AuthError};
use crate::{
    credentials::{Credential, CredentialStore},
    protocol::{
        decode_message,
        packet::{
            to_clt::{AcceptAuth, Hello, Kick, SrpBytesSaltB},
            to_srv::Init,
            AuthMechs, KickReason, ToCltCmd, ToSrvCmd, V3F32,
        },
        PROTO_VER_MAX, PROTO_VER_MIN, SER_VER_MAX, SER_VER_MIN,
    },
    transport::Peer,
};
use std::time::Duration;

/// How long a denial notice gets to be acknowledged before the peer closes.
const DENY_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    /// Refuse enrollment with an empty password.
    pub require_password: bool,
}

/// A player that proved its identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientLogin {
    pub name: String,
    pub ser_ver: u8,
    pub proto_ver: u16,
}

enum State {
    MechanismOffered,
    ChallengeSent(srp::ServerHandshake),
}

/// Runs the client-facing handshake up to `AcceptAuth`.
///
/// Denials send a [`Kick`] with the reason, then close the peer.
pub async fn accept_login(
    peer: &Peer,
    store: &dyn CredentialStore,
    options: &ServerOptions,
) -> Result<ClientLogin, AuthError> {
    let init = loop {
        let pkt = peer.recv().await?;
        match decode_message::<ToSrvCmd>(&pkt.data) {
            Ok(ToSrvCmd::Init(init)) => break init,
            Ok(cmd) => {
                tracing::debug!(peer = %peer.addr(), cmd = cmd.as_ref(), "ignoring command before init");
            }
            Err(e) => {
                tracing::warn!(peer = %peer.addr(), "malformed init: {e}");
                return Err(deny(peer, KickReason::UnexpectedData).await);
            }
        }
    };

    let name = init.player_name.clone();
    if let Err(reason) = validate_name(&name) {
        tracing::warn!(peer = %peer.addr(), client = %name, "rejecting player name");
        return Err(deny(peer, reason).await);
    }
    let Some((ser_ver, proto_ver)) = negotiate(&init) else {
        tracing::warn!(
            peer = %peer.addr(),
            client = %name,
            max_ser_ver = init.max_ser_ver,
            min_proto_ver = init.min_proto_ver,
            max_proto_ver = init.max_proto_ver,
            "unsupported client version"
        );
        return Err(deny(peer, KickReason::UnsupportedVer).await);
    };

    let credential = match store.read_credential(&name) {
        Ok(credential) => credential,
        Err(e) => {
            tracing::error!(client = %name, "reading credential failed: {e}");
            deny(peer, KickReason::SrvErr).await;
            return Err(e.into());
        }
    };
    let auth_mechs = if credential.is_some() {
        AuthMechs::SRP
    } else {
        AuthMechs::FIRST_SRP
    };

    let _ = peer
        .send_cmd(&ToCltCmd::Hello(Hello {
            ser_ver,
            compression: 0,
            proto_ver,
            auth_mechs,
            username: name.clone(),
        }))
        .await?;

    let mut state = State::MechanismOffered;
    loop {
        let pkt = peer.recv().await?;
        let cmd = match decode_message::<ToSrvCmd>(&pkt.data) {
            Ok(cmd) => cmd,
            Err(e) => {
                tracing::warn!(client = %name, "malformed handshake message: {e}");
                return Err(deny(peer, KickReason::UnexpectedData).await);
            }
        };

        state = match (cmd, state, &credential) {
            (ToSrvCmd::FirstSrp(first), State::MechanismOffered, None) => {
                if first.empty_passwd && options.require_password {
                    tracing::warn!(client = %name, "refusing empty password");
                    return Err(deny(peer, KickReason::EmptyPasswd).await);
                }
                let credential = Credential {
                    salt: first.salt,
                    verifier: first.verifier,
                };
                if let Err(e) = store.write_credential(&name, credential) {
                    tracing::error!(client = %name, "storing credential failed: {e}");
                    deny(peer, KickReason::SrvErr).await;
                    return Err(e.into());
                }
                tracing::info!(client = %name, "enrolled new account");
                break;
            }
            (ToSrvCmd::SrpBytesA(a), State::MechanismOffered, Some(credential)) => {
                if a.based_on != 1 {
                    return Err(deny(peer, KickReason::UnexpectedData).await);
                }
                let handshake = match srp::ServerHandshake::new(
                    &name,
                    &credential.salt,
                    &credential.verifier,
                    &a.a_pub,
                ) {
                    Ok(handshake) => handshake,
                    Err(e) => {
                        tracing::warn!(client = %name, "bad SRP parameters: {e}");
                        return Err(deny(peer, KickReason::UnexpectedData).await);
                    }
                };
                let _ = peer
                    .send_cmd(&ToCltCmd::SrpBytesSaltB(SrpBytesSaltB {
                        salt: credential.salt.clone(),
                        b_pub: handshake.b_pub(),
                    }))
                    .await?;
                State::ChallengeSent(handshake)
            }
            (ToSrvCmd::SrpBytesM(m), State::ChallengeSent(handshake), _) => {
                if handshake.verify(&m.m).is_err() {
                    tracing::warn!(client = %name, "wrong password");
                    return Err(deny(peer, KickReason::WrongPasswd).await);
                }
                break;
            }
            (
                cmd @ (ToSrvCmd::FirstSrp(_) | ToSrvCmd::SrpBytesA(_) | ToSrvCmd::SrpBytesM(_)),
                _,
                _,
            ) => {
                tracing::warn!(client = %name, cmd = cmd.as_ref(), "handshake message out of turn");
                return Err(deny(peer, KickReason::UnexpectedData).await);
            }
            (cmd, state, _) => {
                tracing::debug!(client = %name, cmd = cmd.as_ref(), "ignoring command during login");
                state
            }
        };
    }

    let _ = peer
        .send_cmd(&ToCltCmd::AcceptAuth(AcceptAuth {
            player_pos: V3F32::default(),
            map_seed: 0,
            send_interval: 0.09,
            sudo_auth_mechs: AuthMechs::SRP,
        }))
        .await?;
    tracing::info!(client = %name, ser_ver, proto_ver, "client authenticated");

    Ok(ClientLogin {
        name,
        ser_ver,
        proto_ver,
    })
}

/// Picks the newest versions both sides support.
pub fn negotiate(init: &Init) -> Option<(u8, u16)> {
    let ser_ver = init.max_ser_ver.min(SER_VER_MAX);
    let proto_ver = init.max_proto_ver.min(PROTO_VER_MAX);
    if ser_ver < SER_VER_MIN || proto_ver < PROTO_VER_MIN || proto_ver < init.min_proto_ver {
        return None;
    }
    Some((ser_ver, proto_ver))
}

/// Sends a denial, waits briefly for its acknowledgment, then closes.
pub async fn deny(peer: &Peer, reason: KickReason) -> AuthError {
    kick(peer, Kick::new(reason)).await;
    AuthError::DeniedClient(reason)
}

/// Best-effort delivery of a kick followed by closing the peer.
pub async fn kick(peer: &Peer, kick: Kick) {
    if let Ok(ack) = peer.send_cmd(&ToCltCmd::Kick(kick)).await {
        tokio::time::timeout(DENY_GRACE, ack.wait()).await.ok();
    }
    peer.close();
}
