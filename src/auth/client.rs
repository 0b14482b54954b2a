use super::{srp, AuthError};
use crate::{
    protocol::{
        decode_message,
        packet::{
            to_clt::AcceptAuth,
            to_srv::{FirstSrp, Init, SrpBytesA, SrpBytesM},
            AuthMechs, ToCltCmd, ToSrvCmd,
        },
        PROTO_VER_MAX, PROTO_VER_MIN, SER_VER_MAX, SER_VER_MIN,
    },
    transport::Peer,
};
use std::ops::RangeInclusive;

/// Who to log in as, and which versions to accept.
#[derive(Debug, Clone)]
pub struct Login<'a> {
    pub username: &'a str,
    pub password: &'a str,
    /// The newest is requested; the server may pick any of them.
    pub ser_ver: RangeInclusive<u8>,
    pub proto_ver: RangeInclusive<u16>,
}

impl<'a> Login<'a> {
    /// Accepts every version this crate speaks.
    pub fn supported(username: &'a str, password: &'a str) -> Self {
        Self {
            username,
            password,
            ser_ver: SER_VER_MIN..=SER_VER_MAX,
            proto_ver: PROTO_VER_MIN..=PROTO_VER_MAX,
        }
    }

    /// Accepts only the given versions.
    pub fn exact(username: &'a str, password: &'a str, ser_ver: u8, proto_ver: u16) -> Self {
        Self {
            username,
            password,
            ser_ver: ser_ver..=ser_ver,
            proto_ver: proto_ver..=proto_ver,
        }
    }
}

enum State {
    Init,
    Enrolled,
    ChallengeSent(srp::ClientHandshake),
    ProofSent,
}

/// Logs in on a freshly connected server peer.
///
/// Enrolls the account if the server does not know it yet. The caller
/// bounds the wait.
pub async fn login(peer: &Peer, login: &Login<'_>) -> Result<AcceptAuth, AuthError> {
    let _ = peer
        .send_cmd(&ToSrvCmd::Init(Init {
            max_ser_ver: *login.ser_ver.end(),
            compression: 0,
            min_proto_ver: *login.proto_ver.start(),
            max_proto_ver: *login.proto_ver.end(),
            player_name: login.username.to_owned(),
        }))
        .await?;

    let mut state = State::Init;
    loop {
        let pkt = peer.recv().await?;
        let cmd: ToCltCmd = decode_message(&pkt.data)?;
        state = match (cmd, state) {
            (ToCltCmd::Hello(hello), State::Init) => {
                if !login.ser_ver.contains(&hello.ser_ver)
                    || !login.proto_ver.contains(&hello.proto_ver)
                {
                    return Err(AuthError::VersionMismatch {
                        wanted_ser_ver: login.ser_ver.clone(),
                        wanted_proto_ver: login.proto_ver.clone(),
                        ser_ver: hello.ser_ver,
                        proto_ver: hello.proto_ver,
                    });
                }
                tracing::debug!(
                    peer = %peer.addr(),
                    ser_ver = hello.ser_ver,
                    proto_ver = hello.proto_ver,
                    "server picked versions"
                );

                if hello.auth_mechs.contains(AuthMechs::FIRST_SRP) {
                    let (salt, verifier) = srp::create_verifier(login.username, login.password);
                    let _ = peer
                        .send_cmd(&ToSrvCmd::FirstSrp(FirstSrp {
                            salt,
                            verifier,
                            empty_passwd: login.password.is_empty(),
                        }))
                        .await?;
                    State::Enrolled
                } else if hello.auth_mechs.contains(AuthMechs::SRP) {
                    let handshake = srp::ClientHandshake::new(login.username, login.password);
                    let _ = peer
                        .send_cmd(&ToSrvCmd::SrpBytesA(SrpBytesA {
                            a_pub: handshake.a_pub(),
                            based_on: 1,
                        }))
                        .await?;
                    State::ChallengeSent(handshake)
                } else {
                    return Err(AuthError::NoMechanism);
                }
            }
            (ToCltCmd::SrpBytesSaltB(challenge), State::ChallengeSent(handshake)) => {
                let m = handshake.respond(&challenge.salt, &challenge.b_pub)?;
                let _ = peer
                    .send_cmd(&ToSrvCmd::SrpBytesM(SrpBytesM { m }))
                    .await?;
                State::ProofSent
            }
            (ToCltCmd::AcceptAuth(accept), State::Enrolled | State::ProofSent) => {
                tracing::debug!(peer = %peer.addr(), user = login.username, "logged in");
                return Ok(accept);
            }
            (ToCltCmd::Kick(kick), _) => return Err(AuthError::Denied(kick.describe())),
            (cmd, state) => {
                tracing::debug!(peer = %peer.addr(), cmd = cmd.as_ref(), "ignoring command during login");
                state
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        protocol::packet::{to_clt::Hello, V3F32},
        transport::{Listener, PeerError},
    };

    /// Answers `Init` with `Hello` for the given versions and accepts the
    /// enrollment that follows.
    async fn old_server(server: Peer, ser_ver: u8, proto_ver: u16) -> Result<Init, PeerError> {
        let ToSrvCmd::Init(init) = server.recv_cmd().await? else {
            panic!("expected init");
        };
        let _ = server
            .send_cmd(&ToCltCmd::Hello(Hello {
                ser_ver,
                compression: 0,
                proto_ver,
                auth_mechs: AuthMechs::FIRST_SRP,
                username: init.player_name.clone(),
            }))
            .await?;
        if let Ok(ToSrvCmd::FirstSrp(_)) = server.recv_cmd().await {
            let _ = server
                .send_cmd(&ToCltCmd::AcceptAuth(AcceptAuth {
                    player_pos: V3F32::default(),
                    map_seed: 0,
                    send_interval: 0.09,
                    sudo_auth_mechs: AuthMechs::SRP,
                }))
                .await?;
        }
        Ok(init)
    }

    async fn login_against(
        login_as: Login<'_>,
        ser_ver: u8,
        proto_ver: u16,
    ) -> (Init, Result<AcceptAuth, AuthError>) {
        let listener = Listener::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let client = Peer::connect(listener.local_addr()).await.unwrap();
        let server = listener.accept().await.unwrap();
        let (init, result) = tokio::join!(
            old_server(server.clone(), ser_ver, proto_ver),
            async {
                let result = login(&client, &login_as).await;
                client.disconnect().await;
                result
            }
        );
        server.close();
        (init.unwrap(), result)
    }

    #[tokio::test]
    async fn older_servers_are_accepted_within_the_supported_range() {
        let (init, result) =
            login_against(Login::supported("fetch", ""), SER_VER_MIN, PROTO_VER_MIN).await;
        result.unwrap();
        assert_eq!(init.max_ser_ver, SER_VER_MAX);
        assert_eq!(init.min_proto_ver, PROTO_VER_MIN);
        assert_eq!(init.max_proto_ver, PROTO_VER_MAX);
    }

    #[tokio::test]
    async fn versions_outside_the_range_are_refused() {
        let (_, result) =
            login_against(Login::supported("fetch", ""), SER_VER_MAX, PROTO_VER_MIN - 1).await;
        assert!(matches!(result, Err(AuthError::VersionMismatch { .. })));

        let (init, result) =
            login_against(Login::exact("sam", "", SER_VER_MAX, PROTO_VER_MAX), SER_VER_MAX, 40)
                .await;
        assert_eq!(init.min_proto_ver, PROTO_VER_MAX);
        assert!(matches!(
            result,
            Err(AuthError::VersionMismatch { proto_ver: 40, .. })
        ));
    }
}
