use super::{RawCmd, WideString};
use bytes::Bytes;
use mt_multiproxy_macros::{Decode, Encode, FromVariants};

/// Commands sent by a client to a server.
#[derive(Debug, Clone, Encode, Decode, FromVariants, strum::AsRefStr)]
#[encoding(discriminant = "u16")]
pub enum ToSrvCmd {
    #[encoding(id = 0x02)]
    Init(Init),
    #[encoding(id = 0x11)]
    Init2(Init2),
    #[encoding(id = 0x17)]
    JoinModChan(JoinModChan),
    #[encoding(id = 0x18)]
    LeaveModChan(LeaveModChan),
    #[encoding(id = 0x19)]
    MsgModChan(MsgModChan),
    #[encoding(id = 0x32)]
    ChatMsg(ChatMsg),
    #[encoding(id = 0x40)]
    ReqMedia(ReqMedia),
    #[encoding(id = 0x43)]
    CltReady(CltReady),
    #[encoding(id = 0x50)]
    FirstSrp(FirstSrp),
    #[encoding(id = 0x51)]
    SrpBytesA(SrpBytesA),
    #[encoding(id = 0x52)]
    SrpBytesM(SrpBytesM),
    #[encoding(other)]
    Other(RawCmd),
}

impl ToSrvCmd {
    /// The channel a client sends this command on.
    pub fn channel(&self) -> u8 {
        match self {
            Self::Init(_)
            | Self::Init2(_)
            | Self::ReqMedia(_)
            | Self::CltReady(_)
            | Self::FirstSrp(_)
            | Self::SrpBytesA(_)
            | Self::SrpBytesM(_) => 1,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct Init {
    pub max_ser_ver: u8,
    pub compression: u16,
    pub min_proto_ver: u16,
    pub max_proto_ver: u16,
    pub player_name: String,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct Init2 {
    pub lang: String,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct JoinModChan {
    pub channel: String,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct LeaveModChan {
    pub channel: String,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct MsgModChan {
    pub channel: String,
    pub msg: String,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct ChatMsg {
    pub text: WideString,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct ReqMedia {
    #[encoding(length_prefix = "u16")]
    pub filenames: Vec<String>,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct CltReady {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
    pub reserved: u8,
    pub version: String,
    /// Fields newer clients append (formspec version and so on).
    #[encoding(bytes = "rest")]
    pub rest: Bytes,
}

/// Enrollment: a fresh salt and verifier for the account.
#[derive(Debug, Clone, Encode, Decode)]
pub struct FirstSrp {
    #[encoding(bytes = "u16")]
    pub salt: Vec<u8>,
    #[encoding(bytes = "u16")]
    pub verifier: Vec<u8>,
    pub empty_passwd: bool,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct SrpBytesA {
    #[encoding(bytes = "u16")]
    pub a_pub: Vec<u8>,
    /// 1 means the verifier was derived with SRP, the only supported basis.
    pub based_on: u8,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct SrpBytesM {
    #[encoding(bytes = "u16")]
    pub m: Vec<u8>,
}
