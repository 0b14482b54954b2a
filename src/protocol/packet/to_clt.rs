use super::{AuthMechs, KickReason, ModChanSignal, RawCmd, V3F32, V3I16, WideString};
use crate::protocol::{decoder, Decode, DecodeError, Decoder, Encode, Encoder};
use bytes::Bytes;
use mt_multiproxy_macros::{Decode, Encode, FromVariants};

/// Commands sent by a server to a client.
#[derive(Debug, Clone, Encode, Decode, FromVariants, strum::AsRefStr)]
#[encoding(discriminant = "u16")]
pub enum ToCltCmd {
    #[encoding(id = 0x02)]
    Hello(Hello),
    #[encoding(id = 0x03)]
    AcceptAuth(AcceptAuth),
    #[encoding(id = 0x04)]
    AcceptSudoMode(AcceptSudoMode),
    #[encoding(id = 0x05)]
    DenySudoMode(DenySudoMode),
    #[encoding(id = 0x0a)]
    Kick(Kick),
    #[encoding(id = 0x20)]
    BlkData(BlkData),
    #[encoding(id = 0x21)]
    AddNode(AddNode),
    #[encoding(id = 0x22)]
    RemoveNode(RemoveNode),
    #[encoding(id = 0x27)]
    Inv(Inv),
    #[encoding(id = 0x2f)]
    ChatMsg(ChatMsg),
    #[encoding(id = 0x31)]
    AoRmAdd(AoRmAdd),
    #[encoding(id = 0x32)]
    AoMsgs(AoMsgs),
    #[encoding(id = 0x38)]
    Media(Media),
    #[encoding(id = 0x3a)]
    NodeDefs(NodeDefs),
    #[encoding(id = 0x3c)]
    AnnounceMedia(AnnounceMedia),
    #[encoding(id = 0x3d)]
    ItemDefs(ItemDefs),
    #[encoding(id = 0x41)]
    Privs(Privs),
    #[encoding(id = 0x43)]
    DetachedInv(DetachedInv),
    #[encoding(id = 0x57)]
    ModChanMsg(ModChanMsg),
    #[encoding(id = 0x58)]
    ModChanSig(ModChanSig),
    #[encoding(id = 0x60)]
    SrpBytesSaltB(SrpBytesSaltB),
    #[encoding(other)]
    Other(RawCmd),
}

impl ToCltCmd {
    /// The channel a server sends this command on.
    pub fn channel(&self) -> u8 {
        match self {
            Self::BlkData(_) | Self::Media(_) => 2,
            _ => 0,
        }
    }

    /// Builds a chat line shown as coming from the server.
    pub fn system_chat(text: impl Into<String>) -> Self {
        Self::ChatMsg(ChatMsg {
            version: 1,
            kind: ChatMsg::KIND_SYSTEM,
            sender: WideString::default(),
            text: WideString(text.into()),
            timestamp: 0,
        })
    }
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct Hello {
    pub ser_ver: u8,
    pub compression: u16,
    pub proto_ver: u16,
    pub auth_mechs: AuthMechs,
    pub username: String,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct AcceptAuth {
    pub player_pos: V3F32,
    pub map_seed: u64,
    pub send_interval: f32,
    pub sudo_auth_mechs: AuthMechs,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct AcceptSudoMode {
    pub sudo_auth_mechs: AuthMechs,
    #[encoding(bytes = "rest")]
    pub rest: Bytes,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct DenySudoMode;

/// Access denial. Custom, shutdown and crash reasons carry text and a
/// reconnect hint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kick {
    pub reason: KickReason,
    pub custom: String,
    pub reconnect: bool,
}

impl Kick {
    pub fn new(reason: KickReason) -> Self {
        Self {
            reason,
            custom: String::new(),
            reconnect: false,
        }
    }

    pub fn custom(text: impl Into<String>) -> Self {
        Self {
            reason: KickReason::Custom,
            custom: text.into(),
            reconnect: false,
        }
    }

    /// Human readable form for logs and chat.
    pub fn describe(&self) -> String {
        if self.reason.has_custom_text() && !self.custom.is_empty() {
            self.custom.clone()
        } else {
            self.reason.message().to_owned()
        }
    }
}

impl Encode for Kick {
    fn encode(&self, encoder: &mut Encoder) {
        encoder.write_u8(self.reason as u8);
        if self.reason.has_custom_text() {
            encoder.write_string(&self.custom);
            encoder.write_bool(self.reconnect);
        }
    }
}

impl Decode for Kick {
    fn decode(decoder: &mut Decoder) -> decoder::Result<Self> {
        let x = decoder.read_u8()?;
        let reason =
            KickReason::from_repr(x).ok_or(DecodeError::InvalidDiscriminant(i64::from(x)))?;
        let mut kick = Self::new(reason);
        if reason.has_custom_text() {
            kick.custom = decoder.read_string()?.to_owned();
            // Older servers omit the reconnect flag.
            if !decoder.is_finished() {
                kick.reconnect = decoder.read_u8()? != 0;
            }
        }
        Ok(kick)
    }
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct BlkData {
    pub pos: V3I16,
    /// Serialized map block, compressed according to the serialization
    /// version, followed by network-specific trailer bytes.
    #[encoding(bytes = "rest")]
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct AddNode {
    pub pos: V3I16,
    pub param0: u16,
    pub param1: u8,
    pub param2: u8,
    pub keep_meta: bool,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct RemoveNode {
    pub pos: V3I16,
}

/// Serialized player inventory in the line based text format.
#[derive(Debug, Clone, Encode, Decode)]
pub struct Inv {
    #[encoding(bytes = "rest")]
    pub inv: Bytes,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct ChatMsg {
    pub version: u8,
    pub kind: u8,
    pub sender: WideString,
    pub text: WideString,
    pub timestamp: i64,
}

impl ChatMsg {
    pub const KIND_RAW: u8 = 0;
    pub const KIND_NORMAL: u8 = 1;
    pub const KIND_ANNOUNCE: u8 = 2;
    pub const KIND_SYSTEM: u8 = 3;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct AoRmAdd {
    #[encoding(length_prefix = "u16")]
    pub remove: Vec<u16>,
    #[encoding(length_prefix = "u16")]
    pub add: Vec<AoAdd>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct AoAdd {
    pub id: u16,
    pub kind: u8,
    #[encoding(bytes = "u32")]
    pub init_data: Bytes,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct AoMsgs {
    #[encoding(length_prefix = "inferred")]
    pub msgs: Vec<AoMsg>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct AoMsg {
    pub id: u16,
    #[encoding(bytes = "u16")]
    pub data: Bytes,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct Media {
    pub bunch_count: u16,
    pub bunch_index: u16,
    #[encoding(length_prefix = "u32")]
    pub files: Vec<MediaFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct MediaFile {
    pub name: String,
    #[encoding(bytes = "u32")]
    pub data: Bytes,
}

/// zlib-compressed node definition table.
#[derive(Debug, Clone, Encode, Decode)]
pub struct NodeDefs {
    #[encoding(bytes = "u32")]
    pub defs: Bytes,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct AnnounceMedia {
    #[encoding(length_prefix = "u16")]
    pub files: Vec<MediaAnnouncement>,
    pub remote_servers: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct MediaAnnouncement {
    pub name: String,
    pub sha1_base64: String,
}

/// zlib-compressed item definition table.
#[derive(Debug, Clone, Encode, Decode)]
pub struct ItemDefs {
    #[encoding(bytes = "u32")]
    pub defs: Bytes,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct Privs {
    #[encoding(length_prefix = "u16")]
    pub privs: Vec<String>,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct DetachedInv {
    pub name: String,
    pub keep: bool,
    #[encoding(bytes = "rest")]
    pub inv: Bytes,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct ModChanMsg {
    pub channel: String,
    pub sender: String,
    pub msg: String,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct ModChanSig {
    pub signal: ModChanSignal,
    pub channel: String,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct SrpBytesSaltB {
    #[encoding(bytes = "u16")]
    pub salt: Vec<u8>,
    #[encoding(bytes = "u16")]
    pub b_pub: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode_message;

    #[test]
    fn ao_rm_add_layout() {
        let cmd = ToCltCmd::AoRmAdd(AoRmAdd {
            remove: vec![3, 9],
            add: vec![AoAdd {
                id: 12,
                kind: 101,
                init_data: Bytes::from_static(&[1, 2]),
            }],
        });
        let bytes = cmd.encode_to_vec();
        assert_eq!(
            bytes,
            [0x00, 0x31, 0, 2, 0, 3, 0, 9, 0, 1, 0, 12, 101, 0, 0, 0, 2, 1, 2]
        );

        let ToCltCmd::AoRmAdd(decoded) = decode_message(&bytes).unwrap() else {
            panic!("wrong variant");
        };
        assert_eq!(decoded.remove, [3, 9]);
        assert_eq!(decoded.add[0].init_data.as_ref(), [1, 2]);
    }

    #[test]
    fn ao_msgs_run_to_end_of_message() {
        let bytes = [0x00, 0x32, 0, 7, 0, 1, 0xaa, 0, 8, 0, 0];
        let ToCltCmd::AoMsgs(msgs) = decode_message(&bytes).unwrap() else {
            panic!("wrong variant");
        };
        assert_eq!(msgs.msgs.len(), 2);
        assert_eq!(msgs.msgs[1].id, 8);
        assert!(msgs.msgs[1].data.is_empty());
    }

    #[test]
    fn kick_text_only_for_custom_reasons() {
        let plain = ToCltCmd::Kick(Kick::new(KickReason::WrongPasswd));
        assert_eq!(plain.encode_to_vec(), [0x00, 0x0a, 0]);

        let mut custom = Kick::custom("bye");
        custom.reconnect = true;
        let bytes = ToCltCmd::Kick(custom.clone()).encode_to_vec();
        assert_eq!(bytes, [0x00, 0x0a, 10, 0, 3, b'b', b'y', b'e', 1]);

        let ToCltCmd::Kick(decoded) = decode_message(&bytes).unwrap() else {
            panic!("wrong variant");
        };
        assert_eq!(decoded, custom);
        assert_eq!(decoded.describe(), "bye");
    }

    #[test]
    fn bulk_data_goes_on_channel_two() {
        let blk = ToCltCmd::BlkData(BlkData {
            pos: V3I16::default(),
            data: Bytes::new(),
        });
        assert_eq!(blk.channel(), 2);
        assert_eq!(ToCltCmd::system_chat("x").channel(), 0);
    }

    #[test]
    fn payload_conversions() {
        let cmd = ToCltCmd::from(Kick::custom("full"));
        assert!(matches!(cmd, ToCltCmd::Kick(_)));
        assert_eq!(Kick::try_from(cmd).unwrap().describe(), "full");

        let other = ToCltCmd::from(DenySudoMode);
        let Err(back) = Kick::try_from(other) else {
            panic!("converted the wrong variant");
        };
        assert!(matches!(back, ToCltCmd::DenySudoMode(_)));
    }
}
