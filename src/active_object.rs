//! Per-client bookkeeping of active object handles.
//!
//! Every backend numbers its objects independently, including the avatar
//! of the connected player. The client only ever learns one avatar handle,
//! from the first backend it joined; on later backends the two handles are
//! swapped in both directions so each side keeps its own numbering.

use crate::protocol::{
    packet::to_clt::{AoAdd, AoMsgs, AoRmAdd},
    Decoder,
};
use std::collections::BTreeSet;

/// Handle of an active object as a client or backend sees it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(u16);

impl ObjectId {
    pub fn new(id: u16) -> Self {
        Self(id)
    }

    pub fn as_u16(self) -> u16 {
        self.0
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("object update announces the player's own avatar {0} times")]
pub struct MultipleSelfAdds(pub usize);

/// Tracks which objects a client can see.
#[derive(Debug, Default)]
pub struct AoTracker {
    /// Handles the client currently knows, in client numbering.
    visible: BTreeSet<ObjectId>,
    /// The avatar handle the client was told about.
    client_avatar: Option<ObjectId>,
    /// The avatar handle used by the current backend.
    backend_avatar: Option<ObjectId>,
}

impl AoTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Converts a handle from backend to client numbering.
    fn to_client(&self, id: ObjectId) -> ObjectId {
        match (self.client_avatar, self.backend_avatar) {
            (Some(client), Some(backend)) if client != backend => {
                if id == backend {
                    client
                } else if id == client {
                    backend
                } else {
                    id
                }
            }
            _ => id,
        }
    }

    /// Applies a backend's add/remove message to the tracked set and
    /// rewrites it for the client.
    ///
    /// The first announcement of the player's own avatar is forwarded;
    /// repeats are removed from the message, as are removals of the avatar.
    pub fn observe_rm_add(
        &mut self,
        player: &str,
        msg: &mut AoRmAdd,
    ) -> Result<(), MultipleSelfAdds> {
        let mut self_adds = msg.add.iter().filter(|add| is_own_avatar(add, player));
        let avatar = self_adds.next().map(|add| ObjectId::new(add.id));
        let extra = self_adds.count();
        if extra > 0 {
            return Err(MultipleSelfAdds(extra + 1));
        }

        // Removals use the numbering in effect before this message.
        let backend_avatar = self.backend_avatar;
        let mut remove = Vec::with_capacity(msg.remove.len());
        for &id in &msg.remove {
            let id = ObjectId::new(id);
            if Some(id) == backend_avatar {
                continue;
            }
            let id = self.to_client(id);
            self.visible.remove(&id);
            remove.push(id.as_u16());
        }
        msg.remove = remove;

        // Adds use the numbering the message establishes, wherever the
        // avatar appears in it.
        let first_avatar = self.client_avatar.is_none();
        if let Some(avatar) = avatar {
            self.backend_avatar = Some(avatar);
            self.client_avatar.get_or_insert(avatar);
        }
        let mut add = Vec::with_capacity(msg.add.len());
        for mut ao in msg.add.drain(..) {
            if is_own_avatar(&ao, player) {
                if first_avatar {
                    add.push(ao);
                }
                continue;
            }
            let id = self.to_client(ObjectId::new(ao.id));
            ao.id = id.as_u16();
            self.visible.insert(id);
            add.push(ao);
        }
        msg.add = add;
        Ok(())
    }

    /// Rewrites handles of object messages for the client.
    pub fn observe_msgs(&self, msgs: &mut AoMsgs) {
        for msg in &mut msgs.msgs {
            msg.id = self.to_client(ObjectId::new(msg.id)).as_u16();
        }
    }

    /// Builds one removal of every visible object and forgets them all.
    ///
    /// The avatar stays; the next backend announces its own handle for it.
    pub fn take_removal(&mut self) -> Option<AoRmAdd> {
        self.backend_avatar = None;
        if self.visible.is_empty() {
            return None;
        }
        let remove = std::mem::take(&mut self.visible)
            .into_iter()
            .map(ObjectId::as_u16)
            .collect();
        Some(AoRmAdd {
            remove,
            add: Vec::new(),
        })
    }

    pub fn visible(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.visible.iter().copied()
    }
}

/// Whether `add` introduces the player object named `player`.
///
/// Object init data starts with `u8 version`, the u16-prefixed name and
/// `u8 is_player`.
fn is_own_avatar(add: &AoAdd, player: &str) -> bool {
    let mut decoder = Decoder::new(&add.init_data);
    let parsed = (|| {
        decoder.read_u8()?;
        let name = decoder.read_string()?;
        let is_player = decoder.read_u8()?;
        Ok::<_, crate::protocol::DecodeError>(is_player != 0 && name == player)
    })();
    parsed.unwrap_or(false)
}
