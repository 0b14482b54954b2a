//! The merged content namespace shared by every backend.
//!
//! Each backend numbers its nodes independently. At startup the proxy
//! fetches every backend's definition tables and merges them by node name
//! into one global table; in-flight block and node messages are then
//! rewritten between the backend's ids and the global ones.

use crate::protocol::{
    packet::to_clt::{AddNode, MediaAnnouncement, MediaFile},
    CompressionError, DecodeError,
};
use ahash::AHashMap;
use bytes::Bytes;
use itemdefs::{ItemDef, ItemTable};
use media::MediaStore;
use nodedefs::NodeDef;

pub mod block;
pub mod fetch;
pub mod itemdefs;
pub mod media;
pub mod nodedefs;

pub const CONTENT_UNKNOWN: u16 = 125;
pub const CONTENT_AIR: u16 = 126;
pub const CONTENT_IGNORE: u16 = 127;

/// Highest id a node can have.
const MAX_CONTENT_ID: u16 = 0x7fff;

pub fn is_reserved(id: u16) -> bool {
    (CONTENT_UNKNOWN..=CONTENT_IGNORE).contains(&id)
}

#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Compression(#[from] CompressionError),
    #[error("unsupported definition table version {0}")]
    TableVersion(u8),
    #[error("malformed map block: {0}")]
    BadBlock(&'static str),
    #[error("no more free content ids")]
    IdSpaceExhausted,
    #[error("{count} {what} do not fit a definition table")]
    TableTooLarge { what: &'static str, count: usize },
    #[error("backend {0} was never merged")]
    UnknownBackend(String),
}

/// Everything fetched from one backend at startup.
#[derive(Debug, Clone, Default)]
pub struct BackendDump {
    pub backend: String,
    /// zlib-compressed node table as sent in `NodeDefs`.
    pub node_defs: Bytes,
    /// zlib-compressed item table as sent in `ItemDefs`.
    pub item_defs: Bytes,
    pub announcements: Vec<MediaAnnouncement>,
    pub media: Vec<MediaFile>,
}

/// Per-backend view of the merged namespace.
#[derive(Debug, Default)]
struct BackendIds {
    to_global: AHashMap<u16, u16>,
    to_local: AHashMap<u16, u16>,
    /// Name of this backend's hand item in the merged item table.
    hand: Option<String>,
}

/// Merges backend dumps one at a time. The order of `merge_backend` calls
/// decides which definition wins on a name collision.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    nodes: Vec<NodeDef>,
    node_ids: AHashMap<String, u16>,
    next_id: u16,
    items: ItemTable,
    item_names: AHashMap<String, usize>,
    media: MediaStore,
    backends: AHashMap<String, BackendIds>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges one backend. Merging a backend a second time changes nothing.
    pub fn merge_backend(&mut self, dump: &BackendDump) -> Result<(), ContentError> {
        if self.backends.contains_key(&dump.backend) {
            tracing::debug!(backend = %dump.backend, "definitions already merged");
            return Ok(());
        }

        let node_defs = nodedefs::parse(&dump.node_defs)?;
        let item_table = itemdefs::parse(&dump.item_defs)?;

        let mut ids = BackendIds::default();
        for def in node_defs {
            let global = self.merge_node(&dump.backend, &def)?;
            ids.to_global.insert(def.id, global);
            ids.to_local.entry(global).or_insert(def.id);
        }

        for def in &item_table.defs {
            if def.name.is_empty() {
                let hand = def.renamed(&format!("{}_hand", dump.backend))?;
                ids.hand = Some(hand.name.clone());
                self.merge_item(&dump.backend, hand);
            }
            self.merge_item(&dump.backend, def.clone());
        }
        for alias in item_table.aliases {
            if !self.items.aliases.iter().any(|a| a.name == alias.name) {
                self.items.aliases.push(alias);
            }
        }

        let duplicates = self.media.merge(&dump.announcements, &dump.media);
        if !duplicates.is_empty() {
            tracing::debug!(backend = %dump.backend, count = duplicates.len(), "media already provided by another backend");
        }

        tracing::info!(
            backend = %dump.backend,
            nodes = ids.to_global.len(),
            items = item_table.defs.len(),
            "merged backend definitions"
        );
        self.backends.insert(dump.backend.clone(), ids);
        Ok(())
    }

    fn merge_node(&mut self, backend: &str, def: &NodeDef) -> Result<u16, ContentError> {
        if let Some(&global) = self.node_ids.get(&def.name) {
            if let Some(existing) = self.nodes.iter().find(|n| n.id == global) {
                if existing.def != def.def {
                    tracing::warn!(
                        backend,
                        node = %def.name,
                        "registry conflict: definition differs from the first one seen, keeping the first"
                    );
                }
            }
            return Ok(global);
        }

        let global = if is_reserved(def.id) {
            def.id
        } else {
            self.allocate()?
        };
        self.node_ids.insert(def.name.clone(), global);
        self.nodes.push(NodeDef {
            id: global,
            name: def.name.clone(),
            def: def.def.clone(),
        });
        Ok(global)
    }

    fn allocate(&mut self) -> Result<u16, ContentError> {
        while is_reserved(self.next_id) {
            self.next_id += 1;
        }
        if self.next_id > MAX_CONTENT_ID {
            return Err(ContentError::IdSpaceExhausted);
        }
        let id = self.next_id;
        self.next_id += 1;
        Ok(id)
    }

    fn merge_item(&mut self, backend: &str, def: ItemDef) {
        match self.item_names.get(&def.name) {
            Some(&index) => {
                if self.items.defs[index].def != def.def {
                    tracing::warn!(
                        backend,
                        item = %def.name,
                        "registry conflict: item definition differs from the first one seen, keeping the first"
                    );
                }
            }
            None => {
                self.item_names.insert(def.name.clone(), self.items.defs.len());
                self.items.defs.push(def);
            }
        }
    }

    /// Freezes the merged tables, compressing them once.
    pub fn build(self) -> Result<Registry, ContentError> {
        let mut nodes = self.nodes;
        nodes.sort_by_key(|n| n.id);
        Ok(Registry {
            node_defs: nodedefs::serialize(&nodes)?,
            item_defs: itemdefs::serialize(&self.items)?,
            media: self.media,
            backends: self.backends,
        })
    }
}

/// The immutable merged namespace, shared as `Arc<Registry>`.
#[derive(Debug)]
pub struct Registry {
    node_defs: Bytes,
    item_defs: Bytes,
    media: MediaStore,
    backends: AHashMap<String, BackendIds>,
}

impl Registry {
    /// Compressed merged node table for `NodeDefs`.
    pub fn node_defs(&self) -> &Bytes {
        &self.node_defs
    }

    /// Compressed merged item table for `ItemDefs`.
    pub fn item_defs(&self) -> &Bytes {
        &self.item_defs
    }

    pub fn media(&self) -> &MediaStore {
        &self.media
    }

    pub fn has_backend(&self, backend: &str) -> bool {
        self.backends.contains_key(backend)
    }

    fn ids(&self, backend: &str) -> Result<&BackendIds, ContentError> {
        self.backends
            .get(backend)
            .ok_or_else(|| ContentError::UnknownBackend(backend.to_owned()))
    }

    /// Maps a backend's id to the global one. Ids the backend never defined
    /// become [`CONTENT_UNKNOWN`].
    pub fn translate_outbound(&self, backend: &str, local: u16) -> Result<u16, ContentError> {
        if is_reserved(local) {
            return Ok(local);
        }
        let ids = self.ids(backend)?;
        Ok(ids.to_global.get(&local).copied().unwrap_or(CONTENT_UNKNOWN))
    }

    /// Maps a global id back to the backend's id.
    pub fn translate_inbound(&self, backend: &str, global: u16) -> Result<u16, ContentError> {
        if is_reserved(global) {
            return Ok(global);
        }
        let ids = self.ids(backend)?;
        Ok(ids.to_local.get(&global).copied().unwrap_or(CONTENT_UNKNOWN))
    }

    /// Rewrites a serialized block from `backend` to global ids.
    pub fn rewrite_block(
        &self,
        backend: &str,
        ser_ver: u8,
        data: &[u8],
    ) -> Result<Bytes, ContentError> {
        let ids = self.ids(backend)?;
        block::rewrite_block(data, ser_ver, |local| {
            if is_reserved(local) {
                local
            } else {
                ids.to_global.get(&local).copied().unwrap_or(CONTENT_UNKNOWN)
            }
        })
    }

    pub fn rewrite_add_node(&self, backend: &str, cmd: &mut AddNode) -> Result<(), ContentError> {
        cmd.param0 = self.translate_outbound(backend, cmd.param0)?;
        Ok(())
    }

    /// The merged name of `backend`'s hand item, if it defined one.
    pub fn hand_item(&self, backend: &str) -> Option<&str> {
        self.backends.get(backend)?.hand.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::block::{tests::make_block, tests::read_param0, NODE_COUNT};

    fn dump(backend: &str, nodes: &[(u16, &str)], items: &[&str]) -> BackendDump {
        let nodes: Vec<_> = nodes
            .iter()
            .map(|&(id, name)| NodeDef {
                id,
                name: name.into(),
                def: nodedefs::simple_def(name, &[]),
            })
            .collect();
        let items = ItemTable {
            defs: items
                .iter()
                .map(|&name| ItemDef {
                    name: name.into(),
                    def: itemdefs::simple_def(name, &[]),
                })
                .collect(),
            aliases: Vec::new(),
        };
        BackendDump {
            backend: backend.into(),
            node_defs: nodedefs::serialize(&nodes).unwrap(),
            item_defs: itemdefs::serialize(&items).unwrap(),
            ..Default::default()
        }
    }

    fn builtin(backend: &str, extra: &[(u16, &str)]) -> BackendDump {
        let mut nodes = vec![(125, "unknown"), (126, "air"), (127, "ignore")];
        nodes.extend_from_slice(extra);
        dump(backend, &nodes, &[""])
    }

    #[test]
    fn shared_names_collapse_to_one_id() {
        let mut builder = RegistryBuilder::new();
        builder
            .merge_backend(&builtin("a", &[(0, "a:dirt"), (5, "default:stone")]))
            .unwrap();
        builder
            .merge_backend(&builtin("b", &[(7, "default:stone"), (8, "b:sand")]))
            .unwrap();
        let registry = builder.build().unwrap();

        let stone_a = registry.translate_outbound("a", 5).unwrap();
        let stone_b = registry.translate_outbound("b", 7).unwrap();
        assert_eq!(stone_a, stone_b);
        assert_eq!(registry.translate_inbound("b", stone_a).unwrap(), 7);
        assert_eq!(registry.translate_inbound("a", stone_a).unwrap(), 5);

        let mut param0 = [CONTENT_AIR; NODE_COUNT];
        param0[42] = 7;
        let block = make_block(28, &param0, &[]);
        let out = registry.rewrite_block("b", 28, &block).unwrap();
        let ids = read_param0(28, &out);
        assert_eq!(ids[42], stone_a);
        assert_eq!(ids[0], CONTENT_AIR);
    }

    #[test]
    fn ids_skip_the_reserved_range() {
        let nodes: Vec<(u16, String)> = (0..200u16).map(|i| (i + 1000, format!("n:{i}"))).collect();
        let borrowed: Vec<(u16, &str)> = nodes.iter().map(|(id, n)| (*id, n.as_str())).collect();
        let mut builder = RegistryBuilder::new();
        builder.merge_backend(&dump("a", &borrowed, &[])).unwrap();
        let registry = builder.build().unwrap();

        let mut seen = Vec::new();
        for (local, _) in &borrowed {
            let global = registry.translate_outbound("a", *local).unwrap();
            assert!(!is_reserved(global));
            seen.push(global);
        }
        assert_eq!(seen[124], 124);
        assert_eq!(seen[125], 128);
    }

    #[test]
    fn translation_roundtrips_outside_reserved_range() {
        let mut builder = RegistryBuilder::new();
        builder
            .merge_backend(&builtin("a", &[(0, "x"), (1, "y"), (300, "z")]))
            .unwrap();
        builder
            .merge_backend(&builtin("b", &[(0, "z"), (2, "y"), (9, "w")]))
            .unwrap();
        let registry = builder.build().unwrap();

        for (backend, locals) in [("a", [0, 1, 300]), ("b", [0, 2, 9])] {
            for local in locals {
                let global = registry.translate_outbound(backend, local).unwrap();
                assert_eq!(registry.translate_inbound(backend, global).unwrap(), local);
                assert_eq!(
                    registry
                        .translate_outbound(backend, registry.translate_inbound(backend, global).unwrap())
                        .unwrap(),
                    global
                );
            }
        }
        assert_eq!(registry.translate_outbound("a", CONTENT_IGNORE).unwrap(), CONTENT_IGNORE);
        assert_eq!(registry.translate_outbound("a", 77).unwrap(), CONTENT_UNKNOWN);
        assert!(registry.translate_outbound("nope", 0).is_err());
    }

    #[test]
    fn merging_twice_is_idempotent() {
        let a = builtin("a", &[(3, "p"), (4, "q")]);
        let mut once = RegistryBuilder::new();
        once.merge_backend(&a).unwrap();
        let mut twice = RegistryBuilder::new();
        twice.merge_backend(&a).unwrap();
        twice.merge_backend(&a).unwrap();

        let (once, twice) = (once.build().unwrap(), twice.build().unwrap());
        for local in [3, 4] {
            assert_eq!(
                once.translate_outbound("a", local).unwrap(),
                twice.translate_outbound("a", local).unwrap()
            );
        }
        assert_eq!(once.node_defs(), twice.node_defs());
        assert_eq!(once.item_defs(), twice.item_defs());
    }

    #[test]
    fn every_backend_keeps_its_hand() {
        let mut builder = RegistryBuilder::new();
        builder.merge_backend(&builtin("a", &[])).unwrap();
        builder.merge_backend(&builtin("b", &[])).unwrap();
        let registry = builder.build().unwrap();

        assert_eq!(registry.hand_item("a"), Some("a_hand"));
        assert_eq!(registry.hand_item("b"), Some("b_hand"));
        let items = itemdefs::parse(registry.item_defs()).unwrap();
        let names: Vec<_> = items.defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["a_hand", "", "b_hand"]);
    }

    #[test]
    fn add_node_is_translated() {
        let mut builder = RegistryBuilder::new();
        builder.merge_backend(&builtin("a", &[(0, "x")])).unwrap();
        builder.merge_backend(&builtin("b", &[(9, "x")])).unwrap();
        let registry = builder.build().unwrap();

        let mut cmd = AddNode {
            pos: Default::default(),
            param0: 9,
            param1: 0,
            param2: 0,
            keep_meta: false,
        };
        registry.rewrite_add_node("b", &mut cmd).unwrap();
        assert_eq!(cmd.param0, registry.translate_outbound("a", 0).unwrap());
    }
}
