//! Reverse proxy that puts several Minetest servers behind one address.
//!
//! Clients connect to the proxy as if it were a single server. The proxy
//! authenticates them itself, serves one definition namespace merged from
//! every backend, and then forwards each client to a backend of its choice.
//! Clients can be moved between backends while connected.
//!
//! # Content ids
//! Backends number their nodes independently. At startup the proxy logs in
//! to every backend, downloads its definitions and merges them by node name;
//! map data and node updates are rewritten to the merged ids in flight.
//!
//! # Redirects
//! A redirect logs in to the new backend on the player's behalf, clears the
//! objects and inventories the old backend created on the client, swaps the
//! backend connection and replays the player's mod channel memberships.

use anyhow::Context;
use content::{fetch::fetch, RegistryBuilder};
use credentials::{CredentialStore, FileStore, MemoryStore};
use std::sync::Arc;

pub mod active_object;
pub mod auth;
pub mod config;
pub mod content;
pub mod credentials;
pub mod gateway;
pub mod hooks;
pub mod protocol;
pub mod proxy;
pub mod redirect;
pub mod session;
pub mod transport;

pub use config::Config;
pub use hooks::Hooks;
pub use proxy::Proxy;

/// Fetches every backend's definitions in declaration order and merges
/// them.
pub async fn build_registry(config: &Config) -> anyhow::Result<content::Registry> {
    let mut builder = RegistryBuilder::new();
    for server in &config.servers {
        let dump = fetch(
            &server.name,
            server.addr,
            &config.fetch_user,
            config.handshake_timeout(),
        )
        .await?;
        builder
            .merge_backend(&dump)
            .with_context(|| format!("merging definitions of {}", server.name))?;
    }
    Ok(builder.build()?)
}

/// Runs the proxy until the listener fails.
pub async fn run(config: Config, hooks: Hooks) -> anyhow::Result<()> {
    let store: Arc<dyn CredentialStore> = match &config.credentials_path {
        Some(path) => Arc::new(FileStore::open(path)?),
        None => {
            tracing::warn!("no credentials_path configured, accounts are not persisted");
            Arc::new(MemoryStore::new())
        }
    };
    let registry = build_registry(&config).await?;
    let listener = transport::Listener::bind(config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;

    let proxy = Proxy::new(config, registry, store, hooks);
    gateway::run(proxy, listener).await
}
