//! The handle other parts of the proxy, and hooks, use to reach clients.

use crate::{
    config::Config,
    content::Registry,
    credentials::CredentialStore,
    hooks::Hooks,
    protocol::packet::{KickReason, ToCltCmd},
    redirect::{self, RedirectError},
    session::Session,
};
use ahash::AHashMap;
use anyhow::Context;
use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex, MutexGuard},
};

/// Shared proxy state. Cheap to clone.
#[derive(Clone)]
pub struct Proxy {
    shared: Arc<Shared>,
}

struct Shared {
    config: Config,
    registry: Registry,
    store: Arc<dyn CredentialStore>,
    hooks: Hooks,
    /// Directory of connected clients by name.
    sessions: Mutex<AHashMap<String, Arc<Session>>>,
}

impl Proxy {
    pub fn new(
        config: Config,
        registry: Registry,
        store: Arc<dyn CredentialStore>,
        hooks: Hooks,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                registry,
                store,
                hooks,
                sessions: Mutex::new(AHashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.shared.store
    }

    pub fn hooks(&self) -> &Hooks {
        &self.shared.hooks
    }

    fn sessions(&self) -> MutexGuard<'_, AHashMap<String, Arc<Session>>> {
        self.shared
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn session(&self, client: &str) -> Option<Arc<Session>> {
        self.sessions().get(client).cloned()
    }

    /// Registers a freshly authenticated client.
    pub(crate) fn claim(&self, session: &Arc<Session>) -> Result<(), KickReason> {
        let mut sessions = self.sessions();
        if sessions.contains_key(session.name()) {
            return Err(KickReason::AlreadyConnected);
        }
        if sessions.len() >= self.config().user_limit {
            return Err(KickReason::TooManyClts);
        }
        sessions.insert(session.name().to_owned(), Arc::clone(session));
        Ok(())
    }

    pub(crate) fn release(&self, session: &Arc<Session>) {
        let mut sessions = self.sessions();
        if sessions
            .get(session.name())
            .is_some_and(|s| Arc::ptr_eq(s, session))
        {
            sessions.remove(session.name());
        }
    }

    /// Names of every connected client, sorted.
    pub fn clients(&self) -> Vec<String> {
        let mut names: Vec<_> = self.sessions().keys().cloned().collect();
        names.sort();
        names
    }

    /// The backend `client` is playing on.
    pub fn current_backend(&self, client: &str) -> Option<String> {
        self.session(client)?.backend_name()
    }

    pub async fn send_to_client(&self, client: &str, cmd: &ToCltCmd) -> anyhow::Result<()> {
        let session = self
            .session(client)
            .with_context(|| format!("no client named {client}"))?;
        let _ = session.client().send_cmd(cmd).await?;
        Ok(())
    }

    /// Moves `client` to the backend named `target`.
    pub async fn redirect(&self, client: &str, target: &str) -> Result<(), RedirectError> {
        let session = self
            .session(client)
            .ok_or_else(|| RedirectError::NoSuchClient(client.to_owned()))?;
        redirect::redirect(self, &session, target).await
    }

    /// Admins hold every privilege.
    pub fn has_privileges(&self, client: &str, required: &BTreeSet<String>) -> bool {
        if required.is_empty() || self.config().admins.contains(client) {
            return true;
        }
        match self.store().read_privileges(client) {
            Ok(held) => required.is_subset(&held),
            Err(e) => {
                tracing::error!(client, "reading privileges failed: {e}");
                false
            }
        }
    }
}
