//! Typed callbacks and chat commands.
//!
//! A failing or panicking handler is logged and otherwise ignored; it never
//! takes down the session that invoked it.

use crate::proxy::Proxy;
use ahash::AHashMap;
use futures::{future::BoxFuture, FutureExt};
use std::{
    collections::BTreeSet,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

/// Result of a redirect attempt, reported once per attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectComplete {
    pub client: String,
    pub target: String,
    pub success: bool,
}

/// One invocation of a chat command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandCall {
    pub client: String,
    pub args: Vec<String>,
}

/// Reply text for the invoking player, if any.
pub type CommandResult = anyhow::Result<Option<String>>;

type CommandHandler = Arc<dyn Fn(Proxy, CommandCall) -> BoxFuture<'static, CommandResult> + Send + Sync>;
type ChatMessageHandler = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;
type RedirectHandler = Arc<dyn Fn(&RedirectComplete) + Send + Sync>;
type PlayerHandler = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone)]
pub struct ChatCommand {
    pub name: String,
    pub help: String,
    /// All of these are needed to run the command.
    pub privileges: BTreeSet<String>,
    handler: CommandHandler,
}

impl ChatCommand {
    pub fn new<F, Fut>(name: &str, help: &str, handler: F) -> Self
    where
        F: Fn(Proxy, CommandCall) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = CommandResult> + Send + 'static,
    {
        Self {
            name: name.to_owned(),
            help: help.to_owned(),
            privileges: BTreeSet::new(),
            handler: Arc::new(move |proxy, call| handler(proxy, call).boxed()),
        }
    }

    pub fn requires(mut self, privilege: &str) -> Self {
        self.privileges.insert(privilege.to_owned());
        self
    }
}

impl fmt::Debug for ChatCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatCommand")
            .field("name", &self.name)
            .field("privileges", &self.privileges)
            .finish_non_exhaustive()
    }
}

/// Every registered callback. Frozen once the proxy starts.
#[derive(Default)]
pub struct Hooks {
    commands: AHashMap<String, ChatCommand>,
    chat_message: Vec<ChatMessageHandler>,
    redirect_complete: Vec<RedirectHandler>,
    join: Vec<PlayerHandler>,
    leave: Vec<PlayerHandler>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut commands: Vec<_> = self.commands.keys().collect();
        commands.sort();
        f.debug_struct("Hooks")
            .field("commands", &commands)
            .field("chat_message", &self.chat_message.len())
            .field("redirect_complete", &self.redirect_complete.len())
            .field("join", &self.join.len())
            .field("leave", &self.leave.len())
            .finish()
    }
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hooks with the built-in `server`, `send`, `grant` and `revoke`
    /// commands registered.
    pub fn with_builtins() -> Self {
        let mut hooks = Self::new();
        for command in builtin::commands() {
            hooks.register_command(command);
        }
        hooks
    }

    /// Adds a command, replacing one with the same name.
    pub fn register_command(&mut self, command: ChatCommand) {
        if self.commands.contains_key(&command.name) {
            tracing::warn!(command = %command.name, "replacing chat command");
        }
        self.commands.insert(command.name.clone(), command);
    }

    /// Called with the player and text of every chat message that is not a
    /// command. Returning `true` keeps the message from the backend.
    pub fn on_chat_message(&mut self, f: impl Fn(&str, &str) -> bool + Send + Sync + 'static) {
        self.chat_message.push(Arc::new(f));
    }

    pub fn on_redirect_complete(&mut self, f: impl Fn(&RedirectComplete) + Send + Sync + 'static) {
        self.redirect_complete.push(Arc::new(f));
    }

    pub fn on_join(&mut self, f: impl Fn(&str) + Send + Sync + 'static) {
        self.join.push(Arc::new(f));
    }

    pub fn on_leave(&mut self, f: impl Fn(&str) + Send + Sync + 'static) {
        self.leave.push(Arc::new(f));
    }

    pub fn command(&self, name: &str) -> Option<&ChatCommand> {
        self.commands.get(name)
    }

    /// Runs a chat command line (without the prefix).
    ///
    /// Returns `None` when no such command exists, so the line can go to the
    /// backend instead. Otherwise returns the text to show the player.
    pub async fn dispatch_command(
        &self,
        proxy: &Proxy,
        client: &str,
        line: &str,
    ) -> Option<Option<String>> {
        let mut words = line.split_whitespace();
        let command = self.commands.get(words.next()?)?;
        let call = CommandCall {
            client: client.to_owned(),
            args: words.map(str::to_owned).collect(),
        };

        if !proxy.has_privileges(client, &command.privileges) {
            let missing: Vec<_> = command.privileges.iter().map(String::as_str).collect();
            return Some(Some(format!(
                "You need these privileges: {}",
                missing.join(", ")
            )));
        }

        tracing::debug!(client, command = %command.name, "running chat command");
        let handler = Arc::clone(&command.handler);
        let future = match catch_unwind(AssertUnwindSafe(|| handler(proxy.clone(), call))) {
            Ok(future) => future,
            Err(_) => {
                tracing::error!(client, command = %command.name, "chat command panicked");
                return Some(Some("Command failed.".to_owned()));
            }
        };
        let reply = match AssertUnwindSafe(future).catch_unwind().await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                tracing::warn!(client, command = %command.name, "chat command failed: {e:#}");
                Some(format!("Error: {e}"))
            }
            Err(_) => {
                tracing::error!(client, command = %command.name, "chat command panicked");
                Some("Command failed.".to_owned())
            }
        };
        Some(reply)
    }

    /// Whether a handler consumed the message.
    pub fn chat_message(&self, client: &str, text: &str) -> bool {
        let mut consumed = false;
        for handler in &self.chat_message {
            consumed |= isolate("chat message", || handler(client, text)).unwrap_or(false);
        }
        consumed
    }

    pub fn redirect_complete(&self, event: &RedirectComplete) {
        for handler in &self.redirect_complete {
            isolate("redirect complete", || handler(event));
        }
    }

    pub fn join(&self, client: &str) {
        for handler in &self.join {
            isolate("join", || handler(client));
        }
    }

    pub fn leave(&self, client: &str) {
        for handler in &self.leave {
            isolate("leave", || handler(client));
        }
    }
}

fn isolate<T>(hook: &str, f: impl FnOnce() -> T) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::error!(hook, "hook panicked");
            None
        }
    }
}

mod builtin {
    use super::{ChatCommand, CommandCall, CommandResult};
    use crate::proxy::Proxy;
    use anyhow::bail;

    pub fn commands() -> Vec<ChatCommand> {
        vec![
            ChatCommand::new("server", "[name]: show or switch your server", server),
            ChatCommand::new("send", "<player> <server>: move a player", send).requires("send"),
            ChatCommand::new("grant", "<player> <priv>: grant a privilege", grant)
                .requires("privs"),
            ChatCommand::new("revoke", "<player> <priv>: revoke a privilege", revoke)
                .requires("privs"),
        ]
    }

    async fn server(proxy: Proxy, call: CommandCall) -> CommandResult {
        match call.args.as_slice() {
            [] => {
                let current = proxy.current_backend(&call.client).unwrap_or_default();
                let names: Vec<_> = proxy
                    .config()
                    .servers
                    .iter()
                    .map(|s| s.name.as_str())
                    .collect();
                Ok(Some(format!(
                    "Current server: {current}. Servers: {}",
                    names.join(", ")
                )))
            }
            [target] => {
                proxy.redirect(&call.client, target).await?;
                Ok(None)
            }
            _ => bail!("usage: server [name]"),
        }
    }

    async fn send(proxy: Proxy, call: CommandCall) -> CommandResult {
        let [player, target] = call.args.as_slice() else {
            bail!("usage: send <player> <server>");
        };
        proxy.redirect(player, target).await?;
        Ok(Some(format!("Sent {player} to {target}.")))
    }

    async fn grant(proxy: Proxy, call: CommandCall) -> CommandResult {
        let [player, privilege] = call.args.as_slice() else {
            bail!("usage: grant <player> <priv>");
        };
        let store = proxy.store();
        let mut privileges = store.read_privileges(player)?;
        privileges.insert(privilege.clone());
        store.write_privileges(player, privileges)?;
        tracing::info!(client = %call.client, player = %player, privilege = %privilege, "granted privilege");
        Ok(Some(format!("Granted {privilege} to {player}.")))
    }

    async fn revoke(proxy: Proxy, call: CommandCall) -> CommandResult {
        let [player, privilege] = call.args.as_slice() else {
            bail!("usage: revoke <player> <priv>");
        };
        let store = proxy.store();
        let mut privileges = store.read_privileges(player)?;
        if !privileges.remove(privilege) {
            return Ok(Some(format!("{player} does not have {privilege}.")));
        }
        store.write_privileges(player, privileges)?;
        tracing::info!(client = %call.client, player = %player, privilege = %privilege, "revoked privilege");
        Ok(Some(format!("Revoked {privilege} from {player}.")))
    }
}
