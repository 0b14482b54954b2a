//! Proxy configuration, loaded from a TOML file.

use anyhow::{bail, Context};
use serde::Deserialize;
use std::{collections::BTreeSet, net::SocketAddr, path::Path, path::PathBuf, time::Duration};

/// One backend server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub addr: SocketAddr,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind_addr: SocketAddr,
    /// Backends in the order their definitions are merged.
    pub servers: Vec<ServerConfig>,
    /// Where clients land after joining. Defaults to the first server.
    pub default_server: Option<String>,
    /// Tried in order when a client loses its backend.
    pub fallback_servers: Vec<String>,
    pub command_prefix: String,
    pub user_limit: usize,
    pub require_password: bool,
    /// Account used to download definitions at startup.
    pub fetch_user: String,
    /// Credential snapshot. Accounts are kept in memory only when unset.
    pub credentials_path: Option<PathBuf>,
    pub handshake_timeout_secs: u64,
    /// Players holding every privilege.
    pub admins: BTreeSet<String>,

    #[serde(skip)]
    raw: toml::Table,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 40000)),
            servers: Vec::new(),
            default_server: None,
            fallback_servers: Vec::new(),
            command_prefix: ">".to_owned(),
            user_limit: 10,
            require_password: false,
            fetch_user: "proxy".to_owned(),
            credentials_path: None,
            handshake_timeout_secs: 10,
            admins: BTreeSet::new(),
            raw: toml::Table::new(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = fs_err::read_to_string(path)?;
        Self::parse(&text).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let raw: toml::Table = toml::from_str(text)?;
        let mut config: Config = toml::from_str(text)?;
        config.raw = raw;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.servers.is_empty() {
            bail!("at least one server must be configured");
        }
        let mut names = BTreeSet::new();
        for server in &self.servers {
            if server.name.is_empty() {
                bail!("server names must not be empty");
            }
            if !names.insert(server.name.as_str()) {
                bail!("server name {} is used twice", server.name);
            }
        }
        if let Some(default) = &self.default_server {
            if !names.contains(default.as_str()) {
                bail!("default server {default} is not configured");
            }
        }
        for fallback in &self.fallback_servers {
            if !names.contains(fallback.as_str()) {
                bail!("fallback server {fallback} is not configured");
            }
        }
        if self.command_prefix.is_empty() {
            bail!("command prefix must not be empty");
        }
        Ok(())
    }

    /// The raw value at a dotted path, such as `servers.0.name`.
    pub fn get(&self, path: &str) -> Option<&toml::Value> {
        let mut segments = path.split('.');
        let mut value = self.raw.get(segments.next()?)?;
        for segment in segments {
            value = match value {
                toml::Value::Table(table) => table.get(segment)?,
                toml::Value::Array(array) => array.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(value)
    }

    pub fn server(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|s| s.name == name)
    }

    pub fn default_server(&self) -> Option<&ServerConfig> {
        match &self.default_server {
            Some(name) => self.server(name),
            None => self.servers.first(),
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
        bind_addr = "127.0.0.1:30000"
        default_server = "lobby"
        fallback_servers = ["lobby"]
        admins = ["sam"]

        [[servers]]
        name = "lobby"
        addr = "127.0.0.1:30001"

        [[servers]]
        name = "survival"
        addr = "127.0.0.1:30002"

        [plugins.greeter]
        text = "hi"
    "#;

    #[test]
    fn parses_and_keeps_server_order() {
        let config = Config::parse(EXAMPLE).unwrap();
        let names: Vec<_> = config.servers.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["lobby", "survival"]);
        assert_eq!(config.default_server().unwrap().name, "lobby");
        assert_eq!(config.command_prefix, ">");
        assert!(config.admins.contains("sam"));
    }

    #[test]
    fn get_walks_tables_and_arrays() {
        let config = Config::parse(EXAMPLE).unwrap();
        assert_eq!(
            config.get("servers.1.name").and_then(|v| v.as_str()),
            Some("survival")
        );
        assert_eq!(
            config.get("plugins.greeter.text").and_then(|v| v.as_str()),
            Some("hi")
        );
        assert!(config.get("servers.7.name").is_none());
        assert!(config.get("bind_addr.port").is_none());
        assert!(config.get("missing").is_none());
    }

    #[test]
    fn rejects_inconsistent_server_lists() {
        assert!(Config::parse("").is_err());
        let duplicate = r#"
            [[servers]]
            name = "a"
            addr = "127.0.0.1:1"
            [[servers]]
            name = "a"
            addr = "127.0.0.1:2"
        "#;
        assert!(Config::parse(duplicate).is_err());
        let unknown_default = r#"
            default_server = "b"
            [[servers]]
            name = "a"
            addr = "127.0.0.1:1"
        "#;
        assert!(Config::parse(unknown_default).is_err());
        let unknown_fallback = r#"
            fallback_servers = ["c"]
            [[servers]]
            name = "a"
            addr = "127.0.0.1:1"
        "#;
        assert!(Config::parse(unknown_fallback).is_err());
    }
}
