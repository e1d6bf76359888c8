//! Configuration data structures for hostgate.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files.
//! A file lists virtual hosts and the backend each one is forwarded to:
//!
//! ```toml
//! [[servers]]
//! host = "a.example.com"
//! backend_url = "http://127.0.0.1:9001/api"
//!
//! [[servers]]
//! host = "*"
//! backend_url = "http://127.0.0.1:9000"
//! ```
use serde::{Deserialize, Serialize};

/// Token that matches any host not listed explicitly.
pub const WILDCARD_HOST: &str = "*";

/// Root of the configuration file.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Virtual hosts in file order. Later duplicates override earlier ones.
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
}

/// A single `host => backend_url` mapping.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerEntry {
    pub host: String,
    pub backend_url: String,
}

impl ServerEntry {
    pub fn new(host: impl Into<String>, backend_url: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            backend_url: backend_url.into(),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.host == WILDCARD_HOST
    }
}

impl ProxyConfig {
    /// Create a new configuration builder
    pub fn builder() -> ProxyConfigBuilder {
        ProxyConfigBuilder::default()
    }

    /// `(host, backend_url)` pairs in file order, ready for the routing table.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.servers
            .iter()
            .map(|s| (s.host.as_str(), s.backend_url.as_str()))
    }
}

/// Builder for ProxyConfig to allow for cleaner configuration creation
#[derive(Debug, Default)]
pub struct ProxyConfigBuilder {
    servers: Vec<ServerEntry>,
}

impl ProxyConfigBuilder {
    /// Map `host` to `backend_url`.
    pub fn server(mut self, host: impl Into<String>, backend_url: impl Into<String>) -> Self {
        self.servers.push(ServerEntry::new(host, backend_url));
        self
    }

    /// Map every unlisted host to `backend_url`.
    pub fn fallback(self, backend_url: impl Into<String>) -> Self {
        self.server(WILDCARD_HOST, backend_url)
    }

    pub fn build(self) -> ProxyConfig {
        ProxyConfig {
            servers: self.servers,
        }
    }
}
