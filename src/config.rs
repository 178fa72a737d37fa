//! Proxy configuration.
//!
//! [`Config`] is the frozen snapshot every session references: the
//! relay list, cipher method, derived key, and timers. [`ConfigFile`]
//! is the JSON configuration file format, compatible with the common
//! shadowsocks client layout (`server`, `server_port`, `local_port`,
//! `password`, …); command-line flags override file values.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use crate::acl::Acl;
use crate::crypto::{derive_key, CipherKind, KeyMaterial};
use crate::error::{Error, Result};

/// Multiplier from the connect timeout to the streaming idle window.
///
/// The idle watchdog runs in one-minute multiples of the configured
/// timeout, so short connect timeouts do not evict long-lived but
/// quiet tunnels.
pub const IDLE_MULTIPLIER: u32 = 60;

/// One relay server endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddr {
    /// Hostname or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Runtime configuration snapshot.
///
/// Built once at startup and shared read-only by every session. Only
/// the process-wide fast-open availability flag (kept elsewhere) is
/// mutable after this point.
#[derive(Debug, Clone)]
pub struct Config {
    /// Local bind address.
    pub local_addr: String,
    /// Local SOCKS5 port.
    pub local_port: u16,
    /// Relay servers; one is drawn uniformly per session.
    pub servers: Vec<ServerAddr>,
    /// Cipher method.
    pub method: CipherKind,
    /// Password-derived key for `method`.
    pub key: KeyMaterial,
    /// Upstream connect timeout.
    pub timeout: Duration,
    /// Attempt TCP Fast Open on upstream connects.
    pub fast_open: bool,
    /// Answer UDP ASSOCIATE with the stub reply.
    pub udp_relay: bool,
    /// Bind upstream sockets to this interface (Linux only).
    pub iface: Option<String>,
    /// Bypass ACL; `None` relays everything.
    pub acl: Option<Acl>,
    /// Raise the soft file-descriptor limit to this at startup.
    pub nofile: Option<u64>,
}

impl Config {
    /// Create a configuration, deriving the cipher key from the
    /// password.
    pub fn new(
        servers: Vec<ServerAddr>,
        local_addr: String,
        local_port: u16,
        method: CipherKind,
        password: &str,
        timeout: Duration,
    ) -> Self {
        let key = derive_key(password.as_bytes(), method.key_len());
        Self {
            local_addr,
            local_port,
            servers,
            method,
            key,
            timeout,
            fast_open: false,
            udp_relay: false,
            iface: None,
            acl: None,
            nofile: None,
        }
    }

    /// The streaming idle window: `timeout` × one minute.
    pub fn idle_timeout(&self) -> Duration {
        self.timeout * IDLE_MULTIPLIER
    }

    /// Validate the configuration.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.servers.is_empty() {
            return Err("at least one server must be configured".into());
        }
        if self.local_addr.is_empty() {
            return Err("local_addr cannot be empty".into());
        }
        if self.timeout.is_zero() {
            return Err("timeout cannot be zero".into());
        }
        Ok(())
    }
}

/// Configuration file format (JSON).
#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Relay server host, a single string or an array of strings.
    #[serde(default, deserialize_with = "string_or_list")]
    pub server: Vec<String>,
    /// Relay server port.
    pub server_port: Option<u16>,
    /// Local bind address.
    pub local_address: Option<String>,
    /// Local SOCKS5 port.
    pub local_port: Option<u16>,
    /// Tunnel password.
    pub password: Option<String>,
    /// Cipher method name.
    pub method: Option<String>,
    /// Connect timeout in seconds.
    pub timeout: Option<u64>,
    /// Attempt TCP Fast Open.
    #[serde(default)]
    pub fast_open: bool,
    /// Soft file-descriptor limit.
    pub nofile: Option<u64>,
}

impl ConfigFile {
    /// Load and parse a configuration file.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&content)
            .map_err(|e| Error::config(format!("{}: {e}", path.display())))
    }
}

/// Accept `"server": "host"` as well as `"server": ["h1", "h2"]`.
fn string_or_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrList {
        One(String),
        Many(Vec<String>),
    }

    Ok(match StringOrList::deserialize(deserializer)? {
        StringOrList::One(host) => vec![host],
        StringOrList::Many(hosts) => hosts,
    })
}
