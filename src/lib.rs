//! # sslocal
//!
//! Local half of a shadowsocks-style circumvention tunnel: a SOCKS5
//! server that forwards every accepted connection through one of a set
//! of remote relay servers, encrypting the whole stream with a
//! password-derived stream cipher.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────┐  SOCKS5   ┌────────────────────────────┐   encrypted    ┌────────┐
//! │  client  │──────────▶│  sslocal                   │───────────────▶│ relay  │
//! │(browser) │           │  ┌─────────┐  ┌──────────┐ │  [ATYP|ADDR|   │ server │
//! └──────────┘           │  │ SOCKS5  │  │  stream  │ │   PORT|data…]  └───┬────┘
//!                        │  │ engine  │─▶│  cipher  │ │                    │
//!                        │  └─────────┘  └──────────┘ │                    ▼
//!                        │        │ ACL bypass        │               ┌────────┐
//!                        │        └────────(plaintext)────────────────▶ target │
//!                        └────────────────────────────┘               └────────┘
//! ```
//!
//! Each accepted client becomes one session: the SOCKS5 negotiation is
//! answered locally, the request's destination is re-encoded as the
//! tunnel address header, and from then on the session is a full-duplex
//! encrypted pipe. Destinations matching the optional [`acl::Acl`] are
//! dialed directly, without a relay and without encryption.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod acl;
pub mod config;
pub mod crypto;
pub mod error;
pub mod local;
pub mod socks5;

pub use config::{Config, ServerAddr};
pub use error::{Error, Result};
pub use local::Local;

use std::path::PathBuf;

/// Capacity of the per-direction relay buffer in bytes.
///
/// Bounds per-session memory: at most two of these are in flight at
/// any instant (one per direction).
pub const BUF_SIZE: usize = 2048;

/// Default per-connection connect timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Default local bind address.
pub const DEFAULT_LOCAL_ADDR: &str = "0.0.0.0";

/// Embedding entry point: a single-upstream proxy profile.
///
/// Hosts that link `sslocal` as a library fill one of these in and
/// call [`Profile::run`], which drives the proxy loop to completion on
/// the calling thread and returns when the loop exits.
#[derive(Debug, Clone)]
pub struct Profile {
    /// Relay server hostname or address.
    pub server: String,
    /// Relay server port.
    pub server_port: u16,
    /// Local bind address (`0.0.0.0` when `None`).
    pub local_addr: Option<String>,
    /// Local SOCKS5 port.
    pub local_port: u16,
    /// Tunnel password.
    pub password: String,
    /// Cipher method name (default method when `None`).
    pub method: Option<String>,
    /// Connect timeout in seconds (default when `None`).
    pub timeout: Option<u64>,
    /// Answer UDP ASSOCIATE with the stub reply.
    pub udp_relay: bool,
    /// Attempt TCP Fast Open on upstream connects.
    pub fast_open: bool,
    /// Raise the default log level to debug.
    pub verbose: bool,
    /// Optional bypass ACL file.
    pub acl: Option<PathBuf>,
    /// Optional log file; `None` logs to stderr.
    pub log: Option<PathBuf>,
}

impl Profile {
    /// Run a single-upstream proxy to completion on the calling thread.
    ///
    /// The whole engine runs on one cooperative scheduler; no work is
    /// moved off this thread. Returns when the loop exits (signal or
    /// fatal error).
    pub fn run(self) -> Result<()> {
        self.init_logging();

        let method = match &self.method {
            Some(name) => name.parse()?,
            None => crypto::CipherKind::default(),
        };

        let mut config = Config::new(
            vec![ServerAddr {
                host: self.server,
                port: self.server_port,
            }],
            self.local_addr
                .unwrap_or_else(|| DEFAULT_LOCAL_ADDR.to_string()),
            self.local_port,
            method,
            &self.password,
            std::time::Duration::from_secs(self.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS)),
        );
        config.udp_relay = self.udp_relay;
        config.fast_open = self.fast_open;
        if let Some(path) = &self.acl {
            config.acl = Some(acl::Acl::load(path)?);
        }
        config.validate().map_err(Error::Config)?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        runtime.block_on(async {
            let local = Local::new(config);
            let listener = local.bind().await?;
            local.serve(listener).await
        })
    }

    fn init_logging(&self) {
        let default_level = if self.verbose { "debug" } else { "info" };
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false);

        let result = match &self.log {
            Some(path) => match std::fs::File::options().create(true).append(true).open(path) {
                Ok(file) => builder
                    .with_writer(std::sync::Arc::new(file))
                    .with_ansi(false)
                    .try_init(),
                Err(_) => builder.try_init(),
            },
            None => builder.try_init(),
        };
        // The host may have installed its own subscriber already.
        let _ = result;
    }
}
