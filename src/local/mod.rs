//! The local proxy service.
//!
//! [`Local`] owns the frozen configuration snapshot, the session
//! registry, the metrics, and the per-listener RNG used for upstream
//! selection. It accepts SOCKS5 clients and hands each one to a
//! session task; per-connection failures never take the listener down.
//!
//! ## Lifecycle
//!
//! ```text
//! bind ──▶ accept loop ──▶ session tasks (registry-tracked)
//!              │                  ▲
//!   SIGINT/SIGTERM or             │ shutdown watch channel
//!   Local::shutdown ──▶ stop accepting, signal sessions,
//!                       drain to completion
//! ```

mod connect;
mod metrics;
mod registry;
mod session;

pub use metrics::LocalMetrics;
pub use registry::{SessionEntry, SessionId, SessionRegistry};

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::config::Config;
use crate::error::Result;
use session::Session;

/// The local proxy: listener, registry, and lifecycle.
pub struct Local {
    config: Arc<Config>,
    registry: Arc<SessionRegistry>,
    metrics: Arc<LocalMetrics>,
    rng: Arc<Mutex<StdRng>>,
    shutdown: watch::Sender<bool>,
}

impl Local {
    /// Create a proxy from a configuration snapshot.
    ///
    /// The upstream-selection RNG is seeded here, once, per listener.
    pub fn new(config: Config) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config: Arc::new(config),
            registry: Arc::new(SessionRegistry::new()),
            metrics: Arc::new(LocalMetrics::new()),
            rng: Arc::new(Mutex::new(StdRng::from_entropy())),
            shutdown,
        }
    }

    /// The configuration snapshot.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The live-session registry.
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// The metrics collector.
    pub fn metrics(&self) -> &LocalMetrics {
        &self.metrics
    }

    /// Request a graceful shutdown of a running [`Local::serve`].
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Bind the SOCKS5 listening socket.
    ///
    /// Bind failures are fatal; the binary exits on them.
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = format!("{}:{}", self.config.local_addr, self.config.local_port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!("bind {addr} failed: {e}");
                return Err(e.into());
            }
        };
        tracing::info!("listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept clients until shutdown, then drain every session.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        self.raise_nofile();

        let mut shutdown_rx = self.shutdown.subscribe();
        let mut sessions = JoinSet::new();

        let signal = shutdown_signal();
        tokio::pin!(signal);

        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((client, peer)) => self.spawn_session(&mut sessions, client, peer),
                    // The listener never dies on per-connection errors.
                    Err(e) => tracing::warn!("accept error: {e}"),
                },
                _ = &mut signal => {
                    tracing::info!("signal received, shutting down");
                    break;
                }
                _ = shutdown_rx.changed() => break,
            }
        }

        drop(listener);
        let live = self.registry.count();
        if live > 0 {
            tracing::info!("closing {live} live sessions");
        }
        let _ = self.shutdown.send(true);
        while sessions.join_next().await.is_some() {}
        debug_assert!(self.registry.is_empty());
        tracing::info!("shutdown complete");
        Ok(())
    }

    fn spawn_session(&self, sessions: &mut JoinSet<()>, client: TcpStream, peer: SocketAddr) {
        let guard = SessionRegistry::register(&self.registry, peer);
        tracing::debug!("session {} accepted from {peer}", guard.id());
        self.metrics.session_opened();

        let session = Session::new(
            client,
            peer,
            Arc::clone(&self.config),
            Arc::clone(&self.metrics),
            Arc::clone(&self.rng),
            guard,
        );
        sessions.spawn(session.run(self.shutdown.subscribe()));
    }

    #[cfg(unix)]
    fn raise_nofile(&self) {
        use nix::sys::resource::{getrlimit, setrlimit, Resource};

        let Some(target) = self.config.nofile else {
            return;
        };
        match getrlimit(Resource::RLIMIT_NOFILE) {
            Ok((soft, hard)) => {
                let new_soft = target.min(hard);
                if new_soft > soft {
                    match setrlimit(Resource::RLIMIT_NOFILE, new_soft, hard) {
                        Ok(()) => tracing::debug!("raised NOFILE soft limit to {new_soft}"),
                        Err(e) => tracing::warn!("setting NOFILE to {new_soft} failed: {e}"),
                    }
                }
            }
            Err(e) => tracing::warn!("reading NOFILE limit failed: {e}"),
        }
    }

    #[cfg(not(unix))]
    fn raise_nofile(&self) {
        if self.config.nofile.is_some() {
            tracing::warn!("nofile is only supported on Unix, ignoring");
        }
    }
}

/// Resolve when the process is asked to stop.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                tracing::warn!("installing SIGTERM handler failed: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerAddr;
    use crate::crypto::CipherKind;
    use std::time::Duration;

    fn test_config() -> Config {
        Config::new(
            vec![ServerAddr {
                host: "127.0.0.1".into(),
                port: 1,
            }],
            "127.0.0.1".into(),
            0,
            CipherKind::Aes128Ctr,
            "pw",
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn test_serve_shuts_down_cleanly() {
        let local = Arc::new(Local::new(test_config()));
        let listener = local.bind().await.unwrap();

        let serving = Arc::clone(&local);
        let handle = tokio::spawn(async move { serving.serve(listener).await });

        local.shutdown();
        handle.await.unwrap().unwrap();
        assert!(local.registry().is_empty());
    }
}
