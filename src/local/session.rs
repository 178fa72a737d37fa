//! One proxied connection.
//!
//! A session pairs the accepted SOCKS5 client with at most one
//! upstream (a relay server, or the literal destination when the ACL
//! bypasses it). The negotiation runs through the stages of RFC 1928
//! sequentially; streaming is two directional pipes joined so that
//! either side finishing (EOF, error, or the idle watchdog) tears
//! the whole session down. Half-close is deliberately not propagated.
//!
//! Backpressure needs no explicit watcher flipping here: each pipe
//! fully drains its write before issuing the next read, so at most one
//! direction per endpoint is in flight and per-session buffering stays
//! bounded at two segments.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::config::Config;
use crate::crypto::{DecryptContext, EncryptContext};
use crate::error::{Error, Result};
use crate::local::connect;
use crate::local::metrics::LocalMetrics;
use crate::local::registry::RegistryGuard;
use crate::socks5::{self, Address, Request};
use crate::BUF_SIZE;

pub(crate) struct Session {
    guard: RegistryGuard,
    client: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<Config>,
    metrics: Arc<LocalMetrics>,
    rng: Arc<Mutex<StdRng>>,
}

impl Session {
    pub(crate) fn new(
        client: TcpStream,
        peer_addr: SocketAddr,
        config: Arc<Config>,
        metrics: Arc<LocalMetrics>,
        rng: Arc<Mutex<StdRng>>,
        guard: RegistryGuard,
    ) -> Self {
        Self {
            guard,
            client,
            peer_addr,
            config,
            metrics,
            rng,
        }
    }

    /// Drive the session until it finishes or shutdown is signaled.
    ///
    /// Returning from here closes both sockets, drops both cipher
    /// contexts, and clears the registry entry, whichever path got us
    /// here.
    pub(crate) async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let id = self.guard.id();
        let peer = self.peer_addr;
        let metrics = Arc::clone(&self.metrics);

        let drive = self.drive();
        tokio::pin!(drive);

        tokio::select! {
            result = &mut drive => match result {
                Ok(()) => tracing::debug!("session {id} from {peer} finished"),
                Err(e) => log_session_error(id, peer, &e, &metrics),
            },
            _ = shutdown.changed() => {
                tracing::debug!("session {id} from {peer} closed by shutdown");
            }
        }

        metrics.session_closed();
    }

    async fn drive(mut self) -> Result<()> {
        let id = self.guard.id();
        let mut buf = vec![0u8; BUF_SIZE];

        // Method selection: whatever the client offered, answer
        // "no authentication". The negotiation is a local trust
        // boundary.
        let n = self.client.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        self.client
            .write_all(&socks5::METHOD_SELECT_REPLY)
            .await?;

        // Request.
        let n = self.client.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let (request, consumed) = Request::parse(&buf[..n])?;

        if request.cmd == socks5::CMD_UDP_ASSOCIATE && self.config.udp_relay {
            // Stub: report the bound client-facing address and close;
            // the datagram plane is a separate facility.
            let bound = socks5::bound_v4(self.client.local_addr()?);
            self.client
                .write_all(&socks5::success_reply(bound))
                .await?;
            tracing::debug!("session {id} udp associate accepted for {}", request.address);
            return Ok(());
        }
        if request.cmd != socks5::CMD_CONNECT {
            self.client
                .write_all(&socks5::CMD_NOT_SUPPORTED_REPLY)
                .await?;
            return Err(Error::protocol(format!(
                "unsupported command: {}",
                request.cmd
            )));
        }

        let direct = self.is_bypassed(&request.address);

        // First upstream segment: the tunnel address header (relayed
        // sessions only) plus whatever payload the client coalesced
        // with its request.
        let mut initial = Vec::with_capacity(request.address.serialized_len() + n - consumed);
        if !direct {
            request.address.write_to(&mut initial);
        }
        initial.extend_from_slice(&buf[consumed..n]);

        let target = if direct {
            connect::resolve_address(&request.address).await?
        } else {
            let server = connect::pick_server(&self.config, &self.rng);
            connect::resolve(&server.host, server.port).await?
        };

        // Fake success reply, sent before the upstream leg is dialed:
        // first-byte latency and the fast-open SYN payload both depend
        // on it. Upstream failures from here on surface to the client
        // only as an abrupt close.
        self.client.write_all(&socks5::success_reply(None)).await?;

        if direct {
            tracing::debug!("session {id} bypass {}", request.address);
            self.metrics.session_bypassed();
        } else {
            tracing::debug!("session {id} connect {} via {target}", request.address);
            self.metrics.session_relayed();
        }

        // Bypassed sessions never construct cipher contexts.
        let mut encrypt = (!direct).then(|| EncryptContext::new(self.config.method, &self.config.key));
        let decrypt = (!direct).then(|| DecryptContext::new(self.config.method, &self.config.key));

        let want_fast_open = self.config.fast_open && !direct;
        let (mut upstream, fast_open) =
            connect::connect_upstream(&self.config, target, want_fast_open).await?;

        let first = match encrypt.as_mut() {
            Some(ctx) => ctx.encrypt(&initial)?,
            None => initial,
        };
        if !first.is_empty() {
            if let Err(e) = upstream.write_all(&first).await {
                if fast_open && e.kind() == std::io::ErrorKind::NotConnected {
                    connect::disable_fast_open();
                }
                return Err(e.into());
            }
        }

        // Streaming.
        let idle = self.config.idle_timeout();
        let (client_read, client_write) = self.client.split();
        let (upstream_read, upstream_write) = upstream.split();

        tokio::select! {
            result = copy_outbound(client_read, upstream_write, encrypt, &self.metrics) => result,
            result = copy_inbound(upstream_read, client_write, decrypt, idle, &self.metrics) => result,
        }
    }

    fn is_bypassed(&self, address: &Address) -> bool {
        let Some(acl) = &self.config.acl else {
            return false;
        };
        match address {
            Address::Ipv4(ip, _) => acl.contains_ip(*ip),
            Address::Domain(name, _) => acl.contains_domain(name),
            // IPv6 destinations are never looked up.
            Address::Ipv6(..) => false,
        }
    }
}

fn log_session_error(id: u64, peer: SocketAddr, err: &Error, metrics: &LocalMetrics) {
    match err {
        Error::Protocol(_) => {
            metrics.protocol_error();
            tracing::warn!("session {id} from {peer}: {err}");
        }
        Error::Crypto(_) => {
            tracing::error!("session {id} from {peer}: invalid password or cipher ({err})");
        }
        e if e.is_timeout() => {
            metrics.timeout();
            tracing::debug!("session {id} from {peer}: {err}");
        }
        e if e.is_disconnect() => {
            tracing::debug!("session {id} from {peer}: {err}");
        }
        _ => {
            tracing::error!("session {id} from {peer}: {err}");
        }
    }
}

/// Pump client bytes upstream, encrypting unless the session is
/// bypassed.
///
/// Each segment is fully written before the next read, which is the
/// whole backpressure story for this direction.
pub(crate) async fn copy_outbound<R, W>(
    mut reader: R,
    mut writer: W,
    mut encrypt: Option<EncryptContext>,
    metrics: &LocalMetrics,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            // EOF tears down the whole session.
            return Ok(());
        }
        match encrypt.as_mut() {
            Some(ctx) => {
                // The cipher hands back its own buffer; adopt it.
                let segment = ctx.encrypt(&buf[..n])?;
                writer.write_all(&segment).await?;
            }
            None => writer.write_all(&buf[..n]).await?,
        }
        metrics.add_bytes_up(n as u64);
    }
}

/// Pump upstream bytes to the client, decrypting unless the session is
/// bypassed.
///
/// Every read is raced against the idle window, so each received byte
/// re-arms the watchdog; a full silent window evicts the session.
pub(crate) async fn copy_inbound<R, W>(
    mut reader: R,
    mut writer: W,
    mut decrypt: Option<DecryptContext>,
    idle: Duration,
    metrics: &LocalMetrics,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; BUF_SIZE];
    loop {
        let n = match tokio::time::timeout(idle, reader.read(&mut buf)).await {
            Ok(read) => read?,
            Err(_) => return Err(Error::IdleTimeout),
        };
        if n == 0 {
            return Ok(());
        }
        match decrypt.as_mut() {
            Some(ctx) => {
                let segment = ctx.decrypt(&buf[..n])?;
                // Empty while the peer IV is still arriving.
                if !segment.is_empty() {
                    writer.write_all(&segment).await?;
                }
            }
            None => writer.write_all(&buf[..n]).await?,
        }
        metrics.add_bytes_down(n as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{derive_key, CipherKind};

    #[tokio::test]
    async fn test_outbound_preserves_order_across_fragments() {
        let (mut near, far) = tokio::io::duplex(64);
        let (far_read, _far_write) = tokio::io::split(far);
        let (sink, mut capture) = tokio::io::duplex(4096);

        let metrics = LocalMetrics::new();
        let pump = tokio::spawn(async move {
            let metrics = metrics;
            copy_outbound(far_read, sink, None, &metrics).await
        });

        for fragment in [&b"one "[..], b"two ", b"three"] {
            near.write_all(fragment).await.unwrap();
        }
        drop(near);

        pump.await.unwrap().unwrap();
        let mut out = Vec::new();
        capture.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"one two three");
    }

    #[tokio::test]
    async fn test_outbound_encrypts_and_inbound_decrypts() {
        let kind = CipherKind::Aes128Ctr;
        let key = derive_key(b"pipe test", kind.key_len());

        // client -> [encrypt] -> wire -> [decrypt] -> out
        let (mut client, client_far) = tokio::io::duplex(4096);
        let (wire_in, wire_out) = tokio::io::duplex(4096);
        let (out_sink, mut out) = tokio::io::duplex(4096);

        let metrics = LocalMetrics::new();
        let enc_key = key.clone();
        let outbound = tokio::spawn(async move {
            let metrics = metrics;
            let (reader, _w) = tokio::io::split(client_far);
            copy_outbound(
                reader,
                wire_in,
                Some(EncryptContext::new(kind, &enc_key)),
                &metrics,
            )
            .await
        });

        let metrics = LocalMetrics::new();
        let inbound = tokio::spawn(async move {
            let metrics = metrics;
            let (reader, _w) = tokio::io::split(wire_out);
            copy_inbound(
                reader,
                out_sink,
                Some(DecryptContext::new(kind, &key)),
                Duration::from_secs(60),
                &metrics,
            )
            .await
        });

        client.write_all(b"attack at dawn").await.unwrap();
        client.write_all(b", hold the bridge").await.unwrap();
        drop(client);

        outbound.await.unwrap().unwrap();
        inbound.await.unwrap().unwrap();

        let mut plain = Vec::new();
        out.read_to_end(&mut plain).await.unwrap();
        assert_eq!(plain, b"attack at dawn, hold the bridge");
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_idle_window_evicts() {
        let (_near, far) = tokio::io::duplex(64);
        let (far_read, _far_write) = tokio::io::split(far);
        let (sink, _capture) = tokio::io::duplex(64);

        let metrics = LocalMetrics::new();
        let result = copy_inbound(
            far_read,
            sink,
            None,
            Duration::from_secs(600),
            &metrics,
        )
        .await;

        assert!(matches!(result, Err(Error::IdleTimeout)));
    }

    #[tokio::test]
    async fn test_inbound_eof_is_clean() {
        let (near, far) = tokio::io::duplex(64);
        let (far_read, _far_write) = tokio::io::split(far);
        let (sink, _capture) = tokio::io::duplex(64);
        drop(near);

        let metrics = LocalMetrics::new();
        let result = copy_inbound(far_read, sink, None, Duration::from_secs(60), &metrics).await;
        assert!(result.is_ok());
    }
}
