//! Upstream connection establishment.
//!
//! Picks a relay (or the literal destination for bypassed sessions),
//! resolves it, and dials it with the connect timer armed. On Linux
//! the socket can be pinned to an interface, and non-direct sessions
//! may use TCP Fast Open so the first encrypted segment rides the SYN.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::Rng;
use tokio::net::{lookup_host, TcpSocket, TcpStream};

use crate::config::{Config, ServerAddr};
use crate::error::{Error, Result};
use crate::socks5::Address;

/// Whether the kernel has been observed to support TCP Fast Open.
///
/// Flips to `false` once and stays there; subsequent sessions use the
/// plain connect path.
static FAST_OPEN_AVAILABLE: AtomicBool = AtomicBool::new(true);

/// Check the process-wide fast-open availability flag.
pub fn fast_open_available() -> bool {
    FAST_OPEN_AVAILABLE.load(Ordering::Relaxed)
}

/// Disable TCP Fast Open for the rest of the process.
pub fn disable_fast_open() {
    if FAST_OPEN_AVAILABLE.swap(false, Ordering::Relaxed) {
        tracing::warn!("fast open is not supported on this platform, disabling");
    }
}

/// Draw one relay server, uniformly, from the configured list.
///
/// The draw happens once per session and is never revisited.
pub fn pick_server<'a>(config: &'a Config, rng: &Mutex<StdRng>) -> &'a ServerAddr {
    let index = match config.servers.len() {
        1 => 0,
        n => rng.lock().gen_range(0..n),
    };
    &config.servers[index]
}

/// Resolve a host and port to the first available socket address.
pub async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let mut addrs = lookup_host((host, port))
        .await
        .map_err(|e| Error::resolve(format!("{host}: {e}")))?;
    addrs
        .next()
        .ok_or_else(|| Error::resolve(format!("{host}: no addresses")))
}

/// Resolve a SOCKS5 destination; IP literals skip the resolver.
pub async fn resolve_address(address: &Address) -> Result<SocketAddr> {
    match address {
        Address::Ipv4(ip, port) => Ok(SocketAddr::from((*ip, *port))),
        Address::Ipv6(ip, port) => Ok(SocketAddr::from((*ip, *port))),
        Address::Domain(name, port) => resolve(name, *port).await,
    }
}

/// Dial an upstream address.
///
/// Returns the connected stream and whether fast open is armed on it
/// (in which case the caller's first write carries the SYN payload and
/// a `NotConnected` error from that write means the kernel lied about
/// support). The connect timer bounds the plain path; the fast-open
/// path defers the handshake to the first write, as the kernel does.
pub async fn connect_upstream(
    config: &Config,
    addr: SocketAddr,
    want_fast_open: bool,
) -> Result<(TcpStream, bool)> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };

    if let Some(iface) = &config.iface {
        bind_device(&socket, iface)?;
    }

    let mut fast_open = want_fast_open && fast_open_available();
    if fast_open {
        if let Err(e) = set_fast_open_connect(&socket) {
            tracing::debug!("enabling fast open failed: {e}");
            disable_fast_open();
            fast_open = false;
        }
    }

    let stream = tokio::time::timeout(config.timeout, socket.connect(addr))
        .await
        .map_err(|_| Error::ConnectTimeout)??;

    Ok((stream, fast_open))
}

#[cfg(target_os = "linux")]
fn bind_device(socket: &TcpSocket, iface: &str) -> io::Result<()> {
    socket2::SockRef::from(socket).bind_device(Some(iface.as_bytes()))
}

#[cfg(not(target_os = "linux"))]
fn bind_device(_socket: &TcpSocket, iface: &str) -> io::Result<()> {
    tracing::warn!("interface binding is only supported on Linux, ignoring {iface}");
    Ok(())
}

/// Ask the kernel to defer the handshake to the first write
/// (`TCP_FASTOPEN_CONNECT`).
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn set_fast_open_connect(socket: &TcpSocket) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let one: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_TCP,
            libc::TCP_FASTOPEN_CONNECT,
            std::ptr::addr_of!(one).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(target_os = "linux"))]
fn set_fast_open_connect(_socket: &TcpSocket) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "TCP fast open requires Linux",
    ))
}
