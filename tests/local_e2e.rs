//! End-to-end tests against a scripted relay endpoint.
//!
//! A throwaway TCP listener stands in for the relay server (or, for
//! bypass tests, the destination itself) and captures everything the
//! proxy sends upstream so the tests can check the tunnel framing.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use sslocal::acl::Acl;
use sslocal::crypto::{derive_key, CipherKind, DecryptContext};
use sslocal::{Config, Local, ServerAddr};

const METHOD: CipherKind = CipherKind::Aes256Cfb;
const PASSWORD: &str = "e2e password";

/// Accept one connection and capture everything it sends until EOF.
async fn spawn_capture_server() -> (SocketAddr, oneshot::Receiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut captured = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
                Ok(Ok(n)) => captured.extend_from_slice(&buf[..n]),
            }
        }
        let _ = tx.send(captured);
    });

    (addr, rx)
}

fn config_for(server: SocketAddr) -> Config {
    Config::new(
        vec![ServerAddr {
            host: server.ip().to_string(),
            port: server.port(),
        }],
        "127.0.0.1".into(),
        0,
        METHOD,
        PASSWORD,
        Duration::from_secs(5),
    )
}

async fn start_local(
    config: Config,
) -> (
    SocketAddr,
    Arc<Local>,
    tokio::task::JoinHandle<sslocal::Result<()>>,
) {
    let local = Arc::new(Local::new(config));
    let listener = local.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = Arc::clone(&local);
    let handle = tokio::spawn(async move { serving.serve(listener).await });
    (addr, local, handle)
}

/// Run the two-step negotiation up to and including the fake reply.
async fn negotiate(client: &mut TcpStream, request: &[u8]) -> [u8; 10] {
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method_reply = [0u8; 2];
    client.read_exact(&mut method_reply).await.unwrap();
    assert_eq!(method_reply, [0x05, 0x00]);

    client.write_all(request).await.unwrap();
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    reply
}

fn decrypt_wire(wire: &[u8]) -> Vec<u8> {
    let key = derive_key(PASSWORD.as_bytes(), METHOD.key_len());
    let mut ctx = DecryptContext::new(METHOD, &key);
    ctx.decrypt(wire).unwrap()
}

#[tokio::test]
async fn ipv4_connect_sends_tunnel_header() {
    let (server_addr, captured) = spawn_capture_server().await;
    let (local_addr, _local, _serve) = start_local(config_for(server_addr)).await;

    let mut client = TcpStream::connect(local_addr).await.unwrap();
    let reply = negotiate(
        &mut client,
        &[0x05, 0x01, 0x00, 0x01, 0x7F, 0x00, 0x00, 0x01, 0x1F, 0x90],
    )
    .await;
    assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

    client.write_all(b"ping").await.unwrap();
    drop(client);

    let plain = decrypt_wire(&captured.await.unwrap());
    assert!(plain.starts_with(&[0x01, 0x7F, 0x00, 0x00, 0x01, 0x1F, 0x90]));
    assert_eq!(&plain[7..], b"ping");
}

#[tokio::test]
async fn domain_connect_coalesces_first_payload() {
    let (server_addr, captured) = spawn_capture_server().await;
    let (local_addr, _local, _serve) = start_local(config_for(server_addr)).await;

    // CONNECT localhost:80 with "GET /" in the same segment.
    let request = [
        0x05, 0x01, 0x00, 0x03, 0x09, 0x6C, 0x6F, 0x63, 0x61, 0x6C, 0x68, 0x6F, 0x73, 0x74,
        0x00, 0x50, 0x47, 0x45, 0x54, 0x20, 0x2F,
    ];

    let mut client = TcpStream::connect(local_addr).await.unwrap();
    let reply = negotiate(&mut client, &request).await;
    assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    drop(client);

    // Header and the coalesced payload must share the first segment.
    let plain = decrypt_wire(&captured.await.unwrap());
    assert_eq!(&plain[..18], &request[3..]);
}

#[tokio::test]
async fn unsupported_command_gets_error_reply() {
    let (server_addr, _captured) = spawn_capture_server().await;
    let (local_addr, _local, _serve) = start_local(config_for(server_addr)).await;

    let mut client = TcpStream::connect(local_addr).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method_reply = [0u8; 2];
    client.read_exact(&mut method_reply).await.unwrap();

    // BIND 0.0.0.0:80
    client
        .write_all(&[0x05, 0x02, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x50])
        .await
        .unwrap();

    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x07, 0x00, 0x01]);

    // And the session is gone.
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn udp_associate_stub_reports_bound_address() {
    let (server_addr, _captured) = spawn_capture_server().await;
    let mut config = config_for(server_addr);
    config.udp_relay = true;
    let (local_addr, _local, _serve) = start_local(config).await;

    let mut client = TcpStream::connect(local_addr).await.unwrap();
    let reply = negotiate(
        &mut client,
        &[0x05, 0x03, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
    )
    .await;

    assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);
    assert_eq!(&reply[4..8], &[127, 0, 0, 1]);
    assert_eq!(
        u16::from_be_bytes([reply[8], reply[9]]),
        local_addr.port()
    );

    // Stub sessions close right after the reply.
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn acl_bypass_goes_direct_and_plaintext() {
    // The "destination" is the capture server; the configured relay is
    // a black hole that must never be dialed.
    let (target_addr, captured) = spawn_capture_server().await;
    let mut config = config_for("203.0.113.1:9".parse().unwrap());
    config.acl = Some(Acl::parse("127.0.0.1\n"));
    let (local_addr, local, _serve) = start_local(config).await;

    let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    request.extend_from_slice(&target_addr.port().to_be_bytes());
    request.extend_from_slice(b"direct hello");

    let mut client = TcpStream::connect(local_addr).await.unwrap();
    let reply = negotiate(&mut client, &request).await;
    assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    drop(client);

    // No tunnel header, no cipher: the raw payload arrives as sent.
    assert_eq!(captured.await.unwrap(), b"direct hello");
    assert_eq!(local.metrics().bypassed_sessions(), 1);
    assert_eq!(local.metrics().relayed_sessions(), 0);
}

#[tokio::test]
async fn upstream_replies_are_decrypted_for_the_client() {
    // Scripted relay: decrypt what arrives, echo a fixed encrypted
    // response back through its own encrypt context.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        use sslocal::crypto::EncryptContext;

        let key = derive_key(PASSWORD.as_bytes(), METHOD.key_len());
        let (mut stream, _) = listener.accept().await.unwrap();

        let mut dec = DecryptContext::new(METHOD, &key);
        let mut buf = [0u8; 4096];
        let mut header = Vec::new();
        // Read until the whole request header has arrived.
        while header.len() < 7 {
            let n = stream.read(&mut buf).await.unwrap();
            header.extend(dec.decrypt(&buf[..n]).unwrap());
        }
        assert_eq!(&header[..7], &[0x01, 0x7F, 0x00, 0x00, 0x01, 0x1F, 0x90]);

        let mut enc = EncryptContext::new(METHOD, &key);
        let wire = enc.encrypt(b"pong from afar").unwrap();
        stream.write_all(&wire).await.unwrap();
    });

    let (local_addr, _local, _serve) = start_local(config_for(server_addr)).await;

    let mut client = TcpStream::connect(local_addr).await.unwrap();
    negotiate(
        &mut client,
        &[0x05, 0x01, 0x00, 0x01, 0x7F, 0x00, 0x00, 0x01, 0x1F, 0x90],
    )
    .await;

    let mut response = [0u8; 14];
    client.read_exact(&mut response).await.unwrap();
    assert_eq!(&response, b"pong from afar");
}

#[tokio::test]
async fn shutdown_drains_registry_and_closes_sessions() {
    let (server_addr, _captured) = spawn_capture_server().await;
    let (local_addr, local, serve) = start_local(config_for(server_addr)).await;

    let mut client = TcpStream::connect(local_addr).await.unwrap();
    negotiate(
        &mut client,
        &[0x05, 0x01, 0x00, 0x01, 0x7F, 0x00, 0x00, 0x01, 0x1F, 0x90],
    )
    .await;
    assert_eq!(local.registry().count(), 1);

    local.shutdown();
    serve.await.unwrap().unwrap();
    assert!(local.registry().is_empty());

    // The client sees its connection die.
    let mut buf = [0u8; 8];
    match client.read(&mut buf).await {
        Ok(0) | Err(_) => {}
        Ok(n) => panic!("unexpected {n} bytes after shutdown"),
    }
}
