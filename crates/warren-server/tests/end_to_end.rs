//! Loopback end-to-end tests: real server, real client, real TCP backend.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use warren_client::{Backend, ClientError, TunnelClient};
use warren_server::{
    deny_all, load_or_generate_key, suffix_in, AuthorizedKeys, HostValidator, MemoryHostStore,
    NameProvider, Server, ServerConfig, ServerContext, TunnelRegistry,
};

/// Start a server on ephemeral loopback ports, returning (ssh, http) addrs.
async fn start_server(validator: HostValidator) -> (SocketAddr, SocketAddr) {
    let ctx = ServerContext {
        registry: Arc::new(TunnelRegistry::new()),
        store: Arc::new(MemoryHostStore::new()),
        provider: NameProvider::embedded(vec!["test.example".into()]),
        validator,
        authorized: AuthorizedKeys::allow_any(),
    };

    let host_key = load_or_generate_key(None).await.unwrap();
    let server = Server::bind(
        ServerConfig {
            ssh_bind: "127.0.0.1:0".into(),
            http_bind: "127.0.0.1:0".into(),
            tls_terminated: false,
        },
        host_key,
        ctx,
    )
    .await
    .unwrap();

    let ssh = server.ssh_addr().unwrap();
    let http = server.http_addr().unwrap();
    tokio::spawn(server.run());
    (ssh, http)
}

/// Minimal backend answering every request with `200` and body `hello`.
async fn spawn_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut data = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => data.extend_from_slice(&buf[..n]),
                    }
                    if data.windows(4).any(|window| window == b"\r\n\r\n") {
                        break;
                    }
                }
                let _ = socket
                    .write_all(
                        b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
                    )
                    .await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

async fn connect_client(
    ssh: SocketAddr,
    backend: Option<SocketAddr>,
) -> Result<TunnelClient, ClientError> {
    let key = load_or_generate_key(None).await.unwrap();
    let backend = backend.map(|addr| Backend::parse(&format!("http://{addr}"), false).unwrap());
    TunnelClient::connect(&ssh.to_string(), "warren", key, backend).await
}

/// One raw HTTP/1.1 request against the ingress; returns (status, body).
async fn http_get(addr: SocketAddr, host: &str, path: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n").as_bytes(),
        )
        .await
        .unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let text = String::from_utf8_lossy(&response).to_string();

    let status = text
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0);
    let body = text
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    (status, body)
}

#[tokio::test]
async fn generated_host_serves_requests() {
    let (ssh, http) = start_server(deny_all()).await;
    let backend = spawn_backend().await;

    let client = connect_client(ssh, Some(backend)).await.unwrap();
    let host = client.start_http_forwarding("", false).await.unwrap();
    assert!(
        host.ends_with(".test.example"),
        "expected generated name under the configured domain, got {host}"
    );

    let (status, body) = http_get(http, &host, "/hello").await;
    assert_eq!(status, 200);
    assert_eq!(body, "hello");

    // Host matching is case-insensitive.
    let (status, _) = http_get(http, &host.to_uppercase(), "/hello").await;
    assert_eq!(status, 200);
}

#[tokio::test]
async fn unknown_host_is_not_found() {
    let (_ssh, http) = start_server(deny_all()).await;
    let (status, _) = http_get(http, "unknown.test.example", "/").await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn cancel_stops_routing() {
    let (ssh, http) = start_server(deny_all()).await;
    let backend = spawn_backend().await;

    let client = connect_client(ssh, Some(backend)).await.unwrap();
    let host = client.start_http_forwarding("", false).await.unwrap();

    let (status, _) = http_get(http, &host, "/").await;
    assert_eq!(status, 200);

    client.cancel_http_forwarding(&host).await.unwrap();

    // The cancel carries no reply, so give the server a moment to apply it.
    let mut status = 200;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        status = http_get(http, &host, "/").await.0;
        if status == 404 {
            break;
        }
    }
    assert_eq!(status, 404);
}

#[tokio::test]
async fn disconnect_evicts_hosts() {
    let (ssh, http) = start_server(deny_all()).await;
    let backend = spawn_backend().await;

    let client = connect_client(ssh, Some(backend)).await.unwrap();
    let host = client.start_http_forwarding("", false).await.unwrap();
    assert_eq!(http_get(http, &host, "/").await.0, 200);

    client.disconnect().await.unwrap();

    let mut status = 200;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        status = http_get(http, &host, "/").await.0;
        if status == 404 {
            break;
        }
    }
    assert_eq!(status, 404);
}

#[tokio::test]
async fn reserved_hosts_enforce_ownership() {
    let (ssh, _http) = start_server(suffix_in(vec!["test.example".into()])).await;
    let backend = spawn_backend().await;

    // Key 1 reserves the host.
    let owner = connect_client(ssh, Some(backend)).await.unwrap();
    let reserved = owner.register("myapp.test.example").await.unwrap();
    assert_eq!(reserved, "myapp.test.example");

    // A different key cannot activate it.
    let thief = connect_client(ssh, Some(backend)).await.unwrap();
    let err = thief
        .start_http_forwarding("myapp.test.example", false)
        .await
        .unwrap_err();
    match err {
        ClientError::Rejected(reason) => {
            assert_eq!(reason, "host claimed and not owned by current key")
        }
        other => panic!("expected rejection, got {other}"),
    }

    // An unregistered host cannot be activated either.
    let err = owner
        .start_http_forwarding("other.test.example", false)
        .await
        .unwrap_err();
    match err {
        ClientError::Rejected(reason) => assert_eq!(reason, "host not registered"),
        other => panic!("expected rejection, got {other}"),
    }

    // The owner can serve it.
    let host = owner
        .start_http_forwarding("myapp.test.example", false)
        .await
        .unwrap();
    assert_eq!(host, "myapp.test.example");

    // Unregistering from the wrong key is refused.
    let err = thief.unregister("myapp.test.example").await.unwrap_err();
    match err {
        ClientError::Rejected(reason) => assert_eq!(reason, "this host is not owned by you"),
        other => panic!("expected rejection, got {other}"),
    }
}

#[tokio::test]
async fn forced_takeover_replaces_live_tunnel() {
    let (ssh, http) = start_server(suffix_in(vec!["test.example".into()])).await;
    let backend = spawn_backend().await;

    let key = load_or_generate_key(None).await.unwrap();
    let backend_url = format!("http://{backend}");

    let first = TunnelClient::connect(
        &ssh.to_string(),
        "warren",
        key.clone(),
        Some(Backend::parse(&backend_url, false).unwrap()),
    )
    .await
    .unwrap();
    first.register("myapp.test.example").await.unwrap();
    first
        .start_http_forwarding("myapp.test.example", false)
        .await
        .unwrap();

    // Same key, second connection: refused without force.
    let second = TunnelClient::connect(
        &ssh.to_string(),
        "warren",
        key,
        Some(Backend::parse(&backend_url, false).unwrap()),
    )
    .await
    .unwrap();
    let err = second
        .start_http_forwarding("myapp.test.example", false)
        .await
        .unwrap_err();
    match err {
        ClientError::Rejected(reason) => {
            assert_eq!(reason, "host already in use and force not set")
        }
        other => panic!("expected rejection, got {other}"),
    }

    // With force, the takeover succeeds and traffic still flows.
    let host = second
        .start_http_forwarding("myapp.test.example", true)
        .await
        .unwrap();
    assert_eq!(host, "myapp.test.example");

    let (status, body) = http_get(http, &host, "/").await;
    assert_eq!(status, 200);
    assert_eq!(body, "hello");
}
