//! Public HTTP ingress.
//!
//! Every public request is resolved by Host header to an active tunnel, then
//! carried over a fresh channel on that tunnel's SSH connection: the request
//! is serialized onto the channel as plain HTTP/1.1 with `Connection: close`
//! (EOF is the framing signal), the upstream response head is parsed off the
//! channel, and the remaining bytes stream straight into the public response
//! body. One channel per request; channels are never reused.

use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use warren_proto::FORWARDED_HTTP_PORT;

use crate::registry::TunnelRegistry;

/// Cap on the upstream response head we are willing to buffer.
const MAX_RESPONSE_HEAD: usize = 64 * 1024;

/// Cap on a request body that has to be buffered because the client gave us
/// no Content-Length to forward.
const MAX_BUFFERED_BODY: usize = 64 * 1024 * 1024;

#[derive(Clone)]
pub struct IngressState {
    registry: Arc<TunnelRegistry>,
    /// Set when the listener in front of this handler terminates TLS, so
    /// backends see `X-Forwarded-Proto: https`.
    tls_terminated: bool,
}

/// Router serving the public side: every path, every method, routed by Host.
pub fn router(registry: Arc<TunnelRegistry>, tls_terminated: bool) -> Router {
    Router::new()
        .fallback(any(forward_request))
        .with_state(IngressState {
            registry,
            tls_terminated,
        })
}

#[derive(Debug, Error)]
enum IngressError {
    #[error("unknown host")]
    UnknownHost,

    #[error("unable to open channel: {0}")]
    ChannelOpen(russh::Error),

    #[error("upstream returned an unusable response head")]
    BadUpstream,

    #[error("request body could not be read")]
    BodyRead,

    #[error("exchange failed: {0}")]
    Io(#[from] std::io::Error),
}

impl IntoResponse for IngressError {
    fn into_response(self) -> Response {
        match self {
            IngressError::UnknownHost => {
                (StatusCode::NOT_FOUND, "not found\n").into_response()
            }
            IngressError::ChannelOpen(_)
            | IngressError::BadUpstream
            | IngressError::BodyRead
            | IngressError::Io(_) => StatusCode::BAD_GATEWAY.into_response(),
        }
    }
}

async fn forward_request(
    State(state): State<IngressState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    match proxy(state, remote, request).await {
        Ok(response) => response,
        Err(err) => {
            debug!(error = %err, "Forwarded request failed");
            err.into_response()
        }
    }
}

async fn proxy(
    state: IngressState,
    remote: SocketAddr,
    request: Request,
) -> Result<Response, IngressError> {
    let host = canonical_host(request.headers(), request.uri()).ok_or(IngressError::UnknownHost)?;

    let Some(tunnel) = state.registry.lookup(&host) else {
        warn!(host = %host, "Unknown host");
        return Err(IngressError::UnknownHost);
    };

    let channel = tunnel
        .handle
        .channel_open_forwarded_tcpip(
            host.clone(),
            FORWARDED_HTTP_PORT,
            remote.ip().to_string(),
            u32::from(remote.port()),
        )
        .await
        .map_err(|err| {
            warn!(host = %host, error = %err, "Unable to open forwarding channel");
            IngressError::ChannelOpen(err)
        })?;
    let mut stream = channel.into_stream();

    let (parts, body) = request.into_parts();

    // A body without a declared length cannot be framed for the backend once
    // keep-alive is off, so buffer it and supply the length ourselves.
    let outbound = if parts.headers.contains_key(header::CONTENT_LENGTH) {
        OutboundBody::Streamed(body)
    } else {
        let bytes = axum::body::to_bytes(body, MAX_BUFFERED_BODY)
            .await
            .map_err(|_| IngressError::BodyRead)?;
        OutboundBody::Buffered(bytes)
    };

    let buffered_len = match &outbound {
        OutboundBody::Buffered(bytes) => Some(bytes.len()),
        OutboundBody::Streamed(_) => None,
    };
    let head = serialize_request_head(&parts, &host, remote, state.tls_terminated, buffered_len);
    stream.write_all(&head).await?;

    match outbound {
        OutboundBody::Buffered(bytes) => {
            if !bytes.is_empty() {
                stream.write_all(&bytes).await?;
            }
        }
        OutboundBody::Streamed(body) => {
            let mut chunks = body.into_data_stream();
            while let Some(chunk) = chunks.next().await {
                let chunk = chunk.map_err(|_| IngressError::BodyRead)?;
                stream.write_all(&chunk).await?;
            }
        }
    }
    stream.flush().await?;

    let (upstream, leftover) = read_response_head(&mut stream).await?;

    let mut response = Response::builder().status(
        StatusCode::from_u16(upstream.code).map_err(|_| IngressError::BadUpstream)?,
    );
    for (name, value) in &upstream.headers {
        let name = match HeaderName::from_bytes(name.as_bytes()) {
            Ok(name) => name,
            Err(_) => continue,
        };
        let value = match HeaderValue::from_bytes(value) {
            Ok(value) => value,
            Err(_) => continue,
        };
        response = response.header(name, value);
    }

    let reader = Cursor::new(leftover).chain(stream);
    let body = Body::from_stream(ReaderStream::new(reader));
    response.body(body).map_err(|_| IngressError::BadUpstream)
}

enum OutboundBody {
    Buffered(bytes::Bytes),
    Streamed(Body),
}

/// Canonical routing key for a request: the Host header (or URI authority),
/// lowercased, any port stripped.
fn canonical_host(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    let raw = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| uri.host().map(str::to_string))?;
    let raw = raw.trim().to_lowercase();
    if raw.is_empty() {
        return None;
    }
    match raw.rsplit_once(':') {
        Some((host, port))
            if !host.is_empty() && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            Some(host.to_string())
        }
        _ => Some(raw),
    }
}

/// Serialize the request line and headers for the backend hop. Keep-alive is
/// not supported across the channel, hop-by-hop framing is replaced, and the
/// forwarding headers are computed here so the backend sees them.
fn serialize_request_head(
    parts: &axum::http::request::Parts,
    host: &str,
    remote: SocketAddr,
    tls_terminated: bool,
    buffered_len: Option<usize>,
) -> Vec<u8> {
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut head = Vec::with_capacity(512);
    head.extend_from_slice(format!("{} {} HTTP/1.1\r\n", parts.method, path).as_bytes());
    head.extend_from_slice(format!("Host: {host}\r\n").as_bytes());

    for (name, value) in &parts.headers {
        if matches!(
            name.as_str(),
            "host" | "connection" | "transfer-encoding" | "x-forwarded-for" | "x-forwarded-proto"
        ) {
            continue;
        }
        if name.as_str() == "content-length" && buffered_len.is_some() {
            continue;
        }
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }

    if let Some(len) = buffered_len {
        if len > 0 {
            head.extend_from_slice(format!("Content-Length: {len}\r\n").as_bytes());
        }
    }

    let forwarded_for = compose_forwarded_for(
        parts
            .headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok()),
        &remote.ip().to_string(),
    );
    head.extend_from_slice(format!("X-Forwarded-For: {forwarded_for}\r\n").as_bytes());
    if tls_terminated {
        head.extend_from_slice(b"X-Forwarded-Proto: https\r\n");
    }
    head.extend_from_slice(b"Connection: close\r\n\r\n");
    head
}

/// Prepend the public client address to any existing forwarded-for list:
/// split on commas, strip whitespace, rejoin with `", "`.
fn compose_forwarded_for(existing: Option<&str>, remote: &str) -> String {
    match existing {
        Some(prior) => {
            let mut entries = vec![remote.to_string()];
            entries.extend(
                prior
                    .split(',')
                    .map(str::trim)
                    .filter(|entry| !entry.is_empty())
                    .map(str::to_string),
            );
            entries.join(", ")
        }
        None => remote.to_string(),
    }
}

struct UpstreamHead {
    code: u16,
    headers: Vec<(String, Vec<u8>)>,
}

/// Read and parse the upstream response head off the channel, returning any
/// body bytes that arrived with it. Malformed heads and status codes outside
/// 100..=511 are bad-gateway conditions.
async fn read_response_head<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<(UpstreamHead, Vec<u8>), IngressError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(IngressError::BadUpstream);
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_RESPONSE_HEAD {
            return Err(IngressError::BadUpstream);
        }

        let mut headers = [httparse::EMPTY_HEADER; 100];
        let mut response = httparse::Response::new(&mut headers);
        match response.parse(&buf) {
            Ok(httparse::Status::Complete(head_len)) => {
                let code = response.code.ok_or(IngressError::BadUpstream)?;
                if !(100..=511).contains(&code) {
                    return Err(IngressError::BadUpstream);
                }
                let headers = response
                    .headers
                    .iter()
                    .map(|h| (h.name.to_string(), h.value.to_vec()))
                    .collect();
                return Ok((UpstreamHead { code, headers }, buf[head_len..].to_vec()));
            }
            Ok(httparse::Status::Partial) => continue,
            Err(_) => return Err(IngressError::BadUpstream),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarded_for_without_prior_value() {
        assert_eq!(compose_forwarded_for(None, "203.0.113.5"), "203.0.113.5");
    }

    #[test]
    fn forwarded_for_prepends_and_rejoins() {
        assert_eq!(
            compose_forwarded_for(Some("10.0.0.1"), "203.0.113.5"),
            "203.0.113.5, 10.0.0.1"
        );
        assert_eq!(
            compose_forwarded_for(Some("10.0.0.1 , 10.0.0.2,"), "203.0.113.5"),
            "203.0.113.5, 10.0.0.1, 10.0.0.2"
        );
    }

    #[test]
    fn canonical_host_lowercases_and_strips_port() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("Foo.Example:8080"));
        let uri = Uri::from_static("/hello");
        assert_eq!(canonical_host(&headers, &uri).unwrap(), "foo.example");

        headers.insert(header::HOST, HeaderValue::from_static("foo.example"));
        assert_eq!(canonical_host(&headers, &uri).unwrap(), "foo.example");
    }

    #[test]
    fn canonical_host_falls_back_to_uri() {
        let headers = HeaderMap::new();
        let uri = Uri::from_static("http://Bar.Example/hello");
        assert_eq!(canonical_host(&headers, &uri).unwrap(), "bar.example");
        let bare = Uri::from_static("/hello");
        assert_eq!(canonical_host(&headers, &bare), None);
    }

    #[tokio::test]
    async fn response_head_parses_and_keeps_leftover() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-Custom: yes\r\n\r\nhello";
        let mut reader = Cursor::new(raw.to_vec());
        let (head, leftover) = read_response_head(&mut reader).await.unwrap();
        assert_eq!(head.code, 200);
        assert_eq!(leftover, b"hello");
        assert!(head
            .headers
            .iter()
            .any(|(name, value)| name == "X-Custom" && value == b"yes"));
    }

    #[tokio::test]
    async fn malformed_head_is_bad_upstream() {
        let mut reader = Cursor::new(b"not http at all\r\n\r\n".to_vec());
        assert!(matches!(
            read_response_head(&mut reader).await,
            Err(IngressError::BadUpstream)
        ));
    }

    #[tokio::test]
    async fn out_of_range_status_is_bad_upstream() {
        let mut reader = Cursor::new(b"HTTP/1.1 999 Weird\r\n\r\n".to_vec());
        assert!(matches!(
            read_response_head(&mut reader).await,
            Err(IngressError::BadUpstream)
        ));
    }

    #[test]
    fn request_head_rewrites_hop_headers() {
        let request = axum::http::Request::builder()
            .method("GET")
            .uri("/hello?x=1")
            .header("Host", "otter.example.com")
            .header("Connection", "keep-alive")
            .header("X-Forwarded-For", "10.0.0.1")
            .header("Accept", "text/plain")
            .body(())
            .unwrap();
        let (parts, _) = request.into_parts();

        let head = serialize_request_head(
            &parts,
            "otter.example.com",
            "203.0.113.5:4242".parse().unwrap(),
            true,
            None,
        );
        let text = String::from_utf8(head).unwrap();

        assert!(text.starts_with("GET /hello?x=1 HTTP/1.1\r\n"));
        assert!(text.contains("Host: otter.example.com\r\n"));
        assert!(text.contains("Accept: text/plain\r\n"));
        assert!(text.contains("X-Forwarded-For: 203.0.113.5, 10.0.0.1\r\n"));
        assert!(text.contains("X-Forwarded-Proto: https\r\n"));
        assert!(text.ends_with("Connection: close\r\n\r\n"));
        assert!(!text.contains("keep-alive"));
    }
}
