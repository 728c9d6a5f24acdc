//! Per-channel backend proxier.
//!
//! Each forwarded channel carries exactly one HTTP exchange. The request
//! head is read off the channel, its `Host` header rewritten to the backend
//! authority, and the head plus a `Content-Length`-bounded body are written
//! to the backend socket. The backend's response then streams back over the
//! channel until EOF; both ends are closed on every path.

use std::io::Cursor;
use std::sync::Arc;

use russh::client::Msg;
use russh::ChannelStream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::backend::Backend;
use crate::error::ClientError;

/// Cap on the request head read off the channel.
const MAX_REQUEST_HEAD: usize = 64 * 1024;

trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub(crate) async fn serve_channel(
    stream: ChannelStream<Msg>,
    backend: Arc<Backend>,
) -> Result<(), ClientError> {
    let (mut channel_read, mut channel_write) = tokio::io::split(stream);

    let head = read_request_head(&mut channel_read, backend.authority()).await?;

    let tcp = TcpStream::connect(backend.dial_addr()).await?;
    let mut backend_io: Box<dyn AsyncStream> = match backend.tls() {
        Some((connector, server_name)) => Box::new(connector.connect(server_name, tcp).await?),
        None => Box::new(tcp),
    };

    backend_io.write_all(&head.serialized).await?;

    if head.content_length > 0 {
        let mut body = Cursor::new(head.leftover)
            .chain(&mut channel_read)
            .take(head.content_length);
        tokio::io::copy(&mut body, &mut backend_io).await?;
    }
    backend_io.flush().await?;

    // Stream the backend's response back until it closes the socket.
    tokio::io::copy(&mut backend_io, &mut channel_write).await?;
    channel_write.shutdown().await?;
    Ok(())
}

struct RequestHead {
    /// Head with the `Host` header rewritten, ready for the backend.
    serialized: Vec<u8>,
    /// Body bytes that arrived along with the head.
    leftover: Vec<u8>,
    content_length: u64,
}

/// Read and re-serialize the request head, rewriting `Host` to `authority`.
async fn read_request_head<R: AsyncRead + Unpin>(
    reader: &mut R,
    authority: &str,
) -> Result<RequestHead, ClientError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(ClientError::MalformedRequest);
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_REQUEST_HEAD {
            return Err(ClientError::MalformedRequest);
        }

        let mut headers = [httparse::EMPTY_HEADER; 100];
        let mut request = httparse::Request::new(&mut headers);
        match request.parse(&buf) {
            Ok(httparse::Status::Complete(head_len)) => {
                let method = request.method.ok_or(ClientError::MalformedRequest)?;
                let path = request.path.ok_or(ClientError::MalformedRequest)?;

                let mut serialized = Vec::with_capacity(head_len + 64);
                serialized.extend_from_slice(format!("{method} {path} HTTP/1.1\r\n").as_bytes());
                serialized.extend_from_slice(format!("Host: {authority}\r\n").as_bytes());

                let mut content_length = 0u64;
                for header in request.headers.iter() {
                    if header.name.eq_ignore_ascii_case("host") {
                        continue;
                    }
                    if header.name.eq_ignore_ascii_case("content-length") {
                        content_length = std::str::from_utf8(header.value)
                            .ok()
                            .and_then(|value| value.trim().parse().ok())
                            .unwrap_or(0);
                    }
                    serialized.extend_from_slice(header.name.as_bytes());
                    serialized.extend_from_slice(b": ");
                    serialized.extend_from_slice(header.value);
                    serialized.extend_from_slice(b"\r\n");
                }
                serialized.extend_from_slice(b"\r\n");

                return Ok(RequestHead {
                    serialized,
                    leftover: buf[head_len..].to_vec(),
                    content_length,
                });
            }
            Ok(httparse::Status::Partial) => continue,
            Err(_) => return Err(ClientError::MalformedRequest),
        }
    }
}
