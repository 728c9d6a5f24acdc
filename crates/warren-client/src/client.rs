//! Tunnel client: SSH connection, control channel, and forwarding setup.

use std::sync::Arc;

use bytes::Bytes;
use russh::client::{self, AuthResult, Handle};
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::{Channel, ChannelMsg, Disconnect};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use warren_proto::{
    ControlReply, ControlRequest, ForwardCancel, ForwardRequest, ForwardSuccess, ForwardedChannelData,
    FrameBuffer, HostRegisterRequest, HostRegisterSuccess, CANCEL_HTTP_FORWARD, CONTROL_SUBSYSTEM,
    HTTP_FORWARD, REGISTER_HOST, UNREGISTER_HOST,
};

use crate::backend::Backend;
use crate::error::ClientError;
use crate::proxy;

/// A connected, authenticated tunnel client.
///
/// One SSH connection per client; the control channel carries the
/// forward/register operations, and the server opens one channel back per
/// public HTTP request, each proxied to the configured backend.
pub struct TunnelClient {
    handle: Handle<ClientHandler>,
    control: Mutex<ControlChannel>,
    closed: CancellationToken,
}

impl TunnelClient {
    /// Dial `server`, authenticate with `key`, and open the control channel.
    /// `backend` is required for HTTP forwarding; control-only sessions
    /// (register/unregister) can pass `None`.
    pub async fn connect(
        server: &str,
        user: &str,
        key: PrivateKey,
        backend: Option<Backend>,
    ) -> Result<Self, ClientError> {
        info!(server = %server, "Dialing server");

        let closed = CancellationToken::new();
        let handler = ClientHandler {
            backend: backend.map(Arc::new),
            closed: closed.clone(),
        };

        let config = Arc::new(client::Config::default());
        let mut handle = client::connect(config, server, handler).await?;

        let key_with_alg = PrivateKeyWithHashAlg::new(
            Arc::new(key),
            handle.best_supported_rsa_hash().await?.flatten(),
        );
        match handle.authenticate_publickey(user, key_with_alg).await? {
            AuthResult::Success => {}
            AuthResult::Failure { .. } => return Err(ClientError::AuthRejected),
        }

        let channel = handle.channel_open_session().await?;
        channel.request_subsystem(false, CONTROL_SUBSYSTEM).await?;

        Ok(Self {
            handle,
            control: Mutex::new(ControlChannel {
                channel,
                frames: FrameBuffer::new(),
            }),
            closed,
        })
    }

    /// Activate HTTP forwarding. An empty `requested_host` asks the server
    /// to assign one; the assigned host is returned. Incoming requests are
    /// served concurrently from this point on.
    pub async fn start_http_forwarding(
        &self,
        requested_host: &str,
        force: bool,
    ) -> Result<String, ClientError> {
        let payload = ForwardRequest {
            requested_host: requested_host.to_lowercase(),
            force,
        }
        .encode();

        let reply = self.request(HTTP_FORWARD, payload).await?;
        if !reply.accepted {
            return Err(ClientError::Rejected(reply.reason()));
        }
        let success = ForwardSuccess::decode(reply.payload)?;
        info!(host = %success.host, "Bound host");
        Ok(success.host)
    }

    /// Release an active forward. Fire-and-forget, mirroring the teardown
    /// path where the server may already be gone.
    pub async fn cancel_http_forwarding(&self, host: &str) -> Result<(), ClientError> {
        let payload = ForwardCancel {
            host: host.to_lowercase(),
        }
        .encode();
        let mut control = self.control.lock().await;
        control.send(CANCEL_HTTP_FORWARD, payload).await
    }

    /// Reserve `host` for this client's key.
    pub async fn register(&self, host: &str) -> Result<String, ClientError> {
        let payload = HostRegisterRequest {
            host: host.to_lowercase(),
        }
        .encode();
        let reply = self.request(REGISTER_HOST, payload).await?;
        if !reply.accepted {
            return Err(ClientError::Rejected(reply.reason()));
        }
        Ok(HostRegisterSuccess::decode(reply.payload)?.host)
    }

    /// Drop this client's reservation of `host`.
    pub async fn unregister(&self, host: &str) -> Result<String, ClientError> {
        let payload = HostRegisterRequest {
            host: host.to_lowercase(),
        }
        .encode();
        let reply = self.request(UNREGISTER_HOST, payload).await?;
        if !reply.accepted {
            return Err(ClientError::Rejected(reply.reason()));
        }
        Ok(HostRegisterSuccess::decode(reply.payload)?.host)
    }

    /// Resolved when the connection is gone, whichever side closed it.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await?;
        Ok(())
    }

    async fn request(&self, request_type: &str, payload: Bytes) -> Result<ControlReply, ClientError> {
        let mut control = self.control.lock().await;
        control.request(request_type, payload).await
    }
}

/// The client side of the control channel: one request on the wire at a
/// time, replies matched by arrival order.
struct ControlChannel {
    channel: Channel<client::Msg>,
    frames: FrameBuffer,
}

impl ControlChannel {
    async fn request(
        &mut self,
        request_type: &str,
        payload: Bytes,
    ) -> Result<ControlReply, ClientError> {
        let frame = ControlRequest::new(request_type, true, payload).to_frame();
        self.channel
            .data(&frame[..])
            .await
            .map_err(|_| ClientError::ConnectionLost)?;

        loop {
            if let Some(body) = self.frames.next_frame()? {
                return Ok(ControlReply::decode(body)?);
            }
            match self.channel.wait().await {
                Some(ChannelMsg::Data { data }) => self.frames.extend(&data),
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    return Err(ClientError::ConnectionLost)
                }
                Some(_) => continue,
            }
        }
    }

    async fn send(&mut self, request_type: &str, payload: Bytes) -> Result<(), ClientError> {
        let frame = ControlRequest::new(request_type, false, payload).to_frame();
        self.channel
            .data(&frame[..])
            .await
            .map_err(|_| ClientError::ConnectionLost)
    }
}

/// Per-connection SSH callbacks: accepts the channels the server opens for
/// forwarded requests and hands each to the backend proxier.
struct ClientHandler {
    backend: Option<Arc<Backend>>,
    closed: CancellationToken,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        _connected_port: u32,
        originator_address: &str,
        _originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let data = ForwardedChannelData {
            host: connected_address.to_string(),
            client_ip: originator_address.to_string(),
        };
        debug!(host = %data.host, client = %data.client_ip, "Accepted forwarded channel");

        let Some(backend) = self.backend.clone() else {
            // No backend configured: let the channel close, the server will
            // answer the public request with a bad-gateway.
            warn!(host = %data.host, "Forwarded channel received without a backend, dropping");
            return Ok(());
        };

        tokio::spawn(async move {
            if let Err(err) = proxy::serve_channel(channel.into_stream(), backend).await {
                debug!(error = %err, "Forwarded exchange ended with error");
            }
        });
        Ok(())
    }
}

impl Drop for ClientHandler {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}
