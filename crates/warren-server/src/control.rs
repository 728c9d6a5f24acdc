//! SSH control plane.
//!
//! One [`ConnectionHandler`] exists per client connection. Authentication
//! binds the client's public-key identity to the handler; the four control
//! operations then arrive as frames on the `warren-control` subsystem
//! channel and are processed strictly in arrival order. Registry entries
//! owned by the connection are swept when the handler is dropped, which is
//! how both normal disconnects and forced takeovers clean up.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use russh::keys::PublicKey;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodKind, MethodSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use warren_proto::{
    ControlReply, ControlRequest, ForwardCancel, ForwardRequest, ForwardSuccess, FrameBuffer,
    HostRegisterRequest, HostRegisterSuccess, CANCEL_HTTP_FORWARD, CONTROL_SUBSYSTEM, HTTP_FORWARD,
    REGISTER_HOST, UNREGISTER_HOST,
};

use crate::auth::{AuthorizedKeys, KeyIdentity};
use crate::names::{HostValidator, NameProvider};
use crate::registry::{ActiveTunnel, ClaimOutcome, RemoveOutcome, TunnelRegistry};
use crate::store::{HostRecord, HostStore};

/// Shared state behind every connection: the registry, the reservation
/// store, and the naming policy.
pub struct ServerContext {
    pub registry: Arc<TunnelRegistry>,
    pub store: Arc<dyn HostStore>,
    pub provider: NameProvider,
    pub validator: HostValidator,
    pub authorized: AuthorizedKeys,
}

/// Per-connection SSH handler.
pub(crate) struct ConnectionHandler {
    ctx: Arc<ServerContext>,
    conn_id: u64,
    peer: SocketAddr,
    cancel: CancellationToken,
    identity: Option<KeyIdentity>,
    control_channel: Option<ChannelId>,
    frames: FrameBuffer,
}

impl ConnectionHandler {
    pub(crate) fn new(
        ctx: Arc<ServerContext>,
        conn_id: u64,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            conn_id,
            peer,
            cancel,
            identity: None,
            control_channel: None,
            frames: FrameBuffer::new(),
        }
    }

    fn active_tunnel(&self, handle: &russh::server::Handle, identity: KeyIdentity) -> ActiveTunnel {
        ActiveTunnel {
            conn_id: self.conn_id,
            handle: handle.clone(),
            identity,
            peer: self.peer,
            cancel: self.cancel.clone(),
        }
    }

    async fn handle_control(
        &mut self,
        handle: &russh::server::Handle,
        request: ControlRequest,
    ) -> ControlReply {
        debug!(request_type = %request.request_type, "Handling control request");
        match request.request_type.as_str() {
            HTTP_FORWARD => self.handle_forward(handle, request.payload).await,
            CANCEL_HTTP_FORWARD => self.handle_cancel(request.payload),
            REGISTER_HOST => self.handle_register(request.payload).await,
            UNREGISTER_HOST => self.handle_unregister(request.payload).await,
            other => {
                debug!(request_type = %other, "Rejecting unknown control request");
                ControlReply::reject_silent()
            }
        }
    }

    async fn handle_forward(
        &mut self,
        handle: &russh::server::Handle,
        payload: Bytes,
    ) -> ControlReply {
        let request = match ForwardRequest::decode(payload) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "Error parsing payload for http-forward");
                return ControlReply::reject_silent();
            }
        };
        let Some(identity) = self.identity.clone() else {
            return ControlReply::reject_silent();
        };

        let host = request.requested_host.to_lowercase();

        let assigned = if !host.is_empty() {
            if !(self.ctx.validator)(&host) {
                return ControlReply::reject(&format!("invalid host {host}"));
            }

            let mut record = match self.ctx.store.get(&host).await {
                Ok(record) => record,
                Err(_) => return ControlReply::reject("host not registered"),
            };

            if record.owner != identity.as_str() {
                return ControlReply::reject("host claimed and not owned by current key");
            }

            let tunnel = self.active_tunnel(handle, identity);
            match self.ctx.registry.claim(&host, tunnel, request.force) {
                ClaimOutcome::Conflict => {
                    return ControlReply::reject("host already in use and force not set");
                }
                ClaimOutcome::Displaced(previous) => {
                    info!(host = %host, "Forcing previous connection to close");
                    // The displaced connection sweeps its own entries as it
                    // dies; the claim already holds this host under our
                    // connection id, so that sweep skips it.
                    previous.cancel.cancel();
                }
                ClaimOutcome::Inserted => {}
            }

            record.last_use = Utc::now();
            if let Err(err) = self.ctx.store.add(record).await {
                warn!(host = %host, error = %err, "Failed to persist last-use time");
            }
            host
        } else {
            let tunnel = self.active_tunnel(handle, identity);
            let provider = self.ctx.provider.clone();
            match self
                .ctx
                .registry
                .insert_generated(tunnel, || provider.generate())
            {
                Ok(host) => host,
                Err(err) => return ControlReply::reject(&err.to_string()),
            }
        };

        info!(host = %assigned, peer = %self.peer, "Registered host");
        ControlReply::accept(ForwardSuccess { host: assigned }.encode())
    }

    fn handle_cancel(&mut self, payload: Bytes) -> ControlReply {
        let request = match ForwardCancel::decode(payload) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "Error parsing payload for cancel-http-forward");
                return ControlReply::reject_silent();
            }
        };
        let Some(identity) = self.identity.clone() else {
            return ControlReply::reject_silent();
        };

        let host = request.host.to_lowercase();
        match self.ctx.registry.remove(&host, &identity) {
            RemoveOutcome::Absent => ControlReply::reject("host not found"),
            RemoveOutcome::NotOwner => ControlReply::reject("host not owned by key"),
            RemoveOutcome::Removed => {
                info!(host = %host, "Unregistered host");
                ControlReply::accept(Bytes::new())
            }
        }
    }

    async fn handle_register(&mut self, payload: Bytes) -> ControlReply {
        let request = match HostRegisterRequest::decode(payload) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "Error parsing payload for register-host");
                return ControlReply::reject_silent();
            }
        };
        let Some(identity) = self.identity.clone() else {
            return ControlReply::reject_silent();
        };

        let host = request.host.to_lowercase();
        if host.is_empty() || !(self.ctx.validator)(&host) {
            warn!(host = %host, "Host failed validation");
            return ControlReply::reject(&format!("invalid host {host}"));
        }

        match self.ctx.store.has(&host).await {
            Ok(true) => {
                warn!(host = %host, "Host is already taken");
                return ControlReply::reject("host is already taken");
            }
            Ok(false) => {}
            Err(err) => return ControlReply::reject(&err.to_string()),
        }

        let ip = self.peer.ip().to_string();
        let now = Utc::now();
        info!(host = %host, ip = %ip, "Registering host");

        let record = HostRecord {
            host: host.clone(),
            owner: identity.as_str().to_string(),
            ip,
            created: now,
            last_use: now,
        };
        if let Err(err) = self.ctx.store.add(record).await {
            return ControlReply::reject(&err.to_string());
        }

        ControlReply::accept(HostRegisterSuccess { host }.encode())
    }

    async fn handle_unregister(&mut self, payload: Bytes) -> ControlReply {
        let request = match HostRegisterRequest::decode(payload) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = %err, "Error parsing payload for unregister-host");
                return ControlReply::reject_silent();
            }
        };
        let Some(identity) = self.identity.clone() else {
            return ControlReply::reject_silent();
        };

        let host = request.host.to_lowercase();
        if host.is_empty() || !(self.ctx.validator)(&host) {
            return ControlReply::reject(&format!("invalid host {host}"));
        }

        let record = match self.ctx.store.get(&host).await {
            Ok(record) => record,
            Err(err) => return ControlReply::reject(&err.to_string()),
        };

        if record.owner != identity.as_str() {
            return ControlReply::reject("this host is not owned by you");
        }

        if let Err(err) = self.ctx.store.remove(&host).await {
            return ControlReply::reject(&err.to_string());
        }

        info!(host = %host, "Unregistered reserved host");
        ControlReply::accept(HostRegisterSuccess { host }.encode())
    }
}

impl Handler for ConnectionHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::from(&[MethodKind::PublicKey][..])),
            partial_success: false,
        })
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        let identity = match KeyIdentity::from_public_key(public_key) {
            Ok(identity) => identity,
            Err(err) => {
                warn!(peer = %self.peer, error = %err, "Could not serialize offered public key");
                return Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                });
            }
        };

        debug!(peer = %self.peer, user = %user, key = %identity, "Client is attempting public key auth");

        if !self.ctx.authorized.is_allowed(&identity) {
            info!(peer = %self.peer, "Public key not in authorized keys, rejecting");
            return Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            });
        }

        self.identity = Some(identity);
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!(peer = %self.peer, channel = ?channel.id(), "Session channel opened");
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.identity.is_none() {
            return Err(russh::Error::Disconnect);
        }
        if name == CONTROL_SUBSYSTEM {
            debug!(peer = %self.peer, "Control subsystem opened");
            self.control_channel = Some(channel_id);
            let _ = session.channel_success(channel_id);
        } else {
            let _ = session.channel_failure(channel_id);
        }
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let _ = session.channel_success(channel_id);
        let handle = session.handle();
        tokio::spawn(async move {
            let banner = format!(
                "This server only forwards HTTP requests for registered hosts.\r\n\
                 Supported control operations: {HTTP_FORWARD}, {CANCEL_HTTP_FORWARD}, \
                 {REGISTER_HOST}, {UNREGISTER_HOST}\r\n",
            );
            let _ = handle
                .data(channel_id, CryptoVec::from_slice(banner.as_bytes()))
                .await;
            let _ = handle.eof(channel_id).await;
            let _ = handle.close(channel_id).await;
        });
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Same story as an interactive shell: nothing to execute here.
        self.shell_request(channel_id, session).await
    }

    async fn data(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.control_channel != Some(channel_id) {
            return Ok(());
        }

        let handle = session.handle();
        self.frames.extend(data);
        let mut replies: Vec<Vec<u8>> = Vec::new();
        loop {
            let body = match self.frames.next_frame() {
                Ok(Some(body)) => body,
                Ok(None) => break,
                Err(err) => {
                    warn!(peer = %self.peer, error = %err, "Corrupt control frame, disconnecting");
                    return Err(russh::Error::Disconnect);
                }
            };

            let (want_reply, reply) = match ControlRequest::decode(body) {
                Ok(request) => {
                    let want_reply = request.want_reply;
                    let reply = self.handle_control(&handle, request).await;
                    (want_reply, reply)
                }
                Err(err) => {
                    warn!(peer = %self.peer, error = %err, "Error parsing control request");
                    (true, ControlReply::reject_silent())
                }
            };

            if want_reply {
                replies.push(reply.to_frame());
            }
        }

        if !replies.is_empty() {
            // One task per batch keeps replies in request order.
            tokio::spawn(async move {
                for frame in replies {
                    if handle
                        .data(channel_id, CryptoVec::from_slice(&frame))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            });
        }
        Ok(())
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        let removed = self.ctx.registry.remove_connection(self.conn_id);
        if !removed.is_empty() {
            info!(peer = %self.peer, hosts = ?removed, "Connection closed, hosts removed");
        } else {
            debug!(peer = %self.peer, "Connection closed");
        }
    }
}
