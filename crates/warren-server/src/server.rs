//! Server bootstrap: the SSH listener and the public HTTP ingress.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::control::{ConnectionHandler, ServerContext};
use crate::error::ServerError;
use crate::ingress;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// SSH listener address for client control connections.
    pub ssh_bind: String,
    /// Public HTTP ingress address.
    pub http_bind: String,
    /// Whether something in front of the ingress terminates TLS.
    pub tls_terminated: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ssh_bind: "0.0.0.0:2222".into(),
            http_bind: "0.0.0.0:8080".into(),
            tls_terminated: false,
        }
    }
}

/// A bound but not yet running server. Binding is separate from running so
/// callers can learn the actual addresses when binding port 0.
pub struct Server {
    config: ServerConfig,
    ctx: Arc<ServerContext>,
    ssh_config: Arc<russh::server::Config>,
    ssh_listener: TcpListener,
    http_listener: TcpListener,
    next_conn_id: AtomicU64,
}

impl Server {
    pub async fn bind(
        config: ServerConfig,
        host_key: russh::keys::PrivateKey,
        ctx: ServerContext,
    ) -> Result<Self, ServerError> {
        let ssh_listener =
            TcpListener::bind(&config.ssh_bind)
                .await
                .map_err(|source| ServerError::Bind {
                    addr: config.ssh_bind.clone(),
                    source,
                })?;
        let http_listener =
            TcpListener::bind(&config.http_bind)
                .await
                .map_err(|source| ServerError::Bind {
                    addr: config.http_bind.clone(),
                    source,
                })?;

        let ssh_config = Arc::new(russh::server::Config {
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::ZERO),
            keys: vec![host_key],
            ..Default::default()
        });

        Ok(Self {
            config,
            ctx: Arc::new(ctx),
            ssh_config,
            ssh_listener,
            http_listener,
            next_conn_id: AtomicU64::new(1),
        })
    }

    pub fn ssh_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.ssh_listener.local_addr()?)
    }

    pub fn http_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.http_listener.local_addr()?)
    }

    /// Serve until one of the listeners fails.
    pub async fn run(self) -> Result<(), ServerError> {
        info!(
            ssh = %self.ssh_listener.local_addr()?,
            http = %self.http_listener.local_addr()?,
            "Starting warren server"
        );

        let router = ingress::router(self.ctx.registry.clone(), self.config.tls_terminated);
        let http = axum::serve(
            self.http_listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        );

        let ssh = Self::accept_loop(
            self.ssh_listener,
            self.ssh_config,
            self.ctx,
            self.next_conn_id,
        );

        tokio::select! {
            result = ssh => result,
            result = http => result.map_err(ServerError::Io),
        }
    }

    async fn accept_loop(
        listener: TcpListener,
        ssh_config: Arc<russh::server::Config>,
        ctx: Arc<ServerContext>,
        next_conn_id: AtomicU64,
    ) -> Result<(), ServerError> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let conn_id = next_conn_id.fetch_add(1, Ordering::Relaxed);
            let cancel = CancellationToken::new();
            let handler = ConnectionHandler::new(ctx.clone(), conn_id, peer, cancel.clone());
            let ssh_config = ssh_config.clone();

            debug!(peer = %peer, conn_id, "Accepted SSH connection");
            tokio::spawn(async move {
                match russh::server::run_stream(ssh_config, stream, handler).await {
                    Ok(session) => {
                        tokio::select! {
                            result = session => {
                                if let Err(err) = result {
                                    debug!(peer = %peer, error = %err, "SSH session ended with error");
                                }
                            }
                            // Forced takeover: dropping the session closes the
                            // connection, and the handler sweeps its hosts.
                            _ = cancel.cancelled() => {
                                debug!(peer = %peer, "Connection closed by forced takeover");
                            }
                        }
                    }
                    Err(err) => {
                        warn!(peer = %peer, error = %err, "SSH handshake failed");
                    }
                }
            });
        }
    }
}
