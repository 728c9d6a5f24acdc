//! warren - expose local HTTP services at public hostnames over SSH tunnels.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use warren_client::{Backend, TunnelClient};
use warren_server::{
    deny_all, deny_prefix_in, load_or_generate_key, suffix_in, validate_all, AuthorizedKeys,
    DbHostStore, HostStore, MemoryHostStore, NameProvider, Server, ServerConfig, ServerContext,
    TunnelRegistry,
};

#[derive(Parser, Debug)]
#[command(name = "warren")]
#[command(about = "Expose local HTTP services at public hostnames over SSH tunnels")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the tunnel server
    Serve {
        /// SSH listener address for client connections
        #[arg(long, default_value = "0.0.0.0:2222", env = "WARREN_SSH_BIND")]
        ssh_bind: String,

        /// Public HTTP ingress address
        #[arg(long, default_value = "0.0.0.0:8080", env = "WARREN_HTTP_BIND")]
        http_bind: String,

        /// Host key file, generated when missing (ephemeral when unset)
        #[arg(long, env = "WARREN_HOST_KEY")]
        host_key: Option<PathBuf>,

        /// Authorized keys file restricting who may connect
        #[arg(long)]
        authorized_keys: Option<PathBuf>,

        /// SQLite file holding hostname reservations
        #[arg(long, default_value = "warren-hosts.db")]
        store: PathBuf,

        /// Keep reservations in memory only
        #[arg(long)]
        ephemeral: bool,

        /// Domain generated hostnames are placed under and custom hosts may
        /// register within; repeatable. Without one, custom hosts are denied.
        #[arg(long = "domain")]
        domains: Vec<String>,

        /// Set when something in front of the ingress terminates TLS
        #[arg(long)]
        tls_terminated: bool,
    },

    /// Forward a local backend through a warren server
    Http {
        /// Backend URL to forward requests to (e.g. http://localhost:3000)
        backend: String,

        /// Server address
        #[arg(long, default_value = "localhost:2222", env = "WARREN_SERVER")]
        server: String,

        /// Reserved hostname to serve on (server-assigned when omitted)
        #[arg(long)]
        host: Option<String>,

        /// Take over the hostname from a live tunnel you own
        #[arg(long)]
        force: bool,

        /// Skip TLS certificate verification toward the backend
        #[arg(long)]
        insecure: bool,

        /// Client key file, generated when missing
        #[arg(long, env = "WARREN_CLIENT_KEY")]
        key: Option<PathBuf>,

        /// SSH username to present
        #[arg(long, default_value = "warren")]
        user: String,
    },

    /// Reserve a hostname for this client's key
    Register {
        host: String,

        #[arg(long, default_value = "localhost:2222", env = "WARREN_SERVER")]
        server: String,

        #[arg(long, env = "WARREN_CLIENT_KEY")]
        key: Option<PathBuf>,

        #[arg(long, default_value = "warren")]
        user: String,
    },

    /// Release a reserved hostname
    Unregister {
        host: String,

        #[arg(long, default_value = "localhost:2222", env = "WARREN_SERVER")]
        server: String,

        #[arg(long, env = "WARREN_CLIENT_KEY")]
        key: Option<PathBuf>,

        #[arg(long, default_value = "warren")]
        user: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Serve {
            ssh_bind,
            http_bind,
            host_key,
            authorized_keys,
            store,
            ephemeral,
            domains,
            tls_terminated,
        } => {
            serve(
                ssh_bind,
                http_bind,
                host_key,
                authorized_keys,
                store,
                ephemeral,
                domains,
                tls_terminated,
            )
            .await
        }
        Commands::Http {
            backend,
            server,
            host,
            force,
            insecure,
            key,
            user,
        } => http(backend, server, host, force, insecure, key, user).await,
        Commands::Register {
            host,
            server,
            key,
            user,
        } => {
            let client = connect_control(&server, &user, key).await?;
            let host = client
                .register(&host)
                .await
                .context("unable to register host")?;
            println!("Successfully registered host {host}");
            client.disconnect().await.ok();
            Ok(())
        }
        Commands::Unregister {
            host,
            server,
            key,
            user,
        } => {
            let client = connect_control(&server, &user, key).await?;
            let host = client
                .unregister(&host)
                .await
                .context("unable to unregister host")?;
            println!("Successfully unregistered host {host}");
            client.disconnect().await.ok();
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn serve(
    ssh_bind: String,
    http_bind: String,
    host_key: Option<PathBuf>,
    authorized_keys: Option<PathBuf>,
    store_path: PathBuf,
    ephemeral: bool,
    domains: Vec<String>,
    tls_terminated: bool,
) -> Result<()> {
    let store: Arc<dyn HostStore> = if ephemeral {
        info!("Using in-memory host store, reservations will not persist");
        Arc::new(MemoryHostStore::new())
    } else {
        let url = DbHostStore::sqlite_url(&store_path);
        Arc::new(
            DbHostStore::connect(&url)
                .await
                .with_context(|| format!("unable to open host store {}", store_path.display()))?,
        )
    };

    let provider = NameProvider::embedded(domains.clone());
    let validator = if domains.is_empty() {
        // No domain policy configured: only generated names are served.
        deny_all()
    } else {
        info!(domains = ?domains, "Registered domains for random use");
        validate_all(vec![
            deny_prefix_in(provider.words().to_vec()),
            suffix_in(domains),
        ])
    };

    let authorized = match authorized_keys {
        Some(path) => {
            info!(path = %path.display(), "Authorizing public keys on connection");
            AuthorizedKeys::from_file(&path)
                .with_context(|| format!("unable to load authorized keys {}", path.display()))?
        }
        None => AuthorizedKeys::allow_any(),
    };

    let host_key = load_or_generate_key(host_key.as_deref())
        .await
        .context("unable to load or generate server key")?;

    let ctx = ServerContext {
        registry: Arc::new(TunnelRegistry::new()),
        store,
        provider,
        validator,
        authorized,
    };

    let server = Server::bind(
        ServerConfig {
            ssh_bind,
            http_bind,
            tls_terminated,
        },
        host_key,
        ctx,
    )
    .await?;

    server.run().await.map_err(Into::into)
}

async fn http(
    backend: String,
    server: String,
    host: Option<String>,
    force: bool,
    insecure: bool,
    key: Option<PathBuf>,
    user: String,
) -> Result<()> {
    let parsed = Backend::parse(&backend, insecure).context("invalid backend url")?;
    let client_key = load_client_key(key).await?;

    let client = TunnelClient::connect(&server, &user, client_key, Some(parsed))
        .await
        .with_context(|| format!("unable to connect to {server}"))?;

    let host = client
        .start_http_forwarding(host.as_deref().unwrap_or(""), force)
        .await
        .context("unable to start forwarding")?;

    println!("Successfully bound host and started proxy");
    println!("Endpoints:");
    println!("http://{host}");
    println!("https://{host}");

    let closed = client.closed();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!(host = %host, "Shutting down");
            client.cancel_http_forwarding(&host).await.ok();
            client.disconnect().await.ok();
        }
        _ = closed.cancelled() => {
            // Best-effort: the connection is likely already gone.
            client.cancel_http_forwarding(&host).await.ok();
            anyhow::bail!("server closed the connection");
        }
    }
    Ok(())
}

async fn connect_control(
    server: &str,
    user: &str,
    key: Option<PathBuf>,
) -> Result<TunnelClient> {
    let client_key = load_client_key(key).await?;
    TunnelClient::connect(server, user, client_key, None)
        .await
        .with_context(|| format!("unable to connect to {server}"))
}

async fn load_client_key(path: Option<PathBuf>) -> Result<russh::keys::PrivateKey> {
    if path.is_none() {
        warn!("No client key configured, using a throwaway key for this run");
    }
    load_or_generate_key(path.as_deref())
        .await
        .context("unable to load or generate client key")
}
