//! Backend target parsing and TLS setup.
//!
//! A backend is whatever the client forwards incoming requests to, given as
//! a URL. `http`/`ws` dial plain TCP, `https`/`wss` wrap the socket in a TLS
//! client handshake with `ServerName` set to the backend host. Certificate
//! verification is on by default; the insecure path is an explicit opt-in
//! for local backends with self-signed certificates.

use std::sync::Arc;

use rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

use crate::error::ClientError;

/// Parsed backend target.
#[derive(Clone)]
pub struct Backend {
    /// `host[:port]` exactly as given; becomes the rewritten `Host` header.
    authority: String,
    /// `host:port` with the port defaulted, for dialing.
    dial_addr: String,
    tls: Option<BackendTls>,
}

#[derive(Clone)]
struct BackendTls {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl Backend {
    /// Parse a backend URL. A missing scheme means `http`; a missing port
    /// means 80.
    pub fn parse(url: &str, danger_accept_invalid_certs: bool) -> Result<Self, ClientError> {
        let (scheme, rest) = match url.split_once("://") {
            Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
            None => ("http".to_string(), url),
        };

        let tls_wrap = match scheme.as_str() {
            "http" | "ws" => false,
            "https" | "wss" => true,
            other => {
                return Err(ClientError::InvalidBackend(format!(
                    "unsupported scheme {other}"
                )))
            }
        };

        let authority = rest
            .split(&['/', '?', '#'][..])
            .next()
            .unwrap_or("")
            .trim();
        if authority.is_empty() {
            return Err(ClientError::InvalidBackend("missing host".into()));
        }

        let (host, port) = split_host_port(authority);
        let dial_addr = format!("{host}:{port}");

        let tls = if tls_wrap {
            Some(BackendTls::new(&host, danger_accept_invalid_certs)?)
        } else {
            None
        };

        Ok(Self {
            authority: authority.to_string(),
            dial_addr,
            tls,
        })
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn dial_addr(&self) -> &str {
        &self.dial_addr
    }

    pub(crate) fn tls(&self) -> Option<(&TlsConnector, ServerName<'static>)> {
        self.tls
            .as_ref()
            .map(|tls| (&tls.connector, tls.server_name.clone()))
    }
}

impl BackendTls {
    fn new(host: &str, danger_accept_invalid_certs: bool) -> Result<Self, ClientError> {
        ensure_crypto_provider();

        let server_name = ServerName::try_from(
            host.trim_start_matches('[').trim_end_matches(']').to_string(),
        )
        .map_err(|_| ClientError::InvalidBackend(format!("invalid tls server name {host}")))?;

        let config = if danger_accept_invalid_certs {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(SkipVerification::new())
                .with_no_client_auth()
        } else {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        };

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
        })
    }
}

/// Split `host[:port]` with a default port of 80, tolerating bracketed IPv6.
fn split_host_port(authority: &str) -> (String, u16) {
    if let Some(stripped) = authority.strip_prefix('[') {
        if let Some((host, rest)) = stripped.split_once(']') {
            let port = rest
                .strip_prefix(':')
                .and_then(|port| port.parse().ok())
                .unwrap_or(80);
            return (format!("[{host}]"), port);
        }
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !host.contains(':') => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (authority.to_string(), 80),
        },
        _ => (authority.to_string(), 80),
    }
}

static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            // Already installed
        }
    });
}

/// Certificate verifier that accepts anything. Only reachable through the
/// explicit `danger_accept_invalid_certs` opt-in.
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
