//! Key file loading and generation.

use std::path::Path;

use russh::keys::ssh_key::{rand_core::OsRng, Algorithm, LineEnding};
use russh::keys::{load_secret_key, PrivateKey};
use tracing::info;

use crate::error::ServerError;

/// Load an OpenSSH private key from `path`, generating and persisting a new
/// Ed25519 key when the file does not exist. With no path, a fresh in-memory
/// key is returned.
pub async fn load_or_generate_key(path: Option<&Path>) -> Result<PrivateKey, ServerError> {
    match path {
        None => Ok(PrivateKey::random(&mut OsRng, Algorithm::Ed25519)?),
        Some(path) if path.exists() => {
            info!(path = %path.display(), "Loading key");
            Ok(load_secret_key(path, None)?)
        }
        Some(path) => {
            info!(path = %path.display(), "Generating new Ed25519 key");
            let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)?;
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            tokio::fs::write(path, key.to_openssh(LineEnding::LF)?.as_bytes()).await?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
            }
            Ok(key)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generates_and_reloads_key() {
        let dir = std::env::temp_dir().join(format!("warren-key-test-{}", std::process::id()));
        let path = dir.join("server.key");

        let generated = load_or_generate_key(Some(&path)).await.unwrap();
        assert!(path.exists());

        let reloaded = load_or_generate_key(Some(&path)).await.unwrap();
        assert_eq!(
            generated.public_key().to_openssh().unwrap(),
            reloaded.public_key().to_openssh().unwrap()
        );

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn no_path_generates_ephemeral_key() {
        let first = load_or_generate_key(None).await.unwrap();
        let second = load_or_generate_key(None).await.unwrap();
        assert_ne!(
            first.public_key().to_openssh().unwrap(),
            second.public_key().to_openssh().unwrap()
        );
    }
}
