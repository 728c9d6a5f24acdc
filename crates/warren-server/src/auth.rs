//! Public-key identity handling.
//!
//! A connecting client is identified by the canonical authorized-keys text of
//! its public key: `<algorithm> <base64>`, whitespace-trimmed, comment
//! stripped. This string is the opaque owner label everywhere ownership is
//! checked, and byte equality of it is key equality.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use russh::keys::ssh_key::{self, PublicKey};
use tracing::warn;

use crate::error::ServerError;

/// Canonical textual form of a client public key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyIdentity(String);

impl KeyIdentity {
    pub fn from_public_key(key: &PublicKey) -> Result<Self, ssh_key::Error> {
        let openssh = key.to_openssh()?;
        Ok(Self::from_openssh_text(&openssh))
    }

    /// Canonicalize an authorized-keys style line: keep the algorithm and
    /// base64 fields, drop any comment and surrounding whitespace.
    pub(crate) fn from_openssh_text(text: &str) -> Self {
        let mut fields = text.split_whitespace();
        let canonical = match (fields.next(), fields.next()) {
            (Some(algorithm), Some(blob)) => format!("{algorithm} {blob}"),
            _ => text.trim().to_string(),
        };
        Self(canonical)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Optional allow-list of client keys.
///
/// With no list configured every presented key is accepted; with a list, the
/// canonical form of the presented key must match an entry.
#[derive(Debug, Clone, Default)]
pub struct AuthorizedKeys {
    allowed: Option<HashSet<KeyIdentity>>,
}

impl AuthorizedKeys {
    /// Accept any key.
    pub fn allow_any() -> Self {
        Self { allowed: None }
    }

    /// Load an authorized-keys file: one key per line, blank lines and `#`
    /// comments skipped. Unparseable lines are skipped with a warning, the
    /// way the usual sshd tooling behaves.
    pub fn from_file(path: &Path) -> Result<Self, ServerError> {
        let contents = std::fs::read_to_string(path)?;
        let mut allowed = HashSet::new();

        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match PublicKey::from_openssh(line) {
                Ok(key) => match KeyIdentity::from_public_key(&key) {
                    Ok(identity) => {
                        allowed.insert(identity);
                    }
                    Err(err) => {
                        warn!(line = lineno + 1, error = %err, "Skipping unserializable authorized key");
                    }
                },
                Err(err) => {
                    warn!(line = lineno + 1, error = %err, "Skipping unparseable authorized key");
                }
            }
        }

        Ok(Self {
            allowed: Some(allowed),
        })
    }

    pub fn is_allowed(&self, identity: &KeyIdentity) -> bool {
        match &self.allowed {
            None => true,
            Some(set) => set.contains(identity),
        }
    }
}
