//! In-memory hostname registry.
//!
//! Maps each active hostname to the tunnel serving it. At most one tunnel per
//! hostname at any instant; hostnames are canonicalized to lowercase at every
//! boundary. Guarded by a reader-writer lock held only across pure in-memory
//! updates, so lookups on the ingress path never wait on I/O.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::auth::KeyIdentity;
use crate::error::RegistryError;

/// Bound on the generate-check-insert loop for server-assigned names.
const MAX_NAME_ATTEMPTS: usize = 64;

/// A value that can live in the registry: it knows who owns it and which
/// connection it belongs to, so removal can be ownership-checked and a dying
/// connection can sweep exactly its own entries.
pub trait TunnelEntry: Clone + Send + Sync + 'static {
    fn identity(&self) -> &KeyIdentity;
    fn connection_id(&self) -> u64;
}

/// An active tunnel: the authenticated connection serving a hostname.
///
/// `handle` opens per-request channels toward the client; `cancel` tears the
/// whole connection down (used by forced takeover). Eviction of the entry
/// itself happens when the owning connection's handler is dropped.
#[derive(Clone)]
pub struct ActiveTunnel {
    pub conn_id: u64,
    pub handle: russh::server::Handle,
    pub identity: KeyIdentity,
    pub peer: SocketAddr,
    pub cancel: CancellationToken,
}

impl TunnelEntry for ActiveTunnel {
    fn identity(&self) -> &KeyIdentity {
        &self.identity
    }

    fn connection_id(&self) -> u64 {
        self.conn_id
    }
}

/// Outcome of an ownership-checked removal.
#[derive(Debug, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    NotOwner,
    Absent,
}

/// Outcome of an atomic [`HostnameRegistry::claim`].
#[derive(Debug, PartialEq, Eq)]
pub enum ClaimOutcome<T> {
    /// The hostname was free and is now held by the new tunnel.
    Inserted,
    /// The hostname was occupied and force was set; the previous tunnel has
    /// been evicted and is returned so its connection can be closed.
    Displaced(T),
    /// The hostname is occupied and force was not set.
    Conflict,
}

/// Concurrent hostname → tunnel map.
///
/// Generic over the entry type so the locking discipline can be exercised in
/// tests without a live SSH session behind each entry.
#[derive(Debug, Default)]
pub struct HostnameRegistry<T> {
    entries: RwLock<HashMap<String, T>>,
}

pub type TunnelRegistry = HostnameRegistry<ActiveTunnel>;

impl<T: TunnelEntry> HostnameRegistry<T> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a tunnel for `host`, failing if the hostname is already served.
    /// The check and the insert are one critical section, so two racing
    /// forwards for the same name cannot both succeed.
    pub fn insert(&self, host: &str, entry: T) -> Result<(), RegistryError> {
        let host = host.to_lowercase();
        let mut entries = self.entries.write().unwrap();
        if entries.contains_key(&host) {
            return Err(RegistryError::Conflict);
        }
        entries.insert(host, entry);
        Ok(())
    }

    /// Claim `host` for a tunnel: insert when free, evict the holder when
    /// `force` is set, refuse otherwise. The decision and the write are one
    /// critical section, so two racing claims for the same name serialize
    /// and exactly one of them ends up holding it. The displaced entry is
    /// returned rather than cancelled here; no callbacks run under the lock.
    pub fn claim(&self, host: &str, entry: T, force: bool) -> ClaimOutcome<T> {
        let host = host.to_lowercase();
        let mut entries = self.entries.write().unwrap();
        if entries.contains_key(&host) && !force {
            return ClaimOutcome::Conflict;
        }
        match entries.insert(host, entry) {
            Some(previous) => ClaimOutcome::Displaced(previous),
            None => ClaimOutcome::Inserted,
        }
    }

    pub fn lookup(&self, host: &str) -> Option<T> {
        let host = host.to_lowercase();
        self.entries.read().unwrap().get(&host).cloned()
    }

    /// Remove `host` if and only if `identity` owns it.
    pub fn remove(&self, host: &str, identity: &KeyIdentity) -> RemoveOutcome {
        let host = host.to_lowercase();
        let mut entries = self.entries.write().unwrap();
        match entries.get(&host) {
            None => RemoveOutcome::Absent,
            Some(entry) if entry.identity() != identity => RemoveOutcome::NotOwner,
            Some(_) => {
                entries.remove(&host);
                RemoveOutcome::Removed
            }
        }
    }

    /// Sweep every entry owned by `conn_id`. Called when a connection
    /// terminates; removes all of its hostnames, not just a contested one.
    pub fn remove_connection(&self, conn_id: u64) -> Vec<String> {
        let mut entries = self.entries.write().unwrap();
        let hosts: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.connection_id() == conn_id)
            .map(|(host, _)| host.clone())
            .collect();
        for host in &hosts {
            entries.remove(host);
            info!(host = %host, "Removed host");
        }
        hosts
    }

    /// Draw names from `generate` until one is free and insert the tunnel
    /// under it, all inside a single write critical section so a concurrent
    /// forward cannot claim the drawn name between the check and the insert.
    pub fn insert_generated(
        &self,
        entry: T,
        mut generate: impl FnMut() -> String,
    ) -> Result<String, RegistryError> {
        let mut entries = self.entries.write().unwrap();
        for _ in 0..MAX_NAME_ATTEMPTS {
            let host = generate().to_lowercase();
            if !entries.contains_key(&host) {
                entries.insert(host.clone(), entry);
                return Ok(host);
            }
            debug!(host = %host, "Generated name already in use, retrying");
        }
        Err(RegistryError::Exhausted)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }
}
