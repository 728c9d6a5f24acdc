//! Persistent hostname reservations.
//!
//! A reservation records which key owns a hostname; it gates who may activate
//! a tunnel for that name but does not itself serve traffic. The store is a
//! small trait so deployments can swap backends: in-memory for tests and
//! ephemeral runs, SQLite for single-node persistence. The core assumes
//! nothing beyond single-key atomicity and at-least-once durability.

mod db;
mod entity;
mod memory;
mod migration;

pub use db::DbHostStore;
pub use memory::MemoryHostStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A claimed hostname. At most one record per hostname.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    pub host: String,
    /// Canonical public-key text of the owner.
    pub owner: String,
    /// Address the registration came from.
    pub ip: String,
    pub created: DateTime<Utc>,
    pub last_use: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("host not found")]
    NoHost,

    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),
}

#[async_trait]
pub trait HostStore: Send + Sync {
    async fn has(&self, host: &str) -> Result<bool, StoreError>;

    /// Fetch the record for `host`, or [`StoreError::NoHost`].
    async fn get(&self, host: &str) -> Result<HostRecord, StoreError>;

    /// Insert or update the record keyed by its hostname.
    async fn add(&self, record: HostRecord) -> Result<(), StoreError>;

    async fn remove(&self, host: &str) -> Result<(), StoreError>;
}
