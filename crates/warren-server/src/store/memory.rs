//! In-memory host store for tests and ephemeral servers.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{HostRecord, HostStore, StoreError};

#[derive(Debug, Default)]
pub struct MemoryHostStore {
    records: RwLock<HashMap<String, HostRecord>>,
}

impl MemoryHostStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HostStore for MemoryHostStore {
    async fn has(&self, host: &str) -> Result<bool, StoreError> {
        Ok(self.records.read().await.contains_key(host))
    }

    async fn get(&self, host: &str) -> Result<HostRecord, StoreError> {
        self.records
            .read()
            .await
            .get(host)
            .cloned()
            .ok_or(StoreError::NoHost)
    }

    async fn add(&self, record: HostRecord) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .insert(record.host.clone(), record);
        Ok(())
    }

    async fn remove(&self, host: &str) -> Result<(), StoreError> {
        self.records.write().await.remove(host);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(host: &str, owner: &str) -> HostRecord {
        let now = Utc::now();
        HostRecord {
            host: host.into(),
            owner: owner.into(),
            ip: "127.0.0.1".into(),
            created: now,
            last_use: now,
        }
    }

    #[tokio::test]
    async fn add_get_remove() {
        let store = MemoryHostStore::new();
        assert!(!store.has("app.example.com").await.unwrap());
        assert!(matches!(
            store.get("app.example.com").await,
            Err(StoreError::NoHost)
        ));

        store.add(record("app.example.com", "k1")).await.unwrap();
        assert!(store.has("app.example.com").await.unwrap());
        assert_eq!(store.get("app.example.com").await.unwrap().owner, "k1");

        store.remove("app.example.com").await.unwrap();
        assert!(!store.has("app.example.com").await.unwrap());
    }

    #[tokio::test]
    async fn add_is_upsert() {
        let store = MemoryHostStore::new();
        store.add(record("app.example.com", "k1")).await.unwrap();
        store.add(record("app.example.com", "k2")).await.unwrap();
        assert_eq!(store.get("app.example.com").await.unwrap().owner, "k2");
    }
}
