//! SQLite-backed host store.

use std::path::Path;

use async_trait::async_trait;
use sea_orm::sea_query::OnConflict;
use sea_orm::{ActiveValue::Set, ConnectionTrait, Database, DatabaseConnection, EntityTrait};
use sea_orm_migration::MigratorTrait;
use tracing::info;

use super::entity::{self, Entity as Hosts};
use super::migration::Migrator;
use super::{HostRecord, HostStore, StoreError};

/// Single-file embedded store; one row per reserved hostname.
#[derive(Debug, Clone)]
pub struct DbHostStore {
    db: DatabaseConnection,
}

impl DbHostStore {
    /// Connect and bring the schema up to date. Accepts any sea-orm URL;
    /// use [`DbHostStore::sqlite_url`] for file-backed stores or
    /// `sqlite::memory:` for throwaway ones.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let db = Database::connect(url).await?;
        Migrator::up(&db, None).await?;
        info!(backend = ?db.get_database_backend(), "Host store ready");
        Ok(Self { db })
    }

    /// URL for a file-backed SQLite store, creating the file when absent.
    pub fn sqlite_url(path: &Path) -> String {
        format!("sqlite://{}?mode=rwc", path.display())
    }
}

impl From<entity::Model> for HostRecord {
    fn from(model: entity::Model) -> Self {
        Self {
            host: model.host,
            owner: model.owner,
            ip: model.ip,
            created: model.created,
            last_use: model.last_use,
        }
    }
}

#[async_trait]
impl HostStore for DbHostStore {
    async fn has(&self, host: &str) -> Result<bool, StoreError> {
        Ok(Hosts::find_by_id(host).one(&self.db).await?.is_some())
    }

    async fn get(&self, host: &str) -> Result<HostRecord, StoreError> {
        Hosts::find_by_id(host)
            .one(&self.db)
            .await?
            .map(HostRecord::from)
            .ok_or(StoreError::NoHost)
    }

    async fn add(&self, record: HostRecord) -> Result<(), StoreError> {
        let model = entity::ActiveModel {
            host: Set(record.host),
            owner: Set(record.owner),
            ip: Set(record.ip),
            created: Set(record.created),
            last_use: Set(record.last_use),
        };
        Hosts::insert(model)
            .on_conflict(
                OnConflict::column(entity::Column::Host)
                    .update_columns([
                        entity::Column::Owner,
                        entity::Column::Ip,
                        entity::Column::Created,
                        entity::Column::LastUse,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn remove(&self, host: &str) -> Result<(), StoreError> {
        Hosts::delete_by_id(host).exec(&self.db).await?;
        Ok(())
    }
}
