//! Hosts table entity.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "hosts")]
pub struct Model {
    /// Hostname (primary key; stored lowercase).
    #[sea_orm(primary_key, auto_increment = false)]
    pub host: String,

    /// Canonical public-key text of the owner.
    #[sea_orm(column_type = "Text")]
    pub owner: String,

    /// Address the registration came from.
    pub ip: String,

    pub created: ChronoDateTimeUtc,

    pub last_use: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
