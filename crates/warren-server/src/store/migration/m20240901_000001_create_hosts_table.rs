//! Initial hosts table.

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Hosts::Table)
                    .if_not_exists()
                    .col(string(Hosts::Host).primary_key())
                    .col(text(Hosts::Owner).not_null())
                    .col(string(Hosts::Ip).not_null())
                    .col(timestamp_with_time_zone(Hosts::Created).not_null())
                    .col(timestamp_with_time_zone(Hosts::LastUse).not_null())
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Hosts::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum Hosts {
    Table,
    Host,
    Owner,
    Ip,
    Created,
    LastUse,
}
