//! Migration to create the reflection metadata table.
//!
//! One row per synthesized per-tenant table, keyed by the scoped app label and
//! the generated model name so records stay stable across restarts.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(ModelMetadata::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ModelMetadata::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ModelMetadata::AppLabel).string_len(100).not_null())
                    .col(ColumnDef::new(ModelMetadata::Model).string_len(100).not_null())
                    .col(ColumnDef::new(ModelMetadata::Declaration).string_len(200).not_null())
                    .col(ColumnDef::new(ModelMetadata::TenantId).uuid().null())
                    .col(ColumnDef::new(ModelMetadata::TableName).string_len(128).not_null())
                    .col(ColumnDef::new(ModelMetadata::Kind).string_len(16).not_null())
                    .col(
                        ColumnDef::new(ModelMetadata::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_model_metadata_app_label_model")
                    .table(ModelMetadata::Table)
                    .col(ModelMetadata::AppLabel)
                    .col(ModelMetadata::Model)
                    .unique()
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_model_metadata_tenant_id")
                    .table(ModelMetadata::Table)
                    .col(ModelMetadata::TenantId)
                    .if_not_exists()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ModelMetadata::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum ModelMetadata {
    Table,
    Id,
    AppLabel,
    Model,
    Declaration,
    TenantId,
    TableName,
    Kind,
    CreatedAt,
}
