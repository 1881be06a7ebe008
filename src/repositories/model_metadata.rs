//! # Model Metadata Repository
//!
//! Get-or-create and tenant-scoped removal of reflection metadata records.

use crate::models::model_metadata::{
    ActiveModel as MetadataActiveModel, Column as MetadataColumn, Entity as ModelMetadata,
    KIND_JUNCTION, Model as MetadataModel,
};
use chrono::Utc;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ColumnTrait, ConnectionTrait, DbErr, EntityTrait, NotSet, QueryFilter, QueryOrder, Set,
};
use uuid::Uuid;

/// Record to register for a synthesized table.
#[derive(Debug, Clone)]
pub struct NewModelMetadata {
    pub app_label: String,
    pub model: String,
    pub declaration: String,
    pub tenant_id: Option<Uuid>,
    pub table_name: String,
    pub kind: &'static str,
}

pub struct ModelMetadataRepository<'a, C: ConnectionTrait> {
    db: &'a C,
}

impl<'a, C: ConnectionTrait> ModelMetadataRepository<'a, C> {
    pub fn new(db: &'a C) -> Self {
        Self { db }
    }

    pub async fn find(&self, app_label: &str, model: &str) -> Result<Option<MetadataModel>, DbErr> {
        ModelMetadata::find()
            .filter(MetadataColumn::AppLabel.eq(app_label))
            .filter(MetadataColumn::Model.eq(model))
            .one(self.db)
            .await
    }

    pub async fn find_by_table(&self, table_name: &str) -> Result<Option<MetadataModel>, DbErr> {
        ModelMetadata::find()
            .filter(MetadataColumn::TableName.eq(table_name))
            .one(self.db)
            .await
    }

    /// Returns the record for `(app_label, model)`, inserting it if absent.
    ///
    /// The boolean is true when this call created the record. An existing
    /// record describing another declaration or table is an error.
    pub async fn get_or_create(
        &self,
        record: NewModelMetadata,
    ) -> Result<(MetadataModel, bool), DbErr> {
        if let Some(existing) = self.find(&record.app_label, &record.model).await? {
            ensure_same_model(&existing, &record)?;
            return Ok((existing, false));
        }

        let active = MetadataActiveModel {
            id: NotSet,
            app_label: Set(record.app_label.clone()),
            model: Set(record.model.clone()),
            declaration: Set(record.declaration.clone()),
            tenant_id: Set(record.tenant_id),
            table_name: Set(record.table_name.clone()),
            kind: Set(record.kind.to_string()),
            created_at: Set(Utc::now().into()),
        };

        // Another process may have registered the same name in the meantime.
        let inserted = ModelMetadata::insert(active)
            .on_conflict(
                OnConflict::columns([MetadataColumn::AppLabel, MetadataColumn::Model])
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(self.db)
            .await?;

        let stored = self
            .find(&record.app_label, &record.model)
            .await?
            .ok_or_else(|| {
                DbErr::RecordNotFound(format!(
                    "model metadata {}.{} after insert",
                    record.app_label, record.model
                ))
            })?;
        ensure_same_model(&stored, &record)?;
        Ok((stored, inserted > 0))
    }

    /// Records of one tenant in teardown order: junctions first, then newest first.
    pub async fn list_for_tenant(&self, tenant_id: Uuid) -> Result<Vec<MetadataModel>, DbErr> {
        let mut records = ModelMetadata::find()
            .filter(MetadataColumn::TenantId.eq(tenant_id))
            .order_by_desc(MetadataColumn::Id)
            .all(self.db)
            .await?;
        records.sort_by_key(|record| record.kind != KIND_JUNCTION);
        Ok(records)
    }

    pub async fn delete_for_tenant(&self, tenant_id: Uuid) -> Result<u64, DbErr> {
        let result = ModelMetadata::delete_many()
            .filter(MetadataColumn::TenantId.eq(tenant_id))
            .exec(self.db)
            .await?;
        Ok(result.rows_affected)
    }
}

fn ensure_same_model(existing: &MetadataModel, record: &NewModelMetadata) -> Result<(), DbErr> {
    if existing.declaration == record.declaration && existing.table_name == record.table_name {
        return Ok(());
    }
    Err(DbErr::Custom(format!(
        "model metadata {}.{} already describes {} (table {}), not {} (table {})",
        record.app_label,
        record.model,
        existing.declaration,
        existing.table_name,
        record.declaration,
        record.table_name
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::model_metadata::KIND_MODEL;
    use migration::{Migrator, MigratorTrait};
    use sea_orm::Database;

    fn record(tenant_id: Uuid, model: &str, kind: &'static str) -> NewModelMetadata {
        NewModelMetadata {
            app_label: format!("tenant_{}", tenant_id.simple()),
            model: model.to_string(),
            declaration: format!("tests.{model}"),
            tenant_id: Some(tenant_id),
            table_name: format!("tenant_{}__tests__{model}", tenant_id.simple()),
            kind,
        }
    }

    #[tokio::test]
    async fn get_or_create_reuses_existing_record() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        let repo = ModelMetadataRepository::new(&db);
        let tenant = Uuid::new_v4();

        let (first, created) = repo.get_or_create(record(tenant, "widget", KIND_MODEL)).await.unwrap();
        assert!(created);
        let (second, created) = repo.get_or_create(record(tenant, "widget", KIND_MODEL)).await.unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);

        let by_table = repo.find_by_table(&first.table_name).await.unwrap().unwrap();
        assert_eq!(by_table.id, first.id);
    }

    #[tokio::test]
    async fn get_or_create_rejects_a_record_of_another_table() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        let repo = ModelMetadataRepository::new(&db);
        let tenant = Uuid::new_v4();

        repo.get_or_create(record(tenant, "item", KIND_MODEL)).await.unwrap();

        let mut clash = record(tenant, "item", KIND_MODEL);
        clash.declaration = "blog.Item".to_string();
        clash.table_name = format!("tenant_{}__blog__item", tenant.simple());
        let err = repo.get_or_create(clash).await.unwrap_err();
        assert!(err.to_string().contains("already describes tests.item"), "{err}");
        assert_eq!(repo.list_for_tenant(tenant).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_and_delete_are_tenant_scoped() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        let repo = ModelMetadataRepository::new(&db);
        let acme = Uuid::new_v4();
        let globex = Uuid::new_v4();

        repo.get_or_create(record(acme, "category", KIND_MODEL)).await.unwrap();
        repo.get_or_create(record(acme, "widget", KIND_MODEL)).await.unwrap();
        repo.get_or_create(record(acme, "widget_tags", KIND_JUNCTION)).await.unwrap();
        repo.get_or_create(record(globex, "widget", KIND_MODEL)).await.unwrap();

        let models: Vec<String> = repo
            .list_for_tenant(acme)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.model)
            .collect();
        assert_eq!(models, vec!["widget_tags", "widget", "category"]);

        assert_eq!(repo.delete_for_tenant(acme).await.unwrap(), 3);
        assert!(repo.list_for_tenant(acme).await.unwrap().is_empty());
        assert_eq!(repo.list_for_tenant(globex).await.unwrap().len(), 1);
    }
}
