//! Hooks run inside the transaction that creates or deletes a tenant.

use async_trait::async_trait;
use metrics::counter;
use sea_orm::sea_query::{Alias, Table};
use sea_orm::{ConnectionTrait, DatabaseBackend, DatabaseTransaction};
use tracing::{debug, info};

use crate::error::TenancyError;
use crate::models::tenant;
use crate::repositories::ModelMetadataRepository;

/// Extension point for work tied to a tenant's lifetime.
///
/// An error aborts the surrounding transaction, so the tenant is neither
/// created nor deleted.
#[async_trait]
pub trait TenantLifecycleHook: Send + Sync {
    fn name(&self) -> &'static str;

    async fn tenant_created(&self, _txn: &DatabaseTransaction, _tenant: &tenant::Model) -> Result<(), TenancyError> {
        Ok(())
    }

    async fn tenant_deleted(&self, _txn: &DatabaseTransaction, _tenant: &tenant::Model) -> Result<(), TenancyError> {
        Ok(())
    }
}

/// Drops every table synthesized for a deleted tenant and removes the
/// matching metadata records.
///
/// Tables are found through their metadata, not the in-memory registry, so
/// tables created by an earlier process are dropped too.
#[derive(Debug, Default, Clone, Copy)]
pub struct ModelTeardown;

#[async_trait]
impl TenantLifecycleHook for ModelTeardown {
    fn name(&self) -> &'static str {
        "model_teardown"
    }

    async fn tenant_deleted(&self, txn: &DatabaseTransaction, tenant: &tenant::Model) -> Result<(), TenancyError> {
        let backend = txn.get_database_backend();
        if backend == DatabaseBackend::Sqlite {
            // Tables reference each other; check only once all of them are gone.
            txn.execute_unprepared("PRAGMA defer_foreign_keys = ON").await?;
        }

        let metadata = ModelMetadataRepository::new(txn);
        let records = metadata.list_for_tenant(tenant.id).await?;
        for record in &records {
            let mut drop = Table::drop();
            drop.table(Alias::new(record.table_name.as_str())).if_exists();
            if backend == DatabaseBackend::Postgres {
                drop.cascade();
            }
            txn.execute(backend.build(&drop)).await?;
            debug!(table = %record.table_name, kind = %record.kind, "dropped tenant table");
        }

        let removed = metadata.delete_for_tenant(tenant.id).await?;
        counter!("tenancy_tables_dropped_total").increment(records.len() as u64);
        info!(tenant_id = %tenant.id, tables = records.len(), metadata = removed, "tore down tenant models");
        Ok(())
    }
}
