//! Entry point tying the catalog, registry and tenant lifecycle together.

use std::sync::Arc;

use metrics::counter;
use sea_orm::{DatabaseConnection, TransactionTrait};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::descriptor::{TenantDescriptor, TenantHandle};
use crate::error::{ConfigurationError, TenancyError};
use crate::events::EventBus;
use crate::lifecycle::{ModelTeardown, TenantLifecycleHook};
use crate::models::tenant;
use crate::naming::Naming;
use crate::registry::ModelRegistry;
use crate::repositories::{CreateTenantRequest, TenantRepository};
use crate::schema::{ModelCatalog, SharedModel};
use crate::synthesizer::Synthesizer;

pub struct Tenancy {
    db: DatabaseConnection,
    registry: Arc<ModelRegistry>,
    hooks: Vec<Arc<dyn TenantLifecycleHook>>,
    tenant_model: SharedModel,
}

impl std::fmt::Debug for Tenancy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tenancy")
            .field("tenant_model", &self.tenant_model.label())
            .field("hooks", &self.hooks.iter().map(|hook| hook.name()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Tenancy {
    /// Validates the tenant-model setting against `catalog` and installs the
    /// teardown hook.
    pub fn new(
        db: DatabaseConnection,
        catalog: Arc<ModelCatalog>,
        config: &AppConfig,
    ) -> Result<Self, ConfigurationError> {
        let tenant_model = catalog.tenant_model(&config.tenant_model)?;
        let synthesizer = Synthesizer::new(catalog, Arc::new(EventBus::new()), Naming::from_config(config));
        let registry = Arc::new(ModelRegistry::new(db.clone(), synthesizer));

        Ok(Self {
            db,
            registry,
            hooks: vec![Arc::new(ModelTeardown)],
            tenant_model,
        })
    }

    /// Adds a hook. On deletion hooks run in reverse order, so later hooks
    /// still see the tenant's tables.
    pub fn with_hook(mut self, hook: impl TenantLifecycleHook + 'static) -> Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        self.registry.catalog()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        self.registry.events()
    }

    pub fn tenant_model(&self) -> &SharedModel {
        &self.tenant_model
    }

    pub fn descriptors(&self) -> Vec<TenantDescriptor> {
        self.catalog().descriptors()
    }

    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create_tenant(&self, request: CreateTenantRequest) -> Result<TenantHandle, TenancyError> {
        let txn = self.db.begin().await?;
        let tenant = TenantRepository::new(&txn).create_tenant(request).await?;
        for hook in &self.hooks {
            hook.tenant_created(&txn, &tenant).await?;
        }
        txn.commit().await?;

        counter!("tenancy_tenants_created_total").increment(1);
        info!(tenant_id = %tenant.id, "created tenant");
        Ok(self.handle(tenant))
    }

    /// Deletes the tenant row and, through the hooks, every table synthesized for it.
    #[instrument(skip(self))]
    pub async fn delete_tenant(&self, tenant_id: Uuid) -> Result<(), TenancyError> {
        let _teardown = self.registry.lock_tenant(tenant_id).await;

        let txn = self.db.begin().await?;
        let tenants = TenantRepository::new(&txn);
        let tenant = tenants
            .get_tenant_by_id(tenant_id)
            .await?
            .ok_or(TenancyError::TenantNotFound { tenant_id })?;

        for hook in self.hooks.iter().rev() {
            hook.tenant_deleted(&txn, &tenant).await?;
        }
        tenants.delete_tenant(tenant_id).await?;
        txn.commit().await?;

        let evicted = self.registry.evict_tenant(tenant_id);
        counter!("tenancy_tenants_deleted_total").increment(1);
        info!(%tenant_id, evicted, "deleted tenant");
        Ok(())
    }

    pub async fn tenant(&self, tenant_id: Uuid) -> Result<Option<TenantHandle>, TenancyError> {
        let tenant = TenantRepository::new(&self.db).get_tenant_by_id(tenant_id).await?;
        Ok(tenant.map(|tenant| self.handle(tenant)))
    }

    pub async fn tenant_by_name(&self, name: &str) -> Result<Option<TenantHandle>, TenancyError> {
        let tenant = TenantRepository::new(&self.db).get_tenant_by_name(name).await?;
        Ok(tenant.map(|tenant| self.handle(tenant)))
    }

    pub async fn tenants(&self) -> Result<Vec<TenantHandle>, TenancyError> {
        let tenants = TenantRepository::new(&self.db).list_tenants().await?;
        Ok(tenants.into_iter().map(|tenant| self.handle(tenant)).collect())
    }

    pub fn handle(&self, tenant: tenant::Model) -> TenantHandle {
        TenantHandle::new(tenant, self.registry.clone())
    }
}
