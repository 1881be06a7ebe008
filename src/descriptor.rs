//! Per-tenant model accessors.
//!
//! Installing a tenant-aware declaration registers a descriptor under its
//! accessor name (the declaration's related name, or its lowercase model name
//! with an `s` appended). Reading a descriptor through a tenant yields a
//! manager for that tenant's concrete model, synthesizing it on first use.

use std::sync::Arc;

use uuid::Uuid;

use crate::concrete::ConcreteModel;
use crate::error::TenancyError;
use crate::manager::TenantManager;
use crate::models::tenant;
use crate::registry::ModelRegistry;
use crate::schema::ModelKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantDescriptor {
    name: String,
    declaration: ModelKey,
}

impl TenantDescriptor {
    pub fn new(name: impl Into<String>, declaration: ModelKey) -> Self {
        Self {
            name: name.into(),
            declaration,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn declaration(&self) -> &ModelKey {
        &self.declaration
    }

    /// Manager for `tenant_id`'s concrete model of this descriptor's declaration.
    pub async fn manager(
        &self,
        registry: &Arc<ModelRegistry>,
        tenant_id: Uuid,
    ) -> Result<TenantManager, TenancyError> {
        let model = registry.get_or_create(&self.declaration, tenant_id).await?;
        Ok(TenantManager::new(model, registry.clone()))
    }
}

/// A tenant row together with access to its models.
#[derive(Clone)]
pub struct TenantHandle {
    tenant: tenant::Model,
    registry: Arc<ModelRegistry>,
}

impl std::fmt::Debug for TenantHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantHandle")
            .field("tenant", &self.tenant)
            .finish_non_exhaustive()
    }
}

impl TenantHandle {
    pub fn new(tenant: tenant::Model, registry: Arc<ModelRegistry>) -> Self {
        Self { tenant, registry }
    }

    pub fn tenant(&self) -> &tenant::Model {
        &self.tenant
    }

    pub fn id(&self) -> Uuid {
        self.tenant.id
    }

    /// Manager behind the accessor `name`, e.g. `"specificmodels"`.
    pub async fn models(&self, name: &str) -> Result<TenantManager, TenancyError> {
        let descriptor = self.registry.catalog().descriptor(name)?;
        descriptor.manager(&self.registry, self.tenant.id).await
    }

    /// Manager for a declaration, bypassing the accessor name.
    pub async fn manager(&self, declaration: &ModelKey) -> Result<TenantManager, TenancyError> {
        let model = self.model_for(declaration).await?;
        Ok(TenantManager::new(model, self.registry.clone()))
    }

    /// This tenant's concrete model of `declaration`.
    pub async fn model_for(&self, declaration: &ModelKey) -> Result<Arc<ConcreteModel>, TenancyError> {
        self.registry.get_or_create(declaration, self.tenant.id).await
    }
}
