//! # Tenant Repository
//!
//! CRUD operations for tenant rows. Removing per-tenant tables is not done
//! here; see [`crate::lifecycle`].

use crate::error::{TenancyError, ValidationError, is_unique_violation};
use crate::models::tenant::{
    ActiveModel as TenantActiveModel, Column as TenantColumn, Entity as Tenant,
    Model as TenantModel,
};
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set,
};
use uuid::Uuid;

/// Longest accepted tenant name.
pub const MAX_NAME_LENGTH: usize = 255;

/// Request data for creating a new tenant
#[derive(Debug, Clone, Default)]
pub struct CreateTenantRequest {
    /// Display name for the tenant
    pub name: String,
}

/// Repository for Tenant database operations
pub struct TenantRepository<'a, C: ConnectionTrait> {
    db: &'a C,
}

impl<'a, C: ConnectionTrait> TenantRepository<'a, C> {
    /// Create a new TenantRepository with the given connection or transaction
    pub fn new(db: &'a C) -> Self {
        Self { db }
    }

    /// Create a new tenant
    pub async fn create_tenant(
        &self,
        request: CreateTenantRequest,
    ) -> Result<TenantModel, TenancyError> {
        validate_tenant_name(&request.name)?;

        let tenant = TenantActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(request.name),
            created_at: Set(Utc::now().into()),
        };

        tenant.insert(self.db).await.map_err(|err| {
            if is_unique_violation(&err) {
                ValidationError::new("name", "Tenant with this Name already exists.").into()
            } else {
                TenancyError::Database(err)
            }
        })
    }

    /// Get tenant by ID
    pub async fn get_tenant_by_id(
        &self,
        tenant_id: Uuid,
    ) -> Result<Option<TenantModel>, TenancyError> {
        Ok(Tenant::find_by_id(tenant_id).one(self.db).await?)
    }

    /// Get tenant by its unique name
    pub async fn get_tenant_by_name(&self, name: &str) -> Result<Option<TenantModel>, TenancyError> {
        Ok(Tenant::find()
            .filter(TenantColumn::Name.eq(name))
            .one(self.db)
            .await?)
    }

    /// List all tenants ordered by name
    pub async fn list_tenants(&self) -> Result<Vec<TenantModel>, TenancyError> {
        Ok(Tenant::find()
            .order_by_asc(TenantColumn::Name)
            .all(self.db)
            .await?)
    }

    /// Delete a tenant row, returning whether it existed
    pub async fn delete_tenant(&self, tenant_id: Uuid) -> Result<bool, TenancyError> {
        let result = Tenant::delete_by_id(tenant_id).exec(self.db).await?;
        Ok(result.rows_affected > 0)
    }

    /// Check if a tenant exists
    pub async fn tenant_exists(&self, tenant_id: Uuid) -> Result<bool, TenancyError> {
        Ok(self.get_tenant_by_id(tenant_id).await?.is_some())
    }

    /// Get tenant count
    pub async fn get_tenant_count(&self) -> Result<u64, TenancyError> {
        Ok(Tenant::find().count(self.db).await?)
    }
}

/// Validate a tenant name the way full-clean validates the `name` field.
pub fn validate_tenant_name(name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::blank("name"));
    }

    let length = name.chars().count();
    if length > MAX_NAME_LENGTH {
        return Err(ValidationError::new(
            "name",
            format!("Ensure this value has at most {MAX_NAME_LENGTH} characters (it has {length})."),
        ));
    }

    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || c.is_whitespace() || c == '-' || c == '_')
    {
        return Err(ValidationError::new(
            "name",
            "Tenant name can only contain letters, numbers, spaces, hyphens, and underscores.",
        ));
    }

    Ok(())
}
