//! Tests for tenant creation, deletion and the hooks run around them.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use sea_orm::DatabaseTransaction;
use serde_json::json;
use tenancy::config::AppConfig;
use tenancy::error::ConfigurationError;
use tenancy::lifecycle::TenantLifecycleHook;
use tenancy::models::tenant;
use tenancy::repositories::{CreateTenantRequest, ModelMetadataRepository};
use tenancy::schema::{Declaration, FieldDecl};
use tenancy::{Tenancy, TenancyError, ValidationError};

#[path = "test_utils/mod.rs"]
mod test_utils;
use test_utils::{create_tenant, fixture_catalog, key, setup_tenancy, setup_test_db, table_names, tenancy_on};

#[tokio::test]
async fn deleting_a_tenant_drops_its_tables_only() -> Result<()> {
    let tenancy = setup_tenancy().await?;
    let acme = create_tenant(&tenancy, "acme").await?;
    let globex = create_tenant(&tenancy, "globex").await?;

    let acme_related = acme.models("related_tenant_models").await?;
    let globex_related = globex.models("related_tenant_models").await?;
    let specific = acme.models("specificmodels").await?.create([("name", json!("doomed"))]).await?;
    let source = acme_related.create([("fk", json!(specific.id()))]).await?;
    acme_related.add_related(&source, "m2m", &[&specific]).await?;
    globex_related.create([("fk", json!(null))]).await?;

    let acme_tables: Vec<String> = ModelMetadataRepository::new(tenancy.db())
        .list_for_tenant(acme.id())
        .await?
        .into_iter()
        .map(|record| record.table_name)
        .collect();
    assert!(!acme_tables.is_empty());
    let acme_sender = acme_related.model().schema_id();
    assert!(tenancy.events().is_bound(&acme_sender));

    tenancy.delete_tenant(acme.id()).await?;

    let remaining = table_names(tenancy.db()).await?;
    for table in &acme_tables {
        assert!(!remaining.contains(table), "table {table} survived teardown");
    }
    assert!(remaining.iter().any(|name| name == globex_related.model().table_name()));
    assert!(ModelMetadataRepository::new(tenancy.db())
        .list_for_tenant(acme.id())
        .await?
        .is_empty());
    assert!(tenancy.registry().cached_for_tenant(acme.id()).is_empty());
    assert!(!tenancy.events().is_bound(&acme_sender));
    assert!(tenancy.tenant(acme.id()).await?.is_none());

    assert_eq!(globex_related.count().await?, 1);
    Ok(())
}

#[tokio::test]
async fn teardown_finds_tables_of_an_earlier_process() -> Result<()> {
    let db = setup_test_db().await?;
    let first = tenancy_on(db.clone(), Arc::new(fixture_catalog()?))?;
    let acme = create_tenant(&first, "acme").await?;
    let table = acme.model_for(&key("SpecificModelSubclass")).await?.table_name().to_string();

    let second = tenancy_on(db, Arc::new(fixture_catalog()?))?;
    assert!(second.registry().cached_for_tenant(acme.id()).is_empty());
    second.delete_tenant(acme.id()).await?;

    let remaining = table_names(second.db()).await?;
    assert!(!remaining.contains(&table));
    Ok(())
}

#[tokio::test]
async fn same_named_models_of_different_apps_are_both_dropped() -> Result<()> {
    let catalog = fixture_catalog()?;
    catalog.install(
        Declaration::new("shop", "Item")
            .related_name("shop_items")
            .field(FieldDecl::text("name"))
            .field(FieldDecl::many_to_many("links", "blog.Item")),
    )?;
    catalog.install(
        Declaration::new("blog", "Item")
            .related_name("blog_items")
            .field(FieldDecl::text("title"))
            .field(FieldDecl::many_to_many("links", "shop.Item")),
    )?;
    let tenancy = tenancy_on(setup_test_db().await?, Arc::new(catalog))?;
    let acme = create_tenant(&tenancy, "acme").await?;

    let shop_items = acme.models("shop_items").await?;
    let blog_items = acme.models("blog_items").await?;
    assert_ne!(shop_items.model().table_name(), blog_items.model().table_name());

    let metadata = ModelMetadataRepository::new(tenancy.db())
        .list_for_tenant(acme.id())
        .await?;
    let synthesized: BTreeSet<String> = metadata.iter().map(|record| record.table_name.clone()).collect();
    assert_eq!(synthesized.len(), metadata.len(), "one record per table");
    assert_eq!(metadata.len(), 4, "two models and two junctions");
    for table in [shop_items.model().table_name(), blog_items.model().table_name()] {
        assert!(synthesized.contains(table), "no metadata for {table}");
    }

    tenancy.delete_tenant(acme.id()).await?;

    let remaining = table_names(tenancy.db()).await?;
    let left_behind: Vec<_> = synthesized.iter().filter(|table| remaining.contains(*table)).collect();
    assert!(left_behind.is_empty(), "tables left behind: {left_behind:?}");
    Ok(())
}

#[tokio::test]
async fn deleting_an_unknown_tenant_fails() -> Result<()> {
    let tenancy = setup_tenancy().await?;
    let acme = create_tenant(&tenancy, "acme").await?;
    tenancy.delete_tenant(acme.id()).await?;

    let err = tenancy.delete_tenant(acme.id()).await.unwrap_err();
    assert!(matches!(err, TenancyError::TenantNotFound { tenant_id } if tenant_id == acme.id()));
    Ok(())
}

#[tokio::test]
async fn tenant_names_are_validated_and_unique() -> Result<()> {
    let tenancy = setup_tenancy().await?;
    create_tenant(&tenancy, "acme").await?;

    let err = create_tenant(&tenancy, "acme").await.unwrap_err();
    let err = err.downcast::<TenancyError>()?;
    assert_eq!(
        err.as_validation(),
        Some(&ValidationError::new("name", "Tenant with this Name already exists."))
    );

    let err = create_tenant(&tenancy, "").await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "Invalid value for field \"name\": This field cannot be blank."
    );
    assert_eq!(tenancy.tenants().await?.len(), 1);
    Ok(())
}

#[derive(Default)]
struct AuditHook {
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl TenantLifecycleHook for AuditHook {
    fn name(&self) -> &'static str {
        "audit"
    }

    async fn tenant_created(&self, _txn: &DatabaseTransaction, tenant: &tenant::Model) -> Result<(), TenancyError> {
        self.log.lock().unwrap().push(format!("created {}", tenant.name));
        Ok(())
    }

    async fn tenant_deleted(&self, txn: &DatabaseTransaction, tenant: &tenant::Model) -> Result<(), TenancyError> {
        // Runs before the teardown hook, so the metadata is still there.
        let tables = ModelMetadataRepository::new(txn).list_for_tenant(tenant.id).await?;
        self.log
            .lock()
            .unwrap()
            .push(format!("deleted {} with {} tables", tenant.name, tables.len()));
        Ok(())
    }
}

struct RejectingHook;

#[async_trait]
impl TenantLifecycleHook for RejectingHook {
    fn name(&self) -> &'static str {
        "rejecting"
    }

    async fn tenant_created(&self, _txn: &DatabaseTransaction, _tenant: &tenant::Model) -> Result<(), TenancyError> {
        Err(ValidationError::new("name", "Rejected by hook.").into())
    }
}

#[tokio::test]
async fn custom_hooks_run_inside_the_lifecycle_transaction() -> Result<()> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let db = setup_test_db().await?;
    let tenancy = tenancy_on(db, Arc::new(fixture_catalog()?))?.with_hook(AuditHook { log: log.clone() });

    let acme = create_tenant(&tenancy, "acme").await?;
    acme.models("signal_models").await?;
    tenancy.delete_tenant(acme.id()).await?;

    assert_eq!(
        *log.lock().unwrap(),
        vec!["created acme".to_string(), "deleted acme with 1 tables".to_string()]
    );
    Ok(())
}

#[tokio::test]
async fn failing_hook_aborts_tenant_creation() -> Result<()> {
    let db = setup_test_db().await?;
    let tenancy = tenancy_on(db, Arc::new(fixture_catalog()?))?.with_hook(RejectingHook);

    let err = tenancy
        .create_tenant(CreateTenantRequest {
            name: "acme".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Invalid value for field \"name\": Rejected by hook.");
    assert!(tenancy.tenants().await?.is_empty());
    Ok(())
}

fn tenancy_with_tenant_model(db: sea_orm::DatabaseConnection, setting: &str) -> Result<Tenancy> {
    let config = AppConfig {
        tenant_model: setting.to_string(),
        ..AppConfig::default()
    };
    Ok(Tenancy::new(db, Arc::new(fixture_catalog()?), &config)?)
}

#[tokio::test]
async fn tenant_model_setting_is_checked() -> Result<()> {
    let db = setup_test_db().await?;

    let err = tenancy_with_tenant_model(db.clone(), "tenancy").unwrap_err();
    assert_eq!(
        err.to_string(),
        "TENANCY_TENANT_MODEL must be of the form 'app_label.model_name'"
    );

    let err = tenancy_with_tenant_model(db.clone(), "billing.Account").unwrap_err();
    assert_eq!(
        err.to_string(),
        "TENANCY_TENANT_MODEL refers to model 'billing.Account' that has not been installed"
    );

    let err = tenancy_with_tenant_model(db.clone(), "tests.NonTenantModel").unwrap_err();
    assert_eq!(
        err.to_string(),
        "TENANCY_TENANT_MODEL refers to models 'tests.NonTenantModel' which is not a subclass of 'tenancy.AbstractTenant'"
    );

    let err = tenancy_with_tenant_model(db.clone(), "contenttypes.ContentType").unwrap_err();
    assert_eq!(
        err.to_string(),
        "TENANCY_TENANT_MODEL refers to models 'contenttypes.ContentType' which is not a subclass of 'tenancy.AbstractTenant'"
    );

    let err = tenancy_with_tenant_model(db.clone(), "tests.SpecificModel").unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ConfigurationError>(),
        Some(ConfigurationError::NotATenantModel { .. })
    ));

    let tenancy = tenancy_with_tenant_model(db, "tenancy.Tenant")?;
    assert_eq!(tenancy.tenant_model().label(), "tenancy.Tenant");
    Ok(())
}
