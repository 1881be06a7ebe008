//! Tests for on-demand synthesis of per-tenant tables and their metadata.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use tenancy::error::ConfigurationError;
use tenancy::models::model_metadata::{KIND_JUNCTION, KIND_MODEL};
use tenancy::repositories::ModelMetadataRepository;
use tenancy::schema::{Declaration, FieldDecl, ModelCatalog};
use tenancy::TenancyError;

#[path = "test_utils/mod.rs"]
mod test_utils;
use test_utils::{
    APP, create_tenant, fixture_catalog, key, setup_tenancy, setup_test_db, table_names, tenancy_on,
};

#[tokio::test]
async fn first_use_creates_tables_and_metadata() -> Result<()> {
    let tenancy = setup_tenancy().await?;
    let acme = create_tenant(&tenancy, "acme").await?;

    let related = acme.models("related_tenant_models").await?;
    let specific = acme.model_for(&key("SpecificModel")).await?;
    let through = acme.model_for(&key("M2MSpecific")).await?;

    let tables = table_names(tenancy.db()).await?;
    for table in [
        related.model().table_name(),
        specific.table_name(),
        through.table_name(),
    ] {
        assert!(tables.iter().any(|name| name == table), "missing table {table}");
    }

    let junction = related
        .model()
        .field("m2m")
        .and_then(|field| field.junction())
        .cloned()
        .expect("m2m has a junction");
    assert!(tables.iter().any(|name| name == junction.table()));
    assert!(junction.through_model().is_none());

    let metadata = ModelMetadataRepository::new(tenancy.db())
        .list_for_tenant(acme.id())
        .await?;
    let models: BTreeSet<_> = metadata
        .iter()
        .filter(|record| record.kind == KIND_MODEL)
        .map(|record| record.model.as_str())
        .collect();
    assert!(models.contains("tests__relatedtenantmodel"));
    assert!(models.contains("tests__specificmodel"));
    assert!(models.contains("tests__m2mspecific"));
    assert!(metadata
        .iter()
        .any(|record| record.kind == KIND_JUNCTION && record.table_name == junction.table()));
    assert!(metadata
        .iter()
        .all(|record| record.app_label == related.model().app_label()));

    // The metadata record is enough to find the model again.
    let found = tenancy
        .registry()
        .model_for_table(related.model().table_name())
        .expect("registered by table");
    assert!(Arc::ptr_eq(&found, related.model()));
    Ok(())
}

#[tokio::test]
async fn only_reachable_models_are_synthesized() -> Result<()> {
    let tenancy = setup_tenancy().await?;
    let acme = create_tenant(&tenancy, "acme").await?;

    acme.models("signal_models").await?;

    let cached = tenancy.registry().cached_for_tenant(acme.id());
    assert_eq!(cached.len(), 1);
    assert_eq!(cached[0].declaration(), &key("SignalTenantModel"));
    assert!(tenancy.registry().get(&key("SpecificModel"), acme.id()).is_none());
    Ok(())
}

#[tokio::test]
async fn restarted_process_reuses_existing_tables() -> Result<()> {
    let tenancy = setup_tenancy().await?;
    let acme = create_tenant(&tenancy, "acme").await?;
    let specifics = acme.models("specificmodels").await?;
    specifics.create([("name", json!("persisted"))]).await?;

    let metadata_before = ModelMetadataRepository::new(tenancy.db())
        .list_for_tenant(acme.id())
        .await?
        .len();

    let restarted = tenancy_on(tenancy.db().clone(), Arc::new(fixture_catalog()?))?;
    let handle = restarted.tenant(acme.id()).await?.expect("tenant survives restart");
    let reloaded = handle.models("specificmodels").await?;

    assert_eq!(reloaded.model().table_name(), specifics.model().table_name());
    assert!(!Arc::ptr_eq(reloaded.model(), specifics.model()));
    let records = reloaded.all().await?;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].get("name"), Some(&json!("persisted")));

    let metadata_after = ModelMetadataRepository::new(restarted.db())
        .list_for_tenant(acme.id())
        .await?
        .len();
    assert_eq!(metadata_before, metadata_after);
    Ok(())
}

#[tokio::test]
async fn concurrent_first_requests_share_one_model() -> Result<()> {
    let tenancy = setup_tenancy().await?;
    let acme = create_tenant(&tenancy, "acme").await?;

    let related_key = key("RelatedTenantModel");
    let specific_key = key("SpecificModel");
    let (first, second, third) = tokio::join!(
        acme.model_for(&related_key),
        acme.model_for(&related_key),
        acme.model_for(&specific_key),
    );
    let (first, second, third) = (first?, second?, third?);

    assert!(Arc::ptr_eq(&first, &second));
    let target = first
        .field("fk")
        .and_then(|field| field.target())
        .expect("fk is a relation");
    assert_eq!(target.table, third.table_name());
    assert!(Arc::ptr_eq(
        &third,
        &tenancy
            .registry()
            .get(&key("SpecificModel"), acme.id())
            .expect("cached")
    ));
    Ok(())
}

#[tokio::test]
async fn unknown_tenant_cannot_get_models() -> Result<()> {
    let tenancy = setup_tenancy().await?;
    let acme = create_tenant(&tenancy, "acme").await?;
    tenancy.delete_tenant(acme.id()).await?;

    let err = acme.models("specificmodels").await.unwrap_err();
    assert!(matches!(err, TenancyError::TenantNotFound { tenant_id } if tenant_id == acme.id()));
    assert!(tenancy.registry().cached_for_tenant(acme.id()).is_empty());
    Ok(())
}

#[tokio::test]
async fn unresolved_relations_fail_without_creating_tables() -> Result<()> {
    let db = setup_test_db().await?;
    let catalog = ModelCatalog::new();
    catalog.install(
        Declaration::new(APP, "Orphan").field(FieldDecl::foreign_key("missing", "DoesNotExist")),
    )?;
    let tenancy = tenancy_on(db, Arc::new(catalog))?;
    let acme = create_tenant(&tenancy, "acme").await?;

    let tables_before = table_names(tenancy.db()).await?;
    let err = acme.models("orphans").await.unwrap_err();
    assert!(matches!(
        err,
        TenancyError::Configuration(ConfigurationError::UnresolvedRelation { ref field, ref target, .. })
            if field == "missing" && target.contains("DoesNotExist")
    ));
    assert_eq!(table_names(tenancy.db()).await?, tables_before);
    assert!(tenancy.registry().cached_for_tenant(acme.id()).is_empty());
    Ok(())
}

#[tokio::test]
async fn descriptors_are_named_after_related_names() -> Result<()> {
    let tenancy = setup_tenancy().await?;

    let names: BTreeSet<String> = tenancy
        .descriptors()
        .iter()
        .map(|descriptor| descriptor.name().to_string())
        .collect();
    for expected in [
        "specificmodels",
        "specific_models_subclasses",
        "related_specific_models",
        "related_tenant_models",
        "m2m_specifics",
        "signal_models",
        "widgets",
        "categories",
    ] {
        assert!(names.contains(expected), "missing descriptor {expected}");
    }
    assert!(!names.iter().any(|name| name.contains("abstract")));

    let conflict = tenancy
        .catalog()
        .install(Declaration::new(APP, "Impostor").related_name("specificmodels"));
    assert!(matches!(conflict, Err(ConfigurationError::DescriptorConflict { .. })));

    let acme = create_tenant(&tenancy, "acme").await?;
    let err = acme.models("nothing_here").await.unwrap_err();
    assert!(matches!(
        err,
        TenancyError::Configuration(ConfigurationError::UnknownDescriptor { .. })
    ));
    Ok(())
}
