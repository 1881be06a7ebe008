//! Test utilities for database testing.
//!
//! Sets up in-memory SQLite databases with migrations applied, plus a
//! catalog of tenant-aware fixture models and helpers to build a
//! [`Tenancy`] over them.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use anyhow::Result;
use migration::{Migrator, MigratorTrait};
use sea_orm::sea_query::{Alias, ColumnDef, Table};
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, Statement};
use tenancy::config::AppConfig;
use tenancy::events::{LifecycleEvent, Sender};
use tenancy::repositories::CreateTenantRequest;
use tenancy::schema::{ColumnType, Declaration, FieldDecl, ModelCatalog, ModelKey, SharedModel, Validator};
use tenancy::{Tenancy, TenantHandle};

pub const APP: &str = "tests";

/// Sets up an in-memory SQLite database with all migrations applied.
///
/// Foreign keys stay enforced, so relation tests exercise the generated
/// constraints.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;
    Migrator::up(&db, None).await?;

    // Shared table targeted by the fixture foreign keys.
    let backend = db.get_database_backend();
    let create = Table::create()
        .table(Alias::new("tests_nontenantmodel"))
        .if_not_exists()
        .col(
            ColumnDef::new(Alias::new("id"))
                .big_integer()
                .not_null()
                .auto_increment()
                .primary_key(),
        )
        .col(ColumnDef::new(Alias::new("label")).text().not_null())
        .to_owned();
    db.execute(backend.build(&create)).await?;

    Ok(db)
}

/// The fixture models, installed in an arbitrary order.
pub fn fixture_catalog() -> Result<ModelCatalog> {
    let catalog = ModelCatalog::new();

    catalog.install_shared(SharedModel::table(
        APP,
        "NonTenantModel",
        "tests_nontenantmodel",
        ColumnType::BigInteger,
    ))?;

    // Installed before its targets on purpose.
    catalog.install(
        Declaration::new(APP, "RelatedTenantModel")
            .related_name("related_tenant_models")
            .field(FieldDecl::foreign_key("fk", "SpecificModel").nullable())
            .field(FieldDecl::many_to_many("m2m", "SpecificModel"))
            .field(FieldDecl::many_to_many("m2m_through", "SpecificModel").through("M2MSpecific")),
    )?;

    catalog.install(
        Declaration::abstract_model(APP, "AbstractTenantModel")
            .field(FieldDecl::date("date").nullable()),
    )?;

    catalog.install(
        Declaration::new(APP, "SpecificModel")
            .parent("AbstractTenantModel")
            .field(FieldDecl::foreign_key("non_tenant", "NonTenantModel").nullable())
            .field(
                FieldDecl::text("name")
                    .allow_blank()
                    .validator(Validator::MaxLength(20)),
            ),
    )?;

    catalog.install(
        Declaration::new(APP, "SpecificModelSubclass")
            .parent("SpecificModel")
            .related_name("specific_models_subclasses")
            .field(FieldDecl::integer("rank").default_value(serde_json::json!(0))),
    )?;

    catalog.install(
        Declaration::new(APP, "RelatedSpecificModel")
            .parent("AbstractTenantModel")
            .related_name("related_specific_models"),
    )?;

    catalog.install(
        Declaration::new(APP, "M2MSpecific")
            .related_name("m2m_specifics")
            .field(FieldDecl::foreign_key("related", "RelatedTenantModel"))
            .field(FieldDecl::foreign_key("specific", "SpecificModel")),
    )?;

    catalog.install(
        Declaration::new(APP, "SignalTenantModel")
            .parent("AbstractTenantModel")
            .related_name("signal_models"),
    )?;

    catalog.install(
        Declaration::new(APP, "Widget")
            .field(FieldDecl::text("label"))
            .field(FieldDecl::foreign_key("category", "Category").nullable())
            .ordering(["label"]),
    )?;

    catalog.install(
        Declaration::new(APP, "Category")
            .related_name("categories")
            .field(FieldDecl::text("name"))
            .field(FieldDecl::foreign_key("featured", "Widget").nullable())
            .unique_together(["name"]),
    )?;

    Ok(catalog)
}

pub fn key(model: &str) -> ModelKey {
    ModelKey::new(APP, model)
}

/// A [`Tenancy`] over the fixture catalog on a fresh database.
pub async fn setup_tenancy() -> Result<Tenancy> {
    let db = setup_test_db().await?;
    tenancy_on(db, Arc::new(fixture_catalog()?))
}

pub fn tenancy_on(db: DatabaseConnection, catalog: Arc<ModelCatalog>) -> Result<Tenancy> {
    Ok(Tenancy::new(db, catalog, &AppConfig::default())?)
}

pub async fn create_tenant(tenancy: &Tenancy, name: &str) -> Result<TenantHandle> {
    Ok(tenancy
        .create_tenant(CreateTenantRequest {
            name: name.to_string(),
        })
        .await?)
}

/// Names of the tables present in the database.
pub async fn table_names(db: &DatabaseConnection) -> Result<Vec<String>> {
    let rows = db
        .query_all(Statement::from_string(
            db.get_database_backend(),
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name".to_string(),
        ))
        .await?;
    let mut names = Vec::with_capacity(rows.len());
    for row in rows {
        names.push(row.try_get::<String>("", "name")?);
    }
    Ok(names)
}

/// Records every lifecycle event whose sender descends from `declaration`.
pub fn record_events(tenancy: &Tenancy, declaration: &ModelKey) -> Arc<Mutex<Vec<LifecycleEvent>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    for kind in LifecycleEvent::ALL {
        let log = log.clone();
        tenancy
            .events()
            .connect(kind, Sender::Declaration(declaration.clone()), move |event| {
                log.lock().unwrap().push(event.kind);
            });
    }
    log
}
