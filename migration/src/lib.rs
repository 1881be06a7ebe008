//! Database migrations for the shared tenancy tables.
//!
//! Per-tenant tables are never migrated here; they are created on demand by
//! the synthesizer. This crate only owns the tables every tenant shares.

pub use sea_orm_migration::prelude::*;

mod m2024_01_01_000001_create_tenants;
mod m2024_01_01_000002_create_model_metadata;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2024_01_01_000001_create_tenants::Migration),
            Box::new(m2024_01_01_000002_create_model_metadata::Migration),
        ]
    }
}
