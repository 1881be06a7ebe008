//! # Repository Layer
//!
//! Repositories wrap SeaORM access to the shared tables. They borrow any
//! [`sea_orm::ConnectionTrait`] so the same code runs on a pooled connection
//! or inside the transaction of a tenant lifecycle operation.

pub mod model_metadata;
pub mod tenant;

pub use model_metadata::{ModelMetadataRepository, NewModelMetadata};
pub use tenant::{CreateTenantRequest, TenantRepository};
