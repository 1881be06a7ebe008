//! # Data Models
//!
//! SeaORM entities for the tables every tenant shares.

pub mod model_metadata;
pub mod tenant;

pub use model_metadata::Entity as ModelMetadata;
pub use tenant::Entity as Tenant;
