//! # Tenancy
//!
//! Per-tenant model synthesis: tenant-aware declarations are turned into one
//! concrete table per tenant on first use, with relations rewritten to stay
//! inside the tenant, lifecycle events routed per tenant, and every table
//! dropped again when its tenant is deleted.

pub mod cli;
pub mod concrete;
pub mod config;
pub mod db;
pub mod descriptor;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod manager;
pub mod models;
pub mod naming;
pub mod registry;
pub mod repositories;
pub mod rewriter;
pub mod schema;
pub mod synthesizer;
pub mod telemetry;
pub mod tenancy;
pub use migration;

pub use descriptor::{TenantDescriptor, TenantHandle};
pub use error::{ConfigurationError, SynthesisError, TenancyError, ValidationError};
pub use manager::{Filter, Record, TenantManager};
pub use tenancy::Tenancy;
