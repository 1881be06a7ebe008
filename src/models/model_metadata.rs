//! Reflection metadata entity model
//!
//! One row per synthesized table. Generic tooling can look a per-tenant model
//! up by `(app_label, model)` without knowing about tenants at all.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;

/// Metadata kind for a tenant model's own table.
pub const KIND_MODEL: &str = "model";
/// Metadata kind for an auto-generated many-to-many junction table.
pub const KIND_JUNCTION: &str = "junction";

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "model_metadata")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    /// Scoped app label, `{prefix}_{tenant}` for per-tenant models
    pub app_label: String,

    /// Lowercase generated model name
    pub model: String,

    /// Dotted identity of the originating declaration
    pub declaration: String,

    /// Owning tenant, `None` for shared models
    pub tenant_id: Option<Uuid>,

    pub table_name: String,

    /// [`KIND_MODEL`] or [`KIND_JUNCTION`]
    pub kind: String,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
