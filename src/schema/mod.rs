//! Model declarations and the catalog they are installed into.

mod catalog;
mod declaration;
mod field;

pub use catalog::{CatalogState, ModelCatalog, Resolved};
pub use declaration::{Declaration, MetaOptions, ModelKey, SharedModel};
pub use field::{ColumnType, FieldDecl, FieldKind, OnDelete, Validator};
