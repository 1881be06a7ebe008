//! Deterministic identifiers for per-tenant tables, indexes and constraints.
//!
//! Every name is a pure function of the declaration identity and the tenant
//! id, so a restarted process computes the same table names and finds the
//! tables (and their metadata records) it created earlier.
//!
//! Segments are joined with `__`. Declared labels and field names never
//! contain it nor start or end with `_` (see [`is_valid_segment`]), so two
//! different declarations or fields cannot produce the same name.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::schema::ModelKey;

const HASH_LEN: usize = 8;
const SEPARATOR: &str = "__";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Naming {
    prefix: String,
    max_length: usize,
}

impl Naming {
    pub fn new(prefix: impl Into<String>, max_length: usize) -> Self {
        Self {
            prefix: prefix.into(),
            max_length,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.table_prefix.clone(), config.max_identifier_length)
    }

    /// App label every concrete model of `tenant_id` is registered under.
    pub fn app_label(&self, tenant_id: Uuid) -> String {
        format!("{}_{}", self.prefix, tenant_id.simple())
    }

    pub fn table_name(&self, key: &ModelKey, tenant_id: Uuid) -> String {
        self.truncate(&format!(
            "{}{SEPARATOR}{}",
            self.app_label(tenant_id),
            model_slug(key)
        ))
    }

    /// Table backing an auto-generated many-to-many.
    pub fn junction_table(&self, owner_table: &str, field: &str) -> String {
        self.truncate(&format!("{owner_table}{SEPARATOR}{}", field.to_lowercase()))
    }

    pub fn index_name(&self, table: &str, columns: &[String]) -> String {
        self.truncate(&format!(
            "{table}{SEPARATOR}{}{SEPARATOR}uniq",
            columns.join(SEPARATOR)
        ))
    }

    pub fn foreign_key_name(&self, table: &str, column: &str) -> String {
        self.truncate(&format!("fk{SEPARATOR}{table}{SEPARATOR}{column}"))
    }

    /// Metadata `model` of a concrete model; unique within the tenant's app label.
    pub fn metadata_model(&self, key: &ModelKey) -> String {
        model_slug(key)
    }

    /// Metadata `model` of the junction behind `field` of `key`.
    pub fn metadata_junction(&self, key: &ModelKey, field: &str) -> String {
        format!("{}{SEPARATOR}{}", model_slug(key), field.to_lowercase())
    }

    fn truncate(&self, name: &str) -> String {
        truncate_identifier(name, self.max_length)
    }
}

fn model_slug(key: &ModelKey) -> String {
    format!("{}{SEPARATOR}{}", key.app_label().to_lowercase(), key.model())
}

/// Whether `segment` can be joined into names without ambiguity: non-empty,
/// no `__`, and no leading or trailing `_`.
pub fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && !segment.contains(SEPARATOR)
        && !segment.starts_with('_')
        && !segment.ends_with('_')
}

/// Shortens `name` to at most `max_length` bytes, replacing the tail with a
/// hash of the full name so distinct long names stay distinct.
pub fn truncate_identifier(name: &str, max_length: usize) -> String {
    if name.len() <= max_length {
        return name.to_string();
    }

    let digest = hex::encode(Sha256::digest(name.as_bytes()));
    let keep = max_length.saturating_sub(HASH_LEN + 1);
    let mut head = String::with_capacity(keep);
    for ch in name.chars() {
        if head.len() + ch.len_utf8() > keep {
            break;
        }
        head.push(ch);
    }

    format!("{head}_{}", &digest[..HASH_LEN])
}
