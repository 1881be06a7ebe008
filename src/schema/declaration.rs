//! Tenant-model declarations and shared (non-tenant) models.

use std::fmt;

use super::field::{ColumnType, FieldDecl};

/// Identity of a declaration: app label plus lowercase model name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelKey {
    app_label: String,
    model: String,
}

impl ModelKey {
    pub fn new(app_label: impl Into<String>, model: impl AsRef<str>) -> Self {
        Self {
            app_label: app_label.into(),
            model: model.as_ref().to_lowercase(),
        }
    }

    /// Parses a dotted `app_label.Model` reference.
    pub fn parse(dotted: &str) -> Option<Self> {
        let (app_label, model) = dotted.split_once('.')?;
        if app_label.is_empty() || model.is_empty() || model.contains('.') {
            return None;
        }
        Some(Self::new(app_label, model))
    }

    pub fn app_label(&self) -> &str {
        &self.app_label
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.app_label, self.model)
    }
}

/// Model options. A concrete model also takes those of its abstract
/// ancestors: their ordering unless it declares one, and all their unique groups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaOptions {
    /// Field names, `-` prefix for descending.
    pub ordering: Vec<String>,
    pub unique_together: Vec<Vec<String>>,
    pub verbose_name: Option<String>,
}

/// A tenant-aware model template. Never backed by a table of its own.
#[derive(Debug, Clone)]
pub struct Declaration {
    key: ModelKey,
    object_name: String,
    is_abstract: bool,
    fields: Vec<FieldDecl>,
    parents: Vec<String>,
    related_name: Option<String>,
    meta: MetaOptions,
}

impl Declaration {
    /// A tenant model: synthesized once per tenant.
    pub fn new(app_label: impl Into<String>, object_name: impl Into<String>) -> Self {
        let object_name = object_name.into();
        Self {
            key: ModelKey::new(app_label, &object_name),
            object_name,
            is_abstract: false,
            fields: Vec::new(),
            parents: Vec::new(),
            related_name: None,
            meta: MetaOptions::default(),
        }
    }

    /// A tenant-aware mixin: contributes fields to its children only.
    pub fn abstract_model(app_label: impl Into<String>, object_name: impl Into<String>) -> Self {
        Self {
            is_abstract: true,
            ..Self::new(app_label, object_name)
        }
    }

    pub fn field(mut self, field: FieldDecl) -> Self {
        self.fields.push(field);
        self
    }

    pub fn parent(mut self, reference: impl Into<String>) -> Self {
        self.parents.push(reference.into());
        self
    }

    /// Name of the accessor installed on the tenant.
    pub fn related_name(mut self, name: impl Into<String>) -> Self {
        self.related_name = Some(name.into());
        self
    }

    pub fn ordering<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.meta.ordering = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn unique_together<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.meta
            .unique_together
            .push(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn verbose_name(mut self, name: impl Into<String>) -> Self {
        self.meta.verbose_name = Some(name.into());
        self
    }

    pub fn key(&self) -> &ModelKey {
        &self.key
    }

    pub fn object_name(&self) -> &str {
        &self.object_name
    }

    /// `app_label.ObjectName`, as shown in error messages.
    pub fn label(&self) -> String {
        format!("{}.{}", self.key.app_label(), self.object_name)
    }

    pub fn is_abstract(&self) -> bool {
        self.is_abstract
    }

    pub fn fields(&self) -> &[FieldDecl] {
        &self.fields
    }

    pub fn parents(&self) -> &[String] {
        &self.parents
    }

    pub fn meta(&self) -> &MetaOptions {
        &self.meta
    }

    /// The tenant accessor name: the custom related name, or the plural of the model name.
    pub fn descriptor_name(&self) -> String {
        self.related_name
            .clone()
            .unwrap_or_else(|| format!("{}s", self.key.model()))
    }
}

/// A model every tenant shares: a concrete table or an abstract mixin.
#[derive(Debug, Clone)]
pub struct SharedModel {
    key: ModelKey,
    object_name: String,
    table: Option<String>,
    primary_key: ColumnType,
    fields: Vec<FieldDecl>,
    tenant_base: bool,
}

impl SharedModel {
    pub fn table(
        app_label: impl Into<String>,
        object_name: impl Into<String>,
        table: impl Into<String>,
        primary_key: ColumnType,
    ) -> Self {
        let object_name = object_name.into();
        Self {
            key: ModelKey::new(app_label, &object_name),
            object_name,
            table: Some(table.into()),
            primary_key,
            fields: Vec::new(),
            tenant_base: false,
        }
    }

    pub fn mixin(app_label: impl Into<String>, object_name: impl Into<String>) -> Self {
        let object_name = object_name.into();
        Self {
            key: ModelKey::new(app_label, &object_name),
            object_name,
            table: None,
            primary_key: ColumnType::BigInteger,
            fields: Vec::new(),
            tenant_base: false,
        }
    }

    pub fn field(mut self, field: FieldDecl) -> Self {
        self.fields.push(field);
        self
    }

    /// Marks this model as descending from the abstract tenant.
    pub fn tenant_base(mut self) -> Self {
        self.tenant_base = true;
        self
    }

    pub fn key(&self) -> &ModelKey {
        &self.key
    }

    pub fn object_name(&self) -> &str {
        &self.object_name
    }

    pub fn label(&self) -> String {
        format!("{}.{}", self.key.app_label(), self.object_name)
    }

    pub fn table_name(&self) -> Option<&str> {
        self.table.as_deref()
    }

    pub fn primary_key(&self) -> ColumnType {
        self.primary_key
    }

    pub fn fields(&self) -> &[FieldDecl] {
        &self.fields
    }

    pub fn is_tenant_base(&self) -> bool {
        self.tenant_base
    }

    pub fn is_abstract(&self) -> bool {
        self.table.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_key_parses_dotted_references() {
        let key = ModelKey::parse("tests.SpecificModel").unwrap();
        assert_eq!(key.app_label(), "tests");
        assert_eq!(key.model(), "specificmodel");
        assert_eq!(key.to_string(), "tests.specificmodel");

        assert!(ModelKey::parse("tenant").is_none());
        assert!(ModelKey::parse("a.b.c").is_none());
        assert!(ModelKey::parse(".Model").is_none());
    }

    #[test]
    fn descriptor_name_defaults_to_plural() {
        let plain = Declaration::new("tests", "SpecificModel");
        assert_eq!(plain.descriptor_name(), "specificmodels");

        let custom = Declaration::new("tests", "RelatedSpecificModel")
            .related_name("related_specific_models");
        assert_eq!(custom.descriptor_name(), "related_specific_models");
        assert_eq!(custom.label(), "tests.RelatedSpecificModel");
    }
}
