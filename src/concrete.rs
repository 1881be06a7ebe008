//! Concrete per-tenant models: value-type schema descriptors.
//!
//! A [`ConcreteModel`] is the result of synthesizing one declaration for one
//! tenant. It is immutable and shared behind an `Arc`; the registry hands out
//! the same `Arc` for the same (declaration, tenant) pair, so identity can be
//! compared with [`Arc::ptr_eq`].

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::schema::{ColumnType, FieldDecl, MetaOptions, ModelKey, OnDelete, Validator};

/// Primary key column of every synthesized table.
pub const PRIMARY_KEY: &str = "id";

/// Sender identity of a concrete model on the event bus: `{app_label}.{ObjectName}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchemaId(String);

impl SchemaId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SchemaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a relational field points after rewriting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationTarget {
    pub model: ModelKey,
    pub label: String,
    pub table: String,
    pub primary_key: ColumnType,
    /// `Some` when the target is the same tenant's concrete model, `None` for shared tables.
    pub tenant_id: Option<Uuid>,
}

impl RelationTarget {
    pub fn is_tenant_scoped(&self) -> bool {
        self.tenant_id.is_some()
    }
}

/// Storage of a many-to-many relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Junction {
    /// Generated table owned by the source model.
    Auto {
        table: String,
        source_column: String,
        target_column: String,
    },
    /// A tenant model declared as the intermediary.
    Through {
        model: ModelKey,
        table: String,
        source_column: String,
        target_column: String,
    },
}

impl Junction {
    pub fn table(&self) -> &str {
        match self {
            Junction::Auto { table, .. } | Junction::Through { table, .. } => table,
        }
    }

    pub fn source_column(&self) -> &str {
        match self {
            Junction::Auto { source_column, .. } | Junction::Through { source_column, .. } => {
                source_column
            }
        }
    }

    pub fn target_column(&self) -> &str {
        match self {
            Junction::Auto { target_column, .. } | Junction::Through { target_column, .. } => {
                target_column
            }
        }
    }

    pub fn through_model(&self) -> Option<&ModelKey> {
        match self {
            Junction::Auto { .. } => None,
            Junction::Through { model, .. } => Some(model),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ConcreteKind {
    Column {
        column: String,
        column_type: ColumnType,
    },
    ForeignKey {
        column: String,
        target: RelationTarget,
        on_delete: OnDelete,
    },
    ManyToMany {
        target: RelationTarget,
        junction: Junction,
    },
}

/// A field of a concrete model, relations already pointing at concrete tables.
#[derive(Debug, Clone)]
pub struct ConcreteField {
    pub name: String,
    pub kind: ConcreteKind,
    pub null: bool,
    pub blank: bool,
    pub unique: bool,
    pub default: Option<JsonValue>,
    pub validators: Vec<Validator>,
}

impl ConcreteField {
    /// Copies everything but the kind from the declared field.
    pub(crate) fn from_decl(decl: &FieldDecl, kind: ConcreteKind) -> Self {
        Self {
            name: decl.name.clone(),
            kind,
            null: decl.null,
            blank: decl.blank,
            unique: decl.unique,
            default: decl.default.clone(),
            validators: decl.validators.clone(),
        }
    }

    /// Column in the owning table; many-to-many fields have none.
    pub fn column(&self) -> Option<&str> {
        match &self.kind {
            ConcreteKind::Column { column, .. } | ConcreteKind::ForeignKey { column, .. } => {
                Some(column)
            }
            ConcreteKind::ManyToMany { .. } => None,
        }
    }

    /// Storage type of the column; a foreign key stores the target's key type.
    pub fn column_type(&self) -> Option<ColumnType> {
        match &self.kind {
            ConcreteKind::Column { column_type, .. } => Some(*column_type),
            ConcreteKind::ForeignKey { target, .. } => Some(target.primary_key),
            ConcreteKind::ManyToMany { .. } => None,
        }
    }

    pub fn target(&self) -> Option<&RelationTarget> {
        match &self.kind {
            ConcreteKind::Column { .. } => None,
            ConcreteKind::ForeignKey { target, .. } | ConcreteKind::ManyToMany { target, .. } => {
                Some(target)
            }
        }
    }

    pub fn junction(&self) -> Option<&Junction> {
        match &self.kind {
            ConcreteKind::ManyToMany { junction, .. } => Some(junction),
            _ => None,
        }
    }

    fn answers_to(&self, name: &str) -> bool {
        self.name == name || self.column() == Some(name)
    }
}

/// Multi-table inheritance link to a parent of the same tenant.
#[derive(Debug)]
pub struct ConcreteParent {
    pub model: Arc<ConcreteModel>,
    pub ptr_column: String,
}

/// A field found on a model or one of its concrete ancestors.
#[derive(Debug)]
pub struct FieldLocation<'a> {
    /// Parent indexes to follow from the starting model.
    pub path: Vec<usize>,
    pub owner: &'a ConcreteModel,
    pub field: &'a ConcreteField,
}

/// A declaration synthesized for one tenant.
#[derive(Debug)]
pub struct ConcreteModel {
    pub(crate) declaration: ModelKey,
    pub(crate) object_name: String,
    pub(crate) tenant_id: Uuid,
    pub(crate) app_label: String,
    pub(crate) table: String,
    pub(crate) fields: Vec<ConcreteField>,
    pub(crate) parents: Vec<ConcreteParent>,
    pub(crate) lineage: BTreeSet<ModelKey>,
    pub(crate) meta: MetaOptions,
}

impl ConcreteModel {
    /// The originating declaration.
    pub fn declaration(&self) -> &ModelKey {
        &self.declaration
    }

    pub fn object_name(&self) -> &str {
        &self.object_name
    }

    /// Lowercase name used for the metadata record.
    pub fn model_name(&self) -> String {
        self.object_name.to_lowercase()
    }

    pub fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }

    pub fn app_label(&self) -> &str {
        &self.app_label
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    pub fn schema_id(&self) -> SchemaId {
        SchemaId(format!("{}.{}", self.app_label, self.object_name))
    }

    /// Fields stored on this model's own table or its junctions.
    pub fn fields(&self) -> &[ConcreteField] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&ConcreteField> {
        self.fields.iter().find(|field| field.answers_to(name))
    }

    pub fn parents(&self) -> &[ConcreteParent] {
        &self.parents
    }

    /// Every declaration this model descends from, itself included.
    pub fn lineage(&self) -> &BTreeSet<ModelKey> {
        &self.lineage
    }

    pub fn meta(&self) -> &MetaOptions {
        &self.meta
    }

    /// Auto-generated junctions owned by this model.
    pub fn auto_junctions(&self) -> impl Iterator<Item = (&ConcreteField, &Junction)> {
        self.fields.iter().filter_map(|field| match field.junction() {
            Some(junction @ Junction::Auto { .. }) => Some((field, junction)),
            _ => None,
        })
    }

    /// Finds a field here or on a concrete ancestor, nearest first.
    pub fn locate(&self, name: &str) -> Option<FieldLocation<'_>> {
        if let Some(field) = self.field(name) {
            return Some(FieldLocation {
                path: Vec::new(),
                owner: self,
                field,
            });
        }

        self.parents.iter().enumerate().find_map(|(index, parent)| {
            parent.model.locate(name).map(|mut location| {
                location.path.insert(0, index);
                location
            })
        })
    }

    /// Names of all fields, inherited ones after own ones.
    pub fn field_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.fields.iter().map(|field| field.name.clone()).collect();
        for parent in &self.parents {
            for name in parent.model.field_names() {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }

    /// True when this model was synthesized from `declaration` or one of its descendants.
    pub fn is_subclass_of(&self, declaration: &ModelKey) -> bool {
        self.lineage.contains(declaration)
    }

    /// True for `other` itself and for same-tenant concrete ancestors.
    ///
    /// Another tenant's concrete model of the same declaration is a sibling,
    /// never an ancestor.
    pub fn is_subclass_of_model(&self, other: &ConcreteModel) -> bool {
        std::ptr::eq(self, other)
            || (self.tenant_id == other.tenant_id && self.lineage.contains(&other.declaration))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn model(
        key: ModelKey,
        tenant_id: Uuid,
        parents: Vec<ConcreteParent>,
        extra_lineage: &[ModelKey],
    ) -> ConcreteModel {
        let mut lineage: BTreeSet<ModelKey> = extra_lineage.iter().cloned().collect();
        lineage.insert(key.clone());
        for parent in &parents {
            lineage.extend(parent.model.lineage.iter().cloned());
        }
        ConcreteModel {
            object_name: key.model().to_string(),
            table: format!("t_{}_{}", tenant_id.simple(), key.model()),
            app_label: format!("tenant_{}", tenant_id.simple()),
            declaration: key,
            tenant_id,
            fields: vec![ConcreteField::from_decl(
                &FieldDecl::text("label"),
                ConcreteKind::Column {
                    column: "label".to_string(),
                    column_type: ColumnType::Text,
                },
            )],
            parents,
            lineage,
            meta: MetaOptions::default(),
        }
    }

    #[test]
    fn subclass_checks_follow_lineage_tags() {
        let tenant = Uuid::new_v4();
        let abstract_key = ModelKey::new("tests", "AbstractTenantModel");
        let specific_key = ModelKey::new("tests", "SpecificModel");
        let related_key = ModelKey::new("tests", "RelatedSpecificModel");

        let specific = model(specific_key.clone(), tenant, Vec::new(), &[abstract_key.clone()]);
        assert!(specific.is_subclass_of(&abstract_key));
        assert!(specific.is_subclass_of(&specific_key));
        assert!(!specific.is_subclass_of(&related_key));
    }

    #[test]
    fn concrete_subclass_relates_only_to_same_tenant_parent() {
        let acme = Uuid::new_v4();
        let globex = Uuid::new_v4();
        let specific_key = ModelKey::new("tests", "SpecificModel");
        let subclass_key = ModelKey::new("tests", "SpecificModelSubclass");

        let acme_specific = Arc::new(model(specific_key.clone(), acme, Vec::new(), &[]));
        let globex_specific = model(specific_key, globex, Vec::new(), &[]);
        let acme_subclass = model(
            subclass_key,
            acme,
            vec![ConcreteParent {
                model: acme_specific.clone(),
                ptr_column: "specificmodel_ptr_id".to_string(),
            }],
            &[],
        );

        assert!(acme_subclass.is_subclass_of_model(&acme_specific));
        assert!(!acme_subclass.is_subclass_of_model(&globex_specific));
        assert!(!acme_specific.is_subclass_of_model(&acme_subclass));
        assert!(acme_specific.is_subclass_of_model(&acme_specific));
        assert!(!globex_specific.is_subclass_of_model(&acme_specific));
    }

    #[test]
    fn locate_walks_parents() {
        let tenant = Uuid::new_v4();
        let parent = Arc::new(model(ModelKey::new("tests", "Base"), tenant, Vec::new(), &[]));
        let mut child = model(
            ModelKey::new("tests", "Child"),
            tenant,
            vec![ConcreteParent {
                model: parent,
                ptr_column: "base_ptr_id".to_string(),
            }],
            &[],
        );
        child.fields.clear();

        let location = child.locate("label").unwrap();
        assert_eq!(location.path, vec![0]);
        assert_eq!(location.owner.object_name(), "base");
        assert_eq!(child.field_names(), vec!["label".to_string()]);
        assert!(child.locate("missing").is_none());
    }
}
