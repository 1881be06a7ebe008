//! Relation rewriting: declared fields to tenant-specific fields.
//!
//! Plain fields are copied. Relations to shared models keep pointing at the
//! shared table. Relations to tenant models are pointed at the same tenant's
//! concrete table, and the target is reported back as a dependency so the
//! synthesizer builds it in the same pass. Targets are looked up by name at
//! this point, not when declarations are installed, which is what lets a
//! declaration refer to one installed after it.

use uuid::Uuid;

use crate::concrete::{ConcreteField, ConcreteKind, Junction, RelationTarget};
use crate::error::ConfigurationError;
use crate::naming::Naming;
use crate::schema::{CatalogState, ColumnType, Declaration, FieldDecl, FieldKind, ModelKey, Resolved};

/// The concrete model a field is being rewritten for.
#[derive(Debug, Clone, Copy)]
pub struct Owner<'a> {
    pub key: &'a ModelKey,
    pub label: &'a str,
    pub table: &'a str,
}

/// A rewritten field and the tenant models it needs synthesized alongside.
#[derive(Debug)]
pub struct Rewritten {
    pub field: ConcreteField,
    pub dependencies: Vec<ModelKey>,
}

pub struct RelationRewriter<'a> {
    catalog: &'a CatalogState,
    naming: &'a Naming,
    tenant_id: Uuid,
}

impl<'a> RelationRewriter<'a> {
    pub fn new(catalog: &'a CatalogState, naming: &'a Naming, tenant_id: Uuid) -> Self {
        Self {
            catalog,
            naming,
            tenant_id,
        }
    }

    pub fn rewrite(&self, owner: Owner<'_>, field: &FieldDecl) -> Result<Rewritten, ConfigurationError> {
        match &field.kind {
            FieldKind::Column(column_type) => Ok(Rewritten {
                field: ConcreteField::from_decl(
                    field,
                    ConcreteKind::Column {
                        column: field.name.clone(),
                        column_type: *column_type,
                    },
                ),
                dependencies: Vec::new(),
            }),
            FieldKind::ForeignKey { to, on_delete } => {
                let target = self.target(owner, field, to)?;
                let dependencies = self.dependency(owner, &target).into_iter().collect();
                Ok(Rewritten {
                    field: ConcreteField::from_decl(
                        field,
                        ConcreteKind::ForeignKey {
                            column: format!("{}_id", field.name),
                            target,
                            on_delete: *on_delete,
                        },
                    ),
                    dependencies,
                })
            }
            FieldKind::ManyToMany { to, through } => {
                let target = self.target(owner, field, to)?;
                let mut dependencies: Vec<ModelKey> =
                    self.dependency(owner, &target).into_iter().collect();

                let junction = match through {
                    None => self.auto_junction(owner, field, &target),
                    Some(through) => {
                        let junction = self.through_junction(owner, field, through, &target)?;
                        if let Some(model) = junction.through_model() {
                            if model != owner.key {
                                dependencies.push(model.clone());
                            }
                        }
                        junction
                    }
                };

                Ok(Rewritten {
                    field: ConcreteField::from_decl(
                        field,
                        ConcreteKind::ManyToMany { target, junction },
                    ),
                    dependencies,
                })
            }
        }
    }

    fn target(
        &self,
        owner: Owner<'_>,
        field: &FieldDecl,
        reference: &str,
    ) -> Result<RelationTarget, ConfigurationError> {
        match self.catalog.resolve(reference, owner.key) {
            Some(Resolved::Tenant(declaration)) => {
                if declaration.is_abstract() {
                    return Err(ConfigurationError::AbstractRelationTarget {
                        declaration: owner.label.to_string(),
                        field: field.name.clone(),
                        target: declaration.label(),
                    });
                }
                Ok(RelationTarget {
                    model: declaration.key().clone(),
                    label: declaration.label(),
                    table: self.naming.table_name(declaration.key(), self.tenant_id),
                    primary_key: ColumnType::BigInteger,
                    tenant_id: Some(self.tenant_id),
                })
            }
            Some(Resolved::Shared(model)) => match model.table_name() {
                Some(table) => Ok(RelationTarget {
                    model: model.key().clone(),
                    label: model.label(),
                    table: table.to_string(),
                    primary_key: model.primary_key(),
                    tenant_id: None,
                }),
                None => Err(ConfigurationError::AbstractRelationTarget {
                    declaration: owner.label.to_string(),
                    field: field.name.clone(),
                    target: model.label(),
                }),
            },
            None => Err(ConfigurationError::UnresolvedRelation {
                declaration: owner.label.to_string(),
                field: field.name.clone(),
                target: reference.to_string(),
            }),
        }
    }

    fn dependency(&self, owner: Owner<'_>, target: &RelationTarget) -> Option<ModelKey> {
        (target.is_tenant_scoped() && &target.model != owner.key).then(|| target.model.clone())
    }

    fn auto_junction(&self, owner: Owner<'_>, field: &FieldDecl, target: &RelationTarget) -> Junction {
        // Same model name, possibly of another app: keep the two columns apart.
        let (source_column, target_column) = if target.model.model() == owner.key.model() {
            (
                format!("from_{}_id", owner.key.model()),
                format!("to_{}_id", target.model.model()),
            )
        } else {
            (
                format!("{}_id", owner.key.model()),
                format!("{}_id", target.model.model()),
            )
        };

        Junction::Auto {
            table: self.naming.junction_table(owner.table, &field.name),
            source_column,
            target_column,
        }
    }

    fn through_junction(
        &self,
        owner: Owner<'_>,
        field: &FieldDecl,
        reference: &str,
        target: &RelationTarget,
    ) -> Result<Junction, ConfigurationError> {
        let through = match self.catalog.resolve(reference, owner.key) {
            Some(Resolved::Tenant(declaration)) if !declaration.is_abstract() => declaration,
            Some(resolved) => {
                return Err(ConfigurationError::SharedThroughModel {
                    declaration: owner.label.to_string(),
                    field: field.name.clone(),
                    through: resolved.label(),
                });
            }
            None => {
                return Err(ConfigurationError::UnresolvedRelation {
                    declaration: owner.label.to_string(),
                    field: field.name.clone(),
                    target: reference.to_string(),
                });
            }
        };

        let foreign_keys: Vec<(String, ModelKey)> = self
            .stored_fields(through)
            .into_iter()
            .filter_map(|candidate| match &candidate.kind {
                FieldKind::ForeignKey { to, .. } => self
                    .catalog
                    .resolve(to, through.key())
                    .map(|resolved| (candidate.name.clone(), resolved.key().clone())),
                _ => None,
            })
            .collect();

        let missing = |endpoint: String| ConfigurationError::ThroughFieldMissing {
            declaration: owner.label.to_string(),
            field: field.name.clone(),
            through: through.label(),
            endpoint,
        };

        let source = foreign_keys
            .iter()
            .position(|(_, key)| key == owner.key)
            .ok_or_else(|| missing(owner.label.to_string()))?;
        let target_fk = foreign_keys
            .iter()
            .enumerate()
            .find(|(index, (_, key))| *index != source && key == &target.model)
            .map(|(_, (name, _))| name)
            .ok_or_else(|| missing(target.label.clone()))?;

        Ok(Junction::Through {
            model: through.key().clone(),
            table: self.naming.table_name(through.key(), self.tenant_id),
            source_column: format!("{}_id", foreign_keys[source].0),
            target_column: format!("{target_fk}_id"),
        })
    }

    /// Fields stored on a declaration's own table: its own plus those of abstract ancestors.
    fn stored_fields(&self, declaration: &'a Declaration) -> Vec<&'a FieldDecl> {
        let mut fields = Vec::new();
        self.collect_stored_fields(declaration.key(), declaration.parents(), &mut fields, 0);
        fields.extend(declaration.fields());
        fields
    }

    fn collect_stored_fields(
        &self,
        owner: &ModelKey,
        parents: &'a [String],
        fields: &mut Vec<&'a FieldDecl>,
        depth: usize,
    ) {
        // Cycles are reported by the synthesizer; just stop descending here.
        if depth > 32 {
            return;
        }
        for parent in parents {
            match self.catalog.resolve(parent, owner) {
                Some(Resolved::Tenant(declaration)) if declaration.is_abstract() => {
                    self.collect_stored_fields(declaration.key(), declaration.parents(), fields, depth + 1);
                    fields.extend(declaration.fields());
                }
                Some(Resolved::Shared(model)) if model.is_abstract() => {
                    fields.extend(model.fields());
                }
                _ => {}
            }
        }
    }
}
