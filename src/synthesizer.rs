//! Model synthesis: one declaration × one tenant → concrete model and table.
//!
//! Synthesis runs in two phases. Planning is synchronous and purely in
//! memory: it resolves parents and rewrites relations, collecting every
//! tenant model the requested one needs (relation targets, through models
//! and concrete parents) that is not yet cached. Persisting then creates the
//! tables and metadata records of that whole closure in one transaction.
//! Nothing is handed back for caching unless the transaction committed.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use sea_orm::sea_query::{
    Alias, ColumnDef, ForeignKey, ForeignKeyAction, ForeignKeyCreateStatement, Index,
    IndexCreateStatement, Table, TableCreateStatement,
};
use sea_orm::{
    ConnectionTrait, DatabaseBackend, DatabaseConnection, DatabaseTransaction, DbErr, EntityTrait,
    StatementBuilder, TransactionTrait,
};
use sea_orm_migration::SchemaManager;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::concrete::{ConcreteField, ConcreteKind, ConcreteModel, ConcreteParent, Junction, PRIMARY_KEY};
use crate::error::{ConfigurationError, SynthesisError, SynthesisStep, TenancyError, is_already_exists};
use crate::events::EventBus;
use crate::models::Tenant;
use crate::models::model_metadata::{KIND_JUNCTION, KIND_MODEL};
use crate::naming::Naming;
use crate::repositories::{ModelMetadataRepository, NewModelMetadata};
use crate::rewriter::{Owner, RelationRewriter};
use crate::schema::{
    CatalogState, ColumnType, Declaration, FieldDecl, MetaOptions, ModelCatalog, ModelKey, Resolved,
};

/// Abstract inheritance deeper than this is treated as a cycle.
const MAX_ABSTRACT_DEPTH: usize = 32;

/// Result of one synthesis pass.
#[derive(Debug)]
pub struct Synthesized {
    /// The model that was asked for.
    pub model: Arc<ConcreteModel>,
    /// Every model built in this pass, parents before children.
    pub fresh: Vec<Arc<ConcreteModel>>,
}

#[derive(Debug)]
pub struct Synthesizer {
    catalog: Arc<ModelCatalog>,
    events: Arc<EventBus>,
    naming: Naming,
}

impl Synthesizer {
    pub fn new(catalog: Arc<ModelCatalog>, events: Arc<EventBus>, naming: Naming) -> Self {
        Self {
            catalog,
            events,
            naming,
        }
    }

    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        &self.catalog
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn naming(&self) -> &Naming {
        &self.naming
    }

    /// Builds the concrete models for `key` without touching the database.
    ///
    /// `existing` holds the tenant's already-cached models; they are reused
    /// as parents and never rebuilt.
    pub fn plan(
        &self,
        key: &ModelKey,
        tenant_id: Uuid,
        existing: &HashMap<ModelKey, Arc<ConcreteModel>>,
    ) -> Result<Synthesized, ConfigurationError> {
        let catalog = self.catalog.read();
        Planner::new(&catalog, &self.naming, tenant_id, existing.clone()).run(key)
    }

    /// Plans, creates tables and metadata, and binds lifecycle events.
    #[instrument(skip_all, fields(declaration = %key, tenant_id = %tenant_id))]
    pub async fn synthesize(
        &self,
        db: &DatabaseConnection,
        key: &ModelKey,
        tenant_id: Uuid,
        existing: &HashMap<ModelKey, Arc<ConcreteModel>>,
    ) -> Result<Synthesized, TenancyError> {
        let started = Instant::now();
        let synthesized = self.plan(key, tenant_id, existing)?;

        self.persist(db, &synthesized.model, tenant_id, &synthesized.fresh)
            .await?;

        for model in &synthesized.fresh {
            self.events.bind(model);
        }

        counter!("tenancy_models_synthesized_total").increment(synthesized.fresh.len() as u64);
        histogram!("tenancy_synthesis_duration_seconds").record(started.elapsed().as_secs_f64());
        info!(
            table = synthesized.model.table_name(),
            models = synthesized.fresh.len(),
            "synthesized tenant models"
        );

        Ok(synthesized)
    }

    async fn persist(
        &self,
        db: &DatabaseConnection,
        requested: &ConcreteModel,
        tenant_id: Uuid,
        fresh: &[Arc<ConcreteModel>],
    ) -> Result<(), TenancyError> {
        let requested_label = label(requested);
        let fail = |model_label: String, step: SynthesisStep| {
            move |source| SynthesisError::new(model_label, tenant_id, step, source)
        };

        let txn = db
            .begin()
            .await
            .map_err(fail(requested_label.clone(), SynthesisStep::TenantLookup))?;

        let tenant = Tenant::find_by_id(tenant_id)
            .one(&txn)
            .await
            .map_err(fail(requested_label.clone(), SynthesisStep::TenantLookup))?;
        if tenant.is_none() {
            return Err(TenancyError::TenantNotFound { tenant_id });
        }

        let manager = SchemaManager::new(&txn);
        let inline_foreign_keys = manager.get_database_backend() == DatabaseBackend::Sqlite;
        let mut deferred_foreign_keys: Vec<(String, ForeignKeyCreateStatement)> = Vec::new();
        let mut junctions: Vec<NewModelMetadata> = Vec::new();

        for model in fresh {
            let model_label = label(model);
            let table = model.table_name();

            let exists = manager
                .has_table(table)
                .await
                .map_err(fail(model_label.clone(), SynthesisStep::CreateTable))?;
            if exists {
                debug!(table, "reusing existing table");
            } else {
                let statement = self.table_statement(model, inline_foreign_keys);
                create_if_absent(&txn, &statement)
                    .await
                    .map_err(fail(model_label.clone(), SynthesisStep::CreateTable))?;

                for index in self.unique_indexes(model) {
                    create_if_absent(&txn, &index)
                        .await
                        .map_err(fail(model_label.clone(), SynthesisStep::CreateIndex))?;
                }

                if !inline_foreign_keys {
                    deferred_foreign_keys.extend(
                        self.foreign_keys(model)
                            .into_iter()
                            .map(|fk| (model_label.clone(), fk)),
                    );
                }
            }

            for (field, junction) in model.auto_junctions() {
                let Some(target) = field.target() else {
                    continue;
                };
                let junction_table = junction.table();
                let exists = manager
                    .has_table(junction_table)
                    .await
                    .map_err(fail(model_label.clone(), SynthesisStep::CreateTable))?;
                if !exists {
                    let statement = self.junction_statement(
                        model,
                        junction,
                        target.table.as_str(),
                        target.primary_key,
                        inline_foreign_keys,
                    );
                    create_if_absent(&txn, &statement)
                        .await
                        .map_err(fail(model_label.clone(), SynthesisStep::CreateTable))?;

                    let index = Index::create()
                        .name(self.naming.index_name(
                            junction_table,
                            &[
                                junction.source_column().to_string(),
                                junction.target_column().to_string(),
                            ],
                        ))
                        .table(Alias::new(junction_table))
                        .col(Alias::new(junction.source_column()))
                        .col(Alias::new(junction.target_column()))
                        .unique()
                        .if_not_exists()
                        .to_owned();
                    create_if_absent(&txn, &index)
                        .await
                        .map_err(fail(model_label.clone(), SynthesisStep::CreateIndex))?;

                    if !inline_foreign_keys {
                        deferred_foreign_keys.extend(
                            self.junction_foreign_keys(model, junction, &target.table)
                                .into_iter()
                                .map(|fk| (model_label.clone(), fk)),
                        );
                    }
                }

                junctions.push(NewModelMetadata {
                    app_label: model.app_label().to_string(),
                    model: self.naming.metadata_junction(model.declaration(), &field.name),
                    declaration: model.declaration().to_string(),
                    tenant_id: Some(tenant_id),
                    table_name: junction_table.to_string(),
                    kind: KIND_JUNCTION,
                });
            }
        }

        // Every table of the pass exists by now, so cycles between them are fine.
        for (model_label, foreign_key) in deferred_foreign_keys {
            create_if_absent(&txn, &foreign_key)
                .await
                .map_err(fail(model_label, SynthesisStep::CreateForeignKey))?;
        }

        let metadata = ModelMetadataRepository::new(&txn);
        for model in fresh {
            let (record, created) = metadata
                .get_or_create(NewModelMetadata {
                    app_label: model.app_label().to_string(),
                    model: self.naming.metadata_model(model.declaration()),
                    declaration: model.declaration().to_string(),
                    tenant_id: Some(tenant_id),
                    table_name: model.table_name().to_string(),
                    kind: KIND_MODEL,
                })
                .await
                .map_err(fail(label(model), SynthesisStep::RegisterMetadata))?;
            debug!(metadata_id = record.id, created, table = model.table_name(), "registered model metadata");
        }
        for junction in junctions {
            metadata
                .get_or_create(junction)
                .await
                .map_err(fail(requested_label.clone(), SynthesisStep::RegisterMetadata))?;
        }

        txn.commit()
            .await
            .map_err(fail(requested_label, SynthesisStep::Commit))?;
        Ok(())
    }

    fn table_statement(&self, model: &ConcreteModel, inline_foreign_keys: bool) -> TableCreateStatement {
        let mut table = Table::create();
        table.table(Alias::new(model.table_name())).if_not_exists();

        if model.parents().is_empty() {
            table.col(
                ColumnDef::new(Alias::new(PRIMARY_KEY))
                    .big_integer()
                    .not_null()
                    .auto_increment()
                    .primary_key(),
            );
        } else {
            // Shares the key of the first parent's row.
            table.col(
                ColumnDef::new(Alias::new(PRIMARY_KEY))
                    .big_integer()
                    .not_null()
                    .primary_key(),
            );
            for parent in model.parents() {
                table.col(
                    ColumnDef::new(Alias::new(&parent.ptr_column))
                        .big_integer()
                        .not_null()
                        .unique_key(),
                );
            }
        }

        for field in model.fields() {
            let (Some(column), Some(column_type)) = (field.column(), field.column_type()) else {
                continue;
            };
            let mut definition = column_def(column, column_type);
            if field.null {
                definition.null();
            } else {
                definition.not_null();
            }
            if field.unique {
                definition.unique_key();
            }
            table.col(&mut definition);
        }

        if inline_foreign_keys {
            for mut foreign_key in self.foreign_keys(model) {
                table.foreign_key(&mut foreign_key);
            }
        }

        table.to_owned()
    }

    fn junction_statement(
        &self,
        model: &ConcreteModel,
        junction: &Junction,
        target_table: &str,
        target_key: ColumnType,
        inline_foreign_keys: bool,
    ) -> TableCreateStatement {
        let mut table = Table::create();
        table
            .table(Alias::new(junction.table()))
            .if_not_exists()
            .col(
                ColumnDef::new(Alias::new(PRIMARY_KEY))
                    .big_integer()
                    .not_null()
                    .auto_increment()
                    .primary_key(),
            )
            .col(
                ColumnDef::new(Alias::new(junction.source_column()))
                    .big_integer()
                    .not_null(),
            )
            .col(column_def(junction.target_column(), target_key).not_null());

        if inline_foreign_keys {
            for mut foreign_key in self.junction_foreign_keys(model, junction, target_table) {
                table.foreign_key(&mut foreign_key);
            }
        }

        table.to_owned()
    }

    fn foreign_keys(&self, model: &ConcreteModel) -> Vec<ForeignKeyCreateStatement> {
        let table = model.table_name();
        let mut keys: Vec<ForeignKeyCreateStatement> = model
            .parents()
            .iter()
            .map(|parent| {
                self.foreign_key(
                    table,
                    &parent.ptr_column,
                    parent.model.table_name(),
                    ForeignKeyAction::Cascade,
                )
            })
            .collect();

        for field in model.fields() {
            if let ConcreteKind::ForeignKey {
                column,
                target,
                on_delete,
            } = &field.kind
            {
                keys.push(self.foreign_key(table, column, &target.table, (*on_delete).into()));
            }
        }
        keys
    }

    fn junction_foreign_keys(
        &self,
        model: &ConcreteModel,
        junction: &Junction,
        target_table: &str,
    ) -> Vec<ForeignKeyCreateStatement> {
        vec![
            self.foreign_key(
                junction.table(),
                junction.source_column(),
                model.table_name(),
                ForeignKeyAction::Cascade,
            ),
            self.foreign_key(
                junction.table(),
                junction.target_column(),
                target_table,
                ForeignKeyAction::Cascade,
            ),
        ]
    }

    fn foreign_key(
        &self,
        table: &str,
        column: &str,
        target_table: &str,
        action: ForeignKeyAction,
    ) -> ForeignKeyCreateStatement {
        ForeignKey::create()
            .name(self.naming.foreign_key_name(table, column))
            .from(Alias::new(table), Alias::new(column))
            .to(Alias::new(target_table), Alias::new(PRIMARY_KEY))
            .on_delete(action)
            .to_owned()
    }

    fn unique_indexes(&self, model: &ConcreteModel) -> Vec<IndexCreateStatement> {
        model
            .meta()
            .unique_together
            .iter()
            .map(|fields| {
                let columns: Vec<String> = fields
                    .iter()
                    .filter_map(|name| model.field(name).and_then(ConcreteField::column))
                    .map(str::to_string)
                    .collect();
                let mut index = Index::create();
                index
                    .name(self.naming.index_name(model.table_name(), &columns))
                    .table(Alias::new(model.table_name()))
                    .unique()
                    .if_not_exists();
                for column in &columns {
                    index.col(Alias::new(column.as_str()));
                }
                index.to_owned()
            })
            .collect()
    }
}

fn label(model: &ConcreteModel) -> String {
    format!("{}.{}", model.declaration().app_label(), model.object_name())
}

/// Runs one DDL statement inside a savepoint of `txn`.
///
/// Another process may create the same object first. Rolling back to the
/// savepoint keeps `txn` usable on Postgres, where any failed statement
/// aborts the whole transaction.
async fn create_if_absent<S: StatementBuilder>(txn: &DatabaseTransaction, statement: &S) -> Result<(), DbErr> {
    let savepoint = txn.begin().await?;
    let backend = savepoint.get_database_backend();
    match savepoint.execute(backend.build(statement)).await {
        Ok(_) => savepoint.commit().await,
        Err(err) if is_already_exists(&err) => {
            debug!(error = %err, "schema object already exists");
            savepoint.rollback().await
        }
        Err(err) => {
            savepoint.rollback().await?;
            Err(err)
        }
    }
}

fn column_def(name: &str, column_type: ColumnType) -> ColumnDef {
    let mut definition = ColumnDef::new(Alias::new(name));
    match column_type {
        ColumnType::Text => definition.text(),
        ColumnType::Integer => definition.integer(),
        ColumnType::BigInteger => definition.big_integer(),
        ColumnType::Boolean => definition.boolean(),
        ColumnType::Float => definition.double(),
        ColumnType::Uuid => definition.uuid(),
        ColumnType::Timestamp => definition.timestamp_with_time_zone(),
        ColumnType::Date => definition.date(),
        ColumnType::Json => definition.json_binary(),
    };
    definition
}

/// In-memory construction of concrete models for one tenant.
struct Planner<'a> {
    catalog: &'a CatalogState,
    naming: &'a Naming,
    tenant_id: Uuid,
    built: HashMap<ModelKey, Arc<ConcreteModel>>,
    fresh: Vec<Arc<ConcreteModel>>,
    in_progress: Vec<ModelKey>,
    pending: VecDeque<ModelKey>,
}

/// Fields, parents and lineage gathered from a declaration's ancestors.
#[derive(Default)]
struct Inherited {
    fields: Vec<ConcreteField>,
    parents: Vec<ConcreteParent>,
    lineage: BTreeSet<ModelKey>,
    dependencies: Vec<ModelKey>,
    /// Options of abstract ancestors, nearest first.
    meta: MetaOptions,
}

impl Inherited {
    fn inherit_meta(&mut self, parent: &MetaOptions) {
        merge_meta(&mut self.meta, parent);
    }

    /// `own` overrides the inherited ordering; unique groups accumulate.
    fn merged_meta(&self, own: &MetaOptions) -> MetaOptions {
        let mut meta = own.clone();
        merge_meta(&mut meta, &self.meta);
        meta
    }
}

fn merge_meta(into: &mut MetaOptions, from: &MetaOptions) {
    if into.ordering.is_empty() {
        into.ordering = from.ordering.clone();
    }
    for group in &from.unique_together {
        if !into.unique_together.contains(group) {
            into.unique_together.push(group.clone());
        }
    }
}

impl<'a> Planner<'a> {
    fn new(
        catalog: &'a CatalogState,
        naming: &'a Naming,
        tenant_id: Uuid,
        built: HashMap<ModelKey, Arc<ConcreteModel>>,
    ) -> Self {
        Self {
            catalog,
            naming,
            tenant_id,
            built,
            fresh: Vec::new(),
            in_progress: Vec::new(),
            pending: VecDeque::new(),
        }
    }

    fn run(mut self, key: &ModelKey) -> Result<Synthesized, ConfigurationError> {
        let model = self.build(key)?;
        while let Some(next) = self.pending.pop_front() {
            self.build(&next)?;
        }
        Ok(Synthesized {
            model,
            fresh: self.fresh,
        })
    }

    fn build(&mut self, key: &ModelKey) -> Result<Arc<ConcreteModel>, ConfigurationError> {
        if let Some(model) = self.built.get(key) {
            return Ok(model.clone());
        }

        let catalog: &'a CatalogState = self.catalog;
        let declaration = match catalog.declaration(key) {
            Some(declaration) if !declaration.is_abstract() => declaration,
            _ => {
                return Err(ConfigurationError::NotTenantAware {
                    model: key.to_string(),
                });
            }
        };
        let declaration_label = declaration.label();
        if self.in_progress.contains(key) {
            return Err(ConfigurationError::InheritanceCycle {
                declaration: declaration_label,
            });
        }
        self.in_progress.push(key.clone());

        let table = self.naming.table_name(key, self.tenant_id);
        let owner = Owner {
            key,
            label: &declaration_label,
            table: &table,
        };

        let mut inherited = Inherited::default();
        inherited.lineage.insert(key.clone());
        self.inherit(declaration, key, declaration.parents(), owner, &mut inherited, 0)?;
        self.rewrite_into(owner, declaration.fields(), &mut inherited)?;

        let meta = inherited.merged_meta(declaration.meta());
        check_fields(declaration, &inherited, &meta)?;

        let model = Arc::new(ConcreteModel {
            declaration: key.clone(),
            object_name: declaration.object_name().to_string(),
            tenant_id: self.tenant_id,
            app_label: self.naming.app_label(self.tenant_id),
            table,
            fields: inherited.fields,
            parents: inherited.parents,
            lineage: inherited.lineage,
            meta,
        });

        self.in_progress.pop();
        self.built.insert(key.clone(), model.clone());
        self.fresh.push(model.clone());
        for dependency in inherited.dependencies {
            if !self.built.contains_key(&dependency) && !self.pending.contains(&dependency) {
                self.pending.push_back(dependency);
            }
        }

        Ok(model)
    }

    fn inherit(
        &mut self,
        declaration: &Declaration,
        resolve_from: &ModelKey,
        references: &'a [String],
        owner: Owner<'_>,
        inherited: &mut Inherited,
        depth: usize,
    ) -> Result<(), ConfigurationError> {
        if depth > MAX_ABSTRACT_DEPTH {
            return Err(ConfigurationError::InheritanceCycle {
                declaration: declaration.label(),
            });
        }

        let catalog: &'a CatalogState = self.catalog;
        for reference in references {
            match catalog.resolve(reference, resolve_from) {
                Some(Resolved::Tenant(parent)) if parent.is_abstract() => {
                    inherited.lineage.insert(parent.key().clone());
                    inherited.inherit_meta(parent.meta());
                    self.inherit(declaration, parent.key(), parent.parents(), owner, inherited, depth + 1)?;
                    self.rewrite_into(owner, parent.fields(), inherited)?;
                }
                Some(Resolved::Tenant(parent)) => {
                    let model = self.build(parent.key())?;
                    inherited.lineage.extend(model.lineage().iter().cloned());
                    inherited.parents.push(ConcreteParent {
                        ptr_column: format!("{}_ptr_id", parent.key().model()),
                        model,
                    });
                }
                Some(Resolved::Shared(mixin)) if mixin.is_abstract() => {
                    inherited.lineage.insert(mixin.key().clone());
                    self.rewrite_into(owner, mixin.fields(), inherited)?;
                }
                Some(Resolved::Shared(model)) => {
                    return Err(ConfigurationError::UnsupportedParent {
                        declaration: declaration.label(),
                        parent: model.label(),
                    });
                }
                None => {
                    return Err(ConfigurationError::UnresolvedParent {
                        declaration: declaration.label(),
                        parent: reference.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn rewrite_into(
        &self,
        owner: Owner<'_>,
        fields: &[FieldDecl],
        inherited: &mut Inherited,
    ) -> Result<(), ConfigurationError> {
        let rewriter = RelationRewriter::new(self.catalog, self.naming, self.tenant_id);
        for field in fields {
            let rewritten = rewriter.rewrite(owner, field)?;
            inherited.fields.push(rewritten.field);
            inherited.dependencies.extend(rewritten.dependencies);
        }
        Ok(())
    }
}

/// Rejects duplicate names and meta options that reference unknown columns.
fn check_fields(
    declaration: &Declaration,
    inherited: &Inherited,
    meta: &MetaOptions,
) -> Result<(), ConfigurationError> {
    let mut seen: HashSet<&str> = HashSet::from([PRIMARY_KEY]);
    for parent in &inherited.parents {
        seen.insert(parent.ptr_column.as_str());
    }
    let inherited_names: Vec<String> = inherited
        .parents
        .iter()
        .flat_map(|parent| parent.model.field_names())
        .collect();

    for field in &inherited.fields {
        let duplicate = !seen.insert(field.name.as_str())
            || field
                .column()
                .is_some_and(|column| column != field.name && !seen.insert(column))
            || inherited_names.contains(&field.name);
        if duplicate {
            return Err(ConfigurationError::DuplicateField {
                declaration: declaration.label(),
                field: field.name.clone(),
            });
        }
    }

    let is_column = |name: &str| {
        name == PRIMARY_KEY
            || inherited
                .fields
                .iter()
                .any(|field| field.name == name && field.column().is_some())
    };

    for entry in &meta.ordering {
        let name = entry.trim_start_matches('-');
        if !is_column(name) {
            return Err(ConfigurationError::InvalidOrdering {
                declaration: declaration.label(),
                field: name.to_string(),
            });
        }
    }

    for group in &meta.unique_together {
        for name in group {
            if name == PRIMARY_KEY || !is_column(name) {
                return Err(ConfigurationError::InvalidUniqueTogether {
                    declaration: declaration.label(),
                    field: name.clone(),
                });
            }
        }
    }

    Ok(())
}
