//! Records and managers of concrete tenant models.
//!
//! Records are schemaless maps of field name to JSON value, validated and
//! converted against the concrete model's column types. Multi-table
//! inheritance is handled here: a child row shares the id of its first
//! parent's row, inherited fields are written to and read from the parent
//! tables, and deleting a child deletes its parent rows too.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use sea_orm::sea_query::{
    Alias, Asterisk, Expr, Func, OnConflict, Order, Query, SelectStatement, SimpleExpr,
};
use sea_orm::{
    ConnectionTrait, DatabaseTransaction, DbErr, QueryResult, TransactionTrait, Value,
};
use serde_json::Value as JsonValue;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::concrete::{ConcreteField, ConcreteKind, ConcreteModel, PRIMARY_KEY};
use crate::error::{ConfigurationError, TenancyError, ValidationError};
use crate::events::{LifecycleEvent, ModelEvent};
use crate::registry::ModelRegistry;
use crate::schema::{ColumnType, ModelKey};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One row of a concrete model, inherited fields included.
#[derive(Debug, Clone)]
pub struct Record {
    model: Arc<ConcreteModel>,
    id: Option<i64>,
    values: BTreeMap<String, JsonValue>,
}

impl Record {
    fn new(model: Arc<ConcreteModel>) -> Self {
        Self {
            model,
            id: None,
            values: BTreeMap::new(),
        }
    }

    /// Primary key; `None` until saved.
    pub fn id(&self) -> Option<i64> {
        self.id
    }

    pub fn model(&self) -> &Arc<ConcreteModel> {
        &self.model
    }

    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.values.get(field)
    }

    /// Sets a stored field. Many-to-many fields go through [`TenantManager::add_related`].
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<JsonValue>) -> Result<(), ConfigurationError> {
        let field = field.into();
        let stored = self
            .model
            .locate(&field)
            .is_some_and(|location| location.field.column().is_some() && location.field.name == field);
        if !stored {
            return Err(ConfigurationError::UnknownField {
                model: self.model.schema_id().to_string(),
                field,
            });
        }
        self.values.insert(field, value.into());
        Ok(())
    }

    pub fn values(&self) -> &BTreeMap<String, JsonValue> {
        &self.values
    }

    /// True when the record's model was synthesized from `declaration` or a descendant of it.
    pub fn is_instance_of(&self, declaration: &ModelKey) -> bool {
        self.model.is_subclass_of(declaration)
    }

    /// True when the record belongs to `model` or to one of its same-tenant subclasses.
    pub fn is_instance_of_model(&self, model: &ConcreteModel) -> bool {
        self.model.is_subclass_of_model(model)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Condition {
    Eq(String, JsonValue),
    IdIn(Vec<i64>),
}

/// Conjunction of field conditions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// `field = value`; a JSON null matches NULL. Works for inherited and many-to-many fields.
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.conditions.push(Condition::Eq(field.into(), value.into()));
        self
    }

    pub fn id_in(mut self, ids: impl IntoIterator<Item = i64>) -> Self {
        self.conditions
            .push(Condition::IdIn(ids.into_iter().collect()));
        self
    }
}

/// Query and persistence entry point for one tenant's concrete model.
#[derive(Clone)]
pub struct TenantManager {
    model: Arc<ConcreteModel>,
    registry: Arc<ModelRegistry>,
}

impl std::fmt::Debug for TenantManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantManager")
            .field("model", &self.model.schema_id())
            .finish_non_exhaustive()
    }
}

impl TenantManager {
    pub fn new(model: Arc<ConcreteModel>, registry: Arc<ModelRegistry>) -> Self {
        Self { model, registry }
    }

    pub fn model(&self) -> &Arc<ConcreteModel> {
        &self.model
    }

    pub fn tenant_id(&self) -> Uuid {
        self.model.tenant_id()
    }

    /// Builds an unsaved record, firing `pre_init` and `post_init`.
    pub fn build<I, K, V>(&self, values: I) -> Result<Record, TenancyError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<JsonValue>,
    {
        self.emit(LifecycleEvent::PreInit, None, false);
        let mut record = Record::new(self.model.clone());
        for (field, value) in values {
            record.set(field, value)?;
        }
        self.emit(LifecycleEvent::PostInit, None, false);
        Ok(record)
    }

    /// Builds and saves a record.
    pub async fn create<I, K, V>(&self, values: I) -> Result<Record, TenancyError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<JsonValue>,
    {
        let mut record = self.build(values)?;
        self.save(&mut record).await?;
        Ok(record)
    }

    /// Checks every stored field, filling defaults and rejecting blank, null
    /// and out-of-type values. Returns the cleaned values.
    pub fn full_clean(&self, record: &Record) -> Result<BTreeMap<String, JsonValue>, ValidationError> {
        let mut cleaned = BTreeMap::new();
        for field in stored_fields(&self.model) {
            let Some(column_type) = field.column_type() else {
                continue;
            };
            let value = match record.values.get(&field.name) {
                Some(value) if !value.is_null() => value.clone(),
                _ => match &field.default {
                    Some(default) => default.clone(),
                    None if field.null => JsonValue::Null,
                    None if column_type == ColumnType::Text && field.blank => {
                        JsonValue::String(String::new())
                    }
                    None if column_type == ColumnType::Text => {
                        return Err(ValidationError::blank(&field.name));
                    }
                    None => return Err(ValidationError::null(&field.name)),
                },
            };

            if value.as_str() == Some("") && !field.blank {
                return Err(ValidationError::blank(&field.name));
            }
            if !value.is_null() {
                to_db_value(column_type, &value).map_err(|message| ValidationError::new(&field.name, message))?;
                if let Some(message) = field.validators.iter().find_map(|validator| validator.check(&value)) {
                    return Err(ValidationError::new(&field.name, message));
                }
            }
            cleaned.insert(field.name.clone(), value);
        }
        Ok(cleaned)
    }

    /// Validates and writes the record, inserting it when it has no id yet.
    #[instrument(skip_all, fields(model = %self.model.schema_id(), id = ?record.id))]
    pub async fn save(&self, record: &mut Record) -> Result<(), TenancyError> {
        self.check_owned(record)?;
        record.values = self.full_clean(record)?;

        self.emit(LifecycleEvent::PreSave, record.id, false);

        let db = self.registry.db();
        let txn = db.begin().await?;
        let created = match record.id {
            None => {
                let id = insert_row(&txn, &self.model, &record.values).await?;
                record.id = Some(id);
                true
            }
            Some(id) => {
                update_row(&txn, &self.model, id, &record.values).await?;
                false
            }
        };
        txn.commit().await?;
        debug!(id = record.id, created, "saved record");

        self.emit(LifecycleEvent::PostSave, record.id, created);
        Ok(())
    }

    /// Deletes the record, its own junction rows and its parent rows.
    ///
    /// Rows removed by database-level cascades fire no events.
    #[instrument(skip_all, fields(model = %self.model.schema_id(), id = ?record.id))]
    pub async fn delete(&self, record: &mut Record) -> Result<(), TenancyError> {
        self.check_owned(record)?;
        let id = record
            .id
            .ok_or_else(|| ValidationError::new(PRIMARY_KEY, "This record has not been saved."))?;

        self.emit(LifecycleEvent::PreDelete, Some(id), false);

        let txn = self.registry.db().begin().await?;
        delete_row(&txn, &self.model, id).await?;
        txn.commit().await?;
        record.id = None;

        self.emit(LifecycleEvent::PostDelete, Some(id), false);
        Ok(())
    }

    pub async fn get(&self, id: i64) -> Result<Option<Record>, TenancyError> {
        let db = self.registry.db();
        let Some(values) = load_row(db, &self.model, id).await? else {
            return Ok(None);
        };
        Ok(Some(self.hydrate(id, values)))
    }

    pub async fn all(&self) -> Result<Vec<Record>, TenancyError> {
        self.filter(Filter::new()).await
    }

    /// Records matching `filter`, in the model's ordering, then by id.
    pub async fn filter(&self, filter: Filter) -> Result<Vec<Record>, TenancyError> {
        let mut select = self.select_ids(&filter)?;
        for entry in &self.model.meta().ordering {
            let (name, order) = match entry.strip_prefix('-') {
                Some(name) => (name, Order::Desc),
                None => (entry.as_str(), Order::Asc),
            };
            let column = self
                .model
                .field(name)
                .and_then(ConcreteField::column)
                .unwrap_or(PRIMARY_KEY);
            select.order_by((Alias::new(self.model.table_name()), Alias::new(column)), order);
        }
        select.order_by((Alias::new(self.model.table_name()), Alias::new(PRIMARY_KEY)), Order::Asc);

        let db = self.registry.db();
        let backend = db.get_database_backend();
        let rows = db.query_all(backend.build(&select)).await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("", PRIMARY_KEY)?;
            if let Some(values) = load_row(db, &self.model, id).await? {
                records.push(self.hydrate(id, values));
            }
        }
        Ok(records)
    }

    pub async fn count(&self) -> Result<u64, TenancyError> {
        self.count_where(Filter::new()).await
    }

    pub async fn count_where(&self, filter: Filter) -> Result<u64, TenancyError> {
        let table = Alias::new(self.model.table_name());
        let mut select = Query::select();
        select
            .expr_as(Func::count(Expr::col(Asterisk)), Alias::new("count"))
            .from(table);
        for condition in &filter.conditions {
            select.and_where(self.condition(condition)?);
        }

        let db = self.registry.db();
        let backend = db.get_database_backend();
        let count: i64 = db
            .query_one(backend.build(&select))
            .await?
            .map(|row| row.try_get("", "count"))
            .transpose()?
            .unwrap_or(0);
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Records on the other side of a relation of `record`.
    ///
    /// A foreign key yields zero or one record; a many-to-many yields every
    /// linked record. Relations to shared models are not followed.
    pub async fn related(&self, record: &Record, field: &str) -> Result<Vec<Record>, TenancyError> {
        let (path, concrete) = self.relation(field)?;
        let target = self.target_manager(&concrete).await?;

        match &concrete.kind {
            ConcreteKind::ForeignKey { .. } => {
                let Some(id) = record.get(&concrete.name).and_then(JsonValue::as_i64) else {
                    return Ok(Vec::new());
                };
                Ok(target.get(id).await?.into_iter().collect())
            }
            ConcreteKind::ManyToMany { junction, .. } => {
                let Some(id) = record.id else {
                    return Ok(Vec::new());
                };
                let db = self.registry.db();
                let Some(source_id) = ancestor_id(db, &self.model, &path, id).await? else {
                    return Ok(Vec::new());
                };

                let select = Query::select()
                    .column(Alias::new(junction.target_column()))
                    .from(Alias::new(junction.table()))
                    .and_where(Expr::col(Alias::new(junction.source_column())).eq(source_id))
                    .to_owned();
                let backend = db.get_database_backend();
                let mut ids = Vec::new();
                for row in db.query_all(backend.build(&select)).await? {
                    ids.push(row.try_get::<i64>("", junction.target_column())?);
                }
                if ids.is_empty() {
                    return Ok(Vec::new());
                }
                target.filter(Filter::new().id_in(ids)).await
            }
            ConcreteKind::Column { .. } => Ok(Vec::new()),
        }
    }

    /// Links `targets` to `record` through an auto-generated junction.
    ///
    /// Existing links are left alone. Relations with an intermediary model
    /// must be populated by creating rows of that model.
    pub async fn add_related(&self, record: &Record, field: &str, targets: &[&Record]) -> Result<(), TenancyError> {
        let (path, concrete, junction) = self.auto_junction(field)?;
        let Some(id) = record.id else {
            return Err(ValidationError::new(PRIMARY_KEY, "This record has not been saved.").into());
        };
        let target_ids = self.target_ids(&concrete, targets)?;

        let db = self.registry.db();
        let txn = db.begin().await?;
        let source_id = ancestor_id(&txn, &self.model, &path, id)
            .await?
            .ok_or_else(|| DbErr::RecordNotFound(format!("{} row {id}", self.model.table_name())))?;

        let backend = txn.get_database_backend();
        for target_id in target_ids {
            let mut insert = Query::insert();
            insert
                .into_table(Alias::new(junction.table()))
                .columns([
                    Alias::new(junction.source_column()),
                    Alias::new(junction.target_column()),
                ])
                .values([source_id.into(), target_id.into()])
                .map_err(|err| DbErr::Custom(err.to_string()))?
                .on_conflict(
                    OnConflict::columns([
                        Alias::new(junction.source_column()),
                        Alias::new(junction.target_column()),
                    ])
                    .do_nothing()
                    .to_owned(),
                );
            txn.execute(backend.build(&insert)).await?;
        }
        txn.commit().await?;
        Ok(())
    }

    /// Unlinks `targets` from `record` in an auto-generated junction.
    pub async fn remove_related(&self, record: &Record, field: &str, targets: &[&Record]) -> Result<u64, TenancyError> {
        let (path, concrete, junction) = self.auto_junction(field)?;
        let Some(id) = record.id else {
            return Ok(0);
        };
        let target_ids = self.target_ids(&concrete, targets)?;

        let db = self.registry.db();
        let Some(source_id) = ancestor_id(db, &self.model, &path, id).await? else {
            return Ok(0);
        };
        let delete = Query::delete()
            .from_table(Alias::new(junction.table()))
            .and_where(Expr::col(Alias::new(junction.source_column())).eq(source_id))
            .and_where(Expr::col(Alias::new(junction.target_column())).is_in(target_ids))
            .to_owned();
        let backend = db.get_database_backend();
        let result = db.execute(backend.build(&delete)).await?;
        Ok(result.rows_affected())
    }

    /// Records of this model whose `field` points at `target`.
    pub async fn referencing(&self, field: &str, target: &Record) -> Result<Vec<Record>, TenancyError> {
        let Some(id) = target.id else {
            return Ok(Vec::new());
        };
        self.filter(Filter::new().eq(field, id)).await
    }

    fn hydrate(&self, id: i64, values: BTreeMap<String, JsonValue>) -> Record {
        self.emit(LifecycleEvent::PreInit, Some(id), false);
        let record = Record {
            model: self.model.clone(),
            id: Some(id),
            values,
        };
        self.emit(LifecycleEvent::PostInit, Some(id), false);
        record
    }

    fn emit(&self, kind: LifecycleEvent, record_id: Option<i64>, created: bool) {
        self.registry.events().dispatch(&ModelEvent {
            kind,
            sender: self.model.schema_id(),
            declaration: self.model.declaration().clone(),
            tenant_id: self.model.tenant_id(),
            record_id,
            created,
        });
    }

    fn check_owned(&self, record: &Record) -> Result<(), ConfigurationError> {
        if Arc::ptr_eq(&record.model, &self.model) {
            Ok(())
        } else {
            Err(ConfigurationError::RecordModelMismatch {
                expected: self.model.schema_id().to_string(),
                found: record.model.schema_id().to_string(),
            })
        }
    }

    fn unknown_field(&self, field: &str) -> ConfigurationError {
        ConfigurationError::UnknownField {
            model: self.model.schema_id().to_string(),
            field: field.to_string(),
        }
    }

    /// Locates a relational field to a tenant model.
    fn relation(&self, field: &str) -> Result<(Vec<usize>, ConcreteField), ConfigurationError> {
        let location = self
            .model
            .locate(field)
            .ok_or_else(|| self.unknown_field(field))?;
        match location.field.target() {
            Some(target) if target.is_tenant_scoped() => Ok((location.path, location.field.clone())),
            _ => Err(ConfigurationError::NotARelation {
                model: self.model.schema_id().to_string(),
                field: field.to_string(),
            }),
        }
    }

    fn auto_junction(
        &self,
        field: &str,
    ) -> Result<(Vec<usize>, ConcreteField, crate::concrete::Junction), ConfigurationError> {
        let (path, concrete) = self.relation(field)?;
        let Some(junction) = concrete.junction().cloned() else {
            return Err(ConfigurationError::NotARelation {
                model: self.model.schema_id().to_string(),
                field: field.to_string(),
            });
        };
        if let Some(through) = junction.through_model() {
            return Err(ConfigurationError::ThroughAddNotAllowed {
                model: self.model.schema_id().to_string(),
                field: field.to_string(),
                through: through.to_string(),
            });
        }
        Ok((path, concrete, junction))
    }

    /// Ids of saved records of the relation's target model.
    fn target_ids(&self, concrete: &ConcreteField, targets: &[&Record]) -> Result<Vec<i64>, ConfigurationError> {
        let Some(target) = concrete.target() else {
            return Ok(Vec::new());
        };
        targets
            .iter()
            .map(|record| {
                let matches = record.model.declaration() == &target.model
                    && record.model.tenant_id() == self.model.tenant_id();
                match (matches, record.id) {
                    (true, Some(id)) => Ok(id),
                    _ => Err(ConfigurationError::RecordModelMismatch {
                        expected: target.label.clone(),
                        found: record.model.schema_id().to_string(),
                    }),
                }
            })
            .collect()
    }

    async fn target_manager(&self, concrete: &ConcreteField) -> Result<TenantManager, TenancyError> {
        let target = concrete
            .target()
            .ok_or_else(|| self.unknown_field(&concrete.name))?;
        let model = self
            .registry
            .get_or_create(&target.model, self.model.tenant_id())
            .await?;
        Ok(TenantManager::new(model, self.registry.clone()))
    }

    /// `SELECT id FROM table WHERE ...` for this model.
    fn select_ids(&self, filter: &Filter) -> Result<SelectStatement, TenancyError> {
        let table = Alias::new(self.model.table_name());
        let mut select = Query::select();
        select
            .column((table.clone(), Alias::new(PRIMARY_KEY)))
            .from(table);
        for condition in &filter.conditions {
            select.and_where(self.condition(condition)?);
        }
        Ok(select)
    }

    fn condition(&self, condition: &Condition) -> Result<SimpleExpr, TenancyError> {
        match condition {
            Condition::IdIn(ids) => Ok(Expr::col((
                Alias::new(self.model.table_name()),
                Alias::new(PRIMARY_KEY),
            ))
            .is_in(ids.iter().copied())),
            Condition::Eq(name, value) if name == PRIMARY_KEY || name == "pk" => {
                let id = value
                    .as_i64()
                    .ok_or_else(|| ValidationError::new(PRIMARY_KEY, format!("'{value}' value must be an integer.")))?;
                Ok(Expr::col((Alias::new(self.model.table_name()), Alias::new(PRIMARY_KEY))).eq(id))
            }
            Condition::Eq(name, value) => {
                let location = self
                    .model
                    .locate(name)
                    .ok_or_else(|| self.unknown_field(name))?;
                let mut expr = field_condition(location.owner, location.field, value)?;

                // Walk back down from the owning ancestor to this model.
                let mut chain: Vec<&ConcreteModel> = vec![self.model.as_ref()];
                for index in &location.path {
                    let current = chain[chain.len() - 1];
                    chain.push(current.parents()[*index].model.as_ref());
                }
                for (step, index) in location.path.iter().enumerate().rev() {
                    let child = chain[step];
                    let parent = chain[step + 1];
                    let ptr_column = &child.parents()[*index].ptr_column;
                    let parents = Query::select()
                        .column((Alias::new(parent.table_name()), Alias::new(PRIMARY_KEY)))
                        .from(Alias::new(parent.table_name()))
                        .and_where(expr)
                        .to_owned();
                    expr = Expr::col((Alias::new(child.table_name()), Alias::new(ptr_column.as_str())))
                        .in_subquery(parents);
                }
                Ok(expr)
            }
        }
    }
}

/// Stored fields of a model and its concrete ancestors, nearest first.
fn stored_fields(model: &ConcreteModel) -> Vec<&ConcreteField> {
    let mut fields: Vec<&ConcreteField> = model
        .fields()
        .iter()
        .filter(|field| field.column().is_some())
        .collect();
    for parent in model.parents() {
        for field in stored_fields(&parent.model) {
            if !fields.iter().any(|existing| existing.name == field.name) {
                fields.push(field);
            }
        }
    }
    fields
}

fn field_condition(
    owner: &ConcreteModel,
    field: &ConcreteField,
    value: &JsonValue,
) -> Result<SimpleExpr, TenancyError> {
    let table = Alias::new(owner.table_name());
    match &field.kind {
        ConcreteKind::Column { column, .. } | ConcreteKind::ForeignKey { column, .. } => {
            let column_ref = (table, Alias::new(column.as_str()));
            if value.is_null() {
                return Ok(Expr::col(column_ref).is_null());
            }
            let column_type = field.column_type().unwrap_or(ColumnType::BigInteger);
            let value = to_db_value(column_type, value).map_err(|message| ValidationError::new(&field.name, message))?;
            Ok(Expr::col(column_ref).eq(value))
        }
        ConcreteKind::ManyToMany { target, junction } => {
            let value = to_db_value(target.primary_key, value)
                .map_err(|message| ValidationError::new(&field.name, message))?;
            let linked = Query::select()
                .column(Alias::new(junction.source_column()))
                .from(Alias::new(junction.table()))
                .and_where(Expr::col(Alias::new(junction.target_column())).eq(value))
                .to_owned();
            Ok(Expr::col((table, Alias::new(PRIMARY_KEY))).in_subquery(linked))
        }
    }
}

/// Id of the row of the ancestor reached by following `path` from `model`'s row `id`.
async fn ancestor_id<C: ConnectionTrait>(
    conn: &C,
    model: &ConcreteModel,
    path: &[usize],
    id: i64,
) -> Result<Option<i64>, DbErr> {
    let mut current = model;
    let mut current_id = id;
    for index in path {
        let parent = &current.parents()[*index];
        let Some(next) = pointer(conn, current, &parent.ptr_column, current_id).await? else {
            return Ok(None);
        };
        current = &parent.model;
        current_id = next;
    }
    Ok(Some(current_id))
}

async fn pointer<C: ConnectionTrait>(
    conn: &C,
    model: &ConcreteModel,
    ptr_column: &str,
    id: i64,
) -> Result<Option<i64>, DbErr> {
    let select = Query::select()
        .column(Alias::new(ptr_column))
        .from(Alias::new(model.table_name()))
        .and_where(Expr::col(Alias::new(PRIMARY_KEY)).eq(id))
        .to_owned();
    let backend = conn.get_database_backend();
    conn.query_one(backend.build(&select))
        .await?
        .map(|row| row.try_get::<i64>("", ptr_column))
        .transpose()
}

/// Inserts parents first; a child row takes its first parent's id.
fn insert_row<'a>(
    txn: &'a DatabaseTransaction,
    model: &'a ConcreteModel,
    values: &'a BTreeMap<String, JsonValue>,
) -> BoxFuture<'a, Result<i64, TenancyError>> {
    Box::pin(async move {
        let mut columns: Vec<Alias> = Vec::new();
        let mut row: Vec<SimpleExpr> = Vec::new();

        for (index, parent) in model.parents().iter().enumerate() {
            let parent_id = insert_row(txn, &parent.model, values).await?;
            if index == 0 {
                columns.push(Alias::new(PRIMARY_KEY));
                row.push(parent_id.into());
            }
            columns.push(Alias::new(parent.ptr_column.as_str()));
            row.push(parent_id.into());
        }

        for field in model.fields() {
            let (Some(column), Some(column_type)) = (field.column(), field.column_type()) else {
                continue;
            };
            let value = values.get(&field.name).unwrap_or(&JsonValue::Null);
            let value = to_db_value(column_type, value).map_err(|message| ValidationError::new(&field.name, message))?;
            columns.push(Alias::new(column));
            row.push(value.into());
        }

        let mut insert = Query::insert();
        insert.into_table(Alias::new(model.table_name()));
        if columns.is_empty() {
            insert.or_default_values();
        } else {
            insert
                .columns(columns)
                .values(row)
                .map_err(|err| DbErr::Custom(err.to_string()))?;
        }
        insert.returning_col(Alias::new(PRIMARY_KEY));

        let backend = txn.get_database_backend();
        let inserted = txn
            .query_one(backend.build(&insert))
            .await?
            .ok_or(DbErr::RecordNotInserted)?;
        Ok(inserted.try_get::<i64>("", PRIMARY_KEY)?)
    })
}

fn update_row<'a>(
    txn: &'a DatabaseTransaction,
    model: &'a ConcreteModel,
    id: i64,
    values: &'a BTreeMap<String, JsonValue>,
) -> BoxFuture<'a, Result<(), TenancyError>> {
    Box::pin(async move {
        let mut assignments: Vec<(Alias, SimpleExpr)> = Vec::new();
        for field in model.fields() {
            let (Some(column), Some(column_type)) = (field.column(), field.column_type()) else {
                continue;
            };
            let value = values.get(&field.name).unwrap_or(&JsonValue::Null);
            let value = to_db_value(column_type, value).map_err(|message| ValidationError::new(&field.name, message))?;
            assignments.push((Alias::new(column), value.into()));
        }

        let backend = txn.get_database_backend();
        if !assignments.is_empty() {
            let update = Query::update()
                .table(Alias::new(model.table_name()))
                .values(assignments)
                .and_where(Expr::col(Alias::new(PRIMARY_KEY)).eq(id))
                .to_owned();
            let result = txn.execute(backend.build(&update)).await?;
            if result.rows_affected() == 0 {
                return Err(DbErr::RecordNotUpdated.into());
            }
        }

        for parent in model.parents() {
            if let Some(parent_id) = pointer(txn, model, &parent.ptr_column, id).await? {
                update_row(txn, &parent.model, parent_id, values).await?;
            }
        }
        Ok(())
    })
}

fn delete_row<'a>(txn: &'a DatabaseTransaction, model: &'a ConcreteModel, id: i64) -> BoxFuture<'a, Result<(), TenancyError>> {
    Box::pin(async move {
        let mut parent_ids = Vec::with_capacity(model.parents().len());
        for parent in model.parents() {
            parent_ids.push(pointer(txn, model, &parent.ptr_column, id).await?);
        }

        let backend = txn.get_database_backend();
        for (_, junction) in model.auto_junctions() {
            let delete = Query::delete()
                .from_table(Alias::new(junction.table()))
                .and_where(Expr::col(Alias::new(junction.source_column())).eq(id))
                .to_owned();
            txn.execute(backend.build(&delete)).await?;
        }

        let delete = Query::delete()
            .from_table(Alias::new(model.table_name()))
            .and_where(Expr::col(Alias::new(PRIMARY_KEY)).eq(id))
            .to_owned();
        txn.execute(backend.build(&delete)).await?;

        for (parent, parent_id) in model.parents().iter().zip(parent_ids) {
            if let Some(parent_id) = parent_id {
                delete_row(txn, &parent.model, parent_id).await?;
            }
        }
        Ok(())
    })
}

/// Reads one row and, recursively, its parent rows.
fn load_row<'a, C: ConnectionTrait>(
    conn: &'a C,
    model: &'a ConcreteModel,
    id: i64,
) -> BoxFuture<'a, Result<Option<BTreeMap<String, JsonValue>>, TenancyError>> {
    Box::pin(async move {
        let mut select = Query::select();
        select
            .column(Alias::new(PRIMARY_KEY))
            .from(Alias::new(model.table_name()))
            .and_where(Expr::col(Alias::new(PRIMARY_KEY)).eq(id));
        for parent in model.parents() {
            select.column(Alias::new(parent.ptr_column.as_str()));
        }
        for field in model.fields() {
            if let Some(column) = field.column() {
                select.column(Alias::new(column));
            }
        }

        let backend = conn.get_database_backend();
        let Some(row) = conn.query_one(backend.build(&select)).await? else {
            return Ok(None);
        };

        let mut values = BTreeMap::new();
        for field in model.fields() {
            if let (Some(column), Some(column_type)) = (field.column(), field.column_type()) {
                values.insert(field.name.clone(), read_column(&row, column, column_type)?);
            }
        }

        for parent in model.parents() {
            let parent_id: i64 = row.try_get("", &parent.ptr_column)?;
            if let Some(inherited) = load_row(conn, &parent.model, parent_id).await? {
                for (name, value) in inherited {
                    values.entry(name).or_insert(value);
                }
            }
        }
        Ok(Some(values))
    })
}

/// Converts a JSON value to a bind value of `column_type`, or explains why it cannot.
pub(crate) fn to_db_value(column_type: ColumnType, value: &JsonValue) -> Result<Value, String> {
    let invalid = || format!("'{value}' value must be {}.", column_type.describe());

    if value.is_null() {
        return Ok(match column_type {
            ColumnType::Text => Value::String(None),
            ColumnType::Integer => Value::Int(None),
            ColumnType::BigInteger => Value::BigInt(None),
            ColumnType::Boolean => Value::Bool(None),
            ColumnType::Float => Value::Double(None),
            ColumnType::Uuid => Value::Uuid(None),
            ColumnType::Timestamp => Value::ChronoDateTimeUtc(None),
            ColumnType::Date => Value::ChronoDate(None),
            ColumnType::Json => Value::Json(None),
        });
    }

    match column_type {
        ColumnType::Text => value
            .as_str()
            .map(|text| Value::String(Some(Box::new(text.to_string()))))
            .ok_or_else(invalid),
        ColumnType::Integer => value
            .as_i64()
            .and_then(|number| i32::try_from(number).ok())
            .map(|number| Value::Int(Some(number)))
            .ok_or_else(invalid),
        ColumnType::BigInteger => value
            .as_i64()
            .map(|number| Value::BigInt(Some(number)))
            .ok_or_else(invalid),
        ColumnType::Boolean => value
            .as_bool()
            .map(|flag| Value::Bool(Some(flag)))
            .ok_or_else(invalid),
        ColumnType::Float => value
            .as_f64()
            .map(|number| Value::Double(Some(number)))
            .ok_or_else(invalid),
        ColumnType::Uuid => value
            .as_str()
            .and_then(|text| Uuid::parse_str(text).ok())
            .map(|uuid| Value::Uuid(Some(Box::new(uuid))))
            .ok_or_else(invalid),
        ColumnType::Timestamp => value
            .as_str()
            .and_then(|text| DateTime::parse_from_rfc3339(text).ok())
            .map(|timestamp| Value::ChronoDateTimeUtc(Some(Box::new(timestamp.with_timezone(&Utc)))))
            .ok_or_else(invalid),
        ColumnType::Date => value
            .as_str()
            .and_then(|text| NaiveDate::parse_from_str(text, "%Y-%m-%d").ok())
            .map(|date| Value::ChronoDate(Some(Box::new(date))))
            .ok_or_else(invalid),
        ColumnType::Json => Ok(Value::Json(Some(Box::new(value.clone())))),
    }
}

fn read_column(row: &QueryResult, column: &str, column_type: ColumnType) -> Result<JsonValue, DbErr> {
    let value = match column_type {
        ColumnType::Text => row.try_get::<Option<String>>("", column)?.map(JsonValue::String),
        ColumnType::Integer => row.try_get::<Option<i32>>("", column)?.map(JsonValue::from),
        ColumnType::BigInteger => row.try_get::<Option<i64>>("", column)?.map(JsonValue::from),
        ColumnType::Boolean => row.try_get::<Option<bool>>("", column)?.map(JsonValue::Bool),
        ColumnType::Float => row.try_get::<Option<f64>>("", column)?.map(JsonValue::from),
        ColumnType::Uuid => row
            .try_get::<Option<Uuid>>("", column)?
            .map(|uuid| JsonValue::String(uuid.to_string())),
        ColumnType::Timestamp => row
            .try_get::<Option<DateTime<Utc>>>("", column)?
            .map(|timestamp| JsonValue::String(timestamp.to_rfc3339())),
        ColumnType::Date => row
            .try_get::<Option<NaiveDate>>("", column)?
            .map(|date| JsonValue::String(date.to_string())),
        ColumnType::Json => row.try_get::<Option<JsonValue>>("", column)?,
    };
    Ok(value.unwrap_or(JsonValue::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_values_convert_per_column_type() {
        assert_eq!(
            to_db_value(ColumnType::Text, &json!("acme")).unwrap(),
            Value::String(Some(Box::new("acme".to_string())))
        );
        assert_eq!(to_db_value(ColumnType::Integer, &json!(7)).unwrap(), Value::Int(Some(7)));
        assert_eq!(to_db_value(ColumnType::Integer, &json!(null)).unwrap(), Value::Int(None));
        assert!(matches!(
            to_db_value(ColumnType::Timestamp, &json!("2024-05-01T10:00:00+02:00")).unwrap(),
            Value::ChronoDateTimeUtc(Some(_))
        ));
    }

    #[test]
    fn mismatched_values_explain_expected_type() {
        assert_eq!(
            to_db_value(ColumnType::Integer, &json!("seven")).unwrap_err(),
            "'\"seven\"' value must be an integer."
        );
        assert!(to_db_value(ColumnType::Integer, &json!(i64::MAX)).is_err());
        assert!(to_db_value(ColumnType::Uuid, &json!("not-a-uuid")).is_err());
        assert!(to_db_value(ColumnType::Date, &json!("01/05/2024")).is_err());
    }

    #[test]
    fn filters_accumulate_conditions() {
        let filter = Filter::new().eq("label", "a").id_in([1, 2]);
        assert_eq!(
            filter.conditions,
            vec![
                Condition::Eq("label".to_string(), json!("a")),
                Condition::IdIn(vec![1, 2]),
            ]
        );
    }
}
