//! Error taxonomy for the tenancy engine.
//!
//! Configuration errors are surfaced immediately and never retried, synthesis
//! errors carry the declaration, tenant and failed step, and validation errors
//! are the user-facing messages produced at the record and CLI boundary.

use std::fmt;

use sea_orm::DbErr;
use thiserror::Error;
use uuid::Uuid;

/// Top-level error returned by the registry, managers and the facade.
#[derive(Debug, Error)]
pub enum TenancyError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Synthesis(#[from] SynthesisError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("tenant {tenant_id} does not exist")]
    TenantNotFound { tenant_id: Uuid },
    #[error("database error: {0}")]
    Database(#[from] DbErr),
}

impl TenancyError {
    /// Returns the validation failure, if this error is one.
    pub fn as_validation(&self) -> Option<&ValidationError> {
        match self {
            TenancyError::Validation(err) => Some(err),
            _ => None,
        }
    }
}

/// Misconfiguration of settings, declarations or relations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("TENANCY_TENANT_MODEL must be of the form 'app_label.model_name'")]
    MalformedTenantModel { value: String },
    #[error("TENANCY_TENANT_MODEL refers to model '{value}' that has not been installed")]
    TenantModelNotInstalled { value: String },
    #[error(
        "TENANCY_TENANT_MODEL refers to models '{value}' which is not a subclass of 'tenancy.AbstractTenant'"
    )]
    NotATenantModel { value: String },
    #[error("'{model}' is not a tenant-aware model")]
    NotTenantAware { model: String },
    #[error("'{declaration}' uses name '{name}', which must not contain '__' or start or end with '_'")]
    InvalidName { declaration: String, name: String },
    #[error("model '{model}' is already installed")]
    DuplicateDeclaration { model: String },
    #[error("tenant descriptor '{name}' is already installed for '{existing}', cannot install it for '{model}'")]
    DescriptorConflict {
        name: String,
        existing: String,
        model: String,
    },
    #[error("no tenant descriptor named '{name}'")]
    UnknownDescriptor { name: String },
    #[error("field '{field}' of '{declaration}' refers to '{target}' which cannot be resolved")]
    UnresolvedRelation {
        declaration: String,
        field: String,
        target: String,
    },
    #[error("field '{field}' of '{declaration}' refers to abstract model '{target}'")]
    AbstractRelationTarget {
        declaration: String,
        field: String,
        target: String,
    },
    #[error(
        "field '{field}' of '{declaration}' uses '{through}' as intermediary model, which has no foreign key to '{endpoint}'"
    )]
    ThroughFieldMissing {
        declaration: String,
        field: String,
        through: String,
        endpoint: String,
    },
    #[error("field '{field}' of '{declaration}' uses '{through}' as intermediary model, which is not tenant-aware")]
    SharedThroughModel {
        declaration: String,
        field: String,
        through: String,
    },
    #[error("'{declaration}' refers to parent '{parent}' which cannot be resolved")]
    UnresolvedParent { declaration: String, parent: String },
    #[error("'{declaration}' cannot inherit from concrete shared model '{parent}'")]
    UnsupportedParent { declaration: String, parent: String },
    #[error("'{declaration}' inherits from itself")]
    InheritanceCycle { declaration: String },
    #[error("'{declaration}' declares field '{field}' more than once")]
    DuplicateField { declaration: String, field: String },
    #[error("'{declaration}' orders by '{field}' which is not one of its columns")]
    InvalidOrdering { declaration: String, field: String },
    #[error("'{declaration}' has unique_together on '{field}' which is not one of its columns")]
    InvalidUniqueTogether { declaration: String, field: String },
    #[error("'{model}' has no field named '{field}'")]
    UnknownField { model: String, field: String },
    #[error("field '{field}' of '{model}' does not relate to a tenant model")]
    NotARelation { model: String, field: String },
    #[error("expected a record of '{expected}', got one of '{found}'")]
    RecordModelMismatch { expected: String, found: String },
    #[error(
        "cannot add to '{field}' of '{model}' directly because it specifies an intermediary model; create '{through}' rows instead"
    )]
    ThroughAddNotAllowed {
        model: String,
        field: String,
        through: String,
    },
}

/// The step of synthesis that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisStep {
    TenantLookup,
    CreateTable,
    CreateIndex,
    CreateForeignKey,
    RegisterMetadata,
    Commit,
}

impl fmt::Display for SynthesisStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            SynthesisStep::TenantLookup => "tenant lookup",
            SynthesisStep::CreateTable => "create table",
            SynthesisStep::CreateIndex => "create index",
            SynthesisStep::CreateForeignKey => "create foreign key",
            SynthesisStep::RegisterMetadata => "register metadata",
            SynthesisStep::Commit => "commit",
        };
        f.write_str(step)
    }
}

/// Schema creation or registration failed for a (declaration, tenant) pair.
#[derive(Debug, Error)]
#[error("failed to synthesize '{declaration}' for tenant {tenant_id} during {step}: {source}")]
pub struct SynthesisError {
    pub declaration: String,
    pub tenant_id: Uuid,
    pub step: SynthesisStep,
    #[source]
    pub source: DbErr,
}

impl SynthesisError {
    pub fn new(declaration: impl Into<String>, tenant_id: Uuid, step: SynthesisStep, source: DbErr) -> Self {
        Self {
            declaration: declaration.into(),
            tenant_id,
            step,
            source,
        }
    }
}

/// A field value was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid value for field \"{field}\": {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn blank(field: impl Into<String>) -> Self {
        Self::new(field, "This field cannot be blank.")
    }

    pub fn null(field: impl Into<String>) -> Self {
        Self::new(field, "This field cannot be null.")
    }
}

const PG_UNIQUE: &str = "23505";
const PG_DUPLICATE_TABLE: &str = "42P07";
const PG_DUPLICATE_OBJECT: &str = "42710";
const SQLITE_DUPLICATE_CODES: &[&str] = &["1555", "2067"];

fn database_error(error: &DbErr) -> Option<&(dyn sea_orm::sqlx::error::DatabaseError + 'static)> {
    use sea_orm::RuntimeErr;

    match error {
        DbErr::Query(RuntimeErr::SqlxError(sqlx_err)) | DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => {
            sqlx_err.as_database_error()
        }
        _ => None,
    }
}

/// True when the database rejected a write because of a unique constraint.
pub fn is_unique_violation(error: &DbErr) -> bool {
    let Some(db_error) = database_error(error) else {
        return false;
    };

    if db_error.is_unique_violation() {
        return true;
    }

    db_error.code().is_some_and(|code| {
        let code = code.as_ref();
        code == PG_UNIQUE || SQLITE_DUPLICATE_CODES.contains(&code)
    })
}

/// True when DDL failed because the table, index or constraint is already there.
pub fn is_already_exists(error: &DbErr) -> bool {
    if let Some(db_error) = database_error(error) {
        if let Some(code) = db_error.code() {
            let code = code.as_ref();
            if code == PG_DUPLICATE_TABLE || code == PG_DUPLICATE_OBJECT {
                return true;
            }
        }
        return db_error.message().contains("already exists");
    }

    error.to_string().contains("already exists")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_formats_field_and_message() {
        let err = ValidationError::blank("name");
        assert_eq!(
            err.to_string(),
            "Invalid value for field \"name\": This field cannot be blank."
        );
    }

    #[test]
    fn synthesis_error_names_declaration_tenant_and_step() {
        let tenant_id = Uuid::new_v4();
        let err = SynthesisError::new(
            "tests.SpecificModel",
            tenant_id,
            SynthesisStep::CreateTable,
            DbErr::Custom("boom".to_string()),
        );
        let message = err.to_string();
        assert!(message.contains("tests.SpecificModel"));
        assert!(message.contains(&tenant_id.to_string()));
        assert!(message.contains("create table"));
    }

    #[test]
    fn tenant_model_errors_name_the_setting_value() {
        let err = ConfigurationError::NotATenantModel {
            value: "contenttypes.ContentType".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "TENANCY_TENANT_MODEL refers to models 'contenttypes.ContentType' which is not a subclass of 'tenancy.AbstractTenant'"
        );

        let err = ConfigurationError::TenantModelNotInstalled {
            value: "not.Installed".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "TENANCY_TENANT_MODEL refers to model 'not.Installed' that has not been installed"
        );
    }

    #[test]
    fn custom_errors_are_not_unique_violations() {
        let err = DbErr::Custom("duplicate".to_string());
        assert!(!is_unique_violation(&err));
    }

    #[test]
    fn already_exists_falls_back_to_message() {
        let err = DbErr::Custom("table \"t\" already exists".to_string());
        assert!(is_already_exists(&err));
        assert!(!is_already_exists(&DbErr::Custom("syntax error".to_string())));
    }

    #[test]
    fn tenancy_error_exposes_validation() {
        let err: TenancyError = ValidationError::null("label").into();
        assert_eq!(err.as_validation().map(|e| e.field.as_str()), Some("label"));
        let err: TenancyError = DbErr::Custom("x".to_string()).into();
        assert!(err.as_validation().is_none());
    }
}
