//! Command-line interface of the `tenancy` binary.

use clap::{Parser, Subcommand};
use thiserror::Error;
use uuid::Uuid;

use crate::error::TenancyError;
use crate::repositories::CreateTenantRequest;
use crate::tenancy::Tenancy;

/// Fields of the tenant model, in positional-argument order.
pub const TENANT_FIELDS: &[&str] = &["name"];

#[derive(Debug, Parser)]
#[command(name = "tenancy")]
#[command(about = "Manage tenants and their per-tenant tables")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Apply pending migrations of the shared tables
    Migrate,
    /// Create a tenant from positional field values
    CreateTenant {
        /// Values in field order (name)
        values: Vec<String>,
    },
    /// Delete a tenant and drop every table created for it
    DeleteTenant { id: Uuid },
    /// List tenants by name
    ListTenants,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(
        "Number of args exceeds the number of fields for model {model}.\nGot {got:?} when defined fields are {fields:?}."
    )]
    TooManyArgs {
        model: String,
        got: Vec<String>,
        fields: Vec<String>,
    },
    #[error(transparent)]
    Tenancy(#[from] TenancyError),
}

/// Maps positional values onto the tenant fields. Missing values are empty,
/// so they fail validation as blank.
pub fn tenant_request_from_args(model: &str, args: &[String]) -> Result<CreateTenantRequest, CommandError> {
    if args.len() > TENANT_FIELDS.len() {
        return Err(CommandError::TooManyArgs {
            model: model.to_string(),
            got: args.to_vec(),
            fields: TENANT_FIELDS.iter().map(|field| field.to_string()).collect(),
        });
    }

    Ok(CreateTenantRequest {
        name: args.first().cloned().unwrap_or_default(),
    })
}

/// Runs a command that needs the tenancy facade; returns what to print.
pub async fn run(command: Command, tenancy: &Tenancy) -> Result<String, CommandError> {
    match command {
        Command::Migrate => Ok("Migrations applied.".to_string()),
        Command::CreateTenant { values } => {
            let request = tenant_request_from_args(&tenancy.tenant_model().label(), &values)?;
            let handle = tenancy.create_tenant(request).await?;
            Ok(format!("Created tenant {} ({})", handle.tenant().name, handle.id()))
        }
        Command::DeleteTenant { id } => {
            tenancy.delete_tenant(id).await?;
            Ok(format!("Deleted tenant {id}"))
        }
        Command::ListTenants => {
            let tenants = tenancy.tenants().await?;
            Ok(tenants
                .iter()
                .map(|handle| format!("{}\t{}", handle.id(), handle.tenant().name))
                .collect::<Vec<_>>()
                .join("\n"))
        }
    }
}
