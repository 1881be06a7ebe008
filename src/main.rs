//! # Tenancy CLI Entry Point
//!
//! Loads configuration, applies the shared-table migrations and runs one
//! tenant-management command.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tenancy::cli::{self, Cli};
use tenancy::config::ConfigLoader;
use tenancy::schema::ModelCatalog;
use tenancy::{Tenancy, db, telemetry};
use tracing::debug;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let config = ConfigLoader::new().load().context("loading configuration")?;
    telemetry::init_tracing(&config).context("initializing telemetry")?;
    if let Ok(redacted) = config.redacted_json() {
        debug!(profile = %config.profile, config = %redacted, "loaded configuration");
    }

    let db = db::init_pool(&config)
        .await
        .context("initializing database connection pool")?;
    db::run_migrations(&db).await?;

    let tenancy = Tenancy::new(db, Arc::new(ModelCatalog::new()), &config)
        .context("validating tenant model setting")?;

    match cli::run(cli.command, &tenancy).await {
        Ok(output) => {
            if !output.is_empty() {
                println!("{output}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            eprintln!("{err}");
            Ok(ExitCode::FAILURE)
        }
    }
}
