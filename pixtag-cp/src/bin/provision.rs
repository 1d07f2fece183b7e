//! pixtag-provision
//!
//! Compiles the type description, prints the resulting warehouse schema and
//! creates the results table. An existing table with a different column set
//! is left untouched and reported; it has to be dropped or renamed by hand.

use anyhow::{Context, Result};
use clap::Parser;
use pixtag_common::config::PixtagConfig;
use pixtag_common::db::init_database;
use pixtag_common::logging::init_tracing;
use pixtag_common::results::ResultsStore;
use pixtag_common::schema::compile_file;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "pixtag-provision", version, about = "Compile the output type description and provision the results table")]
struct Cli {
    /// Configuration file (overrides PIXTAG_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Type description to compile (defaults to worker.type_description)
    #[arg(long)]
    type_description: Option<PathBuf>,

    /// Print the schemas without touching the database
    #[arg(long)]
    dry_run: bool,

    /// Also print the structured-output schema sent to the model
    #[arg(long)]
    show_response_schema: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = PixtagConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.logging.level);

    let description = cli
        .type_description
        .unwrap_or_else(|| config.worker.type_description.clone());
    let schema = compile_file(&description)
        .with_context(|| format!("Failed to compile {}", description.display()))?;
    info!(
        "Compiled {} ({} fields) from {}",
        schema.name(),
        schema.fields().len(),
        description.display()
    );

    println!("{}", serde_json::to_string_pretty(&schema.warehouse_schema())?);
    if cli.show_response_schema {
        println!("{}", serde_json::to_string_pretty(&schema.response_schema())?);
    }

    if cli.dry_run {
        return Ok(());
    }

    let db_path = config.database_path();
    let pool = init_database(&db_path)
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;

    let store = ResultsStore::provision(pool, &config.results.table, schema).await?;
    info!(
        "✓ Results table '{}' ready in {}",
        store.table(),
        db_path.display()
    );

    Ok(())
}
