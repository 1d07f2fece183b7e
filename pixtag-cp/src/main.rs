//! pixtag-cp (classify product)
//!
//! Serves the classification worker endpoint. The results table must already
//! be provisioned (`pixtag-provision`).

use anyhow::{Context, Result};
use clap::Parser;
use pixtag_common::api::auth::{load_shared_secret, AuthWindow};
use pixtag_common::config::PixtagConfig;
use pixtag_common::db::init_database;
use pixtag_common::logging::init_tracing;
use pixtag_common::results::ResultsStore;
use pixtag_common::schema::compile_file;
use pixtag_cp::fetch::HttpImageFetcher;
use pixtag_cp::model::create_invoker;
use pixtag_cp::{build_router, AppState, ClassificationWorker};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "pixtag-cp", version, about = "Classify product images with a multimodal model")]
struct Cli {
    /// Configuration file (overrides PIXTAG_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = PixtagConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.logging.level);

    info!(
        "Starting pixtag-cp v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    let db_path = config.database_path();
    info!("Database path: {}", db_path.display());
    let pool = init_database(&db_path)
        .await
        .with_context(|| format!("Failed to open database {}", db_path.display()))?;

    let schema = compile_file(&config.worker.type_description).with_context(|| {
        format!(
            "Failed to compile type description {}",
            config.worker.type_description.display()
        )
    })?;
    let store = ResultsStore::open(pool.clone(), &config.results.table, schema).await?;
    info!(
        "✓ Results table '{}' matches schema {}",
        store.table(),
        store.schema().name()
    );

    let prompt_text = std::fs::read_to_string(&config.worker.prompt_file).with_context(|| {
        format!("Failed to read prompt file {}", config.worker.prompt_file.display())
    })?;

    let invoker = create_invoker(&config.model)?;
    info!("Model: {}", invoker.model_name());

    let fetcher = HttpImageFetcher::new(
        &config.worker.user_agent,
        Duration::from_secs(config.worker.fetch_timeout_secs),
    )?;

    let worker = ClassificationWorker::new(
        Arc::new(fetcher),
        Arc::from(invoker),
        store,
        prompt_text,
        Duration::from_secs(config.worker.task_timeout_secs),
    );

    let shared_secret = load_shared_secret(&pool).await?;
    if shared_secret == 0 {
        warn!("Task token checking disabled (shared_secret = 0)");
    } else {
        info!("✓ Loaded shared secret for task tokens");
    }
    let auth_window = AuthWindow::with_max_past(Duration::from_secs(config.worker.auth_window_secs));

    let state = AppState::new(worker, shared_secret, auth_window);
    let app = build_router(state);

    let bind = &config.worker.bind;
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!("pixtag-cp listening on http://{}", bind);
    info!("Health check: http://{}/health", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    Ok(())
}
