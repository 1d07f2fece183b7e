//! pixtag-pp (push products)
//!
//! `serve` runs the trigger endpoint and the queue delivery runner.
//! `run-once` performs a single select/dispatch cycle and delivers until the
//! queue drains. `ingest` loads a JSON-lines product file as a new catalog
//! batch.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pixtag_common::api::auth::load_shared_secret;
use pixtag_common::catalog::{parse_json_lines, CatalogStore};
use pixtag_common::config::PixtagConfig;
use pixtag_common::db::init_database;
use pixtag_common::logging::init_tracing;
use pixtag_common::queue::SqliteTaskQueue;
use pixtag_common::selector::{plan_dispatch, ProductFilter, SelectorOptions};
use pixtag_pp::{build_router, task_deadline, AppState, DeliveryRunner, Dispatcher};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "pixtag-pp", version, about = "Select and dispatch product images for classification")]
struct Cli {
    /// Configuration file (overrides PIXTAG_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the trigger endpoint and deliver queued tasks
    Serve,

    /// Run one selection and dispatch cycle, then deliver until the queue drains
    RunOnce {
        /// Maximum number of products (configured default if absent)
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        category_prefix: Option<String>,
        /// Restrict to a brand; repeatable
        #[arg(long = "brand")]
        brands: Vec<String>,
        /// Restrict to an offer id; repeatable
        #[arg(long = "offer-id")]
        offer_ids: Vec<String>,
        /// Re-select images that already have results
        #[arg(long)]
        include_classified: bool,
        /// Enqueue only; leave delivery to a running `serve`
        #[arg(long)]
        no_deliver: bool,
    },

    /// Load newline-delimited product JSON as a new catalog batch
    Ingest {
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = PixtagConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.logging.level);

    info!(
        "Starting pixtag-pp v{} [{}] built {} ({})",
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

    match cli.command {
        Command::Serve => serve(pool, config).await,
        Command::RunOnce {
            limit,
            category_prefix,
            brands,
            offer_ids,
            include_classified,
            no_deliver,
        } => {
            let filter = ProductFilter {
                category_prefix,
                brands: (!brands.is_empty()).then_some(brands),
                offer_ids: (!offer_ids.is_empty()).then_some(offer_ids),
                limit: Some(limit.unwrap_or(config.dispatch.product_limit)),
            };
            let options = SelectorOptions {
                exclude_classified: config.dispatch.exclude_classified && !include_classified,
            };
            run_once(pool, config, options, filter, !no_deliver).await
        }
        Command::Ingest { file } => ingest(pool, config, file).await,
    }
}

async fn delivery_runner(pool: &SqlitePool, config: &PixtagConfig) -> Result<DeliveryRunner> {
    let shared_secret = load_shared_secret(pool).await?;
    if shared_secret == 0 {
        warn!("Callback signing disabled (shared_secret = 0)");
    }

    Ok(DeliveryRunner::new(
        SqliteTaskQueue::new(pool.clone(), config.queue.id.clone()),
        shared_secret,
        config.retry_policy(),
        config.rate_limits(),
        Duration::from_millis(config.queue.poll_interval_ms),
    )?)
}

async fn serve(pool: SqlitePool, config: PixtagConfig) -> Result<()> {
    let runner = delivery_runner(&pool, &config).await?;
    let bind = config.dispatch.bind.clone();

    let state = AppState::new(pool, config);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!("pixtag-pp listening on http://{}", bind);
    info!("Health check: http://{}/health", bind);

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let delivery = tokio::spawn(async move {
        let mut stop_rx = stop_rx;
        runner
            .run(async move {
                let _ = stop_rx.changed().await;
            })
            .await
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    let _ = stop_tx.send(true);
    match delivery.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Delivery runner failed: {}", e),
        Err(e) => error!("Delivery runner panicked: {}", e),
    }

    Ok(())
}

async fn run_once(
    pool: SqlitePool,
    config: PixtagConfig,
    options: SelectorOptions,
    filter: ProductFilter,
    deliver: bool,
) -> Result<()> {
    let queue = Arc::new(SqliteTaskQueue::new(pool.clone(), config.queue.id.clone()));
    let dispatcher = Dispatcher::new(queue, task_deadline(&config));

    let planned = plan_dispatch(
        &pool,
        &config.catalog.table,
        &config.results.table,
        &options,
        &filter,
    )
    .await?;
    let dispatched = dispatcher
        .dispatch(&planned, &config.dispatch.worker_url)
        .await?;
    info!(selected = planned.len(), dispatched, "Dispatch cycle complete");

    if deliver && dispatched > 0 {
        let stats = delivery_runner(&pool, &config).await?.run_until_idle().await?;
        info!(
            acked = stats.acked,
            retried = stats.retried,
            dead_lettered = stats.dead_lettered,
            "Queue drained"
        );
    }

    Ok(())
}

async fn ingest(pool: SqlitePool, config: PixtagConfig, file: PathBuf) -> Result<()> {
    let content = std::fs::read_to_string(&file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let products = parse_json_lines(&content)?;

    let store = CatalogStore::new(pool, &config.catalog.table)?;
    let batch = store.ingest_batch(&products).await?;
    info!(
        "Ingested {} products from {} as batch {}",
        products.len(),
        file.display(),
        batch
    );
    Ok(())
}
