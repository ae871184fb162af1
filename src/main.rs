use anyhow::Result;
use media_store::config::{AppConfig, ResizeConfig};
use media_store::services::{ResizeHooks, ResizeService, RetryPolicy, StorageGateway};
use media_store::storage::LocalStore;
use media_store::BatchResizeItem;
use sqlx::sqlite::SqlitePoolOptions;
use std::{fs, path::Path, sync::Arc};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + args ---
    let (cfg, args) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting media-store batch tool with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("file:");
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    // SQLx will not create the database file on its own.
    match fs::OpenOptions::new().create(true).write(true).open(db_path) {
        Ok(_) => tracing::debug!("Database file is writable."),
        Err(e) => tracing::warn!("Failed to open database file {}: {}", db_path, e),
    }

    let db: Arc<sqlx::Pool<sqlx::Sqlite>> = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await?,
    );

    // --- Handle migration mode ---
    if args.migrate {
        run_migrations(&db).await?;
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    // --- Initialize the engine ---
    let store = Arc::new(LocalStore::new(db, cfg.storage_dir.clone()));
    let gateway = Arc::new(StorageGateway::new(store, RetryPolicy::default()));
    let resize_cfg = Arc::new(ResizeConfig::from_env()?);
    let service = ResizeService::new(gateway, resize_cfg, ResizeHooks::default());

    if args.keys.is_empty() || args.widths.is_empty() {
        tracing::info!("Nothing to do: pass --key and --width to pre-generate variants.");
        return Ok(());
    }

    let items: Vec<BatchResizeItem> = args
        .keys
        .iter()
        .map(|key| BatchResizeItem {
            key: key.clone(),
            widths: args.widths.clone(),
        })
        .collect();

    let outcomes = service.batch_resize(&items).await;
    let mut failures = 0usize;
    for outcome in &outcomes {
        if outcome.success {
            tracing::info!(
                key = %outcome.key,
                width = outcome.width,
                variant = outcome.variant_key.as_deref().unwrap_or(""),
                "variant generated"
            );
        } else {
            failures += 1;
            tracing::warn!(
                key = %outcome.key,
                width = outcome.width,
                error = outcome.error.as_deref().unwrap_or("unknown"),
                "variant generation failed"
            );
        }
    }
    tracing::info!(
        "Batch complete: {} variants, {} failures.",
        outcomes.len() - failures,
        failures
    );

    Ok(())
}

/// Run SQLite migrations manually from the embedded SQL file.
async fn run_migrations(db: &Arc<sqlx::Pool<sqlx::Sqlite>>) -> Result<()> {
    let path = "migrations/0001_init.sql";

    if !Path::new(path).exists() {
        anyhow::bail!("Migration file not found: {}", path);
    }

    let sql = fs::read_to_string(path)?;
    let statements = sql
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::info!("Running {} migration statements...", statements.len());

    for stmt in statements {
        tracing::debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(&**db).await?;
    }

    Ok(())
}
