use anyhow::{bail, Context};
use calsync::engine::{SyncEngine, SyncSettings};
use calsync::metrics::SyncMetrics;
use calsync::provider::Providers;
use calsync::store::Store;
use calsync::{migrate, web, AppConfig};
use clap::{Parser, Subcommand};
use prometheus::Registry;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sync all active configurations once
    Sync,

    /// Serve the operator web UI
    Serve {
        /// Address on which the web server will listen, overrides `SERVER__LISTEN_ADDR`
        #[arg(long, value_name = "HOST:PORT")]
        listen_addr: Option<SocketAddr>,

        /// Sync all active configurations every MINUTES in the background
        #[arg(long, value_name = "MINUTES", value_parser = clap::value_parser!(u64).range(1..))]
        sync_interval: Option<u64>,
    },

    /// Apply pending schema migrations
    Migrate {
        /// Only show applied and pending migrations
        #[arg(long)]
        status: bool,
    },
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = Cli::parse();

    let config = AppConfig::load().context("failed to load configuration")?;

    let store = Store::connect(&config.database_url)
        .await
        .with_context(|| format!("failed to open database {}", config.database_url))?;

    let result = match cli.command {
        Command::Migrate { status: true } => migration_status(&store).await,
        Command::Migrate { status: false } => {
            migrate::migrate(store.pool()).await?;
            Ok(())
        }
        Command::Sync => sync(&config, store.clone()).await,
        Command::Serve {
            listen_addr,
            sync_interval,
        } => serve(config, store.clone(), listen_addr, sync_interval).await,
    };

    store.close().await;

    result
}

async fn migration_status(store: &Store) -> anyhow::Result<()> {
    let applied = migrate::applied(store.pool()).await?;
    let pending = migrate::pending(store.pool()).await?;

    match migrate::current_version(store.pool()).await? {
        Some(version) => println!("Current version: {version}"),
        None => println!("Current version: none"),
    }

    if applied.is_empty() {
        println!("No migrations have been applied yet.");
    } else {
        println!("Applied migrations:");
        for migration in &applied {
            println!(
                "  {}: {} ({})",
                migration.version,
                migration.description,
                migration.executed_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }

    if !pending.is_empty() {
        println!("Pending migrations:");
        for migration in &pending {
            println!("  {}: {}", migration.version, migration.description);
        }
    }

    Ok(())
}

async fn engine(config: &AppConfig, store: Store) -> anyhow::Result<SyncEngine> {
    let providers = Providers::from_config(config).await?;

    if providers.is_empty() {
        bail!("no calendar provider is configured, set the Microsoft or Google credentials");
    }

    log::info!(
        "configured calendar providers: {}",
        providers
            .kinds()
            .iter()
            .map(|kind| kind.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    Ok(SyncEngine::new(
        store,
        providers,
        SyncSettings::from_config(config),
    )?)
}

async fn sync(config: &AppConfig, store: Store) -> anyhow::Result<()> {
    migrate::migrate(store.pool()).await?;

    let summary = engine(config, store).await?.sync_all().await?;

    log::info!(
        "sync finished: {} succeeded, {} failed",
        summary.succeeded,
        summary.failed
    );

    Ok(())
}

async fn serve(
    mut config: AppConfig,
    store: Store,
    listen_addr: Option<SocketAddr>,
    sync_interval: Option<u64>,
) -> anyhow::Result<()> {
    migrate::migrate(store.pool()).await?;

    if let Some(listen_addr) = listen_addr {
        config.server.listen_addr = listen_addr;
    }

    // Registered even without a sync task, so `/metrics` always lists the sync collectors.
    let registry = Registry::new();
    let metrics = SyncMetrics::new()?;
    metrics.register(&registry)?;

    let sync_task_handle = match sync_interval {
        Some(minutes) => {
            let engine = engine(&config, store.clone()).await?.with_metrics(metrics);
            Some(engine.spawn_sync_task(Duration::from_secs(minutes * 60)))
        }
        None => None,
    };

    web::serve(&config.server, store, registry).await?;

    if let Some(sync_task_handle) = sync_task_handle {
        sync_task_handle.stop().await?;
    }

    Ok(())
}
