// File: syncd/src/main.rs
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use syncd::config::{Config, ConfigManager};
use syncd::constants::blocks::LOCAL_BLOCK_INTERVAL;
use syncd::database::Database;
use syncd::migrations::{
    ChangesetApplier, ChangesetReplicator, HttpChangesetSource, Migrator, MigratorConfig,
    ReplicatorSettings,
};
use syncd::snapshot::{DumpTool, PgDumpTool, SnapshotStore, SnapshotStoreConfig};
use syncd::node::{BlockPipeline, NodeRoles};
use syncd::state_sync::{http_providers, StateSyncer};
use syncd::voting::{run_local_blocks, ChannelBroadcaster, Vote};
use syncd::web::{start_web_server, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging with reduced verbosity
    let env_filter = EnvFilter::from_default_env()
        .add_directive("syncd=info".parse()?)
        .add_directive("tower_http=warn".parse()?)
        .add_directive("hyper=warn".parse()?)
        .add_directive("reqwest=warn".parse()?)
        .add_directive("sqlx=warn".parse()?);

    fmt().with_env_filter(env_filter).init();

    info!("Starting snapshot and changeset replication daemon");

    // Load configuration
    let config_dir = std::env::args().nth(1).unwrap_or_else(|| "config".to_string());
    let config_manager = ConfigManager::new(config_dir).await?;
    let config = config_manager.get_current_config();
    info!(
        "Configuration loaded: snapshots {}, state sync {}, replicator {}",
        enabled(config.snapshots.enabled),
        enabled(config.statesync.enabled),
        enabled(config.replicator.enabled)
    );

    // Initialize database
    let database = Database::connect(&config.database).await?;
    info!("Database initialized ({})", database.backend_name());

    let dump_tool: Arc<dyn DumpTool> = Arc::new(PgDumpTool::new(&config.database));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    if config.statesync.enabled {
        bootstrap_from_snapshot(&config, &database, dump_tool.clone()).await?;
    }

    let snapshots = if config.snapshots.enabled {
        let store = SnapshotStore::new(snapshot_store_config(&config), dump_tool.clone()).await?;
        info!(
            "Snapshot store ready with {} snapshots",
            store.list_snapshots().await.len()
        );
        Some(Arc::new(store))
    } else {
        None
    };

    let migrator = if config.migration.enabled {
        let migrator =
            Migrator::new(migrator_config(&config), database.clone(), dump_tool.clone()).await?;
        info!("Migrator initialized");
        Some(Arc::new(migrator))
    } else {
        None
    };

    let applier = config.replicator.enabled.then(|| {
        Arc::new(ChangesetApplier::new(
            database.clone(),
            Some(config.replicator.end_height),
        ))
    });

    let roles = NodeRoles {
        migrator: migrator.clone(),
        snapshots: snapshots.clone(),
        applier,
    };

    let mut background = Vec::new();
    if !roles.is_empty() {
        let pipeline = roles.assemble(&database).await?;
        let (broadcaster, votes) = ChannelBroadcaster::new();
        background.push(start_block_loop(pipeline, votes, shutdown_rx.clone()));
        if config.replicator.enabled {
            background.extend(
                start_replicator(&config, &database, broadcaster, shutdown_rx.clone()).await?,
            );
        }
    }

    let state = AppState::new(snapshots, migrator);
    if let Err(e) = start_web_server(&config.rpc, state, shutdown_rx).await {
        error!("Web server failed: {}", e);
    }

    for task in background {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Background task failed: {}", e),
            Err(e) => error!("Background task panicked: {}", e),
        }
    }

    info!("Shutdown complete");
    Ok(())
}

fn enabled(flag: bool) -> &'static str {
    if flag {
        "enabled"
    } else {
        "disabled"
    }
}

fn snapshot_store_config(config: &Config) -> SnapshotStoreConfig {
    SnapshotStoreConfig {
        dir: PathBuf::from(&config.snapshots.dir),
        max_snapshots: config.snapshots.max_snapshots,
        recurring_height: config.snapshots.recurring_height,
        chunk_size: config.snapshots.chunk_size,
        max_row_size: config.snapshots.max_row_size,
        schemas: config.snapshots.schemas.clone(),
        exclude_tables: config.snapshots.exclude_tables.clone(),
        exclude_table_data: config.snapshots.exclude_table_data.clone(),
    }
}

fn migrator_config(config: &Config) -> MigratorConfig {
    MigratorConfig {
        dir: PathBuf::from(&config.migration.dir),
        changeset_chunk_size: config.migration.chunk_size,
        snapshot_chunk_size: config.snapshots.chunk_size,
        max_row_size: config.snapshots.max_row_size,
        schemas: config.snapshots.schemas.clone(),
        exclude_tables: config.migration.exclude_tables.clone(),
        exclude_table_data: config.migration.exclude_table_data.clone(),
    }
}

/// Restores the database from the latest trusted snapshot when it holds no state yet
async fn bootstrap_from_snapshot(
    config: &Config,
    database: &Database,
    dump_tool: Arc<dyn DumpTool>,
) -> Result<()> {
    if !database.is_empty(&config.database.canonical_table).await? {
        info!("Database already holds state, skipping snapshot bootstrap");
        return Ok(());
    }

    let timeout = Duration::from_secs(config.statesync.request_timeout_seconds);
    let providers = http_providers(&config.statesync.trusted_providers, timeout)?;
    let syncer = StateSyncer::new(
        &config.statesync.dir,
        database.clone(),
        &config.database.canonical_table,
        dump_tool,
        providers,
    )
    .await?;

    let snapshot = syncer.bootstrap().await?;
    info!("✓ Bootstrapped from snapshot at height {}", snapshot.height);
    Ok(())
}

/// Produces local blocks: confirmed votes are resolved, then every role's
/// end-block hooks run
fn start_block_loop(
    pipeline: BlockPipeline,
    votes: mpsc::UnboundedReceiver<Vote>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        let block = run_local_blocks(
            pipeline.registry,
            pipeline.hooks,
            votes,
            pipeline.block,
            LOCAL_BLOCK_INTERVAL,
            shutdown,
        )
        .await?;
        info!("Local chain stopped at height {}", block.height);
        Ok::<(), anyhow::Error>(())
    })
}

/// Destination side: pulls changesets from the source chain and submits them
/// as votes on the local block loop
async fn start_replicator(
    config: &Config,
    database: &Database,
    broadcaster: ChannelBroadcaster,
    shutdown: watch::Receiver<bool>,
) -> Result<Option<JoinHandle<Result<()>>>> {
    let Some(source_url) = config.replicator.source_url.as_deref() else {
        warn!("Replicator enabled without a source URL");
        return Ok(None);
    };

    let source = HttpChangesetSource::new(source_url, syncd::constants::http::REQUEST_TIMEOUT)?;
    let replicator = ChangesetReplicator::new(
        ReplicatorSettings::from(&config.replicator),
        Arc::new(source),
        Arc::new(broadcaster),
        database.clone(),
    )
    .await?;

    Ok(Some(tokio::spawn(async move {
        replicator.run(shutdown).await?;
        Ok::<(), anyhow::Error>(())
    })))
}
