//! tandemd - bidirectional CDC relay daemon
//!
//! Usage:
//!   # One direction, A -> B
//!   tandemd --config relay.json
//!
//!   # Both directions run when the config sets enable_bidirectional
//!   tandemd --config relay.json --log-level debug
//!
//! Exit codes: 0 clean shutdown, 1 invalid configuration, 2 connector
//! setup failure, 3 unrecoverable apply error.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tandem_cdc::{
    connector_for, shutdown_channel, stream_name, ConflictResolver, ConflictWindow, Error,
    OffsetStore, Pipeline, PipelineOptions, RelayConfig, SchemaCache, StreamCounters,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tandemd", about = "Bidirectional CDC relay between PostgreSQL and MySQL")]
struct Cli {
    /// Path to the relay configuration file (JSON)
    #[arg(short, long)]
    config: PathBuf,

    /// Log level when RUST_LOG is unset (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            return 1;
        }
    };

    tracing::info!(
        a = %config.a.id,
        b = %config.b.id,
        bidirectional = config.sync.enable_bidirectional,
        tables = ?config.sync.tables,
        "starting relay"
    );

    let offsets = match OffsetStore::open(&config.storage.offset_storage_path).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!(error = %e, "cannot open offset store");
            return e.exit_code();
        }
    };
    let schema_cache = Arc::new(SchemaCache::with_storage(
        &config.storage.schema_storage_path,
    ));

    let window = Duration::from_secs(config.sync.conflict_window_seconds);
    let window_ab = Arc::new(ConflictWindow::new(window));
    let window_ba = Arc::new(ConflictWindow::new(window));

    let (shutdown_tx, shutdown_rx) = shutdown_channel();

    // Forward pipeline: A -> B.
    let mut pipelines = Vec::new();
    match build_pipeline(
        &config,
        false,
        Arc::clone(&offsets),
        Arc::clone(&schema_cache),
        Arc::clone(&window_ab),
        Arc::clone(&window_ba),
        shutdown_rx.clone(),
    ) {
        Ok(entry) => pipelines.push(entry),
        Err(e) => {
            tracing::error!(error = %e, "failed to build forward pipeline");
            return e.exit_code().max(2);
        }
    }

    if config.sync.enable_bidirectional {
        match build_pipeline(
            &config,
            true,
            Arc::clone(&offsets),
            Arc::clone(&schema_cache),
            Arc::clone(&window_ba),
            Arc::clone(&window_ab),
            shutdown_rx.clone(),
        ) {
            Ok(entry) => pipelines.push(entry),
            Err(e) => {
                tracing::error!(error = %e, "failed to build reverse pipeline");
                return e.exit_code().max(2);
            }
        }
    }

    let mut handles = Vec::new();
    let mut stats = Vec::new();
    for (name, counters, mut pipeline) in pipelines {
        stats.push((name.clone(), counters));
        handles.push(tokio::spawn(async move {
            let result = pipeline.run().await;
            (name, result)
        }));
    }

    // INT/TERM drives every stream to STOPPING.
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let mut exit_code = 0;
    for handle in handles {
        match handle.await {
            Ok((name, Ok(()))) => tracing::info!(stream = %name, "stream finished cleanly"),
            Ok((name, Err(e))) => {
                tracing::error!(stream = %name, error = %e, "stream failed");
                exit_code = exit_code.max(e.exit_code());
            }
            Err(e) => {
                tracing::error!(error = %e, "stream task panicked");
                exit_code = exit_code.max(3);
            }
        }
    }

    for (name, counters) in stats {
        tracing::info!(stream = %name, stats = ?counters.snapshot(), "final statistics");
    }
    exit_code
}

fn load_config(path: &PathBuf) -> Result<RelayConfig, Error> {
    let bytes = std::fs::read(path)
        .map_err(|e| Error::config(format!("read {}: {e}", path.display())))?;
    let config: RelayConfig = serde_json::from_slice(&bytes)
        .map_err(|e| Error::config(format!("parse {}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

type PipelineEntry = (String, Arc<StreamCounters>, Pipeline);

fn build_pipeline(
    config: &RelayConfig,
    reverse: bool,
    offsets: Arc<OffsetStore>,
    schema_cache: Arc<SchemaCache>,
    own_window: Arc<ConflictWindow>,
    peer_window: Arc<ConflictWindow>,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<PipelineEntry, Error> {
    let (source_cfg, target_cfg) = if reverse {
        (&config.b, &config.a)
    } else {
        (&config.a, &config.b)
    };

    let source = connector_for(source_cfg, &target_cfg.id, config, Arc::clone(&schema_cache))?;
    let target = connector_for(target_cfg, &source_cfg.id, config, Arc::clone(&schema_cache))?;

    let stream = stream_name(&source_cfg.id, &target_cfg.id);
    let counters = Arc::new(StreamCounters::new());
    let opts = PipelineOptions {
        stream: stream.clone(),
        tables: config.sync.tables.clone(),
        max_retries: config.sync.max_retries,
        checkpoint_interval: Duration::from_secs(config.sync.checkpoint_interval_seconds),
        skip_poison: config.sync.skip_poison,
        dead_letter_path: config.storage.dead_letter_path.clone(),
    };

    let pipeline = Pipeline::new(
        opts,
        source,
        target,
        offsets,
        schema_cache,
        Arc::clone(&counters),
        ConflictResolver::new(config.sync.conflict_resolution, config.a.id.as_str()),
        own_window,
        peer_window,
        shutdown,
    );

    Ok((stream, counters, pipeline))
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
