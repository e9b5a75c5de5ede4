use anyhow::{Context, Result};
use dubhe_relayer::{
    chains::{Ed25519Signer, HttpIndexerSource, JsonRpcClient},
    config::{log_level_filter, CliArgs, ConfigBuilder},
    EventSubscriber, FileStore, MemoryStore, RecordStore, RelayOrchestrator,
    TransactionSubmitter,
};
use log::{info, warn};
use std::{sync::Arc, time::Duration};

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    // logging comes up before the config loader so its messages are kept;
    // the level is narrowed globally once the configured one is known
    let level_from_env = std::env::var_os("RUST_LOG").is_some();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("trace")).init();
    if !level_from_env {
        log::set_max_level(log_level_filter(
            cli_args.log_level.as_deref().unwrap_or("info"),
        ));
    }

    let config = ConfigBuilder::load_with(&cli_args).context("failed to load configuration")?;
    if !level_from_env {
        log::set_max_level(log_level_filter(&config.monitoring.log_level));
    }

    info!("Dubhe Relayer v{}", env!("CARGO_PKG_VERSION"));
    info!("=====================================");
    info!("   Network: {}", config.source.network);
    info!("   Package: {}", config.source.package_id);
    info!("   Indexer: {}", config.source.indexer_url);
    info!("   Destination RPC: {}", config.destination.rpc_url);
    info!("   Events: {}", config.source.event_names.join(", "));

    let store: Arc<dyn RecordStore> = match &config.storage.path {
        Some(path) => Arc::new(FileStore::open(path).await?),
        None => {
            warn!("No storage.path configured, submission records are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let signer = Arc::new(Ed25519Signer::from_hex_seed(&config.destination.signing_key)?);
    let client = Arc::new(JsonRpcClient::new(&config.destination)?);
    let submitter = Arc::new(TransactionSubmitter::new(client, signer, &config.destination)?);

    let orchestrator = Arc::new(
        RelayOrchestrator::new(
            config.processing.clone(),
            config.source.chain_tag.clone(),
            Arc::clone(&store),
            submitter,
        )?
        .with_metrics_interval(Duration::from_secs(config.monitoring.metrics_interval_secs)),
    );

    let source = Arc::new(HttpIndexerSource::new(&config.source)?);
    let subscriber = EventSubscriber::new(source, &config.source);

    let resume_after = store.low_water_mark().await?;
    info!(
        "Resuming after {}",
        resume_after
            .map(|id| id.to_string())
            .unwrap_or_else(|| "genesis".to_string())
    );
    let events = subscriber.subscribe(resume_after);

    orchestrator
        .run(events, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Cannot listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!("Relayer stopped");
    Ok(())
}
