//! qbridge-relayer daemon
//!
//! Usage: `qbridge-relayer [config.toml]`. Without a file the configuration
//! is read from `QBRIDGE_*` environment variables (and `.env`).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use qbridge_relayer::{Coordinator, EventSource, RelayerConfig};
use tracing::{error, info, warn};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "qbridge_relayer=info,qbridge_verifier=info".into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config() -> anyhow::Result<RelayerConfig> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("QBRIDGE_CONFIG").ok())
        .map(PathBuf::from);

    let config = match path {
        Some(path) => RelayerConfig::load(Some(&path))
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => RelayerConfig::from_env().context("Failed to read QBRIDGE_* environment")?,
    };
    config.validate().context("Invalid relayer configuration")?;
    Ok(config)
}

#[cfg(feature = "evm")]
fn attach_chains(
    config: &RelayerConfig,
    mut coordinator: Coordinator,
) -> anyhow::Result<(Coordinator, Vec<Box<dyn EventSource>>)> {
    use qbridge_relayer::{EvmLogSource, EvmSubmitter};

    for chain in &config.destination_chains {
        match config.endpoint(*chain).and_then(|e| Some((e, e.bridge_address.as_ref()?))) {
            Some((endpoint, bridge)) => {
                info!(%chain, rpc = %endpoint.rpc_url, "Enabling EVM submitter");
                coordinator = coordinator.with_submitter(Arc::new(EvmSubmitter::new(
                    *chain,
                    &endpoint.rpc_url,
                    bridge,
                    &config.relayer_key,
                )?));
            }
            None => warn!(%chain, "No RPC endpoint or bridge address for destination chain"),
        }
    }

    let mut sources: Vec<Box<dyn EventSource>> = Vec::new();
    for chain in &config.source_chains {
        match config.endpoint(*chain).and_then(|e| Some((e, e.bridge_address.as_ref()?))) {
            Some((endpoint, bridge)) => {
                info!(%chain, from_block = endpoint.start_block, "Watching source chain");
                sources.push(Box::new(EvmLogSource::new(
                    *chain,
                    &endpoint.rpc_url,
                    bridge,
                    endpoint.start_block,
                    config.poll_interval(),
                )?));
            }
            None => warn!(%chain, "No RPC endpoint or bridge address for source chain"),
        }
    }
    Ok((coordinator, sources))
}

#[cfg(not(feature = "evm"))]
fn attach_chains(
    _config: &RelayerConfig,
    coordinator: Coordinator,
) -> anyhow::Result<(Coordinator, Vec<Box<dyn EventSource>>)> {
    warn!("Built without the `evm` feature: no chain adapters, only peer records are swept");
    Ok((coordinator, Vec::new()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = load_config()?;
    info!("Starting qbridge-relayer");
    info!(?config, "Loaded configuration");

    let coordinator = Coordinator::new(&config).context("Failed to start coordinator")?;
    info!(identity = %coordinator.identity(), "Relayer identity");

    let (coordinator, sources) = attach_chains(&config, coordinator)?;
    let coordinator = Arc::new(coordinator);

    let run_handle = tokio::spawn(Arc::clone(&coordinator).run(sources));

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down relayer...");
    coordinator.shutdown();

    match run_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Coordinator stopped with error"),
        Err(e) => error!(error = %e, "Coordinator task panicked"),
    }
    Ok(())
}
