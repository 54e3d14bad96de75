use std::env;
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use url::Url;

use evm_state_indexer::db::DbPool;
use evm_state_indexer::indexer::Indexer;
use evm_state_indexer::rpc::{RateLimitConfig, RetryConfig, RpcClient, RpcClientConfig, RpcLogSource};
use evm_state_indexer::types::config::indexer::{env_var, IndexerConfig};

const DEFAULT_CONFIG_PATH: &str = "config/config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = IndexerConfig::load(Path::new(&config_path))?;
    load_required_env_vars(&config)?;

    tracing::info!(
        "Loaded config with {} chain(s) from {}",
        config.chains.len(),
        config_path
    );

    let database_url = env_var(&config.database_url_env_var)?;
    let pool = DbPool::new(&database_url, config.max_db_connections)
        .await
        .context("Failed to connect to the database")?;
    let source = build_log_source(&config)?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        tracing::info!("Shutdown requested, finishing in-flight batches");
        shutdown.cancel();
    });

    let indexer: Indexer = Indexer::new(config).with_configured_contracts()?;
    indexer
        .run(Arc::new(pool), Arc::new(source), cancel)
        .await
        .context("Indexer stopped with an error")?;

    tracing::info!("All chains stopped");
    Ok(())
}

/// Ensures all required env vars are set, loading .env if needed.
fn load_required_env_vars(config: &IndexerConfig) -> anyhow::Result<()> {
    let required: Vec<&str> = config
        .chains
        .iter()
        .map(|c| c.rpc_url_env_var.as_str())
        .chain(std::iter::once(config.database_url_env_var.as_str()))
        .collect();

    if required.iter().all(|var| env::var(var).is_ok()) {
        return Ok(());
    }

    dotenvy::dotenv().with_context(|| {
        format!("Missing some of {:?} and failed to load .env file", required)
    })?;

    let still_missing: Vec<&str> = required
        .iter()
        .filter(|var| env::var(var).is_err())
        .copied()
        .collect();

    anyhow::ensure!(
        still_missing.is_empty(),
        "Missing required env vars after loading .env: {:?}",
        still_missing
    );

    Ok(())
}

fn build_log_source(config: &IndexerConfig) -> anyhow::Result<RpcLogSource> {
    let mut source = RpcLogSource::new(config.rpc.max_addresses_per_request);
    tracing::info!(
        "RPC retries: {} per request, at most {} requests per log fetch before a chain stops",
        config.rpc.max_retries,
        config.max_fetch_requests()
    );

    for chain in &config.chains {
        let rpc_url = env_var(&chain.rpc_url_env_var)?;
        let url = Url::parse(&rpc_url)
            .with_context(|| format!("Invalid RPC URL for chain {}", chain.name))?;

        let mut client_config =
            RpcClientConfig::new(url).with_retry(RetryConfig::new(config.rpc.max_retries));
        let rate = chain
            .requests_per_second
            .or(config.rpc.requests_per_second)
            .and_then(NonZeroU32::new);
        if let Some(rate) = rate {
            client_config = client_config.with_rate_limit(RateLimitConfig::new(rate));
        }

        source = source.with_client(chain.chain_id, RpcClient::new(client_config));
    }

    Ok(source)
}
