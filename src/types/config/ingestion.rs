//! Tuning knobs of the chain loops, the side-effect pool and the RPC layer.

use std::time::Duration;

use serde::Deserialize;

use crate::rpc::RetryConfig;
use crate::transformations::SideEffectConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct IngestionConfig {
    /// Upper bound on the blocks covered by one batch.
    #[serde(default = "default_blocks_per_batch")]
    pub blocks_per_batch: u64,

    /// Pause between cycles, and the poll interval once caught up.
    #[serde(default = "default_ingestion_rate_ms")]
    pub ingestion_rate_ms: u64,

    /// Consecutive failed fetches or commits before the chain gives up.
    #[serde(default = "default_max_fetch_retries")]
    pub max_fetch_retries: u32,

    /// Consecutive handler failures on one batch before the chain gives up.
    #[serde(default = "default_max_handler_retries")]
    pub max_handler_retries: u32,

    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

fn default_blocks_per_batch() -> u64 {
    2000
}

fn default_ingestion_rate_ms() -> u64 {
    20_000
}

fn default_max_fetch_retries() -> u32 {
    5
}

fn default_max_handler_retries() -> u32 {
    3
}

fn default_retry_initial_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            blocks_per_batch: default_blocks_per_batch(),
            ingestion_rate_ms: default_ingestion_rate_ms(),
            max_fetch_retries: default_max_fetch_retries(),
            max_handler_retries: default_max_handler_retries(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl IngestionConfig {
    pub fn ingestion_rate(&self) -> Duration {
        Duration::from_millis(self.ingestion_rate_ms)
    }

    /// Backoff schedule between attempts; the attempt budget is tracked by
    /// the caller.
    pub fn backoff(&self) -> RetryConfig {
        RetryConfig::new(self.max_fetch_retries)
            .with_initial_delay(Duration::from_millis(self.retry_initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.retry_max_delay_ms))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SideEffectsConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How long in-flight side effects may run after shutdown was requested.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

fn default_concurrency() -> usize {
    8
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_shutdown_grace_ms() -> u64 {
    10_000
}

impl Default for SideEffectsConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            queue_capacity: default_queue_capacity(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

impl SideEffectsConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn executor_config(&self) -> SideEffectConfig {
        SideEffectConfig {
            concurrency: self.concurrency,
            queue_capacity: self.queue_capacity,
            retry_initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            retry_max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    /// Addresses per `eth_getLogs` request.
    #[serde(default = "default_max_addresses_per_request")]
    pub max_addresses_per_request: usize,

    /// Default rate limit; chains may override it.
    #[serde(default)]
    pub requests_per_second: Option<u32>,

    /// Retries of a single RPC request inside the client. These nest inside
    /// the chain loop's `max_fetch_retries`.
    #[serde(default = "default_rpc_max_retries")]
    pub max_retries: u32,
}

fn default_max_addresses_per_request() -> usize {
    500
}

fn default_rpc_max_retries() -> u32 {
    2
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            max_addresses_per_request: default_max_addresses_per_request(),
            requests_per_second: None,
            max_retries: default_rpc_max_retries(),
        }
    }
}
