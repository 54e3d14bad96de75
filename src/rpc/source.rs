//! Where the ingestion loop gets its logs from.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use alloy::primitives::{Address, Bytes, B256};
use alloy::rpc::types::{BlockNumberOrTag, Filter, Log};
use async_trait::async_trait;
use thiserror::Error;

use super::client::{RpcClient, RpcError};
use super::retry::Retryable;

/// A log as delivered by the chain, before decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: u64,
    pub block_timestamp: u64,
    pub transaction_hash: B256,
    pub transaction_index: u64,
    pub log_index: u64,
}

impl RawLog {
    pub fn position(&self) -> (u64, u64, u64) {
        (self.block_number, self.transaction_index, self.log_index)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("RPC error on chain {chain_id}: {source}")]
    Rpc {
        chain_id: u64,
        #[source]
        source: RpcError,
    },

    #[error("No RPC client configured for chain {0}")]
    UnknownChain(u64),

    #[error("Malformed log from chain {chain_id}: {reason}")]
    MalformedLog { chain_id: u64, reason: String },

    #[error("Block {block} not found on chain {chain_id}")]
    MissingBlock { chain_id: u64, block: u64 },
}

impl Retryable for FetchError {
    fn is_retryable(&self) -> bool {
        match self {
            FetchError::Rpc { source, .. } => source.is_retryable(),
            FetchError::UnknownChain(_) => false,
            // providers sometimes serve partial data while catching up
            FetchError::MalformedLog { .. } | FetchError::MissingBlock { .. } => true,
        }
    }
}

#[async_trait]
pub trait LogSource: Send + Sync + 'static {
    /// Every log emitted by `addresses` in `[from_block, to_block]`, inclusive.
    async fn fetch_logs(
        &self,
        chain_id: u64,
        addresses: &[Address],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawLog>, FetchError>;

    async fn current_head(&self, chain_id: u64) -> Result<u64, FetchError>;
}

/// [`LogSource`] over one JSON-RPC client per chain.
pub struct RpcLogSource {
    clients: HashMap<u64, Arc<RpcClient>>,
    max_addresses_per_request: usize,
}

impl RpcLogSource {
    pub fn new(max_addresses_per_request: usize) -> Self {
        Self {
            clients: HashMap::new(),
            max_addresses_per_request: max_addresses_per_request.max(1),
        }
    }

    pub fn with_client(mut self, chain_id: u64, client: RpcClient) -> Self {
        self.clients.insert(chain_id, Arc::new(client));
        self
    }

    fn client(&self, chain_id: u64) -> Result<&RpcClient, FetchError> {
        self.clients
            .get(&chain_id)
            .map(|c| c.as_ref())
            .ok_or(FetchError::UnknownChain(chain_id))
    }

    /// Timestamps for blocks whose logs came back without one.
    async fn block_timestamps(
        &self,
        chain_id: u64,
        blocks: BTreeSet<u64>,
    ) -> Result<HashMap<u64, u64>, FetchError> {
        let client = self.client(chain_id)?;
        let requests = blocks.iter().map(|&number| async move {
            let block = client
                .get_block_by_number(BlockNumberOrTag::Number(number))
                .await
                .map_err(|source| FetchError::Rpc { chain_id, source })?
                .ok_or(FetchError::MissingBlock {
                    chain_id,
                    block: number,
                })?;
            Ok::<_, FetchError>((number, block.header.timestamp))
        });

        futures::future::join_all(requests)
            .await
            .into_iter()
            .collect()
    }
}

#[async_trait]
impl LogSource for RpcLogSource {
    async fn fetch_logs(
        &self,
        chain_id: u64,
        addresses: &[Address],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawLog>, FetchError> {
        if addresses.is_empty() || from_block > to_block {
            return Ok(Vec::new());
        }
        let client = self.client(chain_id)?;

        let mut logs = Vec::new();
        for chunk in addresses.chunks(self.max_addresses_per_request) {
            let filter = Filter::new()
                .from_block(from_block)
                .to_block(to_block)
                .address(chunk.to_vec());
            let fetched = client
                .get_logs(&filter)
                .await
                .map_err(|source| FetchError::Rpc { chain_id, source })?;

            for log in fetched.into_iter().filter(|l| !l.removed) {
                if !chunk.contains(&log.address()) {
                    return Err(FetchError::MalformedLog {
                        chain_id,
                        reason: format!("log from unrequested address {}", log.address()),
                    });
                }
                logs.push(log);
            }
        }

        let missing: BTreeSet<u64> = logs
            .iter()
            .filter(|l| l.block_timestamp.is_none())
            .filter_map(|l| l.block_number)
            .collect();
        let timestamps = if missing.is_empty() {
            HashMap::new()
        } else {
            self.block_timestamps(chain_id, missing).await?
        };

        let mut raw = logs
            .into_iter()
            .map(|log| into_raw_log(chain_id, log, &timestamps))
            .collect::<Result<Vec<_>, _>>()?;
        raw.sort_by_key(RawLog::position);

        tracing::debug!(
            "Fetched {} logs for {} addresses on chain {} (blocks {}-{})",
            raw.len(),
            addresses.len(),
            chain_id,
            from_block,
            to_block
        );
        Ok(raw)
    }

    async fn current_head(&self, chain_id: u64) -> Result<u64, FetchError> {
        self.client(chain_id)?
            .get_block_number()
            .await
            .map_err(|source| FetchError::Rpc { chain_id, source })
    }
}

fn into_raw_log(
    chain_id: u64,
    log: Log,
    timestamps: &HashMap<u64, u64>,
) -> Result<RawLog, FetchError> {
    let missing = |field: &str| FetchError::MalformedLog {
        chain_id,
        reason: format!("log without {}", field),
    };

    let block_number = log.block_number.ok_or_else(|| missing("block_number"))?;
    let block_timestamp = log
        .block_timestamp
        .or_else(|| timestamps.get(&block_number).copied())
        .ok_or_else(|| missing("block_timestamp"))?;

    Ok(RawLog {
        address: log.address(),
        topics: log.topics().to_vec(),
        data: log.data().data.clone(),
        block_number,
        block_timestamp,
        transaction_hash: log.transaction_hash.ok_or_else(|| missing("transaction_hash"))?,
        transaction_index: log.transaction_index.ok_or_else(|| missing("transaction_index"))?,
        log_index: log.log_index.ok_or_else(|| missing("log_index"))?,
    })
}
