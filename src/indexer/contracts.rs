//! The watch-set: which addresses are polled on which chain, as which
//! contract type, and from which block.

use std::collections::{BTreeMap, HashMap};

use alloy::primitives::Address;
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::db::internal::REGISTRY_TABLE;
use crate::db::types::CHAIN_ID_COLUMN;
use crate::db::{DbError, DbOperation, DbValue, ProjectionStore};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WatchedContract {
    pub chain_id: u64,
    pub address: Address,
    pub contract_type: String,
    /// First block whose logs are dispatched for this contract type.
    pub start_block: u64,
}

impl WatchedContract {
    /// Insert into the persisted registry; a row that already exists is left
    /// untouched.
    pub fn registration_operation(&self) -> DbOperation {
        DbOperation::Upsert {
            table: REGISTRY_TABLE.to_string(),
            columns: vec![
                CHAIN_ID_COLUMN.to_string(),
                "address".to_string(),
                "contract_type".to_string(),
                "start_block".to_string(),
            ],
            values: vec![
                DbValue::Uint64(self.chain_id),
                DbValue::from(self.address),
                DbValue::from(self.contract_type.as_str()),
                DbValue::Uint64(self.start_block),
            ],
            conflict_columns: vec![
                CHAIN_ID_COLUMN.to_string(),
                "address".to_string(),
                "contract_type".to_string(),
            ],
            update_columns: Vec::new(),
        }
    }
}

type WatchKey = (Address, String);

/// Watched contracts of every chain. Entries are only ever added.
#[derive(Default)]
pub struct ContractRegistry {
    chains: RwLock<HashMap<u64, BTreeMap<WatchKey, u64>>>,
}

impl ContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a contract known from configuration. Declaring the same contract
    /// twice keeps the earlier start block. Returns whether the watch-set
    /// changed.
    pub async fn register_static(&self, contract: WatchedContract) -> bool {
        let mut chains = self.chains.write().await;
        let watched = chains.entry(contract.chain_id).or_default();
        let key = (contract.address, contract.contract_type);
        match watched.get_mut(&key) {
            Some(start) if *start <= contract.start_block => false,
            Some(start) => {
                *start = contract.start_block;
                true
            }
            None => {
                watched.insert(key, contract.start_block);
                true
            }
        }
    }

    /// Add contracts registered by handlers of a committed batch. Contracts
    /// already watched keep their start block. Returns how many were new.
    pub async fn apply_dynamic(&self, contracts: &[WatchedContract]) -> usize {
        let mut chains = self.chains.write().await;
        let mut added = 0;
        for contract in contracts {
            let watched = chains.entry(contract.chain_id).or_default();
            let key = (contract.address, contract.contract_type.clone());
            if let std::collections::btree_map::Entry::Vacant(entry) = watched.entry(key) {
                entry.insert(contract.start_block);
                added += 1;
                tracing::info!(
                    "Watching {} {} on chain {} from block {}",
                    contract.contract_type,
                    contract.address,
                    contract.chain_id,
                    contract.start_block
                );
            }
        }
        added
    }

    pub async fn contains(&self, chain_id: u64, address: Address, contract_type: &str) -> bool {
        self.chains
            .read()
            .await
            .get(&chain_id)
            .is_some_and(|w| w.contains_key(&(address, contract_type.to_string())))
    }

    /// Snapshot of the chain's watch-set, ordered by address then type.
    pub async fn list_active(&self, chain_id: u64) -> Vec<WatchedContract> {
        self.chains
            .read()
            .await
            .get(&chain_id)
            .map(|watched| {
                watched
                    .iter()
                    .map(|((address, contract_type), start_block)| WatchedContract {
                        chain_id,
                        address: *address,
                        contract_type: contract_type.clone(),
                        start_block: *start_block,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Restore the contracts registered dynamically in earlier runs.
    pub async fn load_persisted(&self, store: &dyn ProjectionStore) -> Result<usize, DbError> {
        let rows = store.select(REGISTRY_TABLE, &[]).await?;
        let mut contracts = Vec::with_capacity(rows.len());
        for row in rows {
            let contract: WatchedContract =
                serde_json::from_value(row).map_err(|e| DbError::InvalidRow {
                    table: REGISTRY_TABLE.to_string(),
                    reason: e.to_string(),
                })?;
            contracts.push(contract);
        }
        Ok(self.apply_dynamic(&contracts).await)
    }
}
