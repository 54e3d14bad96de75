use std::path::Path;

use serde::Deserialize;

use crate::types::config::contract::{Contracts, ContractsOrPath};

#[derive(Debug, Deserialize)]
pub struct ChainConfigRaw {
    pub name: String,
    pub chain_id: u64,
    pub rpc_url_env_var: String,
    /// Where to start when no contract of the chain gives a start block.
    pub start_block: Option<u64>,
    #[serde(default)]
    pub contracts: Option<ContractsOrPath>,
    /// Overrides `rpc.requests_per_second` for this chain.
    #[serde(default)]
    pub requests_per_second: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub name: String,
    pub chain_id: u64,
    pub rpc_url_env_var: String,
    pub start_block: Option<u64>,
    pub contracts: Contracts,
    pub requests_per_second: Option<u32>,
}

pub fn resolve_chain_config(
    raw_config: ChainConfigRaw,
    base_dir: &Path,
) -> anyhow::Result<ChainConfig> {
    let contracts = match raw_config.contracts {
        Some(contracts) => contracts.resolve(base_dir)?,
        None => Contracts::new(),
    };

    Ok(ChainConfig {
        name: raw_config.name,
        chain_id: raw_config.chain_id,
        rpc_url_env_var: raw_config.rpc_url_env_var,
        start_block: raw_config.start_block,
        contracts,
        requests_per_second: raw_config.requests_per_second,
    })
}
