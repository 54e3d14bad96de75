use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use crate::types::config::chain::{resolve_chain_config, ChainConfig, ChainConfigRaw};
use crate::types::config::contract::ContractKind;
use crate::types::config::ingestion::{IngestionConfig, RpcConfig, SideEffectsConfig};

#[derive(Debug, Deserialize)]
pub struct IndexerConfigRaw {
    pub chains: Vec<ChainConfigRaw>,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub side_effects: SideEffectsConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default = "default_database_url_env_var")]
    pub database_url_env_var: String,
    #[serde(default = "default_max_db_connections")]
    pub max_db_connections: usize,
    /// Initial value of the handlers' shared state.
    #[serde(default)]
    pub initial_state: Option<serde_json::Value>,
    /// Raise to drop every projection and re-index from the configured
    /// start blocks on the next start.
    #[serde(default)]
    pub reset_count: u64,
}

fn default_database_url_env_var() -> String {
    "DATABASE_URL".to_string()
}

fn default_max_db_connections() -> usize {
    16
}

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub chains: Vec<ChainConfig>,
    pub ingestion: IngestionConfig,
    pub side_effects: SideEffectsConfig,
    pub rpc: RpcConfig,
    pub database_url_env_var: String,
    pub max_db_connections: usize,
    pub initial_state: Option<serde_json::Value>,
    pub reset_count: u64,
}

impl IndexerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let base_dir = path.parent().unwrap_or(Path::new("."));
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at {}", path.display()))?;
        let raw_config: IndexerConfigRaw = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file at {}", path.display()))?;

        let chains = raw_config
            .chains
            .into_iter()
            .map(|chain| {
                let name = chain.name.clone();
                resolve_chain_config(chain, base_dir)
                    .with_context(|| format!("Failed to resolve chain config '{}'", name))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let config = IndexerConfig {
            chains,
            ingestion: raw_config.ingestion,
            side_effects: raw_config.side_effects,
            rpc: raw_config.rpc,
            database_url_env_var: raw_config.database_url_env_var,
            max_db_connections: raw_config.max_db_connections,
            initial_state: raw_config.initial_state,
            reset_count: raw_config.reset_count,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.chains.is_empty() {
            anyhow::bail!("No chains configured");
        }
        if self.ingestion.blocks_per_batch == 0 {
            anyhow::bail!("ingestion.blocks_per_batch must be at least 1");
        }
        let mut seen = std::collections::HashSet::new();
        for chain in &self.chains {
            if !seen.insert(chain.chain_id) {
                anyhow::bail!("Chain id {} configured twice", chain.chain_id);
            }
        }
        self.contract_kinds().map(|_| ())
    }

    /// Requests one log fetch may send before its chain gives up. The
    /// client's `rpc.max_retries` run inside every scheduler attempt, so
    /// the two budgets multiply.
    pub fn max_fetch_requests(&self) -> u32 {
        self.rpc
            .max_retries
            .saturating_add(1)
            .saturating_mul(self.ingestion.max_fetch_retries.saturating_add(1))
    }

    /// Every configured contract type with its kind, across all chains.
    pub fn contract_kinds(&self) -> anyhow::Result<BTreeMap<String, ContractKind>> {
        let mut kinds = BTreeMap::new();
        for chain in &self.chains {
            for (contract_type, contract) in &chain.contracts {
                match kinds.insert(contract_type.clone(), contract.kind) {
                    Some(previous) if previous != contract.kind => anyhow::bail!(
                        "Contract type '{}' is declared as {:?} and {:?}",
                        contract_type,
                        previous,
                        contract.kind
                    ),
                    _ => {}
                }
            }
        }
        Ok(kinds)
    }
}

/// Read an environment variable, falling back to `.env`.
pub fn env_var(name: &str) -> anyhow::Result<String> {
    if let Ok(value) = std::env::var(name) {
        return Ok(value);
    }
    dotenvy::var(name).with_context(|| format!("Environment variable {} is not set", name))
}
