use std::collections::BTreeMap;
use std::path::Path;

use alloy_primitives::Address;
use anyhow::Context;
use serde::Deserialize;

/// Which handlers a configured contract type runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractKind {
    Erc721,
    UniswapV3Factory,
    UniswapV3Pool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContractConfig {
    pub kind: ContractKind,
    /// Absent for contract types discovered at runtime.
    #[serde(default)]
    pub address: Option<AddressOrAddresses>,
    #[serde(default)]
    pub start_block: Option<u64>,
}

impl ContractConfig {
    pub fn addresses(&self) -> Vec<Address> {
        match &self.address {
            Some(AddressOrAddresses::Single(address)) => vec![*address],
            Some(AddressOrAddresses::Multiple(addresses)) => addresses.clone(),
            None => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AddressOrAddresses {
    Single(Address),
    Multiple(Vec<Address>),
}

/// Contract type name -> contract.
pub type Contracts = BTreeMap<String, ContractConfig>;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ContractsOrPath {
    Inline(Contracts),
    Path(String),
}

impl ContractsOrPath {
    pub fn resolve(self, base_dir: &Path) -> anyhow::Result<Contracts> {
        match self {
            ContractsOrPath::Inline(contracts) => Ok(contracts),
            ContractsOrPath::Path(path) => load_contracts_from_path(base_dir, &path),
        }
    }
}

/// Contracts from a JSON file, or from every `.json` file of a directory.
pub fn load_contracts_from_path(base_dir: &Path, path: &str) -> anyhow::Result<Contracts> {
    let full_path = base_dir.join(path);

    if full_path.is_dir() {
        load_contracts_from_dir(&full_path)
    } else {
        load_contracts_from_file(&full_path)
    }
}

fn load_contracts_from_file(path: &Path) -> anyhow::Result<Contracts> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to load contracts file at {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse contracts file at {}", path.display()))
}

fn load_contracts_from_dir(path: &Path) -> anyhow::Result<Contracts> {
    let mut entries: Vec<_> = std::fs::read_dir(path)
        .with_context(|| format!("Failed to read contracts directory at {}", path.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|ext| ext == "json").unwrap_or(false))
        .collect();
    entries.sort();

    let mut merged = Contracts::new();
    for entry in entries {
        for (key, contract) in load_contracts_from_file(&entry)? {
            if merged.contains_key(&key) {
                anyhow::bail!("Duplicate contract key '{}' found in {}", key, path.display());
            }
            merged.insert(key, contract);
        }
    }
    Ok(merged)
}
