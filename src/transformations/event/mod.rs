//! Example domains built on the engine.
//!
//! Add new domain modules here and map them in [`build_contract`].

pub mod nfts;
pub mod uniswap;

use super::contract::Contract;
use super::traits::SharedState;
use crate::types::config::contract::ContractKind;

/// The handlers and migrations of a configured contract type.
pub fn build_contract<S: SharedState>(contract_type: &str, kind: ContractKind) -> Contract<S> {
    match kind {
        ContractKind::Erc721 => nfts::nft_contract(contract_type),
        ContractKind::UniswapV3Factory => uniswap::factory_contract(contract_type),
        ContractKind::UniswapV3Pool => uniswap::pool_contract(contract_type),
    }
}
