//! ERC-721 ownership.
//!
//! One row per token, overwritten on every transfer:
//! `nfts(chain_id, contract_address, token_id) -> owner_address`.

use alloy::primitives::Address;
use async_trait::async_trait;

use crate::db::{SingleChainRow, StateMigrations};
use crate::transformations::context::{EventContext, SideEffectContext};
use crate::transformations::contract::Contract;
use crate::transformations::error::{SideEffectError, TransformationError};
use crate::transformations::traits::{EventHandler, SharedState, SideEffectHandler};

pub const NFTS_TABLE: &str = "nfts";

const TRANSFER_ABI: &str =
    "event Transfer(address indexed from, address indexed to, uint256 indexed tokenId)";

pub fn nft_contract<S: SharedState>(contract_type: &str) -> Contract<S> {
    Contract::new(contract_type)
        .add_event_handler(TransferHandler)
        .add_side_effect_handler(MintNotifier)
        .add_state_migrations(NftMigrations)
}

pub struct NftMigrations;

impl StateMigrations for NftMigrations {
    fn name(&self) -> &'static str {
        "nfts"
    }

    fn migrations(&self) -> Vec<&'static str> {
        vec![
            "CREATE TABLE IF NOT EXISTS nfts (
                chain_id BIGINT NOT NULL,
                contract_address TEXT NOT NULL,
                token_id NUMERIC(78, 0) NOT NULL,
                owner_address TEXT NOT NULL,
                last_transfer_block BIGINT NOT NULL,
                PRIMARY KEY (chain_id, contract_address, token_id)
            )",
            "CREATE INDEX IF NOT EXISTS nfts_owner_idx ON nfts (chain_id, owner_address)",
        ]
    }
}

/// Records the new owner of the transferred token.
pub struct TransferHandler;

#[async_trait]
impl<S: SharedState> EventHandler<S> for TransferHandler {
    fn name(&self) -> &'static str {
        "TransferHandler"
    }

    fn abi(&self) -> &'static str {
        TRANSFER_ABI
    }

    async fn handle_event(&self, ctx: &mut EventContext<'_, S>) -> Result<(), TransformationError> {
        let event = ctx.event;
        let to = event.get("to")?.as_address().ok_or_else(|| {
            TransformationError::TypeConversion("to is not address".to_string())
        })?;
        let token_id = event.get("tokenId")?.as_uint256().ok_or_else(|| {
            TransformationError::TypeConversion("tokenId is not uint256".to_string())
        })?;

        ctx.upsert_single_chain(
            SingleChainRow::new(NFTS_TABLE)
                .key("contract_address", event.contract_address)
                .key("token_id", token_id)
                .set("owner_address", to)
                .set("last_transfer_block", event.block_number),
        )
        .await
    }
}

/// Announces mints once they are committed.
pub struct MintNotifier;

#[async_trait]
impl<S: SharedState> SideEffectHandler<S> for MintNotifier {
    fn name(&self) -> &'static str {
        "MintNotifier"
    }

    fn abi(&self) -> &'static str {
        TRANSFER_ABI
    }

    async fn handle_event(&self, ctx: SideEffectContext<S>) -> Result<(), SideEffectError> {
        let event = &ctx.event;
        let from = event
            .try_get("from")
            .and_then(|v| v.as_address())
            .ok_or_else(|| SideEffectError::permanent("MintNotifier", "from is not address"))?;
        if from != Address::ZERO {
            return Ok(());
        }

        tracing::info!(
            "Minted {} #{} to {} on chain {} (block {})",
            event.contract_type,
            event
                .try_get("tokenId")
                .and_then(|v| v.to_numeric_string())
                .unwrap_or_default(),
            event
                .try_get("to")
                .and_then(|v| v.as_address_string())
                .unwrap_or_default(),
            event.chain_id,
            event.block_number
        );
        Ok(())
    }
}
