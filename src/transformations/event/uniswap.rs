//! Uniswap V3 pools and cross-chain swap volume.
//!
//! The factory's `PoolCreated` records the pool and starts watching it;
//! every `Swap` of a watched pool adds the absolute amounts of both tokens
//! to a volume row shared by all chains.

use alloy::primitives::Address;
use async_trait::async_trait;
use serde::Deserialize;

use crate::db::{DbValue, MultiChainRow, SingleChainRow, StateMigrations};
use crate::transformations::context::EventContext;
use crate::transformations::contract::Contract;
use crate::transformations::error::TransformationError;
use crate::transformations::traits::{EventHandler, SharedState};

pub const POOLS_TABLE: &str = "uniswap_pools";
pub const VOLUMES_TABLE: &str = "uniswap_token_swap_volumes";
pub const POOL_CONTRACT_TYPE: &str = "UniswapV3Pool";

pub fn factory_contract<S: SharedState>(contract_type: &str) -> Contract<S> {
    Contract::new(contract_type)
        .add_event_handler(PoolCreatedHandler)
        .add_state_migrations(PoolMigrations)
}

pub fn pool_contract<S: SharedState>(contract_type: &str) -> Contract<S> {
    Contract::new(contract_type)
        .add_event_handler(SwapHandler)
        .add_state_migrations(TokenSwapVolumeMigrations)
}

pub struct PoolMigrations;

impl StateMigrations for PoolMigrations {
    fn name(&self) -> &'static str {
        "uniswap_pools"
    }

    fn migrations(&self) -> Vec<&'static str> {
        vec!["CREATE TABLE IF NOT EXISTS uniswap_pools (
                chain_id BIGINT NOT NULL,
                pool_contract_address TEXT NOT NULL,
                token0_address TEXT NOT NULL,
                token1_address TEXT NOT NULL,
                fee INTEGER NOT NULL,
                tick_spacing INTEGER NOT NULL,
                created_at_block BIGINT NOT NULL,
                PRIMARY KEY (chain_id, pool_contract_address)
            )"]
    }
}

/// Volumes swapped per token address, summed over every chain.
pub struct TokenSwapVolumeMigrations;

impl StateMigrations for TokenSwapVolumeMigrations {
    fn name(&self) -> &'static str {
        "uniswap_token_swap_volumes"
    }

    fn migrations(&self) -> Vec<&'static str> {
        vec!["CREATE TABLE IF NOT EXISTS uniswap_token_swap_volumes (
                token_address TEXT PRIMARY KEY,
                amount_wei NUMERIC(78, 0) NOT NULL,
                swap_count BIGINT NOT NULL,
                last_updated_at BIGINT NOT NULL
            )"]
    }
}

pub struct PoolCreatedHandler;

#[async_trait]
impl<S: SharedState> EventHandler<S> for PoolCreatedHandler {
    fn name(&self) -> &'static str {
        "PoolCreatedHandler"
    }

    fn abi(&self) -> &'static str {
        "PoolCreated(address indexed token0, address indexed token1, uint24 indexed fee, int24 tickSpacing, address pool)"
    }

    async fn handle_event(&self, ctx: &mut EventContext<'_, S>) -> Result<(), TransformationError> {
        let event = ctx.event;
        let address = |name: &str| {
            event.get(name)?.as_address().ok_or_else(|| {
                TransformationError::TypeConversion(format!("{} is not address", name))
            })
        };
        let token0 = address("token0")?;
        let token1 = address("token1")?;
        let pool = address("pool")?;
        let fee = event.get("fee")?.as_u32().ok_or_else(|| {
            TransformationError::TypeConversion("fee is not uint24".to_string())
        })?;
        let tick_spacing = event.get("tickSpacing")?.as_i32().ok_or_else(|| {
            TransformationError::TypeConversion("tickSpacing is not int24".to_string())
        })?;

        ctx.upsert_single_chain(
            SingleChainRow::new(POOLS_TABLE)
                .key("pool_contract_address", pool)
                .set("token0_address", token0)
                .set("token1_address", token1)
                .set("fee", fee as i32)
                .set("tick_spacing", tick_spacing)
                .set("created_at_block", event.block_number),
        )
        .await?;

        ctx.register_contract(POOL_CONTRACT_TYPE, pool);

        tracing::debug!(
            "PoolCreated: pool={} token0={} token1={} fee={} block={}",
            pool,
            token0,
            token1,
            fee,
            event.block_number
        );
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct PoolRow {
    token0_address: Address,
    token1_address: Address,
}

pub struct SwapHandler;

#[async_trait]
impl<S: SharedState> EventHandler<S> for SwapHandler {
    fn name(&self) -> &'static str {
        "SwapHandler"
    }

    fn abi(&self) -> &'static str {
        "Swap(address indexed sender, address indexed recipient, int256 amount0, int256 amount1, uint160 sqrtPriceX96, uint128 liquidity, int24 tick)"
    }

    async fn handle_event(&self, ctx: &mut EventContext<'_, S>) -> Result<(), TransformationError> {
        let event = ctx.event;
        let pool: Option<PoolRow> = ctx
            .read_one(
                POOLS_TABLE,
                &[("pool_contract_address", DbValue::from(event.contract_address))],
            )
            .await?;
        let Some(pool) = pool else {
            tracing::warn!(
                "Swap from unknown pool {} on chain {} at block {}, skipping",
                event.contract_address,
                event.chain_id,
                event.block_number
            );
            return Ok(());
        };

        for (token, param) in [(pool.token0_address, "amount0"), (pool.token1_address, "amount1")] {
            let amount = event.get(param)?.as_int256().ok_or_else(|| {
                TransformationError::TypeConversion(format!("{} is not int256", param))
            })?;

            ctx.upsert_multi_chain(
                MultiChainRow::new(VOLUMES_TABLE)
                    .key("token_address", token)
                    .accumulate("amount_wei", amount.unsigned_abs())
                    .accumulate("swap_count", 1u64)
                    .max("last_updated_at", event.block_timestamp),
            )
            .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryStore, ProjectionStore};
    use crate::indexer::testing;
    use crate::transformations::context::PendingBatch;
    use crate::transformations::dispatcher::Dispatcher;
    use crate::transformations::registry::HandlerRegistry;
    use alloy::primitives::U256;

    const FACTORY: Address = Address::repeat_byte(0x20);
    const POOL: Address = Address::repeat_byte(0x30);

    fn dispatcher() -> Dispatcher {
        let factory = factory_contract("Factory");
        let pool = pool_contract(POOL_CONTRACT_TYPE);
        Dispatcher::new(HandlerRegistry::from_contracts([&factory, &pool]).unwrap())
    }

    #[tokio::test]
    async fn pool_creation_records_the_pool_and_watches_it() {
        let dispatcher = dispatcher();
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let mut pending = PendingBatch::default();

        let log = testing::pool_created(
            FACTORY,
            Address::repeat_byte(3),
            Address::repeat_byte(4),
            POOL,
            5,
            0,
        );
        dispatcher
            .dispatch_log(10, &log, "Factory", &mut (), tx.as_mut(), &mut pending)
            .await
            .unwrap()
            .unwrap();

        let swap = testing::swap(POOL, "-250", "1000", 5, 1);
        dispatcher
            .dispatch_log(10, &swap, POOL_CONTRACT_TYPE, &mut (), tx.as_mut(), &mut pending)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let pools = store.rows(POOLS_TABLE).await;
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0]["fee"], DbValue::Int32(3000));
        assert_eq!(pools[0]["tick_spacing"], DbValue::Int32(60));

        assert_eq!(pending.registrations.len(), 1);
        let registered = &pending.registrations[0];
        assert_eq!(registered.address, POOL);
        assert_eq!(registered.contract_type, POOL_CONTRACT_TYPE);
        assert_eq!(registered.start_block, 6);

        let volumes = store.rows(VOLUMES_TABLE).await;
        assert_eq!(volumes.len(), 2);
        let token0 = volumes
            .iter()
            .find(|row| row["token_address"] == DbValue::from(Address::repeat_byte(3)))
            .unwrap();
        assert_eq!(token0["amount_wei"], DbValue::from(U256::from(250u64)));
    }

    #[tokio::test]
    async fn swaps_of_unknown_pools_are_skipped() {
        let dispatcher = dispatcher();
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let mut pending = PendingBatch::default();

        let swap = testing::swap(POOL, "10", "-20", 8, 0);
        let event = dispatcher
            .dispatch_log(10, &swap, POOL_CONTRACT_TYPE, &mut (), tx.as_mut(), &mut pending)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert!(event.is_some());
        assert_eq!(pending.writes, 0);
        assert!(store.rows(VOLUMES_TABLE).await.is_empty());
    }
}
