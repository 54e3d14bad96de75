//! Wiring of one indexer run: migrations, the watch-set, one ingestion
//! loop per chain and the side-effect pool.

pub mod contracts;
pub mod error;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::db::{MigrationRunner, ProjectionStore};
use crate::rpc::LogSource;
use crate::transformations::event::build_contract;
use crate::transformations::{Contract, Dispatcher, HandlerRegistry, SharedState, SideEffectExecutor};
use crate::types::config::indexer::IndexerConfig;

pub use contracts::{ContractRegistry, WatchedContract};
pub use error::IngestionError;
pub use scheduler::{BatchReport, ChainIngestor, ChainState, Cycle, EngineParts, StateCell};

pub struct Indexer<S: SharedState = ()> {
    config: IndexerConfig,
    contracts: Vec<Contract<S>>,
    initial_state: Option<S>,
}

impl<S: SharedState> Indexer<S> {
    pub fn new(config: IndexerConfig) -> Self {
        Self {
            config,
            contracts: Vec::new(),
            initial_state: None,
        }
    }

    /// Add the built-in handlers of every contract type named in the
    /// configuration.
    pub fn with_configured_contracts(mut self) -> Result<Self, IngestionError> {
        let kinds = self
            .config
            .contract_kinds()
            .map_err(|e| IngestionError::Config(format!("{:#}", e)))?;
        for (contract_type, kind) in kinds {
            self.contracts.push(build_contract(&contract_type, kind));
        }
        Ok(self)
    }

    pub fn add_contract(mut self, contract: Contract<S>) -> Self {
        self.contracts.push(contract);
        self
    }

    /// Takes precedence over `initial_state` in the configuration.
    pub fn with_initial_state(mut self, state: S) -> Self {
        self.initial_state = Some(state);
        self
    }

    /// Index every configured chain until `cancel` fires or every chain has
    /// stopped. A chain that fails for good stops alone; the error is
    /// returned once the last chain is done. Side effects still in flight
    /// get the configured grace period before they are aborted.
    pub async fn run(
        self,
        store: Arc<dyn ProjectionStore>,
        source: Arc<dyn LogSource>,
        cancel: CancellationToken,
    ) -> Result<(), IngestionError> {
        let Self {
            config,
            contracts,
            initial_state,
        } = self;

        let registry = HandlerRegistry::from_contracts(contracts.iter())
            .map_err(|e| IngestionError::Config(e.to_string()))?;
        for chain in &config.chains {
            for contract_type in chain.contracts.keys() {
                if !registry.knows_contract_type(contract_type) {
                    return Err(IngestionError::Config(format!(
                        "No handlers for contract type '{}' on chain {}",
                        contract_type, chain.name
                    )));
                }
            }
        }
        tracing::info!(
            "Registered {} handlers for {} event routes",
            registry.handler_count(),
            registry.routes().count()
        );

        let mut migrations = MigrationRunner::new();
        for contract in &contracts {
            for m in &contract.migrations {
                migrations.add(Arc::clone(m));
            }
        }
        if migrations.reset(store.as_ref(), config.reset_count).await? {
            tracing::warn!("Re-indexing every chain from its start block");
        }
        migrations.run(store.as_ref()).await?;

        let watch_set = Arc::new(ContractRegistry::new());
        for chain in &config.chains {
            for (contract_type, contract) in &chain.contracts {
                for address in contract.addresses() {
                    watch_set
                        .register_static(WatchedContract {
                            chain_id: chain.chain_id,
                            address,
                            contract_type: contract_type.clone(),
                            start_block: contract.start_block.or(chain.start_block).unwrap_or(0),
                        })
                        .await;
                }
            }
        }
        for contract in &contracts {
            for deployment in &contract.addresses {
                watch_set
                    .register_static(WatchedContract {
                        chain_id: deployment.chain_id,
                        address: deployment.address,
                        contract_type: contract.contract_type().to_string(),
                        start_block: deployment.start_block,
                    })
                    .await;
            }
        }
        let restored = watch_set.load_persisted(store.as_ref()).await?;
        if restored > 0 {
            tracing::info!("Restored {} dynamically registered contracts", restored);
        }

        let initial_state = match (initial_state, &config.initial_state) {
            (Some(state), _) => state,
            (None, Some(value)) => serde_json::from_value(value.clone()).map_err(|e| {
                IngestionError::Config(format!("initial_state does not match the shared state: {}", e))
            })?,
            (None, None) => S::default(),
        };

        let parts = EngineParts {
            source,
            store,
            contracts: watch_set,
            dispatcher: Arc::new(Dispatcher::new(registry)),
            state: Arc::new(Mutex::new(Arc::new(initial_state))),
        };
        let executor = SideEffectExecutor::spawn(config.side_effects.executor_config());

        let mut chains = JoinSet::new();
        for chain in &config.chains {
            let ingestor = ChainIngestor::new(
                chain.chain_id,
                chain.name.clone(),
                parts.clone(),
                config.ingestion.clone(),
            )
            .with_start_block(chain.start_block)
            .with_side_effects(executor.queue());
            let chain_id = chain.chain_id;
            let token = cancel.child_token();
            chains.spawn(async move { (chain_id, ingestor.run(token).await) });
        }
        drop(parts);

        // A chain that fails stops on its own; the others keep going.
        let mut result = Ok(());
        while let Some(joined) = chains.join_next().await {
            match joined {
                Ok((chain_id, Ok(()))) => tracing::info!("Chain {} stopped", chain_id),
                Ok((chain_id, Err(e))) => {
                    tracing::error!("Chain {} failed: {}", chain_id, e);
                    result = Err(e);
                }
                Err(e) => {
                    tracing::error!("Chain task panicked: {}", e);
                    result = Err(IngestionError::Task(e.to_string()));
                }
            }
        }

        executor.shutdown(config.side_effects.shutdown_grace()).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::internal::{cursor_operation, load_cursor};
    use crate::db::{MemoryStore, SingleChainRow, StateTransaction};
    use crate::indexer::testing::{self, ScriptedSource};
    use crate::transformations::event::nfts::NFTS_TABLE;
    use crate::transformations::event::uniswap::{POOLS_TABLE, VOLUMES_TABLE};
    use crate::types::config::chain::ChainConfig;
    use crate::types::config::contract::{AddressOrAddresses, ContractConfig, ContractKind};
    use crate::transformations::{
        EventContext, EventHandler, SideEffectContext, SideEffectError, SideEffectHandler,
        TransformationError,
    };
    use crate::types::config::ingestion::{IngestionConfig, RpcConfig, SideEffectsConfig};
    use alloy::primitives::{Address, U256};
    use async_trait::async_trait;
    use serde::Deserialize;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::time::Duration;

    const NFT: Address = Address::repeat_byte(0x10);
    const FACTORY: Address = Address::repeat_byte(0x20);
    const POOL: Address = Address::repeat_byte(0x30);

    fn chain(chain_id: u64, contracts: &[(&str, ContractKind, Option<Address>)]) -> ChainConfig {
        ChainConfig {
            name: format!("chain-{}", chain_id),
            chain_id,
            rpc_url_env_var: "RPC_URL".to_string(),
            start_block: Some(1),
            contracts: contracts
                .iter()
                .map(|(name, kind, address)| {
                    (
                        name.to_string(),
                        ContractConfig {
                            kind: *kind,
                            address: address.map(AddressOrAddresses::Single),
                            start_block: None,
                        },
                    )
                })
                .collect::<BTreeMap<_, _>>(),
            requests_per_second: None,
        }
    }

    fn config(chains: Vec<ChainConfig>) -> IndexerConfig {
        IndexerConfig {
            chains,
            ingestion: IngestionConfig {
                blocks_per_batch: 50,
                ingestion_rate_ms: 5,
                max_fetch_retries: 2,
                max_handler_retries: 1,
                retry_initial_delay_ms: 1,
                retry_max_delay_ms: 2,
            },
            side_effects: SideEffectsConfig {
                shutdown_grace_ms: 100,
                ..SideEffectsConfig::default()
            },
            rpc: RpcConfig::default(),
            database_url_env_var: "DATABASE_URL".to_string(),
            max_db_connections: 1,
            initial_state: None,
            reset_count: 0,
        }
    }

    async fn wait_for_cursor(store: &MemoryStore, chain_id: u64, block: u64) {
        for _ in 0..400 {
            if load_cursor(store, chain_id).await.unwrap() == Some(block) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("chain {} never reached block {}", chain_id, block);
    }

    #[tokio::test]
    async fn indexes_every_configured_chain_until_cancelled() {
        let config = config(vec![
            chain(1, &[("Punks", ContractKind::Erc721, Some(NFT))]),
            chain(
                10,
                &[
                    ("Factory", ContractKind::UniswapV3Factory, Some(FACTORY)),
                    ("UniswapV3Pool", ContractKind::UniswapV3Pool, None),
                ],
            ),
        ]);

        let source = Arc::new(ScriptedSource::new());
        source.set_head(1, 120);
        source.set_head(10, 30);
        source.push(1, testing::transfer(NFT, Address::ZERO, Address::repeat_byte(1), 1, 3, 0));
        source.push(1, testing::transfer(NFT, Address::ZERO, Address::repeat_byte(2), 2, 110, 0));
        source.push(
            10,
            testing::pool_created(FACTORY, Address::repeat_byte(3), Address::repeat_byte(4), POOL, 5, 0),
        );
        source.push(10, testing::swap(POOL, "10", "-20", 6, 0));

        let store = Arc::new(MemoryStore::new());
        let cancel = CancellationToken::new();
        let indexer: Indexer = Indexer::new(config).with_configured_contracts().unwrap();
        let run = tokio::spawn(indexer.run(store.clone(), source.clone(), cancel.clone()));

        wait_for_cursor(&store, 1, 120).await;
        wait_for_cursor(&store, 10, 30).await;
        cancel.cancel();
        run.await.unwrap().unwrap();

        assert_eq!(store.rows(NFTS_TABLE).await.len(), 2);
        assert_eq!(store.rows(POOLS_TABLE).await.len(), 1);
        assert_eq!(store.rows(VOLUMES_TABLE).await.len(), 2);

        // a restart picks the pool up from the registry table
        let restarted = ContractRegistry::new();
        assert_eq!(restarted.load_persisted(store.as_ref()).await.unwrap(), 1);
        assert!(restarted.contains(10, POOL, "UniswapV3Pool").await);
    }

    #[tokio::test]
    async fn configured_types_need_handlers() {
        let config = config(vec![chain(1, &[("Punks", ContractKind::Erc721, Some(NFT))])]);
        let err = Indexer::<()>::new(config)
            .run(
                Arc::new(MemoryStore::new()),
                Arc::new(ScriptedSource::new()),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IngestionError::Config(msg) if msg.contains("Punks")));
    }

    #[tokio::test]
    async fn a_failing_chain_is_reported() {
        let config = config(vec![chain(7, &[("Punks", ContractKind::Erc721, Some(NFT))])]);
        // no head for chain 7
        let err = Indexer::<()>::new(config)
            .with_configured_contracts()
            .unwrap()
            .run(
                Arc::new(MemoryStore::new()),
                Arc::new(ScriptedSource::new()),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IngestionError::FetchFailed { chain_id: 7, .. }));
    }


    #[tokio::test]
    async fn a_failed_chain_is_reported_after_the_others_stop() {
        let config = config(vec![
            chain(1, &[("Punks", ContractKind::Erc721, Some(NFT))]),
            chain(7, &[("Punks", ContractKind::Erc721, Some(NFT))]),
        ]);
        let source = Arc::new(ScriptedSource::new());
        source.set_head(1, 120);
        source.push(1, testing::transfer(NFT, Address::ZERO, Address::repeat_byte(1), 1, 110, 0));

        let store = Arc::new(MemoryStore::new());
        let cancel = CancellationToken::new();
        let indexer: Indexer = Indexer::new(config).with_configured_contracts().unwrap();
        let run = tokio::spawn(indexer.run(store.clone(), source.clone(), cancel.clone()));

        // chain 7 has no head and gives up; chain 1 carries on
        wait_for_cursor(&store, 1, 120).await;
        assert!(!run.is_finished());
        cancel.cancel();
        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err, IngestionError::FetchFailed { chain_id: 7, .. }));
        assert_eq!(store.rows(NFTS_TABLE).await.len(), 1);
    }

    #[tokio::test]
    async fn raising_the_reset_count_reindexes_from_the_start() {
        let source = Arc::new(ScriptedSource::new());
        source.set_head(1, 120);
        source.push(1, testing::transfer(NFT, Address::ZERO, Address::repeat_byte(1), 1, 3, 0));
        source.push(1, testing::transfer(NFT, Address::ZERO, Address::repeat_byte(2), 2, 110, 0));
        let store = Arc::new(MemoryStore::new());

        // runs until chain 1 is at its head with `nfts` projected tokens
        let run_until_caught_up = |reset_count: u64, nfts: usize| {
            let mut config = config(vec![chain(1, &[("Punks", ContractKind::Erc721, Some(NFT))])]);
            config.reset_count = reset_count;
            let store = store.clone();
            let source = source.clone();
            async move {
                let cancel = CancellationToken::new();
                let indexer: Indexer = Indexer::new(config).with_configured_contracts().unwrap();
                let run = tokio::spawn(indexer.run(store.clone(), source, cancel.clone()));
                for _ in 0..400 {
                    let cursor = load_cursor(store.as_ref(), 1).await.unwrap();
                    if cursor == Some(120) && store.rows(NFTS_TABLE).await.len() == nfts {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                cancel.cancel();
                run.await.unwrap().unwrap();
            }
        };

        run_until_caught_up(0, 2).await;
        assert_eq!(store.rows(NFTS_TABLE).await.len(), 2);

        // a row the handlers never wrote
        let mut tx = store.begin().await.unwrap();
        tx.execute(
            &SingleChainRow::new(NFTS_TABLE)
                .key("contract_address", NFT)
                .key("token_id", U256::from(99u64))
                .set("owner_address", Address::repeat_byte(9))
                .set("last_transfer_block", 50u64)
                .into_operation(1),
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.rows(NFTS_TABLE).await.len(), 3);

        let before = source.calls().len();
        run_until_caught_up(1, 2).await;
        let refetched = source.calls()[before..].iter().any(|c| c.from_block == 1);
        assert!(refetched);
        assert_eq!(store.rows(NFTS_TABLE).await.len(), 2);

        // the same count again does not start over
        let before = source.calls().len();
        run_until_caught_up(1, 2).await;
        assert!(source.calls()[before..].is_empty());
        assert_eq!(load_cursor(store.as_ref(), 1).await.unwrap(), Some(120));
    }

    #[tokio::test]
    async fn reset_clears_a_stale_cursor() {
        let store = Arc::new(MemoryStore::new());
        MigrationRunner::new().run(store.as_ref()).await.unwrap();
        let mut tx = store.begin().await.unwrap();
        tx.execute(&cursor_operation(1, 500)).await.unwrap();
        tx.commit().await.unwrap();

        let mut config = config(vec![chain(1, &[("Punks", ContractKind::Erc721, Some(NFT))])]);
        config.reset_count = 1;
        let source = Arc::new(ScriptedSource::new());
        source.set_head(1, 120);
        source.push(1, testing::transfer(NFT, Address::ZERO, Address::repeat_byte(1), 1, 3, 0));

        let cancel = CancellationToken::new();
        let indexer: Indexer = Indexer::new(config).with_configured_contracts().unwrap();
        let run = tokio::spawn(indexer.run(store.clone(), source, cancel.clone()));
        wait_for_cursor(&store, 1, 120).await;
        cancel.cancel();
        run.await.unwrap().unwrap();
        assert_eq!(store.rows(NFTS_TABLE).await.len(), 1);
    }

    #[derive(Debug, Clone, Default, Deserialize)]
    struct Mints {
        count: u64,
    }

    struct CountMints;

    #[async_trait]
    impl EventHandler<Mints> for CountMints {
        fn name(&self) -> &'static str {
            "CountMints"
        }

        fn abi(&self) -> &'static str {
            testing::TRANSFER
        }

        async fn handle_event(
            &self,
            ctx: &mut EventContext<'_, Mints>,
        ) -> Result<(), TransformationError> {
            ctx.state_mut().count += 1;
            Ok(())
        }
    }

    struct RecordCount {
        seen: Arc<std::sync::Mutex<Vec<u64>>>,
    }

    #[async_trait]
    impl SideEffectHandler<Mints> for RecordCount {
        fn name(&self) -> &'static str {
            "RecordCount"
        }

        fn abi(&self) -> &'static str {
            testing::TRANSFER
        }

        async fn handle_event(&self, ctx: SideEffectContext<Mints>) -> Result<(), SideEffectError> {
            self.seen.lock().unwrap().push(ctx.state.count);
            Ok(())
        }
    }

    #[tokio::test]
    async fn shared_state_starts_from_the_configured_value() {
        let mut config = config(vec![chain(1, &[])]);
        config.initial_state = Some(json!({ "count": 10 }));
        let source = Arc::new(ScriptedSource::new());
        source.set_head(1, 120);
        source.push(1, testing::transfer(NFT, Address::ZERO, Address::repeat_byte(1), 1, 3, 0));
        source.push(1, testing::transfer(NFT, Address::ZERO, Address::repeat_byte(2), 2, 110, 0));

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let contract = Contract::new("Counter")
            .add_event_handler(CountMints)
            .add_side_effect_handler(RecordCount {
                seen: Arc::clone(&seen),
            })
            .add_address(1, NFT, 1);

        let store = Arc::new(MemoryStore::new());
        let cancel = CancellationToken::new();
        let indexer: Indexer<Mints> = Indexer::new(config).add_contract(contract);
        let run = tokio::spawn(indexer.run(store.clone(), source, cancel.clone()));
        wait_for_cursor(&store, 1, 120).await;
        cancel.cancel();
        run.await.unwrap().unwrap();

        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec![11, 12]);
    }

    #[tokio::test]
    async fn initial_state_must_match_the_state_type() {
        let mut config = config(vec![chain(1, &[])]);
        config.initial_state = Some(json!({ "count": "many" }));
        let err = Indexer::<Mints>::new(config)
            .run(
                Arc::new(MemoryStore::new()),
                Arc::new(ScriptedSource::new()),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IngestionError::Config(msg) if msg.contains("initial_state")));
    }
}
