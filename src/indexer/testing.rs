//! In-memory chain for the ingestion tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use alloy::dyn_abi::DynSolValue;
use alloy::primitives::{Address, Bytes, B256, I256, U256};
use async_trait::async_trait;

use crate::decoding::ParsedEvent;
use crate::rpc::{FetchError, LogSource, RawLog, RpcError};

pub const TRANSFER: &str =
    "Transfer(address indexed from, address indexed to, uint256 indexed tokenId)";
pub const POOL_CREATED: &str = "PoolCreated(address indexed token0, address indexed token1, uint24 indexed fee, int24 tickSpacing, address pool)";
pub const SWAP: &str = "Swap(address indexed sender, address indexed recipient, int256 amount0, int256 amount1, uint160 sqrtPriceX96, uint128 liquidity, int24 tick)";

#[derive(Debug, Clone, PartialEq)]
pub struct FetchCall {
    pub chain_id: u64,
    pub addresses: Vec<Address>,
    pub from_block: u64,
    pub to_block: u64,
}

/// A [`LogSource`] serving canned logs per chain, optionally failing the
/// first few `eth_getLogs` calls or never answering for some addresses.
#[derive(Default)]
pub struct ScriptedSource {
    heads: Mutex<HashMap<u64, u64>>,
    logs: Mutex<HashMap<u64, Vec<RawLog>>>,
    failures_left: AtomicU32,
    calls: Mutex<Vec<FetchCall>>,
    unresponsive: Mutex<HashSet<Address>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_head(&self, chain_id: u64, head: u64) {
        self.heads.lock().unwrap().insert(chain_id, head);
    }

    pub fn push(&self, chain_id: u64, log: RawLog) {
        self.logs.lock().unwrap().entry(chain_id).or_default().push(log);
    }

    pub fn fail_next_fetches(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// `eth_getLogs` calls that include `address` never return.
    pub fn hang_on(&self, address: Address) {
        self.unresponsive.lock().unwrap().insert(address);
    }

    pub fn calls(&self) -> Vec<FetchCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl LogSource for ScriptedSource {
    async fn fetch_logs(
        &self,
        chain_id: u64,
        addresses: &[Address],
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<RawLog>, FetchError> {
        self.calls.lock().unwrap().push(FetchCall {
            chain_id,
            addresses: addresses.to_vec(),
            from_block,
            to_block,
        });

        let hangs = {
            let unresponsive = self.unresponsive.lock().unwrap();
            addresses.iter().any(|a| unresponsive.contains(a))
        };
        if hangs {
            return std::future::pending().await;
        }

        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(FetchError::Rpc {
                chain_id,
                source: RpcError::Transport("connection reset by peer".to_string()),
            });
        }

        let logs = self.logs.lock().unwrap();
        let mut matching: Vec<RawLog> = logs
            .get(&chain_id)
            .map(|logs| {
                logs.iter()
                    .filter(|l| addresses.contains(&l.address))
                    .filter(|l| (from_block..=to_block).contains(&l.block_number))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        matching.sort_by_key(RawLog::position);
        Ok(matching)
    }

    async fn current_head(&self, chain_id: u64) -> Result<u64, FetchError> {
        self.heads
            .lock()
            .unwrap()
            .get(&chain_id)
            .copied()
            .ok_or(FetchError::UnknownChain(chain_id))
    }
}

fn topic0(signature: &str) -> B256 {
    ParsedEvent::from_signature(signature).unwrap().topic0
}

fn raw(address: Address, topics: Vec<B256>, data: Vec<u8>, block: u64, log_index: u64) -> RawLog {
    RawLog {
        address,
        topics,
        data: Bytes::from(data),
        block_number: block,
        block_timestamp: 1_700_000_000 + block * 12,
        transaction_hash: B256::from(U256::from(block * 1000 + log_index)),
        transaction_index: 0,
        log_index,
    }
}

pub fn transfer(
    nft: Address,
    from: Address,
    to: Address,
    token_id: u64,
    block: u64,
    log_index: u64,
) -> RawLog {
    raw(
        nft,
        vec![
            topic0(TRANSFER),
            from.into_word(),
            to.into_word(),
            B256::from(U256::from(token_id)),
        ],
        Vec::new(),
        block,
        log_index,
    )
}

pub fn pool_created(
    factory: Address,
    token0: Address,
    token1: Address,
    pool: Address,
    block: u64,
    log_index: u64,
) -> RawLog {
    let data = DynSolValue::Tuple(vec![
        DynSolValue::Int(I256::from_dec_str("60").unwrap(), 24),
        DynSolValue::Address(pool),
    ])
    .abi_encode_params();
    raw(
        factory,
        vec![
            topic0(POOL_CREATED),
            token0.into_word(),
            token1.into_word(),
            B256::from(U256::from(3000u64)),
        ],
        data,
        block,
        log_index,
    )
}

/// A swap with decimal amounts, negative for tokens leaving the pool.
pub fn swap(pool: Address, amount0: &str, amount1: &str, block: u64, log_index: u64) -> RawLog {
    let data = DynSolValue::Tuple(vec![
        DynSolValue::Int(I256::from_dec_str(amount0).unwrap(), 256),
        DynSolValue::Int(I256::from_dec_str(amount1).unwrap(), 256),
        DynSolValue::Uint(U256::from(1u64) << 96, 160),
        DynSolValue::Uint(U256::from(1_000_000u64), 128),
        DynSolValue::Int(I256::from_dec_str("0").unwrap(), 24),
    ])
    .abi_encode_params();
    raw(
        pool,
        vec![
            topic0(SWAP),
            Address::repeat_byte(0xee).into_word(),
            Address::repeat_byte(0xef).into_word(),
        ],
        data,
        block,
        log_index,
    )
}
