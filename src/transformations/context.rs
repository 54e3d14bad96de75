//! What handlers see while they run.
//!
//! Pure handlers get an [`EventContext`], which borrows the open batch
//! transaction. Side-effect handlers get a [`SideEffectContext`], which owns
//! nothing but the event and a snapshot of the shared state, so there is no
//! way for them to reach the store or the contract registry.

use std::str::FromStr;
use std::sync::Arc;

use alloy::primitives::{Address, B256, I256, U256};
use serde::de::DeserializeOwned;

use super::error::TransformationError;
use crate::db::types::{address_hex, CHAIN_ID_COLUMN};
use crate::db::{DbValue, MultiChainRow, SingleChainRow, StateTransaction};
use crate::indexer::contracts::WatchedContract;

/// A decoded parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedValue {
    Address(Address),
    Uint(U256),
    Int(I256),
    Bool(bool),
    FixedBytes(Vec<u8>),
    Bytes(Vec<u8>),
    String(String),
    Array(Vec<DecodedValue>),
    Tuple(Vec<DecodedValue>),
    /// Indexed dynamic value; only its keccak256 hash is on chain.
    Hash(B256),
}

impl DecodedValue {
    pub fn as_address(&self) -> Option<Address> {
        match self {
            DecodedValue::Address(a) => Some(*a),
            _ => None,
        }
    }

    /// Lowercase `0x`-prefixed hex.
    pub fn as_address_string(&self) -> Option<String> {
        self.as_address().map(|a| address_hex(&a.into_array()))
    }

    pub fn as_uint256(&self) -> Option<U256> {
        match self {
            DecodedValue::Uint(v) => Some(*v),
            DecodedValue::Int(v) if !v.is_negative() => Some(v.into_raw()),
            DecodedValue::String(s) => U256::from_str(s.trim()).ok(),
            _ => None,
        }
    }

    pub fn as_int256(&self) -> Option<I256> {
        match self {
            DecodedValue::Int(v) => Some(*v),
            DecodedValue::Uint(v) => I256::try_from(*v).ok(),
            DecodedValue::String(s) => I256::from_str(s.trim()).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.as_uint256().and_then(|v| u64::try_from(v).ok())
    }

    /// For fee tiers.
    pub fn as_u32(&self) -> Option<u32> {
        self.as_uint256().and_then(|v| u32::try_from(v).ok())
    }

    /// For ticks.
    pub fn as_i32(&self) -> Option<i32> {
        self.as_int256().and_then(|v| v.to_string().parse().ok())
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DecodedValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            DecodedValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            DecodedValue::Bytes(b) | DecodedValue::FixedBytes(b) => Some(b),
            DecodedValue::Hash(h) => Some(h.as_slice()),
            DecodedValue::Address(a) => Some(a.as_slice()),
            _ => None,
        }
    }

    /// Decimal rendering of integer values, for NUMERIC columns.
    pub fn to_numeric_string(&self) -> Option<String> {
        match self {
            DecodedValue::Uint(v) => Some(v.to_string()),
            DecodedValue::Int(v) => Some(v.to_string()),
            DecodedValue::String(s) => {
                let s = s.trim();
                (U256::from_str(s).is_ok() || I256::from_str(s).is_ok()).then(|| s.to_string())
            }
            _ => None,
        }
    }
}

/// A log decoded against its contract type's signature.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    pub chain_id: u64,
    pub contract_address: Address,
    pub contract_type: String,
    pub event_name: String,
    pub topic0: B256,
    pub block_number: u64,
    pub block_timestamp: u64,
    pub transaction_hash: B256,
    pub transaction_index: u64,
    pub log_index: u64,
    /// Parameters in declaration order.
    pub params: Vec<(String, DecodedValue)>,
}

impl DecodedEvent {
    /// Get a parameter by name, returning an error if missing.
    pub fn get(&self, name: &str) -> Result<&DecodedValue, TransformationError> {
        self.try_get(name)
            .ok_or_else(|| TransformationError::MissingField(name.to_string()))
    }

    pub fn try_get(&self, name: &str) -> Option<&DecodedValue> {
        self.params.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn ordering_key(&self) -> (u64, u64, u64, u64) {
        (
            self.chain_id,
            self.block_number,
            self.transaction_index,
            self.log_index,
        )
    }
}

/// Everything a batch accumulates besides its row writes.
#[derive(Debug, Default)]
pub struct PendingBatch {
    pub registrations: Vec<WatchedContract>,
    pub writes: usize,
    pub dispatched: usize,
    /// Events with side-effect handlers, run once the batch commits.
    pub side_effects: Vec<DecodedEvent>,
}

/// Context for a pure handler. Writes go straight into the batch
/// transaction, so later handlers in the same batch read them back.
pub struct EventContext<'a, S = ()> {
    pub event: &'a DecodedEvent,
    state: &'a mut S,
    tx: &'a mut dyn StateTransaction,
    pending: &'a mut PendingBatch,
}

impl<'a, S> EventContext<'a, S> {
    pub(crate) fn new(
        event: &'a DecodedEvent,
        state: &'a mut S,
        tx: &'a mut dyn StateTransaction,
        pending: &'a mut PendingBatch,
    ) -> Self {
        Self {
            event,
            state,
            tx,
            pending,
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.event.chain_id
    }

    pub fn state(&self) -> &S {
        self.state
    }

    /// Mutations are kept only if the batch commits.
    pub fn state_mut(&mut self) -> &mut S {
        self.state
    }

    /// Insert or overwrite a row keyed within this event's chain.
    pub async fn upsert_single_chain(
        &mut self,
        row: SingleChainRow,
    ) -> Result<(), TransformationError> {
        let op = row.into_operation(self.event.chain_id);
        self.tx.execute(&op).await?;
        self.pending.writes += 1;
        Ok(())
    }

    /// Insert a chain-agnostic row or merge into the existing one.
    pub async fn upsert_multi_chain(
        &mut self,
        row: MultiChainRow,
    ) -> Result<(), TransformationError> {
        let op = row.into_operation();
        self.tx.execute(&op).await?;
        self.pending.writes += 1;
        Ok(())
    }

    /// Read a row of this chain, including rows written earlier in the batch.
    pub async fn read_one<T: DeserializeOwned>(
        &mut self,
        table: &str,
        filters: &[(&str, DbValue)],
    ) -> Result<Option<T>, TransformationError> {
        let mut scoped = Vec::with_capacity(filters.len() + 1);
        scoped.push((CHAIN_ID_COLUMN, DbValue::Uint64(self.event.chain_id)));
        scoped.extend(filters.iter().cloned());
        self.read(table, &scoped).await
    }

    pub async fn read_one_multi_chain<T: DeserializeOwned>(
        &mut self,
        table: &str,
        filters: &[(&str, DbValue)],
    ) -> Result<Option<T>, TransformationError> {
        self.read(table, filters).await
    }

    async fn read<T: DeserializeOwned>(
        &mut self,
        table: &str,
        filters: &[(&str, DbValue)],
    ) -> Result<Option<T>, TransformationError> {
        self.tx
            .query_one(table, filters)
            .await?
            .map(|row| {
                serde_json::from_value(row).map_err(|e| {
                    TransformationError::TypeConversion(format!("row of {}: {}", table, e))
                })
            })
            .transpose()
    }

    /// Start watching `address` as `contract_type` on this chain from the
    /// block after the current event.
    pub fn register_contract(&mut self, contract_type: impl Into<String>, address: Address) {
        self.pending.registrations.push(WatchedContract {
            chain_id: self.event.chain_id,
            address,
            contract_type: contract_type.into(),
            start_block: self.event.block_number + 1,
        });
    }
}

/// Context for a side-effect handler, built after the batch committed.
pub struct SideEffectContext<S = ()> {
    pub event: Arc<DecodedEvent>,
    pub state: Arc<S>,
}

impl<S> SideEffectContext<S> {
    pub fn chain_id(&self) -> u64 {
        self.event.chain_id
    }
}

impl<S> Clone for SideEffectContext<S> {
    fn clone(&self) -> Self {
        Self {
            event: Arc::clone(&self.event),
            state: Arc::clone(&self.state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryStore, ProjectionStore};
    use serde::Deserialize;

    fn event(block: u64) -> DecodedEvent {
        DecodedEvent {
            chain_id: 7,
            contract_address: Address::repeat_byte(1),
            contract_type: "NFT".to_string(),
            event_name: "Transfer".to_string(),
            topic0: B256::repeat_byte(5),
            block_number: block,
            block_timestamp: 1_700_000_000,
            transaction_hash: B256::repeat_byte(9),
            transaction_index: 0,
            log_index: 0,
            params: vec![("tokenId".to_string(), DecodedValue::Uint(U256::from(42u64)))],
        }
    }

    #[derive(Debug, Deserialize)]
    struct Owner {
        chain_id: u64,
        owner_address: String,
    }

    #[test]
    fn accessors_convert_between_widths() {
        let big = DecodedValue::Uint(U256::MAX);
        assert_eq!(big.as_u64(), None);
        assert_eq!(big.to_numeric_string(), Some(U256::MAX.to_string()));
        assert_eq!(DecodedValue::Uint(U256::from(3000u64)).as_u32(), Some(3000));
        assert_eq!(DecodedValue::Int(I256::from_dec_str("-887272").unwrap()).as_i32(), Some(-887272));
        assert_eq!(DecodedValue::Int(I256::from_dec_str("-1").unwrap()).as_uint256(), None);
        assert_eq!(DecodedValue::String("12".into()).as_u64(), Some(12));
        assert_eq!(DecodedValue::Bool(true).as_address(), None);
    }

    #[test]
    fn missing_params_are_errors() {
        let ev = event(1);
        assert!(ev.get("tokenId").is_ok());
        assert!(matches!(ev.get("owner"), Err(TransformationError::MissingField(f)) if f == "owner"));
    }

    #[derive(Debug, Deserialize)]
    struct Token {
        token_id: U256,
    }

    #[derive(Debug, Deserialize)]
    struct TokenText {
        token_id: String,
    }

    #[tokio::test]
    async fn wide_integers_read_back_exactly() {
        let token_id = U256::from(10u64).pow(U256::from(30u64)) + U256::from(1u64);
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let mut pending = PendingBatch::default();
        let mut state = ();
        let ev = event(10);
        let mut ctx = EventContext::new(&ev, &mut state, tx.as_mut(), &mut pending);

        ctx.upsert_single_chain(
            SingleChainRow::new("nfts")
                .key("token_id", token_id)
                .set("owner_address", "0xabc"),
        )
        .await
        .unwrap();

        let filters = [("token_id", DbValue::from(token_id))];
        let row: Token = ctx.read_one("nfts", &filters).await.unwrap().unwrap();
        assert_eq!(row.token_id, token_id);
        let row: TokenText = ctx.read_one("nfts", &filters).await.unwrap().unwrap();
        assert_eq!(row.token_id, "1000000000000000000000000000001");
    }

    #[tokio::test]
    async fn reads_are_scoped_to_the_event_chain() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let mut pending = PendingBatch::default();
        let mut state = ();
        let ev = event(10);

        {
            let mut ctx = EventContext::new(&ev, &mut state, tx.as_mut(), &mut pending);
            ctx.upsert_single_chain(
                SingleChainRow::new("nfts")
                    .key("token_id", 42u64)
                    .set("owner_address", "0xabc"),
            )
            .await
            .unwrap();

            let row: Option<Owner> = ctx
                .read_one("nfts", &[("token_id", DbValue::Uint64(42))])
                .await
                .unwrap();
            let row = row.unwrap();
            assert_eq!(row.chain_id, 7);
            assert_eq!(row.owner_address, "0xabc");

            ctx.register_contract("Pool", Address::repeat_byte(2));
        }

        let other_chain = event(10);
        let other_chain = DecodedEvent { chain_id: 8, ..other_chain };
        let mut ctx = EventContext::new(&other_chain, &mut state, tx.as_mut(), &mut pending);
        let row: Option<Owner> = ctx
            .read_one("nfts", &[("token_id", DbValue::Uint64(42))])
            .await
            .unwrap();
        assert!(row.is_none());

        assert_eq!(pending.writes, 1);
        assert_eq!(pending.registrations.len(), 1);
        assert_eq!(pending.registrations[0].start_block, 11);
        assert_eq!(pending.registrations[0].chain_id, 7);
    }
}
