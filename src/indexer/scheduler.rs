//! The per-chain ingestion loop.
//!
//! Each cycle reads the chain cursor, fetches the logs of every watched
//! contract for the next block range and dispatches them in
//! `(block, transaction index, log index)` order inside one store
//! transaction. Contracts registered while the batch runs are dispatched in
//! the same batch: the attempt is rolled back, their logs are fetched with
//! no transaction or lock held, and the batch runs again. Projected rows,
//! new registrations and the advanced cursor commit together; after the
//! commit the shared state is published and side effects are queued.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use super::contracts::{ContractRegistry, WatchedContract};
use super::error::IngestionError;
use crate::db::internal::{cursor_operation, load_cursor, read_cursor};
use crate::db::{DbError, ProjectionStore, StateTransaction};
use crate::rpc::{FetchError, LogSource, RawLog, Retryable};
use crate::transformations::{
    Dispatcher, PendingBatch, SharedState, SideEffectQueue, TransformationError,
};
use crate::types::config::ingestion::IngestionConfig;

/// The last committed shared state, swapped wholesale on every commit.
pub type StateCell<S> = Arc<Mutex<Arc<S>>>;

/// What a chain loop is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    Idle,
    Fetching,
    Dispatching,
    Committing,
    Backoff { attempt: u32 },
    Paused,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub from_block: u64,
    pub to_block: u64,
    pub logs: usize,
    pub events: usize,
    pub writes: usize,
    pub registrations: usize,
    pub side_effects: usize,
}

/// Outcome of one [`ChainIngestor::poll_once`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cycle {
    /// Nothing new below the chain head.
    CaughtUp { head: u64 },
    Committed(BatchReport),
    /// Another run already committed the range.
    AlreadyCommitted { to_block: u64 },
    Cancelled,
}

/// Handles shared by every chain loop of one indexer.
pub struct EngineParts<S: SharedState = ()> {
    pub source: Arc<dyn LogSource>,
    pub store: Arc<dyn ProjectionStore>,
    pub contracts: Arc<ContractRegistry>,
    pub dispatcher: Arc<Dispatcher<S>>,
    pub state: StateCell<S>,
}

impl<S: SharedState> Clone for EngineParts<S> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            store: Arc::clone(&self.store),
            contracts: Arc::clone(&self.contracts),
            dispatcher: Arc::clone(&self.dispatcher),
            state: Arc::clone(&self.state),
        }
    }
}

enum BatchFailure {
    Storage(DbError),
    Handler(TransformationError),
}

/// Result of one pass over a batch.
enum Attempt<T> {
    Done(T),
    /// The cursor already covers the range.
    Covered,
    /// A contract registered during the pass needs its logs fetched before
    /// the batch can run to completion.
    Discover(WatchedContract),
}

/// Logs of contracts registered mid-batch, by (address, start block).
type Discovered = HashMap<(Address, u64), Vec<RawLog>>;

impl From<DbError> for BatchFailure {
    fn from(e: DbError) -> Self {
        BatchFailure::Storage(e)
    }
}

impl From<TransformationError> for BatchFailure {
    fn from(e: TransformationError) -> Self {
        match e {
            TransformationError::DatabaseError(e) => BatchFailure::Storage(e),
            other => BatchFailure::Handler(other),
        }
    }
}

struct Dispatched<S> {
    from_block: u64,
    state: S,
    pending: PendingBatch,
    logs: usize,
}

struct Committed<S> {
    from_block: u64,
    state: Arc<S>,
    pending: PendingBatch,
    logs: usize,
}

pub struct ChainIngestor<S: SharedState = ()> {
    chain_id: u64,
    name: String,
    start_block: Option<u64>,
    config: IngestionConfig,
    parts: EngineParts<S>,
    side_effects: Option<SideEffectQueue<S>>,
    status: watch::Sender<ChainState>,
}

impl<S: SharedState> ChainIngestor<S> {
    pub fn new(
        chain_id: u64,
        name: impl Into<String>,
        parts: EngineParts<S>,
        config: IngestionConfig,
    ) -> Self {
        let (status, _) = watch::channel(ChainState::Idle);
        Self {
            chain_id,
            name: name.into(),
            start_block: None,
            config,
            parts,
            side_effects: None,
            status,
        }
    }

    /// Where to begin when the chain has no cursor and no watched contract
    /// says otherwise.
    pub fn with_start_block(mut self, start_block: Option<u64>) -> Self {
        self.start_block = start_block;
        self
    }

    pub fn with_side_effects(mut self, queue: SideEffectQueue<S>) -> Self {
        self.side_effects = Some(queue);
        self
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn subscribe(&self) -> watch::Receiver<ChainState> {
        self.status.subscribe()
    }

    fn set_state(&self, state: ChainState) {
        self.status.send_replace(state);
    }

    /// Poll until cancelled or a failure exhausts its retry budget.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), IngestionError> {
        tracing::info!(
            "Starting ingestion for chain {} ({})",
            self.name,
            self.chain_id
        );

        loop {
            match self.poll_once(&cancel).await {
                Ok(Cycle::Cancelled) => break,
                Ok(Cycle::Committed(report)) => tracing::info!(
                    "Chain {}: committed blocks {}-{} ({} logs, {} events, {} writes, {} new contracts)",
                    self.chain_id,
                    report.from_block,
                    report.to_block,
                    report.logs,
                    report.events,
                    report.writes,
                    report.registrations
                ),
                Ok(Cycle::CaughtUp { head }) => {
                    tracing::debug!("Chain {} is at head {}", self.chain_id, head)
                }
                Ok(Cycle::AlreadyCommitted { to_block }) => tracing::debug!(
                    "Chain {}: blocks up to {} were already committed",
                    self.chain_id,
                    to_block
                ),
                Err(e) => {
                    self.set_state(ChainState::Failed);
                    tracing::error!("Chain {} ({}) stopped: {}", self.name, self.chain_id, e);
                    return Err(e);
                }
            }

            self.set_state(ChainState::Idle);
            if !pause(&cancel, self.config.ingestion_rate()).await {
                break;
            }
        }

        self.set_state(ChainState::Paused);
        tracing::info!("Chain {} ({}) paused", self.name, self.chain_id);
        Ok(())
    }

    /// One cycle: pick the next block range and ingest it.
    pub async fn poll_once(&self, cancel: &CancellationToken) -> Result<Cycle, IngestionError> {
        if cancel.is_cancelled() {
            return Ok(Cycle::Cancelled);
        }
        self.set_state(ChainState::Fetching);

        let chain_id = self.chain_id;
        let source = &self.parts.source;
        let head = match self
            .with_backoff("eth_blockNumber", cancel, move || source.current_head(chain_id))
            .await
        {
            Ok(Some(head)) => head,
            Ok(None) => return Ok(Cycle::Cancelled),
            Err((source, attempts)) => {
                return Err(IngestionError::FetchFailed {
                    chain_id,
                    attempts,
                    source,
                })
            }
        };

        let next_block = self.next_block(cancel).await?;
        let Some(next_block) = next_block else {
            return Ok(Cycle::Cancelled);
        };
        if head < next_block {
            return Ok(Cycle::CaughtUp { head });
        }

        let span = self.config.blocks_per_batch.max(1) - 1;
        let to_block = next_block.saturating_add(span).min(head);
        self.ingest_range(next_block, to_block, cancel).await
    }

    async fn next_block(&self, cancel: &CancellationToken) -> Result<Option<u64>, IngestionError> {
        let chain_id = self.chain_id;
        let store = &self.parts.store;
        let cursor = match self
            .with_backoff("cursor read", cancel, move || load_cursor(store.as_ref(), chain_id))
            .await
        {
            Ok(Some(cursor)) => cursor,
            Ok(None) => return Ok(None),
            Err((e, _)) => return Err(IngestionError::Storage(e)),
        };

        if let Some(last) = cursor {
            return Ok(Some(last + 1));
        }
        let earliest = self
            .parts
            .contracts
            .list_active(self.chain_id)
            .await
            .iter()
            .map(|c| c.start_block)
            .min();
        Ok(Some(earliest.or(self.start_block).unwrap_or(0)))
    }

    /// Ingest `[from_block, to_block]`, retrying within the configured
    /// budgets. Ranges the cursor already covers are not dispatched again.
    pub async fn ingest_range(
        &self,
        from_block: u64,
        to_block: u64,
        cancel: &CancellationToken,
    ) -> Result<Cycle, IngestionError> {
        let contracts: Vec<WatchedContract> = self
            .parts
            .contracts
            .list_active(self.chain_id)
            .await
            .into_iter()
            .filter(|c| c.start_block <= to_block)
            .collect();

        self.set_state(ChainState::Fetching);
        let logs = match self.fetch_watched(&contracts, from_block, to_block, cancel).await {
            Ok(Some(logs)) => logs,
            Ok(None) => return Ok(Cycle::Cancelled),
            Err((source, attempts)) => {
                return Err(IngestionError::FetchFailed {
                    chain_id: self.chain_id,
                    attempts,
                    source,
                })
            }
        };

        let backoff = self.config.backoff();
        let mut discovered = Discovered::new();
        let mut storage_failures = 0u32;
        let mut handler_failures = 0u32;

        loop {
            let attempt = self
                .process_batch(from_block, to_block, &contracts, &logs, &discovered)
                .await;
            let failure = match attempt {
                Ok(Attempt::Done(committed)) => return Ok(self.publish(committed, to_block).await),
                Ok(Attempt::Covered) => return Ok(Cycle::AlreadyCommitted { to_block }),
                Ok(Attempt::Discover(contract)) => {
                    self.set_state(ChainState::Fetching);
                    let key = (contract.address, contract.start_block);
                    let fetched = self
                        .fetch_watched(
                            std::slice::from_ref(&contract),
                            contract.start_block,
                            to_block,
                            cancel,
                        )
                        .await;
                    match fetched {
                        Ok(Some(found)) => {
                            discovered.insert(key, found);
                            continue;
                        }
                        Ok(None) => return Ok(Cycle::Cancelled),
                        Err((source, attempts)) => {
                            return Err(IngestionError::FetchFailed {
                                chain_id: self.chain_id,
                                attempts,
                                source,
                            })
                        }
                    }
                }
                Err(failure) => failure,
            };

            let (attempt, reason) = match failure {
                BatchFailure::Handler(source) => {
                    handler_failures += 1;
                    if handler_failures > self.config.max_handler_retries {
                        return Err(IngestionError::HandlerFailed {
                            chain_id: self.chain_id,
                            from_block,
                            to_block,
                            attempts: handler_failures,
                            source,
                        });
                    }
                    (handler_failures, source.to_string())
                }
                BatchFailure::Storage(source) => {
                    storage_failures += 1;
                    if !source.is_retryable() || storage_failures > self.config.max_fetch_retries {
                        return Err(IngestionError::StorageFailed {
                            chain_id: self.chain_id,
                            from_block,
                            to_block,
                            attempts: storage_failures,
                            source,
                        });
                    }
                    (storage_failures, source.to_string())
                }
            };

            let delay = backoff.delay_for_attempt(attempt);
            tracing::warn!(
                "Chain {}: batch {}-{} rolled back (attempt {}), retrying in {:?}: {}",
                self.chain_id,
                from_block,
                to_block,
                attempt,
                delay,
                reason
            );
            self.set_state(ChainState::Backoff { attempt });
            if !pause(cancel, delay).await {
                return Ok(Cycle::Cancelled);
            }
        }
    }

    /// Logs of `contracts` over the range. An address is never fetched
    /// below the earliest start block it is watched from.
    async fn fetch_watched(
        &self,
        contracts: &[WatchedContract],
        from_block: u64,
        to_block: u64,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<RawLog>>, (FetchError, u32)> {
        let mut earliest: BTreeMap<Address, u64> = BTreeMap::new();
        for contract in contracts {
            let start = contract.start_block.max(from_block);
            earliest
                .entry(contract.address)
                .and_modify(|s| *s = (*s).min(start))
                .or_insert(start);
        }
        let mut groups: BTreeMap<u64, Vec<Address>> = BTreeMap::new();
        for (address, start) in earliest {
            groups.entry(start).or_default().push(address);
        }

        let chain_id = self.chain_id;
        let source = &self.parts.source;
        let mut logs = Vec::new();
        for (start, addresses) in &groups {
            let start = *start;
            let addresses = addresses.as_slice();
            match self
                .with_backoff("eth_getLogs", cancel, move || {
                    source.fetch_logs(chain_id, addresses, start, to_block)
                })
                .await?
            {
                Some(fetched) => logs.extend(fetched),
                None => return Ok(None),
            }
        }
        Ok(Some(logs))
    }

    /// Dispatch and commit one batch. Nothing in here talks to the chain,
    /// so the state lock is never held across an RPC call.
    async fn process_batch(
        &self,
        from_block: u64,
        to_block: u64,
        contracts: &[WatchedContract],
        logs: &[RawLog],
        discovered: &Discovered,
    ) -> Result<Attempt<Committed<S>>, BatchFailure> {
        // Held until the new state is published, so batches of different
        // chains apply their state changes one after another.
        let mut shared = self.parts.state.lock().await;
        let mut tx = self.parts.store.begin().await?;

        let dispatched = self
            .dispatch_batch(tx.as_mut(), &shared, from_block, to_block, contracts, logs, discovered)
            .await;

        match dispatched {
            Ok(Attempt::Done(batch)) => {
                self.set_state(ChainState::Committing);
                tx.commit().await?;
                let state = Arc::new(batch.state);
                *shared = Arc::clone(&state);
                Ok(Attempt::Done(Committed {
                    from_block: batch.from_block,
                    state,
                    pending: batch.pending,
                    logs: batch.logs,
                }))
            }
            Ok(Attempt::Covered) => {
                tx.rollback().await?;
                Ok(Attempt::Covered)
            }
            Ok(Attempt::Discover(contract)) => {
                tx.rollback().await?;
                Ok(Attempt::Discover(contract))
            }
            Err(failure) => {
                if let Err(e) = tx.rollback().await {
                    tracing::warn!("Chain {}: rollback failed: {}", self.chain_id, e);
                }
                Err(failure)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_batch(
        &self,
        tx: &mut dyn StateTransaction,
        committed: &S,
        from_block: u64,
        to_block: u64,
        contracts: &[WatchedContract],
        logs: &[RawLog],
        discovered: &Discovered,
    ) -> Result<Attempt<Dispatched<S>>, BatchFailure> {
        let from_block = match read_cursor(tx, self.chain_id).await? {
            Some(last) if last >= to_block => return Ok(Attempt::Covered),
            Some(last) if last >= from_block => last + 1,
            _ => from_block,
        };

        self.set_state(ChainState::Dispatching);
        let mut state = committed.clone();
        let mut pending = PendingBatch::default();

        let mut watched: HashMap<Address, Vec<(String, u64)>> = HashMap::new();
        for contract in contracts {
            watched
                .entry(contract.address)
                .or_default()
                .push((contract.contract_type.clone(), contract.start_block));
        }
        for types in watched.values_mut() {
            types.sort();
        }

        let mut queue: BTreeMap<(u64, u64, u64), RawLog> = logs
            .iter()
            .filter(|l| (from_block..=to_block).contains(&l.block_number))
            .map(|l| (l.position(), l.clone()))
            .collect();
        let mut total_logs = queue.len();
        let mut seen_registrations = 0;

        while let Some((_, log)) = queue.pop_first() {
            let contract_types: Vec<String> = match watched.get(&log.address) {
                Some(types) => types
                    .iter()
                    .filter(|(_, start)| *start <= log.block_number)
                    .map(|(t, _)| t.clone())
                    .collect(),
                None => continue,
            };

            for contract_type in contract_types {
                self.parts
                    .dispatcher
                    .dispatch_log(self.chain_id, &log, &contract_type, &mut state, tx, &mut pending)
                    .await?;

                while seen_registrations < pending.registrations.len() {
                    let registration = pending.registrations[seen_registrations].clone();
                    seen_registrations += 1;

                    let types = watched.entry(registration.address).or_default();
                    if types.iter().any(|(t, _)| *t == registration.contract_type) {
                        continue;
                    }
                    let newly_watched = types.is_empty();
                    types.push((registration.contract_type.clone(), registration.start_block));

                    // Logs of addresses already watched are in the queue.
                    if !newly_watched || registration.start_block > to_block {
                        continue;
                    }
                    let key = (registration.address, registration.start_block);
                    let Some(found) = discovered.get(&key) else {
                        return Ok(Attempt::Discover(registration));
                    };
                    for log in found.iter().cloned() {
                        if log.address == registration.address
                            && log.block_number >= registration.start_block
                        {
                            if let std::collections::btree_map::Entry::Vacant(slot) =
                                queue.entry(log.position())
                            {
                                slot.insert(log);
                                total_logs += 1;
                            }
                        }
                    }
                }
            }
        }

        for registration in &pending.registrations {
            tx.execute(&registration.registration_operation()).await?;
        }
        tx.execute(&cursor_operation(self.chain_id, to_block)).await?;

        Ok(Attempt::Done(Dispatched {
            from_block,
            state,
            pending,
            logs: total_logs,
        }))
    }

    /// Post-commit bookkeeping: watch the new contracts, queue side effects.
    async fn publish(&self, committed: Committed<S>, to_block: u64) -> Cycle {
        let Committed {
            from_block,
            state,
            pending,
            logs,
        } = committed;

        let registrations = self.parts.contracts.apply_dynamic(&pending.registrations).await;

        let jobs = self.parts.dispatcher.side_effect_jobs(pending.side_effects, &state);
        let side_effects = jobs.len();
        if let Some(queue) = &self.side_effects {
            for job in jobs {
                queue.submit(job);
            }
        }

        Cycle::Committed(BatchReport {
            from_block,
            to_block,
            logs,
            events: pending.dispatched,
            writes: pending.writes,
            registrations,
            side_effects,
        })
    }

    /// Run `op` until it succeeds, fails permanently or exhausts
    /// `max_fetch_retries`. `Ok(None)` when cancelled, whether `op` is in
    /// flight or backing off.
    async fn with_backoff<T, E, F, Fut>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<Option<T>, (E, u32)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let backoff = self.config.backoff();
        let mut failures = 0u32;
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                result = op() => result,
            };
            match result {
                Ok(value) => return Ok(Some(value)),
                Err(e) if e.is_retryable() && failures < self.config.max_fetch_retries => {
                    failures += 1;
                    let delay = backoff.delay_for_attempt(failures);
                    tracing::warn!(
                        "{} failed on chain {} (attempt {}/{}), retrying in {:?}: {}",
                        what,
                        self.chain_id,
                        failures,
                        self.config.max_fetch_retries + 1,
                        delay,
                        e
                    );
                    self.set_state(ChainState::Backoff { attempt: failures });
                    if !pause(cancel, delay).await {
                        return Ok(None);
                    }
                }
                Err(e) => return Err((e, failures + 1)),
            }
        }
    }
}

/// Sleep unless cancelled first. Returns false on cancellation.
async fn pause(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
