//! Out-of-band execution of side-effect handlers.
//!
//! Jobs arrive on a bounded queue once their batch has committed and run on
//! a worker pool. Whatever happens to a job is only logged; nothing flows
//! back into ingestion.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use super::context::SideEffectContext;
use super::traits::{SharedState, SideEffectHandler, SideEffectRetry};
use crate::rpc::{with_retry, RetryConfig};

pub struct SideEffectJob<S: SharedState = ()> {
    pub handler: Arc<dyn SideEffectHandler<S>>,
    pub ctx: SideEffectContext<S>,
}

#[derive(Debug, Clone)]
pub struct SideEffectConfig {
    pub concurrency: usize,
    pub queue_capacity: usize,
    /// Backoff for handlers that opted into retries.
    pub retry_initial_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for SideEffectConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            queue_capacity: 10_000,
            retry_initial_delay: Duration::from_millis(500),
            retry_max_delay: Duration::from_secs(30),
        }
    }
}

/// Sending half handed to the chain loops.
pub struct SideEffectQueue<S: SharedState = ()> {
    sender: mpsc::Sender<SideEffectJob<S>>,
}

impl<S: SharedState> Clone for SideEffectQueue<S> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<S: SharedState> SideEffectQueue<S> {
    /// Enqueue without waiting. A full queue drops the job with a warning
    /// rather than holding up ingestion.
    pub fn submit(&self, job: SideEffectJob<S>) -> bool {
        match self.sender.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(job)) => {
                tracing::warn!(
                    "Side-effect queue full, dropping '{}' for block {} log {} on chain {}",
                    job.handler.name(),
                    job.ctx.event.block_number,
                    job.ctx.event.log_index,
                    job.ctx.event.chain_id
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(job)) => {
                tracing::warn!(
                    "Side-effect executor stopped, dropping '{}'",
                    job.handler.name()
                );
                false
            }
        }
    }
}

pub struct SideEffectExecutor<S: SharedState = ()> {
    queue: SideEffectQueue<S>,
    worker: JoinHandle<()>,
    abort: CancellationToken,
}

impl<S: SharedState> SideEffectExecutor<S> {
    /// Start the worker pool. Must be called inside a tokio runtime.
    pub fn spawn(config: SideEffectConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let abort = CancellationToken::new();
        let worker = tokio::spawn(run_workers(receiver, config, abort.clone()));
        Self {
            queue: SideEffectQueue { sender },
            worker,
            abort,
        }
    }

    pub fn queue(&self) -> SideEffectQueue<S> {
        self.queue.clone()
    }

    /// Stop taking jobs and let queued and running ones finish for at most
    /// `grace`; whatever is left after that is aborted. Every other
    /// [`SideEffectQueue`] must be dropped first, or intake never closes.
    pub async fn shutdown(self, grace: Duration) {
        let Self {
            queue,
            mut worker,
            abort,
        } = self;
        drop(queue);

        if tokio::time::timeout(grace, &mut worker).await.is_err() {
            tracing::warn!(
                "Side effects did not drain within {:?}, aborting the rest",
                grace
            );
            abort.cancel();
            if let Err(e) = worker.await {
                tracing::error!("Side-effect worker failed: {}", e);
            }
        }
    }
}

async fn run_workers<S: SharedState>(
    mut receiver: mpsc::Receiver<SideEffectJob<S>>,
    config: SideEffectConfig,
    abort: CancellationToken,
) {
    let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
    let mut running = JoinSet::new();

    loop {
        tokio::select! {
            _ = abort.cancelled() => break,
            job = receiver.recv() => {
                let Some(job) = job else { break };
                let permit = tokio::select! {
                    _ = abort.cancelled() => break,
                    permit = permits.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };
                let config = config.clone();
                running.spawn(async move {
                    run_job(job, &config).await;
                    drop(permit);
                });
            }
            Some(result) = running.join_next(), if !running.is_empty() => {
                log_join_result(result);
            }
        }
    }

    loop {
        tokio::select! {
            _ = abort.cancelled() => {
                running.abort_all();
                while running.join_next().await.is_some() {}
                break;
            }
            result = running.join_next() => match result {
                Some(result) => log_join_result(result),
                None => break,
            },
        }
    }
}

fn log_join_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            tracing::error!("Side-effect task panicked: {}", e);
        }
    }
}

async fn run_job<S: SharedState>(job: SideEffectJob<S>, config: &SideEffectConfig) {
    let max_retries = match job.handler.retry_policy() {
        SideEffectRetry::Never => 0,
        SideEffectRetry::Retry { max_retries } => max_retries,
    };
    let retry = RetryConfig::new(max_retries)
        .with_initial_delay(config.retry_initial_delay)
        .with_max_delay(config.retry_max_delay);

    let event = Arc::clone(&job.ctx.event);
    let name = format!(
        "{} (chain {} block {} log {})",
        job.handler.name(),
        event.chain_id,
        event.block_number,
        event.log_index
    );

    let handler = &job.handler;
    let ctx = &job.ctx;
    let result = with_retry(&retry, &name, move || async move {
        handler.handle_event(ctx.clone()).await
    })
    .await;

    match result {
        Ok(()) => tracing::debug!("Side effect {} done", name),
        Err(e) => tracing::warn!("Side effect {} dropped: {}", name, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transformations::context::DecodedEvent;
    use crate::transformations::error::SideEffectError;
    use alloy::primitives::{Address, B256};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn job(handler: Arc<dyn SideEffectHandler>) -> SideEffectJob {
        let event = DecodedEvent {
            chain_id: 1,
            contract_address: Address::ZERO,
            contract_type: "NFT".to_string(),
            event_name: "Transfer".to_string(),
            topic0: B256::ZERO,
            block_number: 5,
            block_timestamp: 0,
            transaction_hash: B256::ZERO,
            transaction_index: 0,
            log_index: 0,
            params: Vec::new(),
        };
        SideEffectJob {
            handler,
            ctx: SideEffectContext {
                event: Arc::new(event),
                state: Arc::new(()),
            },
        }
    }

    struct Flaky {
        calls: AtomicU32,
        fail_first: u32,
        policy: SideEffectRetry,
    }

    #[async_trait]
    impl SideEffectHandler for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }
        fn abi(&self) -> &'static str {
            "Transfer(address indexed from, address indexed to, uint256 indexed tokenId)"
        }
        fn retry_policy(&self) -> SideEffectRetry {
            self.policy
        }
        async fn handle_event(&self, _ctx: SideEffectContext) -> Result<(), SideEffectError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.fail_first {
                Err(SideEffectError::failed("flaky", "webhook returned 503"))
            } else {
                Ok(())
            }
        }
    }

    fn config() -> SideEffectConfig {
        SideEffectConfig {
            concurrency: 2,
            queue_capacity: 16,
            retry_initial_delay: Duration::from_millis(1),
            retry_max_delay: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn failures_are_dropped_without_retry_by_default() {
        let handler = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            fail_first: 10,
            policy: SideEffectRetry::Never,
        });
        let executor = SideEffectExecutor::spawn(config());
        assert!(executor.queue().submit(job(handler.clone())));
        executor.shutdown(Duration::from_secs(5)).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retryable_handlers_get_bounded_attempts() {
        let recovering = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            fail_first: 2,
            policy: SideEffectRetry::Retry { max_retries: 3 },
        });
        let hopeless = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            fail_first: 100,
            policy: SideEffectRetry::Retry { max_retries: 2 },
        });

        let executor = SideEffectExecutor::spawn(config());
        let queue = executor.queue();
        queue.submit(job(recovering.clone()));
        queue.submit(job(hopeless.clone()));
        drop(queue);
        executor.shutdown(Duration::from_secs(5)).await;

        assert_eq!(recovering.calls.load(Ordering::SeqCst), 3);
        assert_eq!(hopeless.calls.load(Ordering::SeqCst), 3);
    }

    struct Stuck;

    #[async_trait]
    impl SideEffectHandler for Stuck {
        fn name(&self) -> &'static str {
            "stuck"
        }
        fn abi(&self) -> &'static str {
            "Transfer(address indexed from, address indexed to, uint256 indexed tokenId)"
        }
        async fn handle_event(&self, _ctx: SideEffectContext) -> Result<(), SideEffectError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn shutdown_aborts_after_grace_period() {
        let executor = SideEffectExecutor::spawn(config());
        executor.queue().submit(job(Arc::new(Stuck)));
        let started = std::time::Instant::now();
        executor.shutdown(Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_secs(60));
    }
}
