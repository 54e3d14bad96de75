//! Routing of raw logs to the handlers of their contract type.

use std::sync::Arc;

use super::context::{DecodedEvent, EventContext, PendingBatch, SideEffectContext};
use super::error::TransformationError;
use super::registry::HandlerRegistry;
use super::side_effects::SideEffectJob;
use super::traits::SharedState;
use crate::db::StateTransaction;
use crate::decoding::decode_log;
use crate::rpc::RawLog;

pub struct Dispatcher<S: SharedState = ()> {
    registry: HandlerRegistry<S>,
}

impl<S: SharedState> Dispatcher<S> {
    pub fn new(registry: HandlerRegistry<S>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &HandlerRegistry<S> {
        &self.registry
    }

    /// Decode `log` as `contract_type` and run its pure handlers in
    /// registration order.
    ///
    /// Logs no handler listens to are ignored. Logs that fail to decode are
    /// skipped with a warning. Handler errors abort the batch.
    pub async fn dispatch_log(
        &self,
        chain_id: u64,
        log: &RawLog,
        contract_type: &str,
        state: &mut S,
        tx: &mut dyn StateTransaction,
        pending: &mut PendingBatch,
    ) -> Result<Option<DecodedEvent>, TransformationError> {
        let Some(topic0) = log.topics.first() else {
            return Ok(None);
        };
        let Some(route) = self.registry.route(contract_type, topic0) else {
            return Ok(None);
        };

        let event = match decode_log(log, &route.event, chain_id, contract_type) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(
                    "Skipping log {} of tx {} in block {} on chain {}: {}",
                    log.log_index,
                    log.transaction_hash,
                    log.block_number,
                    chain_id,
                    e
                );
                return Ok(None);
            }
        };

        for handler in &route.handlers {
            let mut ctx = EventContext::new(&event, state, tx, pending);
            if let Err(e) = handler.handle_event(&mut ctx).await {
                tracing::warn!(
                    "Handler {} failed on {} at block {} log {} (chain {}): {}",
                    handler.name(),
                    event.event_name,
                    event.block_number,
                    event.log_index,
                    chain_id,
                    e
                );
                return Err(e);
            }
        }

        pending.dispatched += 1;
        if !route.side_effects.is_empty() {
            pending.side_effects.push(event.clone());
        }
        Ok(Some(event))
    }

    /// One job per side-effect handler per event, against the committed
    /// state.
    pub fn side_effect_jobs(
        &self,
        events: Vec<DecodedEvent>,
        state: &Arc<S>,
    ) -> Vec<SideEffectJob<S>> {
        let mut jobs = Vec::new();
        for event in events {
            let Some(route) = self.registry.route(&event.contract_type, &event.topic0) else {
                continue;
            };
            let event = Arc::new(event);
            for handler in &route.side_effects {
                jobs.push(SideEffectJob {
                    handler: Arc::clone(handler),
                    ctx: SideEffectContext {
                        event: Arc::clone(&event),
                        state: Arc::clone(state),
                    },
                });
            }
        }
        jobs
    }
}
