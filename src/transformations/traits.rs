//! Traits implemented by domain code.
//!
//! Handlers are bound to a contract type through a [`Contract`] and resolved
//! once, when the [`HandlerRegistry`] is built. `abi()` returns the
//! human-readable event signature the handler wants, e.g.
//! `event Transfer(address indexed from, address indexed to, uint256 indexed tokenId)`.
//!
//! [`Contract`]: super::contract::Contract
//! [`HandlerRegistry`]: super::registry::HandlerRegistry

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use super::context::{EventContext, SideEffectContext};
use super::error::{SideEffectError, TransformationError};

/// Application state shared by every handler of an indexer.
pub trait SharedState: Clone + Default + DeserializeOwned + Send + Sync + 'static {}

impl<T> SharedState for T where T: Clone + Default + DeserializeOwned + Send + Sync + 'static {}

/// Deterministic handler run inside the batch transaction.
///
/// It may only touch the projection and the contract registry through its
/// context; anything it does is rolled back with the batch, and it may run
/// again on the same event when a batch is retried.
#[async_trait]
pub trait EventHandler<S: SharedState = ()>: Send + Sync + 'static {
    /// Unique name for this handler (used in logging).
    fn name(&self) -> &'static str;

    fn abi(&self) -> &'static str;

    async fn handle_event(&self, ctx: &mut EventContext<'_, S>) -> Result<(), TransformationError>;
}

/// How often a failing side effect is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SideEffectRetry {
    /// One attempt; failures are logged and dropped.
    #[default]
    Never,
    /// Up to `max_retries` further attempts with exponential backoff.
    Retry { max_retries: u32 },
}

/// Handler run after its event's batch committed. Delivery is at least
/// once, so implementations must tolerate duplicates.
#[async_trait]
pub trait SideEffectHandler<S: SharedState = ()>: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn abi(&self) -> &'static str;

    fn retry_policy(&self) -> SideEffectRetry {
        SideEffectRetry::Never
    }

    async fn handle_event(&self, ctx: SideEffectContext<S>) -> Result<(), SideEffectError>;
}
