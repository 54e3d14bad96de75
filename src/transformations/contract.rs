//! Grouping of everything that belongs to one contract type.

use std::sync::Arc;

use alloy::primitives::Address;

use super::traits::{EventHandler, SharedState, SideEffectHandler};
use crate::db::StateMigrations;

/// A statically known deployment of a contract type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContractAddress {
    pub chain_id: u64,
    pub address: Address,
    pub start_block: u64,
}

/// Handlers, migrations and known addresses of one contract type.
///
/// A contract type without addresses is only ever populated by dynamic
/// registration.
pub struct Contract<S: SharedState = ()> {
    contract_type: String,
    pub(crate) addresses: Vec<ContractAddress>,
    pub(crate) event_handlers: Vec<Arc<dyn EventHandler<S>>>,
    pub(crate) side_effect_handlers: Vec<Arc<dyn SideEffectHandler<S>>>,
    pub(crate) migrations: Vec<Arc<dyn StateMigrations>>,
}

impl<S: SharedState> Contract<S> {
    pub fn new(contract_type: impl Into<String>) -> Self {
        Self {
            contract_type: contract_type.into(),
            addresses: Vec::new(),
            event_handlers: Vec::new(),
            side_effect_handlers: Vec::new(),
            migrations: Vec::new(),
        }
    }

    pub fn contract_type(&self) -> &str {
        &self.contract_type
    }

    /// Handlers for the same event run in the order they are added.
    pub fn add_event_handler<H: EventHandler<S>>(mut self, handler: H) -> Self {
        self.event_handlers.push(Arc::new(handler));
        self
    }

    pub fn add_side_effect_handler<H: SideEffectHandler<S>>(mut self, handler: H) -> Self {
        self.side_effect_handlers.push(Arc::new(handler));
        self
    }

    pub fn add_state_migrations<M: StateMigrations>(mut self, migrations: M) -> Self {
        self.migrations.push(Arc::new(migrations));
        self
    }

    pub fn add_address(mut self, chain_id: u64, address: Address, start_block: u64) -> Self {
        self.addresses.push(ContractAddress {
            chain_id,
            address,
            start_block,
        });
        self
    }
}
