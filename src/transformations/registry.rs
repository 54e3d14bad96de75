//! Handler registration.
//!
//! Maps `(contract type, topic0)` to the parsed signature and the ordered
//! handlers bound to it. Built once at startup; lookups never parse.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use alloy::primitives::B256;

use super::contract::Contract;
use super::error::TransformationError;
use super::traits::{EventHandler, SharedState, SideEffectHandler};
use crate::decoding::ParsedEvent;

/// Everything bound to one event of one contract type.
pub struct EventRoute<S: SharedState = ()> {
    pub contract_type: String,
    pub event: ParsedEvent,
    pub handlers: Vec<Arc<dyn EventHandler<S>>>,
    pub side_effects: Vec<Arc<dyn SideEffectHandler<S>>>,
}

/// Registry of all handlers, built at startup.
pub struct HandlerRegistry<S: SharedState = ()> {
    routes: HashMap<(String, B256), EventRoute<S>>,
    contract_types: BTreeSet<String>,
}

impl<S: SharedState> HandlerRegistry<S> {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
            contract_types: BTreeSet::new(),
        }
    }

    pub fn from_contracts<'a>(
        contracts: impl IntoIterator<Item = &'a Contract<S>>,
    ) -> Result<Self, TransformationError> {
        let mut registry = Self::new();
        for contract in contracts {
            registry.add_contract(contract)?;
        }
        Ok(registry)
    }

    pub fn add_contract(&mut self, contract: &Contract<S>) -> Result<(), TransformationError> {
        self.contract_types.insert(contract.contract_type().to_string());
        for handler in &contract.event_handlers {
            self.register_event_handler(contract.contract_type(), Arc::clone(handler))?;
        }
        for handler in &contract.side_effect_handlers {
            self.register_side_effect_handler(contract.contract_type(), Arc::clone(handler))?;
        }
        Ok(())
    }

    pub fn register_event_handler(
        &mut self,
        contract_type: &str,
        handler: Arc<dyn EventHandler<S>>,
    ) -> Result<(), TransformationError> {
        let route = self.route_for(contract_type, handler.name(), handler.abi())?;
        route.handlers.push(handler);
        Ok(())
    }

    pub fn register_side_effect_handler(
        &mut self,
        contract_type: &str,
        handler: Arc<dyn SideEffectHandler<S>>,
    ) -> Result<(), TransformationError> {
        let route = self.route_for(contract_type, handler.name(), handler.abi())?;
        route.side_effects.push(handler);
        Ok(())
    }

    fn route_for(
        &mut self,
        contract_type: &str,
        handler_name: &str,
        abi: &str,
    ) -> Result<&mut EventRoute<S>, TransformationError> {
        let event = ParsedEvent::from_signature(abi).map_err(|e| {
            TransformationError::ConfigError(format!("handler '{}': {}", handler_name, e))
        })?;
        self.contract_types.insert(contract_type.to_string());

        let route = self
            .routes
            .entry((contract_type.to_string(), event.topic0))
            .or_insert_with(|| EventRoute {
                contract_type: contract_type.to_string(),
                event: event.clone(),
                handlers: Vec::new(),
                side_effects: Vec::new(),
            });

        if !route.event.same_layout(&event) {
            return Err(TransformationError::ConfigError(format!(
                "handler '{}' declares '{}' on {}, which conflicts with '{}'",
                handler_name, event.signature, contract_type, route.event.signature
            )));
        }
        Ok(route)
    }

    pub fn route(&self, contract_type: &str, topic0: &B256) -> Option<&EventRoute<S>> {
        self.routes.get(&(contract_type.to_string(), *topic0))
    }

    pub fn routes(&self) -> impl Iterator<Item = &EventRoute<S>> {
        self.routes.values()
    }

    pub fn knows_contract_type(&self, contract_type: &str) -> bool {
        self.contract_types.contains(contract_type)
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Get count of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.routes
            .values()
            .map(|r| r.handlers.len() + r.side_effects.len())
            .sum()
    }
}

impl<S: SharedState> Default for HandlerRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}
