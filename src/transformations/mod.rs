//! Handlers and everything needed to run them.
//!
//! This module provides:
//! - Handler traits for pure and side-effect handlers
//! - The contexts handlers run with
//! - A handler registry resolved once at startup
//! - The dispatcher that runs pure handlers inside a batch transaction
//! - The executor that runs side effects after the batch committed
//!
//! # Architecture
//!
//! ```text
//! RawLog ──► Dispatcher ──► decode ──► EventHandlers ──► StateTransaction ──► commit
//!                                          │                                   │
//!                                          └─► register_contract               ▼
//!                                                              SideEffectExecutor ──► SideEffectHandlers
//! ```
//!
//! # Example Handler
//!
//! ```ignore
//! use async_trait::async_trait;
//! use evm_state_indexer::db::SingleChainRow;
//! use evm_state_indexer::transformations::{EventContext, EventHandler, TransformationError};
//!
//! pub struct ApprovalHandler;
//!
//! #[async_trait]
//! impl EventHandler for ApprovalHandler {
//!     fn name(&self) -> &'static str { "ApprovalHandler" }
//!
//!     fn abi(&self) -> &'static str {
//!         "event Approval(address indexed owner, address indexed approved, uint256 indexed tokenId)"
//!     }
//!
//!     async fn handle_event(&self, ctx: &mut EventContext<'_>) -> Result<(), TransformationError> {
//!         let token_id = ctx.event.get("tokenId")?.as_uint256().unwrap_or_default();
//!         let approved = ctx.event.get("approved")?.as_address().unwrap_or_default();
//!         ctx.upsert_single_chain(
//!             SingleChainRow::new("approvals").key("token_id", token_id).set("approved", approved),
//!         )
//!         .await
//!     }
//! }
//! ```

pub mod context;
pub mod contract;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod registry;
pub mod side_effects;
pub mod traits;

pub use context::{DecodedEvent, DecodedValue, EventContext, PendingBatch, SideEffectContext};
pub use contract::{Contract, ContractAddress};
pub use dispatcher::Dispatcher;
pub use error::{SideEffectError, TransformationError};
pub use registry::{EventRoute, HandlerRegistry};
pub use side_effects::{SideEffectConfig, SideEffectExecutor, SideEffectJob, SideEffectQueue};
pub use traits::{EventHandler, SharedState, SideEffectHandler, SideEffectRetry};
