//! Event indexing and state projection for EVM chains.
//!
//! Logs of watched contracts are fetched per chain in block ranges, decoded
//! against the event signatures of their contract type and handed to
//! handlers that project them into relational tables. Projections, newly
//! discovered contracts and the chain cursor of a batch commit atomically,
//! so a batch is either fully applied or not at all.

pub mod db;
pub mod decoding;
pub mod indexer;
pub mod rpc;
pub mod transformations;
pub mod types;
