//! Raw log → [`DecodedEvent`] against a parsed signature.
//!
//! Indexed parameters come from `topics[1..]` and non-indexed ones from the
//! ABI-encoded data, both in declaration order. Any mismatch between the log
//! and the signature is a [`DecodeError`]; nothing is guessed.

use alloy::dyn_abi::{DynSolType, DynSolValue};
use alloy::primitives::{Address, B256, I256, U256};
use thiserror::Error;

use super::event_parsing::ParsedEvent;
use crate::rpc::source::RawLog;
use crate::transformations::context::{DecodedEvent, DecodedValue};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Log has no topics")]
    MissingTopic0,

    #[error("topic0 {found} does not match {event} ({expected})")]
    TopicMismatch {
        event: String,
        expected: B256,
        found: B256,
    },

    #[error("{event} expects {expected} topics, log has {found}")]
    TopicCount {
        event: String,
        expected: usize,
        found: usize,
    },

    #[error("Topic {index} of {event} is not a valid {ty}")]
    InvalidTopic {
        event: String,
        index: usize,
        ty: String,
    },

    #[error("Failed to decode data of {event}: {reason}")]
    Data { event: String, reason: String },

    #[error("Unsupported value type: {0}")]
    Unsupported(String),
}

/// Decode one log. Pure: the same log and signature always give the same
/// event.
pub fn decode_log(
    log: &RawLog,
    event: &ParsedEvent,
    chain_id: u64,
    contract_type: &str,
) -> Result<DecodedEvent, DecodeError> {
    let topic0 = log.topics.first().ok_or(DecodeError::MissingTopic0)?;
    if *topic0 != event.topic0 {
        return Err(DecodeError::TopicMismatch {
            event: event.canonical_signature.clone(),
            expected: event.topic0,
            found: *topic0,
        });
    }

    let expected_topics = 1 + event.indexed_count();
    if log.topics.len() != expected_topics {
        return Err(DecodeError::TopicCount {
            event: event.canonical_signature.clone(),
            expected: expected_topics,
            found: log.topics.len(),
        });
    }

    let mut data_values = decode_data(log, event)?.into_iter();
    let mut topics = log.topics.iter().enumerate().skip(1);
    let mut params = Vec::with_capacity(event.params.len());

    for param in &event.params {
        let value = if param.indexed {
            let (index, topic) = topics.next().ok_or_else(|| DecodeError::TopicCount {
                event: event.canonical_signature.clone(),
                expected: expected_topics,
                found: log.topics.len(),
            })?;
            decode_topic(topic, &param.param_type).ok_or_else(|| DecodeError::InvalidTopic {
                event: event.canonical_signature.clone(),
                index,
                ty: param.type_string.clone(),
            })?
        } else {
            let raw = data_values.next().ok_or_else(|| DecodeError::Data {
                event: event.canonical_signature.clone(),
                reason: format!("missing value for '{}'", param.name),
            })?;
            convert_dyn_sol_value(raw)?
        };
        params.push((param.name.clone(), value));
    }

    Ok(DecodedEvent {
        chain_id,
        contract_address: log.address,
        contract_type: contract_type.to_string(),
        event_name: event.name.clone(),
        topic0: event.topic0,
        block_number: log.block_number,
        block_timestamp: log.block_timestamp,
        transaction_hash: log.transaction_hash,
        transaction_index: log.transaction_index,
        log_index: log.log_index,
        params,
    })
}

fn decode_data(log: &RawLog, event: &ParsedEvent) -> Result<Vec<DynSolValue>, DecodeError> {
    let data_types: Vec<DynSolType> = event.data_params().map(|p| p.param_type.clone()).collect();
    if data_types.is_empty() {
        return Ok(Vec::new());
    }

    let expected = data_types.len();
    match DynSolType::Tuple(data_types).abi_decode_params(&log.data) {
        Ok(DynSolValue::Tuple(values)) if values.len() == expected => Ok(values),
        Ok(other) => Err(DecodeError::Data {
            event: event.canonical_signature.clone(),
            reason: format!("unexpected shape {:?}", other),
        }),
        Err(e) => Err(DecodeError::Data {
            event: event.canonical_signature.clone(),
            reason: e.to_string(),
        }),
    }
}

/// Decode a value from a topic. Static types must be correctly padded;
/// dynamic types are only available as the hash stored in the topic.
fn decode_topic(topic: &B256, param_type: &DynSolType) -> Option<DecodedValue> {
    let word = U256::from_be_bytes(topic.0);
    match param_type {
        DynSolType::Address => topic[..12]
            .iter()
            .all(|b| *b == 0)
            .then(|| DecodedValue::Address(Address::from_slice(&topic[12..]))),
        DynSolType::Uint(bits) => {
            let fits = *bits >= 256 || (word >> *bits).is_zero();
            fits.then_some(DecodedValue::Uint(word))
        }
        DynSolType::Int(bits) => {
            // every bit above the sign bit must repeat it
            let upper = word >> (*bits - 1);
            let fits = upper.is_zero() || upper == (U256::MAX >> (*bits - 1));
            fits.then(|| DecodedValue::Int(I256::from_raw(word)))
        }
        DynSolType::Bool => (topic[..31].iter().all(|b| *b == 0) && topic[31] <= 1)
            .then(|| DecodedValue::Bool(topic[31] == 1)),
        DynSolType::FixedBytes(size) => topic[*size..]
            .iter()
            .all(|b| *b == 0)
            .then(|| DecodedValue::FixedBytes(topic[..*size].to_vec())),
        _ => Some(DecodedValue::Hash(*topic)),
    }
}

fn convert_dyn_sol_value(value: DynSolValue) -> Result<DecodedValue, DecodeError> {
    Ok(match value {
        DynSolValue::Address(addr) => DecodedValue::Address(addr),
        DynSolValue::Uint(val, _) => DecodedValue::Uint(val),
        DynSolValue::Int(val, _) => DecodedValue::Int(val),
        DynSolValue::Bool(b) => DecodedValue::Bool(b),
        DynSolValue::FixedBytes(word, size) => DecodedValue::FixedBytes(word[..size].to_vec()),
        DynSolValue::Bytes(bytes) => DecodedValue::Bytes(bytes),
        DynSolValue::String(s) => DecodedValue::String(s),
        DynSolValue::Array(values) | DynSolValue::FixedArray(values) => DecodedValue::Array(
            values
                .into_iter()
                .map(convert_dyn_sol_value)
                .collect::<Result<_, _>>()?,
        ),
        DynSolValue::Tuple(values) => DecodedValue::Tuple(
            values
                .into_iter()
                .map(convert_dyn_sol_value)
                .collect::<Result<_, _>>()?,
        ),
        other => return Err(DecodeError::Unsupported(format!("{:?}", other))),
    })
}
