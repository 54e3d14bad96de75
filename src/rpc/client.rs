//! Rate-limited JSON-RPC access to one chain.

use std::future::Future;
use std::num::NonZeroU32;
use std::time::Duration;

use alloy::network::Ethereum;
use alloy::primitives::BlockNumber;
use alloy::providers::{Provider, RootProvider};
use alloy::rpc::types::{Block, BlockNumberOrTag, Filter, Log};
use governor::clock::{QuantaClock, QuantaInstant};
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Jitter, Quota, RateLimiter};
use thiserror::Error;
use url::Url;

use super::retry::{with_retry, RetryConfig, Retryable};

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("RPC transport error: {0}")]
    Transport(String),

    #[error("{method} failed: {message}")]
    Provider {
        method: &'static str,
        message: String,
    },
}

/// Substrings of provider errors worth another attempt: dropped
/// connections, throttling and 5xx responses.
const TRANSIENT_MARKERS: &[&str] = &[
    "connection",
    "timeout",
    "timed out",
    "reset",
    "broken pipe",
    "eof",
    "sending request",
    "rate limit",
    "too many requests",
    "429",
    "502",
    "503",
    "504",
    "bad gateway",
    "service unavailable",
    "internal server error",
    "temporarily",
    "try again",
    "header not found",
];

impl Retryable for RpcError {
    fn is_retryable(&self) -> bool {
        match self {
            RpcError::Transport(_) => true,
            RpcError::Provider { message, .. } => {
                let message = message.to_lowercase();
                TRANSIENT_MARKERS.iter().any(|m| message.contains(m))
            }
        }
    }
}

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, QuantaClock, NoOpMiddleware<QuantaInstant>>;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_second: NonZeroU32,
    pub jitter: Duration,
}

impl RateLimitConfig {
    pub fn new(requests_per_second: NonZeroU32) -> Self {
        Self {
            requests_per_second,
            jitter: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    pub url: Url,
    pub rate_limit: Option<RateLimitConfig>,
    pub retry: RetryConfig,
}

impl RpcClientConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            rate_limit: None,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }

    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }
}

pub struct RpcClient {
    provider: RootProvider<Ethereum>,
    retry: RetryConfig,
    limiter: Option<(DirectLimiter, Jitter)>,
}

impl RpcClient {
    pub fn new(config: RpcClientConfig) -> Self {
        let limiter = config.rate_limit.as_ref().map(|limit| {
            (
                RateLimiter::direct(Quota::per_second(limit.requests_per_second)),
                Jitter::up_to(limit.jitter),
            )
        });
        Self {
            provider: RootProvider::<Ethereum>::new_http(config.url),
            retry: config.retry,
            limiter,
        }
    }

    /// Every attempt, retries included, waits for a rate-limit slot.
    async fn call<T, F, Fut, E>(&self, method: &'static str, request: F) -> Result<T, RpcError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let request = &request;
        with_retry(&self.retry, method, move || async move {
            if let Some((limiter, jitter)) = &self.limiter {
                limiter.until_ready_with_jitter(*jitter).await;
            }
            request().await.map_err(|e| RpcError::Provider {
                method,
                message: e.to_string(),
            })
        })
        .await
    }

    pub async fn get_block_number(&self) -> Result<BlockNumber, RpcError> {
        self.call("eth_blockNumber", move || async move {
            self.provider.get_block_number().await
        })
        .await
    }

    pub async fn get_block_by_number(
        &self,
        number: BlockNumberOrTag,
    ) -> Result<Option<Block>, RpcError> {
        self.call("eth_getBlockByNumber", move || async move {
            self.provider.get_block_by_number(number).await
        })
        .await
    }

    pub async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>, RpcError> {
        self.call("eth_getLogs", move || async move { self.provider.get_logs(filter).await })
            .await
    }
}
