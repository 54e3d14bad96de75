mod client;
mod retry;
pub mod source;

pub use client::{RateLimitConfig, RpcClient, RpcClientConfig, RpcError};
pub use retry::{with_retry, RetryConfig, Retryable};
pub use source::{FetchError, LogSource, RawLog, RpcLogSource};
