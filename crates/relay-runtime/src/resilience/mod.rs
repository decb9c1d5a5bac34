//! Resilience patterns for outbound calls.
//!
//! - Circuit breaker per `provider:model` dependency
//! - Retry with exponential backoff and jitter

mod circuit_breaker;
mod retry;

pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitOpenError, CircuitState};
pub use retry::{RetryOutcome, RetryStrategy};
