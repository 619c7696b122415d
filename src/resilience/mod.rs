pub mod budget; // Per-user/provider cost accounting with soft/hard limits
pub mod circuit; // Distributed circuit breaker (state shared via KV)
pub mod rate_limit; // Token bucket with UTC-midnight daily quota
pub mod retry; // Exponential backoff with jitter, retryable-only

pub use budget::{BudgetError, BudgetFirewall, BudgetVerdict, CostWeights};
pub use circuit::{BreakerCallError, BreakerMetrics, CircuitBreaker, CircuitState};
pub use rate_limit::{BucketSnapshot, TokenBucket};
pub use retry::RetryPolicy;
