//! Budget firewall.
//!
//! Per-request cost is computed from a weights table and accumulated per
//! `(user, provider, period)` in the shared KV, so every worker draws from
//! the same budget. Costs are integer micro-dollars; monetary arithmetic
//! never touches binary floats.

use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

use crate::kv::{KvError, KvStore};
use crate::observability::metric;

#[derive(Debug, thiserror::Error)]
pub enum BudgetError {
    #[error("budget exceeded for {scope}: spent {spent_micros}µ$ of {limit_micros}µ$")]
    Exceeded {
        scope: String,
        spent_micros: i64,
        limit_micros: i64,
    },
    #[error(transparent)]
    Kv(#[from] KvError),
}

/// Cost model for one provider. All values in micro-dollars.
#[derive(Debug, Clone, Copy)]
pub struct CostWeights {
    pub base_micros: i64,
    pub per_request_kb_micros: i64,
    pub per_response_kb_micros: i64,
}

impl Default for CostWeights {
    fn default() -> Self {
        Self {
            base_micros: 1_000, // $0.001 per call
            per_request_kb_micros: 10,
            per_response_kb_micros: 50,
        }
    }
}

impl CostWeights {
    pub fn cost_micros(&self, request_bytes: usize, response_bytes: usize) -> i64 {
        let req_kb = (request_bytes as i64 + 1023) / 1024;
        let resp_kb = (response_bytes as i64 + 1023) / 1024;
        self.base_micros
            + req_kb * self.per_request_kb_micros
            + resp_kb * self.per_response_kb_micros
    }
}

/// Outcome of a pre-flight budget check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetVerdict {
    Allowed,
    /// Allowed, but the soft threshold has been crossed.
    SoftWarning,
}

/// Hard/soft budget enforcement backed by the shared KV.
pub struct BudgetFirewall {
    period: Duration,
    soft_threshold: f64,
    hard_limit_micros: i64,
    weights: HashMap<String, CostWeights>,
    default_weights: CostWeights,
}

impl BudgetFirewall {
    pub fn new(config: &crate::config::BudgetConfig) -> Self {
        Self {
            period: config.period,
            soft_threshold: config.soft_threshold,
            hard_limit_micros: config.hard_limit_micros,
            weights: HashMap::new(),
            default_weights: CostWeights::default(),
        }
    }

    pub fn with_weights(mut self, provider: &str, weights: CostWeights) -> Self {
        self.weights.insert(provider.to_string(), weights);
        self
    }

    /// Estimated cost for a call to `provider`.
    pub fn cost_micros(&self, provider: &str, request_bytes: usize, response_bytes: usize) -> i64 {
        self.weights
            .get(provider)
            .unwrap_or(&self.default_weights)
            .cost_micros(request_bytes, response_bytes)
    }

    fn scope_key(&self, user: &str, provider: &str) -> String {
        // Bucket by period start so counters roll over naturally with the TTL.
        let period_secs = self.period.as_secs().max(1) as i64;
        let period_start = (chrono::Utc::now().timestamp() / period_secs) * period_secs;
        format!("budget:{user}:{provider}:{period_start}")
    }

    /// Pre-flight check: denies when the projected spend would cross the
    /// hard limit, warns past the soft threshold.
    pub async fn check_request(
        &self,
        kv: &dyn KvStore,
        user: &str,
        provider: &str,
        estimated_cost_micros: i64,
    ) -> Result<BudgetVerdict, BudgetError> {
        let key = self.scope_key(user, provider);
        let spent: i64 = kv
            .get(&key)
            .await?
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        let projected = spent + estimated_cost_micros;
        if projected > self.hard_limit_micros {
            metrics::counter!(metric::BUDGET_DENIED, 1, "provider" => provider.to_string());
            return Err(BudgetError::Exceeded {
                scope: format!("{user}:{provider}"),
                spent_micros: spent,
                limit_micros: self.hard_limit_micros,
            });
        }

        let soft_limit = (self.hard_limit_micros as f64 * self.soft_threshold) as i64;
        if projected >= soft_limit {
            metrics::counter!(metric::BUDGET_SOFT_WARNINGS, 1, "provider" => provider.to_string());
            warn!(
                user,
                provider,
                spent_micros = spent,
                projected_micros = projected,
                limit_micros = self.hard_limit_micros,
                "budget soft threshold crossed"
            );
            return Ok(BudgetVerdict::SoftWarning);
        }

        Ok(BudgetVerdict::Allowed)
    }

    /// Record actual spend after the call completed.
    pub async fn record_spend(
        &self,
        kv: &dyn KvStore,
        user: &str,
        provider: &str,
        cost_micros: i64,
    ) -> Result<i64, BudgetError> {
        let key = self.scope_key(user, provider);
        let total = kv.incr_by(&key, cost_micros).await?;
        // First write in a period pins the counter's expiry to the period end.
        if total == cost_micros {
            kv.expire(&key, self.period).await?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BudgetConfig;
    use crate::kv::MemoryKv;

    fn firewall(hard_limit_micros: i64) -> BudgetFirewall {
        BudgetFirewall::new(&BudgetConfig {
            default_budget_micros: hard_limit_micros,
            period: Duration::from_secs(3600),
            soft_threshold: 0.8,
            hard_limit_micros,
        })
    }

    #[tokio::test]
    async fn hard_limit_denies_eleventh_dollar() {
        // $10 budget, $1 per request: 10 allowed, 11th denied.
        let kv = MemoryKv::new();
        let fw = firewall(10_000_000);
        let cost = 1_000_000;

        for _ in 0..10 {
            fw.check_request(&kv, "default", "fred", cost).await.unwrap();
            fw.record_spend(&kv, "default", "fred", cost).await.unwrap();
        }
        let err = fw
            .check_request(&kv, "default", "fred", cost)
            .await
            .unwrap_err();
        match err {
            BudgetError::Exceeded { spent_micros, .. } => {
                assert_eq!(spent_micros, 10_000_000);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn soft_threshold_warns_but_allows() {
        let kv = MemoryKv::new();
        let fw = firewall(10_000_000);

        fw.record_spend(&kv, "default", "fred", 7_900_000)
            .await
            .unwrap();
        let verdict = fw
            .check_request(&kv, "default", "fred", 200_000)
            .await
            .unwrap();
        assert_eq!(verdict, BudgetVerdict::SoftWarning);
    }

    #[tokio::test]
    async fn budgets_are_scoped_per_provider() {
        let kv = MemoryKv::new();
        let fw = firewall(1_000_000);

        fw.record_spend(&kv, "default", "fred", 1_000_000)
            .await
            .unwrap();
        assert!(fw
            .check_request(&kv, "default", "fred", 1)
            .await
            .is_err());
        // A different provider still has headroom.
        assert!(fw
            .check_request(&kv, "default", "yahoo_finance", 1)
            .await
            .is_ok());
    }

    #[test]
    fn cost_weights_round_kb_up() {
        let w = CostWeights {
            base_micros: 100,
            per_request_kb_micros: 10,
            per_response_kb_micros: 20,
        };
        assert_eq!(w.cost_micros(0, 0), 100);
        assert_eq!(w.cost_micros(1, 1), 130);
        assert_eq!(w.cost_micros(2048, 3000), 100 + 20 + 60);
    }
}
