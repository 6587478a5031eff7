pub mod memory;

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::proxy::endpoint::Endpoint;

/// The persistence store is unreachable or misbehaving. Callers treat this
/// as "throttling unavailable" and fall back to the unfiltered candidate
/// set rather than refusing traffic.
#[derive(Debug, Error)]
#[error("throttle backend unavailable: {0}")]
pub struct BackendError(pub String);

/// A windowed counter as the backend sees it right now.
#[derive(Debug, Clone, Copy)]
pub struct Counter {
    pub count: u64,
    pub expires_in: Duration,
}

/// Counter store keyed by (token, upstream) strings. Both the in-memory
/// table and a remote KV qualify; the contract is atomic
/// increment-with-TTL and read-with-TTL.
pub trait ThrottleBackend: Send + Sync {
    fn counter(&self, key: &str, period: Duration) -> Result<Counter, BackendError>;
    fn record(&self, key: &str, period: Duration, amount: u64) -> Result<(), BackendError>;
}

/// One requests-per-period budget.
#[derive(Debug, Clone, Copy)]
pub struct Rate {
    pub limit: u64,
    pub period: Duration,
}

/// An upstream that passed throttling, along with its current usage
/// pressure for the balancer to order by.
#[derive(Debug, Clone)]
pub struct UpstreamStats {
    pub endpoint: Endpoint,
    pub requests: u64,
}

/// Filters upstream candidates against accumulated per-token usage. Holds
/// no mutable state of its own; everything lives in the backend.
pub struct Throttler {
    backend: Arc<dyn ThrottleBackend>,
    rates: Vec<Rate>,
}

fn counter_key(token: &str, endpoint: &Endpoint) -> String {
    format!("{}|{}", token, endpoint.id())
}

impl Throttler {
    pub fn new(backend: Arc<dyn ThrottleBackend>, rates: Vec<Rate>) -> Self {
        Self { backend, rates }
    }

    /// Returns the upstreams every token still has budget for, plus the
    /// number of seconds after which a retry could succeed when the
    /// feasible set is empty. A backend error is returned as-is so the
    /// caller can prefer availability over enforcement.
    pub fn throttle(
        &self,
        tokens: &[String],
        upstreams: &[Endpoint],
    ) -> Result<(Vec<UpstreamStats>, u64), BackendError> {
        if self.rates.is_empty() || tokens.is_empty() {
            let stats = upstreams
                .iter()
                .map(|endpoint| UpstreamStats {
                    endpoint: endpoint.clone(),
                    requests: 0,
                })
                .collect();
            return Ok((stats, 0));
        }

        let mut feasible = Vec::new();
        let mut retry_after = u64::MAX;

        for endpoint in upstreams {
            let mut allowed = true;
            let mut pressure = 0u64;

            for token in tokens {
                let key = counter_key(token, endpoint);
                for rate in &self.rates {
                    let counter = self.backend.counter(&key, rate.period)?;
                    pressure = pressure.max(counter.count);
                    if counter.count >= rate.limit {
                        allowed = false;
                        retry_after = retry_after.min(counter.expires_in.as_secs().max(1));
                    }
                }
            }

            if allowed {
                feasible.push(UpstreamStats {
                    endpoint: endpoint.clone(),
                    requests: pressure,
                });
            }
        }

        if feasible.is_empty() {
            let retry_after = if retry_after == u64::MAX {
                1
            } else {
                retry_after
            };
            debug!(
                "every (token, upstream) budget exhausted, retry after {}s",
                retry_after
            );
            return Ok((Vec::new(), retry_after));
        }
        Ok((feasible, 0))
    }

    /// Records one request against the chosen upstream for every token.
    /// Accounting is best-effort: failures are logged, never surfaced.
    pub fn update_stats(&self, tokens: &[String], chosen: &Endpoint) {
        for token in tokens {
            let key = counter_key(token, chosen);
            for rate in &self.rates {
                if let Err(e) = self.backend.record(&key, rate.period, 1) {
                    warn!("failed to update throttle stats for {}: {}", key, e);
                }
            }
        }
    }
}
