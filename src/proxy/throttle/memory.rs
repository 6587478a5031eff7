use dashmap::DashMap;
use std::time::{Duration, Instant};

use super::{BackendError, Counter, ThrottleBackend};

struct Window {
    count: u64,
    expires_at: Instant,
}

/// Process-local counter store. Windows are fixed rather than sliding:
/// the first hit opens a window of one period, and the counter resets
/// when it lapses.
pub struct MemoryBackend {
    counters: DashMap<(String, u64), Window>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
        }
    }

    /// Drops lapsed windows so idle tokens do not accumulate forever.
    pub fn compact(&self) {
        let now = Instant::now();
        self.counters.retain(|_, window| window.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ThrottleBackend for MemoryBackend {
    fn counter(&self, key: &str, period: Duration) -> Result<Counter, BackendError> {
        let now = Instant::now();
        let entry = self
            .counters
            .get(&(key.to_string(), period.as_secs()));
        Ok(match entry {
            Some(window) if window.expires_at > now => Counter {
                count: window.count,
                expires_in: window.expires_at - now,
            },
            _ => Counter {
                count: 0,
                expires_in: period,
            },
        })
    }

    fn record(&self, key: &str, period: Duration, amount: u64) -> Result<(), BackendError> {
        let now = Instant::now();
        let mut entry = self
            .counters
            .entry((key.to_string(), period.as_secs()))
            .or_insert_with(|| Window {
                count: 0,
                expires_at: now + period,
            });
        if entry.expires_at <= now {
            entry.count = 0;
            entry.expires_at = now + period;
        }
        entry.count += amount;
        Ok(())
    }
}
