use chrono::{DateTime, Duration, Utc};

use super::round_robin::WeightedEndpoint;

/// Hard ceiling for any published weight.
pub const MAX_WEIGHT: u32 = 4096;
/// Multiplier applied to well-behaved endpoints, and divided back out when
/// the population homogenises, keeping the adjustment self-inverting.
pub const GROW_FACTOR: u32 = 16;

/// Raises the weight of endpoints that perform better than the rest of the
/// population and walks everything back toward the configured weights once
/// failure rates level out. Driven on every selection; the backoff timer
/// keeps it from flapping faster than the meters can observe.
pub struct WeightHandler {
    backoff: Duration,
    timer: DateTime<Utc>,
    original: Vec<u32>,
    last: Vec<u32>,
}

impl WeightHandler {
    pub fn new() -> Self {
        Self {
            backoff: Duration::zero(),
            timer: DateTime::<Utc>::MIN_UTC,
            original: Vec::new(),
            last: Vec::new(),
        }
    }

    /// Re-seeds the handler for a fresh endpoint set. The backoff is half
    /// the meter window so a weight change has time to show up in the
    /// stats before the next one.
    pub fn init(&mut self, endpoints: &[WeightedEndpoint], now: DateTime<Utc>) {
        self.original = endpoints.iter().map(|e| e.original_weight).collect();
        self.last = self.original.clone();
        if let Some(first) = endpoints.first() {
            self.backoff = first.meter.window_size() / 2;
        }
        self.timer = now - Duration::seconds(1);
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Suggested weights, parallel to `endpoints`. The caller publishes
    /// them into the endpoints' effective weights.
    pub fn adjust_weights(&mut self, endpoints: &[WeightedEndpoint], now: DateTime<Utc>) -> Vec<u32> {
        // A single endpoint has nothing to be compared against.
        if endpoints.len() < 2 {
            return self.original.clone();
        }
        if !endpoints.iter().all(|e| e.meter.is_ready(now)) {
            return self.original.clone();
        }
        if self.timer >= now {
            return self.last.clone();
        }

        let good = split_endpoints(endpoints, now);
        let bad_count = good.iter().filter(|g| !**g).count();
        let good_count = good.len() - bad_count;

        // No quality difference across the population: converge back
        // toward the original weights.
        if bad_count == 0 || good_count == 0 {
            let (weights, changed) = self.converge(endpoints);
            if changed {
                self.last = weights;
                self.timer = now + self.backoff;
            }
            return self.last.clone();
        }

        self.last = normalize_weights(self.diverge(endpoints, &good));
        self.timer = now + self.backoff;
        self.last.clone()
    }

    fn converge(&self, endpoints: &[WeightedEndpoint]) -> (Vec<u32>, bool) {
        let mut changed = false;
        let weights = endpoints
            .iter()
            .map(|e| {
                if e.effective_weight != e.original_weight {
                    changed = true;
                }
                decrease(e.original_weight, e.effective_weight)
            })
            .collect();
        (normalize_weights(weights), changed)
    }

    fn diverge(&self, endpoints: &[WeightedEndpoint], good: &[bool]) -> Vec<u32> {
        endpoints
            .iter()
            .zip(good.iter())
            .map(|(e, is_good)| {
                if *is_good && increase(e.effective_weight) <= MAX_WEIGHT {
                    increase(e.effective_weight)
                } else {
                    e.effective_weight
                }
            })
            .collect()
    }
}

impl Default for WeightHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn increase(weight: u32) -> u32 {
    weight.saturating_mul(GROW_FACTOR)
}

fn decrease(target: u32, current: u32) -> u32 {
    (current / GROW_FACTOR).max(target)
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a
}

fn normalize_weights(mut weights: Vec<u32>) -> Vec<u32> {
    let divisor = weights.iter().copied().fold(0, gcd);
    if divisor > 1 {
        for w in &mut weights {
            *w /= divisor;
        }
    }
    weights
}

/// Marks each endpoint good or bad by the median-absolute-deviation rule:
/// endpoints whose fail rate sits more than 1.5 MAD above the median are
/// outliers. With an even population the list is padded with a duplicate
/// of the best endpoint to break the symmetry that would otherwise make
/// the split degenerate.
fn split_endpoints(endpoints: &[WeightedEndpoint], now: DateTime<Utc>) -> Vec<bool> {
    let mut rates: Vec<f64> = endpoints.iter().map(|e| e.fail_rate(now)).collect();

    let mut sample = rates.clone();
    if sample.len() % 2 == 0 {
        let best = sample.iter().copied().fold(f64::MAX, f64::min);
        sample.push(best);
    }

    let m = median(&sample);
    let mad = median_absolute_deviation(&sample, m);
    let threshold = m + 1.5 * mad;

    rates.drain(..).map(|rate| rate <= threshold).collect()
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("fail rates are finite"));
    let len = sorted.len();
    if len % 2 != 0 {
        sorted[len / 2]
    } else {
        (sorted[len / 2 - 1] + sorted[len / 2]) / 2.0
    }
}

fn median_absolute_deviation(values: &[f64], m: f64) -> f64 {
    let distances: Vec<f64> = values.iter().map(|v| (v - m).abs()).collect();
    median(&distances)
}
