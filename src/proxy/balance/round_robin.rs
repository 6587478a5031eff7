use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::sync::Arc;
use url::Url;

use super::cursor::CursorTable;
use super::fsm::WeightHandler;
use super::meter::RollingMeter;
use super::LoadBalancer;
use crate::clock::Clock;
use crate::constants::DEFAULT_CURSOR_TTL_SECS;
use crate::error::{ProxyError, ProxyResult};
use crate::proxy::endpoint::Endpoint;
use crate::proxy::location::Observer;
use crate::proxy::request::{Attempt, ProxyRequest};
use crate::proxy::throttle::UpstreamStats;

/// Registry entry: an endpoint plus the health meter and the pair of
/// weights the adjustment handler works on.
pub struct WeightedEndpoint {
    pub endpoint: Endpoint,
    pub meter: RollingMeter,
    pub original_weight: u32,
    pub effective_weight: u32,
    current: i64,
}

impl WeightedEndpoint {
    pub fn new(endpoint: Endpoint, weight: u32) -> Self {
        let weight = weight.max(1);
        Self {
            endpoint,
            meter: RollingMeter::default(),
            original_weight: weight,
            effective_weight: weight,
            current: 0,
        }
    }

    pub fn fail_rate(&self, now: DateTime<Utc>) -> f64 {
        self.meter.fail_rate(now)
    }
}

struct RoundRobinState {
    endpoints: Vec<WeightedEndpoint>,
    handler: WeightHandler,
    cursors: CursorTable,
    control_rotation: usize,
}

/// Round-robin balancing in two shapes: weighted selection over the
/// registry (with adaptive weights fed by attempt outcomes), and
/// cursor-based rotation over whatever candidate set the control plane
/// handed us for this request.
pub struct RoundRobinBalancer {
    clock: Arc<dyn Clock>,
    cursor_ttl: i64,
    state: Mutex<RoundRobinState>,
}

impl RoundRobinBalancer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            cursor_ttl: DEFAULT_CURSOR_TTL_SECS,
            state: Mutex::new(RoundRobinState {
                endpoints: Vec::new(),
                handler: WeightHandler::new(),
                cursors: CursorTable::new(),
                control_rotation: 0,
            }),
        }
    }

    pub fn with_cursor_ttl(mut self, ttl_secs: i64) -> Self {
        self.cursor_ttl = ttl_secs;
        self
    }

    pub fn cursor_count(&self) -> usize {
        self.state.lock().cursors.len()
    }

    /// Interval at which cursor garbage collection should tick.
    pub fn gc_interval(&self) -> std::time::Duration {
        let backoff = self.state.lock().handler.backoff();
        backoff
            .to_std()
            .ok()
            .filter(|d| !d.is_zero())
            .unwrap_or(std::time::Duration::from_secs(5))
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn next_endpoint(&self, _req: &ProxyRequest) -> ProxyResult<Endpoint> {
        let mut state = self.state.lock();
        let now = self.clock.now();
        let state = &mut *state;

        let weights = state.handler.adjust_weights(&state.endpoints, now);
        for (endpoint, weight) in state.endpoints.iter_mut().zip(weights.iter()) {
            endpoint.effective_weight = *weight;
        }

        // Smooth weighted round-robin over the active entries.
        let total: i64 = state
            .endpoints
            .iter()
            .filter(|e| e.endpoint.is_active())
            .map(|e| e.effective_weight as i64)
            .sum();
        if total == 0 {
            return Err(ProxyError::NoEndpoints);
        }

        for e in state.endpoints.iter_mut() {
            if e.endpoint.is_active() {
                e.current += e.effective_weight as i64;
            }
        }
        let chosen = state
            .endpoints
            .iter()
            .enumerate()
            .filter(|(_, e)| e.endpoint.is_active())
            .max_by_key(|(_, e)| e.current)
            .map(|(i, _)| i)
            .ok_or(ProxyError::NoEndpoints)?;
        state.endpoints[chosen].current -= total;
        Ok(state.endpoints[chosen].endpoint.clone())
    }

    fn add_endpoint(&self, endpoint: Endpoint, weight: u32) -> ProxyResult<()> {
        let mut state = self.state.lock();
        if state.endpoints.iter().any(|e| e.endpoint == endpoint) {
            return Err(ProxyError::Config(format!(
                "endpoint already registered: {}",
                endpoint.id()
            )));
        }
        state.endpoints.push(WeightedEndpoint::new(endpoint, weight));
        let now = self.clock.now();
        let state = &mut *state;
        state.handler.init(&state.endpoints, now);
        Ok(())
    }

    fn remove_endpoint(&self, id: &str) -> ProxyResult<()> {
        let mut state = self.state.lock();
        let before = state.endpoints.len();
        state.endpoints.retain(|e| e.endpoint.id() != id);
        if state.endpoints.len() == before {
            return Err(ProxyError::Config(format!("endpoint not registered: {}", id)));
        }
        let now = self.clock.now();
        let state = &mut *state;
        state.handler.init(&state.endpoints, now);
        Ok(())
    }

    fn sorted_control_servers(&self, urls: &[Url]) -> Vec<Url> {
        if urls.is_empty() {
            return Vec::new();
        }
        let mut state = self.state.lock();
        let start = state.control_rotation % urls.len();
        state.control_rotation = state.control_rotation.wrapping_add(1);
        let mut ordered = urls.to_vec();
        ordered.rotate_left(start);
        ordered
    }

    fn sorted_upstreams(&self, upstreams: &[Endpoint]) -> Vec<Endpoint> {
        let mut shuffled = upstreams.to_vec();
        shuffled.shuffle(&mut rand::thread_rng());
        shuffled
    }

    fn sorted_upstreams_by_stats(&self, stats: &[UpstreamStats]) -> ProxyResult<Vec<Endpoint>> {
        let endpoints: Vec<Endpoint> = stats.iter().map(|s| s.endpoint.clone()).collect();
        let mut state = self.state.lock();
        let expires_at = self.clock.now().timestamp() + self.cursor_ttl;
        let start = state.cursors.next(&endpoints, expires_at)?;
        let mut ordered = endpoints;
        ordered.rotate_left(start);
        Ok(ordered)
    }

    fn gc(&self, now: DateTime<Utc>) {
        self.state.lock().cursors.gc(now.timestamp());
    }
}

impl Observer for RoundRobinBalancer {
    fn observe_request(&self, _req: &ProxyRequest) {}

    /// Every attempt outcome feeds the chosen endpoint's meter; this is
    /// the feedback loop the weight handler adjusts on.
    fn observe_response(&self, _req: &ProxyRequest, attempt: &Attempt) {
        let mut state = self.state.lock();
        let now = self.clock.now();
        if let Some(entry) = state
            .endpoints
            .iter_mut()
            .find(|e| e.endpoint == attempt.endpoint)
        {
            entry.meter.record(!attempt.failed(), now);
        }
    }
}
