use dashmap::DashMap;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use url::Url;

use super::LoadBalancer;
use crate::error::{ProxyError, ProxyResult};
use crate::proxy::endpoint::Endpoint;
use crate::proxy::location::Observer;
use crate::proxy::request::{Attempt, ProxyRequest};
use crate::proxy::throttle::UpstreamStats;

/// Prefers the endpoint with the fewest requests in flight. For candidate
/// sets coming with throttle stats, "connections" are the accumulated
/// usage counters instead.
pub struct LeastConnBalancer {
    registry: Mutex<Vec<Endpoint>>,
    in_flight: DashMap<String, i64>,
}

impl LeastConnBalancer {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Vec::new()),
            in_flight: DashMap::new(),
        }
    }

    fn load_of(&self, id: &str) -> i64 {
        self.in_flight.get(id).map(|v| *v).unwrap_or(0)
    }
}

impl Default for LeastConnBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for LeastConnBalancer {
    fn next_endpoint(&self, _req: &ProxyRequest) -> ProxyResult<Endpoint> {
        let registry = self.registry.lock();
        let chosen = registry
            .iter()
            .filter(|e| e.is_active())
            .min_by_key(|e| self.load_of(e.id()))
            .cloned()
            .ok_or(ProxyError::NoEndpoints)?;
        *self.in_flight.entry(chosen.id().to_string()).or_insert(0) += 1;
        Ok(chosen)
    }

    fn add_endpoint(&self, endpoint: Endpoint, _weight: u32) -> ProxyResult<()> {
        let mut registry = self.registry.lock();
        if registry.iter().any(|e| *e == endpoint) {
            return Err(ProxyError::Config(format!(
                "endpoint already registered: {}",
                endpoint.id()
            )));
        }
        registry.push(endpoint);
        Ok(())
    }

    fn remove_endpoint(&self, id: &str) -> ProxyResult<()> {
        let mut registry = self.registry.lock();
        let before = registry.len();
        registry.retain(|e| e.id() != id);
        if registry.len() == before {
            return Err(ProxyError::Config(format!("endpoint not registered: {}", id)));
        }
        self.in_flight.remove(id);
        Ok(())
    }

    fn sorted_control_servers(&self, urls: &[Url]) -> Vec<Url> {
        let mut shuffled = urls.to_vec();
        shuffled.shuffle(&mut rand::thread_rng());
        shuffled
    }

    fn sorted_upstreams(&self, upstreams: &[Endpoint]) -> Vec<Endpoint> {
        let mut shuffled = upstreams.to_vec();
        shuffled.shuffle(&mut rand::thread_rng());
        shuffled
    }

    fn sorted_upstreams_by_stats(&self, stats: &[UpstreamStats]) -> ProxyResult<Vec<Endpoint>> {
        let mut ordered = stats.to_vec();
        ordered.sort_by_key(|s| s.requests);
        Ok(ordered.into_iter().map(|s| s.endpoint).collect())
    }
}

impl Observer for LeastConnBalancer {
    fn observe_request(&self, _req: &ProxyRequest) {}

    fn observe_response(&self, _req: &ProxyRequest, attempt: &Attempt) {
        if let Some(mut entry) = self.in_flight.get_mut(attempt.endpoint.id()) {
            *entry = (*entry - 1).max(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::request::AttemptOutcome;
    use axum::http::{Method, StatusCode};

    fn endpoint(id: &str) -> Endpoint {
        Endpoint::new(id, Url::parse("http://backend.example:5000").unwrap())
    }

    fn request() -> ProxyRequest {
        ProxyRequest::new(
            Method::GET,
            "/".parse().unwrap(),
            Default::default(),
            crate::proxy::body::ReplayableBody::from_bytes(""),
            "127.0.0.1:4000".parse().unwrap(),
        )
    }

    fn attempt(id: &str) -> Attempt {
        Attempt {
            endpoint: endpoint(id),
            outcome: AttemptOutcome::Response(StatusCode::OK),
            duration: std::time::Duration::from_millis(1),
        }
    }

    #[test]
    fn selection_spreads_over_idle_endpoints() {
        let balancer = LeastConnBalancer::new();
        balancer.add_endpoint(endpoint("a"), 1).unwrap();
        balancer.add_endpoint(endpoint("b"), 1).unwrap();

        let req = request();
        let first = balancer.next_endpoint(&req).unwrap();
        let second = balancer.next_endpoint(&req).unwrap();
        assert_ne!(first.id(), second.id());
    }

    #[test]
    fn finished_requests_free_their_slot() {
        let balancer = LeastConnBalancer::new();
        balancer.add_endpoint(endpoint("a"), 1).unwrap();
        balancer.add_endpoint(endpoint("b"), 1).unwrap();

        let req = request();
        let first = balancer.next_endpoint(&req).unwrap();
        balancer.observe_response(&req, &attempt(first.id()));

        // With the first slot freed, the busiest endpoint is the other one.
        let second = balancer.next_endpoint(&req).unwrap();
        assert_eq!(first.id(), second.id());
    }

    #[test]
    fn stats_ordering_is_ascending_by_usage() {
        let balancer = LeastConnBalancer::new();
        let stats = vec![
            UpstreamStats {
                endpoint: endpoint("busy"),
                requests: 12,
            },
            UpstreamStats {
                endpoint: endpoint("idle"),
                requests: 1,
            },
            UpstreamStats {
                endpoint: endpoint("warm"),
                requests: 5,
            },
        ];

        let ordered = balancer.sorted_upstreams_by_stats(&stats).unwrap();
        let ids: Vec<&str> = ordered.iter().map(|e| e.id()).collect();
        assert_eq!(ids, vec!["idle", "warm", "busy"]);
    }
}
