use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;
use url::Url;

use super::LoadBalancer;
use crate::error::{ProxyError, ProxyResult};
use crate::proxy::endpoint::Endpoint;
use crate::proxy::location::Observer;
use crate::proxy::request::{Attempt, ProxyRequest};
use crate::proxy::throttle::UpstreamStats;

/// The reference policy: order is random everywhere, selection is
/// weighted-random over the registry.
pub struct RandomBalancer {
    registry: Mutex<Vec<(Endpoint, u32)>>,
}

impl RandomBalancer {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Vec::new()),
        }
    }
}

impl Default for RandomBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for RandomBalancer {
    fn next_endpoint(&self, _req: &ProxyRequest) -> ProxyResult<Endpoint> {
        let registry = self.registry.lock();
        let total: u64 = registry
            .iter()
            .filter(|(e, _)| e.is_active())
            .map(|(_, w)| *w as u64)
            .sum();
        if total == 0 {
            return Err(ProxyError::NoEndpoints);
        }
        let mut roll = rand::thread_rng().gen_range(0..total);
        for (endpoint, weight) in registry.iter().filter(|(e, _)| e.is_active()) {
            if roll < *weight as u64 {
                return Ok(endpoint.clone());
            }
            roll -= *weight as u64;
        }
        Err(ProxyError::NoEndpoints)
    }

    fn add_endpoint(&self, endpoint: Endpoint, weight: u32) -> ProxyResult<()> {
        let mut registry = self.registry.lock();
        if registry.iter().any(|(e, _)| *e == endpoint) {
            return Err(ProxyError::Config(format!(
                "endpoint already registered: {}",
                endpoint.id()
            )));
        }
        registry.push((endpoint, weight.max(1)));
        Ok(())
    }

    fn remove_endpoint(&self, id: &str) -> ProxyResult<()> {
        let mut registry = self.registry.lock();
        let before = registry.len();
        registry.retain(|(e, _)| e.id() != id);
        if registry.len() == before {
            return Err(ProxyError::Config(format!("endpoint not registered: {}", id)));
        }
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
        let mut endpoints: Vec<Endpoint> = stats.iter().map(|s| s.endpoint.clone()).collect();
        endpoints.shuffle(&mut rand::thread_rng());
        Ok(endpoints)
    }
}

impl Observer for RandomBalancer {
    fn observe_request(&self, _req: &ProxyRequest) {}
    fn observe_response(&self, _req: &ProxyRequest, _attempt: &Attempt) {}
}
