pub mod cursor;
pub mod fsm;
pub mod least_conn;
pub mod meter;
pub mod random;
pub mod round_robin;

use chrono::{DateTime, Utc};
use std::sync::Arc;
use url::Url;

use crate::clock::Clock;
use crate::config::BalancerKind;
use crate::error::ProxyResult;
use crate::proxy::endpoint::Endpoint;
use crate::proxy::location::Observer;
use crate::proxy::request::ProxyRequest;
use crate::proxy::throttle::UpstreamStats;

pub use least_conn::LeastConnBalancer;
pub use random::RandomBalancer;
pub use round_robin::RoundRobinBalancer;

/// Ordering and selection policy for control servers, upstream candidate
/// sets, and registered endpoints. Balancers also sit in the observer
/// chain so attempt outcomes can feed whatever health state they keep.
pub trait LoadBalancer: Observer {
    /// Selects the endpoint for the next attempt from the registry.
    fn next_endpoint(&self, req: &ProxyRequest) -> ProxyResult<Endpoint>;

    fn add_endpoint(&self, endpoint: Endpoint, weight: u32) -> ProxyResult<()>;
    fn remove_endpoint(&self, id: &str) -> ProxyResult<()>;

    /// Orders control-plane urls for the ordered-first-success fan-out.
    fn sorted_control_servers(&self, urls: &[Url]) -> Vec<Url>;

    /// Orders upstream candidates when no throttle stats are available.
    fn sorted_upstreams(&self, upstreams: &[Endpoint]) -> Vec<Endpoint>;

    /// Orders upstream candidates by their usage stats.
    fn sorted_upstreams_by_stats(&self, stats: &[UpstreamStats]) -> ProxyResult<Vec<Endpoint>>;

    /// Periodic housekeeping hook; only stateful policies need it.
    fn gc(&self, _now: DateTime<Utc>) {}
}

pub fn build_balancer(kind: &BalancerKind, clock: Arc<dyn Clock>) -> Arc<dyn LoadBalancer> {
    match kind {
        BalancerKind::RoundRobin => Arc::new(RoundRobinBalancer::new(clock)),
        BalancerKind::Random => Arc::new(RandomBalancer::new()),
        BalancerKind::LeastConnections => Arc::new(LeastConnBalancer::new()),
    }
}
