pub mod balance;
pub mod body;
pub mod control;
pub mod endpoint;
pub mod failover;
pub mod headers;
pub mod instructions;
pub mod location;
pub mod request;
pub mod router;
pub mod server;
pub mod throttle;

pub use balance::{LeastConnBalancer, LoadBalancer, RandomBalancer, RoundRobinBalancer};
pub use body::ReplayableBody;
pub use control::ControlClient;
pub use endpoint::Endpoint;
pub use failover::FailoverPredicate;
pub use instructions::Instructions;
pub use location::{HttpLocation, LocationOptions, Middleware, Observer};
pub use request::{Attempt, AttemptOutcome, ProxyRequest};
pub use router::PathMatcher;
pub use server::{build_router, build_state, serve, ProxyState};
pub use throttle::{ThrottleBackend, Throttler, UpstreamStats};

#[cfg(test)]
mod tests;
