use axum::body::Body;
use axum::http::header::{CONTENT_LENGTH, HOST};
use axum::http::{HeaderMap, HeaderValue, Version};
use axum::response::Response;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::constants::{
    DEFAULT_HTTP_DIAL_TIMEOUT_SECS, DEFAULT_HTTP_READ_TIMEOUT_SECS, DEFAULT_MAX_BODY_BYTES,
    X_FORWARDED_HOST, X_FORWARDED_PROTO, X_FORWARDED_SERVER,
};
use crate::error::{ProxyError, ProxyResult};
use crate::proxy::balance::LoadBalancer;
use crate::proxy::control::ControlClient;
use crate::proxy::endpoint::Endpoint;
use crate::proxy::failover::FailoverPredicate;
use crate::proxy::headers::{copy_headers, remove_hop_headers, set_forwarded_for};
use crate::proxy::instructions::Instructions;
use crate::proxy::request::{Attempt, AttemptOutcome, ProxyRequest};
use crate::proxy::throttle::Throttler;

/// Reserved chain id under which the location registers its own balancer.
pub const BALANCER_ID: &str = "__balancer";

/// Intercepts requests before the upstream call. Returning a response (or
/// an error) short-circuits the attempt; post hooks run in reverse
/// registration order.
pub trait Middleware: Send + Sync {
    fn process_request(&self, req: &mut ProxyRequest) -> ProxyResult<Option<Response>>;
    fn process_response(&self, req: &ProxyRequest, attempt: &Attempt);
}

/// Watches requests without the power to intercept them. The pre hook
/// fires exactly once per request, the post hook after every attempt.
pub trait Observer: Send + Sync {
    fn observe_request(&self, req: &ProxyRequest);
    fn observe_response(&self, req: &ProxyRequest, attempt: &Attempt);
}

struct BalancerObserver(Arc<dyn LoadBalancer>);

impl Observer for BalancerObserver {
    fn observe_request(&self, req: &ProxyRequest) {
        self.0.observe_request(req);
    }
    fn observe_response(&self, req: &ProxyRequest, attempt: &Attempt) {
        self.0.observe_response(req, attempt);
    }
}

#[derive(Clone)]
pub struct LocationOptions {
    pub dial_timeout: Duration,
    pub read_timeout: Duration,
    /// Name reported in X-Forwarded-Server.
    pub hostname: String,
    /// Append to an inbound X-Forwarded-For chain instead of replacing it.
    pub trust_forward_header: bool,
    pub should_failover: FailoverPredicate,
    pub body_limit: usize,
}

impl Default for LocationOptions {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(DEFAULT_HTTP_DIAL_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(DEFAULT_HTTP_READ_TIMEOUT_SECS),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "tiller".to_string()),
            trust_forward_header: false,
            should_failover: FailoverPredicate::default_policy(),
            body_limit: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl LocationOptions {
    /// Zero timeouts mean "use the default", unconditionally.
    fn normalized(mut self) -> Self {
        if self.dial_timeout.is_zero() {
            self.dial_timeout = Duration::from_secs(DEFAULT_HTTP_DIAL_TIMEOUT_SECS);
        }
        if self.read_timeout.is_zero() {
            self.read_timeout = Duration::from_secs(DEFAULT_HTTP_READ_TIMEOUT_SECS);
        }
        self
    }
}

/// Per-route policy bundle: a load balancer, middleware and observer
/// chains, the outbound transport, and optionally a control plane that
/// decides candidates per request.
///
/// Without a control plane the location forwards to its registered
/// endpoints under the failover predicate. With one, every request is
/// routed by the control verdict: throttle the returned upstreams, order
/// the survivors, forward, and walk the ranked list when failover is on.
pub struct HttpLocation {
    id: String,
    balancer: Arc<dyn LoadBalancer>,
    transport: reqwest::Client,
    options: LocationOptions,
    control: Option<ControlClient>,
    throttler: Option<Arc<Throttler>>,
    middleware: RwLock<Vec<(String, Arc<dyn Middleware>)>>,
    observers: RwLock<Vec<(String, Arc<dyn Observer>)>>,
}

impl HttpLocation {
    pub fn new(id: impl Into<String>, balancer: Arc<dyn LoadBalancer>) -> ProxyResult<Self> {
        Self::with_options(id, balancer, LocationOptions::default())
    }

    pub fn with_options(
        id: impl Into<String>,
        balancer: Arc<dyn LoadBalancer>,
        options: LocationOptions,
    ) -> ProxyResult<Self> {
        let options = options.normalized();
        let transport = reqwest::Client::builder()
            .connect_timeout(options.dial_timeout)
            .read_timeout(options.read_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ProxyError::Config(format!("failed to build transport: {}", e)))?;

        let observers: Vec<(String, Arc<dyn Observer>)> = vec![(
            BALANCER_ID.to_string(),
            Arc::new(BalancerObserver(balancer.clone())),
        )];

        Ok(Self {
            id: id.into(),
            balancer,
            transport,
            options,
            control: None,
            throttler: None,
            middleware: RwLock::new(Vec::new()),
            observers: RwLock::new(observers),
        })
    }

    /// Switches the location to control-plane steering.
    pub fn with_control(mut self, control: ControlClient, throttler: Option<Arc<Throttler>>) -> Self {
        self.control = Some(control);
        self.throttler = throttler;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn balancer(&self) -> &Arc<dyn LoadBalancer> {
        &self.balancer
    }

    pub fn options(&self) -> &LocationOptions {
        &self.options
    }

    pub fn add_middleware(&self, id: &str, middleware: Arc<dyn Middleware>) -> ProxyResult<()> {
        let mut chain = self.middleware.write();
        if chain.iter().any(|(existing, _)| existing == id) {
            return Err(ProxyError::Config(format!("middleware already registered: {}", id)));
        }
        chain.push((id.to_string(), middleware));
        Ok(())
    }

    pub fn remove_middleware(&self, id: &str) -> ProxyResult<()> {
        let mut chain = self.middleware.write();
        let before = chain.len();
        chain.retain(|(existing, _)| existing != id);
        if chain.len() == before {
            return Err(ProxyError::Config(format!("middleware not registered: {}", id)));
        }
        Ok(())
    }

    pub fn add_observer(&self, id: &str, observer: Arc<dyn Observer>) -> ProxyResult<()> {
        let mut chain = self.observers.write();
        if chain.iter().any(|(existing, _)| existing == id) {
            return Err(ProxyError::Config(format!("observer already registered: {}", id)));
        }
        chain.push((id.to_string(), observer));
        Ok(())
    }

    pub fn remove_observer(&self, id: &str) -> ProxyResult<()> {
        let mut chain = self.observers.write();
        let before = chain.len();
        chain.retain(|(existing, _)| existing != id);
        if chain.len() == before {
            return Err(ProxyError::Config(format!("observer not registered: {}", id)));
        }
        Ok(())
    }

    /// Round trips the request to one of the endpoints and returns the
    /// response, ready to stream downstream.
    pub async fn round_trip(&self, req: &mut ProxyRequest) -> ProxyResult<Response> {
        self.observe_request(req);
        match &self.control {
            Some(control) => self.steered_round_trip(control, req).await,
            None => self.registry_round_trip(req).await,
        }
    }

    /// Forwarding loop over the registry, governed by the failover
    /// predicate.
    async fn registry_round_trip(&self, req: &mut ProxyRequest) -> ProxyResult<Response> {
        loop {
            req.body.rewind()?;
            let endpoint = match self.balancer.next_endpoint(req) {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    error!("request {}: balancer failure: {}", req.id, e);
                    return Err(e);
                }
            };

            let result = self.forward(req, &endpoint, false).await;
            if self.options.should_failover.allows(req) {
                warn!(
                    "request {}: failing over after attempt {}",
                    req.id,
                    req.attempts().len()
                );
                continue;
            }
            return result;
        }
    }

    /// Control-plane steered forwarding: fetch the verdict, throttle and
    /// order the candidates, then forward with or without the fallback
    /// walk depending on the verdict's failover flag.
    async fn steered_round_trip(
        &self,
        control: &ControlClient,
        req: &mut ProxyRequest,
    ) -> ProxyResult<Response> {
        let ordered = self.balancer.sorted_control_servers(control.servers());
        let instructions = control.fetch_instructions(&ordered, req).await?;
        let upstreams = instructions.endpoints()?;
        copy_headers(&mut req.headers, &instructions.header_map());

        let candidates = self.candidates(&instructions, &upstreams)?;

        if !instructions.failover {
            let endpoint = candidates[0].clone();
            req.body.rewind()?;
            let result = self.forward(req, &endpoint, true).await;
            if result.is_ok() {
                self.record_usage(&instructions, req);
            }
            return result;
        }

        // Buffer up front so every attempt replays the identical payload.
        req.body.buffered().await?;
        for endpoint in &candidates {
            req.body.rewind()?;
            match self.forward(req, endpoint, true).await {
                Ok(response) => {
                    if req.last_attempt().map(|a| a.failed()).unwrap_or(false) {
                        warn!(
                            "request {}: upstream {} failed, trying next candidate",
                            req.id, endpoint
                        );
                        continue;
                    }
                    self.record_usage(&instructions, req);
                    return Ok(response);
                }
                Err(e) => {
                    warn!(
                        "request {}: upstream {} error: {}, trying next candidate",
                        req.id, endpoint, e
                    );
                    continue;
                }
            }
        }

        error!("request {}: all upstreams failed", req.id);
        Err(ProxyError::UpstreamsExhausted)
    }

    /// Throttles the instruction upstreams and orders the survivors. When
    /// the backend is down availability wins: the full candidate set comes
    /// back, merely reordered.
    fn candidates(
        &self,
        instructions: &Instructions,
        upstreams: &[Endpoint],
    ) -> ProxyResult<Vec<Endpoint>> {
        let ordered = match &self.throttler {
            Some(throttler) => match throttler.throttle(&instructions.tokens, upstreams) {
                Err(e) => {
                    error!("throttle backend is down, falling back to unthrottled candidates: {}", e);
                    self.balancer.sorted_upstreams(upstreams)
                }
                Ok((stats, retry_after)) if stats.is_empty() => {
                    return Err(ProxyError::TooManyRequests { retry_after });
                }
                Ok((stats, _)) => self.balancer.sorted_upstreams_by_stats(&stats)?,
            },
            None => self.balancer.sorted_upstreams(upstreams),
        };
        if ordered.is_empty() {
            return Err(ProxyError::NoEndpoints);
        }
        Ok(ordered)
    }

    fn record_usage(&self, instructions: &Instructions, req: &ProxyRequest) {
        if let (Some(throttler), Some(attempt)) = (&self.throttler, req.last_attempt()) {
            throttler.update_stats(&instructions.tokens, &attempt.endpoint);
        }
    }

    /// One attempt against one endpoint: middleware pre-hooks, the
    /// transport call, attempt recording, middleware post-hooks in
    /// reverse, observers last.
    async fn forward(
        &self,
        req: &mut ProxyRequest,
        endpoint: &Endpoint,
        use_endpoint_path: bool,
    ) -> ProxyResult<Response> {
        let chain: Vec<(String, Arc<dyn Middleware>)> = self.middleware.read().clone();

        for (index, (id, middleware)) in chain.iter().enumerate() {
            match middleware.process_request(req) {
                Ok(None) => {}
                Ok(Some(response)) => {
                    debug!("request {}: middleware {} intercepted with {}", req.id, id, response.status());
                    req.add_attempt(Attempt {
                        endpoint: endpoint.clone(),
                        outcome: AttemptOutcome::Response(response.status()),
                        duration: Duration::ZERO,
                    });
                    self.unwind(&chain[..index], req);
                    self.observe_response(req);
                    return Ok(response);
                }
                Err(e) => {
                    debug!("request {}: middleware {} rejected: {}", req.id, id, e);
                    req.add_attempt(Attempt {
                        endpoint: endpoint.clone(),
                        outcome: AttemptOutcome::Error(e.to_string()),
                        duration: Duration::ZERO,
                    });
                    self.unwind(&chain[..index], req);
                    self.observe_response(req);
                    return Err(e);
                }
            }
        }

        let outbound = self.rewrite_request(req, endpoint, use_endpoint_path).await?;
        let started = Instant::now();
        let result = self.transport.execute(outbound).await;
        let duration = started.elapsed();

        req.add_attempt(match &result {
            Ok(response) => Attempt {
                endpoint: endpoint.clone(),
                outcome: AttemptOutcome::Response(response.status()),
                duration,
            },
            Err(e) => Attempt {
                endpoint: endpoint.clone(),
                outcome: AttemptOutcome::Error(e.to_string()),
                duration,
            },
        });

        self.unwind(&chain, req);
        self.observe_response(req);

        match result {
            Ok(response) => Ok(stream_response(response)),
            Err(e) => {
                error!("request {}: upstream {} error: {}", req.id, endpoint, e);
                Err(ProxyError::Transport(e.to_string()))
            }
        }
    }

    fn unwind(&self, ran: &[(String, Arc<dyn Middleware>)], req: &ProxyRequest) {
        if let Some(attempt) = req.last_attempt() {
            for (_, middleware) in ran.iter().rev() {
                middleware.process_response(req, attempt);
            }
        }
    }

    fn observe_request(&self, req: &ProxyRequest) {
        for (_, observer) in self.observers.read().iter() {
            observer.observe_request(req);
        }
    }

    fn observe_response(&self, req: &ProxyRequest) {
        if let Some(attempt) = req.last_attempt() {
            for (_, observer) in self.observers.read().iter() {
                observer.observe_response(req, attempt);
            }
        }
    }

    /// Builds the outbound request: target url from the endpoint, a fresh
    /// header map with the forwarding chain applied and hop-by-hop headers
    /// stripped, endpoint overrides merged last, HTTP/1.1 on a persistent
    /// connection.
    async fn rewrite_request(
        &self,
        req: &mut ProxyRequest,
        endpoint: &Endpoint,
        use_endpoint_path: bool,
    ) -> ProxyResult<reqwest::Request> {
        let mut url = endpoint.url().clone();
        if !use_endpoint_path {
            url.set_path(req.uri.path());
        }
        url.set_query(req.uri.query());

        let mut headers = HeaderMap::new();
        copy_headers(&mut headers, &req.headers);
        set_forwarded_for(&mut headers, req.remote_addr.ip(), self.options.trust_forward_header);
        headers.insert(
            &X_FORWARDED_PROTO,
            HeaderValue::from_static(if req.tls { "https" } else { "http" }),
        );
        if !req.host.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&req.host) {
                headers.insert(&X_FORWARDED_HOST, value);
            }
        }
        if let Ok(value) = HeaderValue::from_str(&self.options.hostname) {
            headers.insert(&X_FORWARDED_SERVER, value);
        }
        remove_hop_headers(&mut headers);
        copy_headers(&mut headers, endpoint.headers());

        // The transport derives these from the target url and the buffered
        // payload; inbound values must not leak through.
        headers.remove(HOST);
        headers.remove(CONTENT_LENGTH);

        let body = req.body.buffered().await?;
        let outbound = self
            .transport
            .request(req.method.clone(), url)
            .headers(headers)
            .version(Version::HTTP_11)
            .body(body)
            .build()
            .map_err(|e| ProxyError::Transport(e.to_string()))?;
        Ok(outbound)
    }
}

/// Mirrors an upstream response downstream, streaming the body. Hop-by-hop
/// headers are dropped here too so connection management stays per-hop.
fn stream_response(response: reqwest::Response) -> Response {
    let status = response.status();
    let mut headers = response.headers().clone();
    remove_hop_headers(&mut headers);

    let mut builder = Response::builder().status(status);
    if let Some(slot) = builder.headers_mut() {
        *slot = headers;
    }
    builder
        .body(Body::from_stream(response.bytes_stream()))
        .unwrap_or_else(|_| {
            Response::builder()
                .status(axum::http::StatusCode::BAD_GATEWAY)
                .body(Body::empty())
                .expect("static response")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::proxy::balance::RoundRobinBalancer;
    use crate::proxy::body::ReplayableBody;
    use axum::http::{Method, StatusCode};
    use parking_lot::Mutex;
    use url::Url;

    fn balancer() -> Arc<RoundRobinBalancer> {
        Arc::new(RoundRobinBalancer::new(Arc::new(SystemClock)))
    }

    fn request(method: Method) -> ProxyRequest {
        ProxyRequest::new(
            method,
            "/".parse().unwrap(),
            Default::default(),
            ReplayableBody::from_bytes("payload"),
            "127.0.0.1:4000".parse().unwrap(),
        )
    }

    struct Intercept {
        status: StatusCode,
        post_hits: Mutex<usize>,
    }

    impl Middleware for Intercept {
        fn process_request(&self, _req: &mut ProxyRequest) -> ProxyResult<Option<Response>> {
            Ok(Some(
                Response::builder()
                    .status(self.status)
                    .body(Body::from("intercepted"))
                    .unwrap(),
            ))
        }
        fn process_response(&self, _req: &ProxyRequest, _attempt: &Attempt) {
            *self.post_hits.lock() += 1;
        }
    }

    struct RecordingObserver {
        pre: Mutex<usize>,
        post: Mutex<usize>,
    }

    impl Observer for RecordingObserver {
        fn observe_request(&self, _req: &ProxyRequest) {
            *self.pre.lock() += 1;
        }
        fn observe_response(&self, _req: &ProxyRequest, _attempt: &Attempt) {
            *self.post.lock() += 1;
        }
    }

    #[test]
    fn duplicate_chain_ids_are_rejected() {
        let lb = balancer();
        let location = HttpLocation::new("loc", lb).unwrap();
        let mw = Arc::new(Intercept {
            status: StatusCode::FORBIDDEN,
            post_hits: Mutex::new(0),
        });

        location.add_middleware("auth", mw.clone()).unwrap();
        assert!(location.add_middleware("auth", mw).is_err());
        location.remove_middleware("auth").unwrap();
        assert!(location.remove_middleware("auth").is_err());
    }

    #[test]
    fn balancer_is_preregistered_as_observer() {
        let lb = balancer();
        let location = HttpLocation::new("loc", lb).unwrap();
        assert!(location.remove_observer(BALANCER_ID).is_ok());
    }

    #[tokio::test]
    async fn middleware_can_short_circuit_an_attempt() {
        let lb = balancer();
        lb.add_endpoint(
            Endpoint::new("u1", Url::parse("http://127.0.0.1:9/").unwrap()),
            1,
        )
        .unwrap();
        let location = HttpLocation::new("loc", lb).unwrap();
        location
            .add_middleware(
                "deny",
                Arc::new(Intercept {
                    status: StatusCode::FORBIDDEN,
                    post_hits: Mutex::new(0),
                }),
            )
            .unwrap();

        let mut req = request(Method::GET);
        let response = location.round_trip(&mut req).await.unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(req.attempts().len(), 1);
        match &req.attempts()[0].outcome {
            AttemptOutcome::Response(status) => assert_eq!(*status, StatusCode::FORBIDDEN),
            other => panic!("expected intercepted response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn dead_upstream_exhausts_default_failover_budget() {
        let lb = balancer();
        lb.add_endpoint(
            Endpoint::new("dead", Url::parse("http://127.0.0.1:9/").unwrap()),
            1,
        )
        .unwrap();
        let location = HttpLocation::new("loc", lb).unwrap();
        let observer = Arc::new(RecordingObserver {
            pre: Mutex::new(0),
            post: Mutex::new(0),
        });
        location.add_observer("counter", observer.clone()).unwrap();

        let mut req = request(Method::GET);
        let err = location.round_trip(&mut req).await.unwrap_err();

        assert!(matches!(err, ProxyError::Transport(_)));
        // Two attempts: the original and one failover retry.
        assert_eq!(req.attempts().len(), 2);
        assert_eq!(*observer.pre.lock(), 1);
        assert_eq!(*observer.post.lock(), 2);
    }

    #[tokio::test]
    async fn non_get_requests_never_retry() {
        let lb = balancer();
        lb.add_endpoint(
            Endpoint::new("dead", Url::parse("http://127.0.0.1:9/").unwrap()),
            1,
        )
        .unwrap();
        let location = HttpLocation::new("loc", lb).unwrap();

        let mut req = request(Method::POST);
        let err = location.round_trip(&mut req).await.unwrap_err();

        assert!(matches!(err, ProxyError::Transport(_)));
        assert_eq!(req.attempts().len(), 1);
    }

    #[test]
    fn zero_timeouts_are_replaced_with_defaults() {
        let options = LocationOptions {
            dial_timeout: Duration::ZERO,
            read_timeout: Duration::ZERO,
            ..LocationOptions::default()
        }
        .normalized();
        assert_eq!(options.dial_timeout, Duration::from_secs(10));
        assert_eq!(options.read_timeout, Duration::from_secs(10));
    }
}
