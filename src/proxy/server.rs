use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::header::{CONTENT_TYPE, RETRY_AFTER};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::ProxySettings;
use crate::error::{ProxyError, ProxyResult};
use crate::proxy::balance::build_balancer;
use crate::proxy::body::ReplayableBody;
use crate::proxy::control::ControlClient;
use crate::proxy::location::HttpLocation;
use crate::proxy::request::ProxyRequest;
use crate::proxy::router::PathMatcher;
use crate::proxy::throttle::memory::MemoryBackend;
use crate::proxy::throttle::{Rate, Throttler};

/// Shared state behind the axum handler: the route table plus the
/// location every unmatched request falls back to.
#[derive(Clone)]
pub struct ProxyState {
    pub matcher: Arc<PathMatcher<HttpLocation>>,
    pub default_location: Option<Arc<HttpLocation>>,
}

impl ProxyState {
    pub fn new(
        matcher: Arc<PathMatcher<HttpLocation>>,
        default_location: Option<Arc<HttpLocation>>,
    ) -> Self {
        Self {
            matcher,
            default_location,
        }
    }
}

/// Every method on every path funnels through the same pipeline.
pub fn build_router(state: ProxyState) -> Router {
    Router::<ProxyState>::new()
        .fallback(handle_proxy)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_proxy(
    State(state): State<ProxyState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: axum::extract::Request,
) -> Response {
    let (parts, body) = request.into_parts();

    let location = state
        .matcher
        .route(parts.uri.path())
        .or_else(|| state.default_location.clone());
    let Some(location) = location else {
        warn!("no location for {} {}", parts.method, parts.uri);
        let mut orphan = ReplayableBody::new(body, usize::MAX);
        orphan.drain().await;
        return error_response(&ProxyError::NoEndpoints);
    };

    let mut req = ProxyRequest::new(
        parts.method,
        parts.uri,
        parts.headers,
        ReplayableBody::new(body, location.options().body_limit),
        addr,
    );

    match location.round_trip(&mut req).await {
        Ok(response) => response,
        Err(e) => {
            // Drain what is left of the payload so the client can read the
            // error instead of seeing a dropped connection.
            req.body.drain().await;
            match &e {
                ProxyError::ControlPlane { .. } | ProxyError::TooManyRequests { .. } => {
                    info!("request {} rejected: {}", req.id, e)
                }
                _ => error!("request {} failed: {}", req.id, e),
            }
            error_response(&e)
        }
    }
}

/// Proxy-originated responses are always application/json with a minimal
/// body; a control-plane rejection is the one case where a foreign body is
/// passed through as-is.
fn error_response(err: &ProxyError) -> Response {
    let mut builder = Response::builder()
        .status(err.status())
        .header(CONTENT_TYPE, "application/json");

    if let ProxyError::TooManyRequests { retry_after } = err {
        builder = builder.header(RETRY_AFTER, retry_after.to_string());
    }

    let body = match err {
        ProxyError::ControlPlane { body, .. } if !body.is_empty() => body.clone(),
        _ => serde_json::json!({ "error": err.client_message() }).to_string(),
    };

    builder.body(Body::from(body)).unwrap_or_else(|_| {
        Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::empty())
            .expect("static response")
    })
}

/// Builds the single control-plane steered location described by the
/// settings and wires it as the default for every route.
pub fn build_state(settings: &ProxySettings) -> ProxyResult<ProxyState> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let balancer = build_balancer(&settings.balancer, clock);

    let servers = settings
        .control_servers
        .iter()
        .map(|raw| {
            url::Url::parse(raw)
                .map_err(|e| ProxyError::Config(format!("invalid control server {}: {}", raw, e)))
        })
        .collect::<ProxyResult<Vec<_>>>()?;

    let dial = std::time::Duration::from_secs(settings.http_dial_timeout_secs);
    let read = std::time::Duration::from_secs(settings.http_read_timeout_secs);
    let control = ControlClient::new(servers, dial, read)?;

    let throttler = if settings.rates.is_empty() {
        None
    } else {
        let rates = settings
            .rates
            .iter()
            .map(|r| Rate {
                limit: r.limit,
                period: std::time::Duration::from_secs(r.period_secs),
            })
            .collect();
        Some(Arc::new(Throttler::new(
            Arc::new(MemoryBackend::new()),
            rates,
        )))
    };

    let options = crate::proxy::location::LocationOptions {
        dial_timeout: dial,
        read_timeout: read,
        hostname: settings.hostname.clone(),
        trust_forward_header: settings.trust_forward_header,
        body_limit: settings.max_body_bytes,
        ..Default::default()
    };

    let location = Arc::new(
        HttpLocation::with_options("default", balancer, options)?.with_control(control, throttler),
    );
    spawn_gc(&location);

    Ok(ProxyState::new(Arc::new(PathMatcher::new()), Some(location)))
}

/// Background cursor collection for the location's balancer.
pub fn spawn_gc(location: &Arc<HttpLocation>) {
    let balancer = location.balancer().clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(5));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            balancer.gc(chrono::Utc::now());
        }
    });
}

pub async fn serve(settings: ProxySettings) -> ProxyResult<()> {
    let state = build_state(&settings)?;
    let router = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ProxyError::Config(format!("failed to bind {}: {}", addr, e)))?;
    info!("proxy listening on {}", addr);

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutting down");
    })
    .await
    .map_err(|e| ProxyError::Config(format!("server error: {}", e)))
}
