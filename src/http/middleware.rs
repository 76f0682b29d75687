//! Axum middleware that applies the limiter to every request.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::config::MiddlewareSettings;
use crate::ratelimit::{Decision, DecisionBackend, DecisionPayload, RequestDescriptor};

/// Body of a rejected request.
pub const REJECTION_MESSAGE: &str = "Rate Limit Exceeded";

/// State shared by every invocation of [`throttle`].
pub struct ThrottleState<B: DecisionBackend> {
    /// The backend making decisions
    pub backend: Arc<B>,
    /// Client identification and whitelist
    pub settings: Arc<MiddlewareSettings>,
}

impl<B: DecisionBackend> ThrottleState<B> {
    pub fn new(backend: Arc<B>, settings: MiddlewareSettings) -> Self {
        Self {
            backend,
            settings: Arc::new(settings),
        }
    }
}

impl<B: DecisionBackend> Clone for ThrottleState<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            settings: self.settings.clone(),
        }
    }
}

#[derive(Serialize)]
struct Rejection {
    error: &'static str,
    #[serde(flatten)]
    decision: DecisionPayload,
}

/// Wrap every route of `router` with the limiter.
pub fn with_throttle<B: DecisionBackend + 'static>(router: Router, state: ThrottleState<B>) -> Router {
    router.layer(axum::middleware::from_fn_with_state(state, throttle::<B>))
}

/// Decide on the request; pass it on with rate limit headers, or answer 429.
pub async fn throttle<B: DecisionBackend + 'static>(
    State(state): State<ThrottleState<B>>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client = client_ip(request.headers(), peer, state.settings.trust_forwarded_for);

    if let Some(ip) = client {
        if state.settings.ip_whitelist.contains(&ip) {
            trace!(client = %ip, "Whitelisted client, skipping rate limit");
            return next.run(request).await;
        }
    }

    let client_identity = client.map(|ip| ip.to_string());
    let descriptor = RequestDescriptor::new(
        request.method().as_str(),
        request.uri().path(),
        client_identity.as_deref(),
    );
    let decision = state.backend.decide(&descriptor).await;

    if !decision.allowed {
        debug!(
            request = %descriptor,
            rule = %decision.rule,
            retry_after = decision.retry_after_secs(),
            degraded = decision.degraded,
            "Rejecting request"
        );
        return rejection(&decision);
    }

    let mut response = next.run(request).await;
    apply_headers(response.headers_mut(), &decision);
    response
}

/// Identify the client of a request.
///
/// With `trust_forwarded` set, the first `X-Forwarded-For` entry wins, then
/// `X-Real-IP`. Otherwise, or when neither parses, the peer address is used.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>, trust_forwarded: bool) -> Option<IpAddr> {
    if trust_forwarded {
        let forwarded = header_str(headers, "x-forwarded-for")
            .and_then(|value| value.split(',').next())
            .and_then(|value| value.trim().parse::<IpAddr>().ok());
        if forwarded.is_some() {
            return forwarded;
        }

        let real_ip = header_str(headers, "x-real-ip").and_then(|value| value.trim().parse().ok());
        if real_ip.is_some() {
            return real_ip;
        }
    }

    peer.map(|addr| addr.ip())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn rejection(decision: &Decision) -> Response {
    let body = Rejection {
        error: REJECTION_MESSAGE,
        decision: decision.payload(),
    };
    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    apply_headers(response.headers_mut(), decision);
    response
}

fn apply_headers(headers: &mut HeaderMap, decision: &Decision) {
    for (name, value) in decision.headers() {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
}
