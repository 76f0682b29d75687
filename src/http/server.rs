//! Demo HTTP server hosting a small application behind the limiter.

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::{with_throttle, ThrottleState};
use crate::config::MiddlewareSettings;
use crate::error::{QuotaGateError, Result};
use crate::ratelimit::DecisionBackend;

/// HTTP server for the demo application.
pub struct HttpServer<B: DecisionBackend + 'static> {
    /// Address to bind to
    addr: SocketAddr,
    /// The decision backend
    backend: Arc<B>,
    settings: MiddlewareSettings,
}

impl<B: DecisionBackend + 'static> HttpServer<B> {
    pub fn new(addr: SocketAddr, backend: Arc<B>, settings: MiddlewareSettings) -> Self {
        Self {
            addr,
            backend,
            settings,
        }
    }

    /// The demo routes, wrapped with the limiter.
    pub fn router(&self) -> Router {
        let app = Router::new()
            .route("/", get(|| async { "ok" }))
            .route(
                "/hello",
                get(|| async { "Hello, world!" }).post(|| async { (StatusCode::CREATED, "created") }),
            );

        with_throttle(
            app,
            ThrottleState::new(self.backend.clone(), self.settings.clone()),
        )
    }

    /// Bind and serve until `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            QuotaGateError::Io(e)
        })?;
        self.serve_on(listener, signal).await
    }

    /// Serve on an already bound listener until `signal` resolves.
    pub async fn serve_on<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!(
            addr = %listener.local_addr()?,
            "Starting HTTP server with graceful shutdown"
        );

        let app = self.router();
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            QuotaGateError::Io(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{LimiterEngine, RuleConfig, RuleSet, Window};
    use crate::store::MemoryStore;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_server_limits_by_peer_address() {
        let rules = RuleSet::from_config(
            &[RuleConfig::new("GET", 1).with_path("/hello")],
            10,
            Window::HOUR,
        )
        .unwrap();
        let engine = Arc::new(LimiterEngine::new(rules, Arc::new(MemoryStore::new())));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = HttpServer::new(addr, engine.clone(), MiddlewareSettings::default());

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve_on(listener, async move {
            let _ = shutdown_rx.await;
        }));

        let first = http_get(addr, "/hello").await;
        assert!(first.starts_with("HTTP/1.1 200"), "{}", first);
        assert!(first.contains("Hello, world!"));
        assert!(first.to_ascii_lowercase().contains("x-ratelimit-remaining: 0"));

        let second = http_get(addr, "/hello").await;
        assert!(second.starts_with("HTTP/1.1 429"), "{}", second);

        // Counted under the peer address, not the anonymous bucket.
        let descriptor =
            crate::ratelimit::RequestDescriptor::new("GET", "/hello", Some("127.0.0.1"));
        assert_eq!(engine.counter_value(&descriptor).await.unwrap(), Some(2));

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }
}
