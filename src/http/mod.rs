//! HTTP adapter: axum middleware and the demo server.

mod middleware;
mod server;

pub use middleware::{client_ip, throttle, with_throttle, ThrottleState, REJECTION_MESSAGE};
pub use server::HttpServer;
