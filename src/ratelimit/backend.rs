//! Decision backend trait for abstracting the engine behind the HTTP adapter.

use async_trait::async_trait;

use super::decision::Decision;
use super::descriptor::RequestDescriptor;

/// Trait for anything that can decide on a request.
///
/// The HTTP middleware is generic over this trait so it can run against the
/// `LimiterEngine` or a stand-in.
#[async_trait]
pub trait DecisionBackend: Send + Sync {
    /// Count the request and decide whether it may proceed.
    async fn decide(&self, descriptor: &RequestDescriptor) -> Decision;
}
