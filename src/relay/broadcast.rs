use async_trait::async_trait;

use crate::error::GatewayResult;

/// Downstream media relay that re-broadcasts one engine output to many viewers.
///
/// Failures are reported as [`GatewayError::MediaRelay`](crate::error::GatewayError::MediaRelay).
#[async_trait]
pub trait MediaRelay: Send + Sync {
    async fn start_broadcast(&self, id: &str, source_url: &str, mux: &str) -> GatewayResult<()>;
    async fn stop_broadcast(&self, id: &str) -> GatewayResult<()>;
    async fn pause_broadcast(&self, id: &str) -> GatewayResult<()>;
    async fn unpause_broadcast(&self, id: &str) -> GatewayResult<()>;

    /// URL viewers fetch to receive broadcast `id`.
    fn output_url(&self, id: &str) -> String;
}
