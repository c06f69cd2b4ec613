use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use tokio::io::AsyncRead;

use crate::error::GatewayResult;

/// An opened upstream response: status, headers, and the body as a byte reader.
pub struct UpstreamStream {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Box<dyn AsyncRead + Send + Unpin>,
}

#[async_trait]
pub trait UpstreamSource: Send + Sync {
    /// Open `url`, forwarding the client's `headers`.
    async fn open(
        &self,
        url: &str,
        headers: &HeaderMap,
        timeout: Duration,
    ) -> GatewayResult<UpstreamStream>;
}
