use std::io;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderName};
use futures::TryStreamExt;
use reqwest::{Client, RequestBuilder};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use super::traits::{UpstreamSource, UpstreamStream};
use crate::error::{GatewayError, GatewayResult};

/// Response headers that describe the engine's connection, not the media.
const STRIPPED_RESPONSE_HEADERS: [HeaderName; 4] = [
    header::CONNECTION,
    header::SERVER,
    header::TRANSFER_ENCODING,
    HeaderName::from_static("keep-alive"),
];

/// Request headers that belong to the client's hop and are not forwarded.
const SKIPPED_REQUEST_HEADERS: [HeaderName; 3] =
    [header::HOST, header::CONNECTION, header::CONTENT_LENGTH];

/// Opens playback URLs over HTTP with reqwest.
pub struct HttpSource {
    client: Client,
}

impl HttpSource {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    /// Build a GET for `url` carrying the client's headers.
    fn build_request(&self, url: &str, headers: &HeaderMap) -> RequestBuilder {
        let mut req = self.client.get(url);
        for (name, value) in headers {
            if SKIPPED_REQUEST_HEADERS.contains(name) {
                continue;
            }
            req = req.header(name, value);
        }
        req
    }
}

impl Default for HttpSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy of `headers` without the connection-management headers that must not
/// cross the proxy boundary.
pub fn client_facing_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    for name in &STRIPPED_RESPONSE_HEADERS {
        out.remove(name);
    }
    out
}

#[async_trait]
impl UpstreamSource for HttpSource {
    async fn open(
        &self,
        url: &str,
        headers: &HeaderMap,
        timeout: Duration,
    ) -> GatewayResult<UpstreamStream> {
        let resp = tokio::time::timeout(timeout, self.build_request(url, headers).send())
            .await
            .map_err(|_| GatewayError::UpstreamFetch(format!("connect to {} timed out", url)))??;

        let status = resp.status();
        debug!("upstream {} status={}", url, status.as_u16());
        if !status.is_success() {
            warn!("upstream {} failed status={}", url, status.as_u16());
            return Err(GatewayError::UpstreamFetch(format!(
                "upstream returned HTTP {}",
                status.as_u16()
            )));
        }

        let headers = client_facing_headers(resp.headers());
        let body = StreamReader::new(Box::pin(resp.bytes_stream().map_err(io::Error::other)));
        Ok(UpstreamStream {
            status,
            headers,
            body: Box::new(body),
        })
    }
}
