// Error taxonomy for the engine protocol client and the HTTP relay.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Failures raised by the engine link and session.
///
/// Cloneable so a single failure can resolve several waiters at once.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("engine transport error: {0}")]
    Transport(String),

    #[error("engine authentication timed out")]
    AuthTimeout,

    #[error("engine rejected authentication")]
    AuthRejected,

    #[error("engine start timed out")]
    StartTimeout,

    #[error("engine load timed out")]
    LoadTimeout,

    #[error("timed out waiting for the playback url")]
    UrlTimeout,

    #[error("engine error: {0}")]
    Engine(String),

    #[error("engine protocol violation: {0}")]
    Protocol(String),

    #[error("a start/load request is still unresolved on this session")]
    OperationInFlight,

    #[error("playback is still paused")]
    StillPaused,

    #[error("engine session closed")]
    Closed,
}

impl EngineError {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            EngineError::AuthTimeout
                | EngineError::StartTimeout
                | EngineError::LoadTimeout
                | EngineError::UrlTimeout
        )
    }
}

/// Failures surfaced to an HTTP client of the gateway.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("upstream fetch failed: {0}")]
    UpstreamFetch(String),

    #[error("session for {0} is already serving a client")]
    CapacityExceeded(String),

    #[error("maximum number of clients reached")]
    TooManyClients,

    #[error("media relay error: {0}")]
    MediaRelay(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("plugin error: {0}")]
    Plugin(String),

    #[error("client disconnected")]
    ClientDisconnected,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Engine(e) if e.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Engine(_) => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamFetch(_) | GatewayError::MediaRelay(_) => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::CapacityExceeded(_) | GatewayError::TooManyClients => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Plugin(_)
            | GatewayError::ClientDisconnected
            | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_disconnect(&self) -> bool {
        matches!(self, GatewayError::ClientDisconnected)
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::UpstreamFetch(err.to_string())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GatewayError::from(EngineError::UrlTimeout).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayError::from(EngineError::Engine("disk full".into())).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::CapacityExceeded("abc".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::BadRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }
}
