//! Type definitions for the proxy module

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use nutype::nutype;
use std::time::Duration;
use thiserror::Error;

/// Route identifier used in metrics labels and log fields
#[nutype(
    derive(Clone, Debug, Display, PartialEq, Eq, Hash, Deserialize, Serialize, TryFrom, AsRef),
    validate(predicate = |s: &str| !s.is_empty()),
)]
pub struct RouteName(String);

/// Errors that can occur while handling a request
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("no route matches path: {0}")]
    NoRoute(String),

    #[error("upstream connection failed: {0}")]
    UpstreamConnect(#[source] hyper_util::client::legacy::Error),

    #[error("upstream TLS handshake failed: {0}")]
    UpstreamTls(#[source] hyper_util::client::legacy::Error),

    #[error("upstream request timed out after {0:?}")]
    UpstreamTimeout(Duration),

    #[error("upstream request failed: {0}")]
    Upstream(#[source] hyper_util::client::legacy::Error),

    #[error("invalid upstream URI: {0}")]
    InvalidUpstreamUri(#[from] http::Error),
}

/// Result type for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;

impl ProxyError {
    /// The HTTP status surfaced to the client for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::NoRoute(_) => StatusCode::NOT_FOUND,
            ProxyError::UpstreamConnect(_)
            | ProxyError::UpstreamTls(_)
            | ProxyError::Upstream(_)
            | ProxyError::InvalidUpstreamUri(_) => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Classify a client round-trip failure into the error taxonomy.
    ///
    /// Connect-phase failures are split into dial and TLS errors by walking
    /// the source chain; everything else stays a generic upstream error.
    pub(crate) fn from_client_error(err: hyper_util::client::legacy::Error) -> Self {
        if err.is_connect() {
            if source_chain_is_tls(&err) {
                ProxyError::UpstreamTls(err)
            } else {
                ProxyError::UpstreamConnect(err)
            }
        } else {
            ProxyError::Upstream(err)
        }
    }
}

fn source_chain_is_tls(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = err.source();
    while let Some(cause) = source {
        if cause.is::<rustls::Error>() {
            return true;
        }
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            // rustls failures surface through the connector as InvalidData
            if io.kind() == std::io::ErrorKind::InvalidData {
                return true;
            }
        }
        source = cause.source();
    }
    false
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match status {
            StatusCode::NOT_FOUND => "No route found",
            StatusCode::GATEWAY_TIMEOUT => "Upstream timeout",
            _ => "Upstream error",
        };
        (status, message).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_name_rejects_empty() {
        assert!(RouteName::try_new("").is_err());
        assert!(RouteName::try_new("api").is_ok());
    }

    #[test]
    fn status_mapping_follows_error_taxonomy() {
        assert_eq!(
            ProxyError::NoRoute("/x".to_string()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ProxyError::UpstreamTimeout(Duration::from_secs(1)).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }
}
