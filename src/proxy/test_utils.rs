//! Test utilities for proxy module testing
//!
//! Mock upstream servers, config builders, and request helpers shared by
//! the unit and integration tests.

pub mod test_helpers {
    use crate::proxy::config::{ProxyConfig, RouteConfig};
    use axum::body::Body;
    use axum::extract::Request;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::Router;
    use std::time::Duration;
    use tokio::net::TcpListener;

    /// Serve an axum router on an ephemeral local port and return its base
    /// URL (`http://127.0.0.1:<port>`).
    pub async fn spawn_upstream(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind upstream listener");
        let addr = listener.local_addr().expect("upstream local addr");
        tokio::spawn(async move {
            axum::serve(listener, router)
                .await
                .expect("serve mock upstream");
        });
        format!("http://{addr}")
    }

    /// Route config with the test defaults the proxy expects.
    pub fn route_config(name: &str, prefix: &str, upstream: &str) -> RouteConfig {
        RouteConfig {
            name: name.to_string(),
            path_prefix: prefix.to_string(),
            upstream: upstream.to_string(),
            timeout: Duration::from_secs(5),
            ..RouteConfig::default()
        }
    }

    /// Proxy config wrapping the given routes, everything else defaulted.
    pub fn proxy_config(routes: Vec<RouteConfig>) -> ProxyConfig {
        ProxyConfig {
            routes,
            ..ProxyConfig::default()
        }
    }

    /// Mock upstream handler that echoes method, path, query, and headers
    /// back as JSON.
    pub async fn echo_handler(request: Request) -> impl IntoResponse {
        let (parts, _body) = request.into_parts();
        let body = serde_json::json!({
            "method": parts.method.to_string(),
            "path": parts.uri.path(),
            "query": parts.uri.query(),
            "headers": parts.headers.iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("<binary>").to_string()))
                .collect::<std::collections::BTreeMap<_, _>>(),
        });
        (StatusCode::OK, axum::Json(body))
    }

    /// An upstream router that answers every path with the echo handler.
    pub fn echo_upstream() -> Router {
        Router::new().fallback(echo_handler)
    }

    /// Read a response body to completion as bytes.
    pub async fn read_body(body: Body) -> bytes::Bytes {
        axum::body::to_bytes(body, usize::MAX)
            .await
            .expect("read response body")
    }

    /// Parse an echo upstream response.
    pub async fn read_echo(body: Body) -> serde_json::Value {
        serde_json::from_slice(&read_body(body).await).expect("parse echo response")
    }
}
