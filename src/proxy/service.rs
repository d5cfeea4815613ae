//! The proxy service: route matching, request transformation, the upstream
//! round trip, and response shaping.
//!
//! The pipeline owns outbound request construction end to end, so header
//! rules are applied exactly once and nothing is re-injected behind the
//! engine's back: a header matching a strip pattern is simply never sent.

use crate::proxy::body::{Completion, MeteredBody};
use crate::proxy::config::{ConfigError, ProxyConfig, TransportConfig};
use crate::proxy::headers::{remove_hop_by_hop, X_FORWARDED_FOR, X_FORWARDED_PROTO};
use crate::proxy::metrics::ProxyMetrics;
use crate::proxy::redirect::{is_redirect, rewrite_location, RedirectClass};
use crate::proxy::route_table::{Route, RouteTable};
use crate::proxy::transport::{build_client, UpstreamClient};
use crate::proxy::types::{ProxyError, ProxyResult};
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{HeaderValue, HOST, LOCATION};
use axum::http::Method;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// A transparent reverse proxy: the sorted route table, the shared pooled
/// transport, and the metrics recorder. Immutable once constructed.
pub struct Proxy {
    routes: RouteTable,
    client: UpstreamClient,
    transport: TransportConfig,
    metrics: Option<Arc<ProxyMetrics>>,
}

impl Proxy {
    /// Apply defaults, validate, and compile the configuration into a
    /// ready-to-serve proxy.
    pub fn new(mut config: ProxyConfig) -> Result<Self, ConfigError> {
        config.apply_defaults();
        config.validate()?;

        info!(
            num_routes = config.routes.len(),
            metrics_enabled = config.metrics.enabled,
            "initializing proxy"
        );

        let routes = RouteTable::new(&config.routes)?;
        for route in routes.routes() {
            debug!(
                name = %route.name(),
                path_prefix = route.path_prefix(),
                upstream = %route.upstream(),
                "created route"
            );
        }

        let client = build_client(&config.transport, &config.tls)?;
        let metrics = config
            .metrics
            .enabled
            .then(|| Arc::new(ProxyMetrics::new(&config.metrics.namespace)));

        info!("proxy initialized");

        Ok(Self {
            routes,
            client,
            transport: config.transport,
            metrics,
        })
    }

    /// Wrap the proxy in an axum router that forwards every request.
    pub fn into_router(self) -> axum::Router {
        axum::Router::new()
            .fallback(proxy_handler)
            .with_state(Arc::new(self))
    }

    /// Release the proxy. Idle pooled connections are closed when the last
    /// clone of the client drops; in-flight requests keep their connections.
    pub fn close(self) {}

    /// Handle one request: match a route, forward, and shape the response.
    /// Always terminates with a valid HTTP response.
    pub async fn handle(&self, request: Request<Body>) -> Response {
        let start = Instant::now();
        let method = request.method().clone();
        let path = request.uri().path().to_string();
        let remote_addr = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0);

        let Some(route) = self.routes.find(&path) else {
            warn!(
                %path,
                method = %method,
                remote_addr = ?remote_addr,
                "no matching route"
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_request_error("none", method.as_str());
            }
            return ProxyError::NoRoute(path).into_response();
        };
        let route = Arc::clone(route);

        debug!(
            route = %route.name(),
            %path,
            method = %method,
            remote_addr = ?remote_addr,
            "handling request"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_request(route.name().as_ref(), method.as_str());
        }

        match self
            .forward(request, &route, &method, &path, remote_addr, start)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                error!(
                    route = %route.name(),
                    %path,
                    method = %method,
                    error = %err,
                    status = err.status_code().as_u16(),
                    duration_ms = start.elapsed().as_millis() as u64,
                    "request failed"
                );
                if let Some(metrics) = &self.metrics {
                    let (route_label, method_label) = (route.name().as_ref(), method.as_str());
                    metrics.record_upstream_error(route_label, method_label);
                    metrics.record_request_error(route_label, method_label);
                    metrics.record_response(
                        route_label,
                        method_label,
                        err.status_code().as_u16(),
                    );
                    metrics.record_request_duration(
                        route_label,
                        method_label,
                        start.elapsed().as_secs_f64(),
                    );
                }
                err.into_response()
            }
        }
    }

    async fn forward(
        &self,
        request: Request<Body>,
        route: &Arc<Route>,
        method: &Method,
        path: &str,
        remote_addr: Option<SocketAddr>,
        start: Instant,
    ) -> ProxyResult<Response> {
        // How the client reached us, for redirect rewriting. Captured before
        // the header engine runs so strip rules cannot erase the hint.
        let incoming_host = incoming_host(&request);
        let incoming_scheme = incoming_scheme(&request);

        let (parts, body) = request.into_parts();

        let (mut headers, stats) = route.header_engine().process_incoming(&parts.headers);
        if let Some(metrics) = &self.metrics {
            metrics.record_header_transform(route.name().as_ref(), stats);
        }

        if !route.preserve_host() {
            if let Ok(host) = HeaderValue::from_str(route.upstream().authority()) {
                headers.insert(HOST, host);
            }
        }

        if route.header_engine().strips_incoming(X_FORWARDED_FOR) {
            headers.remove(X_FORWARDED_FOR);
        } else if let Some(addr) = remote_addr {
            append_forwarded_for(&mut headers, addr);
        }

        remove_hop_by_hop(&mut headers);

        let uri = route.upstream_uri(&parts.uri)?;
        let mut outbound = http::Request::builder()
            .method(parts.method)
            .uri(uri)
            .body(body)?;
        *outbound.headers_mut() = headers;

        // The round trip resolves when response headers arrive, so one
        // deadline covers both the per-route budget and the header wait.
        let limit = route
            .timeout()
            .min(self.transport.response_header_timeout);
        let upstream_start = Instant::now();
        let response = match tokio::time::timeout(limit, self.client.request(outbound)).await {
            Err(_) => return Err(ProxyError::UpstreamTimeout(limit)),
            Ok(Err(err)) => return Err(ProxyError::from_client_error(err)),
            Ok(Ok(response)) => response,
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_upstream_duration(
                route.name().as_ref(),
                method.as_str(),
                upstream_start.elapsed().as_secs_f64(),
            );
        }

        let (mut parts, body) = response.into_parts();

        // The response is re-framed by our server; connection-level headers
        // from the upstream hop must not leak through.
        remove_hop_by_hop(&mut parts.headers);

        if route.rewrite_redirects() && is_redirect(parts.status) {
            self.rewrite_redirect(&mut parts.headers, route, &incoming_scheme, &incoming_host);
        }

        let (outgoing, _) = route.header_engine().process_outgoing(&parts.headers);
        parts.headers = outgoing;

        let completion = Completion::new(
            route.name().clone(),
            method.to_string(),
            path.to_string(),
            parts.status,
            start,
            self.metrics.clone(),
        );
        let body = MeteredBody::new(Body::new(body), completion);

        Ok(Response::from_parts(parts, Body::new(body)))
    }

    fn rewrite_redirect(
        &self,
        headers: &mut http::HeaderMap,
        route: &Arc<Route>,
        incoming_scheme: &str,
        incoming_host: &str,
    ) {
        let Some(location) = headers.get(LOCATION).and_then(|v| v.to_str().ok()) else {
            return;
        };
        if location.is_empty() {
            return;
        }
        let location = location.to_string();

        let (rewritten, class) = rewrite_location(
            &location,
            incoming_scheme,
            incoming_host,
            self.routes.routes(),
            route,
        );

        match rewritten {
            Some(target) => {
                if let Ok(value) = HeaderValue::from_str(&target) {
                    info!(
                        route = %route.name(),
                        original = %location,
                        rewritten = %target,
                        redirect_type = class.as_str(),
                        "rewrote redirect"
                    );
                    headers.insert(LOCATION, value);
                    if let Some(metrics) = &self.metrics {
                        metrics.record_redirect_rewrite(route.name().as_ref(), class.as_str());
                    }
                }
            }
            None => {
                if class == RedirectClass::ExternalUnknown {
                    warn!(
                        route = %route.name(),
                        location = %location,
                        "redirect to unknown external service"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_redirect_rewrite(route.name().as_ref(), class.as_str());
                    }
                }
            }
        }
    }
}

async fn proxy_handler(State(proxy): State<Arc<Proxy>>, request: Request) -> Response {
    proxy.handle(request).await
}

/// The authority the client used: `Host` header first, absolute-form URI as
/// a fallback.
fn incoming_host(request: &Request<Body>) -> String {
    request
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| request.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default()
}

/// The scheme the client used. The listener speaks plain HTTP (TLS
/// termination happens in front of the core), so an `X-Forwarded-Proto`
/// hint wins and the default is `http`.
fn incoming_scheme(request: &Request<Body>) -> String {
    request
        .headers()
        .get(X_FORWARDED_PROTO)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .unwrap_or("http")
        .to_string()
}

fn append_forwarded_for(headers: &mut http::HeaderMap, addr: SocketAddr) {
    let client_ip = addr.ip().to_string();
    let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.is_empty() => format!("{prior}, {client_ip}"),
        _ => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}
