//! Transparent reverse proxy core.
//!
//! The proxy accepts any inbound HTTP request, selects an upstream by
//! longest path prefix, rewrites the request so that no proxy-identifying
//! information leaks, forwards it over a shared pooled transport, and
//! streams the response back. Routes can opt in to redirect interception so
//! that a redirect chain which would normally escape the proxy is rewritten
//! to stay on-proxy.
//!
//! ## Request flow
//!
//! ```text
//! ┌────────┐    ┌─────────────┐    ┌───────────────┐    ┌───────────┐
//! │ Client │───▶│ Route table │───▶│ Header engine │───▶│ Transport │
//! └────────┘    └─────────────┘    └───────────────┘    └─────┬─────┘
//!      ▲                                                      │
//!      │        ┌───────────────┐    ┌──────────────────┐     │
//!      └────────│ Header engine │◀───│ Redirect rewrite │◀────┘
//!               └───────────────┘    └──────────────────┘
//! ```
//!
//! Everything reachable from a request (the route table, the compiled
//! header engines, the transport) is immutable after [`Proxy::new`] and
//! shared across request tasks without locking.

pub mod config;
pub mod service;
pub mod types;

// Internal modules
mod body;
mod headers;
mod metrics;
mod redirect;
mod route_table;
mod transport;

pub use config::{
    ConfigError, HeaderConfig, LoggerConfig, MetricsConfig, ProxyConfig, RouteConfig,
    RouteConfigError, TlsConfig, TlsConfigError, TlsMode, TransportConfig,
};
pub use headers::{expand_env, remove_hop_by_hop, HeaderEngine, StripPattern, TransformStats};
pub use metrics::{install_recorder, ProxyMetrics, DURATION_BUCKETS};
pub use redirect::{is_redirect, rewrite_location, RedirectClass};
pub use route_table::{Route, RouteTable};
pub use service::Proxy;
pub use types::{ProxyError, ProxyResult, RouteName};


#[cfg(test)]
pub mod test_utils;
