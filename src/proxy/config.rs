//! Proxy configuration: the route table definition, transport tuning, TLS,
//! metrics, and logging settings.
//!
//! The configuration is built programmatically (or hydrated by the settings
//! loader), has defaults applied, and is then validated once by
//! [`ProxyConfig::validate`]. After that it is read-only for the lifetime of
//! the proxy.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Root configuration for the proxy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Mapping from incoming path prefixes to upstream servers
    pub routes: Vec<RouteConfig>,

    /// Connection pool and timeout tuning for the shared upstream transport
    #[serde(default)]
    pub transport: TransportConfig,

    /// TLS settings for upstream verification (and downstream cert paths)
    #[serde(default)]
    pub tls: TlsConfig,

    /// Prometheus metrics settings
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Structured logging settings
    #[serde(default)]
    pub logger: LoggerConfig,
}

/// A single route from client path prefix to upstream server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Human-readable identifier, used in metrics labels and log fields
    pub name: String,

    /// Incoming request path prefix to match (e.g. `/v1/verify`).
    ///
    /// Matching is a raw string prefix: `/api` also matches `/apiv2/...`.
    pub path_prefix: String,

    /// Target server as an absolute URL (e.g. `https://api.example.com`)
    pub upstream: String,

    /// Replacement path prefix on the upstream server. When set, the matched
    /// `path_prefix` is swapped for this value; when absent the path is
    /// forwarded unchanged.
    #[serde(default)]
    pub upstream_path_prefix: Option<String>,

    /// Keep the incoming `Host` header instead of replacing it with the
    /// upstream host
    #[serde(default)]
    pub preserve_host: bool,

    /// Header manipulation rules for this route
    #[serde(default)]
    pub headers: HeaderConfig,

    /// Total time budget for the upstream round trip, as a humantime
    /// string in config files (`30s`, `500ms`)
    #[serde(default = "default_route_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// TLS handling mode for this route
    #[serde(default)]
    pub tls_mode: TlsMode,

    /// Rewrite redirect `Location` headers so the next hop stays on-proxy
    #[serde(default)]
    pub rewrite_redirects: bool,

    /// Base URL clients use to reach the proxy, for constructing rewritten
    /// redirect targets. Falls back to the incoming request's host.
    #[serde(default)]
    pub redirect_base_url: Option<String>,
}

fn default_route_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            routes: Vec::new(),
            transport: TransportConfig::default(),
            tls: TlsConfig::default(),
            metrics: MetricsConfig::default(),
            logger: LoggerConfig::default(),
        }
    }
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            path_prefix: String::new(),
            upstream: String::new(),
            upstream_path_prefix: None,
            preserve_host: false,
            headers: HeaderConfig::default(),
            timeout: default_route_timeout(),
            tls_mode: TlsMode::default(),
            rewrite_redirects: false,
            redirect_base_url: None,
        }
    }
}

/// TLS handling mode for a route.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// Terminate TLS at the proxy (default)
    #[default]
    Terminate,
    /// Pass TLS through to the upstream untouched
    Passthrough,
}

/// Header manipulation rules, applied per direction.
///
/// Strip patterns support a trailing `*` wildcard (`x-forwarded-*`); add
/// values support `${VAR}` environment expansion, resolved once at startup.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderConfig {
    /// Headers removed from the client request before forwarding
    pub strip_incoming: Vec<String>,

    /// Headers removed from the upstream response before returning
    pub strip_outgoing: Vec<String>,

    /// Headers overwritten on the client request with literal values
    pub replace_incoming: BTreeMap<String, String>,

    /// Headers overwritten on the upstream response with literal values
    pub replace_outgoing: BTreeMap<String, String>,

    /// Headers set on the request to the upstream (`${VAR}` expanded)
    pub add_upstream: BTreeMap<String, String>,

    /// Headers set on the response to the client (`${VAR}` expanded)
    pub add_downstream: BTreeMap<String, String>,
}

/// Connection pool and timeout tuning for the upstream transport.
///
/// Timeouts are humantime strings in config files (`90s`, `10s`).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Maximum idle connections across all upstream hosts
    pub max_idle_conns: usize,

    /// Maximum idle connections kept per upstream host
    pub max_idle_conns_per_host: usize,

    /// How long an idle pooled connection stays open
    #[serde(with = "humantime_serde")]
    pub idle_conn_timeout: Duration,

    /// Maximum time to establish a TCP connection
    #[serde(with = "humantime_serde")]
    pub dial_timeout: Duration,

    /// Maximum time for the upstream TLS handshake
    #[serde(with = "humantime_serde")]
    pub tls_handshake_timeout: Duration,

    /// Maximum wait from request sent to first response byte
    #[serde(with = "humantime_serde")]
    pub response_header_timeout: Duration,

    /// Wait budget for `100 Continue` responses
    #[serde(with = "humantime_serde")]
    pub expect_continue_timeout: Duration,

    /// Disable connection reuse entirely
    pub disable_keep_alives: bool,

    /// Disable transparent response decompression
    pub disable_compression: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_idle_conns: 100,
            max_idle_conns_per_host: 10,
            idle_conn_timeout: Duration::from_secs(90),
            dial_timeout: Duration::from_secs(10),
            tls_handshake_timeout: Duration::from_secs(10),
            response_header_timeout: Duration::from_secs(30),
            expect_continue_timeout: Duration::from_secs(1),
            disable_keep_alives: false,
            disable_compression: false,
        }
    }
}

/// TLS settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Certificate presented to downstream clients (PEM)
    pub cert_file: Option<PathBuf>,

    /// Private key for `cert_file` (PEM)
    pub key_file: Option<PathBuf>,

    /// CA bundle used to verify upstream servers (PEM)
    pub ca_file: Option<PathBuf>,

    /// Disable upstream certificate verification. NOT RECOMMENDED.
    pub insecure_skip_verify: bool,

    /// Minimum TLS version: `1.0`, `1.1`, `1.2`, or `1.3`
    pub min_version: Option<String>,

    /// Allowed cipher suites; empty means the library defaults
    pub cipher_suites: Vec<String>,
}

/// Prometheus metrics settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Collect and expose metrics
    pub enabled: bool,

    /// HTTP path of the metrics endpoint
    pub path: String,

    /// Port for a dedicated metrics listener; 0 reuses the main server port
    pub port: u16,

    /// Prefix for every metric name
    pub namespace: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "/metrics".to_string(),
            port: 0,
            namespace: "mimic_proxy".to_string(),
        }
    }
}

/// Structured logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Log level: `debug`, `info`, `warn`, or `error`
    pub level: String,

    /// Log format: `json` or `text`
    pub format: String,

    /// Destination: `stdout` or `stderr`
    pub output: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
            output: "stdout".to_string(),
        }
    }
}

/// Configuration error raised by [`ProxyConfig::validate`].
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("at least one route is required")]
    NoRoutes,

    #[error("route {index} ({name}): {source}")]
    Route {
        index: usize,
        name: String,
        #[source]
        source: RouteConfigError,
    },

    #[error("conflicting routes: {first} and {second} both use path_prefix: {path_prefix}")]
    ConflictingRoutes {
        first: String,
        second: String,
        path_prefix: String,
    },

    #[error("TLS configuration: {0}")]
    Tls(#[from] TlsConfigError),

    #[error("failed to build upstream transport: {0}")]
    Transport(String),
}

/// Validation failure for a single route.
#[derive(Error, Debug)]
pub enum RouteConfigError {
    #[error("route name is required")]
    MissingName,

    #[error("path_prefix is required")]
    MissingPathPrefix,

    #[error("path_prefix must start with '/': {0}")]
    RelativePathPrefix(String),

    #[error("upstream is required")]
    MissingUpstream,

    #[error("invalid upstream URL {url}: {source}")]
    InvalidUpstream {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("upstream URL must use http or https scheme: {0}")]
    UpstreamScheme(String),

    #[error("invalid redirect_base_url {url}: {source}")]
    InvalidRedirectBase {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("redirect_base_url must include scheme and host: {0}")]
    RedirectBaseIncomplete(String),

    #[error("invalid header name or value: {0}")]
    InvalidHeader(String),

    #[error("header {header}: unclosed environment variable reference: {value}")]
    UnclosedEnvVar { header: String, value: String },

    #[error("header {header}: empty environment variable reference: {value}")]
    EmptyEnvVar { header: String, value: String },

    #[error("header {header}: environment variable not set: {var}")]
    MissingEnvVar { header: String, var: String },
}

/// Validation failure in the TLS section.
#[derive(Error, Debug)]
pub enum TlsConfigError {
    #[error("cert_file specified but key_file is missing")]
    MissingKeyFile,

    #[error("key_file specified but cert_file is missing")]
    MissingCertFile,

    #[error("{name}: {path} is not readable: {source}")]
    UnreadableFile {
        name: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{name} is a directory: {path}")]
    FileIsDirectory { name: &'static str, path: PathBuf },

    #[error("min_version: invalid TLS version: {0} (must be 1.0, 1.1, 1.2, or 1.3)")]
    InvalidMinVersion(String),
}

impl ProxyConfig {
    /// Fill zero/empty values with their documented defaults.
    ///
    /// Programmatic construction with struct-update syntax already picks up
    /// the `Default` impls; this covers hand-built configs with zeroed
    /// durations or empty strings, mirroring how the loader behaves.
    pub fn apply_defaults(&mut self) {
        if self.metrics.namespace.is_empty() {
            self.metrics.namespace = MetricsConfig::default().namespace;
        }
        if self.metrics.path.is_empty() {
            self.metrics.path = MetricsConfig::default().path;
        }
        if self.logger.level.is_empty() {
            self.logger.level = LoggerConfig::default().level;
        }
        if self.logger.format.is_empty() {
            self.logger.format = LoggerConfig::default().format;
        }
        if self.logger.output.is_empty() {
            self.logger.output = LoggerConfig::default().output;
        }
        for route in &mut self.routes {
            if route.timeout.is_zero() {
                route.timeout = default_route_timeout();
            }
        }
    }

    /// Validate the whole configuration, returning the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.routes.is_empty() {
            return Err(ConfigError::NoRoutes);
        }

        for (index, route) in self.routes.iter().enumerate() {
            route.validate().map_err(|source| ConfigError::Route {
                index,
                name: route.name.clone(),
                source,
            })?;
        }

        self.check_conflicting_routes()?;

        if self.tls.cert_file.is_some() || self.tls.key_file.is_some() || self.tls.ca_file.is_some()
        {
            self.tls.validate()?;
        } else if let Some(version) = &self.tls.min_version {
            parse_tls_version(version)?;
        }

        Ok(())
    }

    fn check_conflicting_routes(&self) -> Result<(), ConfigError> {
        let mut seen: HashMap<&str, &str> = HashMap::new();
        for route in &self.routes {
            if let Some(existing) = seen.insert(&route.path_prefix, &route.name) {
                return Err(ConfigError::ConflictingRoutes {
                    first: existing.to_string(),
                    second: route.name.clone(),
                    path_prefix: route.path_prefix.clone(),
                });
            }
        }
        Ok(())
    }
}

impl RouteConfig {
    fn validate(&self) -> Result<(), RouteConfigError> {
        if self.name.is_empty() {
            return Err(RouteConfigError::MissingName);
        }
        if self.path_prefix.is_empty() {
            return Err(RouteConfigError::MissingPathPrefix);
        }
        if !self.path_prefix.starts_with('/') {
            return Err(RouteConfigError::RelativePathPrefix(
                self.path_prefix.clone(),
            ));
        }
        if self.upstream.is_empty() {
            return Err(RouteConfigError::MissingUpstream);
        }

        let upstream =
            Url::parse(&self.upstream).map_err(|source| RouteConfigError::InvalidUpstream {
                url: self.upstream.clone(),
                source,
            })?;
        if upstream.scheme() != "http" && upstream.scheme() != "https" {
            return Err(RouteConfigError::UpstreamScheme(self.upstream.clone()));
        }

        if let Some(base) = &self.redirect_base_url {
            let parsed =
                Url::parse(base).map_err(|source| RouteConfigError::InvalidRedirectBase {
                    url: base.clone(),
                    source,
                })?;
            if parsed.scheme().is_empty() || parsed.host_str().is_none() {
                return Err(RouteConfigError::RedirectBaseIncomplete(base.clone()));
            }
        }

        self.headers.validate()?;

        Ok(())
    }
}

impl HeaderConfig {
    fn validate(&self) -> Result<(), RouteConfigError> {
        for (name, value) in self.add_upstream.iter().chain(&self.add_downstream) {
            check_env_refs(name, value)?;
        }
        Ok(())
    }
}

/// Verify that every `${VAR}` reference in `value` is well formed and the
/// variable is present in the process environment.
fn check_env_refs(header: &str, value: &str) -> Result<(), RouteConfigError> {
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(RouteConfigError::UnclosedEnvVar {
                header: header.to_string(),
                value: value.to_string(),
            });
        };
        let var = &after[..end];
        if var.is_empty() {
            return Err(RouteConfigError::EmptyEnvVar {
                header: header.to_string(),
                value: value.to_string(),
            });
        }
        if std::env::var_os(var).is_none() {
            return Err(RouteConfigError::MissingEnvVar {
                header: header.to_string(),
                var: var.to_string(),
            });
        }
        rest = &after[end + 1..];
    }
    Ok(())
}

impl TlsConfig {
    fn validate(&self) -> Result<(), TlsConfigError> {
        if self.cert_file.is_some() && self.key_file.is_none() {
            return Err(TlsConfigError::MissingKeyFile);
        }
        if self.key_file.is_some() && self.cert_file.is_none() {
            return Err(TlsConfigError::MissingCertFile);
        }

        validate_tls_file(self.cert_file.as_deref(), "cert_file")?;
        validate_tls_file(self.key_file.as_deref(), "key_file")?;
        validate_tls_file(self.ca_file.as_deref(), "ca_file")?;

        if let Some(version) = &self.min_version {
            parse_tls_version(version)?;
        }

        Ok(())
    }
}

fn validate_tls_file(path: Option<&Path>, name: &'static str) -> Result<(), TlsConfigError> {
    let Some(path) = path else {
        return Ok(());
    };
    let meta = std::fs::metadata(path).map_err(|source| TlsConfigError::UnreadableFile {
        name,
        path: path.to_path_buf(),
        source,
    })?;
    if meta.is_dir() {
        return Err(TlsConfigError::FileIsDirectory {
            name,
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

fn parse_tls_version(version: &str) -> Result<(), TlsConfigError> {
    match version {
        "1.0" | "1.1" | "1.2" | "1.3" => Ok(()),
        other => Err(TlsConfigError::InvalidMinVersion(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(name: &str, prefix: &str, upstream: &str) -> RouteConfig {
        RouteConfig {
            name: name.to_string(),
            path_prefix: prefix.to_string(),
            upstream: upstream.to_string(),
            ..RouteConfig::default()
        }
    }

    fn config(routes: Vec<RouteConfig>) -> ProxyConfig {
        ProxyConfig {
            routes,
            ..ProxyConfig::default()
        }
    }

    #[test]
    fn validate_requires_at_least_one_route() {
        let err = config(vec![]).validate().unwrap_err();
        assert!(matches!(err, ConfigError::NoRoutes));
    }

    #[test]
    fn validate_rejects_empty_name() {
        let err = config(vec![route("", "/api", "http://upstream")])
            .validate()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Route {
                index: 0,
                source: RouteConfigError::MissingName,
                ..
            }
        ));
    }

    #[test]
    fn validate_rejects_relative_path_prefix() {
        let err = config(vec![route("api", "api", "http://upstream")])
            .validate()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Route {
                source: RouteConfigError::RelativePathPrefix(_),
                ..
            }
        ));
    }

    #[test]
    fn validate_rejects_non_http_upstream() {
        let err = config(vec![route("api", "/api", "ftp://upstream")])
            .validate()
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Route {
                source: RouteConfigError::UpstreamScheme(_),
                ..
            }
        ));
    }

    #[test]
    fn validate_names_route_in_error() {
        let err = config(vec![
            route("good", "/a", "http://upstream"),
            route("bad", "/b", "not a url"),
        ])
        .validate()
        .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("route 1 (bad)"), "got: {message}");
    }

    #[test]
    fn validate_rejects_duplicate_prefixes() {
        let err = config(vec![
            route("one", "/api", "http://a"),
            route("two", "/api", "http://b"),
        ])
        .validate()
        .unwrap_err();
        assert!(matches!(err, ConfigError::ConflictingRoutes { .. }));
    }

    #[test]
    fn validate_rejects_incomplete_redirect_base() {
        let mut bad = route("api", "/api", "http://upstream");
        bad.redirect_base_url = Some("not a url".to_string());
        let err = config(vec![bad]).validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Route {
                source: RouteConfigError::InvalidRedirectBase { .. },
                ..
            }
        ));
    }

    #[test]
    fn validate_checks_env_references() {
        let mut r = route("api", "/api", "http://upstream");
        r.headers.add_upstream.insert(
            "X-Api-Key".to_string(),
            "${MIMIC_TEST_SURELY_UNSET_VARIABLE}".to_string(),
        );
        let err = config(vec![r]).validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Route {
                source: RouteConfigError::MissingEnvVar { .. },
                ..
            }
        ));
    }

    #[test]
    fn validate_rejects_unclosed_env_reference() {
        let mut r = route("api", "/api", "http://upstream");
        r.headers
            .add_upstream
            .insert("X-Api-Key".to_string(), "${OOPS".to_string());
        let err = config(vec![r]).validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Route {
                source: RouteConfigError::UnclosedEnvVar { .. },
                ..
            }
        ));
    }

    #[test]
    fn validate_rejects_cert_without_key() {
        let mut cfg = config(vec![route("api", "/api", "http://upstream")]);
        cfg.tls.cert_file = Some(PathBuf::from("/tmp/cert.pem"));
        let err = cfg.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Tls(TlsConfigError::MissingKeyFile)
        ));
    }

    #[test]
    fn validate_rejects_unknown_tls_version() {
        let mut cfg = config(vec![route("api", "/api", "http://upstream")]);
        cfg.tls.min_version = Some("1.4".to_string());
        let err = cfg.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Tls(TlsConfigError::InvalidMinVersion(_))
        ));
    }

    #[test]
    fn apply_defaults_fills_zeroed_fields() {
        let mut cfg = config(vec![route("api", "/api", "http://upstream")]);
        cfg.routes[0].timeout = Duration::ZERO;
        cfg.metrics.namespace = String::new();
        cfg.logger.level = String::new();
        cfg.apply_defaults();
        assert_eq!(cfg.routes[0].timeout, Duration::from_secs(30));
        assert_eq!(cfg.metrics.namespace, "mimic_proxy");
        assert_eq!(cfg.logger.level, "info");
    }

    #[test]
    fn transport_defaults_match_documented_values() {
        let transport = TransportConfig::default();
        assert_eq!(transport.max_idle_conns, 100);
        assert_eq!(transport.max_idle_conns_per_host, 10);
        assert_eq!(transport.idle_conn_timeout, Duration::from_secs(90));
        assert_eq!(transport.dial_timeout, Duration::from_secs(10));
        assert_eq!(transport.response_header_timeout, Duration::from_secs(30));
    }
}
