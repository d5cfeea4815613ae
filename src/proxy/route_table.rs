//! Compiled routes and longest-prefix route matching.

use crate::proxy::config::{ConfigError, RouteConfig, RouteConfigError, TlsMode};
use crate::proxy::headers::HeaderEngine;
use crate::proxy::types::{ProxyError, RouteName};
use http::Uri;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// A route compiled from [`RouteConfig`]: parsed upstream URL plus a bound
/// header engine.
#[derive(Clone, Debug)]
pub struct Route {
    name: RouteName,
    path_prefix: String,
    upstream: Url,
    upstream_path_prefix: Option<String>,
    preserve_host: bool,
    timeout: Duration,
    tls_mode: TlsMode,
    rewrite_redirects: bool,
    redirect_base_url: Option<Url>,
    headers: HeaderEngine,
}

impl Route {
    fn new(config: &RouteConfig) -> Result<Self, RouteConfigError> {
        let name = RouteName::try_new(config.name.clone())
            .map_err(|_| RouteConfigError::MissingName)?;
        let upstream =
            Url::parse(&config.upstream).map_err(|source| RouteConfigError::InvalidUpstream {
                url: config.upstream.clone(),
                source,
            })?;
        let redirect_base_url = match &config.redirect_base_url {
            Some(base) => Some(Url::parse(base).map_err(|source| {
                RouteConfigError::InvalidRedirectBase {
                    url: base.clone(),
                    source,
                }
            })?),
            None => None,
        };
        let headers = HeaderEngine::new(&config.headers, name.clone())?;

        Ok(Self {
            name,
            path_prefix: config.path_prefix.clone(),
            upstream,
            upstream_path_prefix: config.upstream_path_prefix.clone(),
            preserve_host: config.preserve_host,
            timeout: config.timeout,
            tls_mode: config.tls_mode,
            rewrite_redirects: config.rewrite_redirects,
            redirect_base_url,
            headers,
        })
    }

    /// Raw string-prefix match on the request path.
    pub fn matches(&self, path: &str) -> bool {
        path.starts_with(&self.path_prefix)
    }

    /// Rewrite a matched path for the upstream.
    ///
    /// With a non-empty upstream path prefix configured, the matched prefix
    /// is swapped for it and a resulting double leading slash is collapsed;
    /// an absent or empty prefix forwards the path unchanged.
    pub fn rewrite_path(&self, path: &str) -> String {
        let upstream_prefix = self.upstream_path_prefix.as_deref().unwrap_or("");
        if upstream_prefix.is_empty() {
            return path.to_string();
        }
        let rest = path.strip_prefix(self.path_prefix.as_str()).unwrap_or(path);
        let mut rewritten = format!("{upstream_prefix}{rest}");
        if rewritten.starts_with("//") {
            rewritten.remove(0);
        }
        rewritten
    }

    /// Compose the outbound URI: upstream scheme and authority, rewritten
    /// path, original query.
    pub fn upstream_uri(&self, original: &Uri) -> Result<Uri, ProxyError> {
        let path = self.rewrite_path(original.path());
        let path_and_query = match original.query() {
            Some(query) => format!("{path}?{query}"),
            None => path,
        };
        Ok(Uri::builder()
            .scheme(self.upstream.scheme())
            .authority(self.upstream.authority())
            .path_and_query(path_and_query)
            .build()?)
    }

    pub fn name(&self) -> &RouteName {
        &self.name
    }

    pub fn path_prefix(&self) -> &str {
        &self.path_prefix
    }

    pub fn upstream(&self) -> &Url {
        &self.upstream
    }

    pub fn upstream_path_prefix(&self) -> Option<&str> {
        self.upstream_path_prefix.as_deref()
    }

    pub fn preserve_host(&self) -> bool {
        self.preserve_host
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn tls_mode(&self) -> TlsMode {
        self.tls_mode
    }

    pub fn rewrite_redirects(&self) -> bool {
        self.rewrite_redirects
    }

    pub fn redirect_base_url(&self) -> Option<&Url> {
        self.redirect_base_url.as_ref()
    }

    pub fn header_engine(&self) -> &HeaderEngine {
        &self.headers
    }
}

/// The immutable, sorted route list shared by all requests.
#[derive(Clone, Debug)]
pub struct RouteTable {
    routes: Vec<Arc<Route>>,
}

impl RouteTable {
    /// Compile all routes and order them longest prefix first (stable on
    /// ties), so a scan finds the most specific match.
    pub fn new(configs: &[RouteConfig]) -> Result<Self, ConfigError> {
        let mut routes = Vec::with_capacity(configs.len());
        for (index, config) in configs.iter().enumerate() {
            let route = Route::new(config).map_err(|source| ConfigError::Route {
                index,
                name: config.name.clone(),
                source,
            })?;
            routes.push(Arc::new(route));
        }
        routes.sort_by(|a, b| b.path_prefix.len().cmp(&a.path_prefix.len()));
        Ok(Self { routes })
    }

    /// Longest-prefix match; `None` means 404.
    pub fn find(&self, path: &str) -> Option<&Arc<Route>> {
        self.routes.iter().find(|route| route.matches(path))
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }
}
