//! Redirect interception: classify an upstream `Location` header and, when
//! the target is a known upstream, rewrite it to an on-proxy URL so the
//! client's next hop comes back through the proxy.
//!
//! The rewriter never follows redirects itself and never drops a response;
//! unknown targets pass through untouched.

use crate::proxy::route_table::Route;
use axum::http::StatusCode;
use std::sync::Arc;
use url::Url;

/// Classification of a redirect `Location` target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RedirectClass {
    /// Relative reference; already proxy-relative, left unchanged
    Relative,
    /// Absolute URL on the current route's upstream host
    Internal,
    /// Absolute URL on another route's upstream host
    ExternalKnown,
    /// Absolute URL to a host no route knows; passed through with a warning
    ExternalUnknown,
    /// The `Location` value did not parse
    InvalidUrl,
    /// The route's upstream did not parse. Compiled routes always carry a
    /// parsed upstream, so this is retained for the metric label contract.
    InvalidUpstream,
}

impl RedirectClass {
    /// Metric label value for this class
    pub fn as_str(&self) -> &'static str {
        match self {
            RedirectClass::Relative => "relative",
            RedirectClass::Internal => "internal",
            RedirectClass::ExternalKnown => "external_known",
            RedirectClass::ExternalUnknown => "external_unknown",
            RedirectClass::InvalidUrl => "invalid_url",
            RedirectClass::InvalidUpstream => "invalid_upstream",
        }
    }
}

/// Whether a status code is one of the rewritable redirect codes.
pub fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

/// Classify `location` and produce the rewritten on-proxy URL when the
/// target host belongs to a configured route.
///
/// `incoming_scheme` and `incoming_host` describe how the client reached the
/// proxy; they are used when the matched route has no `redirect_base_url`.
pub fn rewrite_location(
    location: &str,
    incoming_scheme: &str,
    incoming_host: &str,
    routes: &[Arc<Route>],
    current: &Route,
) -> (Option<String>, RedirectClass) {
    let target = match Url::parse(location) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => return (None, RedirectClass::Relative),
        Err(_) => return (None, RedirectClass::InvalidUrl),
    };

    if hosts_match(&target, current.upstream()) {
        let rewritten = build_proxy_url(incoming_scheme, incoming_host, current, &target);
        return (Some(rewritten), RedirectClass::Internal);
    }

    for route in routes {
        if hosts_match(&target, route.upstream()) {
            let rewritten = build_proxy_url(incoming_scheme, incoming_host, route, &target);
            return (Some(rewritten), RedirectClass::ExternalKnown);
        }
    }

    (None, RedirectClass::ExternalUnknown)
}

/// Host equality with scheme-default port normalization: `http://h:80` and
/// `http://h` compare equal, `h:8080` stays distinct.
fn hosts_match(a: &Url, b: &Url) -> bool {
    a.host_str().is_some()
        && a.host_str() == b.host_str()
        && a.port_or_known_default() == b.port_or_known_default()
}

/// Construct `<scheme>://<host><path_prefix><path'>[?query][#fragment]`,
/// where `path'` is the target path with the route's upstream path prefix
/// stripped, and a double slash at the join is collapsed.
fn build_proxy_url(scheme: &str, host: &str, route: &Route, target: &Url) -> String {
    let (scheme, host) = match route.redirect_base_url() {
        Some(base) => (base.scheme(), base.authority()),
        None => (scheme, host),
    };
    let scheme = if scheme.is_empty() { "https" } else { scheme };

    let mut url = format!("{scheme}://{host}");
    url.push_str(route.path_prefix());

    let mut path = target.path().to_string();
    if let Some(upstream_prefix) = route.upstream_path_prefix() {
        if let Some(stripped) = path.strip_prefix(upstream_prefix) {
            path = stripped.to_string();
        }
    }
    if !path.is_empty() && !path.starts_with('/') {
        path.insert(0, '/');
    }

    if url.ends_with('/') && path.starts_with('/') {
        url.push_str(&path[1..]);
    } else if !url.ends_with('/') && !path.starts_with('/') {
        url.push('/');
        url.push_str(&path);
    } else {
        url.push_str(&path);
    }

    if let Some(query) = target.query() {
        url.push('?');
        url.push_str(query);
    }
    if let Some(fragment) = target.fragment() {
        url.push('#');
        url.push_str(fragment);
    }

    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::config::RouteConfig;
    use crate::proxy::route_table::RouteTable;

    fn route_config(name: &str, prefix: &str, upstream: &str) -> RouteConfig {
        RouteConfig {
            name: name.to_string(),
            path_prefix: prefix.to_string(),
            upstream: upstream.to_string(),
            rewrite_redirects: true,
            ..RouteConfig::default()
        }
    }

    fn table(configs: Vec<RouteConfig>) -> RouteTable {
        RouteTable::new(&configs).unwrap()
    }

    #[test]
    fn is_redirect_covers_all_rewritable_codes() {
        for code in [301, 302, 303, 307, 308] {
            assert!(is_redirect(StatusCode::from_u16(code).unwrap()));
        }
        assert!(!is_redirect(StatusCode::OK));
        assert!(!is_redirect(StatusCode::NOT_MODIFIED));
    }

    #[test]
    fn relative_location_is_left_unchanged() {
        let t = table(vec![route_config("api", "/api", "https://up.example.com")]);
        let current = t.find("/api/x").unwrap();
        let (rewritten, class) =
            rewrite_location("/login", "https", "proxy.example.com", t.routes(), current);
        assert!(rewritten.is_none());
        assert_eq!(class, RedirectClass::Relative);
    }

    #[test]
    fn internal_redirect_is_rewritten_through_current_route() {
        let t = table(vec![route_config("api", "/api", "https://up.example.com")]);
        let current = t.find("/api/x").unwrap();
        let (rewritten, class) = rewrite_location(
            "https://up.example.com/login?next=%2Fhome",
            "https",
            "proxy.example.com",
            t.routes(),
            current,
        );
        assert_eq!(class, RedirectClass::Internal);
        assert_eq!(
            rewritten.unwrap(),
            "https://proxy.example.com/api/login?next=%2Fhome"
        );
    }

    #[test]
    fn known_external_redirect_is_rewritten_through_its_route() {
        let t = table(vec![
            route_config("api", "/api", "https://up.example.com"),
            route_config(
                "oauth",
                "/external-oauth",
                "https://external-oauth-provider.com",
            ),
        ]);
        let current = t.find("/api/login").unwrap();
        assert_eq!(current.name().as_ref(), "api");

        let (rewritten, class) = rewrite_location(
            "https://external-oauth-provider.com/oauth/authorize?client_id=123",
            "https",
            "proxy.example.com",
            t.routes(),
            current,
        );
        assert_eq!(class, RedirectClass::ExternalKnown);
        assert_eq!(
            rewritten.unwrap(),
            "https://proxy.example.com/external-oauth/oauth/authorize?client_id=123"
        );
    }

    #[test]
    fn unknown_external_redirect_passes_through() {
        let t = table(vec![route_config("api", "/api", "https://up.example.com")]);
        let current = t.find("/api/x").unwrap();
        let (rewritten, class) = rewrite_location(
            "https://elsewhere.example.net/page",
            "https",
            "proxy.example.com",
            t.routes(),
            current,
        );
        assert!(rewritten.is_none());
        assert_eq!(class, RedirectClass::ExternalUnknown);
    }

    #[test]
    fn rewriting_an_already_rewritten_location_is_a_no_op() {
        let t = table(vec![route_config("api", "/api", "https://up.example.com")]);
        let current = t.find("/api/x").unwrap();
        let (first, _) = rewrite_location(
            "https://up.example.com/login",
            "https",
            "proxy.example.com",
            t.routes(),
            current,
        );
        let first = first.unwrap();

        // The rewritten URL points at the proxy, which is no route's
        // upstream, so a second pass classifies it external_unknown.
        let (second, class) =
            rewrite_location(&first, "https", "proxy.example.com", t.routes(), current);
        assert!(second.is_none());
        assert_eq!(class, RedirectClass::ExternalUnknown);
    }

    #[test]
    fn redirect_base_url_overrides_incoming_authority() {
        let mut config = route_config("api", "/api", "https://up.example.com");
        config.redirect_base_url = Some("https://public.example.com".to_string());
        let t = table(vec![config]);
        let current = t.find("/api/x").unwrap();
        let (rewritten, _) = rewrite_location(
            "https://up.example.com/login",
            "http",
            "internal-host:8080",
            t.routes(),
            current,
        );
        assert_eq!(
            rewritten.unwrap(),
            "https://public.example.com/api/login"
        );
    }

    #[test]
    fn upstream_path_prefix_is_stripped_from_target() {
        let mut config = route_config("verify", "/v1/verify", "https://up.example.com");
        config.upstream_path_prefix = Some("/api/v1/verify".to_string());
        let t = table(vec![config]);
        let current = t.find("/v1/verify/x").unwrap();
        let (rewritten, _) = rewrite_location(
            "https://up.example.com/api/v1/verify/session/123",
            "https",
            "proxy.example.com",
            t.routes(),
            current,
        );
        assert_eq!(
            rewritten.unwrap(),
            "https://proxy.example.com/v1/verify/session/123"
        );
    }

    #[test]
    fn fragment_is_preserved() {
        let t = table(vec![route_config("api", "/api", "https://up.example.com")]);
        let current = t.find("/api/x").unwrap();
        let (rewritten, _) = rewrite_location(
            "https://up.example.com/doc#section-2",
            "https",
            "proxy.example.com",
            t.routes(),
            current,
        );
        assert_eq!(
            rewritten.unwrap(),
            "https://proxy.example.com/api/doc#section-2"
        );
    }

    #[test]
    fn default_port_matches_bare_host() {
        let t = table(vec![route_config("api", "/api", "http://up.example.com")]);
        let current = t.find("/api/x").unwrap();
        let (rewritten, class) = rewrite_location(
            "http://up.example.com:80/next",
            "http",
            "proxy.example.com",
            t.routes(),
            current,
        );
        assert_eq!(class, RedirectClass::Internal);
        assert_eq!(rewritten.unwrap(), "http://proxy.example.com/api/next");
    }

    #[test]
    fn non_default_port_stays_distinct() {
        let t = table(vec![route_config("api", "/api", "https://up.example.com")]);
        let current = t.find("/api/x").unwrap();
        let (_, class) = rewrite_location(
            "https://up.example.com:8443/next",
            "https",
            "proxy.example.com",
            t.routes(),
            current,
        );
        assert_eq!(class, RedirectClass::ExternalUnknown);
    }

    #[test]
    fn empty_scheme_defaults_to_https() {
        let mut config = route_config("api", "/api", "https://up.example.com");
        config.redirect_base_url = None;
        let t = table(vec![config]);
        let current = t.find("/api/x").unwrap();
        let (rewritten, _) = rewrite_location(
            "https://up.example.com/next",
            "",
            "proxy.example.com",
            t.routes(),
            current,
        );
        assert_eq!(rewritten.unwrap(), "https://proxy.example.com/api/next");
    }
}
