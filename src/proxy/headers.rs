//! Header transformation engine.
//!
//! Both directions (client→upstream, upstream→client) share one algorithm:
//! copy, strip by pattern, replace with literals, add with
//! environment-expanded values. The engine never mutates its input map.
//! Hop-by-hop headers are removed separately, right before a request leaves
//! the process.

use crate::proxy::config::{HeaderConfig, RouteConfigError};
use crate::proxy::types::RouteName;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::debug;

/// Standard header names used by the pipeline itself
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Hop-by-hop headers per RFC 2616 §13.5.1; never forwarded
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// A header-name glob: literal characters, optionally terminated by `*`.
#[derive(Clone, Debug)]
pub struct StripPattern {
    pattern: String,
    wildcard: bool,
}

impl StripPattern {
    pub fn new(raw: &str) -> Self {
        let lowered = raw.to_ascii_lowercase();
        match lowered.strip_suffix('*') {
            Some(prefix) => Self {
                pattern: prefix.to_string(),
                wildcard: true,
            },
            None => Self {
                pattern: lowered,
                wildcard: false,
            },
        }
    }

    /// Case-insensitive match: exact, or prefix when the pattern ended in `*`.
    pub fn matches(&self, name: &str) -> bool {
        debug_assert_eq!(name, name.to_ascii_lowercase());
        if self.wildcard {
            name.starts_with(&self.pattern)
        } else {
            name == self.pattern
        }
    }
}

/// Counts reported by one transform pass, for metrics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransformStats {
    pub stripped: usize,
    pub added: usize,
}

/// Compiled header rules for one route.
///
/// Replace and add values are parsed (and `${VAR}`-expanded) once at
/// construction; per-request work is pure map building.
#[derive(Clone, Debug)]
pub struct HeaderEngine {
    route: RouteName,
    strip_incoming: Vec<StripPattern>,
    strip_outgoing: Vec<StripPattern>,
    replace_incoming: Vec<(HeaderName, HeaderValue)>,
    replace_outgoing: Vec<(HeaderName, HeaderValue)>,
    add_upstream: Vec<(HeaderName, HeaderValue)>,
    add_downstream: Vec<(HeaderName, HeaderValue)>,
}

impl HeaderEngine {
    pub fn new(config: &HeaderConfig, route: RouteName) -> Result<Self, RouteConfigError> {
        let literal = |name: &str, value: &str| parse_header(name, value);
        let expanded = |name: &str, value: &str| parse_header(name, &expand_env(value));

        Ok(Self {
            route,
            strip_incoming: config
                .strip_incoming
                .iter()
                .map(|p| StripPattern::new(p))
                .collect(),
            strip_outgoing: config
                .strip_outgoing
                .iter()
                .map(|p| StripPattern::new(p))
                .collect(),
            replace_incoming: parse_pairs(&config.replace_incoming, literal)?,
            replace_outgoing: parse_pairs(&config.replace_outgoing, literal)?,
            add_upstream: parse_pairs(&config.add_upstream, expanded)?,
            add_downstream: parse_pairs(&config.add_downstream, expanded)?,
        })
    }

    /// Transform a client request's headers for forwarding to the upstream.
    pub fn process_incoming(&self, headers: &HeaderMap) -> (HeaderMap, TransformStats) {
        self.process(
            headers,
            &self.strip_incoming,
            &self.replace_incoming,
            &self.add_upstream,
            "incoming",
        )
    }

    /// Transform an upstream response's headers for return to the client.
    pub fn process_outgoing(&self, headers: &HeaderMap) -> (HeaderMap, TransformStats) {
        self.process(
            headers,
            &self.strip_outgoing,
            &self.replace_outgoing,
            &self.add_downstream,
            "outgoing",
        )
    }

    /// Whether an incoming strip pattern covers the given header name.
    pub fn strips_incoming(&self, name: &str) -> bool {
        let lowered = name.to_ascii_lowercase();
        self.strip_incoming.iter().any(|p| p.matches(&lowered))
    }

    fn process(
        &self,
        headers: &HeaderMap,
        strips: &[StripPattern],
        replaces: &[(HeaderName, HeaderValue)],
        adds: &[(HeaderName, HeaderValue)],
        direction: &'static str,
    ) -> (HeaderMap, TransformStats) {
        let mut out = headers.clone();

        let doomed: Vec<HeaderName> = out
            .keys()
            .filter(|name| strips.iter().any(|p| p.matches(name.as_str())))
            .cloned()
            .collect();
        for name in &doomed {
            out.remove(name);
        }
        if !doomed.is_empty() {
            debug!(
                route = %self.route,
                direction,
                count = doomed.len(),
                "stripped headers"
            );
        }

        for (name, value) in replaces {
            out.insert(name.clone(), value.clone());
            debug!(route = %self.route, direction, header = %name, "replaced header");
        }

        for (name, value) in adds {
            out.insert(name.clone(), value.clone());
        }
        if !adds.is_empty() {
            debug!(
                route = %self.route,
                direction,
                count = adds.len(),
                "added headers"
            );
        }

        (
            out,
            TransformStats {
                stripped: doomed.len(),
                added: adds.len(),
            },
        )
    }
}

fn parse_pairs<F>(
    pairs: &std::collections::BTreeMap<String, String>,
    parse: F,
) -> Result<Vec<(HeaderName, HeaderValue)>, RouteConfigError>
where
    F: Fn(&str, &str) -> Result<(HeaderName, HeaderValue), RouteConfigError>,
{
    pairs
        .iter()
        .map(|(name, value)| parse(name, value))
        .collect()
}

fn parse_header(name: &str, value: &str) -> Result<(HeaderName, HeaderValue), RouteConfigError> {
    let name = name
        .parse::<HeaderName>()
        .map_err(|_| RouteConfigError::InvalidHeader(name.to_string()))?;
    let value = HeaderValue::from_str(value)
        .map_err(|_| RouteConfigError::InvalidHeader(name.to_string()))?;
    Ok((name, value))
}

/// Expand `${VAR}` references against the process environment.
///
/// Unset variables expand to the empty string; an unclosed `${` leaves the
/// remainder of the value untouched.
pub fn expand_env(value: &str) -> String {
    let mut expanded = String::with_capacity(value.len());
    let mut rest = value;
    loop {
        let Some(start) = rest.find("${") else {
            expanded.push_str(rest);
            return expanded;
        };
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            expanded.push_str(rest);
            return expanded;
        };
        expanded.push_str(&rest[..start]);
        let var = &after[..end];
        if let Ok(val) = std::env::var(var) {
            expanded.push_str(&val);
        }
        rest = &after[end + 1..];
    }
}

/// Remove hop-by-hop headers: the RFC 2616 set plus any name listed in the
/// `Connection` header value.
pub fn remove_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    for name in listed {
        headers.remove(name.as_str());
    }
}
