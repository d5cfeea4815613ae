//! Shared upstream transport: a pooled hyper client with rustls TLS,
//! honoring the connection pool and timeout tuning from [`TransportConfig`]
//! and the `HTTP_PROXY` / `HTTPS_PROXY` / `NO_PROXY` environment settings.

use crate::proxy::config::{ConfigError, TlsConfig, TransportConfig};
use axum::body::Body;
use http::Uri;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use rustls::RootCertStore;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tower_service::Service;
use tracing::{debug, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The pooled client shared by every route.
pub type UpstreamClient = Client<HttpsConnector<ProxiedConnector>, Body>;

/// Build the shared client. HTTP/2 is used when ALPN negotiates it; TLS
/// verification follows [`TlsConfig`] and defaults to the platform trust
/// store. Environment proxy settings are honored per target.
pub fn build_client(
    transport: &TransportConfig,
    tls: &TlsConfig,
) -> Result<UpstreamClient, ConfigError> {
    let tls_config = build_tls_config(tls)?;

    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_connect_timeout(Some(transport.dial_timeout));
    http.set_keepalive(Some(Duration::from_secs(30)));
    http.set_nodelay(true);

    let proxied = ProxiedConnector {
        direct: http,
        proxies: Arc::new(EnvProxies::from_env()),
        dial_timeout: transport.dial_timeout,
    };

    let connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(proxied);

    let max_idle_per_host = if transport.disable_keep_alives {
        0
    } else {
        transport.max_idle_conns_per_host
    };

    let mut builder = Client::builder(TokioExecutor::new());
    builder
        .pool_timer(TokioTimer::new())
        .pool_idle_timeout(transport.idle_conn_timeout)
        .pool_max_idle_per_host(max_idle_per_host);

    Ok(builder.build(connector))
}

fn build_tls_config(tls: &TlsConfig) -> Result<rustls::ClientConfig, ConfigError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let versions = protocol_versions(tls.min_version.as_deref());

    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(versions)
        .map_err(|e| ConfigError::Transport(format!("TLS protocol versions: {e}")))?;

    let config = if tls.insecure_skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoCertificateVerification(
                provider,
            )))
            .with_no_client_auth()
    } else {
        builder
            .with_root_certificates(load_roots(tls)?)
            .with_no_client_auth()
    };

    Ok(config)
}

fn load_roots(tls: &TlsConfig) -> Result<RootCertStore, ConfigError> {
    let mut roots = RootCertStore::empty();

    if let Some(ca_file) = &tls.ca_file {
        let pem = std::fs::read(ca_file).map_err(|e| {
            ConfigError::Transport(format!("ca_file {}: {e}", ca_file.display()))
        })?;
        let certs: Vec<_> = rustls_pemfile::certs(&mut pem.as_slice())
            .collect::<Result<_, _>>()
            .map_err(|e| {
                ConfigError::Transport(format!("ca_file {}: {e}", ca_file.display()))
            })?;
        let (added, ignored) = roots.add_parsable_certificates(certs);
        if added == 0 {
            return Err(ConfigError::Transport(format!(
                "ca_file {}: no usable certificates",
                ca_file.display()
            )));
        }
        if ignored > 0 {
            warn!(ca_file = %ca_file.display(), ignored, "skipped unparsable CA certificates");
        }
    } else {
        let native = rustls_native_certs::load_native_certs();
        for error in &native.errors {
            warn!(%error, "failed to load a native root certificate");
        }
        let (_, ignored) = roots.add_parsable_certificates(native.certs);
        if ignored > 0 {
            warn!(ignored, "skipped unparsable native root certificates");
        }
    }

    Ok(roots)
}

/// Proxy selection from the process environment, Go
/// `ProxyFromEnvironment`-style: `HTTP_PROXY`/`HTTPS_PROXY` by target
/// scheme, `NO_PROXY` host entries (exact, domain suffix, or `*`), and
/// localhost/loopback targets always direct.
#[derive(Clone, Debug, Default)]
pub(crate) struct EnvProxies {
    http: Option<Uri>,
    https: Option<Uri>,
    no_proxy: Vec<String>,
}

impl EnvProxies {
    pub(crate) fn from_env() -> Self {
        Self {
            http: proxy_from_var("HTTP_PROXY", "http_proxy"),
            https: proxy_from_var("HTTPS_PROXY", "https_proxy"),
            no_proxy: env_var("NO_PROXY", "no_proxy")
                .map(|value| {
                    value
                        .split(',')
                        .map(|entry| entry.trim().trim_start_matches('.').to_ascii_lowercase())
                        .filter(|entry| !entry.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    pub(crate) fn proxy_for(&self, dst: &Uri) -> Option<&Uri> {
        let host = dst.host()?;
        if self.bypass(host) {
            return None;
        }
        if dst.scheme_str() == Some("https") {
            self.https.as_ref()
        } else {
            self.http.as_ref()
        }
    }

    fn bypass(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if bare == "localhost"
            || bare
                .parse::<std::net::IpAddr>()
                .map(|ip| ip.is_loopback())
                .unwrap_or(false)
        {
            return true;
        }
        self.no_proxy.iter().any(|entry| {
            entry == "*" || host == entry.as_str() || host.ends_with(&format!(".{entry}"))
        })
    }
}

fn env_var(upper: &str, lower: &str) -> Option<String> {
    std::env::var(upper)
        .ok()
        .filter(|value| !value.is_empty())
        .or_else(|| std::env::var(lower).ok().filter(|value| !value.is_empty()))
}

fn proxy_from_var(upper: &str, lower: &str) -> Option<Uri> {
    let raw = env_var(upper, lower)?;
    let raw = if raw.contains("://") {
        raw
    } else {
        format!("http://{raw}")
    };
    match raw.parse() {
        Ok(uri) => Some(uri),
        Err(error) => {
            warn!(%error, proxy = %raw, "ignoring unparsable proxy URL from environment");
            None
        }
    }
}

/// Connector that dials the target directly, or through the environment's
/// proxy via an HTTP CONNECT tunnel when one applies. The TLS layer above
/// then negotiates with the target over whichever stream comes back.
#[derive(Clone)]
pub struct ProxiedConnector {
    direct: HttpConnector,
    proxies: Arc<EnvProxies>,
    dial_timeout: Duration,
}

impl Service<Uri> for ProxiedConnector {
    type Response = TokioIo<TcpStream>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.direct.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        match self.proxies.proxy_for(&dst) {
            Some(proxy) => {
                debug!(target = %dst, proxy = %proxy, "connecting via environment proxy");
                let proxy = proxy.clone();
                let dial_timeout = self.dial_timeout;
                Box::pin(async move { connect_via_proxy(proxy, dst, dial_timeout).await })
            }
            None => {
                let fut = self.direct.call(dst);
                Box::pin(async move { fut.await.map_err(Into::into) })
            }
        }
    }
}

/// Open a CONNECT tunnel to `dst` through `proxy`.
async fn connect_via_proxy(
    proxy: Uri,
    dst: Uri,
    dial_timeout: Duration,
) -> Result<TokioIo<TcpStream>, BoxError> {
    let proxy_host = proxy.host().ok_or("proxy URL has no host")?;
    let proxy_port = proxy
        .port_u16()
        .unwrap_or(if proxy.scheme_str() == Some("https") { 443 } else { 80 });
    let dst_host = dst.host().ok_or("destination has no host")?;
    let dst_port = dst
        .port_u16()
        .unwrap_or(if dst.scheme_str() == Some("https") { 443 } else { 80 });

    let mut stream = tokio::time::timeout(
        dial_timeout,
        TcpStream::connect((proxy_host, proxy_port)),
    )
    .await
    .map_err(|_| format!("connect to proxy {proxy_host}:{proxy_port} timed out"))??;
    stream.set_nodelay(true)?;

    let request =
        format!("CONNECT {dst_host}:{dst_port} HTTP/1.1\r\nHost: {dst_host}:{dst_port}\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut head = Vec::with_capacity(256);
    let mut chunk = [0u8; 256];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err("proxy closed the connection during CONNECT".into());
        }
        head.extend_from_slice(&chunk[..n]);
        if head.windows(4).any(|window| window == b"\r\n\r\n") {
            break;
        }
        if head.len() > 8192 {
            return Err("proxy CONNECT response too large".into());
        }
    }

    let response = String::from_utf8_lossy(&head);
    let status_line = response.lines().next().unwrap_or("");
    if status_line.split_whitespace().nth(1) != Some("200") {
        return Err(format!("proxy refused CONNECT: {status_line}").into());
    }

    Ok(TokioIo::new(stream))
}

/// Map the configured floor to rustls protocol versions. rustls does not
/// implement TLS 1.0/1.1, so those floors degrade to 1.2.
const TLS13_ONLY: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS13];
const TLS12_AND_TLS13: &[&rustls::SupportedProtocolVersion] =
    &[&rustls::version::TLS12, &rustls::version::TLS13];

fn protocol_versions(min_version: Option<&str>) -> &'static [&'static rustls::SupportedProtocolVersion] {
    match min_version {
        Some("1.3") => TLS13_ONLY,
        _ => TLS12_AND_TLS13,
    }
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};
    use std::sync::Arc;

    /// Accepts any server certificate. Only used with
    /// `insecure_skip_verify: true`.
    #[derive(Debug)]
    pub(super) struct NoCertificateVerification(pub(super) Arc<CryptoProvider>);

    impl ServerCertVerifier for NoCertificateVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_client_with_defaults_succeeds() {
        let client = build_client(&TransportConfig::default(), &TlsConfig::default());
        assert!(client.is_ok());
    }

    #[test]
    fn build_client_with_insecure_verifier_succeeds() {
        let tls = TlsConfig {
            insecure_skip_verify: true,
            ..TlsConfig::default()
        };
        assert!(build_client(&TransportConfig::default(), &tls).is_ok());
    }

    #[test]
    fn min_version_one_three_restricts_protocols() {
        let versions = protocol_versions(Some("1.3"));
        assert_eq!(versions.len(), 1);
    }

    #[test]
    fn missing_ca_file_is_a_config_error() {
        let tls = TlsConfig {
            ca_file: Some("/nonexistent/ca.pem".into()),
            ..TlsConfig::default()
        };
        assert!(build_client(&TransportConfig::default(), &tls).is_err());
    }

    fn env_proxies(no_proxy: &[&str]) -> EnvProxies {
        EnvProxies {
            http: Some("http://proxy.internal:3128".parse().unwrap()),
            https: Some("http://secure-proxy.internal:3128".parse().unwrap()),
            no_proxy: no_proxy.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn proxy_selection_follows_target_scheme() {
        let proxies = env_proxies(&[]);
        let http_target: Uri = "http://api.example.com/".parse().unwrap();
        let https_target: Uri = "https://api.example.com/".parse().unwrap();

        assert_eq!(
            proxies.proxy_for(&http_target).unwrap().host(),
            Some("proxy.internal")
        );
        assert_eq!(
            proxies.proxy_for(&https_target).unwrap().host(),
            Some("secure-proxy.internal")
        );
    }

    #[test]
    fn no_proxy_matches_exact_host_and_subdomains() {
        let proxies = env_proxies(&["example.com"]);
        let exact: Uri = "http://example.com/".parse().unwrap();
        let sub: Uri = "http://api.example.com/".parse().unwrap();
        let other: Uri = "http://example.net/".parse().unwrap();

        assert!(proxies.proxy_for(&exact).is_none());
        assert!(proxies.proxy_for(&sub).is_none());
        assert!(proxies.proxy_for(&other).is_some());
    }

    #[test]
    fn no_proxy_wildcard_disables_proxying() {
        let proxies = env_proxies(&["*"]);
        let target: Uri = "http://api.example.com/".parse().unwrap();
        assert!(proxies.proxy_for(&target).is_none());
    }

    #[test]
    fn loopback_targets_always_go_direct() {
        let proxies = env_proxies(&[]);
        for target in ["http://localhost:8080/", "http://127.0.0.1:9/"] {
            let uri: Uri = target.parse().unwrap();
            assert!(proxies.proxy_for(&uri).is_none(), "{target} used a proxy");
        }
    }
}
