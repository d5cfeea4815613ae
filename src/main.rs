use axum::routing::get;
use mimic_proxy::proxy::{install_recorder, LoggerConfig, Proxy};
use mimic_proxy::settings::Settings;
use mimic_proxy::Result;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::new()?;
    init_tracing(&settings.proxy.logger);

    info!("starting mimic-proxy");

    let metrics_config = settings.proxy.metrics.clone();
    let metrics_handle = if metrics_config.enabled {
        Some(install_recorder(&metrics_config)?)
    } else {
        None
    };

    let proxy = Proxy::new(settings.proxy)?;
    let mut router = proxy.into_router();

    if let Some(handle) = metrics_handle {
        let metrics_router = axum::Router::new().route(
            metrics_config.path.as_str(),
            get(move || {
                let handle = handle.clone();
                async move { handle.render() }
            }),
        );
        if metrics_config.port != 0 {
            let addr: SocketAddr = ([0, 0, 0, 0], metrics_config.port).into();
            let listener = TcpListener::bind(addr).await?;
            info!(address = %addr, path = %metrics_config.path, "metrics server listening");
            tokio::spawn(async move {
                if let Err(error) = axum::serve(listener, metrics_router).await {
                    tracing::error!(%error, "metrics server failed");
                }
            });
        } else {
            router = router.merge(metrics_router);
        }
    }

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(address = %addr, "listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("mimic-proxy stopped");
    Ok(())
}

fn init_tracing(logger: &LoggerConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logger.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match (logger.format.as_str(), logger.output.as_str()) {
        ("json", "stderr") => builder.json().with_writer(std::io::stderr).init(),
        ("json", _) => builder.json().init(),
        (_, "stderr") => builder.with_writer(std::io::stderr).init(),
        _ => builder.init(),
    }
}

/// Wait for shutdown signal (Ctrl+C).
async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "failed to install Ctrl+C handler");
        return;
    }
    info!("shutdown signal received");
}
