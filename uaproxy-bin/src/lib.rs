use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Registry, TextEncoder};
use std::error::Error;
use std::net::SocketAddr;
use std::path::Path;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{EnvFilter, fmt};
use uaproxy_config::{Config, RewriteMode};
use uaproxy_core::run_proxy;

/// Command-line settings that win over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub log_level: Option<String>,
    pub mode: Option<RewriteMode>,
    pub user_agent: Option<String>,
}

impl Overrides {
    pub fn apply(&self, config: &mut Config) {
        if let Some(mode) = self.mode {
            config.rewrite_mode = mode;
        }
        if let Some(ref user_agent) = self.user_agent {
            config.user_agent.clone_from(user_agent);
        }
    }
}

pub async fn run(config_path: &Path, overrides: Overrides) -> Result<(), Box<dyn Error>> {
    // Initialize logging
    let level: Directive = overrides.log_level.as_deref().unwrap_or("info").parse()?;
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level))
        .with_target(false)
        .json()
        .init();

    // Load configuration
    let mut config = Config::from_file(config_path)?;
    overrides.apply(&mut config);
    info!(
        config = %config_path.display(),
        mode = config.rewrite_mode.as_str(),
        user_agent = %config.user_agent,
        "Configuration loaded"
    );

    // Set up metrics
    let registry = if config.metrics.enabled {
        let registry = Registry::new();
        let metrics_addr: SocketAddr = config.metrics.address.parse()?;
        serve_metrics(TcpListener::bind(metrics_addr).await?, registry.clone());
        info!("Metrics available at http://{}/metrics", metrics_addr);
        Some(registry)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        let _ = shutdown_tx.send(());
    });

    // Run the proxy
    run_proxy(config, registry, shutdown_rx).await?;

    Ok(())
}

fn serve_metrics(listener: TcpListener, registry: Registry) {
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Metrics accept error: {}", e);
                    continue;
                }
            };
            let registry = registry.clone();
            let io = TokioIo::new(stream);

            tokio::spawn(async move {
                let service =
                    hyper::service::service_fn(move |_req: Request<hyper::body::Incoming>| {
                        let registry = registry.clone();
                        async move {
                            let encoder = TextEncoder::new();
                            let metric_families = registry.gather();
                            let mut buffer = vec![];
                            encoder
                                .encode(&metric_families, &mut buffer)
                                .map_err(|e| format!("Metrics encoding error: {}", e))?;
                            Ok::<_, String>(Response::new(Full::new(bytes::Bytes::from(buffer))))
                        }
                    });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Metrics server error: {}", err);
                }
            });
        }
    });
}
