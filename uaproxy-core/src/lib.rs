pub mod cache;
pub mod connection;
pub mod events;
pub mod http;
pub mod metadata;
pub mod mitm;
pub mod peek;
pub mod rewrite;
pub mod rule;
pub mod sniff;
pub mod socks5;

pub use cache::DestinationCache;
pub use connection::{BoxedStream, ConnLink, ConnectionHandler, Protocol};
pub use events::{Event, EventSink, HostStats, Recorder};
pub use mitm::{HostnameFilter, TlsInterceptor};
pub use rewrite::{RewriteDecision, Rewriter};

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use prometheus::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info};
use uaproxy_config::Config;

pub async fn run_proxy(
    config: Config,
    registry: Option<Registry>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(config);
    let rewriter = Arc::new(Rewriter::from_config(&config)?);

    let cache = Arc::new(DestinationCache::from_config(&config.cache, registry.as_ref())?);
    let cleanup = cache
        .clone()
        .start_cleanup_task(Duration::from_secs(config.cache.cleanup_interval.max(1)));

    let (events, rx) = EventSink::channel(config.events.capacity, registry.as_ref())?;
    let recorder = Arc::new(Recorder::new(registry.as_ref())?);
    let recorder_task = recorder.clone().spawn(rx);

    let handler = ConnectionHandler::new(
        config.clone(),
        rewriter,
        cache.clone(),
        events,
        registry.as_ref(),
    )?;

    let mut listeners: Vec<TcpListener> = Vec::new();
    for addr_str in &config.listen_addrs {
        let addr: SocketAddr = addr_str.parse()?;
        info!("Starting SOCKS5 listener on {}", addr);
        listeners.push(TcpListener::bind(addr).await?);
    }

    info!(
        mode = config.rewrite_mode.as_str(),
        "Proxy started, waiting for connections..."
    );

    loop {
        let mut accepts = FuturesUnordered::new();
        for listener in &listeners {
            accepts.push(listener.accept());
        }

        tokio::select! {
            _ = shutdown.recv() => {
                info!("Received shutdown signal");
                break;
            }
            Some(result) = accepts.next() => {
                match result {
                    Ok((socket, addr)) => {
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            handler.handle_connection(socket, addr).await;
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
        }
    }

    cleanup.abort();
    let cache_stats = cache.stats();
    info!(
        entries = cache_stats.entries,
        capacity = cache_stats.capacity,
        ttl_secs = cache_stats.ttl.as_secs(),
        "Destination cache at shutdown"
    );
    // Live connections keep their sinks; the recorder stops with the runtime
    drop(handler);
    recorder_task.abort();
    for stats in recorder.snapshot().iter().take(10) {
        info!(
            host = %stats.host,
            rewrites = stats.rewrites,
            pass_throughs = stats.pass_throughs,
            "Host summary"
        );
    }

    info!("Shutting down proxy");
    Ok(())
}
