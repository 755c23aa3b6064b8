//! Proxy orchestration.
//!
//! Builds the pipeline from a [`ProxyConfig`], binds the enabled transports
//! and serves until shut down.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cache::ResponseCache;
use crate::config::ProxyConfig;
use crate::endpoint::EndpointResolver;
use crate::error::{Error, Result};
use crate::handler::QueryHandler;
use crate::provider::{DohProvider, DohTransport, HttpsTransport};
use crate::stats::Stats;
use crate::subnet::{SubnetMode, SubnetResolver};
use crate::transport::{tcp::TcpTransport, udp::UdpTransport};

/// A fully wired proxy, not yet listening.
pub struct Proxy {
    config: Arc<ProxyConfig>,
    handler: Arc<QueryHandler>,
}

impl Proxy {
    /// Wire the proxy against the configured HTTPS endpoint.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let endpoint = EndpointResolver::new(
            config.endpoint_ips.clone(),
            config.dns_resolver,
            config.request_timeout,
        );
        let transport = HttpsTransport::new(&config, endpoint)?;
        Self::with_transport(config, Arc::new(transport))
    }

    /// Wire the proxy against any DoH transport.
    pub fn with_transport(config: ProxyConfig, transport: Arc<dyn DohTransport>) -> Result<Self> {
        let subnet = Arc::new(SubnetResolver::new(
            config.subnet.clone(),
            config.request_timeout,
        )?);
        let config = Arc::new(config);
        let provider = Arc::new(DohProvider::new(config.clone(), transport, subnet));
        let cache = ResponseCache::new(config.cache, config.query_timeout);
        let handler = Arc::new(QueryHandler::new(provider, cache, Arc::new(Stats::new())));
        Ok(Self { config, handler })
    }

    pub fn handler(&self) -> &Arc<QueryHandler> {
        &self.handler
    }

    /// Bind every enabled transport. Fails only if none could be bound.
    pub async fn bind(self) -> Result<BoundProxy> {
        let addr = self.config.listen;

        let udp = if self.config.udp {
            match UdpTransport::bind(addr).await {
                Ok(udp) => Some(udp),
                Err(e) => {
                    error!("Cannot bind UDP on {}: {}", addr, e);
                    None
                }
            }
        } else {
            None
        };

        let tcp = if self.config.tcp {
            match TcpTransport::bind(addr).await {
                Ok(tcp) => Some(tcp),
                Err(e) => {
                    error!("Cannot bind TCP on {}: {}", addr, e);
                    None
                }
            }
        } else {
            None
        };

        if udp.is_none() && tcp.is_none() {
            return Err(Error::Listen(format!("no transport could be bound on {addr}")));
        }
        Ok(BoundProxy {
            proxy: self,
            udp,
            tcp,
        })
    }
}

/// A proxy whose listeners are bound.
pub struct BoundProxy {
    proxy: Proxy,
    udp: Option<UdpTransport>,
    tcp: Option<TcpTransport>,
}

impl BoundProxy {
    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp.as_ref().and_then(|udp| udp.local_addr().ok())
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().and_then(|tcp| tcp.local_addr().ok())
    }

    /// Serve until `shutdown` completes or every listener has stopped.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let Proxy { config, handler } = self.proxy;
        let (stop, stopped) = watch::channel(false);

        let mut listeners: Vec<JoinHandle<()>> = Vec::new();
        if let Some(udp) = self.udp {
            let run = udp.run(handler.clone(), stopped.clone());
            listeners.push(tokio::spawn(async move {
                if let Err(e) = run.await {
                    error!("UDP listener failed: {}", e);
                }
            }));
        }
        if let Some(tcp) = self.tcp {
            let run = tcp.run(handler.clone(), stopped.clone());
            listeners.push(tokio::spawn(async move {
                if let Err(e) = run.await {
                    error!("TCP listener failed: {}", e);
                }
            }));
        }

        info!(
            "DoH proxy listening on {} (endpoint {}, cache {})",
            config.listen,
            config.endpoint,
            if config.cache { "on" } else { "off" }
        );

        if let SubnetMode::Auto { .. } = config.subnet {
            let handler = handler.clone();
            tokio::spawn(async move {
                match handler.provider().subnet_resolver().current().await {
                    Some(net) => info!("Advertising client subnet {}", net),
                    None => warn!("Client subnet detection failed, queries go out without one"),
                }
            });
        }

        let stats = config
            .stats_interval
            .map(|interval| tokio::spawn(report_stats(handler.clone(), interval)));

        let all_stopped = futures::future::join_all(listeners);
        tokio::pin!(all_stopped);
        tokio::select! {
            _ = shutdown => {
                info!("Shutting down");
                let _ = stop.send(true);
                all_stopped.await;
            }
            _ = &mut all_stopped => {
                warn!("All listeners stopped");
            }
        }

        if let Some(stats) = stats {
            stats.abort();
        }
        Ok(())
    }
}

/// Log a stats line every `interval`.
async fn report_stats(handler: Arc<QueryHandler>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // Skip first immediate tick
    loop {
        ticker.tick().await;
        let stats = handler.stats().snapshot_and_reset();
        info!(
            "[stats] cache={} requests={} forwarded={} cached={} shared={} synthesized={} failed={} avg_response={:.2}ms",
            handler.cache().len(),
            stats.requests,
            stats.forwarded,
            stats.cached,
            stats.shared,
            stats.synthesized,
            stats.failed,
            stats.avg_response_ms
        );
    }
}

/// Run the proxy with the given configuration until `shutdown` completes.
pub async fn run<F>(config: ProxyConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    Proxy::new(config)?.bind().await?.serve(shutdown).await
}
