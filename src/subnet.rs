//! EDNS client-subnet selection.

use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use ipnet::IpNet;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Service returning the caller's public address as plain text.
pub const DEFAULT_LOOKUP_URL: &str = "https://api.ipify.org";

/// Prefix advertised for an auto-detected IPv4 address.
pub const AUTO_PREFIX_V4: u8 = 24;
/// Prefix advertised for an auto-detected IPv6 address.
pub const AUTO_PREFIX_V6: u8 = 56;

/// Delay before a failed external lookup is attempted again.
const RETRY_AFTER_FAILURE: Duration = Duration::from_secs(60);

/// How the client subnet is chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubnetMode {
    /// Never send a subnet.
    Disabled,
    /// Derive the subnet from our external address.
    Auto {
        lookup_url: String,
        /// Refresh interval; `None` looks the address up once.
        refresh: Option<Duration>,
    },
    /// Always send this subnet.
    Fixed(IpNet),
}

impl SubnetMode {
    /// Parse `no`, `auto` or a `network/mask` literal.
    pub fn parse(value: &str, lookup_url: &str, refresh: Option<Duration>) -> Result<Self> {
        match value {
            "no" => Ok(SubnetMode::Disabled),
            "auto" => Ok(SubnetMode::Auto {
                lookup_url: lookup_url.to_string(),
                refresh,
            }),
            literal => {
                let net = IpNet::from_str(literal).map_err(|e| Error::InvalidSubnet {
                    value: literal.to_string(),
                    reason: e.to_string(),
                })?;
                Ok(SubnetMode::Fixed(net.trunc()))
            }
        }
    }
}

struct Detected {
    net: Option<IpNet>,
    at: Instant,
    failed: bool,
}

/// Resolves the subnet to attach to outgoing queries.
pub struct SubnetResolver {
    mode: SubnetMode,
    client: reqwest::Client,
    detected: RwLock<Option<Detected>>,
    refreshing: Mutex<()>,
}

impl SubnetResolver {
    pub fn new(mode: SubnetMode, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            mode,
            client,
            detected: RwLock::new(None),
            refreshing: Mutex::new(()),
        })
    }

    pub fn mode(&self) -> &SubnetMode {
        &self.mode
    }

    /// The subnet in effect for the next query.
    pub async fn current(&self) -> Option<IpNet> {
        match &self.mode {
            SubnetMode::Disabled => None,
            SubnetMode::Fixed(net) => Some(*net),
            SubnetMode::Auto {
                lookup_url,
                refresh,
            } => self.auto(lookup_url, *refresh).await,
        }
    }

    async fn auto(&self, lookup_url: &str, refresh: Option<Duration>) -> Option<IpNet> {
        if let Some(net) = self.fresh(refresh) {
            return net;
        }

        let _guard = self.refreshing.lock().await;
        // Another task may have refreshed while we waited.
        if let Some(net) = self.fresh(refresh) {
            return net;
        }

        let previous = self.detected.read().as_ref().and_then(|d| d.net);
        let (net, failed) = match self.lookup(lookup_url).await {
            Ok(ip) => {
                let net = subnet_of(ip);
                if previous != Some(net) {
                    info!("Using edns client subnet {}", net);
                }
                (Some(net), false)
            }
            Err(e) => {
                warn!("External address lookup failed: {}", e);
                (previous, true)
            }
        };

        *self.detected.write() = Some(Detected {
            net,
            at: Instant::now(),
            failed,
        });
        net
    }

    /// Cached value if it is still usable.
    fn fresh(&self, refresh: Option<Duration>) -> Option<Option<IpNet>> {
        let detected = self.detected.read();
        let detected = detected.as_ref()?;
        let interval = if detected.failed {
            Some(refresh.map_or(RETRY_AFTER_FAILURE, |r| r.min(RETRY_AFTER_FAILURE)))
        } else {
            refresh
        };
        match interval {
            Some(interval) if detected.at.elapsed() >= interval => None,
            _ => Some(detected.net),
        }
    }

    async fn lookup(&self, url: &str) -> Result<IpAddr> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Upstream(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::UpstreamHttp {
                status: response.status().as_u16(),
            });
        }
        let body = response
            .text()
            .await
            .map_err(|e| Error::Upstream(e.to_string()))?;
        debug!("External address lookup returned {:?}", body.trim());
        parse_external_ip(&body)
    }
}

/// Parse the body of an external address lookup.
fn parse_external_ip(body: &str) -> Result<IpAddr> {
    IpAddr::from_str(body.trim())
        .map_err(|e| Error::UpstreamDecode(format!("invalid external address {body:?}: {e}")))
}

/// Network advertised for an address.
pub fn subnet_of(ip: IpAddr) -> IpNet {
    let prefix = match ip {
        IpAddr::V4(_) => AUTO_PREFIX_V4,
        IpAddr::V6(_) => AUTO_PREFIX_V6,
    };
    IpNet::new(ip, prefix)
        .map(|net| net.trunc())
        .unwrap_or_else(|_| IpNet::from(ip))
}
