//! Proxy configuration.
//!
//! Everything here is validated once at startup and then shared read-only
//! by every component.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use reqwest::Url;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::level_filters::LevelFilter;

use crate::error::{Error, Result};
use crate::subnet::SubnetMode;

/// Default DoH endpoint (wire convention).
pub const DEFAULT_ENDPOINT: &str = "https://dns.google/dns-query";

/// Endpoint used by the alternative convention when none is given.
pub const DEFAULT_RESOLVE_ENDPOINT: &str = "https://dns.google/resolve";

/// How queries are encoded into HTTP requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convention {
    /// RFC 8484 `application/dns-message`.
    Wire,
    /// JSON "resolve" API (`application/dns-json`).
    Json,
}

/// Configuration for the DNS proxy.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Local address to bind (e.g., 0.0.0.0:53)
    pub listen: SocketAddr,
    pub tcp: bool,
    pub udp: bool,
    /// Cache answers by fingerprint
    pub cache: bool,
    pub endpoint: Url,
    pub convention: Convention,
    /// Send wire-format queries with POST instead of GET
    pub post: bool,
    /// Fixed endpoint IPs; when non-empty, hostname resolution is skipped
    pub endpoint_ips: Vec<IpAddr>,
    pub subnet: SubnetMode,
    pub headers: HeaderMap,
    pub params: Vec<(String, String)>,
    pub http2: bool,
    pub ca_cert: Option<PathBuf>,
    /// Reply to every AAAA question with an empty answer
    pub no_aaaa: bool,
    /// Resolver used to look up the endpoint hostname
    pub dns_resolver: Option<SocketAddr>,
    /// Timeout of a single HTTP exchange
    pub request_timeout: Duration,
    /// Overall deadline for answering one query
    pub query_timeout: Duration,
    /// Interval of the stats log line; `None` disables it
    pub stats_interval: Option<Duration>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 53),
            tcp: true,
            udp: true,
            cache: true,
            endpoint: Url::parse(DEFAULT_ENDPOINT).expect("default endpoint is a valid url"),
            convention: Convention::Wire,
            post: false,
            endpoint_ips: Vec::new(),
            subnet: SubnetMode::Disabled,
            headers: HeaderMap::new(),
            params: Vec::new(),
            http2: false,
            ca_cert: None,
            no_aaaa: false,
            dns_resolver: None,
            request_timeout: Duration::from_secs(5),
            query_timeout: Duration::from_secs(10),
            stats_interval: Some(Duration::from_secs(60)),
        }
    }
}

/// Parse a `[host]:port` listen address. An empty host binds all interfaces.
pub fn parse_listen(s: &str) -> Result<SocketAddr> {
    if let Some(port) = s.strip_prefix(':') {
        let port = port
            .parse::<u16>()
            .map_err(|e| Error::Config(format!("invalid listen port {port:?}: {e}")))?;
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }
    SocketAddr::from_str(s).map_err(|e| Error::Config(format!("invalid listen address {s:?}: {e}")))
}

/// Parse the endpoint URL, switching to the resolve endpoint when the
/// alternative convention is selected and the default was left in place.
pub fn parse_endpoint(s: &str, convention: Convention) -> Result<Url> {
    let s = if convention == Convention::Json && s == DEFAULT_ENDPOINT {
        DEFAULT_RESOLVE_ENDPOINT
    } else {
        s
    };
    let url = Url::parse(s).map_err(|e| Error::Config(format!("invalid endpoint {s:?}: {e}")))?;
    if url.host_str().is_none() {
        return Err(Error::Config(format!("endpoint {s:?} has no host")));
    }
    Ok(url)
}

/// Parse a comma separated IP list without whitespace, e.g. `1.1.1.1,1.0.0.1`.
pub fn parse_endpoint_ips(s: &str) -> Result<Vec<IpAddr>> {
    if s.is_empty() {
        return Ok(Vec::new());
    }
    s.split(',')
        .map(|part| {
            IpAddr::from_str(part)
                .map_err(|e| Error::Config(format!("invalid endpoint ip {part:?}: {e}")))
        })
        .collect()
}

/// Parse a resolver address, `ip` or `ip:port` (default port 53).
pub fn parse_dns_resolver(s: &str) -> Result<SocketAddr> {
    if let Ok(addr) = SocketAddr::from_str(s) {
        return Ok(addr);
    }
    let ip = s.trim_start_matches('[').trim_end_matches(']');
    IpAddr::from_str(ip)
        .map(|ip| SocketAddr::new(ip, 53))
        .map_err(|e| Error::Config(format!("invalid dns resolver {s:?}: {e}")))
}

/// Parse a `key=value` pair. Used as a clap value parser.
pub fn parse_key_value(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got {s:?}")),
    }
}

/// Build the extra header map. Repeated keys are kept as separate values.
pub fn build_headers(pairs: &[(String, String)]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (key, value) in pairs {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| Error::Config(format!("invalid header name {key:?}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::Config(format!("invalid header value for {key:?}: {e}")))?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// Parse a log level. `fatal` and `panic` are accepted as aliases of `error`.
pub fn parse_log_level(s: &str) -> Result<LevelFilter> {
    match s.to_ascii_lowercase().as_str() {
        "trace" => Ok(LevelFilter::TRACE),
        "debug" => Ok(LevelFilter::DEBUG),
        "info" => Ok(LevelFilter::INFO),
        "warn" | "warning" => Ok(LevelFilter::WARN),
        "error" | "fatal" | "panic" => Ok(LevelFilter::ERROR),
        other => Err(Error::Config(format!("invalid log level {other:?}"))),
    }
}

/// Seconds to an optional duration, `0` meaning "off".
pub fn optional_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
