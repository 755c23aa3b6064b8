use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{ArgAction, Parser};
use tracing_subscriber::EnvFilter;

use doh_proxy::config::{self, Convention, ProxyConfig};
use doh_proxy::subnet::{self, SubnetMode};

#[derive(Parser)]
#[command(name = "doh-proxy")]
#[command(about = "DNS proxy that resolves queries over DNS-over-HTTPS", long_about = None)]
struct Args {
    /// Address to listen on, [host]:port
    #[arg(long, default_value = ":53")]
    listen: String,

    /// Log level: trace, debug, info, warn, error, fatal or panic
    #[arg(long, default_value = "info")]
    loglevel: String,

    /// Use the JSON resolve API instead of RFC 8484 wire format
    #[arg(long)]
    google: bool,

    /// DoH endpoint URL
    #[arg(long, default_value = config::DEFAULT_ENDPOINT)]
    endpoint: String,

    /// Comma separated IPs to connect to instead of resolving the endpoint host
    #[arg(long, default_value = "")]
    endpoint_ips: String,

    /// EDNS client subnet: "auto", "no" or a network such as 192.0.2.0/24
    #[arg(long, default_value = "auto")]
    edns_subnet: String,

    /// Cache answers until their TTL runs out
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    cache: bool,

    /// Listen on TCP
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    tcp: bool,

    /// Listen on UDP
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    udp: bool,

    /// Extra HTTP header sent with every request, Key=Value (repeatable)
    #[arg(long = "header", value_parser = config::parse_key_value)]
    headers: Vec<(String, String)>,

    /// Extra query parameter sent with every request, key=value (repeatable)
    #[arg(long = "param", value_parser = config::parse_key_value)]
    params: Vec<(String, String)>,

    /// Allow HTTP/2 to the endpoint
    #[arg(long)]
    http2: bool,

    /// PEM file with an extra CA certificate to trust
    #[arg(long)]
    cacert: Option<PathBuf>,

    /// Answer AAAA questions with an empty answer
    #[arg(long)]
    no_ipv6: bool,

    /// DNS server used to resolve the endpoint host, ip[:port]
    #[arg(long)]
    dns_resolver: Option<String>,

    /// Send wire-format queries with POST instead of GET
    #[arg(long)]
    post: bool,

    /// Timeout of one HTTP exchange, in seconds
    #[arg(long, default_value_t = 5)]
    timeout: u64,

    /// Deadline for answering one query, in seconds
    #[arg(long, default_value_t = 10)]
    query_timeout: u64,

    /// Service returning our external IP, for --edns-subnet auto
    #[arg(long, default_value = subnet::DEFAULT_LOOKUP_URL)]
    subnet_lookup_url: String,

    /// Seconds between external IP lookups, 0 looks it up once
    #[arg(long, default_value_t = 0)]
    subnet_refresh: u64,

    /// Seconds between stats log lines, 0 disables them
    #[arg(long, default_value_t = 60)]
    stats_interval: u64,
}

impl Args {
    fn into_config(self) -> anyhow::Result<ProxyConfig> {
        let convention = if self.google {
            Convention::Json
        } else {
            Convention::Wire
        };
        let dns_resolver = self
            .dns_resolver
            .as_deref()
            .map(config::parse_dns_resolver)
            .transpose()?;

        Ok(ProxyConfig {
            listen: config::parse_listen(&self.listen)?,
            tcp: self.tcp,
            udp: self.udp,
            cache: self.cache,
            endpoint: config::parse_endpoint(&self.endpoint, convention)?,
            convention,
            post: self.post,
            endpoint_ips: config::parse_endpoint_ips(&self.endpoint_ips)?,
            subnet: SubnetMode::parse(
                &self.edns_subnet,
                &self.subnet_lookup_url,
                config::optional_secs(self.subnet_refresh),
            )?,
            headers: config::build_headers(&self.headers)?,
            params: self.params,
            http2: self.http2,
            ca_cert: self.cacert,
            no_aaaa: self.no_ipv6,
            dns_resolver,
            request_timeout: Duration::from_secs(self.timeout.max(1)),
            query_timeout: Duration::from_secs(self.query_timeout.max(1)),
            stats_interval: config::optional_secs(self.stats_interval),
        })
    }
}

fn init_logging(level: &str) -> anyhow::Result<()> {
    let level = config::parse_log_level(level)?;
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Cannot listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.loglevel)?;
    let config = args.into_config().context("invalid configuration")?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(doh_proxy::proxy::run(config, shutdown_signal()))?;
    Ok(())
}
