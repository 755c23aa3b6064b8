//! DoH endpoint address selection.
//!
//! The HTTPS client asks this resolver for the endpoint host and connects to
//! exactly the address it returns. TLS still validates against the hostname
//! from the endpoint URL, so pinning an IP does not weaken verification.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use rand::prelude::IndexedRandom;
use reqwest::dns::{Addrs, Name as HostName, Resolve, Resolving};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::error::{Error, Result};

const MAX_UDP_RESPONSE_SIZE: usize = 4096;

/// Picks the IP used to reach the DoH endpoint.
#[derive(Clone)]
pub struct EndpointResolver {
    inner: Arc<Inner>,
}

struct Inner {
    fixed: Vec<IpAddr>,
    resolver: Option<SocketAddr>,
    timeout: Duration,
}

impl EndpointResolver {
    /// A non-empty `fixed` list always wins over hostname resolution.
    pub fn new(fixed: Vec<IpAddr>, resolver: Option<SocketAddr>, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                fixed,
                resolver,
                timeout,
            }),
        }
    }

    pub fn is_fixed(&self) -> bool {
        !self.inner.fixed.is_empty()
    }

    /// Resolve the endpoint host to a single address for this request.
    ///
    /// There is no retry: when the chosen address is unreachable the request
    /// fails.
    pub async fn pick(&self, host: &str) -> Result<IpAddr> {
        if let Some(ip) = self.inner.fixed.choose(&mut rand::rng()) {
            debug!("Using fixed endpoint ip {} for {}", ip, host);
            return Ok(*ip);
        }

        if let Ok(ip) = IpAddr::from_str(host.trim_start_matches('[').trim_end_matches(']')) {
            return Ok(ip);
        }

        let candidates = match self.inner.resolver {
            Some(server) => self.resolve_via(server, host).await?,
            None => self.resolve_system(host).await?,
        };

        let ip = candidates
            .choose(&mut rand::rng())
            .copied()
            .ok_or_else(|| Error::EndpointResolution(format!("no address found for {host}")))?;
        debug!("Resolved endpoint {} to {}", host, ip);
        Ok(ip)
    }

    async fn resolve_system(&self, host: &str) -> Result<Vec<IpAddr>> {
        let lookup = tokio::net::lookup_host((host, 0));
        let addrs = tokio::time::timeout(self.inner.timeout, lookup)
            .await
            .map_err(|_| Error::EndpointResolution(format!("lookup of {host} timed out")))?
            .map_err(|e| Error::EndpointResolution(format!("lookup of {host} failed: {e}")))?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }

    /// Ask `server` directly, A first and AAAA when there are no A records.
    async fn resolve_via(&self, server: SocketAddr, host: &str) -> Result<Vec<IpAddr>> {
        let name = Name::from_str(host)
            .map(|mut name| {
                name.set_fqdn(true);
                name
            })
            .map_err(|e| Error::EndpointResolution(format!("invalid host {host:?}: {e}")))?;

        let ips = self.query_addresses(server, &name, RecordType::A).await?;
        if !ips.is_empty() {
            return Ok(ips);
        }
        self.query_addresses(server, &name, RecordType::AAAA).await
    }

    async fn query_addresses(
        &self,
        server: SocketAddr,
        name: &Name,
        rtype: RecordType,
    ) -> Result<Vec<IpAddr>> {
        let mut query = Message::new();
        query
            .set_id(rand::random())
            .set_recursion_desired(true)
            .add_query(Query::query(name.clone(), rtype));
        let bytes = query
            .to_vec()
            .map_err(|e| Error::EndpointResolution(format!("cannot encode query: {e}")))?;

        let response = tokio::time::timeout(self.inner.timeout, exchange_udp(server, &bytes))
            .await
            .map_err(|_| Error::EndpointResolution(format!("resolver {server} timed out")))??;

        let response = Message::from_vec(&response)
            .map_err(|e| Error::EndpointResolution(format!("invalid resolver answer: {e}")))?;
        if response.id() != query.id() {
            return Err(Error::EndpointResolution(format!(
                "resolver {server} answered with a mismatched id"
            )));
        }

        Ok(response
            .answers()
            .iter()
            .filter_map(|record| match record.data() {
                Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
                Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
                _ => None,
            })
            .collect())
    }
}

async fn exchange_udp(server: SocketAddr, query: &[u8]) -> Result<Vec<u8>> {
    let bind: SocketAddr = if server.is_ipv6() {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    };
    let io_err = |e: std::io::Error| Error::EndpointResolution(format!("resolver {server}: {e}"));

    let socket = UdpSocket::bind(bind).await.map_err(io_err)?;
    socket.connect(server).await.map_err(io_err)?;
    socket.send(query).await.map_err(io_err)?;

    let mut buf = vec![0u8; MAX_UDP_RESPONSE_SIZE];
    let len = socket.recv(&mut buf).await.map_err(io_err)?;
    buf.truncate(len);
    Ok(buf)
}

impl Resolve for EndpointResolver {
    fn resolve(&self, name: HostName) -> Resolving {
        let this = self.clone();
        Box::pin(async move {
            let ip = this.pick(name.as_str()).await?;
            // Port 0 lets the connector use the port from the endpoint URL.
            let addrs: Addrs = Box::new(std::iter::once(SocketAddr::new(ip, 0)));
            Ok::<_, Box<dyn std::error::Error + Send + Sync>>(addrs)
        })
    }
}
