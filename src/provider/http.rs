//! HTTPS transport used by the provider.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Certificate, Method, StatusCode, Url};
use tracing::debug;

use crate::config::ProxyConfig;
use crate::endpoint::EndpointResolver;
use crate::error::{Error, Result};

/// Largest body accepted from the endpoint.
pub const MAX_BODY_SIZE: usize = 65535;

/// An outgoing DoH request.
#[derive(Debug, Clone)]
pub struct DohRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

impl DohRequest {
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }
}

/// What came back from the endpoint.
#[derive(Debug, Clone)]
pub struct DohResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

/// Performs one HTTP exchange. No retries.
#[async_trait]
pub trait DohTransport: Send + Sync {
    async fn send(&self, request: DohRequest) -> Result<DohResponse>;
}

/// `reqwest` backed transport.
///
/// Connections go to the address chosen by the [`EndpointResolver`]; the
/// endpoint hostname is kept for SNI and certificate validation.
pub struct HttpsTransport {
    client: reqwest::Client,
}

impl HttpsTransport {
    pub fn new(config: &ProxyConfig, endpoint: EndpointResolver) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(config.request_timeout)
            .user_agent(concat!("doh-proxy/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::none())
            .tcp_nodelay(true);

        if !config.http2 {
            builder = builder.http1_only();
        }

        if let Some(path) = &config.ca_cert {
            let pem = std::fs::read(path).map_err(|e| {
                Error::Config(format!("cannot read CA certificate {}: {e}", path.display()))
            })?;
            let cert = Certificate::from_pem(&pem).map_err(|e| {
                Error::Config(format!("invalid CA certificate {}: {e}", path.display()))
            })?;
            builder = builder.add_root_certificate(cert);
        }

        if endpoint.is_fixed() {
            // Every request makes its own pick from the fixed list.
            builder = builder.pool_max_idle_per_host(0);
        }

        let client = builder
            .dns_resolver(Arc::new(endpoint))
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl DohTransport for HttpsTransport {
    async fn send(&self, request: DohRequest) -> Result<DohResponse> {
        debug!("{} {}", request.method, request.url);

        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(classify)?;
        let status = response.status();
        let body = read_body(response).await?;
        Ok(DohResponse { status, body })
    }
}

/// Read the body, giving up as soon as it exceeds [`MAX_BODY_SIZE`].
async fn read_body(mut response: reqwest::Response) -> Result<Vec<u8>> {
    let too_large = |len: u64| {
        Error::UpstreamDecode(format!("response body of at least {len} bytes is too large"))
    };
    let limit = MAX_BODY_SIZE as u64;
    if let Some(len) = response.content_length().filter(|&len| len > limit) {
        return Err(too_large(len));
    }

    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(classify)? {
        if body.len() + chunk.len() > MAX_BODY_SIZE {
            return Err(too_large((body.len() + chunk.len()) as u64));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

/// Map a client error, surfacing our own errors raised during connect.
fn classify(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        return Error::Timeout;
    }
    let mut source = std::error::Error::source(&err);
    while let Some(inner) = source {
        if let Some(own) = inner.downcast_ref::<Error>() {
            return own.clone();
        }
        source = inner.source();
    }
    Error::Upstream(err.to_string())
}
