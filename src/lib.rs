//! doh-proxy - A DNS proxy that answers queries over DNS-over-HTTPS.
//!
//! This library exposes the pipeline and transports for the binary,
//! benchmarks and integration tests.

pub mod cache;
pub mod config;
pub mod dns;
pub mod endpoint;
pub mod error;
pub mod handler;
pub mod provider;
pub mod proxy;
pub mod stats;
pub mod subnet;
pub mod transport;

pub use config::{Convention, ProxyConfig};
pub use error::{Error, Result};
pub use handler::QueryHandler;
pub use provider::{DohProvider, DohRequest, DohResponse, DohTransport};
pub use proxy::{BoundProxy, Proxy};
