//! Transport layer implementations for the proxy.
//!
//! Provides UDP and TCP listeners that receive DNS queries from clients
//! and hand them to the [`QueryHandler`](crate::handler::QueryHandler).

pub mod tcp;
pub mod udp;

use std::fmt;

/// Maximum size of a DNS packet (with some headroom).
pub const MAX_DNS_PACKET_SIZE: usize = 4096;

/// Size of a DNS header; anything shorter is not a query.
pub const DNS_HEADER_SIZE: usize = 12;

/// Transport protocol identifier for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
