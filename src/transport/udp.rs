//! UDP transport for DNS queries.
//!
//! Each datagram is answered by its own task, so a slow upstream exchange
//! never holds up the receive loop. Replies go out through the listening
//! socket to the datagram's source address.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, error, info};

use super::{DNS_HEADER_SIZE, MAX_DNS_PACKET_SIZE, Protocol};
use crate::handler::QueryHandler;

/// UDP listener for the proxy.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind the listening socket.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive queries until `shutdown` flips or the socket fails.
    pub async fn run(
        self,
        handler: Arc<QueryHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> io::Result<()> {
        let mut buf = [0u8; MAX_DNS_PACKET_SIZE];
        info!("UDP listener on {}", self.local_addr()?);

        loop {
            let (len, src) = tokio::select! {
                _ = shutdown.changed() => {
                    info!("UDP listener stopped");
                    return Ok(());
                }
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok(r) => r,
                    Err(e) => {
                        error!("UDP recv error: {}", e);
                        return Err(e);
                    }
                },
            };

            if len < DNS_HEADER_SIZE {
                continue;
            }

            let query = buf[..len].to_vec();
            let socket = self.socket.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                let Some(reply) = handler.handle(&query, Protocol::Udp).await else {
                    return;
                };
                if let Err(e) = socket.send_to(&reply, src).await {
                    debug!("UDP response error to {}: {}", src, e);
                }
            });
        }
    }
}
