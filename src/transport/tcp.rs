//! TCP transport for DNS queries.
//!
//! Each client connection is handled independently. DNS messages over TCP
//! are prefixed with a 2-byte big-endian length, and a client may send
//! several queries on one connection.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

use super::{DNS_HEADER_SIZE, Protocol};
use crate::handler::QueryHandler;

/// How long a connection may sit idle between queries.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP listener for the proxy.
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    /// Bind a TCP listener for the transport.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` flips or accepting fails.
    pub async fn run(
        self,
        handler: Arc<QueryHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) -> io::Result<()> {
        info!("TCP listener on {}", self.local_addr()?);

        loop {
            let (client, peer) = tokio::select! {
                _ = shutdown.changed() => {
                    info!("TCP listener stopped");
                    return Ok(());
                }
                result = self.listener.accept() => match result {
                    Ok(r) => r,
                    Err(e) => {
                        error!("TCP accept error: {}", e);
                        return Err(e);
                    }
                },
            };

            let handler = handler.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(client, &handler).await {
                    debug!("TCP connection from {} closed: {}", peer, e);
                }
            });
        }
    }
}

/// Serve queries on one connection until the client closes it or idles out.
async fn handle_connection(mut client: TcpStream, handler: &QueryHandler) -> io::Result<()> {
    while let Some(query) = read_dns_message(&mut client, IDLE_TIMEOUT).await? {
        if query.len() < DNS_HEADER_SIZE {
            continue;
        }
        if let Some(reply) = handler.handle(&query, Protocol::Tcp).await {
            write_dns_message(&mut client, &reply).await?;
        }
    }
    Ok(())
}

/// Read one length-prefixed DNS message, without the prefix.
///
/// Returns `None` on a clean close or when no message starts within `idle`.
pub async fn read_dns_message<S>(stream: &mut S, idle: Duration) -> io::Result<Option<Vec<u8>>>
where
    S: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 2];
    match tokio::time::timeout(idle, stream.read_exact(&mut prefix)).await {
        Err(_) => return Ok(None),
        Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Ok(Err(e)) => return Err(e),
        Ok(Ok(_)) => {}
    }

    let len = usize::from(u16::from_be_bytes(prefix));
    let mut message = vec![0u8; len];
    tokio::time::timeout(idle, stream.read_exact(&mut message))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "incomplete message"))??;
    Ok(Some(message))
}

/// Write one DNS message with its length prefix.
pub async fn write_dns_message<S>(stream: &mut S, message: &[u8]) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let len = u16::try_from(message.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "message too large"))?;
    let mut framed = Vec::with_capacity(message.len() + 2);
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(message);
    stream.write_all(&framed).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_framing() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_dns_message(&mut client, b"first message").await.unwrap();
        write_dns_message(&mut client, b"second").await.unwrap();
        drop(client);

        let idle = Duration::from_secs(1);
        assert_eq!(
            read_dns_message(&mut server, idle).await.unwrap().unwrap(),
            b"first message"
        );
        assert_eq!(
            read_dns_message(&mut server, idle).await.unwrap().unwrap(),
            b"second"
        );
        assert!(read_dns_message(&mut server, idle).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_message_is_an_error() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&[0x00, 0x10, 0xab]).await.unwrap();
        drop(client);

        let err = read_dns_message(&mut server, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_is_closed() {
        let (_client, mut server) = tokio::io::duplex(1024);
        let idle = read_dns_message(&mut server, IDLE_TIMEOUT).await.unwrap();
        assert!(idle.is_none());
    }
}
