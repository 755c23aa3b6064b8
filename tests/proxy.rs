//! End-to-end tests: real UDP and TCP listeners in front of a local DoH stub.

use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use reqwest::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::oneshot;

use doh_proxy::provider::decode_request;
use doh_proxy::subnet::SubnetMode;
use doh_proxy::{DohRequest, DohResponse, DohTransport, Proxy, ProxyConfig};

/// Answers every A question with 93.184.216.34, TTL 300.
#[derive(Default)]
struct ExampleUpstream {
    calls: AtomicUsize,
}

#[async_trait]
impl DohTransport for ExampleUpstream {
    async fn send(&self, request: DohRequest) -> doh_proxy::Result<DohResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let query = decode_request(&request)?;
        let question = query.queries()[0].clone();

        let mut answer = Message::new();
        answer
            .set_id(query.id())
            .set_message_type(MessageType::Response)
            .set_recursion_desired(true)
            .set_recursion_available(true)
            .add_query(question.clone());
        if question.query_type() == RecordType::A {
            answer.add_answer(Record::from_rdata(
                question.name().clone(),
                300,
                RData::A(A(Ipv4Addr::new(93, 184, 216, 34))),
            ));
        }

        Ok(DohResponse {
            status: StatusCode::OK,
            body: answer.to_vec().unwrap(),
        })
    }
}

fn query(id: u16, name: &str, rtype: RecordType) -> Vec<u8> {
    let mut message = Message::new();
    message
        .set_id(id)
        .set_recursion_desired(true)
        .add_query(Query::query(Name::from_str(name).unwrap(), rtype));
    message.to_vec().unwrap()
}

struct Running {
    udp: SocketAddr,
    tcp: SocketAddr,
    upstream: Arc<ExampleUpstream>,
    stop: oneshot::Sender<()>,
    server: tokio::task::JoinHandle<doh_proxy::Result<()>>,
}

async fn start(config: ProxyConfig) -> Running {
    let upstream = Arc::new(ExampleUpstream::default());
    let proxy = Proxy::with_transport(config, upstream.clone()).unwrap();
    let bound = proxy.bind().await.unwrap();
    let udp = bound.udp_addr().unwrap();
    let tcp = bound.tcp_addr().unwrap();

    let (stop, stopped) = oneshot::channel::<()>();
    let server = tokio::spawn(bound.serve(async move {
        let _ = stopped.await;
    }));

    Running {
        udp,
        tcp,
        upstream,
        stop,
        server,
    }
}

fn local_config() -> ProxyConfig {
    ProxyConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        subnet: SubnetMode::Disabled,
        stats_interval: None,
        ..ProxyConfig::default()
    }
}

async fn ask_udp(server: SocketAddr, query: &[u8]) -> Message {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(query, server).await.unwrap();
    let mut buf = [0u8; 4096];
    let (len, _) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    Message::from_vec(&buf[..len]).unwrap()
}

async fn ask_tcp(stream: &mut TcpStream, query: &[u8]) -> Message {
    stream
        .write_all(&(query.len() as u16).to_be_bytes())
        .await
        .unwrap();
    stream.write_all(query).await.unwrap();

    let mut prefix = [0u8; 2];
    stream.read_exact(&mut prefix).await.unwrap();
    let mut reply = vec![0u8; u16::from_be_bytes(prefix) as usize];
    stream.read_exact(&mut reply).await.unwrap();
    Message::from_vec(&reply).unwrap()
}

#[tokio::test]
async fn test_udp_and_tcp_share_the_cache() {
    let running = start(local_config()).await;

    let reply = ask_udp(running.udp, &query(0x1111, "example.com.", RecordType::A)).await;
    assert_eq!(reply.id(), 0x1111);
    assert_eq!(reply.response_code(), ResponseCode::NoError);
    assert_eq!(
        reply.answers()[0].data(),
        Some(&RData::A(A::new(93, 184, 216, 34)))
    );
    assert_eq!(reply.answers()[0].ttl(), 300);

    let mut stream = TcpStream::connect(running.tcp).await.unwrap();
    let reply = ask_tcp(&mut stream, &query(0x2222, "example.com.", RecordType::A)).await;
    assert_eq!(reply.id(), 0x2222);
    assert_eq!(reply.answers().len(), 1);

    // Second query on the same connection.
    let reply = ask_tcp(&mut stream, &query(0x3333, "example.org.", RecordType::A)).await;
    assert_eq!(reply.id(), 0x3333);
    assert_eq!(reply.queries()[0].name().to_ascii(), "example.org.");

    assert_eq!(running.upstream.calls.load(Ordering::SeqCst), 2);

    running.stop.send(()).unwrap();
    running.server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_no_ipv6_over_udp() {
    let config = ProxyConfig {
        no_aaaa: true,
        ..local_config()
    };
    let running = start(config).await;

    let reply = ask_udp(running.udp, &query(0x4444, "example.com.", RecordType::AAAA)).await;
    assert_eq!(reply.id(), 0x4444);
    assert_eq!(reply.response_code(), ResponseCode::NoError);
    assert!(reply.answers().is_empty());
    assert_eq!(running.upstream.calls.load(Ordering::SeqCst), 0);

    running.stop.send(()).unwrap();
    running.server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_garbage_gets_formerr() {
    let running = start(local_config()).await;

    let mut garbage = vec![0xbe, 0xef];
    garbage.extend_from_slice(&[0xff; 14]);
    let reply = ask_udp(running.udp, &garbage).await;
    assert_eq!(reply.id(), 0xbeef);
    assert_eq!(reply.response_code(), ResponseCode::FormErr);

    running.stop.send(()).unwrap();
    running.server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_all_transports_disabled_is_an_error() {
    let config = ProxyConfig {
        tcp: false,
        udp: false,
        ..local_config()
    };
    let proxy = Proxy::with_transport(config, Arc::new(ExampleUpstream::default())).unwrap();
    assert!(matches!(
        proxy.bind().await,
        Err(doh_proxy::Error::Listen(_))
    ));
}
