//! Stub transport for tests.

use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use parking_lot::Mutex;
use reqwest::StatusCode;

use super::http::{DohRequest, DohResponse, DohTransport};
use super::wire::decode_request;
use crate::error::{Error, Result};

type Reply = Box<dyn Fn(&DohRequest) -> Result<DohResponse> + Send + Sync>;

/// Counts calls and answers with a canned reply, optionally after a delay.
pub(crate) struct StubTransport {
    calls: AtomicUsize,
    delay: Duration,
    reply: Reply,
    last: Mutex<Option<DohRequest>>,
}

impl StubTransport {
    fn new(reply: Reply) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
            reply,
            last: Mutex::new(None),
        }
    }

    /// Answer every wire query with one A record.
    pub(crate) fn answering(ip: [u8; 4], ttl: u32) -> Self {
        Self::new(Box::new(move |request| {
            let query = decode_request(request)?;
            let body = wire_answer(&query, ip, ttl)
                .to_vec()
                .map_err(|e| Error::UpstreamDecode(e.to_string()))?;
            Ok(DohResponse {
                status: StatusCode::OK,
                body,
            })
        }))
    }

    pub(crate) fn status(status: StatusCode) -> Self {
        Self::new(Box::new(move |_| {
            Ok(DohResponse {
                status,
                body: Vec::new(),
            })
        }))
    }

    pub(crate) fn body(body: Vec<u8>) -> Self {
        Self::new(Box::new(move |_| {
            Ok(DohResponse {
                status: StatusCode::OK,
                body: body.clone(),
            })
        }))
    }

    pub(crate) fn failing(error: Error) -> Self {
        Self::new(Box::new(move |_| Err(error.clone())))
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn last_request(&self) -> Option<DohRequest> {
        self.last.lock().clone()
    }
}

#[async_trait]
impl DohTransport for StubTransport {
    async fn send(&self, request: DohRequest) -> Result<DohResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last.lock() = Some(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.reply)(&request)
    }
}

pub(crate) fn query(id: u16, name: &str, rtype: RecordType) -> Message {
    let mut message = Message::new();
    message
        .set_id(id)
        .set_recursion_desired(true)
        .add_query(Query::query(Name::from_str(name).unwrap(), rtype));
    message
}

/// Upstream-style answer to `query` with a single A record.
pub(crate) fn wire_answer(query: &Message, ip: [u8; 4], ttl: u32) -> Message {
    let question = query.queries()[0].clone();
    let mut answer = Message::new();
    answer
        .set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_recursion_desired(true)
        .set_recursion_available(true)
        .set_response_code(ResponseCode::NoError)
        .add_query(question.clone())
        .add_answer(Record::from_rdata(
            question.name().clone(),
            ttl,
            RData::A(A(Ipv4Addr::from(ip))),
        ));
    answer
}
