//! Per-query pipeline shared by every transport.
//!
//! A received message is parsed, checked against the local policy, looked up
//! in the cache and, on a miss, translated into a DoH exchange. The transport
//! always gets a well-formed reply back, except for input too short to carry
//! a transaction id.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_proto::op::Message;
use tracing::debug;

use crate::cache::{Fingerprint, ResponseCache};
use crate::dns;
use crate::provider::DohProvider;
use crate::stats::{Resolution, Stats};
use crate::transport::Protocol;

pub struct QueryHandler {
    provider: Arc<DohProvider>,
    cache: ResponseCache,
    stats: Arc<Stats>,
    query_timeout: Duration,
}

impl QueryHandler {
    pub fn new(provider: Arc<DohProvider>, cache: ResponseCache, stats: Arc<Stats>) -> Self {
        let query_timeout = provider.config().query_timeout;
        Self {
            provider,
            cache,
            stats,
            query_timeout,
        }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn provider(&self) -> &DohProvider {
        &self.provider
    }

    /// Answer one raw DNS message received over `protocol`.
    pub async fn handle(&self, bytes: &[u8], protocol: Protocol) -> Option<Vec<u8>> {
        let start = Instant::now();

        let query = match Message::from_vec(bytes) {
            Ok(query) => query,
            Err(e) => {
                debug!("[{}] Malformed query ({} bytes): {}", protocol, bytes.len(), e);
                self.stats.record(Resolution::Failed, start.elapsed());
                return dns::formerr(bytes);
            }
        };

        let (answer, resolution) = self.handle_message(&query).await;

        let encoded = match protocol {
            Protocol::Udp => dns::encode_for_udp(&answer, dns::udp_payload_limit(&query)),
            Protocol::Tcp => dns::encode_for_udp(&answer, usize::from(u16::MAX)),
        };
        let reply = match encoded {
            Ok(reply) => Some(reply),
            Err(e) => {
                debug!("[{}] {}", protocol, e);
                dns::encode(&dns::servfail(&query)).ok()
            }
        };

        let elapsed = start.elapsed();
        self.stats.record(resolution, elapsed);
        if let Some(question) = query.queries().first() {
            debug!(
                "[{}] {} {} {} total={:.3}ms",
                protocol,
                question.name(),
                question.query_type(),
                resolution.as_str(),
                elapsed.as_secs_f64() * 1000.0
            );
        }
        reply
    }

    /// Answer a parsed query. Failures become SERVFAIL replies.
    pub async fn handle_message(&self, query: &Message) -> (Message, Resolution) {
        let question = match dns::single_question(query) {
            Ok(question) => question.clone(),
            Err(e) => {
                debug!("Rejecting query {}: {}", query.id(), e);
                return (dns::servfail(query), Resolution::Failed);
            }
        };

        if self.provider.config().no_aaaa && dns::is_aaaa(&question) {
            return (dns::empty_answer(query), Resolution::Synthesized);
        }

        let subnet = self.provider.subnet_resolver().current().await;
        let fingerprint = Fingerprint::for_query(query, &question, subnet);

        let provider = self.provider.clone();
        let upstream_query = query.clone();
        let fetch = move || async move {
            provider
                .translate_with_subnet(&upstream_query, subnet)
                .await
        };

        match tokio::time::timeout(self.query_timeout, self.cache.get_or_fetch(fingerprint, fetch))
            .await
        {
            Ok(Ok((answer, outcome))) => (dns::with_query_context(answer, query), outcome.into()),
            Ok(Err(e)) => {
                debug!("{} {} failed: {}", question.name(), question.query_type(), e);
                (dns::servfail(query), Resolution::Failed)
            }
            Err(_) => {
                debug!(
                    "{} {} exceeded the {}s query deadline",
                    question.name(),
                    question.query_type(),
                    self.query_timeout.as_secs()
                );
                (dns::servfail(query), Resolution::Failed)
            }
        }
    }
}
