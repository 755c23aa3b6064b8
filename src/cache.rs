//! DNS answer cache with TTL-based expiration and in-flight de-duplication.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use hickory_proto::op::{Message, Query, ResponseCode};
use ipnet::IpNet;
use rustc_hash::FxBuildHasher;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::dns::min_answer_ttl;
use crate::error::{Error, Result};

/// Normalized cache key: question, the subnet that was advertised and the
/// DNSSEC flags the upstream saw.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    name: String,
    qtype: u16,
    qclass: u16,
    subnet: Option<IpNet>,
    dnssec_ok: bool,
    checking_disabled: bool,
}

impl Fingerprint {
    pub fn new(question: &Query, subnet: Option<IpNet>) -> Self {
        let mut name = question.name().to_lowercase();
        name.set_fqdn(true);
        Self {
            name: name.to_ascii(),
            qtype: u16::from(question.query_type()),
            qclass: u16::from(question.query_class()),
            subnet,
            dnssec_ok: false,
            checking_disabled: false,
        }
    }

    /// Key for `question` of `query`, including its DO and CD bits.
    pub fn for_query(query: &Message, question: &Query, subnet: Option<IpNet>) -> Self {
        Self {
            dnssec_ok: query
                .extensions()
                .as_ref()
                .is_some_and(|edns| edns.dnssec_ok()),
            checking_disabled: query.checking_disabled(),
            ..Self::new(question, subnet)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

struct CacheEntry {
    answer: Message,
    inserted_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.inserted_at + self.ttl
    }
}

/// How an answer was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Served from the cache.
    Hit,
    /// This caller's fetch went upstream.
    Fetched,
    /// Waited on a fetch another caller started.
    Joined,
}

type Flight = Shared<BoxFuture<'static, Result<Message>>>;
type Entries = DashMap<Fingerprint, CacheEntry, FxBuildHasher>;
type Flights = DashMap<Fingerprint, Flight, FxBuildHasher>;

/// TTL-based answer cache.
///
/// Both maps are sharded, so unrelated fingerprints never contend on one
/// lock. Expired entries are dropped when they are next looked up.
pub struct ResponseCache {
    enabled: bool,
    fetch_timeout: Duration,
    entries: Arc<Entries>,
    inflight: Arc<Flights>,
}

impl ResponseCache {
    /// `fetch_timeout` bounds every upstream fetch, and so every waiter.
    pub fn new(enabled: bool, fetch_timeout: Duration) -> Self {
        Self {
            enabled,
            fetch_timeout,
            entries: Arc::new(DashMap::with_hasher(FxBuildHasher)),
            inflight: Arc::new(DashMap::with_hasher(FxBuildHasher)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Look up a non-expired answer.
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<Message> {
        if !self.enabled {
            return None;
        }
        lookup(&self.entries, fingerprint)
    }

    /// Return the cached answer, or join or start the upstream fetch.
    ///
    /// `fetch` runs in its own task, so it completes and populates the
    /// cache even when every caller has gone away.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        fingerprint: Fingerprint,
        fetch: F,
    ) -> Result<(Message, Outcome)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Message>> + Send + 'static,
    {
        if !self.enabled {
            let answer = bounded(self.fetch_timeout, fetch()).await?;
            return Ok((answer, Outcome::Fetched));
        }

        if let Some(answer) = lookup(&self.entries, &fingerprint) {
            return Ok((answer, Outcome::Hit));
        }

        let (flight, outcome) = match self.inflight.entry(fingerprint.clone()) {
            Entry::Occupied(entry) => (entry.get().clone(), Outcome::Joined),
            Entry::Vacant(entry) => {
                // A fetch may have completed between the lookup and here.
                if let Some(answer) = lookup(&self.entries, &fingerprint) {
                    return Ok((answer, Outcome::Hit));
                }
                let flight = self.spawn_fetch(fingerprint, fetch());
                entry.insert(flight.clone());
                (flight, Outcome::Fetched)
            }
        };

        let answer = flight.await?;
        Ok((answer, outcome))
    }

    fn spawn_fetch<Fut>(&self, fingerprint: Fingerprint, fetch: Fut) -> Flight
    where
        Fut: Future<Output = Result<Message>> + Send + 'static,
    {
        let entries = self.entries.clone();
        let inflight = self.inflight.clone();
        let timeout = self.fetch_timeout;

        let task = tokio::spawn(async move {
            let result = bounded(timeout, fetch).await;
            if let Ok(answer) = &result {
                store(&entries, &fingerprint, answer);
            }
            // Stored before the marker goes away, so no second fetch can
            // start in between.
            inflight.remove(&fingerprint);
            result
        });

        async move {
            task.await
                .unwrap_or_else(|e| Err(Error::Upstream(format!("fetch task failed: {e}"))))
        }
        .boxed()
        .shared()
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of fetches currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inflight.len()
    }
}

fn lookup(entries: &Entries, fingerprint: &Fingerprint) -> Option<Message> {
    let now = Instant::now();
    match entries.get(fingerprint) {
        Some(entry) if !entry.is_expired(now) => return Some(entry.answer.clone()),
        Some(_) => {}
        None => return None,
    }
    if entries
        .remove_if(fingerprint, |_, entry| entry.is_expired(now))
        .is_some()
    {
        trace!("Expired cache entry for {}", fingerprint.name());
    }
    None
}

/// Store `answer` if it is cacheable.
fn store(entries: &Entries, fingerprint: &Fingerprint, answer: &Message) {
    let Some(ttl) = cache_ttl(answer) else {
        return;
    };
    debug!("Caching {} for {}s", fingerprint.name(), ttl.as_secs());
    entries.insert(
        fingerprint.clone(),
        CacheEntry {
            answer: answer.clone(),
            inserted_at: Instant::now(),
            ttl,
        },
    );
}

/// Effective TTL of an answer, `None` when it must not be cached.
pub fn cache_ttl(answer: &Message) -> Option<Duration> {
    if answer.response_code() != ResponseCode::NoError {
        return None;
    }
    match min_answer_ttl(answer)? {
        0 => None,
        ttl => Some(Duration::from_secs(u64::from(ttl))),
    }
}

async fn bounded<Fut>(timeout: Duration, fetch: Fut) -> Result<Message>
where
    Fut: Future<Output = Result<Message>>,
{
    tokio::time::timeout(timeout, fetch)
        .await
        .unwrap_or(Err(Error::Timeout))
}
