//! DoH query translation.
//!
//! Turns a DNS query into an HTTPS request for the configured endpoint and
//! the HTTPS response back into a DNS answer for that query.

pub mod http;
mod json;
mod wire;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use hickory_proto::op::{Message, Query};
use ipnet::IpNet;
use tracing::debug;

use crate::config::{Convention, ProxyConfig};
use crate::dns;
use crate::error::{Error, Result};
use crate::subnet::SubnetResolver;

pub use http::{DohRequest, DohResponse, DohTransport, HttpsTransport};
pub use wire::decode_request;

/// Translates DNS queries into DoH exchanges.
pub struct DohProvider {
    config: Arc<ProxyConfig>,
    transport: Arc<dyn DohTransport>,
    subnet: Arc<SubnetResolver>,
}

impl DohProvider {
    pub fn new(
        config: Arc<ProxyConfig>,
        transport: Arc<dyn DohTransport>,
        subnet: Arc<SubnetResolver>,
    ) -> Self {
        Self {
            config,
            transport,
            subnet,
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn subnet_resolver(&self) -> &SubnetResolver {
        &self.subnet
    }

    /// Answer `query` through the endpoint.
    pub async fn translate(&self, query: &Message) -> Result<Message> {
        let subnet = self.subnet.current().await;
        self.translate_with_subnet(query, subnet).await
    }

    /// Answer `query`, advertising `subnet` (already resolved by the caller).
    pub async fn translate_with_subnet(
        &self,
        query: &Message,
        subnet: Option<IpNet>,
    ) -> Result<Message> {
        let question = dns::single_question(query)?;
        if self.config.no_aaaa && dns::is_aaaa(question) {
            return Ok(dns::empty_answer(query));
        }

        let request = self.build_request(query, question, subnet)?;
        let response = self.transport.send(request).await?;
        if !response.status.is_success() {
            return Err(Error::UpstreamHttp {
                status: response.status.as_u16(),
            });
        }

        let answer = match self.config.convention {
            Convention::Wire => wire::decode_response(&response.body)?,
            Convention::Json => json::decode_response(&response.body, question)?,
        };
        check_question(&answer, question)?;
        debug!(
            "{} {} answered with {} records ({})",
            question.name(),
            question.query_type(),
            answer.answers().len(),
            answer.response_code()
        );
        Ok(dns::with_query_context(answer, query))
    }

    fn build_request(
        &self,
        query: &Message,
        question: &Query,
        subnet: Option<IpNet>,
    ) -> Result<DohRequest> {
        let endpoint = &self.config.endpoint;
        let mut request = match self.config.convention {
            Convention::Wire => wire::build_request(endpoint, query, subnet, self.config.post)?,
            Convention::Json => json::build_request(endpoint, query, question, subnet),
        };

        if !self.config.params.is_empty() {
            let mut pairs = request.url.query_pairs_mut();
            for (key, value) in &self.config.params {
                pairs.append_pair(key, value);
            }
        }

        // Configured headers replace the defaults of the same name.
        for name in self.config.headers.keys() {
            request.headers.remove(name);
        }
        for (name, value) in &self.config.headers {
            request.headers.append(name.clone(), value.clone());
        }
        Ok(request)
    }
}

/// The answer must be for the question that was asked.
fn check_question(answer: &Message, question: &Query) -> Result<()> {
    match answer.queries() {
        [] => Ok(()),
        [echoed]
            if echoed.name() == question.name()
                && echoed.query_type() == question.query_type()
                && echoed.query_class() == question.query_class() =>
        {
            Ok(())
        }
        [echoed, ..] => Err(Error::UpstreamDecode(format!(
            "answer is for {} {}, expected {} {}",
            echoed.name(),
            echoed.query_type(),
            question.name(),
            question.query_type()
        ))),
    }
}
