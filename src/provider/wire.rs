//! RFC 8484 wire-format convention.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hickory_proto::op::{Edns, Message};
use hickory_proto::rr::rdata::opt::{ClientSubnet, EdnsCode, EdnsOption};
use ipnet::IpNet;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderValue};
use reqwest::{Method, Url};

use super::http::DohRequest;
use crate::error::{Error, Result};

pub const CONTENT_TYPE_DNS_MESSAGE: &str = "application/dns-message";

/// Payload size advertised when we add an OPT record ourselves.
const EDNS_PAYLOAD: u16 = 1232;

/// Build the HTTP request for `query`.
///
/// The id is zeroed so identical questions produce identical URLs.
pub fn build_request(
    endpoint: &Url,
    query: &Message,
    subnet: Option<IpNet>,
    post: bool,
) -> Result<DohRequest> {
    let mut outgoing = query.clone();
    outgoing.set_id(0);
    // The client's own subnet option is never forwarded.
    if let Some(edns) = outgoing.extensions_mut() {
        edns.options_mut().remove(EdnsCode::Subnet);
    }
    if let Some(net) = subnet {
        attach_subnet(&mut outgoing, net);
    }
    let bytes = outgoing
        .to_vec()
        .map_err(|e| Error::UnsupportedQuery(format!("cannot encode query: {e}")))?;

    let mut request = DohRequest::get(endpoint.clone());
    request
        .headers
        .insert(ACCEPT, HeaderValue::from_static(CONTENT_TYPE_DNS_MESSAGE));

    if post {
        request.method = Method::POST;
        request
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_DNS_MESSAGE));
        request.body = Some(bytes);
    } else {
        request
            .url
            .query_pairs_mut()
            .append_pair("dns", &URL_SAFE_NO_PAD.encode(bytes));
    }
    Ok(request)
}

/// Add (or replace) the client-subnet option.
pub fn attach_subnet(message: &mut Message, net: IpNet) {
    let edns = message.extensions_mut().get_or_insert_with(|| {
        let mut edns = Edns::new();
        edns.set_max_payload(EDNS_PAYLOAD);
        edns.set_version(0);
        edns
    });
    edns.options_mut().insert(EdnsOption::Subnet(ClientSubnet::new(
        net.addr(),
        net.prefix_len(),
        0,
    )));
}

/// Decode a wire-format body.
pub fn decode_response(body: &[u8]) -> Result<Message> {
    Message::from_vec(body).map_err(|e| Error::UpstreamDecode(e.to_string()))
}

/// Query carried by a request, for inspecting what was sent.
pub fn decode_request(request: &DohRequest) -> Result<Message> {
    let bytes = match &request.body {
        Some(body) => body.clone(),
        None => {
            let encoded = request
                .url
                .query_pairs()
                .find(|(key, _)| key == "dns")
                .map(|(_, value)| value.into_owned())
                .ok_or_else(|| Error::UnsupportedQuery("request has no dns parameter".into()))?;
            URL_SAFE_NO_PAD
                .decode(encoded)
                .map_err(|e| Error::UnsupportedQuery(format!("invalid dns parameter: {e}")))?
        }
    };
    Message::from_vec(&bytes).map_err(|e| Error::UnsupportedQuery(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::Query;
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;

    fn endpoint() -> Url {
        Url::parse("https://dns.google/dns-query").unwrap()
    }

    fn query() -> Message {
        let mut message = Message::new();
        message
            .set_id(0x4242)
            .set_recursion_desired(true)
            .add_query(Query::query(
                Name::from_str("example.com.").unwrap(),
                RecordType::A,
            ));
        message
    }

    #[test]
    fn test_get_request() {
        let request = build_request(&endpoint(), &query(), None, false).unwrap();
        assert_eq!(request.method, Method::GET);
        assert!(request.body.is_none());
        assert_eq!(request.headers[ACCEPT], CONTENT_TYPE_DNS_MESSAGE);

        let value = request
            .url
            .query_pairs()
            .find(|(key, _)| key == "dns")
            .unwrap()
            .1
            .into_owned();
        assert!(!value.contains('='));

        let sent = decode_request(&request).unwrap();
        assert_eq!(sent.id(), 0);
        assert_eq!(sent.queries(), query().queries());
        assert!(sent.extensions().is_none());
    }

    #[test]
    fn test_post_request() {
        let request = build_request(&endpoint(), &query(), None, true).unwrap();
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.headers[CONTENT_TYPE], CONTENT_TYPE_DNS_MESSAGE);
        assert_eq!(request.url.query(), None);
        assert_eq!(decode_request(&request).unwrap().queries(), query().queries());
    }

    #[test]
    fn test_subnet_is_attached() {
        let net: IpNet = "66.66.66.0/24".parse().unwrap();
        let request = build_request(&endpoint(), &query(), Some(net), false).unwrap();
        let sent = decode_request(&request).unwrap();
        let edns = sent.extensions().as_ref().unwrap();
        assert!(matches!(
            edns.option(EdnsCode::Subnet),
            Some(EdnsOption::Subnet(_))
        ));
    }

    #[test]
    fn test_client_subnet_is_not_forwarded() {
        let mut client = query();
        let mut edns = Edns::new();
        edns.set_max_payload(1232);
        edns.options_mut().insert(EdnsOption::Subnet(ClientSubnet::new(
            "1.2.3.0".parse().unwrap(),
            24,
            0,
        )));
        *client.extensions_mut() = Some(edns);

        let request = build_request(&endpoint(), &client, None, false).unwrap();
        let sent = decode_request(&request).unwrap();
        let edns = sent.extensions().as_ref().unwrap();
        assert!(edns.option(EdnsCode::Subnet).is_none());
        assert_eq!(edns.max_payload(), 1232);

        let net: IpNet = "66.66.66.0/24".parse().unwrap();
        let request = build_request(&endpoint(), &client, Some(net), false).unwrap();
        let sent = decode_request(&request).unwrap();
        match sent.extensions().as_ref().unwrap().option(EdnsCode::Subnet) {
            Some(EdnsOption::Subnet(subnet)) => {
                assert_eq!(*subnet, ClientSubnet::new(net.addr(), net.prefix_len(), 0))
            }
            other => panic!("unexpected subnet option {other:?}"),
        }
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(
            decode_response(b"<html>oops</html>"),
            Err(Error::UpstreamDecode(_))
        ));
    }
}
