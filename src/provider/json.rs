//! JSON "resolve" convention (`application/dns-json`).
//!
//! The query travels as URL parameters and the answer comes back as a JSON
//! document, which is turned back into a DNS message here.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, CNAME, MX, NS, PTR, SOA, SRV, TXT};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use ipnet::IpNet;
use reqwest::Url;
use reqwest::header::{ACCEPT, HeaderValue};
use serde::Deserialize;
use tracing::debug;

use super::http::DohRequest;
use crate::error::{Error, Result};

pub const CONTENT_TYPE_DNS_JSON: &str = "application/dns-json";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ResolveResponse {
    status: u16,
    #[serde(rename = "TC", default)]
    truncated: bool,
    #[serde(rename = "RA", default)]
    recursion_available: bool,
    #[serde(rename = "AD", default)]
    authentic_data: bool,
    #[serde(rename = "CD", default)]
    checking_disabled: bool,
    #[serde(default)]
    question: Vec<ResolveQuestion>,
    #[serde(default)]
    answer: Vec<ResolveRecord>,
    #[serde(default)]
    authority: Vec<ResolveRecord>,
    #[serde(default)]
    additional: Vec<ResolveRecord>,
}

#[derive(Debug, Deserialize)]
struct ResolveQuestion {
    name: String,
    #[serde(rename = "type")]
    rtype: u16,
}

#[derive(Debug, Deserialize)]
struct ResolveRecord {
    name: String,
    #[serde(rename = "type")]
    rtype: u16,
    #[serde(rename = "TTL", default)]
    ttl: u32,
    #[serde(default)]
    data: String,
}

/// Build the HTTP request for `question`.
pub fn build_request(
    endpoint: &Url,
    query: &Message,
    question: &Query,
    subnet: Option<IpNet>,
) -> DohRequest {
    let mut request = DohRequest::get(endpoint.clone());
    request
        .headers
        .insert(ACCEPT, HeaderValue::from_static(CONTENT_TYPE_DNS_JSON));
    {
        let mut pairs = request.url.query_pairs_mut();
        pairs
            .append_pair("name", &question.name().to_ascii())
            .append_pair("type", &u16::from(question.query_type()).to_string());
        if query.checking_disabled() {
            pairs.append_pair("cd", "1");
        }
        if query
            .extensions()
            .as_ref()
            .is_some_and(|edns| edns.dnssec_ok())
        {
            pairs.append_pair("do", "1");
        }
        if let Some(net) = subnet {
            pairs.append_pair("edns_client_subnet", &net.to_string());
        }
    }
    request
}

/// Decode a JSON body answering `question`.
pub fn decode_response(body: &[u8], question: &Query) -> Result<Message> {
    let response: ResolveResponse =
        serde_json::from_slice(body).map_err(|e| Error::UpstreamDecode(e.to_string()))?;

    if let Some(echoed) = response.question.first() {
        let name = parse_name(&echoed.name)?;
        if name != *question.name() || RecordType::from(echoed.rtype) != question.query_type() {
            return Err(Error::UpstreamDecode(format!(
                "answer is for {} {}, expected {} {}",
                echoed.name,
                RecordType::from(echoed.rtype),
                question.name(),
                question.query_type()
            )));
        }
    }

    let code: ResponseCode = response.status.into();
    let mut message = Message::new();
    message
        .set_message_type(MessageType::Response)
        .set_response_code(code)
        .set_truncated(response.truncated)
        .set_recursion_available(response.recursion_available)
        .set_authentic_data(response.authentic_data)
        .set_checking_disabled(response.checking_disabled)
        .add_query(question.clone());

    for record in &response.answer {
        if let Some(record) = to_record(record)? {
            message.add_answer(record);
        }
    }
    for record in &response.authority {
        if let Some(record) = to_record(record)? {
            message.add_name_server(record);
        }
    }
    for record in &response.additional {
        if let Some(record) = to_record(record)? {
            message.add_additional(record);
        }
    }
    Ok(message)
}

fn to_record(record: &ResolveRecord) -> Result<Option<Record>> {
    let rtype = RecordType::from(record.rtype);
    let Some(rdata) = parse_rdata(rtype, &record.data)? else {
        debug!("Skipping unsupported {} record for {}", rtype, record.name);
        return Ok(None);
    };
    Ok(Some(Record::from_rdata(
        parse_name(&record.name)?,
        record.ttl,
        rdata,
    )))
}

/// Rebuild record data from its presentation form. `None` for types we do
/// not reconstruct.
fn parse_rdata(rtype: RecordType, data: &str) -> Result<Option<RData>> {
    let bad = |what: &str| Error::UpstreamDecode(format!("invalid {rtype} data {data:?}: {what}"));
    let fields: Vec<&str> = data.split_whitespace().collect();

    let rdata = match rtype {
        RecordType::A => RData::A(A(Ipv4Addr::from_str(data.trim())
            .map_err(|e| bad(&e.to_string()))?)),
        RecordType::AAAA => RData::AAAA(AAAA(Ipv6Addr::from_str(data.trim())
            .map_err(|e| bad(&e.to_string()))?)),
        RecordType::CNAME => RData::CNAME(CNAME(parse_name(data.trim())?)),
        RecordType::NS => RData::NS(NS(parse_name(data.trim())?)),
        RecordType::PTR => RData::PTR(PTR(parse_name(data.trim())?)),
        RecordType::MX => match fields.as_slice() {
            [preference, exchange] => RData::MX(MX::new(
                preference.parse().map_err(|_| bad("preference"))?,
                parse_name(exchange)?,
            )),
            _ => return Err(bad("expected 2 fields")),
        },
        RecordType::SRV => match fields.as_slice() {
            [priority, weight, port, target] => RData::SRV(SRV::new(
                priority.parse().map_err(|_| bad("priority"))?,
                weight.parse().map_err(|_| bad("weight"))?,
                port.parse().map_err(|_| bad("port"))?,
                parse_name(target)?,
            )),
            _ => return Err(bad("expected 4 fields")),
        },
        RecordType::SOA => match fields.as_slice() {
            [mname, rname, serial, refresh, retry, expire, minimum] => RData::SOA(SOA::new(
                parse_name(mname)?,
                parse_name(rname)?,
                serial.parse().map_err(|_| bad("serial"))?,
                refresh.parse().map_err(|_| bad("refresh"))?,
                retry.parse().map_err(|_| bad("retry"))?,
                expire.parse().map_err(|_| bad("expire"))?,
                minimum.parse().map_err(|_| bad("minimum"))?,
            )),
            _ => return Err(bad("expected 7 fields")),
        },
        RecordType::TXT => RData::TXT(TXT::new(parse_txt(data))),
        _ => return Ok(None),
    };
    Ok(Some(rdata))
}

fn parse_name(name: &str) -> Result<Name> {
    let mut parsed = Name::from_ascii(name)
        .map_err(|e| Error::UpstreamDecode(format!("invalid name {name:?}: {e}")))?;
    parsed.set_fqdn(true);
    Ok(parsed)
}

/// Split TXT data into its character strings.
///
/// Resolvers send either a bare string or one or more quoted strings.
fn parse_txt(data: &str) -> Vec<String> {
    let data = data.trim();
    if !data.starts_with('"') {
        return vec![data.to_string()];
    }

    let mut strings = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = data.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' if quoted => {
                strings.push(std::mem::take(&mut current));
                quoted = false;
            }
            '"' => quoted = true,
            '\\' if quoted => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            c if quoted => current.push(c),
            _ => {}
        }
    }
    if quoted {
        strings.push(current);
    }
    strings
}

#[cfg(test)]
mod tests {
    use super::*;

    fn question(name: &str, rtype: RecordType) -> Query {
        Query::query(Name::from_str(name).unwrap(), rtype)
    }

    fn query_for(question: &Query) -> Message {
        let mut message = Message::new();
        message.add_query(question.clone());
        message
    }

    #[test]
    fn test_build_request() {
        let q = question("example.com.", RecordType::AAAA);
        let endpoint = Url::parse("https://dns.google/resolve").unwrap();
        let net: IpNet = "66.66.66.0/24".parse().unwrap();

        let request = build_request(&endpoint, &query_for(&q), &q, Some(net));
        let pairs: Vec<(String, String)> = request.url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("name".to_string(), "example.com.".to_string()),
                ("type".to_string(), "28".to_string()),
                ("edns_client_subnet".to_string(), "66.66.66.0/24".to_string()),
            ]
        );
        assert_eq!(request.headers[ACCEPT], CONTENT_TYPE_DNS_JSON);

        let mut flagged = query_for(&q);
        flagged.set_checking_disabled(true);
        let mut edns = hickory_proto::op::Edns::new();
        edns.set_dnssec_ok(true);
        *flagged.extensions_mut() = Some(edns);
        let request = build_request(&endpoint, &flagged, &q, None);
        let pairs: Vec<(String, String)> = request.url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("name".to_string(), "example.com.".to_string()),
                ("type".to_string(), "28".to_string()),
                ("cd".to_string(), "1".to_string()),
                ("do".to_string(), "1".to_string()),
            ]
        );
    }

    #[test]
    fn test_decode_answer() {
        let body = br#"{
            "Status": 0, "TC": false, "RD": true, "RA": true, "AD": false, "CD": false,
            "Question": [{"name": "www.example.com.", "type": 1}],
            "Answer": [
                {"name": "www.example.com.", "type": 5, "TTL": 3600, "data": "example.com."},
                {"name": "example.com.", "type": 1, "TTL": 300, "data": "93.184.216.34"}
            ],
            "Comment": "Response from 199.43.135.53."
        }"#;
        let q = question("www.example.com.", RecordType::A);
        let message = decode_response(body, &q).unwrap();

        assert_eq!(message.response_code(), ResponseCode::NoError);
        assert!(message.recursion_available());
        assert_eq!(message.queries(), &[q]);
        assert_eq!(message.answers().len(), 2);
        assert_eq!(
            message.answers()[1].data(),
            Some(&RData::A(A::new(93, 184, 216, 34)))
        );
        assert_eq!(message.answers()[0].ttl(), 3600);
    }

    #[test]
    fn test_decode_nxdomain_with_soa() {
        let body = br#"{
            "Status": 3, "RA": true,
            "Question": [{"name": "nope.example.com.", "type": 1}],
            "Authority": [{"name": "example.com.", "type": 6, "TTL": 1800,
                "data": "ns.icann.org. noc.dns.icann.org. 2024080773 7200 3600 1209600 3600"}]
        }"#;
        let q = question("nope.example.com.", RecordType::A);
        let message = decode_response(body, &q).unwrap();
        assert_eq!(message.response_code(), ResponseCode::NXDomain);
        assert!(message.answers().is_empty());
        assert_eq!(message.name_servers().len(), 1);
    }

    #[test]
    fn test_decode_mx_and_txt() {
        let body = br#"{
            "Status": 0,
            "Answer": [
                {"name": "example.com.", "type": 15, "TTL": 60, "data": "10 mail.example.com."},
                {"name": "example.com.", "type": 16, "TTL": 60, "data": "\"v=spf1 -all\" \"second\""},
                {"name": "example.com.", "type": 257, "TTL": 60, "data": "0 issue \"ca.example\""}
            ]
        }"#;
        let q = question("example.com.", RecordType::ANY);
        let message = decode_response(body, &q).unwrap();
        // The CAA record is skipped.
        assert_eq!(message.answers().len(), 2);
        match message.answers()[1].data() {
            Some(RData::TXT(txt)) => {
                let strings: Vec<&[u8]> = txt.txt_data().iter().map(|s| s.as_ref()).collect();
                assert_eq!(strings, vec![&b"v=spf1 -all"[..], &b"second"[..]]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_txt() {
        assert_eq!(parse_txt("plain text"), vec!["plain text"]);
        assert_eq!(parse_txt(r#""a" "b c""#), vec!["a", "b c"]);
        assert_eq!(parse_txt(r#""say \"hi\"""#), vec![r#"say "hi""#]);
    }

    #[test]
    fn test_decode_mismatched_question() {
        let body = br#"{"Status": 0, "Question": [{"name": "other.com.", "type": 1}]}"#;
        let q = question("example.com.", RecordType::A);
        assert!(matches!(
            decode_response(body, &q),
            Err(Error::UpstreamDecode(_))
        ));
    }

    #[test]
    fn test_decode_invalid() {
        let q = question("example.com.", RecordType::A);
        assert!(matches!(
            decode_response(b"not json", &q),
            Err(Error::UpstreamDecode(_))
        ));

        let body = br#"{"Status": 0, "Answer": [{"name": "example.com.", "type": 1, "TTL": 5, "data": "nonsense"}]}"#;
        assert!(matches!(
            decode_response(body, &q),
            Err(Error::UpstreamDecode(_))
        ));
    }
}
