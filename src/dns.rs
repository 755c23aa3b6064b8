//! DNS message helpers shared by the handler and the translator.

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::RecordType;

use crate::error::{Error, Result};

/// Payload size assumed for UDP clients that do not advertise one.
pub const MIN_UDP_PAYLOAD: usize = 512;

/// Return the single question of a query.
pub fn single_question(query: &Message) -> Result<&Query> {
    match query.queries() {
        [question] => Ok(question),
        [] => Err(Error::UnsupportedQuery("query has no question".into())),
        questions => Err(Error::UnsupportedQuery(format!(
            "query has {} questions",
            questions.len()
        ))),
    }
}

/// Start a reply to `query`: same id, opcode, RD flag and question.
pub fn reply_to(query: &Message, code: ResponseCode) -> Message {
    let mut reply = Message::new();
    reply
        .set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_op_code(query.op_code())
        .set_recursion_desired(query.recursion_desired())
        .set_recursion_available(true)
        .set_response_code(code);
    for question in query.queries() {
        reply.add_query(question.clone());
    }
    reply
}

/// Empty NOERROR answer, used for policy overrides.
pub fn empty_answer(query: &Message) -> Message {
    reply_to(query, ResponseCode::NoError)
}

/// SERVFAIL answer carrying the incoming transaction context.
pub fn servfail(query: &Message) -> Message {
    reply_to(query, ResponseCode::ServFail)
}

/// FORMERR for bytes that could not be parsed, if they carry an id.
pub fn formerr(raw: &[u8]) -> Option<Vec<u8>> {
    if raw.len() < 2 {
        return None;
    }
    let id = u16::from_be_bytes([raw[0], raw[1]]);
    Message::error_msg(id, OpCode::Query, ResponseCode::FormErr)
        .to_vec()
        .ok()
}

/// Rewrite an answer so it belongs to `query`: its id, its question (with
/// the client's casing) and its RD flag. EDNS is dropped when the client did
/// not send any.
pub fn with_query_context(mut answer: Message, query: &Message) -> Message {
    answer
        .set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_recursion_desired(query.recursion_desired());
    answer.take_queries();
    for question in query.queries() {
        answer.add_query(question.clone());
    }
    if query.extensions().is_none() {
        *answer.extensions_mut() = None;
    }
    answer
}

/// Minimum TTL across the answer section, `None` when there are no answers.
pub fn min_answer_ttl(answer: &Message) -> Option<u32> {
    answer.answers().iter().map(|record| record.ttl()).min()
}

/// Whether the question asks for IPv6 addresses.
pub fn is_aaaa(question: &Query) -> bool {
    question.query_type() == RecordType::AAAA
}

/// Payload size the client accepts over UDP.
pub fn udp_payload_limit(query: &Message) -> usize {
    query
        .extensions()
        .as_ref()
        .map(|edns| usize::from(edns.max_payload()))
        .unwrap_or(MIN_UDP_PAYLOAD)
        .max(MIN_UDP_PAYLOAD)
}

/// Encode `answer` for UDP, truncating to header and question with TC set
/// when it does not fit in `limit` bytes.
pub fn encode_for_udp(answer: &Message, limit: usize) -> Result<Vec<u8>> {
    let bytes = encode(answer)?;
    if bytes.len() <= limit {
        return Ok(bytes);
    }
    let mut truncated = Message::new();
    truncated
        .set_id(answer.id())
        .set_message_type(MessageType::Response)
        .set_op_code(answer.op_code())
        .set_recursion_desired(answer.recursion_desired())
        .set_recursion_available(answer.recursion_available())
        .set_response_code(answer.response_code())
        .set_truncated(true);
    for question in answer.queries() {
        truncated.add_query(question.clone());
    }
    encode(&truncated)
}

/// Encode a message to wire format.
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    message
        .to_vec()
        .map_err(|e| Error::UpstreamDecode(format!("cannot encode answer: {e}")))
}
