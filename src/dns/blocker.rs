//! Synthesized answers for blocked names.

use std::net::Ipv4Addr;

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record};

/// Address returned for blocked names.
pub const BLOCK_ADDRESS: Ipv4Addr = Ipv4Addr::UNSPECIFIED;

/// Build the null answer for a blocked query.
///
/// The response echoes the transaction id and question, is flagged
/// authoritative with recursion available, and carries a single
/// `A 0.0.0.0` record with a TTL of zero whatever the question type.
pub fn blocked_response(query: &Message) -> Message {
    let mut response = Message::new();
    response
        .set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_op_code(query.op_code())
        .set_authoritative(true)
        .set_recursion_available(true)
        .set_response_code(ResponseCode::NoError);

    for q in query.queries() {
        response.add_query(q.clone());
    }

    if let Some(question) = query.queries().first() {
        response.add_answer(Record::from_rdata(
            question.name().clone(),
            0,
            RData::A(A(BLOCK_ADDRESS)),
        ));
    }

    response
}
