//! Decoding of the endpoint events the relay watches.
//!
//! Two ABI revisions of the send-side event are in the wild: the current one
//! packs the routing origin into a nested tuple, the previous one exposes the
//! same fields flat at the top level. The decoder resolves the revision by
//! topic and reads fields by name where the revision carries names, falling
//! back to positional access inside tuples (which carry none). This is a
//! compatibility shim, not business logic.

use error_stack::{Report, ResultExt};
use ethers::abi::{Event as AbiEvent, EventParam, LogParam, ParamType, RawLog, Token};
use ethers::types::{Log, H256};
use thiserror::Error;

use crate::message_id;
use crate::types::{EVMAddress, Hash, MessageId, Origin};

type Result<T> = error_stack::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("log topic does not match any known event revision")]
    UnknownEvent,
    #[error("log does not decode as {event}")]
    Malformed { event: &'static str },
    #[error("event field {field} is missing or has an unexpected type")]
    Field { field: &'static str },
}

/// A message leaving the source chain, in either send-side revision. The
/// payload hash is carried directly or computed from the raw payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendEvent {
    pub origin: Origin,
    pub dst_eid: u32,
    pub receiver: EVMAddress,
    pub payload_hash: Hash,
}

/// A message the destination endpoint reports as verified, still carrying
/// its routing fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedEvent {
    pub origin: Origin,
    pub receiver: EVMAddress,
    pub payload_hash: Hash,
}

/// A bare verification notice: the identifier the endpoint already computed,
/// plus whoever submitted the attestation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub message_id: MessageId,
    pub submitter: EVMAddress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationEvent {
    Verified(VerifiedEvent),
    Attested(StatusEvent),
}

fn origin_tuple() -> ParamType {
    ParamType::Tuple(vec![
        ParamType::Uint(32),
        ParamType::FixedBytes(32),
        ParamType::Uint(64),
    ])
}

/// Current send-side revision: origin as a nested tuple, raw payload bytes.
fn message_sent() -> AbiEvent {
    AbiEvent {
        name: "MessageSent".into(),
        inputs: vec![
            EventParam { name: "origin".into(), kind: origin_tuple(), indexed: false },
            EventParam { name: "dstEid".into(), kind: ParamType::Uint(32), indexed: false },
            EventParam { name: "receiver".into(), kind: ParamType::Address, indexed: false },
            EventParam { name: "payload".into(), kind: ParamType::Bytes, indexed: false },
        ],
        anonymous: false,
    }
}

/// Previous send-side revision: flat named fields, payload hash precomputed.
fn message_queued() -> AbiEvent {
    AbiEvent {
        name: "MessageQueued".into(),
        inputs: vec![
            EventParam { name: "srcEid".into(), kind: ParamType::Uint(32), indexed: false },
            EventParam { name: "sender".into(), kind: ParamType::FixedBytes(32), indexed: false },
            EventParam { name: "nonce".into(), kind: ParamType::Uint(64), indexed: false },
            EventParam { name: "dstEid".into(), kind: ParamType::Uint(32), indexed: false },
            EventParam { name: "receiver".into(), kind: ParamType::Address, indexed: false },
            EventParam { name: "payloadHash".into(), kind: ParamType::FixedBytes(32), indexed: false },
        ],
        anonymous: false,
    }
}

/// Destination-side verification event, tuple revision.
fn packet_verified() -> AbiEvent {
    AbiEvent {
        name: "PacketVerified".into(),
        inputs: vec![
            EventParam { name: "origin".into(), kind: origin_tuple(), indexed: false },
            EventParam { name: "receiver".into(), kind: ParamType::Address, indexed: false },
            EventParam { name: "payloadHash".into(), kind: ParamType::FixedBytes(32), indexed: false },
        ],
        anonymous: false,
    }
}

/// Destination-side verification event, status revision: identifier carried
/// verbatim.
fn message_verified() -> AbiEvent {
    AbiEvent {
        name: "MessageVerified".into(),
        inputs: vec![
            EventParam { name: "messageId".into(), kind: ParamType::FixedBytes(32), indexed: true },
            EventParam { name: "verifier".into(), kind: ParamType::Address, indexed: false },
        ],
        anonymous: false,
    }
}

/// Topics a verifier role filters the source endpoint for.
pub fn send_event_topics() -> Vec<H256> {
    vec![message_queued().signature(), message_sent().signature()]
}

/// Topics an executor role filters the destination endpoint for.
pub fn verified_event_topics() -> Vec<H256> {
    vec![packet_verified().signature(), message_verified().signature()]
}

pub fn decode_send_event(log: &Log) -> Result<SendEvent> {
    let topic0 = *log.topics.first().ok_or(Error::UnknownEvent)?;

    if topic0 == message_queued().signature() {
        let params = parse(log, message_queued(), "MessageQueued")?;
        Ok(SendEvent {
            origin: Origin {
                src_eid: uint32(field(&params, "srcEid", 0)?, "srcEid")?,
                sender: bytes32(field(&params, "sender", 1)?, "sender")?,
                nonce: uint64(field(&params, "nonce", 2)?, "nonce")?,
            },
            dst_eid: uint32(field(&params, "dstEid", 3)?, "dstEid")?,
            receiver: address(field(&params, "receiver", 4)?, "receiver")?,
            payload_hash: bytes32(field(&params, "payloadHash", 5)?, "payloadHash")?,
        })
    } else if topic0 == message_sent().signature() {
        let params = parse(log, message_sent(), "MessageSent")?;
        let payload = bytes(field(&params, "payload", 3)?, "payload")?;
        Ok(SendEvent {
            origin: origin_from_tuple(field(&params, "origin", 0)?)?,
            dst_eid: uint32(field(&params, "dstEid", 1)?, "dstEid")?,
            receiver: address(field(&params, "receiver", 2)?, "receiver")?,
            payload_hash: message_id::payload_hash(&payload),
        })
    } else {
        Err(Report::new(Error::UnknownEvent))
    }
}

pub fn decode_destination_event(log: &Log) -> Result<DestinationEvent> {
    let topic0 = *log.topics.first().ok_or(Error::UnknownEvent)?;

    if topic0 == packet_verified().signature() {
        let params = parse(log, packet_verified(), "PacketVerified")?;
        Ok(DestinationEvent::Verified(VerifiedEvent {
            origin: origin_from_tuple(field(&params, "origin", 0)?)?,
            receiver: address(field(&params, "receiver", 1)?, "receiver")?,
            payload_hash: bytes32(field(&params, "payloadHash", 2)?, "payloadHash")?,
        }))
    } else if topic0 == message_verified().signature() {
        let params = parse(log, message_verified(), "MessageVerified")?;
        Ok(DestinationEvent::Attested(StatusEvent {
            message_id: bytes32(field(&params, "messageId", 0)?, "messageId")?.into(),
            submitter: address(field(&params, "verifier", 1)?, "verifier")?,
        }))
    } else {
        Err(Report::new(Error::UnknownEvent))
    }
}

fn parse(log: &Log, event: AbiEvent, name: &'static str) -> Result<Vec<LogParam>> {
    event
        .parse_log(RawLog::from(log.clone()))
        .map(|parsed| parsed.params)
        .change_context(Error::Malformed { event: name })
}

/// Field lookup by name with positional fallback, so a revision that renames
/// a field but keeps the layout still decodes.
fn field<'a>(params: &'a [LogParam], name: &'static str, index: usize) -> Result<&'a Token> {
    params
        .iter()
        .find(|param| param.name == name)
        .or_else(|| params.get(index))
        .map(|param| &param.value)
        .ok_or_else(|| Report::new(Error::Field { field: name }))
}

/// Tuple components carry no names; access is positional only.
fn origin_from_tuple(token: &Token) -> Result<Origin> {
    let components = match token {
        Token::Tuple(components) if components.len() == 3 => components,
        _ => return Err(Report::new(Error::Field { field: "origin" })),
    };

    Ok(Origin {
        src_eid: uint32(&components[0], "origin.srcEid")?,
        sender: bytes32(&components[1], "origin.sender")?,
        nonce: uint64(&components[2], "origin.nonce")?,
    })
}

fn uint32(token: &Token, name: &'static str) -> Result<u32> {
    match token {
        Token::Uint(value) if *value <= u32::MAX.into() => Ok(value.low_u32()),
        _ => Err(Report::new(Error::Field { field: name })),
    }
}

fn uint64(token: &Token, name: &'static str) -> Result<u64> {
    match token {
        Token::Uint(value) if *value <= u64::MAX.into() => Ok(value.low_u64()),
        _ => Err(Report::new(Error::Field { field: name })),
    }
}

fn bytes32(token: &Token, name: &'static str) -> Result<H256> {
    match token {
        Token::FixedBytes(bytes) if bytes.len() == 32 => Ok(H256::from_slice(bytes)),
        _ => Err(Report::new(Error::Field { field: name })),
    }
}

fn address(token: &Token, name: &'static str) -> Result<EVMAddress> {
    match token {
        Token::Address(value) => Ok(*value),
        _ => Err(Report::new(Error::Field { field: name })),
    }
}

fn bytes(token: &Token, name: &'static str) -> Result<Vec<u8>> {
    match token {
        Token::Bytes(value) => Ok(value.clone()),
        _ => Err(Report::new(Error::Field { field: name })),
    }
}
