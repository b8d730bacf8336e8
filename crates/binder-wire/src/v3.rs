//! RPC V3, the typed multi-value protocol (`spec.md` §4.7.3). Packets
//! are 8-byte aligned: `operation(LE16), seqno(LE16), length(LE32)`
//! then a body whose variable-length fields (verb, session, token,
//! creds, call arguments) are TLV [`Value`] parameters. IDs live in the
//! high `0xfff7..=0xffff` space so they never collide with an
//! application-assigned resource id.

use crate::coder::Coder;
use crate::decoder::Decoder;
use crate::error::{WireError, WireResult};

pub mod op {
    pub const CALL_REQUEST: u16 = 0xffff;
    pub const CALL_REPLY: u16 = 0xfffe;
    pub const EVENT_PUSH: u16 = 0xfffd;
    pub const EVENT_SUBSCRIBE: u16 = 0xfffc;
    pub const EVENT_UNSUBSCRIBE: u16 = 0xfffb;
    pub const EVENT_UNEXPECTED: u16 = 0xfffa;
    pub const EVENT_BROADCAST: u16 = 0xfff9;
    pub const RESOURCE_CREATE: u16 = 0xfff8;
    pub const RESOURCE_DESTROY: u16 = 0xfff7;
}

pub mod kind {
    pub const SESSION: u16 = 0xffff;
    pub const TOKEN: u16 = 0xfffe;
    pub const EVENT: u16 = 0xfffd;
    pub const API: u16 = 0xfffc;
    pub const VERB: u16 = 0xfffb;
    pub const TYPE: u16 = 0xfffa;
    pub const DATA: u16 = 0xfff9;
    pub const KIND: u16 = 0xfff8;
    pub const CREDS: u16 = 0xfff7;
    pub const OPERATOR: u16 = 0xfff6;
}

pub mod param {
    pub const PADDING: u16 = 0x0000;
    pub const RES_ID: u16 = 0xffff;
    pub const RES_PLAIN: u16 = 0xfffe;
    pub const VALUE: u16 = 0xfffd;
    pub const VALUE_TYPED: u16 = 0xfffc;
    pub const VALUE_DATA: u16 = 0xfffb;
    pub const TIMEOUT: u16 = 0xfffa;
}

pub mod typeid {
    pub const OPAQUE: u16 = 0xffff;
    pub const BYTEARRAY: u16 = 0xfffe;
    pub const STRINGZ: u16 = 0xfffd;
    pub const JSON: u16 = 0xfffc;
    pub const BOOL: u16 = 0xfffb;
    pub const I8: u16 = 0xfffa;
    pub const U8: u16 = 0xfff9;
    pub const I16: u16 = 0xfff8;
    pub const U16: u16 = 0xfff7;
    pub const I32: u16 = 0xfff6;
    pub const U32: u16 = 0xfff5;
    pub const I64: u16 = 0xfff4;
    pub const U64: u16 = 0xfff3;
    pub const FLOAT: u16 = 0xfff2;
    pub const DOUBLE: u16 = 0xfff1;
}

/// One TLV-carried value: a reference to an already-announced resource,
/// an inlined resource, opaque bytes, a typed byte string, or a
/// reference to an opacified data value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    ResId { kind: u16, id: u16 },
    ResPlain { kind: u16, bytes: Vec<u8> },
    Raw(Vec<u8>),
    Typed { typeid: u16, bytes: Vec<u8> },
    Data { dataid: u16 },
}

fn write_param(coder: &mut Coder, ptype: u16, body: &[u8]) -> WireResult<()> {
    coder.write_u16le(ptype)?;
    coder.write_u16le(body.len() as u16)?;
    coder.write_copy(body)?;
    Ok(())
}

fn write_value(coder: &mut Coder, value: &Value) -> WireResult<()> {
    match value {
        Value::ResId { kind, id } => {
            let mut body = Vec::with_capacity(4);
            body.extend_from_slice(&kind.to_le_bytes());
            body.extend_from_slice(&id.to_le_bytes());
            write_param(coder, param::RES_ID, &body)
        }
        Value::ResPlain { kind, bytes } => {
            let mut body = Vec::with_capacity(2 + bytes.len());
            body.extend_from_slice(&kind.to_le_bytes());
            body.extend_from_slice(bytes);
            write_param(coder, param::RES_PLAIN, &body)
        }
        Value::Raw(bytes) => write_param(coder, param::VALUE, bytes),
        Value::Typed { typeid, bytes } => {
            let mut body = Vec::with_capacity(2 + bytes.len());
            body.extend_from_slice(&typeid.to_le_bytes());
            body.extend_from_slice(bytes);
            write_param(coder, param::VALUE_TYPED, &body)
        }
        Value::Data { dataid } => write_param(coder, param::VALUE_DATA, &dataid.to_le_bytes()),
    }
}

fn write_timeout(coder: &mut Coder, seconds: u32) -> WireResult<()> {
    write_param(coder, param::TIMEOUT, &seconds.to_le_bytes())
}

/// Reads one `type(LE16), length(LE16), body` parameter; `PADDING`
/// entries are skipped transparently since they carry no value.
fn read_param(decoder: &mut Decoder<'_>) -> WireResult<Option<(u16, Vec<u8>)>> {
    loop {
        let ptype = decoder.read_u16le()?;
        let len = decoder.read_u16le()? as usize;
        let body = decoder.read_copy(len)?.to_vec();
        if ptype == param::PADDING {
            continue;
        }
        return Ok(Some((ptype, body)));
    }
}

fn read_value(decoder: &mut Decoder<'_>) -> WireResult<Value> {
    match read_param(decoder)? {
        Some((param::RES_ID, body)) if body.len() == 4 => Ok(Value::ResId {
            kind: u16::from_le_bytes(body[0..2].try_into().unwrap()),
            id: u16::from_le_bytes(body[2..4].try_into().unwrap()),
        }),
        Some((param::RES_PLAIN, body)) if body.len() >= 2 => {
            Ok(Value::ResPlain { kind: u16::from_le_bytes(body[0..2].try_into().unwrap()), bytes: body[2..].to_vec() })
        }
        Some((param::VALUE, body)) => Ok(Value::Raw(body)),
        Some((param::VALUE_TYPED, body)) if body.len() >= 2 => {
            Ok(Value::Typed { typeid: u16::from_le_bytes(body[0..2].try_into().unwrap()), bytes: body[2..].to_vec() })
        }
        Some((param::VALUE_DATA, body)) if body.len() == 2 => {
            Ok(Value::Data { dataid: u16::from_le_bytes(body[0..2].try_into().unwrap()) })
        }
        _ => Err(WireError::Malformed),
    }
}

fn read_timeout(decoder: &mut Decoder<'_>) -> WireResult<u32> {
    match read_param(decoder)? {
        Some((param::TIMEOUT, body)) if body.len() == 4 => Ok(u32::from_le_bytes(body.try_into().unwrap())),
        _ => Err(WireError::Malformed),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    pub callid: u16,
    pub verb: Value,
    pub session: Value,
    pub token: Value,
    pub creds: Value,
    pub timeout: u32,
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallReply {
    pub callid: u16,
    pub status: i32,
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventPush {
    pub eventid: u16,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventSubscription {
    pub callid: u16,
    pub eventid: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventUnexpected {
    pub eventid: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBroadcast {
    pub uuid: [u8; 16],
    pub hop: u8,
    pub event: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceCreate {
    pub kind: u16,
    pub id: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceDestroy {
    pub kind: u16,
    pub id: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    CallRequest(CallRequest),
    CallReply(CallReply),
    EventPush(EventPush),
    EventSubscribe(EventSubscription),
    EventUnsubscribe(EventSubscription),
    EventUnexpected(EventUnexpected),
    EventBroadcast(EventBroadcast),
    ResourceCreate(ResourceCreate),
    ResourceDestroy(ResourceDestroy),
}

fn body_operation(body: &Body) -> u16 {
    match body {
        Body::CallRequest(_) => op::CALL_REQUEST,
        Body::CallReply(_) => op::CALL_REPLY,
        Body::EventPush(_) => op::EVENT_PUSH,
        Body::EventSubscribe(_) => op::EVENT_SUBSCRIBE,
        Body::EventUnsubscribe(_) => op::EVENT_UNSUBSCRIBE,
        Body::EventUnexpected(_) => op::EVENT_UNEXPECTED,
        Body::EventBroadcast(_) => op::EVENT_BROADCAST,
        Body::ResourceCreate(_) => op::RESOURCE_CREATE,
        Body::ResourceDestroy(_) => op::RESOURCE_DESTROY,
    }
}

fn code_body(coder: &mut Coder, body: &Body) -> WireResult<()> {
    match body {
        Body::CallRequest(msg) => {
            coder.write_u16le(msg.callid)?;
            write_value(coder, &msg.verb)?;
            write_value(coder, &msg.session)?;
            write_value(coder, &msg.token)?;
            write_value(coder, &msg.creds)?;
            write_timeout(coder, msg.timeout)?;
            for arg in &msg.args {
                write_value(coder, arg)?;
            }
        }
        Body::CallReply(msg) => {
            coder.write_u16le(msg.callid)?;
            coder.write_u32le(msg.status as u32)?;
            for arg in &msg.args {
                write_value(coder, arg)?;
            }
        }
        Body::EventPush(msg) => {
            coder.write_u16le(msg.eventid)?;
            write_value(coder, &msg.value)?;
        }
        Body::EventSubscribe(msg) | Body::EventUnsubscribe(msg) => {
            coder.write_u16le(msg.callid)?;
            coder.write_u16le(msg.eventid)?;
        }
        Body::EventUnexpected(msg) => {
            coder.write_u16le(msg.eventid)?;
        }
        Body::EventBroadcast(msg) => {
            coder.write_copy(&msg.uuid)?;
            coder.write_u8(msg.hop)?;
            coder.write_u16le(msg.event.len() as u16)?;
            coder.write_copy(msg.event.as_bytes())?;
        }
        Body::ResourceCreate(msg) => {
            coder.write_u16le(msg.kind)?;
            coder.write_u16le(msg.id)?;
            coder.write_u32le(msg.data.len() as u32)?;
            coder.write_copy(&msg.data)?;
        }
        Body::ResourceDestroy(msg) => {
            coder.write_u16le(msg.kind)?;
            coder.write_u16le(msg.id)?;
        }
    }
    Ok(())
}

fn decode_body(operation: u16, decoder: &mut Decoder<'_>) -> WireResult<Body> {
    Ok(match operation {
        op::CALL_REQUEST => {
            let callid = decoder.read_u16le()?;
            let verb = read_value(decoder)?;
            let session = read_value(decoder)?;
            let token = read_value(decoder)?;
            let creds = read_value(decoder)?;
            let timeout = read_timeout(decoder)?;
            let mut args = Vec::new();
            while decoder.remaining_size() > 0 {
                args.push(read_value(decoder)?);
            }
            Body::CallRequest(CallRequest { callid, verb, session, token, creds, timeout, args })
        }
        op::CALL_REPLY => {
            let callid = decoder.read_u16le()?;
            let status = decoder.read_u32le()? as i32;
            let mut args = Vec::new();
            while decoder.remaining_size() > 0 {
                args.push(read_value(decoder)?);
            }
            Body::CallReply(CallReply { callid, status, args })
        }
        op::EVENT_PUSH => {
            let eventid = decoder.read_u16le()?;
            let value = read_value(decoder)?;
            Body::EventPush(EventPush { eventid, value })
        }
        op::EVENT_SUBSCRIBE | op::EVENT_UNSUBSCRIBE => {
            let callid = decoder.read_u16le()?;
            let eventid = decoder.read_u16le()?;
            let sub = EventSubscription { callid, eventid };
            if operation == op::EVENT_SUBSCRIBE {
                Body::EventSubscribe(sub)
            } else {
                Body::EventUnsubscribe(sub)
            }
        }
        op::EVENT_UNEXPECTED => Body::EventUnexpected(EventUnexpected { eventid: decoder.read_u16le()? }),
        op::EVENT_BROADCAST => {
            let uuid = decoder.read_copy(16)?.try_into().unwrap();
            let hop = decoder.read_u8()?;
            let len = decoder.read_u16le()? as usize;
            let event = String::from_utf8(decoder.read_copy(len)?.to_vec()).map_err(|_| WireError::Malformed)?;
            Body::EventBroadcast(EventBroadcast { uuid, hop, event })
        }
        op::RESOURCE_CREATE => {
            let kind = decoder.read_u16le()?;
            let id = decoder.read_u16le()?;
            let len = decoder.read_u32le()? as usize;
            let data = decoder.read_copy(len)?.to_vec();
            Body::ResourceCreate(ResourceCreate { kind, id, data })
        }
        op::RESOURCE_DESTROY => {
            let kind = decoder.read_u16le()?;
            let id = decoder.read_u16le()?;
            Body::ResourceDestroy(ResourceDestroy { kind, id })
        }
        _ => return Err(WireError::Malformed),
    })
}

/// Encodes a full packet: the 8-byte-aligned `operation/seqno/length`
/// header followed by the operation's body, then zero padding to the
/// next 8-byte boundary.
pub fn code_packet(seqno: u16, body: &Body) -> WireResult<Coder> {
    let mut payload = Coder::new();
    code_body(&mut payload, body)?;
    let mut payload_buf = vec![0u8; payload.output_len() as usize];
    payload.output_get_buffer(&mut payload_buf);

    let mut coder = Coder::new();
    coder.write_u16le(body_operation(body))?;
    coder.write_u16le(seqno)?;
    coder.write_u32le(8 + payload_buf.len() as u32)?;
    coder.write_copy(&payload_buf)?;
    coder.write_align(8)?;
    Ok(coder)
}

pub struct DecodedPacket {
    pub operation: u16,
    pub seqno: u16,
    pub body: Body,
    pub consumed: usize,
}

/// Decodes one packet from the front of `buf`. `consumed` is the
/// 8-byte-aligned total size, so callers can slice the next packet off
/// `&buf[consumed..]`.
pub fn decode_packet(buf: &[u8]) -> WireResult<DecodedPacket> {
    let mut header = Decoder::new(buf);
    let operation = header.read_u16le()?;
    let seqno = header.read_u16le()?;
    let length = header.read_u32le()?;
    if length < 8 {
        return Err(WireError::Malformed);
    }
    let body_len = (length - 8) as usize;
    let body_bytes = header.read_copy(body_len)?;
    let mut body_decoder = Decoder::new(body_bytes);
    let body = decode_body(operation, &mut body_decoder)?;
    header.read_align(8)?;
    Ok(DecodedPacket { operation, seqno, body, consumed: header.position() })
}
