//! RPC V1, the compact legacy protocol (`spec.md` §4.7.2). Strings are
//! LE32 length (including a trailing NUL) + bytes; a zero length
//! stands for absent (`nullstr`). Data values travel as JSON text —
//! the stub at the layer above translates to/from the typed model.

use crate::coder::Coder;
use crate::decoder::Decoder;
use crate::error::{WireError, WireResult};

const CHAR_CALL: u8 = b'K';
const CHAR_REPLY: u8 = b'k';
const CHAR_EVT_BROADCAST: u8 = b'B';
const CHAR_EVT_ADD: u8 = b'E';
const CHAR_EVT_REMOVE: u8 = b'e';
const CHAR_EVT_PUSH: u8 = b'P';
const CHAR_EVT_SUBSCRIBE: u8 = b'X';
const CHAR_EVT_UNSUBSCRIBE: u8 = b'x';
const CHAR_EVT_UNEXPECTED: u8 = b'U';
const CHAR_SESSION_CREATE: u8 = b'S';
const CHAR_SESSION_REMOVE: u8 = b's';
const CHAR_TOKEN_CREATE: u8 = b'T';
const CHAR_TOKEN_REMOVE: u8 = b't';
const CHAR_DESCRIBE: u8 = b'D';
const CHAR_DESCRIPTION: u8 = b'd';

fn write_string(coder: &mut Coder, value: &str) -> WireResult<()> {
    let len = value.len() as u32 + 1;
    coder.write_u32le(len)?;
    coder.write_copy(value.as_bytes())?;
    Ok(())
}

fn write_nullstring(coder: &mut Coder, value: Option<&str>) -> WireResult<()> {
    match value {
        Some(v) => write_string(coder, v),
        None => coder.write_u32le(0),
    }
}

fn write_binary(coder: &mut Coder, value: &[u8]) -> WireResult<()> {
    coder.write_u32le(value.len() as u32)?;
    coder.write_copy(value)?;
    Ok(())
}

fn read_string(decoder: &mut Decoder<'_>) -> WireResult<String> {
    let len = decoder.read_u32le()?;
    if len == 0 {
        return Err(WireError::Malformed);
    }
    let bytes = decoder.read_copy((len - 1) as usize)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| WireError::Malformed)
}

fn read_nullstring(decoder: &mut Decoder<'_>) -> WireResult<Option<String>> {
    let len = decoder.read_u32le()?;
    if len == 0 {
        return Ok(None);
    }
    let bytes = decoder.read_copy((len - 1) as usize)?;
    String::from_utf8(bytes.to_vec()).map(Some).map_err(|_| WireError::Malformed)
}

fn read_binary(decoder: &mut Decoder<'_>) -> WireResult<Vec<u8>> {
    let len = decoder.read_u32le()?;
    Ok(decoder.read_copy(len as usize)?.to_vec())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Call { callid: u16, verb: String, sessionid: u16, tokenid: u16, data: Vec<u8>, user_creds: Option<String> },
    Reply { callid: u16, error: Option<String>, info: Option<String>, data: Vec<u8> },
    Broadcast { name: String, data: Option<String>, uuid: [u8; 16], hop: u8 },
    EventCreate { eventid: u16, name: String },
    EventRemove { eventid: u16 },
    EventPush { eventid: u16, data: String },
    EventSubscribe { callid: u16, eventid: u16 },
    EventUnsubscribe { callid: u16, eventid: u16 },
    EventUnexpected { eventid: u16 },
    SessionCreate { sessionid: u16, name: Option<String> },
    SessionRemove { sessionid: u16 },
    TokenCreate { tokenid: u16, name: Option<String> },
    TokenRemove { tokenid: u16 },
    DescribeRequest { descid: u16 },
    Description { descid: u16, data: Option<String> },
}

pub fn code(coder: &mut Coder, msg: &Message) -> WireResult<()> {
    match msg {
        Message::Call { callid, verb, sessionid, tokenid, data, user_creds } => {
            coder.write_u8(CHAR_CALL)?;
            coder.write_u16le(*callid)?;
            write_string(coder, verb)?;
            coder.write_u16le(*sessionid)?;
            coder.write_u16le(*tokenid)?;
            write_binary(coder, data)?;
            write_nullstring(coder, user_creds.as_deref())?;
        }
        Message::Reply { callid, error, info, data } => {
            coder.write_u8(CHAR_REPLY)?;
            coder.write_u16le(*callid)?;
            write_nullstring(coder, error.as_deref())?;
            write_nullstring(coder, info.as_deref())?;
            write_binary(coder, data)?;
        }
        Message::Broadcast { name, data, uuid, hop } => {
            coder.write_u8(CHAR_EVT_BROADCAST)?;
            write_string(coder, name)?;
            write_nullstring(coder, data.as_deref())?;
            coder.write_copy(uuid)?;
            coder.write_u8(*hop)?;
        }
        Message::EventCreate { eventid, name } => {
            coder.write_u8(CHAR_EVT_ADD)?;
            coder.write_u16le(*eventid)?;
            write_string(coder, name)?;
        }
        Message::EventRemove { eventid } => {
            coder.write_u8(CHAR_EVT_REMOVE)?;
            coder.write_u16le(*eventid)?;
        }
        Message::EventPush { eventid, data } => {
            coder.write_u8(CHAR_EVT_PUSH)?;
            coder.write_u16le(*eventid)?;
            write_string(coder, data)?;
        }
        Message::EventSubscribe { callid, eventid } => {
            coder.write_u8(CHAR_EVT_SUBSCRIBE)?;
            coder.write_u16le(*callid)?;
            coder.write_u16le(*eventid)?;
        }
        Message::EventUnsubscribe { callid, eventid } => {
            coder.write_u8(CHAR_EVT_UNSUBSCRIBE)?;
            coder.write_u16le(*callid)?;
            coder.write_u16le(*eventid)?;
        }
        Message::EventUnexpected { eventid } => {
            coder.write_u8(CHAR_EVT_UNEXPECTED)?;
            coder.write_u16le(*eventid)?;
        }
        Message::SessionCreate { sessionid, name } => {
            coder.write_u8(CHAR_SESSION_CREATE)?;
            coder.write_u16le(*sessionid)?;
            write_nullstring(coder, name.as_deref())?;
        }
        Message::SessionRemove { sessionid } => {
            coder.write_u8(CHAR_SESSION_REMOVE)?;
            coder.write_u16le(*sessionid)?;
        }
        Message::TokenCreate { tokenid, name } => {
            coder.write_u8(CHAR_TOKEN_CREATE)?;
            coder.write_u16le(*tokenid)?;
            write_nullstring(coder, name.as_deref())?;
        }
        Message::TokenRemove { tokenid } => {
            coder.write_u8(CHAR_TOKEN_REMOVE)?;
            coder.write_u16le(*tokenid)?;
        }
        Message::DescribeRequest { descid } => {
            coder.write_u8(CHAR_DESCRIBE)?;
            coder.write_u16le(*descid)?;
        }
        Message::Description { descid, data } => {
            coder.write_u8(CHAR_DESCRIPTION)?;
            coder.write_u16le(*descid)?;
            write_nullstring(coder, data.as_deref())?;
        }
    }
    Ok(())
}

pub fn decode(decoder: &mut Decoder<'_>) -> WireResult<Message> {
    let tag = decoder.read_u8()?;
    Ok(match tag {
        CHAR_CALL => {
            let callid = decoder.read_u16le()?;
            let verb = read_string(decoder)?;
            let sessionid = decoder.read_u16le()?;
            let tokenid = decoder.read_u16le()?;
            let data = read_binary(decoder)?;
            let user_creds = read_nullstring(decoder)?;
            Message::Call { callid, verb, sessionid, tokenid, data, user_creds }
        }
        CHAR_REPLY => {
            let callid = decoder.read_u16le()?;
            let error = read_nullstring(decoder)?;
            let info = read_nullstring(decoder)?;
            let data = read_binary(decoder)?;
            Message::Reply { callid, error, info, data }
        }
        CHAR_EVT_BROADCAST => {
            let name = read_string(decoder)?;
            let data = read_nullstring(decoder)?;
            let uuid = decoder.read_copy(16)?.try_into().unwrap();
            let hop = decoder.read_u8()?;
            Message::Broadcast { name, data, uuid, hop }
        }
        CHAR_EVT_ADD => {
            let eventid = decoder.read_u16le()?;
            let name = read_string(decoder)?;
            Message::EventCreate { eventid, name }
        }
        CHAR_EVT_REMOVE => Message::EventRemove { eventid: decoder.read_u16le()? },
        CHAR_EVT_PUSH => {
            let eventid = decoder.read_u16le()?;
            let data = read_string(decoder)?;
            Message::EventPush { eventid, data }
        }
        CHAR_EVT_SUBSCRIBE => {
            let callid = decoder.read_u16le()?;
            let eventid = decoder.read_u16le()?;
            Message::EventSubscribe { callid, eventid }
        }
        CHAR_EVT_UNSUBSCRIBE => {
            let callid = decoder.read_u16le()?;
            let eventid = decoder.read_u16le()?;
            Message::EventUnsubscribe { callid, eventid }
        }
        CHAR_EVT_UNEXPECTED => Message::EventUnexpected { eventid: decoder.read_u16le()? },
        CHAR_SESSION_CREATE => {
            let sessionid = decoder.read_u16le()?;
            let name = read_nullstring(decoder)?;
            Message::SessionCreate { sessionid, name }
        }
        CHAR_SESSION_REMOVE => Message::SessionRemove { sessionid: decoder.read_u16le()? },
        CHAR_TOKEN_CREATE => {
            let tokenid = decoder.read_u16le()?;
            let name = read_nullstring(decoder)?;
            Message::TokenCreate { tokenid, name }
        }
        CHAR_TOKEN_REMOVE => Message::TokenRemove { tokenid: decoder.read_u16le()? },
        CHAR_DESCRIBE => Message::DescribeRequest { descid: decoder.read_u16le()? },
        CHAR_DESCRIPTION => {
            let descid = decoder.read_u16le()?;
            let data = read_nullstring(decoder)?;
            Message::Description { descid, data }
        }
        _ => return Err(WireError::Malformed),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: Message) {
        let mut c = Coder::new();
        code(&mut c, &msg).unwrap();
        let mut buf = vec![0u8; c.output_len() as usize];
        c.output_get_buffer(&mut buf);
        let mut d = Decoder::new(&buf);
        assert_eq!(decode(&mut d).unwrap(), msg);
    }

    #[test]
    fn call_round_trips_with_present_creds() {
        round_trip(Message::Call {
            callid: 7,
            verb: "ping".into(),
            sessionid: 1,
            tokenid: 0,
            data: b"[1,2]".to_vec(),
            user_creds: Some("uid:gid:pid:label".into()),
        });
    }

    #[test]
    fn reply_round_trips_with_absent_error() {
        round_trip(Message::Reply { callid: 7, error: None, info: None, data: b"[true]".to_vec() });
    }

    #[test]
    fn broadcast_round_trips() {
        round_trip(Message::Broadcast { name: "evt".into(), data: Some("null".into()), uuid: [3u8; 16], hop: 9 });
    }

    #[test]
    fn session_create_round_trips_without_name() {
        round_trip(Message::SessionCreate { sessionid: 4, name: None });
    }
}
