//! Version negotiation (`spec.md` §4.7.1). Symmetric: either peer may
//! open with a `VersionOffer`; whoever sees one picks the highest
//! mutually supported version and answers with a `VersionSet`.

use crate::coder::Coder;
use crate::decoder::Decoder;
use crate::error::{WireError, WireResult};

/// `afbrpc: 23.19.1.16.9 (wsapi)`, the magic identifying a V0 offer.
pub const IDENTIFIER: u32 = 0o2723012011;

const CHAR_VERSION_OFFER: u8 = b'V';
const CHAR_VERSION_SET: u8 = b'v';

pub const VERSION_UNSET: u8 = 0;
pub const VERSION_1: u8 = 1;
pub const VERSION_3: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    VersionOffer(Vec<u8>),
    VersionSet(u8),
}

pub fn code_version_offer(coder: &mut Coder, versions: &[u8]) -> WireResult<()> {
    coder.write_u8(CHAR_VERSION_OFFER)?;
    coder.write_u32le(IDENTIFIER)?;
    coder.write_u8(versions.len() as u8)?;
    coder.write_copy(versions)?;
    Ok(())
}

pub fn code_version_offer_v1_or_v3(coder: &mut Coder) -> WireResult<()> {
    code_version_offer(coder, &[VERSION_3, VERSION_1])
}

pub fn code_version_set(coder: &mut Coder, version: u8) -> WireResult<()> {
    coder.write_u8(CHAR_VERSION_SET)?;
    coder.write_u8(version)?;
    if version >= 2 {
        coder.write_u16le(4)?;
    }
    Ok(())
}

/// Peeks the leading type byte without consuming it; `None` if this
/// isn't a V0 message at all.
pub fn peek_is_v0(decoder: &Decoder<'_>) -> bool {
    matches!(decoder.peek_copy(1), Ok([CHAR_VERSION_OFFER]) | Ok([CHAR_VERSION_SET]))
}

pub fn decode(decoder: &mut Decoder<'_>) -> WireResult<Message> {
    let code = decoder.peek_copy(1)?[0];
    if code != CHAR_VERSION_OFFER && code != CHAR_VERSION_SET {
        return Err(WireError::Malformed);
    }
    decoder.skip(1)?;
    if code == CHAR_VERSION_OFFER {
        let id = decoder.read_u32le()?;
        if id != IDENTIFIER {
            return Err(WireError::Malformed);
        }
        let count = decoder.read_u8()? as usize;
        let versions = decoder.read_copy(count)?.to_vec();
        Ok(Message::VersionOffer(versions))
    } else {
        let version = decoder.read_u8()?;
        if version >= 2 {
            let chlen = decoder.read_u16le()?;
            if chlen != 4 {
                return Err(WireError::Malformed);
            }
        }
        Ok(Message::VersionSet(version))
    }
}

/// Picks the highest version both `offered` and `supported` agree on.
#[must_use]
pub fn negotiate(offered: &[u8], supported: &[u8]) -> Option<u8> {
    offered.iter().filter(|v| supported.contains(v)).copied().max()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_round_trips() {
        let mut c = Coder::new();
        code_version_offer_v1_or_v3(&mut c).unwrap();
        let mut buf = vec![0u8; c.output_len() as usize];
        c.output_get_buffer(&mut buf);
        let mut d = Decoder::new(&buf);
        assert_eq!(decode(&mut d).unwrap(), Message::VersionOffer(vec![VERSION_3, VERSION_1]));
    }

    #[test]
    fn set_round_trips_with_trailing_length_for_v3() {
        let mut c = Coder::new();
        code_version_set(&mut c, VERSION_3).unwrap();
        let mut buf = vec![0u8; c.output_len() as usize];
        c.output_get_buffer(&mut buf);
        let mut d = Decoder::new(&buf);
        assert_eq!(decode(&mut d).unwrap(), Message::VersionSet(VERSION_3));
    }

    #[test]
    fn negotiate_picks_highest_common_version() {
        assert_eq!(negotiate(&[VERSION_3, VERSION_1], &[VERSION_1]), Some(VERSION_1));
        assert_eq!(negotiate(&[VERSION_3, VERSION_1], &[VERSION_3, VERSION_1]), Some(VERSION_3));
        assert_eq!(negotiate(&[VERSION_3], &[VERSION_1]), None);
    }

    #[test]
    fn bad_identifier_is_rejected() {
        let mut c = Coder::new();
        c.write_u8(CHAR_VERSION_OFFER).unwrap();
        c.write_u32le(0xdead_beef).unwrap();
        c.write_u8(0).unwrap();
        let mut buf = vec![0u8; c.output_len() as usize];
        c.output_get_buffer(&mut buf);
        let mut d = Decoder::new(&buf);
        assert_eq!(decode(&mut d), Err(WireError::Malformed));
    }
}
