//! Framing V3 packets over a byte stream (`spec.md` §10, after
//! `afb-rpc-sock.c`'s read loop). The stub itself is transport
//! agnostic; this is the small amount of length-prefixed framing logic
//! a byte-stream transport needs that a datagram transport wouldn't.

use crate::v3;

/// Looks for one complete, 8-byte-aligned V3 packet at the front of
/// `buf`. Returns the packet's bytes (including header and padding)
/// and how many bytes of `buf` it consumed, or `None` if `buf` doesn't
/// yet hold a full packet — the caller should read more and retry.
#[must_use]
pub fn next_packet(buf: &[u8]) -> Option<(&[u8], usize)> {
    if buf.len() < 8 {
        return None;
    }
    let length = u32::from_le_bytes(buf[4..8].try_into().ok()?);
    if length < 8 {
        return None;
    }
    let body_len = (length - 8) as usize;
    let unpadded = 8 + body_len;
    let padded = (unpadded + 7) & !7;
    if buf.len() < padded {
        return None;
    }
    Some((&buf[..padded], padded))
}

/// Splits every complete packet currently available in `buf`, leaving
/// a trailing partial packet (if any) for the next read.
#[must_use]
pub fn drain_packets(buf: &[u8]) -> (Vec<&[u8]>, usize) {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while let Some((frame, consumed)) = next_packet(&buf[pos..]) {
        out.push(frame);
        pos += consumed;
    }
    (out, pos)
}

/// Convenience wrapper that also decodes each framed packet.
pub fn drain_decoded(buf: &[u8]) -> (Vec<v3::DecodedPacket>, usize) {
    let (frames, consumed) = drain_packets(buf);
    let decoded = frames.into_iter().filter_map(|f| v3::decode_packet(f).ok()).collect();
    (decoded, consumed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::v3::{code_packet, Body, EventUnexpected};

    #[test]
    fn returns_none_on_partial_header() {
        assert_eq!(next_packet(&[1, 2, 3]), None);
    }

    #[test]
    fn returns_none_when_body_is_still_arriving() {
        let coder = code_packet(1, &Body::EventUnexpected(EventUnexpected { eventid: 5 })).unwrap();
        let mut buf = vec![0u8; coder.output_len() as usize];
        coder.output_get_buffer(&mut buf);
        assert_eq!(next_packet(&buf[..buf.len() - 1]), None);
    }

    #[test]
    fn drains_two_back_to_back_packets() {
        let a = code_packet(1, &Body::EventUnexpected(EventUnexpected { eventid: 1 })).unwrap();
        let b = code_packet(2, &Body::EventUnexpected(EventUnexpected { eventid: 2 })).unwrap();
        let mut buf = vec![0u8; (a.output_len() + b.output_len()) as usize];
        let na = a.output_get_buffer(&mut buf);
        b.output_get_buffer(&mut buf[na..]);
        let (frames, consumed) = drain_packets(&buf);
        assert_eq!(frames.len(), 2);
        assert_eq!(consumed, buf.len());
    }
}
