// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! IPSC (Motorola IP Site Connect) control/voice framing (spec section 4.3).
//!
//! Frames are tagged by their first byte rather than an ASCII prefix like
//! HBRP. Authentication is HMAC-SHA1 over the frame, truncated to 10 bytes,
//! keyed by a 20-byte binary key derived by left-zero-padding the hex
//! password to 40 characters and hex-decoding it.

use hmac::{Hmac, Mac};
use sha1::Sha1;
use subtle::ConstantTimeEq;

type HmacSha1 = Hmac<Sha1>;

/// Peer list request.
pub const TAG_MASTER_REG_REQ: u8 = 0x90;
/// Peer list reply.
pub const TAG_MASTER_REG_REPLY: u8 = 0x91;
/// Peer keepalive request.
pub const TAG_PEER_ALIVE_REQ: u8 = 0x96;
/// Peer keepalive reply.
pub const TAG_PEER_ALIVE_REPLY: u8 = 0x97;
/// Master -> peer keepalive.
pub const TAG_MASTER_ALIVE_REQ: u8 = 0x92;
/// Peer -> master keepalive reply.
pub const TAG_MASTER_ALIVE_REPLY: u8 = 0x93;
/// Group voice header.
pub const TAG_GROUP_VOICE: u8 = 0x80;
/// Private voice header.
pub const TAG_PRIVATE_VOICE: u8 = 0x81;
/// Data header.
pub const TAG_DATA_HEADER: u8 = 0x83;
/// Data block.
pub const TAG_DATA_BLOCK: u8 = 0x84;

const MAC_LEN: usize = 10;

/// Derive the HMAC-SHA1 key from a hex password: left-zero-pad to 40 hex
/// characters, then hex-decode to a fixed 20-byte binary key (spec section
/// 4.3: "a per-peer 20-byte binary key derived from the hex password by
/// zero-padding left to 40 hex chars"). Returns `None` if the password is
/// not valid hex or is longer than 40 characters.
pub fn derive_key(password: &str) -> Option<Vec<u8>> {
    if password.len() > 40 || !password.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let padded = format!("{:0>40}", password);
    hex::decode(padded).ok()
}

/// Append a truncated HMAC-SHA1 tag over `frame` to the end of the frame.
/// Returns `None` if `password` does not derive a valid key.
pub fn sign(frame: &[u8], password: &str) -> Option<Vec<u8>> {
    let key = derive_key(password)?;
    let mut mac = HmacSha1::new_from_slice(&key).expect("HMAC accepts any key length");
    mac.update(frame);
    let tag = mac.finalize().into_bytes();

    let mut out = frame.to_vec();
    out.extend_from_slice(&tag[..MAC_LEN]);
    Some(out)
}

/// Verify that `frame` ends with a valid truncated HMAC-SHA1 tag, using a
/// constant-time comparison. Returns the frame with the tag stripped off on
/// success; `None` if the tag is wrong or `password` does not derive a valid
/// key.
pub fn verify<'a>(frame: &'a [u8], password: &str) -> Option<&'a [u8]> {
    if frame.len() < MAC_LEN {
        return None;
    }
    let (body, tag) = frame.split_at(frame.len() - MAC_LEN);

    let key = derive_key(password)?;
    let mut mac = HmacSha1::new_from_slice(&key).expect("HMAC accepts any key length");
    mac.update(body);
    let expected = mac.finalize().into_bytes();

    if expected[..MAC_LEN].ct_eq(tag).into() {
        Some(body)
    } else {
        None
    }
}

/// Timeslot as carried in an IPSC call-info byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Ts1,
    Ts2,
}

/// Fields extracted from an IPSC voice frame (group or private).
///
/// Byte layout (post-HMAC-verification body): `tag(1) + src(3) + dst(3) +
/// reserved(6) + stream_id(4, bytes 13-16) + call_info(1, offset 17)` (spec
/// section 4.3: "Voice packets carry a stream ID at bytes 13-16 and a
/// call-info byte at offset 17 (bit 5 = slot, bit 6 = call-end)").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceHeader {
    pub tag: u8,
    pub src: u32,
    pub dst: u32,
    pub stream_id: u32,
    pub slot: Slot,
    /// Call-end bit (call-info bit 6): the last burst of a stream.
    pub call_end: bool,
    pub call_info: u8,
}

impl VoiceHeader {
    /// Minimum frame length: call-info at offset 17 is the last fixed field.
    pub const MIN_LEN: usize = 18;

    const STREAM_ID_OFFSET: usize = 13;
    const CALL_INFO_OFFSET: usize = 17;
    const SLOT_BIT: u8 = 0x20;
    const CALL_END_BIT: u8 = 0x40;

    /// Parse a group or private voice frame (post-HMAC-verification body).
    pub fn decode(bytes: &[u8]) -> Option<VoiceHeader> {
        if bytes.len() < Self::MIN_LEN {
            return None;
        }
        let tag = bytes[0];
        if tag != TAG_GROUP_VOICE && tag != TAG_PRIVATE_VOICE {
            return None;
        }
        let src = read_u24(&bytes[1..4]);
        let dst = read_u24(&bytes[4..7]);
        let stream_id = u32::from_be_bytes([
            bytes[Self::STREAM_ID_OFFSET],
            bytes[Self::STREAM_ID_OFFSET + 1],
            bytes[Self::STREAM_ID_OFFSET + 2],
            bytes[Self::STREAM_ID_OFFSET + 3],
        ]);
        let call_info = bytes[Self::CALL_INFO_OFFSET];
        let slot = if call_info & Self::SLOT_BIT != 0 {
            Slot::Ts2
        } else {
            Slot::Ts1
        };
        let call_end = call_info & Self::CALL_END_BIT != 0;

        Some(VoiceHeader {
            tag,
            src,
            dst,
            stream_id,
            slot,
            call_end,
            call_info,
        })
    }

    pub fn is_group_call(&self) -> bool {
        self.tag == TAG_GROUP_VOICE
    }

    /// Encode a voice frame body (inverse of `decode`, minus any trailing
    /// payload bytes, which the caller appends).
    pub fn encode(tag: u8, src: u32, dst: u32, stream_id: u32, slot: Slot, call_end: bool) -> Vec<u8> {
        let mut out = vec![0u8; Self::MIN_LEN];
        out[0] = tag;
        out[1..4].copy_from_slice(&write_u24(src));
        out[4..7].copy_from_slice(&write_u24(dst));
        out[Self::STREAM_ID_OFFSET..Self::STREAM_ID_OFFSET + 4].copy_from_slice(&stream_id.to_be_bytes());
        let mut call_info = if slot == Slot::Ts2 { Self::SLOT_BIT } else { 0 };
        if call_end {
            call_info |= Self::CALL_END_BIT;
        }
        out[Self::CALL_INFO_OFFSET] = call_info;
        out
    }
}

fn write_u24(value: u32) -> [u8; 3] {
    let b = value.to_be_bytes();
    [b[1], b[2], b[3]]
}

fn read_u24(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_round_trip() {
        let frame = vec![TAG_MASTER_ALIVE_REQ, 1, 2, 3, 4];
        let signed = sign(&frame, "deadbeef").expect("valid hex password");
        assert_eq!(signed.len(), frame.len() + MAC_LEN);
        let verified = verify(&signed, "deadbeef").expect("should verify");
        assert_eq!(verified, frame.as_slice());
    }

    #[test]
    fn test_verify_rejects_wrong_password() {
        let frame = vec![TAG_MASTER_ALIVE_REQ, 1, 2, 3, 4];
        let signed = sign(&frame, "deadbeef").expect("valid hex password");
        assert!(verify(&signed, "cafebabe").is_none());
    }

    #[test]
    fn test_verify_rejects_tampered_body() {
        let frame = vec![TAG_MASTER_ALIVE_REQ, 1, 2, 3, 4];
        let mut signed = sign(&frame, "deadbeef").expect("valid hex password");
        let last = signed.len() - MAC_LEN - 1;
        signed[last] ^= 0xFF;
        assert!(verify(&signed, "deadbeef").is_none());
    }

    #[test]
    fn test_verify_rejects_short_frame() {
        assert!(verify(&[1, 2, 3], "deadbeef").is_none());
    }

    #[test]
    fn test_derive_key_left_pads_and_hex_decodes() {
        let key = derive_key("deadbeef").expect("valid hex password");
        assert_eq!(key.len(), 20);
        assert_eq!(&key[16..], &[0xde, 0xad, 0xbe, 0xef]);
        assert!(key[..16].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_derive_key_rejects_non_hex_password() {
        assert!(derive_key("not-hex!").is_none());
    }

    #[test]
    fn test_derive_key_rejects_overlong_password() {
        assert!(derive_key(&"a".repeat(41)).is_none());
    }

    #[test]
    fn test_sign_rejects_invalid_password() {
        assert!(sign(&[TAG_MASTER_ALIVE_REQ], "not-hex!").is_none());
    }

    #[test]
    fn test_voice_header_decode() {
        let body = VoiceHeader::encode(TAG_GROUP_VOICE, 28672, 3100, 0xDEAD_BEEF, Slot::Ts2, false);
        let header = VoiceHeader::decode(&body).unwrap();
        assert_eq!(header.stream_id, 0xDEAD_BEEF);
        assert_eq!(header.src, 28672);
        assert_eq!(header.dst, 3100);
        assert_eq!(header.slot, Slot::Ts2);
        assert!(header.is_group_call());
        assert!(!header.call_end);
    }

    #[test]
    fn test_voice_header_decode_call_end() {
        let body = VoiceHeader::encode(TAG_PRIVATE_VOICE, 1, 2, 3, Slot::Ts1, true);
        let header = VoiceHeader::decode(&body).unwrap();
        assert!(header.call_end);
        assert!(!header.is_group_call());
    }

    #[test]
    fn test_voice_header_rejects_unknown_tag() {
        let mut body = vec![TAG_DATA_HEADER];
        body.extend_from_slice(&[0u8; VoiceHeader::MIN_LEN - 1]);
        assert!(VoiceHeader::decode(&body).is_none());
    }
}
