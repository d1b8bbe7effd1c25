// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! OpenBridge framing: a 73-byte datagram wrapping a DMRD frame with a
//! trailing HMAC-SHA1 tag (spec section 4.4).
//!
//! OpenBridge peers only ever use timeslot 1; the 10 padding bytes between
//! the DMRD body and the MAC exist purely for wire-compatibility with the
//! reference implementation and carry no information.

use hmac::{Hmac, Mac};
use sha1::Sha1;
use subtle::ConstantTimeEq;

use super::dmrd::{Packet, DMRD_LEN};

type HmacSha1 = Hmac<Sha1>;

const PAD_LEN: usize = 10;
const MAC_LEN: usize = 10;
/// Total wire length: 53-byte DMRD body + 10 padding + 10-byte MAC.
pub const FRAME_LEN: usize = DMRD_LEN + PAD_LEN + MAC_LEN;
const SIGNED_LEN: usize = DMRD_LEN + PAD_LEN;

/// Sign a DMRD packet into a full OpenBridge datagram.
pub fn encode(packet: &Packet, password: &str) -> Vec<u8> {
    let mut body = packet.encode();
    body.truncate(DMRD_LEN);
    body.extend_from_slice(&[0u8; PAD_LEN]);

    let mut mac = HmacSha1::new_from_slice(password.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(&body);
    let tag = mac.finalize().into_bytes();

    body.extend_from_slice(&tag[..MAC_LEN]);
    body
}

/// Verify and decode an OpenBridge datagram. Returns `None` on a short
/// buffer, a bad DMRD signature, or an HMAC mismatch (spec section 4.4:
/// "a failing MAC is dropped silently, same as a malformed DMRD frame").
pub fn decode(bytes: &[u8], password: &str) -> Option<Packet> {
    if bytes.len() < FRAME_LEN {
        return None;
    }
    let (signed, tag) = bytes.split_at(SIGNED_LEN);
    let tag = &tag[..MAC_LEN];

    let mut mac = HmacSha1::new_from_slice(password.as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(signed);
    let expected = mac.finalize().into_bytes();

    if !bool::from(expected[..MAC_LEN].ct_eq(tag)) {
        return None;
    }

    Packet::decode(&signed[..DMRD_LEN])
}
