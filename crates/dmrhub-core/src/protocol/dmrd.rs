// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The 53-byte DMRD frame shared by HBRP and OpenBridge (spec section 3, 4.1).
//!
//! Byte 15 packs timeslot, call type, frame type and DType/VSeq into a single
//! byte. Implemented with explicit shifts and masks per spec section 9 --
//! no bit-fields, since the GroupCall bit's inverted polarity is the classic
//! source of bugs here.

/// Canonical DMRD signature (spec section 3).
pub const DMRD_SIGNATURE: [u8; 4] = *b"DMRD";

/// Minimum DMRD frame length (without trailing BER/RSSI).
pub const DMRD_LEN: usize = 53;

/// DMRD frame length with trailing BER/RSSI appended.
pub const DMRD_LEN_WITH_TRAILER: usize = DMRD_LEN + 3;

/// Timeslot carried in byte 15 bit 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Ts1,
    Ts2,
}

impl Slot {
    pub fn other(self) -> Slot {
        match self {
            Slot::Ts1 => Slot::Ts2,
            Slot::Ts2 => Slot::Ts1,
        }
    }

    fn bit(self) -> bool {
        matches!(self, Slot::Ts2)
    }

    fn from_bit(bit: bool) -> Slot {
        if bit {
            Slot::Ts2
        } else {
            Slot::Ts1
        }
    }
}

/// Frame type carried in byte 15 bits 5-4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Voice,
    VoiceSync,
    DataSync,
    Reserved,
}

impl FrameType {
    fn from_bits(bits: u8) -> FrameType {
        match bits & 0b11 {
            0b00 => FrameType::Voice,
            0b01 => FrameType::VoiceSync,
            0b10 => FrameType::DataSync,
            _ => FrameType::Reserved,
        }
    }

    fn to_bits(self) -> u8 {
        match self {
            FrameType::Voice => 0b00,
            FrameType::VoiceSync => 0b01,
            FrameType::DataSync => 0b10,
            FrameType::Reserved => 0b11,
        }
    }
}

/// DType values of interest when `FrameType == DataSync` (spec section 4.1).
pub const DTYPE_VOICE_HEAD: u8 = 0x1;
pub const DTYPE_VOICE_TERM: u8 = 0x2;

/// A decoded DMRD frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub seq: u8,
    pub src: u32,
    pub dst: u32,
    pub repeater_id: u32,
    pub slot: Slot,
    /// `true` for group calls, `false` for private calls -- note the wire
    /// polarity is inverted (bit set means private).
    pub group_call: bool,
    pub frame_type: FrameType,
    /// DType (when `frame_type == DataSync`) or VSeq (when `frame_type == Voice`).
    pub dtype_or_vseq: u8,
    pub stream_id: u32,
    pub payload: [u8; 33],
    pub ber: Option<u8>,
    pub rssi: Option<i16>,
}

impl Packet {
    /// `true` if this frame is a DataSync/VoiceTerm burst ending a stream.
    pub fn is_voice_term(&self) -> bool {
        self.frame_type == FrameType::DataSync && self.dtype_or_vseq == DTYPE_VOICE_TERM
    }

    /// `true` if this frame is a DataSync/VoiceHead burst starting a stream.
    pub fn is_voice_head(&self) -> bool {
        self.frame_type == FrameType::DataSync && self.dtype_or_vseq == DTYPE_VOICE_HEAD
    }

    /// Decode a wire frame. Returns `None` for a bad signature or short buffer
    /// (spec section 4.1: decoding rejects frames with a bad signature).
    pub fn decode(bytes: &[u8]) -> Option<Packet> {
        if bytes.len() < DMRD_LEN {
            return None;
        }
        if bytes[0..4] != DMRD_SIGNATURE {
            return None;
        }

        let seq = bytes[4];
        let src = read_u24(&bytes[5..8]);
        let dst = read_u24(&bytes[8..11]);
        let repeater_id = u32::from_be_bytes([bytes[11], bytes[12], bytes[13], bytes[14]]);

        let packing = bytes[15];
        let slot = Slot::from_bit(packing & 0x80 != 0);
        let group_call = packing & 0x40 == 0;
        let frame_type = FrameType::from_bits((packing >> 4) & 0b11);
        let dtype_or_vseq = packing & 0x0F;

        let stream_id = u32::from_be_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);

        let mut payload = [0u8; 33];
        payload.copy_from_slice(&bytes[20..53]);

        let (ber, rssi) = if bytes.len() >= DMRD_LEN_WITH_TRAILER {
            let ber = bytes[53];
            let rssi = i16::from_be_bytes([bytes[54], bytes[55]]);
            (Some(ber), Some(rssi))
        } else {
            (None, None)
        };

        Some(Packet {
            seq,
            src,
            dst,
            repeater_id,
            slot,
            group_call,
            frame_type,
            dtype_or_vseq,
            stream_id,
            payload,
            ber,
            rssi,
        })
    }

    /// Encode back to wire format. Round-trips `decode` byte-for-byte when
    /// `ber`/`rssi` are unset (spec section 4.1 invariant).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(DMRD_LEN_WITH_TRAILER);
        buf.extend_from_slice(&DMRD_SIGNATURE);
        buf.push(self.seq);
        buf.extend_from_slice(&write_u24(self.src));
        buf.extend_from_slice(&write_u24(self.dst));
        buf.extend_from_slice(&self.repeater_id.to_be_bytes());

        let mut packing = 0u8;
        if self.slot.bit() {
            packing |= 0x80;
        }
        if !self.group_call {
            packing |= 0x40;
        }
        packing |= (self.frame_type.to_bits() & 0b11) << 4;
        packing |= self.dtype_or_vseq & 0x0F;
        buf.push(packing);

        buf.extend_from_slice(&self.stream_id.to_be_bytes());
        buf.extend_from_slice(&self.payload);

        if let (Some(ber), Some(rssi)) = (self.ber, self.rssi) {
            buf.push(ber);
            buf.extend_from_slice(&rssi.to_be_bytes());
        }

        buf
    }

    /// Returns a copy of this packet with source/destination swapped and the
    /// repeater field rewritten, as used by Parrot echo and group-call fan-out.
    pub fn rewritten(&self, repeater_id: u32, src: u32, dst: u32) -> Packet {
        Packet {
            repeater_id,
            src,
            dst,
            ..self.clone()
        }
    }
}

fn read_u24(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]])
}

fn write_u24(value: u32) -> [u8; 3] {
    let b = value.to_be_bytes();
    [b[1], b[2], b[3]]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> Packet {
        Packet {
            seq: 7,
            src: 0x00_7000,
            dst: 0x00_0C1C, // 3100
            repeater_id: 2,
            slot: Slot::Ts1,
            group_call: true,
            frame_type: FrameType::Voice,
            dtype_or_vseq: 3,
            stream_id: 0xDEAD_BEEF,
            payload: [0xAB; 33],
            ber: None,
            rssi: None,
        }
    }

    #[test]
    fn test_round_trip_without_trailer() {
        let pkt = sample_packet();
        let bytes = pkt.encode();
        assert_eq!(bytes.len(), DMRD_LEN);
        let decoded = Packet::decode(&bytes).expect("decode");
        assert_eq!(decoded, pkt);
        assert_eq!(decoded.encode(), bytes);
    }

    #[test]
    fn test_round_trip_with_trailer() {
        let mut pkt = sample_packet();
        pkt.ber = Some(12);
        pkt.rssi = Some(-85);
        let bytes = pkt.encode();
        assert_eq!(bytes.len(), DMRD_LEN_WITH_TRAILER);
        let decoded = Packet::decode(&bytes).expect("decode");
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn test_bad_signature_rejected() {
        let mut bytes = sample_packet().encode();
        bytes[0] = b'X';
        assert!(Packet::decode(&bytes).is_none());
    }

    #[test]
    fn test_short_buffer_rejected() {
        let bytes = vec![0u8; DMRD_LEN - 1];
        assert!(Packet::decode(&bytes).is_none());
    }

    #[test]
    fn test_slot_bit_packing() {
        let mut pkt = sample_packet();
        pkt.slot = Slot::Ts2;
        let bytes = pkt.encode();
        assert_eq!(bytes[15] & 0x80, 0x80);
        assert_eq!(Packet::decode(&bytes).unwrap().slot, Slot::Ts2);
    }

    #[test]
    fn test_group_call_bit_is_inverted() {
        let mut pkt = sample_packet();
        pkt.group_call = true;
        assert_eq!(pkt.encode()[15] & 0x40, 0);

        pkt.group_call = false;
        assert_eq!(pkt.encode()[15] & 0x40, 0x40);
    }

    #[test]
    fn test_frame_type_round_trip() {
        for ft in [
            FrameType::Voice,
            FrameType::VoiceSync,
            FrameType::DataSync,
            FrameType::Reserved,
        ] {
            let mut pkt = sample_packet();
            pkt.frame_type = ft;
            let decoded = Packet::decode(&pkt.encode()).unwrap();
            assert_eq!(decoded.frame_type, ft);
        }
    }

    #[test]
    fn test_voice_term_detection() {
        let mut pkt = sample_packet();
        pkt.frame_type = FrameType::DataSync;
        pkt.dtype_or_vseq = DTYPE_VOICE_TERM;
        assert!(pkt.is_voice_term());
        assert!(!pkt.is_voice_head());
    }

    #[test]
    fn test_24_bit_ids_do_not_bleed_into_neighboring_fields() {
        let mut pkt = sample_packet();
        pkt.src = 0x00FF_FFFF;
        let bytes = pkt.encode();
        let decoded = Packet::decode(&bytes).unwrap();
        assert_eq!(decoded.src, 0x00FF_FFFF);
        assert_eq!(decoded.dst, pkt.dst);
    }
}
