// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HBRP (MMDVM/HomeBrew) control-frame wire format and per-repeater FSM
//! (spec sections 4.2, 6.1).

use hmac::digest::Digest;
use sha2::Sha256;
use subtle::ConstantTimeEq;

/// Login request: `RPTL id_be32`.
pub const TAG_RPTL: &[u8] = b"RPTL";
/// Auth response: `RPTK id_be32 SHA256(salt||password)`.
pub const TAG_RPTK: &[u8] = b"RPTK";
/// Configuration block: `RPTC id_be32 config[302]`.
pub const TAG_RPTC: &[u8] = b"RPTC";
/// Keepalive: `RPTPING id_be32`.
pub const TAG_RPTPING: &[u8] = b"RPTPING";
/// Options string.
pub const TAG_RPTO: &[u8] = b"RPTO";
/// Clean disconnect: `RPTCL id_be32`.
pub const TAG_RPTCL: &[u8] = b"RPTCL";
/// Login ack, optionally carrying the salt: `RPTACK [salt_be32]`.
pub const TAG_RPTACK: &[u8] = b"RPTACK";
/// Negative ack: `MSTNAK id_be32`.
pub const TAG_MSTNAK: &[u8] = b"MSTNAK";
/// Pong: `MSTPONG id_be32`.
pub const TAG_MSTPONG: &[u8] = b"MSTPONG";
/// Server-initiated close.
pub const TAG_MSTCL: &[u8] = b"MSTCL";

const CONFIG_BLOCK_LEN: usize = 302;

/// A decoded control frame sent by a repeater.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Rptl { id: u32 },
    Rptk { id: u32, hash: [u8; 32] },
    Rptc { id: u32, config: Vec<u8> },
    RptPing { id: u32 },
    Rpto { id: u32, options: String },
    Rptcl { id: u32 },
}

impl ClientFrame {
    /// Decode a control frame. Returns `None` if the tag is unrecognized or
    /// the payload is malformed (spec section 4.2: malformed frames are
    /// silently dropped by the caller).
    pub fn decode(bytes: &[u8]) -> Option<ClientFrame> {
        // RPTPING (7) must be checked before the shorter tags it could be
        // confused with by a naive length-insensitive prefix match.
        if let Some(rest) = strip_tag(bytes, TAG_RPTPING) {
            return Some(ClientFrame::RptPing { id: read_u32(rest)? });
        }
        if let Some(rest) = strip_tag(bytes, TAG_RPTL) {
            return Some(ClientFrame::Rptl { id: read_u32(rest)? });
        }
        if let Some(rest) = strip_tag(bytes, TAG_RPTK) {
            if rest.len() < 4 + 32 {
                return None;
            }
            let id = read_u32(&rest[..4])?;
            let mut hash = [0u8; 32];
            hash.copy_from_slice(&rest[4..36]);
            return Some(ClientFrame::Rptk { id, hash });
        }
        if let Some(rest) = strip_tag(bytes, TAG_RPTC) {
            if rest.len() < 4 {
                return None;
            }
            let id = read_u32(&rest[..4])?;
            let config = rest[4..].to_vec();
            return Some(ClientFrame::Rptc { id, config });
        }
        if let Some(rest) = strip_tag(bytes, TAG_RPTO) {
            if rest.len() < 4 {
                return None;
            }
            let id = read_u32(&rest[..4])?;
            let options = String::from_utf8_lossy(&rest[4..]).to_string();
            return Some(ClientFrame::Rpto { id, options });
        }
        if let Some(rest) = strip_tag(bytes, TAG_RPTCL) {
            return Some(ClientFrame::Rptcl { id: read_u32(rest)? });
        }
        None
    }

    pub fn repeater_id(&self) -> u32 {
        match self {
            ClientFrame::Rptl { id }
            | ClientFrame::Rptk { id, .. }
            | ClientFrame::Rptc { id, .. }
            | ClientFrame::RptPing { id }
            | ClientFrame::Rpto { id, .. }
            | ClientFrame::Rptcl { id } => *id,
        }
    }
}

/// A control frame sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    RptAckSalt { salt: u32 },
    RptAck,
    MstNak { id: u32 },
    MstPong { id: u32 },
    MstCl,
}

impl ServerFrame {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ServerFrame::RptAckSalt { salt } => {
                let mut buf = TAG_RPTACK.to_vec();
                buf.extend_from_slice(&salt.to_be_bytes());
                buf
            }
            ServerFrame::RptAck => TAG_RPTACK.to_vec(),
            ServerFrame::MstNak { id } => {
                let mut buf = TAG_MSTNAK.to_vec();
                buf.extend_from_slice(&id.to_be_bytes());
                buf
            }
            ServerFrame::MstPong { id } => {
                let mut buf = TAG_MSTPONG.to_vec();
                buf.extend_from_slice(&id.to_be_bytes());
                buf
            }
            ServerFrame::MstCl => TAG_MSTCL.to_vec(),
        }
    }
}

/// Width of the callsign field at the head of an RPTC config block (real
/// MMDVM config blocks place an 8-byte space-padded callsign first).
pub const CONFIG_CALLSIGN_LEN: usize = 8;

/// Build a 302-byte padded config block placeholder (used by tests and the
/// reference client simulator; real clients send their own).
pub fn pad_config_block(callsign: &str) -> Vec<u8> {
    let mut block = vec![b' '; CONFIG_BLOCK_LEN];
    let bytes = callsign.as_bytes();
    let n = bytes.len().min(CONFIG_BLOCK_LEN);
    block[..n].copy_from_slice(&bytes[..n]);
    block
}

/// Extract and trim the callsign from the head of a decoded RPTC config
/// block (spec section 4.2: "Callsign mismatch between submitted config and
/// user's registered callsign -> `MSTNAK`"). Returns `None` if the block is
/// shorter than the callsign field or is not valid UTF-8.
pub fn parse_config_callsign(config: &[u8]) -> Option<String> {
    if config.len() < CONFIG_CALLSIGN_LEN {
        return None;
    }
    std::str::from_utf8(&config[..CONFIG_CALLSIGN_LEN])
        .ok()
        .map(|s| s.trim().to_string())
}

/// Compute `SHA256(salt_be32 || password)` per the RPTK handshake math
/// (spec section 4.2).
pub fn compute_auth_hash(salt: u32, password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt.to_be_bytes());
    hasher.update(password.as_bytes());
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Constant-time comparison of the submitted RPTK hash against the expected
/// one (spec section 4.2: "The server computes the same and compares in
/// constant time").
pub fn verify_auth_hash(salt: u32, password: &str, submitted: &[u8; 32]) -> bool {
    let expected = compute_auth_hash(salt, password);
    expected.ct_eq(submitted).into()
}

fn strip_tag<'a>(bytes: &'a [u8], tag: &[u8]) -> Option<&'a [u8]> {
    if bytes.len() >= tag.len() && &bytes[..tag.len()] == tag {
        Some(&bytes[tag.len()..])
    } else {
        None
    }
}

fn read_u32(bytes: &[u8]) -> Option<u32> {
    if bytes.len() < 4 {
        return None;
    }
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Per-repeater connection FSM (spec section 4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    RptlReceived,
    Authenticated,
    Connected,
}

/// Per-repeater session state owned by the HBRP transport actor.
#[derive(Debug, Clone)]
pub struct Session {
    pub repeater_id: u32,
    pub state: ConnectionState,
    pub salt: Option<u32>,
    /// `PingsReceived` (spec section 3/4.2): incremented on every RPTPING.
    pub pings_received: u64,
    /// `LastPing`: wall-clock ms of the most recent RPTPING, used by the
    /// ping-timeout monitor (spec section 4.2, section 5).
    pub last_ping_unix_ms: Option<i64>,
    /// Wall-clock ms the session entered `RptlReceived`, used to enforce
    /// `handshake_timeout` (spec section 5: "the RPTL/RPTK handshake must
    /// complete within `handshake_timeout`... otherwise the session is
    /// discarded").
    pub handshake_started_unix_ms: Option<i64>,
}

impl Session {
    pub fn new(repeater_id: u32) -> Self {
        Self {
            repeater_id,
            state: ConnectionState::Disconnected,
            salt: None,
            pings_received: 0,
            last_ping_unix_ms: None,
            handshake_started_unix_ms: None,
        }
    }

    /// Transition on RPTL: generate a salt and move to `RptlReceived`,
    /// starting the handshake-timeout clock.
    pub fn on_rptl(&mut self, salt: u32, now_unix_ms: i64) -> ServerFrame {
        self.state = ConnectionState::RptlReceived;
        self.salt = Some(salt);
        self.handshake_started_unix_ms = Some(now_unix_ms);
        ServerFrame::RptAckSalt { salt }
    }

    /// `true` once `RptlReceived` or `Authenticated` has outlived
    /// `handshake_timeout` without reaching `Connected` (spec section 5).
    pub fn handshake_expired(&self, now_unix_ms: i64, handshake_timeout_ms: i64) -> bool {
        match self.state {
            ConnectionState::RptlReceived | ConnectionState::Authenticated => {
                match self.handshake_started_unix_ms {
                    Some(started) => now_unix_ms.saturating_sub(started) > handshake_timeout_ms,
                    None => false,
                }
            }
            ConnectionState::Disconnected | ConnectionState::Connected => false,
        }
    }

    /// Record an RPTPING (spec section 4.2: "increments `PingsReceived`,
    /// refreshes `LastPing`").
    pub fn note_ping(&mut self, now_unix_ms: i64) {
        self.pings_received += 1;
        self.last_ping_unix_ms = Some(now_unix_ms);
    }

    /// `true` once `Connected` and `LastPing` is older than `ping_timeout`
    /// (spec section 4.2: "The Hub's per-repeater monitor disconnects any
    /// repeater whose `LastPing` is older than `ping_timeout`").
    pub fn ping_expired(&self, now_unix_ms: i64, ping_timeout_ms: i64) -> bool {
        self.state == ConnectionState::Connected
            && match self.last_ping_unix_ms {
                Some(last) => now_unix_ms.saturating_sub(last) > ping_timeout_ms,
                None => false,
            }
    }

    /// Transition on RPTK: verify the hash, move to `Authenticated` or back
    /// to `Disconnected`.
    pub fn on_rptk(&mut self, password: &str, submitted: &[u8; 32]) -> ServerFrame {
        if self.state != ConnectionState::RptlReceived {
            self.state = ConnectionState::Disconnected;
            return ServerFrame::MstNak {
                id: self.repeater_id,
            };
        }
        let salt = match self.salt {
            Some(s) => s,
            None => {
                self.state = ConnectionState::Disconnected;
                return ServerFrame::MstNak {
                    id: self.repeater_id,
                };
            }
        };

        if verify_auth_hash(salt, password, submitted) {
            self.state = ConnectionState::Authenticated;
            ServerFrame::RptAck
        } else {
            self.state = ConnectionState::Disconnected;
            ServerFrame::MstNak {
                id: self.repeater_id,
            }
        }
    }

    /// Transition on RPTC: only valid once authenticated.
    pub fn on_rptc(&mut self, now_unix_ms: i64) -> ServerFrame {
        if self.state != ConnectionState::Authenticated {
            self.state = ConnectionState::Disconnected;
            return ServerFrame::MstNak {
                id: self.repeater_id,
            };
        }
        self.state = ConnectionState::Connected;
        self.last_ping_unix_ms = Some(now_unix_ms);
        ServerFrame::RptAck
    }

    /// Transition on RPTCL: always returns to `Disconnected`.
    pub fn on_rptcl(&mut self) -> ServerFrame {
        self.state = ConnectionState::Disconnected;
        ServerFrame::MstCl
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_rptl() {
        let mut bytes = TAG_RPTL.to_vec();
        bytes.extend_from_slice(&312100u32.to_be_bytes());
        let frame = ClientFrame::decode(&bytes).unwrap();
        assert_eq!(frame, ClientFrame::Rptl { id: 312100 });
    }

    #[test]
    fn test_decode_rptping_not_confused_with_rptl() {
        let mut bytes = TAG_RPTPING.to_vec();
        bytes.extend_from_slice(&1u32.to_be_bytes());
        let frame = ClientFrame::decode(&bytes).unwrap();
        assert_eq!(frame, ClientFrame::RptPing { id: 1 });
    }

    #[test]
    fn test_decode_rptk() {
        let hash = compute_auth_hash(0x0004C314, "p");
        let mut bytes = TAG_RPTK.to_vec();
        bytes.extend_from_slice(&312100u32.to_be_bytes());
        bytes.extend_from_slice(&hash);
        let frame = ClientFrame::decode(&bytes).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Rptk {
                id: 312100,
                hash
            }
        );
    }

    #[test]
    fn test_decode_unknown_tag_returns_none() {
        assert!(ClientFrame::decode(b"XXXX\x00\x00\x00\x01").is_none());
    }

    #[test]
    fn test_parse_config_callsign_trims_padding() {
        let block = pad_config_block("W1AW");
        assert_eq!(parse_config_callsign(&block), Some("W1AW".to_string()));
    }

    #[test]
    fn test_parse_config_callsign_rejects_short_block() {
        assert_eq!(parse_config_callsign(&[0u8; 4]), None);
    }

    #[test]
    fn test_server_frame_encode() {
        assert_eq!(
            ServerFrame::MstNak { id: 5 }.encode(),
            [b"MSTNAK".as_slice(), &5u32.to_be_bytes()].concat()
        );
        assert_eq!(ServerFrame::MstCl.encode(), TAG_MSTCL);
    }

    #[test]
    fn test_handshake_happy_path() {
        // Scenario 1 from spec section 8.
        let mut session = Session::new(312100);
        let ack = session.on_rptl(0xAABBCCDD, 1_000);
        assert_eq!(ack, ServerFrame::RptAckSalt { salt: 0xAABBCCDD });
        assert_eq!(session.state, ConnectionState::RptlReceived);

        let submitted = compute_auth_hash(0xAABBCCDD, "p");
        let ack = session.on_rptk("p", &submitted);
        assert_eq!(ack, ServerFrame::RptAck);
        assert_eq!(session.state, ConnectionState::Authenticated);

        let ack = session.on_rptc(1_500);
        assert_eq!(ack, ServerFrame::RptAck);
        assert_eq!(session.state, ConnectionState::Connected);
        assert!(session.is_connected());
    }

    #[test]
    fn test_handshake_wrong_password_rejected() {
        let mut session = Session::new(1);
        session.on_rptl(42, 0);
        let wrong = compute_auth_hash(42, "wrong");
        let nak = session.on_rptk("correct", &wrong);
        assert_eq!(nak, ServerFrame::MstNak { id: 1 });
        assert_eq!(session.state, ConnectionState::Disconnected);
    }

    #[test]
    fn test_rptc_before_rptk_rejected() {
        let mut session = Session::new(1);
        session.on_rptl(42, 0);
        let nak = session.on_rptc(0);
        assert_eq!(nak, ServerFrame::MstNak { id: 1 });
    }

    #[test]
    fn test_handshake_expires_after_timeout() {
        let mut session = Session::new(1);
        session.on_rptl(42, 0);
        assert!(!session.handshake_expired(4_000, 5_000));
        assert!(session.handshake_expired(6_000, 5_000));
    }

    #[test]
    fn test_note_ping_updates_counters() {
        let mut session = Session::new(1);
        session.note_ping(1_000);
        assert_eq!(session.pings_received, 1);
        assert_eq!(session.last_ping_unix_ms, Some(1_000));
        session.note_ping(2_000);
        assert_eq!(session.pings_received, 2);
    }

    #[test]
    fn test_ping_expired_only_when_connected() {
        let mut session = Session::new(1);
        session.note_ping(0);
        assert!(!session.ping_expired(1_000, 500));
        session.state = ConnectionState::Connected;
        assert!(session.ping_expired(1_000, 500));
    }

    #[test]
    fn test_rptcl_always_disconnects() {
        let mut session = Session::new(1);
        session.state = ConnectionState::Connected;
        let cl = session.on_rptcl();
        assert_eq!(cl, ServerFrame::MstCl);
        assert_eq!(session.state, ConnectionState::Disconnected);
    }
}
