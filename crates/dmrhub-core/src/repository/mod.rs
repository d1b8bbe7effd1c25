// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Data model and narrow repository surface (C10) over the relational
//! store (spec sections 3, 4.8). `dmrhub-persistence` provides the sqlite
//! implementation; `dmrhub-core` only defines the contract and the shapes
//! that flow across it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

/// Repeater connection type (spec section 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepeaterKind {
    Mmdvm,
    Ipsc,
}

/// One endpoint of a many-to-many talkgroup edge on a specific timeslot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeslotId {
    Ts1,
    Ts2,
}

/// A registered repeater (spec section 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repeater {
    pub id: u32,
    pub callsign: String,
    pub owner_user_id: u32,
    pub kind: RepeaterKind,
    /// Hashed/stored auth secret (HBRP password or IPSC hex key).
    pub auth_key: String,
    pub pings_received: u64,
    pub last_ip: Option<String>,
    pub last_port: Option<u16>,
    pub connected: bool,
    /// Static talkgroup assignments, per timeslot.
    pub ts1_static: BTreeSet<u32>,
    pub ts2_static: BTreeSet<u32>,
    /// At most one dynamic talkgroup per timeslot (spec section 3).
    pub ts1_dynamic: Option<u32>,
    pub ts2_dynamic: Option<u32>,
    pub hotspot: bool,
    pub simplex_repeater: bool,
}

impl Repeater {
    /// Returns the static talkgroup set for `slot`.
    pub fn static_talkgroups(&self, slot: TimeslotId) -> &BTreeSet<u32> {
        match slot {
            TimeslotId::Ts1 => &self.ts1_static,
            TimeslotId::Ts2 => &self.ts2_static,
        }
    }

    /// Returns the dynamic talkgroup for `slot`, if any.
    pub fn dynamic_talkgroup(&self, slot: TimeslotId) -> Option<u32> {
        match slot {
            TimeslotId::Ts1 => self.ts1_dynamic,
            TimeslotId::Ts2 => self.ts2_dynamic,
        }
    }

    /// Whether this repeater routes talkgroup `tg` on `slot`, including the
    /// simplex-repeater cross-slot rule (spec section 4.5 item 3, section 9
    /// open question: enforced on reception only).
    pub fn routes_talkgroup(&self, slot: TimeslotId, tg: u32) -> bool {
        if self.static_talkgroups(slot).contains(&tg) {
            return true;
        }
        if self.dynamic_talkgroup(slot) == Some(tg) {
            return true;
        }
        if self.simplex_repeater && self.dynamic_talkgroup(other_slot(slot)) == Some(tg) {
            return true;
        }
        false
    }
}

fn other_slot(slot: TimeslotId) -> TimeslotId {
    match slot {
        TimeslotId::Ts1 => TimeslotId::Ts2,
        TimeslotId::Ts2 => TimeslotId::Ts1,
    }
}

/// PeerRule direction (spec section 3, 4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRuleDirection {
    Ingress,
    Egress,
}

/// One allow-list entry on an OpenBridge peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRule {
    pub direction: PeerRuleDirection,
    pub subject_id_min: u32,
    pub subject_id_max: u32,
}

impl PeerRule {
    pub fn matches(&self, direction: PeerRuleDirection, subject: u32) -> bool {
        self.direction == direction
            && subject >= self.subject_id_min
            && subject <= self.subject_id_max
    }
}

/// An OpenBridge peer (spec section 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub id: u32,
    pub ip: String,
    pub port: u16,
    pub auth_key: String,
    pub owner_user_id: u32,
    pub ingress: bool,
    pub egress: bool,
    pub rules: Vec<PeerRule>,
}

impl Peer {
    /// Allow-list evaluation: permitted iff ANY rule matches (spec section 4.4).
    pub fn admits(&self, direction: PeerRuleDirection, subject: u32) -> bool {
        let direction_enabled = match direction {
            PeerRuleDirection::Ingress => self.ingress,
            PeerRuleDirection::Egress => self.egress,
        };
        direction_enabled && self.rules.iter().any(|r| r.matches(direction, subject))
    }
}

/// A talkgroup (spec section 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Talkgroup {
    pub id: u32,
    pub name: String,
    pub admin_user_ids: BTreeSet<u32>,
    pub nco_user_ids: BTreeSet<u32>,
}

/// Call destination kind (spec section 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDestinationKind {
    Talkgroup,
    User,
    Repeater,
}

/// A folded Call record (spec sections 3, 4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    pub stream_id: u32,
    pub user_id: u32,
    pub repeater_id: u32,
    pub start_time_unix_ms: i64,
    pub last_packet_time_unix_ms: i64,
    pub duration_ms: i64,
    pub slot: TimeslotId,
    pub group_call: bool,
    pub destination_kind: CallDestinationKind,
    pub destination_id: u32,
    pub ber: f64,
    pub rssi: f64,
    pub jitter_ms: f64,
    pub loss: f64,
    pub active: bool,
}

/// An active or historical session on a talkgroup (spec section 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Net {
    pub id: u32,
    pub talkgroup_id: u32,
    pub scheduled_net_id: Option<u32>,
    pub start_time_unix_ms: i64,
    pub end_time_unix_ms: Option<i64>,
    pub duration_minutes: Option<u32>,
    pub active: bool,
    pub showcase: bool,
    pub started_by_user_id: Option<u32>,
}

/// A recurring template producing `Net` instances (spec sections 3, 4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledNet {
    pub id: u32,
    pub talkgroup_id: u32,
    pub time_of_day_hh_mm: (u8, u8),
    pub day_of_week: u8,
    pub timezone: String,
    pub duration_minutes: u32,
    pub enabled: bool,
    pub next_run_unix_ms: Option<i64>,
}

/// Rejected by `ScheduledNet::cron_expression` when `TimeOfDay`/`DayOfWeek`
/// fall outside the bounds spec section 4.7 requires generation to enforce.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CronExpressionError {
    #[error("time-of-day hour must be 0..=23, got {0}")]
    InvalidHour(u8),
    #[error("time-of-day minute must be 0..=59, got {0}")]
    InvalidMinute(u8),
    #[error("day_of_week must be 0..=6 (0=Sunday), got {0}")]
    InvalidDayOfWeek(u8),
}

impl ScheduledNet {
    /// Canonical 6-field cron `s m h * * d` with `s=0` (spec section 4.7:
    /// "Expression generation enforces `TimeOfDay = HH:MM` (24-hour) and
    /// `DayOfWeek ∈ [0,6]`"). Rejects out-of-range fields instead of
    /// formatting a silently invalid, never-firing expression.
    pub fn cron_expression(&self) -> Result<String, CronExpressionError> {
        let (hour, minute) = self.time_of_day_hh_mm;
        if hour > 23 {
            return Err(CronExpressionError::InvalidHour(hour));
        }
        if minute > 59 {
            return Err(CronExpressionError::InvalidMinute(minute));
        }
        if self.day_of_week > 6 {
            return Err(CronExpressionError::InvalidDayOfWeek(self.day_of_week));
        }
        Ok(format!("0 {} {} * * {}", minute, hour, self.day_of_week))
    }
}

/// A platform user (out of scope per spec section 1, but needed as a
/// foreign key target for repeater ownership and last-heard routing).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: u32,
    pub callsign: String,
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("not found")]
    NotFound,
    #[error("repository backend error: {0}")]
    Backend(String),
}

/// Narrow repository surface (spec section 4.8). Every method that looks
/// up a single row returns `RepositoryError::NotFound` rather than
/// `Option`, matching the reference's `(value, not-found|error)` shape.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn find_repeater_by_id(&self, id: u32) -> Result<Repeater, RepositoryError>;
    async fn repeater_id_exists(&self, id: u32) -> Result<bool, RepositoryError>;
    async fn get_user_repeaters(&self, user_id: u32) -> Result<Vec<Repeater>, RepositoryError>;
    async fn find_user_by_id(&self, id: u32) -> Result<User, RepositoryError>;
    async fn talkgroup_id_exists(&self, id: u32) -> Result<bool, RepositoryError>;
    async fn find_active_net_for_talkgroup(
        &self,
        talkgroup_id: u32,
    ) -> Result<Option<Net>, RepositoryError>;
    async fn find_talkgroup_calls_in_time_range(
        &self,
        talkgroup_id: u32,
        start_unix_ms: i64,
        end_unix_ms: i64,
    ) -> Result<Vec<Call>, RepositoryError>;
    async fn create_net(&self, net: Net) -> Result<Net, RepositoryError>;
    async fn end_net(&self, net_id: u32, end_time_unix_ms: i64) -> Result<(), RepositoryError>;
    async fn update_scheduled_net(&self, sn: ScheduledNet) -> Result<(), RepositoryError>;
    async fn update_net_showcase(&self, net_id: u32, showcase: bool) -> Result<(), RepositoryError>;

    /// Nets whose `duration_minutes` window has elapsed but are still
    /// `Active` -- the reaper's watchdog query (spec section 9,
    /// `models.FindActiveNetsPastDuration`).
    async fn find_active_nets_past_duration(
        &self,
        now_unix_ms: i64,
    ) -> Result<Vec<Net>, RepositoryError>;

    /// Create or update a Call row (spec section 4.6).
    async fn upsert_call(&self, call: Call) -> Result<(), RepositoryError>;

    /// Cascade-delete a talkgroup: removes every repeater-talkgroup edge
    /// referencing it and returns the IDs of repeaters that need a
    /// `ReloadRepeater` notification (spec section 4.8).
    async fn delete_talkgroup_cascade(&self, talkgroup_id: u32) -> Result<Vec<u32>, RepositoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repeater() -> Repeater {
        Repeater {
            id: 2,
            callsign: "W1AW".into(),
            owner_user_id: 1,
            kind: RepeaterKind::Mmdvm,
            auth_key: "p".into(),
            pings_received: 0,
            last_ip: None,
            last_port: None,
            connected: false,
            ts1_static: BTreeSet::from([3100]),
            ts2_static: BTreeSet::new(),
            ts1_dynamic: None,
            ts2_dynamic: None,
            hotspot: false,
            simplex_repeater: false,
        }
    }

    #[test]
    fn test_routes_talkgroup_static() {
        let r = repeater();
        assert!(r.routes_talkgroup(TimeslotId::Ts1, 3100));
        assert!(!r.routes_talkgroup(TimeslotId::Ts2, 3100));
    }

    #[test]
    fn test_routes_talkgroup_dynamic() {
        let mut r = repeater();
        r.ts2_dynamic = Some(91);
        assert!(r.routes_talkgroup(TimeslotId::Ts2, 91));
    }

    #[test]
    fn test_simplex_cross_slot_routing() {
        let mut r = repeater();
        r.simplex_repeater = true;
        r.ts1_dynamic = Some(91);
        assert!(r.routes_talkgroup(TimeslotId::Ts2, 91));

        r.simplex_repeater = false;
        assert!(!r.routes_talkgroup(TimeslotId::Ts2, 91));
    }

    #[test]
    fn test_peer_rule_allow_list() {
        let peer = Peer {
            id: 1,
            ip: "10.0.0.1".into(),
            port: 62035,
            auth_key: "secret".into(),
            owner_user_id: 1,
            ingress: true,
            egress: true,
            rules: vec![PeerRule {
                direction: PeerRuleDirection::Egress,
                subject_id_min: 3000,
                subject_id_max: 3999,
            }],
        };
        assert!(peer.admits(PeerRuleDirection::Egress, 3100));
        assert!(!peer.admits(PeerRuleDirection::Egress, 9990));
        assert!(!peer.admits(PeerRuleDirection::Ingress, 3100));
    }

    #[test]
    fn test_scheduled_net_cron_expression() {
        let sn = ScheduledNet {
            id: 1,
            talkgroup_id: 3100,
            time_of_day_hh_mm: (20, 0),
            day_of_week: 2,
            timezone: "UTC".into(),
            duration_minutes: 60,
            enabled: true,
            next_run_unix_ms: None,
        };
        assert_eq!(sn.cron_expression().unwrap(), "0 0 20 * * 2");
    }

    #[test]
    fn test_scheduled_net_cron_expression_rejects_bad_hour() {
        let mut sn = ScheduledNet {
            id: 1,
            talkgroup_id: 3100,
            time_of_day_hh_mm: (25, 0),
            day_of_week: 2,
            timezone: "UTC".into(),
            duration_minutes: 60,
            enabled: true,
            next_run_unix_ms: None,
        };
        assert_eq!(sn.cron_expression(), Err(CronExpressionError::InvalidHour(25)));

        sn.time_of_day_hh_mm = (20, 60);
        assert_eq!(sn.cron_expression(), Err(CronExpressionError::InvalidMinute(60)));

        sn.time_of_day_hh_mm = (20, 0);
        sn.day_of_week = 9;
        assert_eq!(sn.cron_expression(), Err(CronExpressionError::InvalidDayOfWeek(9)));
    }
}
