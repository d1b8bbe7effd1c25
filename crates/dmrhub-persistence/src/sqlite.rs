// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! `Repository` implementation backed by `rusqlite`. A single connection
//! guarded by a blocking mutex is sufficient here: every call is short and
//! the daemon's hot path (routing) never touches the relational store
//! directly, only the Hub's actor tasks on authentication/call-finalize
//! boundaries do (spec section 5, "relational store calls" as a named
//! suspension point).

use async_trait::async_trait;
use dmrhub_core::repository::{
    Call, CallDestinationKind, Net, Peer as _UnusedPeerMarker, Repeater, RepeaterKind, Repository,
    RepositoryError, ScheduledNet, TimeslotId, User,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SqliteError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<SqliteError> for RepositoryError {
    fn from(err: SqliteError) -> Self {
        RepositoryError::Backend(err.to_string())
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY,
    callsign TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS repeaters (
    id INTEGER PRIMARY KEY,
    callsign TEXT NOT NULL,
    owner_user_id INTEGER NOT NULL,
    kind TEXT NOT NULL,
    auth_key TEXT NOT NULL,
    pings_received INTEGER NOT NULL DEFAULT 0,
    last_ip TEXT,
    last_port INTEGER,
    connected INTEGER NOT NULL DEFAULT 0,
    ts1_static TEXT NOT NULL DEFAULT '[]',
    ts2_static TEXT NOT NULL DEFAULT '[]',
    ts1_dynamic INTEGER,
    ts2_dynamic INTEGER,
    hotspot INTEGER NOT NULL DEFAULT 0,
    simplex_repeater INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS talkgroups (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS nets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    talkgroup_id INTEGER NOT NULL,
    scheduled_net_id INTEGER,
    start_time_unix_ms INTEGER NOT NULL,
    end_time_unix_ms INTEGER,
    duration_minutes INTEGER,
    active INTEGER NOT NULL DEFAULT 1,
    showcase INTEGER NOT NULL DEFAULT 0,
    started_by_user_id INTEGER
);

CREATE TABLE IF NOT EXISTS scheduled_nets (
    id INTEGER PRIMARY KEY,
    talkgroup_id INTEGER NOT NULL,
    hour INTEGER NOT NULL,
    minute INTEGER NOT NULL,
    day_of_week INTEGER NOT NULL,
    timezone TEXT NOT NULL,
    duration_minutes INTEGER NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    next_run_unix_ms INTEGER
);

CREATE TABLE IF NOT EXISTS calls (
    stream_id INTEGER PRIMARY KEY,
    user_id INTEGER NOT NULL,
    repeater_id INTEGER NOT NULL,
    start_time_unix_ms INTEGER NOT NULL,
    last_packet_time_unix_ms INTEGER NOT NULL,
    duration_ms INTEGER NOT NULL,
    slot TEXT NOT NULL,
    group_call INTEGER NOT NULL,
    destination_kind TEXT NOT NULL,
    destination_id INTEGER NOT NULL,
    ber REAL NOT NULL,
    rssi REAL NOT NULL,
    jitter_ms REAL NOT NULL,
    loss REAL NOT NULL,
    active INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS repeater_talkgroups (
    repeater_id INTEGER NOT NULL,
    talkgroup_id INTEGER NOT NULL,
    slot TEXT NOT NULL,
    kind TEXT NOT NULL
);
";

pub struct SqliteRepository {
    conn: Mutex<Connection>,
}

impl SqliteRepository {
    /// Open (creating if absent) the sqlite database at `path`, running
    /// schema migration.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SqliteError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database, used by tests and ephemeral setups.
    pub fn open_in_memory() -> Result<Self, SqliteError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn row_to_repeater(row: &rusqlite::Row) -> rusqlite::Result<Repeater> {
        let kind: String = row.get("kind")?;
        let ts1_static_json: String = row.get("ts1_static")?;
        let ts2_static_json: String = row.get("ts2_static")?;
        let ts1_static: BTreeSet<u32> = serde_json::from_str(&ts1_static_json).unwrap_or_default();
        let ts2_static: BTreeSet<u32> = serde_json::from_str(&ts2_static_json).unwrap_or_default();

        Ok(Repeater {
            id: row.get("id")?,
            callsign: row.get("callsign")?,
            owner_user_id: row.get("owner_user_id")?,
            kind: if kind == "ipsc" {
                RepeaterKind::Ipsc
            } else {
                RepeaterKind::Mmdvm
            },
            auth_key: row.get("auth_key")?,
            pings_received: row.get::<_, i64>("pings_received")? as u64,
            last_ip: row.get("last_ip")?,
            last_port: row.get::<_, Option<i64>>("last_port")?.map(|p| p as u16),
            connected: row.get::<_, i64>("connected")? != 0,
            ts1_static,
            ts2_static,
            ts1_dynamic: row.get::<_, Option<i64>>("ts1_dynamic")?.map(|v| v as u32),
            ts2_dynamic: row.get::<_, Option<i64>>("ts2_dynamic")?.map(|v| v as u32),
            hotspot: row.get::<_, i64>("hotspot")? != 0,
            simplex_repeater: row.get::<_, i64>("simplex_repeater")? != 0,
        })
    }

    fn row_to_net(row: &rusqlite::Row) -> rusqlite::Result<Net> {
        Ok(Net {
            id: row.get("id")?,
            talkgroup_id: row.get("talkgroup_id")?,
            scheduled_net_id: row.get("scheduled_net_id")?,
            start_time_unix_ms: row.get("start_time_unix_ms")?,
            end_time_unix_ms: row.get("end_time_unix_ms")?,
            duration_minutes: row.get::<_, Option<i64>>("duration_minutes")?.map(|v| v as u32),
            active: row.get::<_, i64>("active")? != 0,
            showcase: row.get::<_, i64>("showcase")? != 0,
            started_by_user_id: row.get("started_by_user_id")?,
        })
    }

    fn row_to_call(row: &rusqlite::Row) -> rusqlite::Result<Call> {
        let slot: String = row.get("slot")?;
        let destination_kind: String = row.get("destination_kind")?;
        Ok(Call {
            stream_id: row.get::<_, i64>("stream_id")? as u32,
            user_id: row.get("user_id")?,
            repeater_id: row.get("repeater_id")?,
            start_time_unix_ms: row.get("start_time_unix_ms")?,
            last_packet_time_unix_ms: row.get("last_packet_time_unix_ms")?,
            duration_ms: row.get("duration_ms")?,
            slot: if slot == "ts2" { TimeslotId::Ts2 } else { TimeslotId::Ts1 },
            group_call: row.get::<_, i64>("group_call")? != 0,
            destination_kind: match destination_kind.as_str() {
                "user" => CallDestinationKind::User,
                "repeater" => CallDestinationKind::Repeater,
                _ => CallDestinationKind::Talkgroup,
            },
            destination_id: row.get("destination_id")?,
            ber: row.get("ber")?,
            rssi: row.get("rssi")?,
            jitter_ms: row.get("jitter_ms")?,
            loss: row.get("loss")?,
            active: row.get::<_, i64>("active")? != 0,
        })
    }
}

fn slot_str(slot: TimeslotId) -> &'static str {
    match slot {
        TimeslotId::Ts1 => "ts1",
        TimeslotId::Ts2 => "ts2",
    }
}

fn destination_kind_str(kind: CallDestinationKind) -> &'static str {
    match kind {
        CallDestinationKind::Talkgroup => "talkgroup",
        CallDestinationKind::User => "user",
        CallDestinationKind::Repeater => "repeater",
    }
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn find_repeater_by_id(&self, id: u32) -> Result<Repeater, RepositoryError> {
        let conn = self.lock();
        conn.query_row("SELECT * FROM repeaters WHERE id = ?1", params![id], Self::row_to_repeater)
            .optional()
            .map_err(SqliteError::from)?
            .ok_or(RepositoryError::NotFound)
    }

    async fn repeater_id_exists(&self, id: u32) -> Result<bool, RepositoryError> {
        let conn = self.lock();
        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM repeaters WHERE id = ?1)",
                params![id],
                |row| row.get(0),
            )
            .map_err(SqliteError::from)?;
        Ok(exists)
    }

    async fn get_user_repeaters(&self, user_id: u32) -> Result<Vec<Repeater>, RepositoryError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT * FROM repeaters WHERE owner_user_id = ?1")
            .map_err(SqliteError::from)?;
        let rows = stmt
            .query_map(params![user_id], Self::row_to_repeater)
            .map_err(SqliteError::from)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(SqliteError::from)?);
        }
        Ok(out)
    }

    async fn find_user_by_id(&self, id: u32) -> Result<User, RepositoryError> {
        let conn = self.lock();
        conn.query_row("SELECT id, callsign FROM users WHERE id = ?1", params![id], |row| {
            Ok(User {
                id: row.get(0)?,
                callsign: row.get(1)?,
            })
        })
        .optional()
        .map_err(SqliteError::from)?
        .ok_or(RepositoryError::NotFound)
    }

    async fn talkgroup_id_exists(&self, id: u32) -> Result<bool, RepositoryError> {
        let conn = self.lock();
        let exists: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM talkgroups WHERE id = ?1)",
                params![id],
                |row| row.get(0),
            )
            .map_err(SqliteError::from)?;
        Ok(exists)
    }

    async fn find_active_net_for_talkgroup(&self, talkgroup_id: u32) -> Result<Option<Net>, RepositoryError> {
        let conn = self.lock();
        conn.query_row(
            "SELECT * FROM nets WHERE talkgroup_id = ?1 AND active = 1 LIMIT 1",
            params![talkgroup_id],
            Self::row_to_net,
        )
        .optional()
        .map_err(|err| RepositoryError::from(SqliteError::from(err)))
    }

    async fn find_talkgroup_calls_in_time_range(
        &self,
        talkgroup_id: u32,
        start_unix_ms: i64,
        end_unix_ms: i64,
    ) -> Result<Vec<Call>, RepositoryError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT * FROM calls WHERE destination_kind = 'talkgroup' AND destination_id = ?1
                 AND start_time_unix_ms >= ?2 AND start_time_unix_ms <= ?3",
            )
            .map_err(SqliteError::from)?;
        let rows = stmt
            .query_map(params![talkgroup_id, start_unix_ms, end_unix_ms], Self::row_to_call)
            .map_err(SqliteError::from)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(SqliteError::from)?);
        }
        Ok(out)
    }

    async fn create_net(&self, net: Net) -> Result<Net, RepositoryError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO nets (talkgroup_id, scheduled_net_id, start_time_unix_ms, end_time_unix_ms,
                duration_minutes, active, showcase, started_by_user_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                net.talkgroup_id,
                net.scheduled_net_id,
                net.start_time_unix_ms,
                net.end_time_unix_ms,
                net.duration_minutes,
                net.active as i64,
                net.showcase as i64,
                net.started_by_user_id,
            ],
        )
        .map_err(SqliteError::from)?;
        let id = conn.last_insert_rowid() as u32;
        debug!(net_id = id, talkgroup_id = net.talkgroup_id, "net created");
        Ok(Net { id, ..net })
    }

    async fn end_net(&self, net_id: u32, end_time_unix_ms: i64) -> Result<(), RepositoryError> {
        let conn = self.lock();
        conn.execute(
            "UPDATE nets SET active = 0, end_time_unix_ms = ?2 WHERE id = ?1",
            params![net_id, end_time_unix_ms],
        )
        .map_err(SqliteError::from)?;
        Ok(())
    }

    async fn update_scheduled_net(&self, sn: ScheduledNet) -> Result<(), RepositoryError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO scheduled_nets (id, talkgroup_id, hour, minute, day_of_week, timezone,
                duration_minutes, enabled, next_run_unix_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET talkgroup_id=excluded.talkgroup_id, hour=excluded.hour,
                minute=excluded.minute, day_of_week=excluded.day_of_week, timezone=excluded.timezone,
                duration_minutes=excluded.duration_minutes, enabled=excluded.enabled,
                next_run_unix_ms=excluded.next_run_unix_ms",
            params![
                sn.id,
                sn.talkgroup_id,
                sn.time_of_day_hh_mm.0,
                sn.time_of_day_hh_mm.1,
                sn.day_of_week,
                sn.timezone,
                sn.duration_minutes,
                sn.enabled as i64,
                sn.next_run_unix_ms,
            ],
        )
        .map_err(SqliteError::from)?;
        Ok(())
    }

    async fn update_net_showcase(&self, net_id: u32, showcase: bool) -> Result<(), RepositoryError> {
        let conn = self.lock();
        conn.execute(
            "UPDATE nets SET showcase = ?2 WHERE id = ?1",
            params![net_id, showcase as i64],
        )
        .map_err(SqliteError::from)?;
        Ok(())
    }

    async fn find_active_nets_past_duration(&self, now_unix_ms: i64) -> Result<Vec<Net>, RepositoryError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT * FROM nets WHERE active = 1 AND duration_minutes IS NOT NULL
                 AND duration_minutes > 0
                 AND (start_time_unix_ms + duration_minutes * 60000) < ?1",
            )
            .map_err(SqliteError::from)?;
        let rows = stmt
            .query_map(params![now_unix_ms], Self::row_to_net)
            .map_err(SqliteError::from)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(SqliteError::from)?);
        }
        Ok(out)
    }

    async fn upsert_call(&self, call: Call) -> Result<(), RepositoryError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO calls (stream_id, user_id, repeater_id, start_time_unix_ms,
                last_packet_time_unix_ms, duration_ms, slot, group_call, destination_kind,
                destination_id, ber, rssi, jitter_ms, loss, active)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)
             ON CONFLICT(stream_id) DO UPDATE SET
                last_packet_time_unix_ms=excluded.last_packet_time_unix_ms,
                duration_ms=excluded.duration_ms, ber=excluded.ber, rssi=excluded.rssi,
                jitter_ms=excluded.jitter_ms, loss=excluded.loss, active=excluded.active",
            params![
                call.stream_id,
                call.user_id,
                call.repeater_id,
                call.start_time_unix_ms,
                call.last_packet_time_unix_ms,
                call.duration_ms,
                slot_str(call.slot),
                call.group_call as i64,
                destination_kind_str(call.destination_kind),
                call.destination_id,
                call.ber,
                call.rssi,
                call.jitter_ms,
                call.loss,
                call.active as i64,
            ],
        )
        .map_err(SqliteError::from)?;
        Ok(())
    }

    async fn delete_talkgroup_cascade(&self, talkgroup_id: u32) -> Result<Vec<u32>, RepositoryError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT DISTINCT repeater_id FROM repeater_talkgroups WHERE talkgroup_id = ?1")
            .map_err(SqliteError::from)?;
        let affected: Vec<u32> = stmt
            .query_map(params![talkgroup_id], |row| row.get(0))
            .map_err(SqliteError::from)?
            .collect::<Result<_, _>>()
            .map_err(SqliteError::from)?;
        drop(stmt);

        conn.execute(
            "DELETE FROM repeater_talkgroups WHERE talkgroup_id = ?1",
            params![talkgroup_id],
        )
        .map_err(SqliteError::from)?;
        conn.execute("DELETE FROM talkgroups WHERE id = ?1", params![talkgroup_id])
            .map_err(SqliteError::from)?;
        conn.execute(
            "UPDATE repeaters SET ts1_dynamic = NULL WHERE ts1_dynamic = ?1",
            params![talkgroup_id],
        )
        .map_err(SqliteError::from)?;
        conn.execute(
            "UPDATE repeaters SET ts2_dynamic = NULL WHERE ts2_dynamic = ?1",
            params![talkgroup_id],
        )
        .map_err(SqliteError::from)?;

        Ok(affected)
    }
}

// Referenced only to keep the `Peer` type's presence in scope documented:
// peer storage is intentionally out of this narrow repository surface
// (spec section 4.8 lists no Peer query) -- OpenBridge peers are held by
// the Hub's own registry, loaded from static configuration at startup.
#[allow(dead_code)]
type _PeerNotPersisted = _UnusedPeerMarker;

#[cfg(test)]
mod tests {
    use super::*;

    fn insert_repeater(db: &SqliteRepository, id: u32, owner: u32) {
        let conn = db.lock();
        conn.execute(
            "INSERT INTO repeaters (id, callsign, owner_user_id, kind, auth_key, ts1_static)
             VALUES (?1, 'W1AW', ?2, 'mmdvm', 'p', '[3100]')",
            params![id, owner],
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_find_repeater_by_id_round_trip() {
        let db = SqliteRepository::open_in_memory().unwrap();
        insert_repeater(&db, 2, 1);
        let repeater = db.find_repeater_by_id(2).await.unwrap();
        assert_eq!(repeater.callsign, "W1AW");
        assert_eq!(repeater.kind, RepeaterKind::Mmdvm);
        assert!(repeater.ts1_static.contains(&3100));
    }

    #[tokio::test]
    async fn test_find_repeater_by_id_not_found() {
        let db = SqliteRepository::open_in_memory().unwrap();
        assert!(matches!(
            db.find_repeater_by_id(99).await,
            Err(RepositoryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_repeater_id_exists() {
        let db = SqliteRepository::open_in_memory().unwrap();
        insert_repeater(&db, 2, 1);
        assert!(db.repeater_id_exists(2).await.unwrap());
        assert!(!db.repeater_id_exists(3).await.unwrap());
    }

    #[tokio::test]
    async fn test_create_and_find_active_net() {
        let db = SqliteRepository::open_in_memory().unwrap();
        let net = Net {
            id: 0,
            talkgroup_id: 3100,
            scheduled_net_id: None,
            start_time_unix_ms: 1000,
            end_time_unix_ms: None,
            duration_minutes: Some(60),
            active: true,
            showcase: false,
            started_by_user_id: None,
        };
        let created = db.create_net(net).await.unwrap();
        assert!(created.id > 0);

        let active = db.find_active_net_for_talkgroup(3100).await.unwrap();
        assert!(active.is_some());
    }

    #[tokio::test]
    async fn test_end_net_clears_active() {
        let db = SqliteRepository::open_in_memory().unwrap();
        let net = Net {
            id: 0,
            talkgroup_id: 3100,
            scheduled_net_id: None,
            start_time_unix_ms: 1000,
            end_time_unix_ms: None,
            duration_minutes: Some(60),
            active: true,
            showcase: false,
            started_by_user_id: None,
        };
        let created = db.create_net(net).await.unwrap();
        db.end_net(created.id, 2000).await.unwrap();
        assert!(db.find_active_net_for_talkgroup(3100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_active_nets_past_duration() {
        let db = SqliteRepository::open_in_memory().unwrap();
        let net = Net {
            id: 0,
            talkgroup_id: 3100,
            scheduled_net_id: None,
            start_time_unix_ms: 0,
            end_time_unix_ms: None,
            duration_minutes: Some(1),
            active: true,
            showcase: false,
            started_by_user_id: None,
        };
        db.create_net(net).await.unwrap();
        let overdue = db.find_active_nets_past_duration(120_000).await.unwrap();
        assert_eq!(overdue.len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_call_then_update() {
        let db = SqliteRepository::open_in_memory().unwrap();
        let call = Call {
            stream_id: 42,
            user_id: 7000,
            repeater_id: 2,
            start_time_unix_ms: 1000,
            last_packet_time_unix_ms: 1000,
            duration_ms: 0,
            slot: TimeslotId::Ts1,
            group_call: true,
            destination_kind: CallDestinationKind::Talkgroup,
            destination_id: 3100,
            ber: 0.0,
            rssi: -80.0,
            jitter_ms: 0.0,
            loss: 0.0,
            active: true,
        };
        db.upsert_call(call.clone()).await.unwrap();

        let mut finished = call;
        finished.active = false;
        finished.last_packet_time_unix_ms = 2000;
        finished.duration_ms = 1000;
        db.upsert_call(finished).await.unwrap();

        let calls = db
            .find_talkgroup_calls_in_time_range(3100, 0, 5000)
            .await
            .unwrap();
        assert_eq!(calls.len(), 1);
        assert!(!calls[0].active);
        assert_eq!(calls[0].duration_ms, 1000);
    }

    #[tokio::test]
    async fn test_delete_talkgroup_cascade() {
        let db = SqliteRepository::open_in_memory().unwrap();
        insert_repeater(&db, 2, 1);
        {
            let conn = db.lock();
            conn.execute(
                "INSERT INTO talkgroups (id, name) VALUES (3100, 'Worldwide')",
                [],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO repeater_talkgroups (repeater_id, talkgroup_id, slot, kind)
                 VALUES (2, 3100, 'ts1', 'static')",
                [],
            )
            .unwrap();
        }

        let affected = db.delete_talkgroup_cascade(3100).await.unwrap();
        assert_eq!(affected, vec![2]);
        assert!(!db.talkgroup_id_exists(3100).await.unwrap());
    }
}
