// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! CallTracker (C4): folds a stream of bursts into `Call` records with
//! loss/jitter/BER/RSSI, and finalizes on VoiceTerm or a 1s silence
//! watchdog (spec section 4.6).

use crate::protocol::dmrd::Packet;
use crate::pubsub::{Bus, BusError};
use crate::repository::{Call, CallDestinationKind, Repository, TimeslotId};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Watchdog grace period beyond the last observed burst before a call is
/// finalized as if a VoiceTerm had arrived (spec section 4.6).
pub const WATCHDOG_GRACE: Duration = Duration::from_secs(1);

/// Single-pole IIR jitter filter horizon, targeting the expected 60 ms
/// inter-burst gap (spec section 4.6). Documented as an implementation
/// opinion, not a specified DMR metric (spec section 9, open questions) --
/// matched bit-for-bit here since no conflicting compatibility requirement
/// overrides it.
const JITTER_HORIZON: f64 = 16.0;
const EXPECTED_GAP_MS: f64 = 60.0;

/// In-flight fold state for one StreamID.
struct CallState {
    user_id: u32,
    repeater_id: u32,
    slot: TimeslotId,
    group_call: bool,
    destination_kind: CallDestinationKind,
    destination_id: u32,
    start_time: Instant,
    start_time_unix_ms: i64,
    last_packet_time: Instant,
    last_packet_time_unix_ms: i64,
    first_seq: u8,
    last_seq: u8,
    seen_bursts: u64,
    ber_sum: f64,
    ber_count: u64,
    rssi_sum: f64,
    rssi_count: u64,
    jitter_ms: f64,
}

impl CallState {
    fn new(now: Instant, now_unix_ms: i64, packet: &Packet, user_id: u32) -> Self {
        let slot = match packet.slot {
            crate::protocol::dmrd::Slot::Ts1 => TimeslotId::Ts1,
            crate::protocol::dmrd::Slot::Ts2 => TimeslotId::Ts2,
        };
        let mut state = CallState {
            user_id,
            repeater_id: packet.repeater_id,
            slot,
            group_call: packet.group_call,
            destination_kind: if packet.group_call {
                CallDestinationKind::Talkgroup
            } else {
                CallDestinationKind::User
            },
            destination_id: packet.dst,
            start_time: now,
            start_time_unix_ms: now_unix_ms,
            last_packet_time: now,
            last_packet_time_unix_ms: now_unix_ms,
            first_seq: packet.seq,
            last_seq: packet.seq,
            seen_bursts: 1,
            ber_sum: 0.0,
            ber_count: 0,
            rssi_sum: 0.0,
            rssi_count: 0,
            jitter_ms: 0.0,
        };
        state.accumulate_quality(packet);
        state
    }

    fn accumulate_quality(&mut self, packet: &Packet) {
        if let Some(ber) = packet.ber {
            self.ber_sum += ber as f64;
            self.ber_count += 1;
        }
        if let Some(rssi) = packet.rssi {
            self.rssi_sum += rssi as f64;
            self.rssi_count += 1;
        }
    }

    fn observe(&mut self, now: Instant, now_unix_ms: i64, packet: &Packet) {
        let gap_ms = now.duration_since(self.last_packet_time).as_secs_f64() * 1000.0;
        self.jitter_ms += ((gap_ms - EXPECTED_GAP_MS).abs() - self.jitter_ms) / JITTER_HORIZON;

        self.accumulate_quality(packet);
        self.last_seq = packet.seq;
        self.last_packet_time = now;
        self.last_packet_time_unix_ms = now_unix_ms;
        self.seen_bursts += 1;
    }

    fn mean_ber(&self) -> f64 {
        if self.ber_count == 0 {
            0.0
        } else {
            self.ber_sum / self.ber_count as f64
        }
    }

    fn mean_rssi(&self) -> f64 {
        if self.rssi_count == 0 {
            0.0
        } else {
            self.rssi_sum / self.rssi_count as f64
        }
    }

    fn expected_bursts(&self) -> u64 {
        (self.last_seq.wrapping_sub(self.first_seq)) as u64 + 1
    }

    fn loss(&self) -> f64 {
        let expected = self.expected_bursts();
        if expected == 0 {
            0.0
        } else {
            1.0 - (self.seen_bursts as f64 / expected as f64)
        }
    }

    fn to_call(&self, active: bool) -> Call {
        Call {
            stream_id: 0, // filled in by the caller, which holds the map key
            user_id: self.user_id,
            repeater_id: self.repeater_id,
            start_time_unix_ms: self.start_time_unix_ms,
            last_packet_time_unix_ms: self.last_packet_time_unix_ms,
            duration_ms: self.last_packet_time_unix_ms - self.start_time_unix_ms,
            slot: self.slot,
            group_call: self.group_call,
            destination_kind: self.destination_kind,
            destination_id: self.destination_id,
            ber: self.mean_ber(),
            rssi: self.mean_rssi(),
            jitter_ms: self.jitter_ms,
            loss: self.loss(),
            active,
        }
    }
}

/// JSON event published on `calls:public` / `calls:<ownerUserID>` (spec
/// section 6.2).
#[derive(Debug, Clone, Serialize)]
pub struct WsCallResponse {
    pub stream_id: u32,
    pub call: CallSummary,
}

/// Wire-friendly subset of `Call` (mirrors the reference's `WSCallResponse`
/// DTO, which does not reuse the storage row verbatim).
#[derive(Debug, Clone, Serialize)]
pub struct CallSummary {
    pub user_id: u32,
    pub repeater_id: u32,
    pub duration_ms: i64,
    pub destination_id: u32,
    pub group_call: bool,
    pub ber: f64,
    pub rssi: f64,
    pub jitter_ms: f64,
    pub loss: f64,
    pub active: bool,
}

impl From<&Call> for CallSummary {
    fn from(call: &Call) -> Self {
        CallSummary {
            user_id: call.user_id,
            repeater_id: call.repeater_id,
            duration_ms: call.duration_ms,
            destination_id: call.destination_id,
            group_call: call.group_call,
            ber: call.ber,
            rssi: call.rssi,
            jitter_ms: call.jitter_ms,
            loss: call.loss,
            active: call.active,
        }
    }
}

/// Folds the `calls:ingest` burst stream into `Call` rows (spec section 4.6).
///
/// One fold task per StreamID is guaranteed by construction: `ingest` only
/// ever mutates the entry for its own stream id, and finalization removes
/// it from the map, so there is no cross-stream contention (spec section 3,
/// "Call objects in flight are single-writer").
pub struct CallTracker<R: Repository> {
    repository: Arc<R>,
    bus: Arc<dyn Bus>,
    owner_lookup: Arc<dyn Fn(u32) -> Option<u32> + Send + Sync>,
    calls: DashMap<u32, Arc<Mutex<CallState>>>,
    watchdogs: DashMap<u32, mpsc::Sender<()>>,
}

impl<R: Repository + 'static> CallTracker<R> {
    pub fn new(
        repository: Arc<R>,
        bus: Arc<dyn Bus>,
        owner_lookup: Arc<dyn Fn(u32) -> Option<u32> + Send + Sync>,
    ) -> Self {
        Self {
            repository,
            bus,
            owner_lookup,
            calls: DashMap::new(),
            watchdogs: DashMap::new(),
        }
    }

    /// Fold one burst into its stream's state, creating or finalizing as
    /// needed (spec section 4.6).
    pub async fn ingest(self: &Arc<Self>, packet: Packet, user_id: u32, now_unix_ms: i64) {
        let now = Instant::now();
        let stream_id = packet.stream_id;

        let mut is_new = false;
        let state_arc = match self.calls.get(&stream_id) {
            Some(existing) => existing.clone(),
            None => {
                let created = Arc::new(Mutex::new(CallState::new(now, now_unix_ms, &packet, user_id)));
                // Racing inserts for the same fresh StreamID are harmless:
                // `entry` resolves them to a single winner and only its
                // creation counts as `is_new`.
                let winner = self
                    .calls
                    .entry(stream_id)
                    .or_insert_with(|| created.clone())
                    .clone();
                is_new = Arc::ptr_eq(&winner, &created);
                winner
            }
        };

        if !is_new {
            state_arc.lock().await.observe(now, now_unix_ms, &packet);
        }

        if is_new {
            let call = state_arc.lock().await.to_call(true);
            self.persist_active(stream_id, call).await;
        }

        self.rearm_watchdog(stream_id);

        if packet.is_voice_term() {
            self.finalize(stream_id).await;
        }
    }

    async fn persist_active(&self, stream_id: u32, mut call: Call) {
        call.stream_id = stream_id;
        if let Err(err) = self.repository.upsert_call(call).await {
            warn!(stream_id, %err, "failed to persist new call row");
        }
    }

    fn rearm_watchdog(self: &Arc<Self>, stream_id: u32) {
        let (tx, mut rx) = mpsc::channel(1);
        self.watchdogs.insert(stream_id, tx);

        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = rx.recv() => return, // re-armed or finalized elsewhere
                    _ = tokio::time::sleep(WATCHDOG_GRACE) => {
                        debug!(stream_id, "watchdog firing, no terminator seen");
                        tracker.finalize(stream_id).await;
                        return;
                    }
                }
            }
        });
    }

    /// Finalize a stream: compute loss, mark inactive, persist, publish.
    pub async fn finalize(&self, stream_id: u32) {
        let Some((_, state_arc)) = self.calls.remove(&stream_id) else {
            return; // already finalized by a racing watchdog/VoiceTerm
        };
        self.watchdogs.remove(&stream_id);

        let call = state_arc.lock().await.to_call(false);
        let mut call = call;
        call.stream_id = stream_id;

        if let Err(err) = self.repository.upsert_call(call.clone()).await {
            warn!(stream_id, %err, "failed to persist finalized call row");
        }

        self.publish_finalized(stream_id, &call).await;
    }

    async fn publish_finalized(&self, stream_id: u32, call: &Call) {
        let event = WsCallResponse {
            stream_id,
            call: CallSummary::from(call),
        };
        let payload = match serde_json::to_vec(&event) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(stream_id, %err, "failed to encode WSCallResponse");
                return;
            }
        };

        let _: Result<(), BusError> = self.bus.publish("calls:public", payload.clone()).await;
        if let Some(owner) = (self.owner_lookup)(call.repeater_id) {
            let _: Result<(), BusError> = self
                .bus
                .publish(&format!("calls:{}", owner), payload)
                .await;
        }
    }

    /// Number of calls currently in flight (used by tests and metrics).
    pub fn active_count(&self) -> usize {
        self.calls.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::dmrd::{FrameType, Slot, DTYPE_VOICE_TERM};
    use crate::repository::{Net, RepositoryError, ScheduledNet, User};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeRepository {
        upserts: AtomicUsize,
    }

    #[async_trait]
    impl Repository for FakeRepository {
        async fn find_repeater_by_id(
            &self,
            _id: u32,
        ) -> Result<crate::repository::Repeater, RepositoryError> {
            Err(RepositoryError::NotFound)
        }
        async fn repeater_id_exists(&self, _id: u32) -> Result<bool, RepositoryError> {
            Ok(true)
        }
        async fn get_user_repeaters(
            &self,
            _user_id: u32,
        ) -> Result<Vec<crate::repository::Repeater>, RepositoryError> {
            Ok(vec![])
        }
        async fn find_user_by_id(&self, id: u32) -> Result<User, RepositoryError> {
            Ok(User {
                id,
                callsign: "TEST".into(),
            })
        }
        async fn talkgroup_id_exists(&self, _id: u32) -> Result<bool, RepositoryError> {
            Ok(true)
        }
        async fn find_active_net_for_talkgroup(
            &self,
            _talkgroup_id: u32,
        ) -> Result<Option<Net>, RepositoryError> {
            Ok(None)
        }
        async fn find_talkgroup_calls_in_time_range(
            &self,
            _talkgroup_id: u32,
            _start_unix_ms: i64,
            _end_unix_ms: i64,
        ) -> Result<Vec<Call>, RepositoryError> {
            Ok(vec![])
        }
        async fn create_net(&self, net: Net) -> Result<Net, RepositoryError> {
            Ok(net)
        }
        async fn end_net(&self, _net_id: u32, _end_time_unix_ms: i64) -> Result<(), RepositoryError> {
            Ok(())
        }
        async fn update_scheduled_net(&self, _sn: ScheduledNet) -> Result<(), RepositoryError> {
            Ok(())
        }
        async fn update_net_showcase(
            &self,
            _net_id: u32,
            _showcase: bool,
        ) -> Result<(), RepositoryError> {
            Ok(())
        }
        async fn find_active_nets_past_duration(
            &self,
            _now_unix_ms: i64,
        ) -> Result<Vec<Net>, RepositoryError> {
            Ok(vec![])
        }
        async fn upsert_call(&self, _call: Call) -> Result<(), RepositoryError> {
            self.upserts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn delete_talkgroup_cascade(&self, _talkgroup_id: u32) -> Result<Vec<u32>, RepositoryError> {
            Ok(vec![])
        }
    }

    fn packet(seq: u8, stream_id: u32, dtype_or_vseq: u8, frame_type: FrameType) -> Packet {
        Packet {
            seq,
            src: 7000,
            dst: 3100,
            repeater_id: 2,
            slot: Slot::Ts1,
            group_call: true,
            frame_type,
            dtype_or_vseq,
            stream_id,
            payload: [0u8; 33],
            ber: Some(2),
            rssi: Some(-80),
        }
    }

    #[tokio::test]
    async fn test_voice_term_finalizes_call() {
        let repository = Arc::new(FakeRepository {
            upserts: AtomicUsize::new(0),
        });
        let bus = Arc::new(crate::pubsub::InMemoryBus::new());
        let mut public_sub = bus.subscribe("calls:public").await;
        let tracker = Arc::new(CallTracker::new(
            repository.clone(),
            bus,
            Arc::new(|_| None),
        ));

        tracker
            .ingest(packet(1, 42, 0, FrameType::Voice), 1, 1_000)
            .await;
        assert_eq!(tracker.active_count(), 1);

        tracker
            .ingest(
                packet(5, 42, DTYPE_VOICE_TERM, FrameType::DataSync),
                1,
                1_300,
            )
            .await;
        assert_eq!(tracker.active_count(), 0);

        let msg = public_sub.receiver.recv().await.unwrap();
        let event: serde_json::Value = serde_json::from_slice(&msg).unwrap();
        assert_eq!(event["stream_id"], 42);
        assert_eq!(event["call"]["active"], false);
    }

    #[tokio::test]
    async fn test_loss_computation() {
        let repository = Arc::new(FakeRepository {
            upserts: AtomicUsize::new(0),
        });
        let bus = Arc::new(crate::pubsub::InMemoryBus::new());
        let tracker = Arc::new(CallTracker::new(repository, bus, Arc::new(|_| None)));

        // seq 1..=5 but burst 3 is lost: 4 seen, 5 expected => loss = 0.2
        for seq in [1u8, 2, 4, 5] {
            let is_term = seq == 5;
            let frame_type = if is_term {
                FrameType::DataSync
            } else {
                FrameType::Voice
            };
            let dtype = if is_term { DTYPE_VOICE_TERM } else { 0 };
            tracker
                .ingest(packet(seq, 99, dtype, frame_type), 1, 1_000 + seq as i64)
                .await;
        }
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn test_watchdog_finalizes_silent_stream() {
        let repository = Arc::new(FakeRepository {
            upserts: AtomicUsize::new(0),
        });
        let bus = Arc::new(crate::pubsub::InMemoryBus::new());
        let tracker = Arc::new(CallTracker::new(repository, bus, Arc::new(|_| None)));

        tracker
            .ingest(packet(1, 7, 0, FrameType::Voice), 1, 1_000)
            .await;
        assert_eq!(tracker.active_count(), 1);

        tokio::time::sleep(WATCHDOG_GRACE + Duration::from_millis(200)).await;
        assert_eq!(tracker.active_count(), 0);
    }
}
