// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Hub (C8): owns one actor per authenticated repeater, dispatches
//! inbound bursts according to the routing rules, and delivers outbound
//! frames to the owning transport (spec section 4.5).
//!
//! Each repeater is modeled as an actor: its FSM and subscription state
//! mutate only from tasks spawned for that repeater, so there are no locks
//! on the hot path beyond the `DashMap` entries used to look an actor up
//! (spec section 9, "per-repeater concurrency").

pub mod transport;

use crate::calltracker::{CallSummary, CallTracker, WsCallResponse};
use crate::config::{Config, PARROT_BURST_INTERVAL, PARROT_TALKGROUP_ID};
use crate::kv::KvStore;
use crate::protocol::dmrd::{Packet, Slot};
use crate::pubsub::Bus;
use crate::repository::{Peer, PeerRuleDirection, Repeater, Repository, TimeslotId};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use transport::{Transport, TransportKind};

fn to_timeslot(slot: Slot) -> TimeslotId {
    match slot {
        Slot::Ts1 => TimeslotId::Ts1,
        Slot::Ts2 => TimeslotId::Ts2,
    }
}

fn dynamic_kv_key(slot: TimeslotId, repeater_id: u32) -> String {
    let slot_num = match slot {
        TimeslotId::Ts1 => 1,
        TimeslotId::Ts2 => 2,
    };
    format!("dynamic:ts{}:{}", slot_num, repeater_id)
}

fn lastheard_kv_key(user_id: u32) -> String {
    format!("lastheard:user:{}", user_id)
}

/// Locally cached routing state for one connected repeater (spec section 3:
/// "Subscription. A pair (topic, channel) held by the Hub per repeater x
/// slot"). Refreshed on `ReloadRepeater`.
pub struct RepeaterActorState {
    pub id: u32,
    pub owner_user_id: u32,
    pub static_ts1: Vec<u32>,
    pub static_ts2: Vec<u32>,
    pub dynamic_ts1: RwLock<Option<u32>>,
    pub dynamic_ts2: RwLock<Option<u32>>,
    pub simplex_repeater: bool,
    pub transport_kind: TransportKind,
    inbound_task: RwLock<Option<JoinHandle<()>>>,
    outbound_task: RwLock<Option<JoinHandle<()>>>,
}

impl RepeaterActorState {
    fn from_row(repeater: &Repeater, transport_kind: TransportKind) -> Self {
        Self {
            id: repeater.id,
            owner_user_id: repeater.owner_user_id,
            static_ts1: repeater.ts1_static.iter().copied().collect(),
            static_ts2: repeater.ts2_static.iter().copied().collect(),
            dynamic_ts1: RwLock::new(repeater.ts1_dynamic),
            dynamic_ts2: RwLock::new(repeater.ts2_dynamic),
            simplex_repeater: repeater.simplex_repeater,
            transport_kind,
            inbound_task: RwLock::new(None),
            outbound_task: RwLock::new(None),
        }
    }

    fn static_talkgroups(&self, slot: TimeslotId) -> &[u32] {
        match slot {
            TimeslotId::Ts1 => &self.static_ts1,
            TimeslotId::Ts2 => &self.static_ts2,
        }
    }

    async fn dynamic(&self, slot: TimeslotId) -> Option<u32> {
        match slot {
            TimeslotId::Ts1 => *self.dynamic_ts1.read().await,
            TimeslotId::Ts2 => *self.dynamic_ts2.read().await,
        }
    }

    async fn set_dynamic(&self, slot: TimeslotId, tg: Option<u32>) {
        match slot {
            TimeslotId::Ts1 => *self.dynamic_ts1.write().await = tg,
            TimeslotId::Ts2 => *self.dynamic_ts2.write().await = tg,
        }
    }
}

/// "Live call" event published on every voice burst (spec section 4.5 item
/// 6), distinct from the CallTracker's end-of-call `WSCallResponse`.
#[derive(Debug, Clone, Serialize)]
struct LiveCallEvent {
    repeater_id: u32,
    src: u32,
    dst: u32,
    group_call: bool,
    stream_id: u32,
}

/// Runtime metrics snapshot, the ambient substitute for an external metrics
/// crate (spec section 7 error-kind 1: "silent drop, counter increment").
#[derive(Debug, Default, Serialize)]
pub struct HubStats {
    pub inbound_dropped_self_loop: u64,
    pub inbound_dropped_no_route: u64,
    pub parrot_streams_played: u64,
    pub group_calls_routed: u64,
    pub private_calls_routed: u64,
    pub private_calls_undeliverable: u64,
    pub openbridge_hmac_fail: u64,
    pub malformed_packets_dropped: u64,
}

#[derive(Default)]
struct AtomicHubStats {
    inbound_dropped_self_loop: AtomicU64,
    inbound_dropped_no_route: AtomicU64,
    parrot_streams_played: AtomicU64,
    group_calls_routed: AtomicU64,
    private_calls_routed: AtomicU64,
    private_calls_undeliverable: AtomicU64,
    openbridge_hmac_fail: AtomicU64,
    malformed_packets_dropped: AtomicU64,
}

impl AtomicHubStats {
    fn snapshot(&self) -> HubStats {
        HubStats {
            inbound_dropped_self_loop: self.inbound_dropped_self_loop.load(Ordering::Relaxed),
            inbound_dropped_no_route: self.inbound_dropped_no_route.load(Ordering::Relaxed),
            parrot_streams_played: self.parrot_streams_played.load(Ordering::Relaxed),
            group_calls_routed: self.group_calls_routed.load(Ordering::Relaxed),
            private_calls_routed: self.private_calls_routed.load(Ordering::Relaxed),
            private_calls_undeliverable: self.private_calls_undeliverable.load(Ordering::Relaxed),
            openbridge_hmac_fail: self.openbridge_hmac_fail.load(Ordering::Relaxed),
            malformed_packets_dropped: self.malformed_packets_dropped.load(Ordering::Relaxed),
        }
    }
}

struct ParrotBuffer {
    bursts: VecDeque<Packet>,
}

pub struct Hub<R: Repository, K: KvStore> {
    repository: Arc<R>,
    kv: Arc<K>,
    bus: Arc<dyn Bus>,
    calltracker: Arc<CallTracker<R>>,
    config: Arc<Config>,
    repeaters: DashMap<u32, Arc<RepeaterActorState>>,
    peers: DashMap<u32, Peer>,
    transports: DashMap<TransportKind, Arc<dyn Transport>>,
    parrot_buffers: DashMap<u32, tokio::sync::Mutex<ParrotBuffer>>,
    stats: AtomicHubStats,
    stopping: AtomicBool,
}

impl<R: Repository + 'static, K: KvStore + 'static> Hub<R, K> {
    pub fn new(
        repository: Arc<R>,
        kv: Arc<K>,
        bus: Arc<dyn Bus>,
        calltracker: Arc<CallTracker<R>>,
        config: Arc<Config>,
    ) -> Arc<Self> {
        Arc::new(Self {
            repository,
            kv,
            bus,
            calltracker,
            config,
            repeaters: DashMap::new(),
            peers: DashMap::new(),
            transports: DashMap::new(),
            parrot_buffers: DashMap::new(),
            stats: AtomicHubStats::default(),
            stopping: AtomicBool::new(false),
        })
    }

    pub fn register_transport(&self, kind: TransportKind, transport: Arc<dyn Transport>) {
        self.transports.insert(kind, transport);
    }

    /// Register or refresh an OpenBridge peer's routing rules. Peers have
    /// no connection FSM (spec section 3), so there is no actor to spawn.
    pub fn register_peer(&self, peer: Peer) {
        self.peers.insert(peer.id, peer);
    }

    pub fn unregister_peer(&self, peer_id: u32) {
        self.peers.remove(&peer_id);
    }

    pub fn stats(&self) -> HubStats {
        self.stats.snapshot()
    }

    /// Record an OpenBridge frame dropped for failing HMAC verification
    /// (spec section 8 scenario 6: "an internal counter
    /// `openbridge_hmac_fail` increments by 1").
    pub fn record_openbridge_hmac_fail(&self) {
        self.stats.openbridge_hmac_fail.fetch_add(1, Ordering::Relaxed);
    }

    /// Record any other frame dropped for being malformed (bad signature,
    /// short buffer, failed control-frame parse; spec section 7 kind 1).
    pub fn record_malformed_packet(&self) {
        self.stats.malformed_packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// `ReloadRepeater` (spec section 4.2): re-reads TG assignments from
    /// the repository and (re)spawns the repeater's actor tasks. Called on
    /// successful HBRP/IPSC authentication.
    pub async fn reload_repeater(self: &Arc<Self>, repeater_id: u32, transport_kind: TransportKind) {
        let repeater = match self.repository.find_repeater_by_id(repeater_id).await {
            Ok(repeater) => repeater,
            Err(err) => {
                warn!(repeater_id, %err, "ReloadRepeater: repository lookup failed");
                return;
            }
        };

        self.stop_repeater_actor(repeater_id).await;

        let state = Arc::new(RepeaterActorState::from_row(&repeater, transport_kind));
        self.repeaters.insert(repeater_id, state.clone());
        self.spawn_actor_tasks(repeater_id, state).await;
        info!(repeater_id, "repeater actor (re)loaded");
    }

    /// Drop a repeater's actor and cancel its subscription tasks, e.g. on
    /// disconnect or when another replica takes ownership (spec section
    /// 4.5, "Concurrency guarantee").
    pub async fn stop_repeater_actor(&self, repeater_id: u32) {
        if let Some((_, state)) = self.repeaters.remove(&repeater_id) {
            if let Some(handle) = state.inbound_task.write().await.take() {
                handle.abort();
            }
            if let Some(handle) = state.outbound_task.write().await.take() {
                handle.abort();
            }
        }
        self.parrot_buffers.remove(&repeater_id);
    }

    async fn spawn_actor_tasks(self: &Arc<Self>, repeater_id: u32, state: Arc<RepeaterActorState>) {
        let hub = Arc::clone(self);
        let inbound_state = Arc::clone(&state);
        let inbound_task = tokio::spawn(async move {
            let mut sub = hub
                .bus
                .subscribe(&format!("packets:{}:inbound", repeater_id))
                .await;
            loop {
                match sub.receiver.recv().await {
                    Ok(bytes) => {
                        if let Some(packet) = Packet::decode(&bytes) {
                            hub.route_inbound(repeater_id, packet).await;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(repeater_id, skipped = n, "inbound subscriber lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            let _ = &inbound_state;
        });

        let hub = Arc::clone(self);
        let outbound_task = tokio::spawn(async move {
            let mut outbound_sub = hub
                .bus
                .subscribe(&format!("packets:{}:outbound", repeater_id))
                .await;
            let mut disconnect_sub = hub
                .bus
                .subscribe(&format!("control:{}:disconnect", repeater_id))
                .await;
            loop {
                tokio::select! {
                    frame = outbound_sub.receiver.recv() => {
                        match frame {
                            Ok(bytes) => hub.deliver_outbound(repeater_id, bytes).await,
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                warn!(repeater_id, skipped = n, "outbound subscriber lagged");
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    signal = disconnect_sub.receiver.recv() => {
                        if signal.is_ok() {
                            info!(repeater_id, "disconnect signal received, stopping actor");
                            hub.stop_repeater_actor(repeater_id).await;
                            break;
                        }
                    }
                }
            }
        });

        *state.inbound_task.write().await = Some(inbound_task);
        *state.outbound_task.write().await = Some(outbound_task);
    }

    async fn deliver_outbound(&self, repeater_id: u32, bytes: Vec<u8>) {
        let Some(state) = self.repeaters.get(&repeater_id).map(|e| e.clone()) else {
            return;
        };
        let Some(transport) = self.transports.get(&state.transport_kind).map(|e| e.clone()) else {
            warn!(repeater_id, "no transport registered for kind");
            return;
        };
        if let Err(err) = transport.send_to(repeater_id, bytes).await {
            warn!(repeater_id, %err, "outbound delivery failed");
        }
    }

    /// Acquire exclusive ownership of `repeater_id`'s session across
    /// replicas (spec section 4.5, "Concurrency guarantee"). Returns
    /// `true` if this replica now owns the session.
    pub async fn claim_session(&self, repeater_id: u32) -> bool {
        let key = format!("dmrhub:repeater:session:{}", repeater_id);
        match self
            .kv
            .set_nx(&key, b"1".to_vec(), crate::config::REPEATER_SESSION_LOCK_TTL)
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                // Another replica holds it; ask it to step down.
                let _ = self
                    .bus
                    .publish(&format!("control:{}:disconnect", repeater_id), vec![])
                    .await;
                // Re-attempt once the old holder's lock naturally lapses is
                // the remote-replica's job; locally we proceed only once we
                // actually hold the lock, so callers should retry.
                false
            }
            Err(err) => {
                warn!(repeater_id, %err, "session claim failed");
                false
            }
        }
    }

    pub async fn release_session(&self, repeater_id: u32) {
        let key = format!("dmrhub:repeater:session:{}", repeater_id);
        let _ = self.kv.del(&key).await;
    }

    /// Inbound routing algorithm (spec section 4.5, steps 1-6).
    async fn route_inbound(self: &Arc<Self>, repeater_id: u32, packet: Packet) {
        if packet.repeater_id != repeater_id {
            self.stats.inbound_dropped_self_loop.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if packet.dst == PARROT_TALKGROUP_ID {
            self.handle_parrot(repeater_id, packet).await;
            return;
        }

        if packet.group_call {
            self.route_group_call(repeater_id, &packet).await;
        } else {
            self.route_private_call(repeater_id, &packet).await;
        }

        self.calltracker
            .ingest(packet.clone(), packet.src, crate::now_unix_ms())
            .await;

        self.update_last_heard(&packet).await;
    }

    async fn handle_parrot(self: &Arc<Self>, repeater_id: u32, packet: Packet) {
        let is_term = packet.is_voice_term();
        let stream_id = packet.stream_id;

        {
            let entry = self.parrot_buffers.entry(stream_id).or_insert_with(|| {
                tokio::sync::Mutex::new(ParrotBuffer {
                    bursts: VecDeque::new(),
                })
            });
            let mut buffer = entry.lock().await;
            if buffer.bursts.len() >= self.config.max_parrot_bursts {
                buffer.bursts.pop_front(); // overflow drops oldest (spec section 5)
            }
            buffer.bursts.push_back(packet.clone());
        }

        if !is_term {
            return;
        }

        let Some((_, buffer)) = self.parrot_buffers.remove(&stream_id) else {
            return;
        };
        let bursts = buffer.into_inner().bursts;
        let source = packet.src;

        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let burst_count = bursts.len();
            for burst in bursts {
                let echoed = burst.rewritten(repeater_id, PARROT_TALKGROUP_ID, source);
                let _ = hub
                    .bus
                    .publish(&format!("packets:{}:outbound", repeater_id), echoed.encode())
                    .await;
                tokio::time::sleep(PARROT_BURST_INTERVAL).await;
            }
            hub.stats.parrot_streams_played.fetch_add(1, Ordering::Relaxed);
            debug!(stream_id, repeater_id, "parrot playback complete");
            hub.publish_parrot_call_ended(repeater_id, stream_id, burst_count)
                .await;
        });
    }

    /// Publish the "call ended" event Parrot fabricates itself instead of
    /// routing through the CallTracker (spec section 4.5 item 2: "Publish a
    /// 'call ended' event from CallTracker"; section 8 scenario 3: "a
    /// `calls:public` event is published").
    async fn publish_parrot_call_ended(&self, repeater_id: u32, stream_id: u32, burst_count: usize) {
        let owner_user_id = self
            .repeaters
            .get(&repeater_id)
            .map(|e| e.owner_user_id)
            .unwrap_or(0);
        let duration_ms = (burst_count as i64) * (PARROT_BURST_INTERVAL.as_millis() as i64);
        let event = WsCallResponse {
            stream_id,
            call: CallSummary {
                user_id: owner_user_id,
                repeater_id,
                duration_ms,
                destination_id: PARROT_TALKGROUP_ID,
                group_call: true,
                ber: 0.0,
                rssi: 0.0,
                jitter_ms: 0.0,
                loss: 0.0,
                active: false,
            },
        };
        let payload = match serde_json::to_vec(&event) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(stream_id, %err, "failed to encode parrot WSCallResponse");
                return;
            }
        };
        let _ = self.bus.publish("calls:public", payload.clone()).await;
        if owner_user_id != 0 {
            let _ = self
                .bus
                .publish(&format!("calls:{}", owner_user_id), payload)
                .await;
        }
    }

    async fn route_group_call(&self, origin_repeater_id: u32, packet: &Packet) {
        let talkgroup = packet.dst;
        let slot = to_timeslot(packet.slot);

        for entry in self.repeaters.iter() {
            let target = entry.value();
            if target.id == origin_repeater_id {
                continue;
            }
            if self.routes_talkgroup(target, slot, talkgroup).await {
                let rewritten = packet.rewritten(target.id, packet.src, packet.dst);
                let _ = self
                    .bus
                    .publish(&format!("packets:{}:outbound", target.id), rewritten.encode())
                    .await;
                self.stats.group_calls_routed.fetch_add(1, Ordering::Relaxed);
            }
        }

        for entry in self.peers.iter() {
            let peer = entry.value();
            if peer.id == origin_repeater_id {
                continue;
            }
            if peer.admits(PeerRuleDirection::Egress, talkgroup) {
                if let Some(transport) = self.transports.get(&TransportKind::OpenBridge) {
                    let rewritten = packet.rewritten(peer.id, packet.src, packet.dst);
                    if let Err(err) = transport.send_to(peer.id, rewritten.encode()).await {
                        warn!(peer_id = peer.id, %err, "OpenBridge egress delivery failed");
                    } else {
                        self.stats.group_calls_routed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }

        self.maybe_assign_dynamic(origin_repeater_id, slot, talkgroup).await;
    }

    async fn routes_talkgroup(&self, actor: &RepeaterActorState, slot: TimeslotId, tg: u32) -> bool {
        if actor.static_talkgroups(slot).contains(&tg) {
            return true;
        }
        if self.effective_dynamic(actor, slot).await == Some(tg) {
            return true;
        }
        if actor.simplex_repeater {
            let other = match slot {
                TimeslotId::Ts1 => TimeslotId::Ts2,
                TimeslotId::Ts2 => TimeslotId::Ts1,
            };
            if self.effective_dynamic(actor, other).await == Some(tg) {
                return true;
            }
        }
        false
    }

    /// Reads the dynamic assignment, clearing the local cache if its KV
    /// sliding-TTL entry has lapsed (spec section 4.5 item 3: "Dynamic TGs
    /// decay after `dynamic_ttl`... tracked via KV").
    async fn effective_dynamic(&self, actor: &RepeaterActorState, slot: TimeslotId) -> Option<u32> {
        let cached = actor.dynamic(slot).await?;
        match self.kv.get(&dynamic_kv_key(slot, actor.id)).await {
            Ok(Some(_)) => Some(cached),
            _ => {
                actor.set_dynamic(slot, None).await;
                None
            }
        }
    }

    async fn maybe_assign_dynamic(&self, repeater_id: u32, slot: TimeslotId, talkgroup: u32) {
        let Some(actor) = self.repeaters.get(&repeater_id).map(|e| e.clone()) else {
            return;
        };
        if actor.static_talkgroups(slot).contains(&talkgroup) {
            return;
        }

        let current = self.effective_dynamic(&actor, slot).await;
        if current.is_none() || current == Some(talkgroup) {
            actor.set_dynamic(slot, Some(talkgroup)).await;
            let _ = self
                .kv
                .set(
                    &dynamic_kv_key(slot, repeater_id),
                    talkgroup.to_be_bytes().to_vec(),
                    Some(self.config.dynamic_ttl()),
                )
                .await;
        }
    }

    async fn route_private_call(&self, _origin_repeater_id: u32, packet: &Packet) {
        let key = lastheard_kv_key(packet.dst);
        let last_heard = match self.kv.get(&key).await {
            Ok(Some(bytes)) if bytes.len() == 4 => {
                Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            }
            _ => None,
        };

        match last_heard {
            Some(target_repeater) => {
                let rewritten = packet.rewritten(target_repeater, packet.src, packet.dst);
                let _ = self
                    .bus
                    .publish(
                        &format!("packets:{}:outbound", target_repeater),
                        rewritten.encode(),
                    )
                    .await;
                self.stats.private_calls_routed.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.stats
                    .private_calls_undeliverable
                    .fetch_add(1, Ordering::Relaxed);
                debug!(dst = packet.dst, "private call has no last-heard repeater, discarding");
            }
        }
    }

    async fn update_last_heard(&self, packet: &Packet) {
        let _ = self
            .kv
            .set(
                &lastheard_kv_key(packet.src),
                packet.repeater_id.to_be_bytes().to_vec(),
                Some(crate::config::LASTHEARD_TTL),
            )
            .await;

        let owner = self.repeaters.get(&packet.repeater_id).map(|e| e.owner_user_id);
        let event = LiveCallEvent {
            repeater_id: packet.repeater_id,
            src: packet.src,
            dst: packet.dst,
            group_call: packet.group_call,
            stream_id: packet.stream_id,
        };
        if let Ok(payload) = serde_json::to_vec(&event) {
            let _ = self.bus.publish("calls:public", payload.clone()).await;
            if let Some(owner_id) = owner {
                let _ = self.bus.publish(&format!("calls:{}", owner_id), payload).await;
            }
        }
    }

    /// Inbound OpenBridge frame from a peer (spec section 4.4): ingress-
    /// filtered by the peer's `PeerRules`, then fanned out exactly like a
    /// repeater's group call. Private calls from a peer have no delivery
    /// path in the reference implementation; this preserves that gap
    /// rather than inventing one (spec section 9 open question).
    pub async fn route_openbridge_inbound(self: &Arc<Self>, peer_id: u32, packet: Packet) {
        let Some(peer) = self.peers.get(&peer_id).map(|e| e.clone()) else {
            warn!(peer_id, "OpenBridge inbound from unregistered peer, dropping");
            return;
        };
        if !packet.group_call {
            debug!(peer_id, "OpenBridge private call from peer has no delivery path, dropping");
            return;
        }
        if !peer.admits(PeerRuleDirection::Ingress, packet.src) {
            debug!(peer_id, src = packet.src, "OpenBridge ingress rule denies packet");
            return;
        }

        self.route_group_call(peer_id, &packet).await;
        self.calltracker
            .ingest(packet.clone(), packet.src, crate::now_unix_ms())
            .await;
        self.update_last_heard(&packet).await;
    }

    /// Stop every repeater actor. `Hub.stop()` per spec section 5:
    /// "cancels all and joins".
    pub async fn stop(&self) {
        self.stopping.store(true, Ordering::Relaxed);
        let ids: Vec<u32> = self.repeaters.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.stop_repeater_actor(id).await;
        }
    }
}
