// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP transport for the HBRP (MMDVM/HomeBrew) protocol (spec section 4.2).
//!
//! One socket serves every repeater: HomeBrew multiplexes the ASCII control
//! frames (`RPTL`/`RPTK`/...) and raw `DMRD` voice/data frames on the same
//! port, distinguished by their first four bytes.

use async_trait::async_trait;
use dashmap::DashMap;
use dmrhub_core::engine::transport::{Transport, TransportError, TransportKind};
use dmrhub_core::engine::Hub;
use dmrhub_core::kv::KvStore;
use dmrhub_core::protocol::dmrd::{Packet, DMRD_SIGNATURE};
use dmrhub_core::protocol::hbrp::{parse_config_callsign, ClientFrame, ConnectionState, ServerFrame, Session};
use dmrhub_core::pubsub::Bus;
use dmrhub_core::repository::Repository;
use dmrhub_core::now_unix_ms;
use rand::RngCore;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const MAX_DATAGRAM: usize = 1024;
/// How often the ping/handshake monitor sweeps sessions (spec section 4.2,
/// 5). Mirrors the IPSC transport's `ALIVE_INTERVAL` cadence.
const MONITOR_INTERVAL: Duration = Duration::from_secs(5);

struct RepeaterSession {
    session: Session,
    addr: SocketAddr,
}

pub struct HbrpTransport<R: Repository, K: KvStore> {
    hub: Arc<Hub<R, K>>,
    repository: Arc<R>,
    bus: Arc<dyn Bus>,
    bind_addr: String,
    port: u16,
    ping_timeout: Duration,
    handshake_timeout: Duration,
    owner_cache: Arc<DashMap<u32, u32>>,
    socket: AsyncMutex<Option<Arc<UdpSocket>>>,
    recv_task: AsyncMutex<Option<JoinHandle<()>>>,
    monitor_task: AsyncMutex<Option<JoinHandle<()>>>,
    sessions: DashMap<u32, Arc<AsyncMutex<RepeaterSession>>>,
    self_ref: OnceLock<Weak<Self>>,
}

impl<R: Repository + 'static, K: KvStore + 'static> HbrpTransport<R, K> {
    pub fn new(
        hub: Arc<Hub<R, K>>,
        repository: Arc<R>,
        bus: Arc<dyn Bus>,
        bind_addr: String,
        port: u16,
        ping_timeout: Duration,
        handshake_timeout: Duration,
        owner_cache: Arc<DashMap<u32, u32>>,
    ) -> Arc<Self> {
        let this = Arc::new(Self {
            hub,
            repository,
            bus,
            bind_addr,
            port,
            ping_timeout,
            handshake_timeout,
            owner_cache,
            socket: AsyncMutex::new(None),
            recv_task: AsyncMutex::new(None),
            monitor_task: AsyncMutex::new(None),
            sessions: DashMap::new(),
            self_ref: OnceLock::new(),
        });
        let _ = this.self_ref.set(Arc::downgrade(&this));
        this
    }

    fn session_for(&self, id: u32, addr: SocketAddr) -> Arc<AsyncMutex<RepeaterSession>> {
        self.sessions
            .entry(id)
            .or_insert_with(|| {
                Arc::new(AsyncMutex::new(RepeaterSession {
                    session: Session::new(id),
                    addr,
                }))
            })
            .clone()
    }

    async fn handle_datagram(&self, socket: &Arc<UdpSocket>, bytes: &[u8], addr: SocketAddr) {
        if bytes.len() >= 4 && bytes[0..4] == DMRD_SIGNATURE {
            self.handle_voice(bytes).await;
            return;
        }

        let Some(frame) = ClientFrame::decode(bytes) else {
            debug!(?addr, "unrecognized HBRP frame, dropping");
            self.hub.record_malformed_packet();
            return;
        };

        match frame {
            ClientFrame::Rptl { id } => self.handle_rptl(socket, id, addr).await,
            ClientFrame::Rptk { id, hash } => self.handle_rptk(socket, id, &hash, addr).await,
            ClientFrame::Rptc { id, config } => self.handle_rptc(socket, id, config, addr).await,
            ClientFrame::RptPing { id } => self.handle_ping(socket, id, addr).await,
            ClientFrame::Rpto { .. } => {
                // Options string is informational only; no FSM transition.
            }
            ClientFrame::Rptcl { id } => self.handle_rptcl(socket, id, addr).await,
        }
    }

    async fn handle_voice(&self, bytes: &[u8]) {
        let Some(packet) = Packet::decode(bytes) else {
            self.hub.record_malformed_packet();
            return;
        };
        let Some(state) = self.sessions.get(&packet.repeater_id).map(|e| e.clone()) else {
            return;
        };
        if !state.lock().await.session.is_connected() {
            return;
        }
        let _ = self
            .bus
            .publish(&format!("packets:{}:inbound", packet.repeater_id), bytes.to_vec())
            .await;
    }

    async fn handle_rptl(&self, socket: &Arc<UdpSocket>, id: u32, addr: SocketAddr) {
        if !self.repository.repeater_id_exists(id).await.unwrap_or(false) {
            send(socket, addr, ServerFrame::MstNak { id }.encode()).await;
            return;
        }
        let state = self.session_for(id, addr);
        let mut guard = state.lock().await;
        guard.addr = addr;
        let salt = rand::thread_rng().next_u32();
        let reply = guard.session.on_rptl(salt, now_unix_ms());
        send(socket, addr, reply.encode()).await;
    }

    async fn handle_rptk(&self, socket: &Arc<UdpSocket>, id: u32, hash: &[u8; 32], addr: SocketAddr) {
        let Some(state) = self.sessions.get(&id).map(|e| e.clone()) else {
            send(socket, addr, ServerFrame::MstNak { id }.encode()).await;
            return;
        };
        let repeater = match self.repository.find_repeater_by_id(id).await {
            Ok(r) => r,
            Err(_) => {
                send(socket, addr, ServerFrame::MstNak { id }.encode()).await;
                return;
            }
        };

        let mut guard = state.lock().await;
        guard.addr = addr;
        let reply = guard.session.on_rptk(&repeater.auth_key, hash);
        let authenticated = guard.session.state == ConnectionState::Authenticated;
        drop(guard);

        if authenticated && !self.hub.claim_session(id).await {
            state.lock().await.session.state = ConnectionState::Disconnected;
            send(socket, addr, ServerFrame::MstNak { id }.encode()).await;
            return;
        }
        send(socket, addr, reply.encode()).await;
    }

    async fn handle_rptc(&self, socket: &Arc<UdpSocket>, id: u32, config: Vec<u8>, addr: SocketAddr) {
        let Some(state) = self.sessions.get(&id).map(|e| e.clone()) else {
            send(socket, addr, ServerFrame::MstNak { id }.encode()).await;
            return;
        };
        let repeater = match self.repository.find_repeater_by_id(id).await {
            Ok(r) => r,
            Err(_) => {
                send(socket, addr, ServerFrame::MstNak { id }.encode()).await;
                return;
            }
        };
        let registered_user = match self.repository.find_user_by_id(repeater.owner_user_id).await {
            Ok(u) => u,
            Err(_) => {
                send(socket, addr, ServerFrame::MstNak { id }.encode()).await;
                return;
            }
        };
        let submitted_callsign = parse_config_callsign(&config).unwrap_or_default();
        if !submitted_callsign.eq_ignore_ascii_case(registered_user.callsign.trim()) {
            debug!(
                repeater_id = id,
                submitted = %submitted_callsign,
                registered = %registered_user.callsign,
                "HBRP RPTC callsign mismatch, rejecting"
            );
            send(socket, addr, ServerFrame::MstNak { id }.encode()).await;
            return;
        }

        let (reply, connected) = {
            let mut guard = state.lock().await;
            guard.addr = addr;
            let reply = guard.session.on_rptc(now_unix_ms());
            (reply, guard.session.is_connected())
        };
        if connected {
            self.hub.reload_repeater(id, TransportKind::Hbrp).await;
            self.owner_cache.insert(id, repeater.owner_user_id);
            info!(repeater_id = id, "HBRP repeater connected");
        }
        send(socket, addr, reply.encode()).await;
    }

    async fn handle_ping(&self, socket: &Arc<UdpSocket>, id: u32, addr: SocketAddr) {
        let Some(state) = self.sessions.get(&id).map(|e| e.clone()) else {
            send(socket, addr, ServerFrame::MstNak { id }.encode()).await;
            return;
        };
        let mut guard = state.lock().await;
        guard.addr = addr;
        let reply = if guard.session.is_connected() {
            guard.session.note_ping(now_unix_ms());
            ServerFrame::MstPong { id }
        } else {
            ServerFrame::MstNak { id }
        };
        drop(guard);
        send(socket, addr, reply.encode()).await;
    }

    async fn handle_rptcl(&self, socket: &Arc<UdpSocket>, id: u32, addr: SocketAddr) {
        if let Some((_, state)) = self.sessions.remove(&id) {
            let reply = state.lock().await.session.on_rptcl();
            self.hub.stop_repeater_actor(id).await;
            self.hub.release_session(id).await;
            send(socket, addr, reply.encode()).await;
            info!(repeater_id = id, "HBRP repeater disconnected");
        } else {
            send(socket, addr, ServerFrame::MstCl.encode()).await;
        }
    }

    /// Drop a session whose handshake or keepalive has timed out (spec
    /// section 4.2 "any -> (timeout) -> DISCONNECTED", section 5).
    async fn disconnect_stale(&self, id: u32, reason: &'static str) {
        if self.sessions.remove(&id).is_some() {
            self.hub.stop_repeater_actor(id).await;
            self.hub.release_session(id).await;
            info!(repeater_id = id, reason, "HBRP session timed out, disconnected");
        }
    }

    /// Sweep every session for an expired handshake or a stale keepalive
    /// (spec section 4.2: "any -> (timeout) -> DISCONNECTED (no RPTPING for
    /// keepalive_timeout)"; section 5: "The RPTL/RPTK handshake must
    /// complete within `handshake_timeout`... otherwise the session is
    /// discarded").
    async fn sweep_timeouts(&self) {
        let now = now_unix_ms();
        let handshake_timeout_ms = self.handshake_timeout.as_millis() as i64;
        let ping_timeout_ms = self.ping_timeout.as_millis() as i64;

        let mut stale = Vec::new();
        for entry in self.sessions.iter() {
            let id = *entry.key();
            let guard = entry.value().lock().await;
            if guard.session.handshake_expired(now, handshake_timeout_ms) {
                stale.push((id, "handshake_timeout"));
            } else if guard.session.ping_expired(now, ping_timeout_ms) {
                stale.push((id, "ping_timeout"));
            }
        }
        for (id, reason) in stale {
            self.disconnect_stale(id, reason).await;
        }
    }
}

async fn send(socket: &Arc<UdpSocket>, addr: SocketAddr, bytes: Vec<u8>) {
    if let Err(err) = socket.send_to(&bytes, addr).await {
        warn!(%addr, %err, "HBRP send failed");
    }
}

#[async_trait]
impl<R: Repository + 'static, K: KvStore + 'static> Transport for HbrpTransport<R, K> {
    async fn start(&self) -> Result<(), TransportError> {
        let bind = format!("{}:{}", self.bind_addr, self.port);
        let socket = UdpSocket::bind(&bind)
            .await
            .map_err(|err| TransportError::Io(err.to_string()))?;
        let socket = Arc::new(socket);
        *self.socket.lock().await = Some(socket.clone());

        let this = self
            .self_ref
            .get()
            .and_then(Weak::upgrade)
            .expect("HbrpTransport must be constructed via ::new");

        let recv_task = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((n, addr)) => this.handle_datagram(&socket, &buf[..n], addr).await,
                    Err(err) => {
                        warn!(%err, "HBRP socket recv error");
                        break;
                    }
                }
            }
        });
        *self.recv_task.lock().await = Some(recv_task);

        let monitor_this = self
            .self_ref
            .get()
            .and_then(Weak::upgrade)
            .expect("HbrpTransport must be constructed via ::new");
        let monitor_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MONITOR_INTERVAL);
            loop {
                ticker.tick().await;
                monitor_this.sweep_timeouts().await;
            }
        });
        *self.monitor_task.lock().await = Some(monitor_task);

        info!(%bind, "HBRP transport listening");
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        if let Some(handle) = self.recv_task.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.monitor_task.lock().await.take() {
            handle.abort();
        }
        *self.socket.lock().await = None;
        Ok(())
    }

    async fn send_to(&self, target_id: u32, frame: Vec<u8>) -> Result<(), TransportError> {
        let socket = self
            .socket
            .lock()
            .await
            .clone()
            .ok_or_else(|| TransportError::Io("transport not started".into()))?;
        let state = self
            .sessions
            .get(&target_id)
            .map(|e| e.clone())
            .ok_or(TransportError::UnknownTarget(target_id))?;
        let addr = state.lock().await.addr;
        socket
            .send_to(&frame, addr)
            .await
            .map_err(|err| TransportError::Io(err.to_string()))?;
        Ok(())
    }
}
