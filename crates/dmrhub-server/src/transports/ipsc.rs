// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP transport for the IPSC (Motorola IP Site Connect) protocol (spec
//! section 4.3).
//!
//! Registration carries the peer ID in cleartext ahead of its HMAC tag (the
//! tag can only be checked once the peer's password is known), so the
//! receive loop peeks that ID before looking up the key. Every later frame
//! from the same socket address is attributed to the peer established at
//! registration, exactly as the voice/data frames themselves carry no peer
//! ID (spec section 4.3: "forwards to the Hub... so downstream routing is
//! protocol-agnostic").

use async_trait::async_trait;
use dashmap::DashMap;
use dmrhub_core::engine::transport::{Transport, TransportError, TransportKind};
use dmrhub_core::engine::Hub;
use dmrhub_core::kv::KvStore;
use dmrhub_core::protocol::dmrd::{FrameType, Packet, Slot as DmrdSlot, DTYPE_VOICE_TERM};
use dmrhub_core::protocol::ipsc::{
    self, Slot as IpscSlot, VoiceHeader, TAG_DATA_BLOCK, TAG_DATA_HEADER, TAG_GROUP_VOICE,
    TAG_MASTER_ALIVE_REPLY, TAG_MASTER_ALIVE_REQ, TAG_MASTER_REG_REPLY, TAG_MASTER_REG_REQ,
    TAG_PEER_ALIVE_REPLY, TAG_PEER_ALIVE_REQ, TAG_PRIVATE_VOICE,
};
use dmrhub_core::pubsub::Bus;
use dmrhub_core::repository::Repository;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const MAX_DATAGRAM: usize = 1024;
const ALIVE_INTERVAL: Duration = Duration::from_secs(5);

struct PeerSession {
    addr: SocketAddr,
    last_alive: Instant,
}

pub struct IpscTransport<R: Repository, K: KvStore> {
    hub: Arc<Hub<R, K>>,
    repository: Arc<R>,
    bus: Arc<dyn Bus>,
    bind_addr: String,
    port: u16,
    ping_timeout: Duration,
    owner_cache: Arc<DashMap<u32, u32>>,
    socket: AsyncMutex<Option<Arc<UdpSocket>>>,
    recv_task: AsyncMutex<Option<JoinHandle<()>>>,
    alive_task: AsyncMutex<Option<JoinHandle<()>>>,
    sessions: DashMap<u32, Arc<AsyncMutex<PeerSession>>>,
    addr_to_peer: DashMap<SocketAddr, u32>,
    self_ref: OnceLock<Weak<Self>>,
}

impl<R: Repository + 'static, K: KvStore + 'static> IpscTransport<R, K> {
    pub fn new(
        hub: Arc<Hub<R, K>>,
        repository: Arc<R>,
        bus: Arc<dyn Bus>,
        bind_addr: String,
        port: u16,
        ping_timeout: Duration,
        owner_cache: Arc<DashMap<u32, u32>>,
    ) -> Arc<Self> {
        let this = Arc::new(Self {
            hub,
            repository,
            bus,
            bind_addr,
            port,
            ping_timeout,
            owner_cache,
            socket: AsyncMutex::new(None),
            recv_task: AsyncMutex::new(None),
            alive_task: AsyncMutex::new(None),
            sessions: DashMap::new(),
            addr_to_peer: DashMap::new(),
            self_ref: OnceLock::new(),
        });
        let _ = this.self_ref.set(Arc::downgrade(&this));
        this
    }

    async fn handle_datagram(&self, socket: &Arc<UdpSocket>, bytes: &[u8], addr: SocketAddr) {
        if bytes.is_empty() {
            return;
        }
        let tag = bytes[0];

        if tag == TAG_MASTER_REG_REQ {
            self.handle_register(socket, bytes, addr).await;
            return;
        }

        let Some(peer_id) = self.addr_to_peer.get(&addr).map(|e| *e) else {
            debug!(?addr, tag, "IPSC frame from unregistered peer, dropping");
            return;
        };
        let Some(state) = self.sessions.get(&peer_id).map(|e| e.clone()) else {
            return;
        };
        let password = match self.repository.find_repeater_by_id(peer_id).await {
            Ok(r) => r.auth_key,
            Err(_) => return,
        };
        let Some(body) = ipsc::verify(bytes, &password) else {
            debug!(peer_id, "IPSC frame failed HMAC verification, dropping");
            self.hub.record_malformed_packet();
            return;
        };

        match tag {
            TAG_PEER_ALIVE_REQ => {
                state.lock().await.last_alive = Instant::now();
                let Some(reply) = ipsc::sign(&[TAG_PEER_ALIVE_REPLY], &password) else {
                    warn!(peer_id, "IPSC peer auth key does not derive a valid HMAC key");
                    return;
                };
                send(socket, addr, reply).await;
            }
            TAG_MASTER_ALIVE_REPLY => {
                state.lock().await.last_alive = Instant::now();
            }
            TAG_GROUP_VOICE | TAG_PRIVATE_VOICE => {
                self.handle_voice(peer_id, body).await;
            }
            TAG_DATA_HEADER | TAG_DATA_BLOCK => {
                debug!(peer_id, tag, "IPSC data frame received, not relayed");
            }
            _ => {
                debug!(peer_id, tag, "unhandled IPSC frame tag");
            }
        }
    }

    async fn handle_register(&self, socket: &Arc<UdpSocket>, bytes: &[u8], addr: SocketAddr) {
        // Cleartext prefix: tag(1) + peer_id_be32(4) + mode(1) + flags_be32(4).
        if bytes.len() < 10 {
            return;
        }
        let peer_id = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);

        if !self.repository.repeater_id_exists(peer_id).await.unwrap_or(false) {
            debug!(peer_id, "IPSC register request for unknown peer, dropping");
            return;
        }
        let repeater = match self.repository.find_repeater_by_id(peer_id).await {
            Ok(r) => r,
            Err(_) => return,
        };
        if ipsc::verify(bytes, &repeater.auth_key).is_none() {
            debug!(peer_id, "IPSC register request failed HMAC verification");
            return;
        }

        if !self.hub.claim_session(peer_id).await {
            debug!(peer_id, "IPSC session already owned by another replica");
            return;
        }

        self.addr_to_peer.insert(addr, peer_id);
        self.sessions.insert(
            peer_id,
            Arc::new(AsyncMutex::new(PeerSession {
                addr,
                last_alive: Instant::now(),
            })),
        );

        self.hub.reload_repeater(peer_id, TransportKind::Ipsc).await;
        self.owner_cache.insert(peer_id, repeater.owner_user_id);
        info!(peer_id, "IPSC peer registered");

        let mut reply_body = vec![TAG_MASTER_REG_REPLY];
        reply_body.extend_from_slice(&peer_id.to_be_bytes());
        let Some(reply) = ipsc::sign(&reply_body, &repeater.auth_key) else {
            warn!(peer_id, "IPSC peer auth key does not derive a valid HMAC key");
            return;
        };
        send(socket, addr, reply).await;
    }

    async fn handle_voice(&self, peer_id: u32, body: &[u8]) {
        let Some(header) = VoiceHeader::decode(body) else {
            self.hub.record_malformed_packet();
            return;
        };
        let payload_bytes = &body[VoiceHeader::MIN_LEN..];
        let mut payload = [0u8; 33];
        let n = payload_bytes.len().min(33);
        payload[..n].copy_from_slice(&payload_bytes[..n]);

        let call_end = header.call_end;
        let packet = Packet {
            seq: 0,
            src: header.src,
            dst: header.dst,
            repeater_id: peer_id,
            slot: match header.slot {
                IpscSlot::Ts1 => DmrdSlot::Ts1,
                IpscSlot::Ts2 => DmrdSlot::Ts2,
            },
            group_call: header.is_group_call(),
            frame_type: if call_end { FrameType::DataSync } else { FrameType::Voice },
            dtype_or_vseq: if call_end { DTYPE_VOICE_TERM } else { 0 },
            stream_id: header.stream_id,
            payload,
            ber: None,
            rssi: None,
        };

        let _ = self
            .bus
            .publish(&format!("packets:{}:inbound", peer_id), packet.encode())
            .await;
    }

    async fn deregister(&self, peer_id: u32) {
        if let Some((_, state)) = self.sessions.remove(&peer_id) {
            let addr = state.lock().await.addr;
            self.addr_to_peer.remove(&addr);
        }
        self.hub.stop_repeater_actor(peer_id).await;
        self.hub.release_session(peer_id).await;
        info!(peer_id, "IPSC peer timed out, deregistered");
    }
}

async fn send(socket: &Arc<UdpSocket>, addr: SocketAddr, bytes: Vec<u8>) {
    if let Err(err) = socket.send_to(&bytes, addr).await {
        warn!(%addr, %err, "IPSC send failed");
    }
}

#[async_trait]
impl<R: Repository + 'static, K: KvStore + 'static> Transport for IpscTransport<R, K> {
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
            .expect("IpscTransport must be constructed via ::new");

        let recv_this = this.clone();
        let recv_socket = socket.clone();
        let recv_task = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match recv_socket.recv_from(&mut buf).await {
                    Ok((n, addr)) => recv_this.handle_datagram(&recv_socket, &buf[..n], addr).await,
                    Err(err) => {
                        warn!(%err, "IPSC socket recv error");
                        break;
                    }
                }
            }
        });
        *self.recv_task.lock().await = Some(recv_task);

        let alive_this = this;
        let alive_socket = socket;
        let alive_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ALIVE_INTERVAL);
            loop {
                ticker.tick().await;
                let stale: Vec<u32> = alive_this
                    .sessions
                    .iter()
                    .filter(|e| e.value().try_lock().map(|g| g.last_alive.elapsed() > alive_this.ping_timeout).unwrap_or(false))
                    .map(|e| *e.key())
                    .collect();
                for peer_id in stale {
                    alive_this.deregister(peer_id).await;
                }

                for entry in alive_this.sessions.iter() {
                    let peer_id = *entry.key();
                    let addr = entry.value().lock().await.addr;
                    if let Ok(repeater) = alive_this.repository.find_repeater_by_id(peer_id).await {
                        if let Some(frame) = ipsc::sign(&[TAG_MASTER_ALIVE_REQ], &repeater.auth_key) {
                            send(&alive_socket, addr, frame).await;
                        }
                    }
                }
            }
        });
        *self.alive_task.lock().await = Some(alive_task);

        info!(%bind, "IPSC transport listening");
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        if let Some(handle) = self.recv_task.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.alive_task.lock().await.take() {
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

        let packet = Packet::decode(&frame).ok_or_else(|| TransportError::Io("not a DMRD frame".into()))?;
        let repeater = self
            .repository
            .find_repeater_by_id(target_id)
            .await
            .map_err(|err| TransportError::Io(err.to_string()))?;

        let tag = if packet.group_call { TAG_GROUP_VOICE } else { TAG_PRIVATE_VOICE };
        let slot = match packet.slot {
            DmrdSlot::Ts1 => IpscSlot::Ts1,
            DmrdSlot::Ts2 => IpscSlot::Ts2,
        };
        let mut body = VoiceHeader::encode(tag, packet.src, packet.dst, packet.stream_id, slot, packet.is_voice_term());
        body.extend_from_slice(&packet.payload);

        let signed = ipsc::sign(&body, &repeater.auth_key)
            .ok_or_else(|| TransportError::Io("auth key does not derive a valid HMAC key".into()))?;
        socket
            .send_to(&signed, addr)
            .await
            .map_err(|err| TransportError::Io(err.to_string()))?;
        Ok(())
    }
}

