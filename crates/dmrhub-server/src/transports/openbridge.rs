// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP transport for OpenBridge (spec section 4.4): stateless, HMAC-signed
//! 73-byte datagrams. There is no connection FSM and no registration --
//! every peer's IP:Port and password are fixed configuration, loaded once
//! at startup (spec section 4.4, "Peer (OpenBridge)... stateless delivery:
//! no connection FSM").

use async_trait::async_trait;
use dmrhub_core::engine::transport::{Transport, TransportError};
use dmrhub_core::engine::Hub;
use dmrhub_core::kv::KvStore;
use dmrhub_core::protocol::dmrd::Packet;
use dmrhub_core::protocol::openbridge;
use dmrhub_core::repository::Repository;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, Weak};
use tokio::net::UdpSocket;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const MAX_DATAGRAM: usize = 1024;

/// A configured OpenBridge peer endpoint: the wire-level counterpart of
/// `dmrhub_core::repository::Peer`, which only carries routing rules.
#[derive(Debug, Clone)]
pub struct PeerEndpoint {
    pub id: u32,
    pub addr: SocketAddr,
    pub password: String,
}

pub struct OpenBridgeTransport<R: Repository, K: KvStore> {
    hub: Arc<Hub<R, K>>,
    bind_addr: String,
    port: u16,
    by_addr: HashMap<SocketAddr, PeerEndpoint>,
    by_id: HashMap<u32, PeerEndpoint>,
    socket: AsyncMutex<Option<Arc<UdpSocket>>>,
    recv_task: AsyncMutex<Option<JoinHandle<()>>>,
    self_ref: OnceLock<Weak<Self>>,
}

impl<R: Repository + 'static, K: KvStore + 'static> OpenBridgeTransport<R, K> {
    pub fn new(hub: Arc<Hub<R, K>>, bind_addr: String, port: u16, peers: Vec<PeerEndpoint>) -> Arc<Self> {
        let by_addr = peers.iter().map(|p| (p.addr, p.clone())).collect();
        let by_id = peers.into_iter().map(|p| (p.id, p)).collect();
        let this = Arc::new(Self {
            hub,
            bind_addr,
            port,
            by_addr,
            by_id,
            socket: AsyncMutex::new(None),
            recv_task: AsyncMutex::new(None),
            self_ref: OnceLock::new(),
        });
        let _ = this.self_ref.set(Arc::downgrade(&this));
        this
    }

    async fn handle_datagram(&self, bytes: &[u8], addr: SocketAddr) {
        let Some(peer) = self.by_addr.get(&addr) else {
            debug!(?addr, "OpenBridge datagram from unconfigured address, dropping");
            return;
        };
        let Some(packet) = openbridge::decode(bytes, &peer.password) else {
            debug!(peer_id = peer.id, "OpenBridge frame failed HMAC verification, dropping");
            self.hub.record_openbridge_hmac_fail();
            return;
        };
        self.hub.route_openbridge_inbound(peer.id, packet).await;
    }
}

#[async_trait]
impl<R: Repository + 'static, K: KvStore + 'static> Transport for OpenBridgeTransport<R, K> {
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
            .expect("OpenBridgeTransport must be constructed via ::new");

        let recv_task = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((n, addr)) => this.handle_datagram(&buf[..n], addr).await,
                    Err(err) => {
                        warn!(%err, "OpenBridge socket recv error");
                        break;
                    }
                }
            }
        });
        *self.recv_task.lock().await = Some(recv_task);
        info!(%bind, peers = self.by_id.len(), "OpenBridge transport listening");
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        if let Some(handle) = self.recv_task.lock().await.take() {
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
        let peer = self
            .by_id
            .get(&target_id)
            .ok_or(TransportError::UnknownTarget(target_id))?;
        let packet = Packet::decode(&frame).ok_or_else(|| TransportError::Io("not a DMRD frame".into()))?;
        let signed = openbridge::encode(&packet, &peer.password);
        socket
            .send_to(&signed, peer.addr)
            .await
            .map_err(|err| TransportError::Io(err.to_string()))?;
        Ok(())
    }
}
