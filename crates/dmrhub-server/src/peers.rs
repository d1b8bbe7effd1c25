// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Loads OpenBridge peer definitions from a JSON file.
//!
//! Peers have no connection FSM and are not rows in the relational store
//! (spec section 4.4), so unlike repeaters they cannot be authenticated
//! against the `Repository`. Their IP:port, password and routing rules are
//! fixed configuration instead, read once at startup.

use crate::transports::openbridge::PeerEndpoint;
use dmrhub_core::repository::Peer;
use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;

pub fn load_peers(path: &Path) -> anyhow::Result<Vec<Peer>> {
    let raw = fs::read_to_string(path)
        .map_err(|err| anyhow::anyhow!("reading peers file {:?}: {}", path, err))?;
    let peers: Vec<Peer> = serde_json::from_str(&raw)
        .map_err(|err| anyhow::anyhow!("parsing peers file {:?}: {}", path, err))?;
    Ok(peers)
}

pub fn to_repository_peer(peer: &Peer) -> Peer {
    peer.clone()
}

pub fn to_endpoint(peer: &Peer) -> PeerEndpoint {
    let addr = resolve(&peer.ip, peer.port).unwrap_or_else(|| {
        // Falls back to an unroutable address; send_to will simply fail to
        // deliver, which is the correct behavior for a misconfigured peer.
        SocketAddr::from(([0, 0, 0, 0], 0))
    });
    PeerEndpoint {
        id: peer.id,
        addr,
        password: peer.auth_key.clone(),
    }
}

fn resolve(ip: &str, port: u16) -> Option<SocketAddr> {
    (ip, port).to_socket_addrs().ok()?.next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_peers_round_trip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"id":1,"ip":"127.0.0.1","port":62035,"auth_key":"secret","owner_user_id":1,"ingress":true,"egress":true,"rules":[]}}]"#
        )
        .unwrap();
        let peers = load_peers(file.path()).unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].id, 1);
    }

    #[test]
    fn test_to_endpoint_resolves_loopback() {
        let peer = Peer {
            id: 2,
            ip: "127.0.0.1".to_string(),
            port: 62035,
            auth_key: "pw".to_string(),
            owner_user_id: 1,
            ingress: true,
            egress: true,
            rules: Vec::new(),
        };
        let endpoint = to_endpoint(&peer);
        assert_eq!(endpoint.addr.port(), 62035);
        assert_eq!(endpoint.password, "pw");
    }
}
