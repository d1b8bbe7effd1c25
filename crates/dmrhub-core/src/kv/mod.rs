// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Distributed key-value store contract (C2) and an in-memory implementation.
//!
//! Backs session ownership, scheduled-net election locks, and last-heard
//! state (spec section 6.3). The narrow trait mirrors the reference
//! implementation's pub/sub and KV interface (spec section 9, "Mapping
//! dynamic dispatch"): `Get/Set/SetNX/Del`, here made async so a real
//! replicated backend can suspend on network I/O.

use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv operation timed out")]
    Timeout,
    #[error("kv backend error: {0}")]
    Backend(String),
}

/// A distributed string/bytes store with TTL and `SetNX` semantics.
///
/// Every method carries an implicit deadline matching the reference
/// implementation's default 5 s KV operation timeout (spec section 5); the
/// in-memory implementation below is local so it cannot actually time out,
/// but remote implementations (e.g. a Redis-backed one) should enforce it.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch a value, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    /// Set a value unconditionally with an optional TTL.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), KvError>;

    /// Set a value only if the key is absent or expired. Returns `true` if
    /// the set happened (lock/election acquired).
    async fn set_nx(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool, KvError>;

    /// Delete a key. No-op if absent.
    async fn del(&self, key: &str) -> Result<(), KvError>;
}

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self) -> bool {
        match self.expires_at {
            Some(at) => Instant::now() < at,
            None => true,
        }
    }
}

/// Single-process `KvStore` backed by `DashMap`. Sufficient for a lone
/// replica or for tests; a multi-replica deployment needs a shared backend
/// (Redis, etcd) behind the same trait.
#[derive(Default)]
pub struct InMemoryKvStore {
    entries: DashMap<String, Entry>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        match self.entries.get(key) {
            Some(entry) if entry.is_live() => Ok(Some(entry.value.clone())),
            Some(_) => {
                self.entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), KvError> {
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at,
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool, KvError> {
        // Evict an expired entry first so a stale lock doesn't block a new
        // election (spec section 6.3: locks have a TTL precisely so a dead
        // holder doesn't wedge the key forever).
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_live() {
                drop(entry);
                self.entries.remove(key);
            }
        }

        let expires_at = Some(Instant::now() + ttl);
        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Entry { value, expires_at });
                Ok(true)
            }
        }
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_round_trip() {
        let kv = InMemoryKvStore::new();
        kv.set("k", b"v".to_vec(), None).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn test_get_missing_key_is_none() {
        let kv = InMemoryKvStore::new();
        assert_eq!(kv.get("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_nx_first_caller_wins() {
        let kv = InMemoryKvStore::new();
        assert!(kv
            .set_nx("lock", b"a".to_vec(), Duration::from_secs(30))
            .await
            .unwrap());
        assert!(!kv
            .set_nx("lock", b"b".to_vec(), Duration::from_secs(30))
            .await
            .unwrap());
        assert_eq!(kv.get("lock").await.unwrap(), Some(b"a".to_vec()));
    }

    #[tokio::test]
    async fn test_expired_entry_is_absent() {
        let kv = InMemoryKvStore::new();
        kv.set("k", b"v".to_vec(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_nx_reacquires_after_expiry() {
        let kv = InMemoryKvStore::new();
        kv.set_nx("lock", b"a".to_vec(), Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(kv
            .set_nx("lock", b"b".to_vec(), Duration::from_secs(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_del_removes_key() {
        let kv = InMemoryKvStore::new();
        kv.set("k", b"v".to_vec(), None).await.unwrap();
        kv.del("k").await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), None);
    }
}
