// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Named-topic pub/sub bus (C3): per-subscription channels used for both
//! intra-process delivery and, behind a remote implementation of the same
//! trait, inter-replica delivery (spec sections 2, 6.2, 9).

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("no subscribers for topic {0}")]
    NoSubscribers(String),
    #[error("bus backend error: {0}")]
    Backend(String),
}

/// A live subscription: a receiver plus a handle that unsubscribes on drop.
pub struct Subscription {
    pub receiver: broadcast::Receiver<Vec<u8>>,
}

/// `Subscribe(topic) -> (channel, close)`, `Publish(topic, bytes) -> err`
/// (spec section 9, "Mapping dynamic dispatch").
#[async_trait]
pub trait Bus: Send + Sync {
    /// Subscribe to a topic. Dropping the returned `Subscription` closes it.
    async fn subscribe(&self, topic: &str) -> Subscription;

    /// Publish to a topic. Publishing to a topic with no subscribers is not
    /// an error -- it simply has no effect, matching typical pub/sub
    /// semantics (the reference's topics are fire-and-forget).
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;
}

const CHANNEL_CAPACITY: usize = 1024;

/// Single-process bus backed by a `broadcast` channel per topic, created
/// lazily on first subscribe or publish.
#[derive(Default)]
pub struct InMemoryBus {
    topics: DashMap<String, broadcast::Sender<Vec<u8>>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self {
            topics: DashMap::new(),
        }
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<Vec<u8>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl Bus for InMemoryBus {
    async fn subscribe(&self, topic: &str) -> Subscription {
        let sender = self.sender_for(topic);
        Subscription {
            receiver: sender.subscribe(),
        }
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let sender = self.sender_for(topic);
        // A `send` error here just means nobody is currently listening;
        // that is not a bus failure.
        let _ = sender.send(payload);
        Ok(())
    }
}

/// Shared handle type used throughout the engine.
pub type SharedBus = Arc<dyn Bus>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_then_subscribe_is_not_delivered() {
        // broadcast channels do not replay history -- matches the reference
        // pub/sub, which has no durable queue.
        let bus = InMemoryBus::new();
        bus.publish("t", b"hello".to_vec()).await.unwrap();
        let mut sub = bus.subscribe("t").await;
        bus.publish("t", b"again".to_vec()).await.unwrap();
        let msg = sub.receiver.recv().await.unwrap();
        assert_eq!(msg, b"again");
    }

    #[tokio::test]
    async fn test_subscribe_then_publish_is_delivered() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe("packets:1:inbound").await;
        bus.publish("packets:1:inbound", b"frame".to_vec())
            .await
            .unwrap();
        let msg = sub.receiver.recv().await.unwrap();
        assert_eq!(msg, b"frame");
    }

    #[tokio::test]
    async fn test_multiple_subscribers_all_receive() {
        let bus = InMemoryBus::new();
        let mut a = bus.subscribe("calls:public").await;
        let mut b = bus.subscribe("calls:public").await;
        bus.publish("calls:public", b"x".to_vec()).await.unwrap();
        assert_eq!(a.receiver.recv().await.unwrap(), b"x");
        assert_eq!(b.receiver.recv().await.unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_publish_to_unsubscribed_topic_is_not_an_error() {
        let bus = InMemoryBus::new();
        assert!(bus.publish("nobody:listening", b"x".to_vec()).await.is_ok());
    }
}
