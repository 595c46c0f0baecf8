// Chain Cache - freshness-bounded cache for upstream chain data
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Update fan-out to live subscribers

use crate::{
    store::ValueStore,
    types::{CacheKey, CacheValue, Observed, UpdateEvent},
};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    Mutex,
};
use tracing::{debug, error, info, warn};

/// Default per-subscriber queue length
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 64;

/// Identifier handed out to each subscriber
pub type SubscriberId = u64;

/// A serialized [`UpdateEvent`], shared between all subscribers
pub type EventPayload = Arc<str>;

/// Receiving side of one subscriber
///
/// Yields the connect-time snapshot first, then live updates in publish
/// order. `recv` returns `None` once the publisher has dropped this
/// subscriber, either after [`Publisher::unsubscribe`] or because its queue
/// overflowed.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    receiver: mpsc::Receiver<EventPayload>,
}

impl Subscription {
    /// This subscriber's id
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next event payload
    pub async fn recv(&mut self) -> Option<EventPayload> {
        self.receiver.recv().await
    }

    /// Next event payload if one is already queued
    pub fn try_recv(&mut self) -> Option<EventPayload> {
        self.receiver.try_recv().ok()
    }
}

#[derive(Default)]
struct Registry {
    next_id: SubscriberId,
    subscribers: HashMap<SubscriberId, mpsc::Sender<EventPayload>>,
}

impl Registry {
    fn insert(&mut self, sender: mpsc::Sender<EventPayload>) -> SubscriberId {
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.insert(id, sender);
        id
    }

    /// Best-effort delivery to everyone; drops subscribers that can't keep up
    fn broadcast(&mut self, method: CacheKey, payload: &EventPayload) -> usize {
        let targets: Vec<(SubscriberId, mpsc::Sender<EventPayload>)> =
            self.subscribers.iter().map(|(id, sender)| (*id, sender.clone())).collect();

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (id, sender) in targets {
            match sender.try_send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!("Subscriber {} is not keeping up, dropping it", id);
                    failed.push(id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Subscriber {} went away", id);
                    failed.push(id);
                }
            }
        }

        for id in failed {
            self.subscribers.remove(&id);
        }

        debug!("Published {} to {} subscribers", method, delivered);
        delivered
    }
}

/// Fans cache updates out to subscribers
///
/// The publisher is also the single write path into the [`ValueStore`]:
/// [`Publisher::commit`] performs the compare-and-set and the broadcast under
/// one lock, and [`Publisher::subscribe`] takes the snapshot under the same
/// lock. A new subscriber therefore sees every value exactly once, either in
/// its snapshot or as a live event.
pub struct Publisher {
    store: Arc<ValueStore>,
    registry: Mutex<Registry>,
    buffer: usize,
}

impl Publisher {
    /// Creates a publisher over the given store
    ///
    /// # Arguments
    /// * `store` - Store that commits are written to and snapshots read from
    /// * `buffer` - Per-subscriber queue length; raised to fit a full snapshot
    pub fn new(store: Arc<ValueStore>, buffer: usize) -> Self {
        Self {
            store,
            registry: Mutex::new(Registry::default()),
            buffer: buffer.max(CacheKey::ALL.len()),
        }
    }

    /// The store this publisher writes to
    pub fn store(&self) -> &Arc<ValueStore> {
        &self.store
    }

    /// Writes a value and, if the store accepted it, publishes it
    ///
    /// # Returns
    /// Whether the store accepted the write
    pub async fn commit(&self, key: CacheKey, value: CacheValue, observed: Observed) -> bool {
        let mut registry = self.registry.lock().await;

        if !self.store.compare_and_set(key, value.clone(), observed).await {
            return false;
        }

        let event = UpdateEvent { method: key, value, timestamp: observed };
        if let Some(payload) = encode(&event) {
            registry.broadcast(key, &payload);
        }
        true
    }

    /// Sends an event to every live subscriber without touching the store
    ///
    /// # Returns
    /// Number of subscribers the event was queued for
    pub async fn publish(&self, event: &UpdateEvent) -> usize {
        let Some(payload) = encode(event) else { return 0 };
        self.registry.lock().await.broadcast(event.method, &payload)
    }

    /// Registers a new subscriber
    ///
    /// One event per populated key is queued before the subscriber becomes
    /// visible to [`Publisher::commit`].
    pub async fn subscribe(&self) -> Subscription {
        let mut registry = self.registry.lock().await;
        let (sender, receiver) = mpsc::channel(self.buffer);

        let snapshot = self.store.get_all().await;
        for key in CacheKey::ALL {
            let Some(entry) = snapshot.get(&key) else { continue };
            if let Some(payload) = encode(&entry.to_event()) {
                // The buffer is sized for a full snapshot
                let _ = sender.try_send(payload);
            }
        }

        let id = registry.insert(sender);
        info!("Subscriber {} connected with {} snapshot events", id, snapshot.len());
        Subscription { id, receiver }
    }

    /// Removes a subscriber; unknown ids are ignored
    pub async fn unsubscribe(&self, id: SubscriberId) {
        if self.registry.lock().await.subscribers.remove(&id).is_some() {
            info!("Subscriber {} disconnected", id);
        }
    }

    /// Number of currently registered subscribers
    pub async fn subscriber_count(&self) -> usize {
        self.registry.lock().await.subscribers.len()
    }
}

fn encode(event: &UpdateEvent) -> Option<EventPayload> {
    match serde_json::to_string(event) {
        Ok(text) => Some(text.into()),
        Err(e) => {
            error!("Failed to serialize {} event: {}", event.method, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain_cache_common::logging::ensure_test_logging;
    use serde_json::Value;
    use tracing::info;

    fn decode(payload: &EventPayload) -> UpdateEvent {
        serde_json::from_str(payload).unwrap()
    }

    fn drain(subscription: &mut Subscription) -> Vec<UpdateEvent> {
        std::iter::from_fn(|| subscription.try_recv()).map(|p| decode(&p)).collect()
    }

    fn publisher() -> Publisher {
        Publisher::new(Arc::new(ValueStore::new()), DEFAULT_SUBSCRIBER_BUFFER)
    }

    #[tokio::test]
    async fn test_commit_publishes_accepted_writes_only() {
        ensure_test_logging(None);
        info!("Testing that rejected writes never reach subscribers");

        let publisher = publisher();
        let mut subscription = publisher.subscribe().await;

        assert!(publisher.commit(CacheKey::BlockNumber, 10u64.into(), Observed::At(1)).await);
        assert!(!publisher.commit(CacheKey::BlockNumber, 10u64.into(), Observed::At(2)).await);
        assert!(!publisher.commit(CacheKey::BlockNumber, 9u64.into(), Observed::At(3)).await);

        let events = drain(&mut subscription);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].value, CacheValue::from(10u64));
        assert_eq!(events[0].timestamp, Observed::At(1));
    }

    #[tokio::test]
    async fn test_snapshot_precedes_live_events() {
        ensure_test_logging(None);

        let publisher = publisher();
        publisher.commit(CacheKey::GasPrice, 7u64.into(), Observed::At(1)).await;
        publisher.commit(CacheKey::ChainId, 1u64.into(), Observed::Permanent).await;
        publisher.commit(CacheKey::BlockNumber, 100u64.into(), Observed::At(1)).await;

        let mut subscription = publisher.subscribe().await;
        publisher.commit(CacheKey::BlockNumber, 101u64.into(), Observed::At(2)).await;

        let events = drain(&mut subscription);
        let methods: Vec<CacheKey> = events.iter().map(|e| e.method).collect();
        assert_eq!(
            methods,
            vec![CacheKey::ChainId, CacheKey::BlockNumber, CacheKey::GasPrice, CacheKey::BlockNumber]
        );
        assert_eq!(events[0].timestamp, Observed::Permanent);
        assert_eq!(events[1].value, CacheValue::from(100u64));
        assert_eq!(events[3].value, CacheValue::from(101u64));
    }

    #[tokio::test]
    async fn test_empty_store_sends_no_snapshot() {
        ensure_test_logging(None);

        let publisher = publisher();
        let mut subscription = publisher.subscribe().await;
        assert!(subscription.try_recv().is_none());
        assert_eq!(publisher.subscriber_count().await, 1);
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned_without_affecting_others() {
        ensure_test_logging(None);
        info!("Testing disconnect mid-broadcast");

        let publisher = publisher();
        let gone = publisher.subscribe().await;
        let mut staying = publisher.subscribe().await;
        assert_eq!(publisher.subscriber_count().await, 2);

        drop(gone);
        let delivered = publisher
            .publish(&UpdateEvent {
                method: CacheKey::GasPrice,
                value: 5u64.into(),
                timestamp: Observed::At(1),
            })
            .await;

        assert_eq!(delivered, 1);
        assert_eq!(publisher.subscriber_count().await, 1);
        assert_eq!(drain(&mut staying).len(), 1);

        publisher.commit(CacheKey::GasPrice, 6u64.into(), Observed::At(2)).await;
        assert_eq!(drain(&mut staying).len(), 1);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_is_dropped() {
        ensure_test_logging(None);

        let publisher = Publisher::new(Arc::new(ValueStore::new()), 4);
        let mut slow = publisher.subscribe().await;
        let mut fast = publisher.subscribe().await;

        for n in 1..=5u64 {
            publisher.commit(CacheKey::BlockNumber, n.into(), Observed::At(n)).await;
            if n < 5 {
                // Keep the fast subscriber drained so only the slow one overflows
                assert_eq!(drain(&mut fast).len(), 1);
            }
        }

        assert_eq!(publisher.subscriber_count().await, 1);
        assert_eq!(drain(&mut fast).len(), 1);

        // The slow subscriber keeps what was queued, then sees the end of stream
        assert_eq!(drain(&mut slow).len(), 4);
        assert!(slow.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_stream() {
        ensure_test_logging(None);

        let publisher = publisher();
        let mut subscription = publisher.subscribe().await;
        publisher.unsubscribe(subscription.id()).await;
        publisher.unsubscribe(subscription.id()).await;

        assert_eq!(publisher.subscriber_count().await, 0);
        assert!(subscription.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        ensure_test_logging(None);

        let publisher = publisher();
        let a = publisher.subscribe().await;
        let b = publisher.subscribe().await;
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn test_payload_is_complete_json() {
        ensure_test_logging(None);

        let publisher = publisher();
        let mut subscription = publisher.subscribe().await;
        let huge = alloy_primitives::U256::MAX;
        publisher.commit(CacheKey::GasPrice, huge.into(), Observed::At(9)).await;

        let payload = subscription.try_recv().unwrap();
        let raw: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(raw["method"], "gasPrice");
        assert_eq!(raw["value"], huge.to_string());
        assert_eq!(raw["timestamp"], 9);
    }
}
