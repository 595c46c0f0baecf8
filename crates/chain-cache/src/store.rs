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

//! In-memory value store keyed by [`CacheKey`]

use crate::types::{CacheEntry, CacheKey, CacheValue, Observed, WriteOrdering};
use alloy_primitives::U256;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, trace};

/// Thread-safe store holding at most one entry per [`CacheKey`]
///
/// Created empty at startup and filled by the poller. Entries are replaced in
/// place and never removed. All writes go through [`ValueStore::compare_and_set`],
/// which enforces the per-key [`WriteOrdering`].
#[derive(Debug, Default)]
pub struct ValueStore {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
}

impl ValueStore {
    /// Creates an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Retrieves the entry for a key
    ///
    /// # Returns
    /// The entry if the key has been populated, None otherwise
    pub async fn get(&self, key: CacheKey) -> Option<CacheEntry> {
        let entries = self.entries.read().await;
        let entry = entries.get(&key).cloned();
        trace!("Store {} for {}", if entry.is_some() { "hit" } else { "miss" }, key);
        entry
    }

    /// Returns a point-in-time copy of every populated entry
    ///
    /// Later writes do not affect the returned map.
    pub async fn get_all(&self) -> HashMap<CacheKey, CacheEntry> {
        self.entries.read().await.clone()
    }

    /// Current block number, if one has been cached
    pub async fn block_number(&self) -> Option<U256> {
        self.get(CacheKey::BlockNumber).await.and_then(|entry| entry.value.as_quantity())
    }

    /// Writes a value using the key's own ordering
    ///
    /// See [`ValueStore::compare_and_set_with`].
    pub async fn compare_and_set(&self, key: CacheKey, value: CacheValue, observed: Observed) -> bool {
        self.compare_and_set_with(key, value, observed, key.ordering()).await
    }

    /// Writes a value if the ordering allows it
    ///
    /// With [`WriteOrdering::Monotonic`] the write only succeeds when there is
    /// no current value or the new quantity is strictly greater. With
    /// [`WriteOrdering::Overwrite`] it always succeeds.
    ///
    /// # Returns
    /// Whether the entry was replaced; callers publish only on `true`
    pub async fn compare_and_set_with(
        &self,
        key: CacheKey,
        value: CacheValue,
        observed: Observed,
        ordering: WriteOrdering,
    ) -> bool {
        let mut entries = self.entries.write().await;

        if ordering == WriteOrdering::Monotonic {
            if let Some(current) = entries.get(&key) {
                let advances = match (current.value.as_quantity(), value.as_quantity()) {
                    (Some(current), Some(new)) => new > current,
                    _ => false,
                };
                if !advances {
                    debug!("Rejected non-advancing write to {}", key);
                    return false;
                }
            }
        }

        entries.insert(key, CacheEntry { key, value, observed });
        trace!("Stored {}", key);
        true
    }

    /// Number of populated keys
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether nothing has been cached yet
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
