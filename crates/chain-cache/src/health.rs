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

//! Health check service for cache status

use crate::{publisher::Publisher, types::CacheKey};
use serde_json::{json, Value};
use std::time::{SystemTime, UNIX_EPOCH};

/// Reports uptime and fill state of the cache
pub struct HealthService {
    start_time: u64,
}

impl Default for HealthService {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthService {
    /// Creates a new health service, recording now as the start time
    pub fn new() -> Self {
        Self { start_time: now_secs() }
    }

    /// Current status of the service
    ///
    /// # Returns
    /// JSON object with version, uptime, subscriber count and the populated keys
    pub async fn report(&self, publisher: &Publisher) -> Value {
        let entries = publisher.store().get_all().await;
        let populated: Vec<&str> =
            CacheKey::ALL.iter().filter(|key| entries.contains_key(key)).map(|key| key.as_str()).collect();

        json!({
            "status": "ok",
            "service": "chain-cache",
            "version": env!("CARGO_PKG_VERSION"),
            "uptime": now_secs().saturating_sub(self.start_time),
            "started_at": self.start_time,
            "pid": std::process::id(),
            "subscribers": publisher.subscriber_count().await,
            "entries": populated,
        })
    }
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{store::ValueStore, types::Observed};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_report_lists_populated_keys() {
        chain_cache_common::logging::ensure_test_logging(None);

        let publisher = Publisher::new(Arc::new(ValueStore::new()), 8);
        let health = HealthService::new();

        let report = health.report(&publisher).await;
        assert_eq!(report["status"], "ok");
        assert_eq!(report["entries"], json!([]));
        assert_eq!(report["subscribers"], 0);

        publisher.commit(CacheKey::GasPrice, 1u64.into(), Observed::At(1)).await;
        publisher.commit(CacheKey::ChainId, 1u64.into(), Observed::Permanent).await;
        let _subscription = publisher.subscribe().await;

        let report = health.report(&publisher).await;
        assert_eq!(report["entries"], json!(["chainId", "gasPrice"]));
        assert_eq!(report["subscribers"], 1);
    }
}
