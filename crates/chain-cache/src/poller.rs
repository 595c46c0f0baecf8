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

//! Upstream polling
//!
//! The poller has two schedules:
//! - a one-shot bootstrap that fetches the chain id and stores it as permanent;
//! - a recurring cycle that fetches the block number (and gas price) and,
//!   when the chain has advanced, commits the new number, the block contents
//!   and the gas price.
//!
//! Cycles run one after another on a single task, so the monotonic block
//! number check never races with itself. Every upstream call is bounded by
//! the configured request timeout.

use crate::{
    publisher::Publisher,
    store::ValueStore,
    types::{CacheKey, Observed},
    upstream::Upstream,
};
use alloy_primitives::U256;
use eyre::Result;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};

/// Default delay between poll cycles
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);
/// Default bound on a single upstream call
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// Shortest poll interval the poller accepts
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Poller settings
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Delay between the starts of two cycles, at least [`MIN_POLL_INTERVAL`]
    pub poll_interval: Duration,
    /// Bound on each upstream call
    pub request_timeout: Duration,
    /// Cache full block contents for each new block
    pub track_blocks: bool,
    /// Fetch and cache the gas price
    pub track_gas_price: bool,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            track_blocks: true,
            track_gas_price: true,
        }
    }
}

/// What one poll cycle did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The chain advanced and the block number was committed
    Advanced {
        /// Newly cached block number
        block_number: u64,
        /// Whether the block contents were cached too
        block_cached: bool,
        /// Whether a gas price was cached
        gas_price_cached: bool,
    },
    /// Upstream reported a block number that is not newer than the cache
    Unchanged {
        /// Block number upstream returned
        block_number: u64,
    },
    /// The block number could not be fetched
    Failed,
}

/// Periodically refreshes the store from upstream
pub struct Poller {
    upstream: Arc<dyn Upstream>,
    store: Arc<ValueStore>,
    publisher: Arc<Publisher>,
    config: PollerConfig,
}

impl Poller {
    /// Creates a poller
    ///
    /// All writes go through `publisher`, which must wrap the same `store`.
    /// A poll interval below [`MIN_POLL_INTERVAL`] is raised to it.
    pub fn new(
        upstream: Arc<dyn Upstream>,
        store: Arc<ValueStore>,
        publisher: Arc<Publisher>,
        mut config: PollerConfig,
    ) -> Self {
        if config.poll_interval < MIN_POLL_INTERVAL {
            warn!("Poll interval {:?} is too short, using {:?}", config.poll_interval, MIN_POLL_INTERVAL);
            config.poll_interval = MIN_POLL_INTERVAL;
        }
        Self { upstream, store, publisher, config }
    }

    /// Spawns the bootstrap and the recurring cycle on the runtime
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Bootstraps, then polls forever
    ///
    /// While the chain id is still missing the bootstrap is retried before
    /// each cycle. Missed ticks are skipped rather than bunched up.
    pub async fn run(self) {
        info!(
            "Polling upstream every {:?} (blocks: {}, gas price: {})",
            self.config.poll_interval, self.config.track_blocks, self.config.track_gas_price
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;

            if self.store.get(CacheKey::ChainId).await.is_none() {
                self.bootstrap().await;
            }
            self.run_cycle().await;
        }
    }

    /// Fetches the chain id once and stores it as permanent
    ///
    /// # Returns
    /// Whether the chain id is now cached
    pub async fn bootstrap(&self) -> bool {
        match self.fetch("eth_chainId", self.upstream.chain_id()).await {
            Ok(chain_id) => {
                self.publisher.commit(CacheKey::ChainId, chain_id.into(), Observed::Permanent).await;
                info!("Upstream chain id is {}", chain_id);
                true
            }
            Err(e) => {
                warn!("Failed to fetch chain id, will retry next cycle: {}", e);
                false
            }
        }
    }

    /// Runs a single poll cycle
    ///
    /// Block number and gas price are fetched concurrently. Nothing is written
    /// unless the block number moved past the cached one. A failed block or
    /// gas price fetch is logged and leaves that entry as it was; the block
    /// number is still committed.
    pub async fn run_cycle(&self) -> CycleOutcome {
        let gas_price = async {
            if self.config.track_gas_price {
                Some(self.fetch("eth_gasPrice", self.upstream.gas_price()).await)
            } else {
                None
            }
        };
        let (block_number, gas_price) =
            tokio::join!(self.fetch("eth_blockNumber", self.upstream.block_number()), gas_price);

        let block_number = match block_number {
            Ok(number) => number,
            Err(e) => {
                warn!("Poll cycle abandoned, block number unavailable: {}", e);
                return CycleOutcome::Failed;
            }
        };

        if self.store.block_number().await.is_some_and(|cached| U256::from(block_number) <= cached) {
            debug!("Upstream still at block {}", block_number);
            return CycleOutcome::Unchanged { block_number };
        }

        let observed = Observed::now();
        if !self.publisher.commit(CacheKey::BlockNumber, block_number.into(), observed).await {
            return CycleOutcome::Unchanged { block_number };
        }
        info!("Upstream is on block {}", block_number);

        let block_cached = self.config.track_blocks && self.refresh_block(block_number).await;

        let gas_price_cached = match gas_price {
            Some(Ok(price)) => {
                self.publisher.commit(CacheKey::GasPrice, price.into(), observed).await
            }
            Some(Err(e)) => {
                warn!("Gas price unavailable for block {}, keeping previous value: {}", block_number, e);
                false
            }
            None => false,
        };

        CycleOutcome::Advanced { block_number, block_cached, gas_price_cached }
    }

    /// Fetches and caches the contents of `number`
    ///
    /// On failure the block number stays cached with its contents pending
    /// until the next block arrives.
    async fn refresh_block(&self, number: u64) -> bool {
        match self.fetch("eth_getBlockByNumber", self.upstream.block(number)).await {
            Ok(block) => {
                debug!("Fetched block {} with {} transactions", number, block.transactions.len());
                self.publisher.commit(CacheKey::Block, block.into(), Observed::now()).await
            }
            Err(e) => {
                warn!("Block {} cached without contents: {}", number, e);
                false
            }
        }
    }

    async fn fetch<T>(&self, method: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.config.request_timeout, call).await {
            Ok(result) => result.map_err(|e| e.wrap_err(format!("{method} failed"))),
            Err(_) => Err(eyre::eyre!("{} timed out after {:?}", method, self.config.request_timeout)),
        }
    }
}
