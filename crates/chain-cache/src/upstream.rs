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

//! Upstream RPC capability consumed by the poller

use crate::types::BlockRecord;
use alloy_provider::{DynProvider, Provider, ProviderBuilder};
use alloy_rpc_types::{Block, BlockNumberOrTag};
use async_trait::async_trait;
use eyre::Result;
use tracing::info;

/// The four upstream reads the cache depends on
///
/// Every call may fail with a transport or protocol error. Implementations do
/// not need their own timeouts; the poller bounds each call.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// `eth_chainId`
    async fn chain_id(&self) -> Result<u64>;

    /// `eth_blockNumber`
    async fn block_number(&self) -> Result<u64>;

    /// `eth_getBlockByNumber` with transaction hashes only
    ///
    /// A block the upstream does not know yet is an error.
    async fn block(&self, number: u64) -> Result<BlockRecord>;

    /// `eth_gasPrice`
    async fn gas_price(&self) -> Result<u128>;
}

/// [`Upstream`] backed by an alloy provider over HTTP
pub struct AlloyUpstream {
    url: String,
    provider: DynProvider,
}

impl AlloyUpstream {
    /// Creates a provider for the given RPC URL
    ///
    /// No request is sent; an unreachable endpoint surfaces on the first poll.
    pub async fn connect(url: &str) -> Result<Self> {
        let provider = ProviderBuilder::new().connect(url).await?.erased();
        info!("Using upstream RPC {}", url);
        Ok(Self { url: url.to_string(), provider })
    }

    /// The RPC URL this upstream talks to
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Upstream for AlloyUpstream {
    async fn chain_id(&self) -> Result<u64> {
        Ok(self.provider.get_chain_id().await?)
    }

    async fn block_number(&self) -> Result<u64> {
        Ok(self.provider.get_block_number().await?)
    }

    async fn block(&self, number: u64) -> Result<BlockRecord> {
        let block = self
            .provider
            .get_block_by_number(BlockNumberOrTag::Number(number))
            .await?
            .ok_or_else(|| eyre::eyre!("Block {} not available upstream", number))?;
        Ok(block_record(&block))
    }

    async fn gas_price(&self) -> Result<u128> {
        Ok(self.provider.get_gas_price().await?)
    }
}

fn block_record(block: &Block) -> BlockRecord {
    let header = &block.header;
    BlockRecord {
        number: header.number,
        hash: header.hash,
        parent_hash: header.parent_hash,
        timestamp: header.timestamp,
        miner: header.beneficiary,
        gas_limit: header.gas_limit,
        gas_used: header.gas_used,
        base_fee_per_gas: header.base_fee_per_gas,
        difficulty: header.difficulty,
        size: header.size,
        transactions: block.transactions.hashes().collect(),
    }
}

/// Scripted upstream for unit tests
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::types::tests::sample_block;
    use parking_lot::Mutex;
    use std::{collections::VecDeque, time::Duration};

    /// Pops one scripted response per call; an empty script fails the call
    #[derive(Default)]
    pub(crate) struct ScriptedUpstream {
        pub chain_ids: Mutex<VecDeque<Result<u64>>>,
        pub block_numbers: Mutex<VecDeque<Result<u64>>>,
        pub gas_prices: Mutex<VecDeque<Result<u128>>>,
        pub failing_blocks: Mutex<Vec<u64>>,
        pub requested_blocks: Mutex<Vec<u64>>,
        pub block_number_delay: Option<Duration>,
    }

    fn next<T>(queue: &Mutex<VecDeque<Result<T>>>, what: &str) -> Result<T> {
        queue.lock().pop_front().unwrap_or_else(|| Err(eyre::eyre!("no scripted {what}")))
    }

    impl ScriptedUpstream {
        pub(crate) fn with_block_numbers(numbers: impl IntoIterator<Item = u64>) -> Self {
            let upstream = Self::default();
            upstream.block_numbers.lock().extend(numbers.into_iter().map(Ok));
            upstream
        }

        pub(crate) fn push_chain_id(&self, result: Result<u64>) {
            self.chain_ids.lock().push_back(result);
        }

        pub(crate) fn push_gas_price(&self, result: Result<u128>) {
            self.gas_prices.lock().push_back(result);
        }

        pub(crate) fn fail_block(&self, number: u64) {
            self.failing_blocks.lock().push(number);
        }
    }

    #[async_trait]
    impl Upstream for ScriptedUpstream {
        async fn chain_id(&self) -> Result<u64> {
            next(&self.chain_ids, "chain id")
        }

        async fn block_number(&self) -> Result<u64> {
            if let Some(delay) = self.block_number_delay {
                tokio::time::sleep(delay).await;
            }
            next(&self.block_numbers, "block number")
        }

        async fn block(&self, number: u64) -> Result<BlockRecord> {
            self.requested_blocks.lock().push(number);
            if self.failing_blocks.lock().contains(&number) {
                eyre::bail!("scripted failure for block {}", number);
            }
            Ok(sample_block(number))
        }

        async fn gas_price(&self) -> Result<u128> {
            next(&self.gas_prices, "gas price")
        }
    }
}
