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

//! Cache keys, values and the update event wire format
//!
//! All integers are held as arbitrary-precision values and leave the process
//! as decimal strings (see [`chain_cache_common::decimal`]).

use alloy_primitives::{Address, B256, U256};
use chain_cache_common::decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};

/// The fixed set of values the cache tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CacheKey {
    /// Chain id, fetched once at startup
    ChainId,
    /// Latest block number, only ever moves forward
    BlockNumber,
    /// Contents of the block at the cached block number
    Block,
    /// Current gas price in wei
    GasPrice,
}

impl CacheKey {
    /// Every key, in the order snapshots are sent to subscribers
    pub const ALL: [Self; 4] = [Self::ChainId, Self::BlockNumber, Self::Block, Self::GasPrice];

    /// Wire name used in queries and events
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ChainId => "chainId",
            Self::BlockNumber => "blockNumber",
            Self::Block => "block",
            Self::GasPrice => "gasPrice",
        }
    }

    /// Write ordering applied by the store for this key
    pub const fn ordering(&self) -> WriteOrdering {
        match self {
            Self::BlockNumber => WriteOrdering::Monotonic,
            Self::ChainId | Self::Block | Self::GasPrice => WriteOrdering::Overwrite,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a caller names a key the cache does not track
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown cache key: {0}")]
pub struct UnknownKey(pub String);

impl FromStr for CacheKey {
    type Err = UnknownKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL.into_iter().find(|key| key.as_str() == s).ok_or_else(|| UnknownKey(s.to_string()))
    }
}

/// How a write to a key is reconciled with the current entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrdering {
    /// Accepted only if strictly greater than the current value
    Monotonic,
    /// Always accepted
    Overwrite,
}

/// Block contents as cached and served
///
/// Integer fields are decimal strings on the wire; hashes and addresses stay
/// 0x-prefixed hex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockRecord {
    /// Block number
    #[serde(with = "decimal")]
    pub number: u64,
    /// Block hash
    pub hash: B256,
    /// Hash of the parent block
    pub parent_hash: B256,
    /// Unix timestamp in seconds
    #[serde(with = "decimal")]
    pub timestamp: u64,
    /// Fee recipient
    pub miner: Address,
    /// Gas limit
    #[serde(with = "decimal")]
    pub gas_limit: u64,
    /// Gas used by all transactions
    #[serde(with = "decimal")]
    pub gas_used: u64,
    /// EIP-1559 base fee, absent before London
    #[serde(default, with = "decimal::option", skip_serializing_if = "Option::is_none")]
    pub base_fee_per_gas: Option<u64>,
    /// Proof-of-work difficulty, zero after the merge
    #[serde(with = "decimal")]
    pub difficulty: U256,
    /// Encoded size in bytes, if reported
    #[serde(default, with = "decimal::option", skip_serializing_if = "Option::is_none")]
    pub size: Option<U256>,
    /// Transaction hashes, in block order
    pub transactions: Vec<B256>,
}

/// A cached value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CacheValue {
    /// Any integer quantity (chain id, block number, gas price)
    Quantity(#[serde(with = "decimal")] U256),
    /// Full block contents
    Block(Box<BlockRecord>),
}

impl CacheValue {
    /// The integer held by this value, if it is a quantity
    pub fn as_quantity(&self) -> Option<U256> {
        match self {
            Self::Quantity(value) => Some(*value),
            Self::Block(_) => None,
        }
    }
}

impl From<u64> for CacheValue {
    fn from(value: u64) -> Self {
        Self::Quantity(U256::from(value))
    }
}

impl From<u128> for CacheValue {
    fn from(value: u128) -> Self {
        Self::Quantity(U256::from(value))
    }
}

impl From<U256> for CacheValue {
    fn from(value: U256) -> Self {
        Self::Quantity(value)
    }
}

impl From<BlockRecord> for CacheValue {
    fn from(block: BlockRecord) -> Self {
        Self::Block(Box::new(block))
    }
}

/// When a value was observed upstream
///
/// Serialized as epoch milliseconds, or `null` for permanent values that are
/// fetched once and never re-pushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observed {
    /// Observed at the given unix time in milliseconds
    At(u64),
    /// Never expires (chain id)
    Permanent,
}

impl Observed {
    /// The current wall-clock time
    pub fn now() -> Self {
        Self::At(u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default())
    }

    /// Epoch milliseconds, or `None` for permanent values
    pub const fn as_millis(&self) -> Option<u64> {
        match self {
            Self::At(millis) => Some(*millis),
            Self::Permanent => None,
        }
    }
}

impl Serialize for Observed {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.as_millis().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Observed {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map_or(Self::Permanent, Self::At))
    }
}

/// One cached value together with its key and observation time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Which value this is
    pub key: CacheKey,
    /// The value itself
    pub value: CacheValue,
    /// When it was observed upstream
    pub observed: Observed,
}

impl CacheEntry {
    /// The update event announcing this entry
    pub fn to_event(&self) -> UpdateEvent {
        UpdateEvent { method: self.key, value: self.value.clone(), timestamp: self.observed }
    }
}

/// Event pushed to subscribers, both for snapshots and live updates
///
/// ```json
/// { "method": "blockNumber", "value": "19000000", "timestamp": 1700000000000 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateEvent {
    /// Key that changed
    pub method: CacheKey,
    /// New value
    pub value: CacheValue,
    /// Observation time, `null` for permanent values
    pub timestamp: Observed,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn sample_block(number: u64) -> BlockRecord {
        BlockRecord {
            number,
            hash: B256::repeat_byte(0xab),
            parent_hash: B256::repeat_byte(0xcd),
            timestamp: 1_700_000_000,
            miner: Address::repeat_byte(0x11),
            gas_limit: 30_000_000,
            gas_used: 12_345_678,
            base_fee_per_gas: Some(7),
            difficulty: U256::ZERO,
            size: Some(U256::from(1024)),
            transactions: vec![B256::repeat_byte(0x01), B256::repeat_byte(0x02)],
        }
    }

    #[test]
    fn test_key_names_round_trip() {
        for key in CacheKey::ALL {
            assert_eq!(key.as_str().parse::<CacheKey>().unwrap(), key);
            assert_eq!(serde_json::to_value(key).unwrap(), json!(key.as_str()));
        }
        assert_eq!("unknownKey".parse::<CacheKey>(), Err(UnknownKey("unknownKey".into())));
        assert!("blocknumber".parse::<CacheKey>().is_err());
    }

    #[test]
    fn test_only_block_number_is_monotonic() {
        assert_eq!(CacheKey::BlockNumber.ordering(), WriteOrdering::Monotonic);
        assert_eq!(CacheKey::ChainId.ordering(), WriteOrdering::Overwrite);
        assert_eq!(CacheKey::Block.ordering(), WriteOrdering::Overwrite);
        assert_eq!(CacheKey::GasPrice.ordering(), WriteOrdering::Overwrite);
    }

    #[test]
    fn test_event_shape() {
        let event = UpdateEvent {
            method: CacheKey::BlockNumber,
            value: CacheValue::from(100u64),
            timestamp: Observed::At(1_700_000_000_123),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({ "method": "blockNumber", "value": "100", "timestamp": 1_700_000_000_123u64 })
        );

        let permanent = UpdateEvent {
            method: CacheKey::ChainId,
            value: CacheValue::from(1u64),
            timestamp: Observed::Permanent,
        };
        assert_eq!(
            serde_json::to_value(&permanent).unwrap(),
            json!({ "method": "chainId", "value": "1", "timestamp": null })
        );
    }

    #[test]
    fn test_large_quantity_event_round_trip() {
        let above_f64 = U256::from(1u64 << 53) + U256::from(1);
        let event = UpdateEvent {
            method: CacheKey::GasPrice,
            value: CacheValue::Quantity(above_f64),
            timestamp: Observed::At(1),
        };

        let text = serde_json::to_string(&event).unwrap();
        assert!(text.contains("\"9007199254740993\""));

        let back: UpdateEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_block_serializes_integers_as_decimal_strings() {
        let value = serde_json::to_value(CacheValue::from(sample_block(19_000_000))).unwrap();
        assert_eq!(value["number"], "19000000");
        assert_eq!(value["gasLimit"], "30000000");
        assert_eq!(value["baseFeePerGas"], "7");
        assert_eq!(value["size"], "1024");
        assert_eq!(value["hash"], serde_json::to_value(B256::repeat_byte(0xab)).unwrap());
        assert_eq!(value["transactions"].as_array().unwrap().len(), 2);

        let back: CacheValue = serde_json::from_value(value).unwrap();
        assert_eq!(back, CacheValue::from(sample_block(19_000_000)));
    }

    #[test]
    fn test_observed_now_is_recent() {
        let before = chrono::Utc::now().timestamp_millis() as u64;
        let observed = Observed::now().as_millis().unwrap();
        assert!(observed >= before);
        assert_eq!(Observed::Permanent.as_millis(), None);
    }
}
