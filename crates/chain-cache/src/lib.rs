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

//! Chain Cache Library
//!
//! Keeps the latest chain id, block number, block contents and gas price of an
//! upstream Ethereum node in memory. Values are refreshed by a single poller,
//! served over HTTP and pushed to WebSocket subscribers as they change.

pub mod error;
pub mod health;
pub mod poller;
pub mod publisher;
pub mod server;
pub mod store;
pub mod types;
pub mod upstream;

pub use error::ApiError;
pub use poller::{CycleOutcome, Poller, PollerConfig};
pub use publisher::{Publisher, Subscription};
pub use server::{CacheServer, CacheServerBuilder};
pub use store::ValueStore;
pub use types::{BlockRecord, CacheEntry, CacheKey, CacheValue, Observed, UpdateEvent, WriteOrdering};
pub use upstream::{AlloyUpstream, Upstream};
