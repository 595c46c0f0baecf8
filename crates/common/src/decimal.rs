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

//! Decimal-string encoding for chain quantities
//!
//! Chain quantities (gas prices, difficulties, chain ids) routinely exceed the
//! 2^53 range that JSON consumers can represent exactly as numbers. Every
//! integer that crosses a process boundary is therefore written as a base-10
//! string and parsed back without going through floating point.
//!
//! Use with `#[serde(with = "chain_cache_common::decimal")]` on any field whose
//! type implements [`Display`] and [`FromStr`] (`u64`, `u128`, `U256`, ...), or
//! with `decimal::option` for optional fields.

use serde::{de::Error as _, Deserialize, Deserializer, Serializer};
use std::{fmt::Display, str::FromStr};

/// Serialize an integer as its decimal string representation
pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    T: Display,
    S: Serializer,
{
    serializer.collect_str(value)
}

/// Deserialize an integer from a decimal string
///
/// Strings with a sign, whitespace, or a radix prefix are rejected.
pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
where
    T: FromStr,
    T::Err: Display,
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse(&raw).map_err(D::Error::custom)
}

/// Parse a strictly decimal string into an integer type
pub fn parse<T>(raw: &str) -> Result<T, String>
where
    T: FromStr,
    T::Err: Display,
{
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("expected a decimal integer string, got {raw:?}"));
    }
    raw.parse::<T>().map_err(|e| format!("invalid decimal integer {raw:?}: {e}"))
}

/// Same encoding for `Option<T>`; `None` maps to `null`
pub mod option {
    use super::*;

    /// Serialize `Some(value)` as a decimal string and `None` as `null`
    pub fn serialize<T, S>(value: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Display,
        S: Serializer,
    {
        match value {
            Some(value) => serializer.collect_str(value),
            None => serializer.serialize_none(),
        }
    }

    /// Deserialize a decimal string or `null`
    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        T: FromStr,
        T::Err: Display,
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|raw| parse(&raw).map_err(D::Error::custom))
            .transpose()
    }
}
