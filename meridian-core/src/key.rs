//! Canonical byte encoding for shard keys (§4.1): each typed key maps to a
//! byte string whose lexicographic order equals the key's semantic order.

use crate::error::CatalogError;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The key type a shard map is keyed on. Fixed at map-creation time; every
/// key and bound stored in that map must match it or encoding fails with
/// `InvalidKey`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShardKeyType {
    Int32,
    Int64,
    UInt32,
    Uuid,
    DateTime,
    DateTimeOffset,
    TimeSpan,
    Binary,
    String,
}

/// A typed shard key value, including the `-inf`/`+inf` sentinels used as
/// range-mapping bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ShardKeyValue {
    Int32(i32),
    Int64(i64),
    UInt32(u32),
    Uuid(Uuid),
    DateTime(NaiveDateTime),
    DateTimeOffset(DateTime<Utc>),
    TimeSpan(Duration),
    Binary(Vec<u8>),
    String(String),
    NegativeInfinity,
    PositiveInfinity,
}

/// The canonical byte encoding of a [`ShardKeyValue`]. `PositiveInfinity`
/// never materializes as bytes; it is kept as a distinguished variant so it
/// always compares greater than any finite encoding, including one that
/// happens to be all `0xff`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EncodedKey {
    Finite(Vec<u8>),
    PositiveInfinity,
}

impl From<i32> for ShardKeyValue {
    fn from(v: i32) -> Self {
        ShardKeyValue::Int32(v)
    }
}

impl From<i64> for ShardKeyValue {
    fn from(v: i64) -> Self {
        ShardKeyValue::Int64(v)
    }
}

impl From<u32> for ShardKeyValue {
    fn from(v: u32) -> Self {
        ShardKeyValue::UInt32(v)
    }
}

impl From<Uuid> for ShardKeyValue {
    fn from(v: Uuid) -> Self {
        ShardKeyValue::Uuid(v)
    }
}

impl From<NaiveDateTime> for ShardKeyValue {
    fn from(v: NaiveDateTime) -> Self {
        ShardKeyValue::DateTime(v)
    }
}

impl From<DateTime<Utc>> for ShardKeyValue {
    fn from(v: DateTime<Utc>) -> Self {
        ShardKeyValue::DateTimeOffset(v)
    }
}

impl From<Duration> for ShardKeyValue {
    fn from(v: Duration) -> Self {
        ShardKeyValue::TimeSpan(v)
    }
}

impl From<Vec<u8>> for ShardKeyValue {
    fn from(v: Vec<u8>) -> Self {
        ShardKeyValue::Binary(v)
    }
}

impl From<String> for ShardKeyValue {
    fn from(v: String) -> Self {
        ShardKeyValue::String(v)
    }
}

impl From<&str> for ShardKeyValue {
    fn from(v: &str) -> Self {
        ShardKeyValue::String(v.to_string())
    }
}

impl ShardKeyValue {
    /// The [`ShardKeyType`] this value is an instance of. The infinity
    /// sentinels have no fixed type; they are valid bounds for any type.
    pub fn key_type(&self) -> Option<ShardKeyType> {
        match self {
            ShardKeyValue::Int32(_) => Some(ShardKeyType::Int32),
            ShardKeyValue::Int64(_) => Some(ShardKeyType::Int64),
            ShardKeyValue::UInt32(_) => Some(ShardKeyType::UInt32),
            ShardKeyValue::Uuid(_) => Some(ShardKeyType::Uuid),
            ShardKeyValue::DateTime(_) => Some(ShardKeyType::DateTime),
            ShardKeyValue::DateTimeOffset(_) => Some(ShardKeyType::DateTimeOffset),
            ShardKeyValue::TimeSpan(_) => Some(ShardKeyType::TimeSpan),
            ShardKeyValue::Binary(_) => Some(ShardKeyType::Binary),
            ShardKeyValue::String(_) => Some(ShardKeyType::String),
            ShardKeyValue::NegativeInfinity | ShardKeyValue::PositiveInfinity => None,
        }
    }

    /// Encodes this value, validating it matches `expected` unless it is one
    /// of the infinity sentinels (valid against any key type).
    pub fn encode(&self, expected: ShardKeyType) -> Result<EncodedKey, CatalogError> {
        if let Some(actual) = self.key_type() {
            if actual != expected {
                return Err(CatalogError::InvalidKey {
                    message: format!("key type {actual:?} does not match map key type {expected:?}"),
                });
            }
        }

        Ok(match self {
            ShardKeyValue::NegativeInfinity => EncodedKey::Finite(Vec::new()),
            ShardKeyValue::PositiveInfinity => EncodedKey::PositiveInfinity,
            ShardKeyValue::Int32(v) => EncodedKey::Finite(encode_i32(*v)),
            ShardKeyValue::Int64(v) => EncodedKey::Finite(encode_i64(*v)),
            ShardKeyValue::UInt32(v) => EncodedKey::Finite(v.to_be_bytes().to_vec()),
            ShardKeyValue::Uuid(v) => EncodedKey::Finite(v.as_bytes().to_vec()),
            ShardKeyValue::DateTime(v) => {
                let ticks = v.and_utc().timestamp_nanos_opt().ok_or_else(|| CatalogError::InvalidKey {
                    message: "datetime out of representable range".into(),
                })?;
                EncodedKey::Finite(encode_i64(ticks))
            }
            ShardKeyValue::DateTimeOffset(v) => {
                let ticks = v.with_timezone(&Utc).timestamp_nanos_opt().ok_or_else(|| {
                    CatalogError::InvalidKey { message: "datetime offset out of representable range".into() }
                })?;
                EncodedKey::Finite(encode_i64(ticks))
            }
            ShardKeyValue::TimeSpan(v) => {
                let ticks = v.num_nanoseconds().ok_or_else(|| CatalogError::InvalidKey {
                    message: "time span out of representable range".into(),
                })?;
                EncodedKey::Finite(encode_i64(ticks))
            }
            ShardKeyValue::Binary(v) => EncodedKey::Finite(v.clone()),
            ShardKeyValue::String(v) => EncodedKey::Finite(encode_utf16_be(v)),
        })
    }
}

/// Sign-flips a signed 32-bit integer so that big-endian byte comparison of
/// the result matches signed integer comparison.
fn encode_i32(v: i32) -> Vec<u8> {
    ((v as u32) ^ 0x8000_0000).to_be_bytes().to_vec()
}

/// Sign-flips a signed 64-bit integer so that big-endian byte comparison of
/// the result matches signed integer comparison.
fn encode_i64(v: i64) -> Vec<u8> {
    ((v as u64) ^ 0x8000_0000_0000_0000).to_be_bytes().to_vec()
}

fn encode_utf16_be(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() * 2);
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_be_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn negative_infinity_is_empty_and_less_than_any_finite() {
        let neg = ShardKeyValue::NegativeInfinity.encode(ShardKeyType::Int32).unwrap();
        let zero = ShardKeyValue::Int32(0).encode(ShardKeyType::Int32).unwrap();
        assert_eq!(neg, EncodedKey::Finite(Vec::new()));
        assert!(neg < zero);
    }

    #[test]
    fn positive_infinity_is_greater_than_any_finite() {
        let pos = ShardKeyValue::PositiveInfinity.encode(ShardKeyType::Int32).unwrap();
        let max = ShardKeyValue::Int32(i32::MAX).encode(ShardKeyType::Int32).unwrap();
        assert!(pos > max);
    }

    #[test]
    fn wrong_key_type_fails_invalid_key() {
        let err = ShardKeyValue::Int64(1).encode(ShardKeyType::Int32).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidKey);
    }

    proptest! {
        #[test]
        fn int32_ordering_matches_encoding(a: i32, b: i32) {
            let ea = ShardKeyValue::Int32(a).encode(ShardKeyType::Int32).unwrap();
            let eb = ShardKeyValue::Int32(b).encode(ShardKeyType::Int32).unwrap();
            prop_assert_eq!(a.cmp(&b), ea.cmp(&eb));
        }

        #[test]
        fn int64_ordering_matches_encoding(a: i64, b: i64) {
            let ea = ShardKeyValue::Int64(a).encode(ShardKeyType::Int64).unwrap();
            let eb = ShardKeyValue::Int64(b).encode(ShardKeyType::Int64).unwrap();
            prop_assert_eq!(a.cmp(&b), ea.cmp(&eb));
        }

        #[test]
        fn uint32_ordering_matches_encoding(a: u32, b: u32) {
            let ea = ShardKeyValue::UInt32(a).encode(ShardKeyType::UInt32).unwrap();
            let eb = ShardKeyValue::UInt32(b).encode(ShardKeyType::UInt32).unwrap();
            prop_assert_eq!(a.cmp(&b), ea.cmp(&eb));
        }

        #[test]
        fn string_ordering_matches_encoding(a in "[a-zA-Z0-9]{0,12}", b in "[a-zA-Z0-9]{0,12}") {
            let ea = ShardKeyValue::String(a.clone()).encode(ShardKeyType::String).unwrap();
            let eb = ShardKeyValue::String(b.clone()).encode(ShardKeyType::String).unwrap();
            prop_assert_eq!(a.cmp(&b), ea.cmp(&eb));
        }
    }

    #[test]
    fn uuid_ordering_matches_textual_canonical_form() {
        let a = Uuid::parse_str("00000000-0000-0000-0000-000000000001").unwrap();
        let b = Uuid::parse_str("00000000-0000-0000-0000-000000000002").unwrap();
        let ea = ShardKeyValue::Uuid(a).encode(ShardKeyType::Uuid).unwrap();
        let eb = ShardKeyValue::Uuid(b).encode(ShardKeyType::Uuid).unwrap();
        assert_eq!(a.cmp(&b), ea.cmp(&eb));
    }
}
