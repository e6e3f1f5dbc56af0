//! Data model for the shard map catalog (§3): shard maps, shards, and
//! list/range mappings.

use crate::error::CatalogError;
use crate::key::{EncodedKey, ShardKeyType};
use serde::{Deserialize, Serialize};
use unicode_categories::UnicodeCategories;
use uuid::Uuid;

/// Whether a shard map is keyed by discrete points (`List`) or half-open
/// ranges (`Range`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShardMapKind {
    List,
    Range,
}

/// `Online`/`Offline` lifecycle state shared by shards and mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Online,
    Offline,
}

impl Status {
    /// Whether moving from `self` to `next` is a legal transition. Only
    /// `Online <-> Offline` is defined; anything else (including a no-op
    /// transition) is rejected so callers get a clear error instead of a
    /// silent accept.
    pub fn can_transition_to(self, next: Status) -> bool {
        self != next
    }
}

/// `{server, database}` identifying one physical shard, and the string
/// substituted into the `$ShardName` pseudo-column (§4.6).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardLocation {
    pub server: String,
    pub database: String,
}

impl ShardLocation {
    pub fn new(server: impl Into<String>, database: impl Into<String>) -> Self {
        Self { server: server.into(), database: database.into() }
    }

    /// The `"<server>;<database>"` form used both for the `$ShardName`
    /// column and for connection-string templating.
    pub fn display_name(&self) -> String {
        format!("{};{}", self.server, self.database)
    }
}

impl std::fmt::Display for ShardLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// A named directory of key-to-shard mappings (§3 "Shard map").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardMap {
    pub id: Uuid,
    pub name: String,
    pub kind: ShardMapKind,
    pub key_type: ShardKeyType,
    pub version: u64,
}

/// Validates a shard map name: 1..50 Unicode characters, each a letter,
/// digit, or punctuation.
pub fn validate_shard_map_name(name: &str) -> Result<(), CatalogError> {
    let len = name.chars().count();
    if len == 0 || len > 50 {
        return Err(CatalogError::InvalidShardMapName { name: name.to_string() });
    }
    if !name.chars().all(|c| c.is_alphanumeric() || c.is_punctuation()) {
        return Err(CatalogError::InvalidShardMapName { name: name.to_string() });
    }
    Ok(())
}

/// One physical database hosting a subset of a shard map's data (§3 "Shard").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shard {
    pub id: Uuid,
    pub map_id: Uuid,
    pub location: ShardLocation,
    pub status: Status,
    pub version: u64,
}

/// A list-map mapping: one discrete key pointing at a shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListMapping {
    pub id: Uuid,
    pub map_id: Uuid,
    pub shard_id: Uuid,
    pub key: EncodedKey,
    pub status: Status,
    pub lock_token: Option<Uuid>,
    pub version: u64,
}

/// A range-map mapping: a half-open `[low, high)` interval pointing at a
/// shard. `high` may be `EncodedKey::PositiveInfinity`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeMapping {
    pub id: Uuid,
    pub map_id: Uuid,
    pub shard_id: Uuid,
    pub low: EncodedKey,
    pub high: EncodedKey,
    pub status: Status,
    pub lock_token: Option<Uuid>,
    pub version: u64,
}

impl RangeMapping {
    /// Whether `key` falls within this mapping's half-open interval.
    pub fn contains(&self, key: &EncodedKey) -> bool {
        &self.low <= key && key < &self.high
    }

    /// Whether this range overlaps another half-open range (I1).
    pub fn overlaps(&self, other_low: &EncodedKey, other_high: &EncodedKey) -> bool {
        &self.low < other_high && other_low < &self.high
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation_rejects_empty_and_overlong() {
        assert!(validate_shard_map_name("").is_err());
        assert!(validate_shard_map_name(&"a".repeat(51)).is_err());
        assert!(validate_shard_map_name(&"a".repeat(50)).is_ok());
    }

    #[test]
    fn name_validation_rejects_non_letter_digit_punct() {
        assert!(validate_shard_map_name("orders table").is_err());
        assert!(validate_shard_map_name("orders-table_v2").is_ok());
    }

    #[test]
    fn name_validation_accepts_unicode_punctuation() {
        assert!(validate_shard_map_name("orders\u{2014}table").is_ok()); // em dash
        assert!(validate_shard_map_name("orders\u{FF0C}table").is_ok()); // fullwidth comma
    }

    #[test]
    fn status_transition_rules() {
        assert!(Status::Online.can_transition_to(Status::Offline));
        assert!(!Status::Online.can_transition_to(Status::Online));
    }

    #[test]
    fn range_contains_is_half_open() {
        let m = RangeMapping {
            id: Uuid::nil(),
            map_id: Uuid::nil(),
            shard_id: Uuid::nil(),
            low: EncodedKey::Finite(vec![0]),
            high: EncodedKey::Finite(vec![10]),
            status: Status::Online,
            lock_token: None,
            version: 1,
        };
        assert!(m.contains(&EncodedKey::Finite(vec![0])));
        assert!(!m.contains(&EncodedKey::Finite(vec![10])));
    }

    #[test]
    fn range_overlap_detection() {
        let a_low = EncodedKey::Finite(vec![0]);
        let a_high = EncodedKey::Finite(vec![10]);
        let b_low = EncodedKey::Finite(vec![10]);
        let b_high = EncodedKey::Finite(vec![20]);
        let m = RangeMapping {
            id: Uuid::nil(),
            map_id: Uuid::nil(),
            shard_id: Uuid::nil(),
            low: a_low,
            high: a_high,
            status: Status::Online,
            lock_token: None,
            version: 1,
        };
        assert!(!m.overlaps(&b_low, &b_high));
    }
}
