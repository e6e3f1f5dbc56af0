//! Row and schema types exchanged across the shard driver boundary (§6
//! "Query-time driver contract").

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The wire type of one column, as reported by a shard's row schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Int32,
    Int64,
    UInt32,
    Float64,
    Boolean,
    String,
    Binary,
    DateTime,
    Uuid,
}

/// A single typed column value, or SQL `NULL`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int32(i32),
    Int64(i64),
    UInt32(u32),
    Float64(f64),
    Boolean(bool),
    String(String),
    Binary(Vec<u8>),
    DateTime(NaiveDateTime),
    Uuid(Uuid),
    Null,
}

/// One column's name and type, in ordinal position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: ColumnType,
}

/// The ordered column list a reader reports before producing rows. `None`
/// is a valid schema for a reader that will produce zero rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RowSchema {
    pub columns: Vec<ColumnSchema>,
}

impl RowSchema {
    pub fn ordinal_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Whether `self` and `other` agree on the ordered `(name, data_type)`
    /// sequence a reconciled reader must match (§4.6 "Schema reconciliation").
    pub fn reconciles_with(&self, other: &RowSchema) -> bool {
        self.columns.len() == other.columns.len()
            && self.columns.iter().zip(&other.columns).all(|(a, b)| a.name == b.name && a.data_type == b.data_type)
    }
}

/// One row of typed values, in the same ordinal order as its reader's
/// [`RowSchema`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    pub values: Vec<Value>,
}
