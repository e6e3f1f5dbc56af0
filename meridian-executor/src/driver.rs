//! The minimal shard driver contract the fan-out executor depends on (§6):
//! `{ open(), execute_reader(), cancel(), close() }` plus a row cursor with
//! typed getters. Any driver satisfying this trait can be substituted;
//! hand-rolled boxed futures stand in for `async_trait` since nothing else
//! in this workspace pulls that crate in.

use crate::types::{Row, RowSchema, Value};
use meridian_core::CatalogResult;
use std::future::Future;
use std::pin::Pin;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A cursor over one shard's result set for a single command.
pub trait ShardRowCursor: Send {
    /// The reference schema this cursor will report, if it produces any
    /// rows. `None` is valid and means zero rows.
    fn schema(&self) -> Option<&RowSchema>;

    /// Advances and returns the next row, or `None` when exhausted.
    fn next_row(&mut self) -> CatalogResult<Option<Row>>;

    fn close(&mut self);
}

/// One open connection to a shard, capable of executing a single command
/// and producing a cursor over its results.
pub trait ShardConnection: Send {
    fn execute_reader<'a>(&'a mut self, sql: &'a str, params: &'a [Value]) -> BoxFuture<'a, CatalogResult<Box<dyn ShardRowCursor>>>;

    /// Requests cancellation of whatever command is in flight.
    fn cancel(&self);

    fn close(&mut self);
}

/// Opens connections against a shard's connection string. Implemented once
/// per concrete database driver; the executor is generic over this trait.
pub trait ShardDriver: Send + Sync {
    fn open<'a>(&'a self, connection_string: &'a str) -> BoxFuture<'a, CatalogResult<Box<dyn ShardConnection>>>;
}

#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use crate::types::ColumnSchema;
    use std::sync::Mutex;

    /// A deterministic, in-memory driver: each shard's connection string
    /// selects a fixed row set registered up front. No network or real
    /// connection is ever opened.
    pub struct FakeShardDriver {
        schema: RowSchema,
        rows_by_connection: std::collections::HashMap<String, Vec<Row>>,
    }

    impl FakeShardDriver {
        pub fn new(columns: Vec<ColumnSchema>) -> Self {
            Self { schema: RowSchema { columns }, rows_by_connection: std::collections::HashMap::new() }
        }

        pub fn register(&mut self, connection_string: impl Into<String>, rows: Vec<Row>) {
            self.rows_by_connection.insert(connection_string.into(), rows);
        }
    }

    struct FakeCursor {
        schema: RowSchema,
        rows: std::vec::IntoIter<Row>,
    }

    impl ShardRowCursor for FakeCursor {
        fn schema(&self) -> Option<&RowSchema> {
            Some(&self.schema)
        }

        fn next_row(&mut self) -> CatalogResult<Option<Row>> {
            Ok(self.rows.next())
        }

        fn close(&mut self) {}
    }

    struct FakeConnection {
        schema: RowSchema,
        rows: Vec<Row>,
        canceled: Mutex<bool>,
    }

    impl ShardConnection for FakeConnection {
        fn execute_reader<'a>(&'a mut self, _sql: &'a str, _params: &'a [Value]) -> BoxFuture<'a, CatalogResult<Box<dyn ShardRowCursor>>> {
            Box::pin(async move {
                if *self.canceled.lock().unwrap() {
                    return Err(meridian_core::CatalogError::Canceled);
                }
                let cursor: Box<dyn ShardRowCursor> =
                    Box::new(FakeCursor { schema: self.schema.clone(), rows: self.rows.clone().into_iter() });
                Ok(cursor)
            })
        }

        fn cancel(&self) {
            *self.canceled.lock().unwrap() = true;
        }

        fn close(&mut self) {}
    }

    impl ShardDriver for FakeShardDriver {
        fn open<'a>(&'a self, connection_string: &'a str) -> BoxFuture<'a, CatalogResult<Box<dyn ShardConnection>>> {
            let rows = self.rows_by_connection.get(connection_string).cloned().unwrap_or_default();
            let schema = self.schema.clone();
            Box::pin(async move {
                let conn: Box<dyn ShardConnection> = Box::new(FakeConnection { schema, rows, canceled: Mutex::new(false) });
                Ok(conn)
            })
        }
    }
}
