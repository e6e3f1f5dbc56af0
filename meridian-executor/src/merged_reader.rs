//! The merged row reader (§4.6): a single logical cursor assembling rows
//! from every labeled per-shard reader, with schema reconciliation,
//! dynamic reader registration, and the `$ShardName` pseudo-column.
//!
//! Grounded on the scatter-gather merge shape in
//! `other_examples/.../scatter_gather.rs` (per-shard cursors feeding one
//! logical result), generalized here from a k-way key merge to sequential
//! reader draining, since §5 promises no cross-shard row ordering.

use crate::cancel::CancellationSignal;
use crate::driver::ShardRowCursor;
use crate::types::{Row, RowSchema, Value};
use meridian_core::{CatalogError, CatalogResult, ExecutionOptions, ShardLocation};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::Cursor as ByteCursor;
use std::sync::Arc;
use tokio::sync::Notify;

const SHARD_NAME_COLUMN: &str = "$ShardName";

/// One shard's opened cursor paired with the location it came from, ready
/// to be registered with a [`MergedRowReader`].
pub struct LabeledReader {
    pub cursor: Box<dyn ShardRowCursor>,
    pub shard_location: ShardLocation,
}

/// The state machine named in §4.6:
/// `Empty -> AwaitingReaders -> Reading(i) -> (ReaderExhausted -> Reading(i+1) | NoMoreReaders -> Closed)`.
/// Tracked implicitly by `Inner`'s fields rather than as an explicit enum,
/// since every transition is a deterministic function of
/// `(current, pending, no_more_readers, closed)`.
struct Inner {
    pending: VecDeque<LabeledReader>,
    current: Option<LabeledReader>,
    current_row: Option<Row>,
    reference_schema: Option<RowSchema>,
    exceptions: Vec<crate::policy::MultiShardException>,
    registered: usize,
    no_more_readers: bool,
    closed: bool,
    has_read_once: bool,
    /// Set once `read_async`/`current_value` observe `cancel` raised. Once
    /// true, both accessors fail `Canceled` for the rest of this reader's
    /// life, per §5's "cancelled command... further accessors fail
    /// `Canceled`".
    canceled: bool,
}

/// The single logical cursor presented to a fan-out caller (§4.6). Readers
/// may be registered from any thread via [`MergedRowReader::add_reader`];
/// `read_async` is single-consumer, matching §5's "not supported" note on
/// concurrent reads.
pub struct MergedRowReader {
    inner: Mutex<Inner>,
    notify: Notify,
    expected_reader_count: usize,
    include_shard_name_column: bool,
    cancel: Arc<CancellationSignal>,
}

impl MergedRowReader {
    pub fn new(expected_reader_count: usize, options: ExecutionOptions, cancel: Arc<CancellationSignal>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                pending: VecDeque::new(),
                current: None,
                current_row: None,
                reference_schema: None,
                exceptions: Vec::new(),
                registered: 0,
                no_more_readers: false,
                closed: false,
                has_read_once: false,
                canceled: false,
            }),
            notify: Notify::new(),
            expected_reader_count,
            include_shard_name_column: matches!(options, ExecutionOptions::IncludeShardNameColumn),
            cancel,
        }
    }

    /// Registers a successfully opened shard reader. Resolves the open
    /// question on null reader entries (SPEC_FULL.md §9) by making a null
    /// cursor unrepresentable at this boundary: the executor calls
    /// [`MergedRowReader::record_fault`] for a shard that never produced a
    /// cursor, and only ever calls `add_reader` with a real one.
    pub fn add_reader(&self, labeled: LabeledReader) -> CatalogResult<()> {
        let mut inner = self.inner.lock();
        if inner.closed || inner.no_more_readers {
            return Err(CatalogError::InternalError {
                message: "add_reader called after close or expect_no_more_readers".into(),
            });
        }
        if inner.registered >= self.expected_reader_count {
            return Err(CatalogError::InternalError {
                message: format!("add_reader exceeded expected_reader_count ({})", self.expected_reader_count),
            });
        }
        inner.registered += 1;

        match labeled.cursor.schema() {
            None => {
                inner.pending.push_back(labeled);
            }
            Some(schema) => {
                if let Some(reference) = inner.reference_schema.clone() {
                    if !reference.reconciles_with(schema) {
                        let mismatch = CatalogError::SchemaMismatch {
                            message: format!(
                                "reader from {} does not match the reference schema",
                                labeled.shard_location
                            ),
                        };
                        let mut labeled = labeled;
                        labeled.cursor.close();
                        inner.exceptions.push(crate::policy::MultiShardException {
                            shard_location: labeled.shard_location,
                            inner: mismatch,
                        });
                        drop(inner);
                        self.notify.notify_waiters();
                        return Ok(());
                    }
                } else {
                    inner.reference_schema = Some(schema.clone());
                }
                inner.pending.push_back(labeled);
            }
        }

        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    /// Records a shard that failed before producing a reader at all (open
    /// failure, execute failure, or cancellation). Counts against
    /// `expected_reader_count` exactly like a successful registration.
    pub fn record_fault(&self, shard_location: ShardLocation, error: CatalogError) {
        let mut inner = self.inner.lock();
        inner.registered += 1;
        inner.exceptions.push(crate::policy::MultiShardException { shard_location, inner: error });
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Signals that no further `add_reader`/`record_fault` calls will
    /// arrive. Fails `InternalError` if fewer shards registered than
    /// `expected_reader_count` promised, or if called twice.
    pub fn expect_no_more_readers(&self) -> CatalogResult<()> {
        let mut inner = self.inner.lock();
        if inner.no_more_readers {
            return Err(CatalogError::InternalError { message: "expect_no_more_readers called twice".into() });
        }
        if inner.registered != self.expected_reader_count {
            return Err(CatalogError::InternalError {
                message: format!(
                    "expect_no_more_readers called with {} of {} shards registered",
                    inner.registered, self.expected_reader_count
                ),
            });
        }
        inner.no_more_readers = true;
        drop(inner);
        self.notify.notify_waiters();
        Ok(())
    }

    pub fn multi_shard_exceptions(&self) -> Vec<crate::policy::MultiShardException> {
        self.inner.lock().exceptions.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn has_rows(&self) -> bool {
        self.inner.lock().has_read_once
    }

    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if let Some(mut current) = inner.current.take() {
            current.cursor.close();
        }
        while let Some(mut pending) = inner.pending.pop_front() {
            pending.cursor.close();
        }
        inner.closed = true;
        drop(inner);
        self.notify.notify_waiters();
    }

    /// `next_result()` always fails `NotSupported`: a multi-shard command
    /// never carries more than one result set (§4.6).
    pub fn next_result(&self) -> CatalogResult<bool> {
        Err(CatalogError::NotSupported { message: "MergedRowReader does not support multiple result sets".into() })
    }

    fn effective_field_count(&self) -> usize {
        let inner = self.inner.lock();
        let base = inner.reference_schema.as_ref().map(|s| s.columns.len()).unwrap_or(0);
        base + usize::from(self.include_shard_name_column && inner.reference_schema.is_some())
    }

    pub fn field_count(&self) -> usize {
        self.effective_field_count()
    }

    pub fn visible_field_count(&self) -> usize {
        self.effective_field_count()
    }

    pub fn get_name(&self, ordinal: usize) -> CatalogResult<String> {
        let inner = self.inner.lock();
        let schema = inner
            .reference_schema
            .as_ref()
            .ok_or_else(|| CatalogError::InternalError { message: "no schema available yet".into() })?;
        if self.include_shard_name_column && ordinal == schema.columns.len() {
            return Ok(SHARD_NAME_COLUMN.to_string());
        }
        schema
            .columns
            .get(ordinal)
            .map(|c| c.name.clone())
            .ok_or_else(|| CatalogError::InternalError { message: format!("ordinal {ordinal} out of range") })
    }

    pub fn get_ordinal(&self, name: &str) -> CatalogResult<usize> {
        let inner = self.inner.lock();
        let schema = inner
            .reference_schema
            .as_ref()
            .ok_or_else(|| CatalogError::InternalError { message: "no schema available yet".into() })?;
        if let Some(ordinal) = schema.ordinal_of(name) {
            return Ok(ordinal);
        }
        if self.include_shard_name_column && name == SHARD_NAME_COLUMN {
            return Ok(schema.columns.len());
        }
        Err(CatalogError::InternalError { message: format!("no column named {name}") })
    }

    /// Async read, the §5 suspension point: drains the current reader,
    /// advancing to the next registered one on exhaustion, blocking
    /// cooperatively when none is registered yet but more are expected.
    pub async fn read_async(&self) -> CatalogResult<bool> {
        loop {
            // The `Notified` future must be created while `inner` is still
            // locked: `add_reader`/`record_fault` also take that lock before
            // calling `notify_waiters`, so creating it here (rather than
            // after the guard drops below) closes the race where a reader
            // arrives between our state check and the await, which would
            // otherwise be a missed wakeup with no one left to retry it.
            let mut wait: Option<tokio::sync::Notified<'_>> = None;
            {
                let mut inner = self.inner.lock();
                if inner.canceled {
                    return Err(CatalogError::Canceled);
                }
                if self.cancel.is_canceled() {
                    self.close_locked(&mut inner);
                    inner.canceled = true;
                    return Err(CatalogError::Canceled);
                }
                if inner.closed {
                    return Ok(false);
                }

                if inner.current.is_none() {
                    match inner.pending.pop_front() {
                        Some(next) => inner.current = Some(next),
                        None if inner.no_more_readers => {
                            inner.closed = true;
                            return Ok(false);
                        }
                        None => {
                            wait = Some(self.notify.notified());
                        }
                    }
                }

                if inner.current.is_some() {
                    let location = inner.current.as_ref().unwrap().shard_location.clone();
                    match inner.current.as_mut().unwrap().cursor.next_row() {
                        Ok(Some(row)) => {
                            inner.current_row = Some(row);
                            inner.has_read_once = true;
                            return Ok(true);
                        }
                        Ok(None) => {
                            if let Some(mut done) = inner.current.take() {
                                done.cursor.close();
                            }
                            continue;
                        }
                        Err(error) => {
                            if let Some(mut failed) = inner.current.take() {
                                failed.cursor.close();
                            }
                            inner.exceptions.push(crate::policy::MultiShardException { shard_location: location, inner: error });
                            continue;
                        }
                    }
                }
            }
            if let Some(notified) = wait {
                tokio::select! {
                    _ = notified => {}
                    _ = self.cancel.canceled() => {}
                }
            }
        }
    }

    /// Closes every held cursor without taking `closed` through `close()`'s
    /// own locking, since the caller already holds `inner`.
    fn close_locked(&self, inner: &mut Inner) {
        if let Some(mut current) = inner.current.take() {
            current.cursor.close();
        }
        while let Some(mut pending) = inner.pending.pop_front() {
            pending.cursor.close();
        }
        inner.closed = true;
    }

    /// Blocking counterpart to [`MergedRowReader::read_async`] for callers
    /// outside an async context (ADO.NET's plain `Read()`).
    pub fn read(&self) -> CatalogResult<bool> {
        futures::executor::block_on(self.read_async())
    }

    fn current_value(&self, ordinal: usize) -> CatalogResult<Value> {
        let inner = self.inner.lock();
        if inner.canceled {
            return Err(CatalogError::Canceled);
        }
        if !inner.has_read_once || inner.closed {
            return Err(CatalogError::InternalError {
                message: "accessor called before first successful read or after close".into(),
            });
        }
        let schema_len = inner.reference_schema.as_ref().map(|s| s.columns.len()).unwrap_or(0);
        if self.include_shard_name_column && ordinal == schema_len {
            let location = inner.current.as_ref().map(|c| c.shard_location.clone());
            return Ok(Value::String(location.map(|l| l.display_name()).unwrap_or_default()));
        }
        inner
            .current_row
            .as_ref()
            .and_then(|row| row.values.get(ordinal))
            .cloned()
            .ok_or_else(|| CatalogError::InternalError { message: format!("ordinal {ordinal} out of range") })
    }

    pub fn get_value(&self, ordinal: usize) -> CatalogResult<Value> {
        self.current_value(ordinal)
    }

    pub fn get_i32(&self, ordinal: usize) -> CatalogResult<i32> {
        match self.current_value(ordinal)? {
            Value::Int32(v) => Ok(v),
            other => type_mismatch("Int32", &other),
        }
    }

    pub fn get_i64(&self, ordinal: usize) -> CatalogResult<i64> {
        match self.current_value(ordinal)? {
            Value::Int64(v) => Ok(v),
            other => type_mismatch("Int64", &other),
        }
    }

    pub fn get_u32(&self, ordinal: usize) -> CatalogResult<u32> {
        match self.current_value(ordinal)? {
            Value::UInt32(v) => Ok(v),
            other => type_mismatch("UInt32", &other),
        }
    }

    pub fn get_f64(&self, ordinal: usize) -> CatalogResult<f64> {
        match self.current_value(ordinal)? {
            Value::Float64(v) => Ok(v),
            other => type_mismatch("Float64", &other),
        }
    }

    pub fn get_bool(&self, ordinal: usize) -> CatalogResult<bool> {
        match self.current_value(ordinal)? {
            Value::Boolean(v) => Ok(v),
            other => type_mismatch("Boolean", &other),
        }
    }

    pub fn get_string(&self, ordinal: usize) -> CatalogResult<String> {
        match self.current_value(ordinal)? {
            Value::String(v) => Ok(v),
            other => type_mismatch("String", &other),
        }
    }

    pub fn get_datetime(&self, ordinal: usize) -> CatalogResult<chrono::NaiveDateTime> {
        match self.current_value(ordinal)? {
            Value::DateTime(v) => Ok(v),
            other => type_mismatch("DateTime", &other),
        }
    }

    pub fn get_uuid(&self, ordinal: usize) -> CatalogResult<uuid::Uuid> {
        match self.current_value(ordinal)? {
            Value::Uuid(v) => Ok(v),
            other => type_mismatch("Uuid", &other),
        }
    }

    /// Copies the field's raw bytes into `buffer`, returning the number of
    /// bytes copied (capped at `buffer.len()`).
    pub fn get_bytes(&self, ordinal: usize, buffer: &mut [u8]) -> CatalogResult<usize> {
        match self.current_value(ordinal)? {
            Value::Binary(bytes) => {
                let n = bytes.len().min(buffer.len());
                buffer[..n].copy_from_slice(&bytes[..n]);
                Ok(n)
            }
            other => type_mismatch("Binary", &other),
        }
    }

    /// A readable byte stream over the field, whose length equals the
    /// field's length (§4.6 "Accessor semantics").
    pub fn get_stream(&self, ordinal: usize) -> CatalogResult<ByteCursor<Vec<u8>>> {
        match self.current_value(ordinal)? {
            Value::Binary(bytes) => Ok(ByteCursor::new(bytes)),
            other => type_mismatch("Binary", &other),
        }
    }
}

fn type_mismatch<T>(expected: &str, actual: &Value) -> CatalogResult<T> {
    Err(CatalogError::InternalError { message: format!("expected {expected}, found {actual:?}") })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::fake::FakeShardDriver;
    use crate::driver::ShardDriver;
    use crate::types::{ColumnSchema, ColumnType};

    fn schema() -> Vec<ColumnSchema> {
        vec![
            ColumnSchema { name: "dbNameField".into(), data_type: ColumnType::String },
            ColumnSchema { name: "Test_int_Field".into(), data_type: ColumnType::Int32 },
        ]
    }

    fn row(name: &str, n: i32) -> Row {
        Row { values: vec![Value::String(name.into()), Value::Int32(n)] }
    }

    async fn open_cursor(driver: &FakeShardDriver, conn_str: &str) -> Box<dyn ShardRowCursor> {
        let mut conn = driver.open(conn_str).await.unwrap();
        conn.execute_reader("SELECT 1", &[]).await.unwrap()
    }

    #[tokio::test]
    async fn drains_readers_in_registration_order_then_closes() {
        let mut driver = FakeShardDriver::new(schema());
        driver.register("db0", vec![row("Test0", 1), row("Test0", 2)]);
        driver.register("db1", vec![row("Test1", 1)]);

        let reader = MergedRowReader::new(2, ExecutionOptions::None, Arc::new(CancellationSignal::new()));
        let c0 = open_cursor(&driver, "db0").await;
        let c1 = open_cursor(&driver, "db1").await;
        reader.add_reader(LabeledReader { cursor: c0, shard_location: ShardLocation::new("srv", "db0") }).unwrap();
        reader.add_reader(LabeledReader { cursor: c1, shard_location: ShardLocation::new("srv", "db1") }).unwrap();
        reader.expect_no_more_readers().unwrap();

        let mut count = 0;
        while reader.read_async().await.unwrap() {
            count += 1;
        }
        assert_eq!(count, 3);
        assert!(reader.is_closed());
        assert!(reader.multi_shard_exceptions().is_empty());
    }

    #[tokio::test]
    async fn add_reader_beyond_expected_count_fails_internal_error() {
        let mut driver = FakeShardDriver::new(schema());
        driver.register("db0", vec![]);
        let reader = MergedRowReader::new(0, ExecutionOptions::None, Arc::new(CancellationSignal::new()));
        let c0 = open_cursor(&driver, "db0").await;
        let err = reader
            .add_reader(LabeledReader { cursor: c0, shard_location: ShardLocation::new("srv", "db0") })
            .unwrap_err();
        assert_eq!(err.kind(), meridian_core::ErrorKind::InternalError);
    }

    #[tokio::test]
    async fn schema_mismatch_is_recorded_and_other_reader_still_readable() {
        let mut driver = FakeShardDriver::new(schema());
        driver.register("db0", vec![row("Test0", 1)]);
        let mismatched_schema = vec![
            ColumnSchema { name: "DifferentName".into(), data_type: ColumnType::String },
            ColumnSchema { name: "Test_int_Field".into(), data_type: ColumnType::Int32 },
        ];
        let mut other_driver = FakeShardDriver::new(mismatched_schema);
        other_driver.register("db1", vec![row("Test1", 1)]);

        let reader = MergedRowReader::new(2, ExecutionOptions::None, Arc::new(CancellationSignal::new()));
        let c0 = open_cursor(&driver, "db0").await;
        let c1 = open_cursor(&other_driver, "db1").await;
        reader.add_reader(LabeledReader { cursor: c0, shard_location: ShardLocation::new("srv", "db0") }).unwrap();
        reader.add_reader(LabeledReader { cursor: c1, shard_location: ShardLocation::new("srv", "db1") }).unwrap();
        reader.expect_no_more_readers().unwrap();

        let mut count = 0;
        while reader.read_async().await.unwrap() {
            count += 1;
        }
        assert_eq!(count, 1);
        assert_eq!(reader.multi_shard_exceptions().len(), 1);
    }

    #[tokio::test]
    async fn shard_name_column_reports_originating_shard() {
        let mut driver = FakeShardDriver::new(schema());
        driver.register("db0", vec![row("Test0", 1)]);

        let reader = MergedRowReader::new(1, ExecutionOptions::IncludeShardNameColumn, Arc::new(CancellationSignal::new()));
        let c0 = open_cursor(&driver, "db0").await;
        reader.add_reader(LabeledReader { cursor: c0, shard_location: ShardLocation::new("srv", "db0") }).unwrap();
        reader.expect_no_more_readers().unwrap();

        assert!(reader.read_async().await.unwrap());
        assert_eq!(reader.field_count(), 3);
        assert_eq!(reader.get_name(2).unwrap(), "$ShardName");
        assert_eq!(reader.get_ordinal("$ShardName").unwrap(), 2);
        assert_eq!(reader.get_value(2).unwrap(), Value::String("srv;db0".into()));
    }

    #[tokio::test]
    async fn next_result_is_not_supported() {
        let reader = MergedRowReader::new(0, ExecutionOptions::None, Arc::new(CancellationSignal::new()));
        reader.expect_no_more_readers().unwrap();
        let err = reader.next_result().unwrap_err();
        assert_eq!(err.kind(), meridian_core::ErrorKind::NotSupported);
    }

    #[tokio::test]
    async fn cancel_mid_read_unblocks_a_pending_read_with_canceled() {
        let cancel = Arc::new(CancellationSignal::new());
        // No readers ever registered: `read_async` blocks waiting for one.
        let reader = Arc::new(MergedRowReader::new(1, ExecutionOptions::None, cancel.clone()));

        let blocked = {
            let reader = reader.clone();
            tokio::spawn(async move { reader.read_async().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        cancel.cancel();

        let result = tokio::time::timeout(std::time::Duration::from_millis(100), blocked)
            .await
            .expect("cancellation should unblock the pending read")
            .unwrap();
        assert!(matches!(result, Err(CatalogError::Canceled)));

        // Further accessors keep failing `Canceled` rather than reverting
        // to whatever state `closed`/`has_read_once` happen to be in.
        let again = reader.read_async().await;
        assert!(matches!(again, Err(CatalogError::Canceled)));
    }
}
