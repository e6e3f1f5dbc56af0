//! The fan-out executor (§4.5): one task per shard, a shared cancellation
//! signal, and a merged reader that becomes readable as soon as the first
//! shard responds.
//!
//! Grounded on the scatter-gather fan-out in
//! `other_examples/.../scatter_gather.rs` (per-shard timeout racing,
//! connection-then-query error mapping), generalized from its
//! `buffer_unordered` batch to one `tokio::task` per shard so a caller can
//! start reading before every shard has replied, per §5's "suspension
//! points" list.

use crate::cancel::CancellationSignal;
use crate::connection::build_connection_string;
use crate::driver::{ShardConnection, ShardDriver};
use crate::merged_reader::{LabeledReader, MergedRowReader};
use crate::policy::{ExecutorEvent, ExecutorEventSink, FanoutError, MultiShardAggregateException};
use crate::types::Value;
use meridian_core::{CatalogError, CatalogResult, ExecutionOptions, ExecutionPolicy, RetryPolicyConfig, ShardLocation};
use meridian_retry::{RetryEngine, TransientErrorDetector};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::Span;

const APPLICATION_NAME_SUFFIX: &str = ";Application Name Suffix=MultiShardQuery";

/// A single multi-shard command, independent of any particular set of
/// shards (§6 "MultiShardCommand").
#[derive(Clone)]
pub struct FanoutCommand {
    pub connection_template: String,
    pub sql: String,
    pub params: Vec<Value>,
    pub command_timeout_per_shard: Option<Duration>,
    pub command_timeout: Option<Duration>,
    pub policy: ExecutionPolicy,
    pub options: ExecutionOptions,
    /// A caller-supplied cancellation signal, shared with whatever calls
    /// `Cancel()` on the surrounding command (§6 "Cancel"). `None` makes
    /// `execute_reader` create a private one nothing outside the executor
    /// can reach.
    pub cancel: Option<Arc<CancellationSignal>>,
}

impl FanoutCommand {
    pub fn new(connection_template: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            connection_template: connection_template.into(),
            sql: sql.into(),
            params: Vec::new(),
            command_timeout_per_shard: None,
            command_timeout: None,
            policy: ExecutionPolicy::default(),
            options: ExecutionOptions::default(),
            cancel: None,
        }
    }
}

/// Fans a [`FanoutCommand`] out across a set of shard locations (§4.5).
/// Generic over the shard driver so any store satisfying
/// [`ShardDriver`] can be substituted (§6 "Query-time driver contract").
pub struct FanoutExecutor<Dr> {
    driver: Arc<Dr>,
    retry_policy: RetryPolicyConfig,
    detector: Arc<dyn TransientErrorDetector<CatalogError>>,
}

impl<Dr: ShardDriver + 'static> FanoutExecutor<Dr> {
    pub fn new(driver: Arc<Dr>, retry_policy: RetryPolicyConfig, detector: Arc<dyn TransientErrorDetector<CatalogError>>) -> Self {
        Self { driver, retry_policy, detector }
    }

    /// Executes `command` across `shards` and returns a reader immediately
    /// after the per-shard tasks are spawned — the caller can start reading
    /// rows from whichever shard answers first while the others are still
    /// in flight (§5's streaming suspension points), instead of waiting for
    /// every shard to finish.
    ///
    /// A background task drives the post-completion bookkeeping once every
    /// shard task has finished: it asserts every shard registered exactly
    /// one reader or fault, and, under `CompleteResults`, closes the reader
    /// if any shard faulted (the fault itself already triggered cancellation
    /// from `run_shard_task`, so the reader's next `read` observes
    /// `Canceled` well before this background task gets there in practice).
    pub async fn execute_reader(
        &self,
        shards: Vec<ShardLocation>,
        command: FanoutCommand,
        events: Option<Arc<dyn ExecutorEventSink>>,
        parent_span: Option<Span>,
    ) -> Result<Arc<MergedRowReader>, FanoutError> {
        let cancel = command.cancel.clone().unwrap_or_else(|| Arc::new(CancellationSignal::new()));
        let reader = Arc::new(MergedRowReader::new(shards.len(), command.options, cancel.clone()));

        if let Some(overall) = command.command_timeout {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(overall).await;
                cancel.cancel();
            });
        }

        let policy = command.policy;
        let mut handles = Vec::with_capacity(shards.len());
        for shard in shards {
            let driver = self.driver.clone();
            let cancel = cancel.clone();
            let reader = reader.clone();
            let command = command.clone();
            let events = events.clone();
            let span = parent_span.clone().unwrap_or_else(Span::none);
            let retry = RetryEngine::new(self.retry_policy, self.detector.clone());
            handles.push(tokio::spawn(async move {
                run_shard_task(driver, retry, cancel, reader, command, events, shard, span).await;
            }));
        }

        let completion_reader = reader.clone();
        tokio::spawn(async move {
            for handle in handles {
                let _ = handle.await;
            }
            if let Err(error) = completion_reader.expect_no_more_readers() {
                tracing::error!(%error, "expect_no_more_readers failed after every shard task finished");
            }
            if policy == ExecutionPolicy::CompleteResults {
                let faults = completion_reader.multi_shard_exceptions();
                if !faults.is_empty() {
                    let aggregate = MultiShardAggregateException { shard_count: faults.len(), errors: faults };
                    tracing::warn!(%aggregate, "complete-results command failed, closing merged reader");
                    completion_reader.close();
                }
            }
        });

        Ok(reader)
    }
}

type BoxFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

async fn run_shard_task<Dr: ShardDriver>(
    driver: Arc<Dr>,
    retry: RetryEngine<Arc<dyn TransientErrorDetector<CatalogError>>>,
    cancel: Arc<CancellationSignal>,
    reader: Arc<MergedRowReader>,
    command: FanoutCommand,
    events: Option<Arc<dyn ExecutorEventSink>>,
    shard: ShardLocation,
    _span: Span,
) {
    emit(&events, ExecutorEvent::Began { shard: shard.clone() });

    if cancel.is_canceled() {
        emit(&events, ExecutorEvent::Canceled { shard: shard.clone() });
        reader.record_fault(shard, CatalogError::Canceled);
        return;
    }

    let connection_slot: Arc<AsyncMutex<Option<Box<dyn ShardConnection>>>> = Arc::new(AsyncMutex::new(None));
    let work: BoxFut<'_, Result<(), CatalogError>> =
        Box::pin(execute_one_shard(&driver, &retry, &command, &shard, &reader, connection_slot.clone()));

    let outcome = race_with_timeout(work, cancel.canceled(), command.command_timeout_per_shard).await;

    match outcome {
        RaceOutcome::Completed(Ok(())) => {
            emit(&events, ExecutorEvent::Succeeded { shard: shard.clone() });
        }
        RaceOutcome::Completed(Err(error)) => {
            emit(&events, ExecutorEvent::Faulted { shard: shard.clone(), error: error.clone() });
            reader.record_fault(shard, error);
            if command.policy == ExecutionPolicy::CompleteResults {
                cancel.cancel();
            }
        }
        RaceOutcome::TimedOut => {
            // The open+execute_reader future was abandoned mid-flight; its
            // connection (if one had been opened) is still reachable through
            // the slot, so tell the driver to give it up instead of just
            // dropping it.
            close_abandoned_connection(&connection_slot).await;
            emit(&events, ExecutorEvent::Faulted { shard: shard.clone(), error: CatalogError::Timeout });
            reader.record_fault(shard, CatalogError::Timeout);
            if command.policy == ExecutionPolicy::CompleteResults {
                cancel.cancel();
            }
        }
        RaceOutcome::Canceled => {
            close_abandoned_connection(&connection_slot).await;
            emit(&events, ExecutorEvent::Canceled { shard: shard.clone() });
            reader.record_fault(shard, CatalogError::Canceled);
        }
    }
}

/// Cancels and closes whatever connection `run_shard_task`'s abandoned
/// `work` future had open at the moment it was dropped, if any. Dropping
/// `work` releases the slot's lock immediately, so this never blocks behind
/// the future it's cleaning up after.
async fn close_abandoned_connection(slot: &AsyncMutex<Option<Box<dyn ShardConnection>>>) {
    if let Some(mut connection) = slot.lock().await.take() {
        connection.cancel();
        connection.close();
    }
}

enum RaceOutcome<T> {
    Completed(T),
    TimedOut,
    Canceled,
}

/// Races `work` against cancellation and an optional per-task timeout, in
/// that priority order when both resolve in the same poll (cancellation
/// wins, matching §5's "unblock with `Canceled`").
async fn race_with_timeout<T>(
    work: BoxFut<'_, T>,
    canceled: impl Future<Output = ()>,
    per_task_timeout: Option<Duration>,
) -> RaceOutcome<T> {
    tokio::pin!(canceled);
    match per_task_timeout {
        Some(timeout) => {
            let sleep = tokio::time::sleep(timeout);
            tokio::pin!(sleep);
            tokio::pin!(work);
            tokio::select! {
                biased;
                _ = &mut canceled => RaceOutcome::Canceled,
                result = &mut work => RaceOutcome::Completed(result),
                _ = &mut sleep => RaceOutcome::TimedOut,
            }
        }
        None => {
            tokio::pin!(work);
            tokio::select! {
                biased;
                _ = &mut canceled => RaceOutcome::Canceled,
                result = &mut work => RaceOutcome::Completed(result),
            }
        }
    }
}

/// Opens a connection and executes `command` against it, retrying the
/// whole open+execute_reader sequence (not just the open) up to
/// `retry`'s `max_attempts` whenever the failure is transient — a
/// recoverable reader failure such as `CatalogError::Timeout` (the
/// "connection closed behind our back" case, §6 "Closed-connection
/// handling") needs a fresh connection and a fresh `execute_reader` call,
/// not just a fresh connection.
async fn execute_one_shard<Dr: ShardDriver>(
    driver: &Arc<Dr>,
    retry: &RetryEngine<Arc<dyn TransientErrorDetector<CatalogError>>>,
    command: &FanoutCommand,
    shard: &ShardLocation,
    reader: &Arc<MergedRowReader>,
    connection_slot: Arc<AsyncMutex<Option<Box<dyn ShardConnection>>>>,
) -> Result<(), CatalogError> {
    let connection_string = build_connection_string(&command.connection_template, shard, APPLICATION_NAME_SUFFIX);

    let cursor = retry
        .run(
            || async {
                let connection = driver.open(&connection_string).await?;
                let mut guard = connection_slot.lock().await;
                *guard = Some(connection);
                let result = guard.as_mut().expect("just stored").execute_reader(&command.sql, &command.params).await;
                *guard = None;
                result
            },
            |_event| {},
        )
        .await?;

    reader.add_reader(LabeledReader { cursor, shard_location: shard.clone() })
}

fn emit(events: &Option<Arc<dyn ExecutorEventSink>>, event: ExecutorEvent) {
    if let Some(sink) = events {
        sink.on_event(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::fake::FakeShardDriver;
    use crate::types::{ColumnSchema, ColumnType, Row};
    use meridian_retry::DefaultTransientErrorDetector;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn schema() -> Vec<ColumnSchema> {
        vec![ColumnSchema { name: "id".into(), data_type: ColumnType::Int32 }]
    }

    fn row(n: i32) -> Row {
        Row { values: vec![Value::Int32(n)] }
    }

    fn executor(driver: FakeShardDriver) -> FanoutExecutor<FakeShardDriver> {
        FanoutExecutor::new(Arc::new(driver), RetryPolicyConfig::default(), Arc::new(DefaultTransientErrorDetector))
    }

    fn connection_string_for(location: &ShardLocation) -> String {
        build_connection_string("Integrated Security=True", location, APPLICATION_NAME_SUFFIX)
    }

    #[tokio::test]
    async fn partial_results_merges_rows_from_every_shard() {
        let mut driver = FakeShardDriver::new(schema());
        let shard0 = ShardLocation::new("srv", "db0");
        let shard1 = ShardLocation::new("srv", "db1");
        driver.register(connection_string_for(&shard0), vec![row(1), row(2)]);
        driver.register(connection_string_for(&shard1), vec![row(3)]);

        let executor = executor(driver);
        let mut command = FanoutCommand::new("Integrated Security=True", "SELECT id FROM t");
        command.policy = ExecutionPolicy::PartialResults;

        let reader = executor
            .execute_reader(vec![shard0, shard1], command, None, None)
            .await
            .unwrap();

        let mut count = 0;
        while reader.read_async().await.unwrap() {
            count += 1;
        }
        assert_eq!(count, 3);
        assert!(reader.multi_shard_exceptions().is_empty());
    }

    /// A driver whose connections always open, but whose `execute_reader`
    /// always fails, used to exercise the `CompleteResults` aggregate path
    /// deterministically (no timing race against a fake clock).
    struct FailingDriver;

    struct FailingConnection;

    impl ShardConnection for FailingConnection {
        fn execute_reader<'a>(
            &'a mut self,
            _sql: &'a str,
            _params: &'a [Value],
        ) -> crate::driver::BoxFuture<'a, CatalogResult<Box<dyn crate::driver::ShardRowCursor>>> {
            Box::pin(async { Err(CatalogError::StorageOperationFailure { message: "connection reset".into() }) })
        }

        fn cancel(&self) {}
        fn close(&mut self) {}
    }

    impl ShardDriver for FailingDriver {
        fn open<'a>(&'a self, _connection_string: &'a str) -> crate::driver::BoxFuture<'a, CatalogResult<Box<dyn ShardConnection>>> {
            Box::pin(async { Ok(Box::new(FailingConnection) as Box<dyn ShardConnection>) })
        }
    }

    #[tokio::test]
    async fn complete_results_cancels_reader_after_a_shard_faults() {
        // execute_reader now returns as soon as the tasks are spawned, so a
        // CompleteResults fault can no longer fail synchronously; it instead
        // cancels the command, which the reader's next read observes.
        let executor = FanoutExecutor::new(Arc::new(FailingDriver), RetryPolicyConfig::default(), Arc::new(DefaultTransientErrorDetector));
        let mut command = FanoutCommand::new("Integrated Security=True", "SELECT id FROM t");
        command.policy = ExecutionPolicy::CompleteResults;

        let shards = vec![ShardLocation::new("srv", "db0"), ShardLocation::new("srv", "db1")];
        let reader = executor.execute_reader(shards, command, None, None).await.unwrap();

        let result = reader.read_async().await;
        assert!(matches!(result, Err(CatalogError::Canceled)), "expected Canceled, got {result:?}");
        let faults = reader.multi_shard_exceptions();
        assert!((1..=2).contains(&faults.len()));
    }

    #[tokio::test]
    async fn partial_results_records_fault_and_reader_still_closes_cleanly() {
        let executor = FanoutExecutor::new(Arc::new(FailingDriver), RetryPolicyConfig::default(), Arc::new(DefaultTransientErrorDetector));
        let mut command = FanoutCommand::new("Integrated Security=True", "SELECT id FROM t");
        command.policy = ExecutionPolicy::PartialResults;
        let reader = executor
            .execute_reader(vec![ShardLocation::new("srv", "down")], command, None, None)
            .await
            .unwrap();
        assert!(!reader.read_async().await.unwrap());
        assert_eq!(reader.multi_shard_exceptions().len(), 1);
    }

    /// A driver whose connection opens fine but whose `execute_reader`
    /// never resolves, so a per-shard timeout abandons it mid-flight.
    /// Records whether `cancel`/`close` were called on the abandoned
    /// connection.
    struct HangingConnection {
        canceled: Arc<AtomicBool>,
        closed: Arc<AtomicBool>,
    }

    impl ShardConnection for HangingConnection {
        fn execute_reader<'a>(
            &'a mut self,
            _sql: &'a str,
            _params: &'a [Value],
        ) -> crate::driver::BoxFuture<'a, CatalogResult<Box<dyn crate::driver::ShardRowCursor>>> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                unreachable!("per-shard timeout should have abandoned this future first")
            })
        }

        fn cancel(&self) {
            self.canceled.store(true, Ordering::SeqCst);
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct HangingDriver {
        canceled: Arc<AtomicBool>,
        closed: Arc<AtomicBool>,
    }

    impl ShardDriver for HangingDriver {
        fn open<'a>(&'a self, _connection_string: &'a str) -> crate::driver::BoxFuture<'a, CatalogResult<Box<dyn ShardConnection>>> {
            let canceled = self.canceled.clone();
            let closed = self.closed.clone();
            Box::pin(async move { Ok(Box::new(HangingConnection { canceled, closed }) as Box<dyn ShardConnection>) })
        }
    }

    #[tokio::test]
    async fn per_shard_timeout_cancels_and_closes_the_abandoned_connection() {
        let canceled = Arc::new(AtomicBool::new(false));
        let closed = Arc::new(AtomicBool::new(false));
        let driver = HangingDriver { canceled: canceled.clone(), closed: closed.clone() };
        let executor = FanoutExecutor::new(Arc::new(driver), RetryPolicyConfig::default(), Arc::new(DefaultTransientErrorDetector));
        let mut command = FanoutCommand::new("Integrated Security=True", "SELECT id FROM t");
        command.command_timeout_per_shard = Some(Duration::from_millis(20));

        let reader = executor
            .execute_reader(vec![ShardLocation::new("srv", "db0")], command, None, None)
            .await
            .unwrap();
        assert!(!reader.read_async().await.unwrap());
        assert_eq!(reader.multi_shard_exceptions().len(), 1);
        assert!(canceled.load(Ordering::SeqCst));
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn emits_began_and_succeeded_for_every_shard() {
        let mut driver = FakeShardDriver::new(schema());
        let shard0 = ShardLocation::new("srv", "db0");
        driver.register(connection_string_for(&shard0), vec![row(1)]);

        struct Counting {
            began: AtomicUsize,
            succeeded: AtomicUsize,
        }
        impl ExecutorEventSink for Counting {
            fn on_event(&self, event: ExecutorEvent) {
                match event {
                    ExecutorEvent::Began { .. } => {
                        self.began.fetch_add(1, Ordering::SeqCst);
                    }
                    ExecutorEvent::Succeeded { .. } => {
                        self.succeeded.fetch_add(1, Ordering::SeqCst);
                    }
                    _ => {}
                }
            }
        }
        let sink = Arc::new(Counting { began: AtomicUsize::new(0), succeeded: AtomicUsize::new(0) });

        let executor = executor(driver);
        let command = FanoutCommand::new("Integrated Security=True", "SELECT id FROM t");
        let reader = executor
            .execute_reader(vec![shard0], command, Some(sink.clone() as Arc<dyn ExecutorEventSink>), None)
            .await
            .unwrap();
        while reader.read_async().await.unwrap() {}

        assert_eq!(sink.began.load(Ordering::SeqCst), 1);
        assert_eq!(sink.succeeded.load(Ordering::SeqCst), 1);
    }

    struct StubCursor {
        schema: crate::types::RowSchema,
        rows: std::vec::IntoIter<Row>,
    }

    impl crate::driver::ShardRowCursor for StubCursor {
        fn schema(&self) -> Option<&crate::types::RowSchema> {
            Some(&self.schema)
        }
        fn next_row(&mut self) -> CatalogResult<Option<Row>> {
            Ok(self.rows.next())
        }
        fn close(&mut self) {}
    }

    /// A connection whose `execute_reader` fails with a transient
    /// `Timeout` the first `fail_times` calls, then succeeds.
    struct FlakyExecuteReaderConnection {
        schema: crate::types::RowSchema,
        attempts: Arc<AtomicUsize>,
        fail_times: usize,
    }

    impl ShardConnection for FlakyExecuteReaderConnection {
        fn execute_reader<'a>(
            &'a mut self,
            _sql: &'a str,
            _params: &'a [Value],
        ) -> crate::driver::BoxFuture<'a, CatalogResult<Box<dyn crate::driver::ShardRowCursor>>> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            let fail_times = self.fail_times;
            let schema = self.schema.clone();
            Box::pin(async move {
                if attempt <= fail_times {
                    Err(CatalogError::Timeout)
                } else {
                    let cursor: Box<dyn crate::driver::ShardRowCursor> =
                        Box::new(StubCursor { schema, rows: vec![row(1)].into_iter() });
                    Ok(cursor)
                }
            })
        }

        fn cancel(&self) {}
        fn close(&mut self) {}
    }

    struct FlakyExecuteReaderDriver {
        schema: crate::types::RowSchema,
        attempts: Arc<AtomicUsize>,
        fail_times: usize,
    }

    impl ShardDriver for FlakyExecuteReaderDriver {
        fn open<'a>(&'a self, _connection_string: &'a str) -> crate::driver::BoxFuture<'a, CatalogResult<Box<dyn ShardConnection>>> {
            let schema = self.schema.clone();
            let attempts = self.attempts.clone();
            let fail_times = self.fail_times;
            Box::pin(async move {
                Ok(Box::new(FlakyExecuteReaderConnection { schema, attempts, fail_times }) as Box<dyn ShardConnection>)
            })
        }
    }

    #[tokio::test]
    async fn transient_reader_failure_retries_the_whole_open_and_execute_sequence() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let driver = FlakyExecuteReaderDriver {
            schema: crate::types::RowSchema { columns: schema() },
            attempts: attempts.clone(),
            fail_times: 2,
        };
        let retry_policy = RetryPolicyConfig {
            min_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            ..RetryPolicyConfig::default()
        };
        let executor = FanoutExecutor::new(Arc::new(driver), retry_policy, Arc::new(DefaultTransientErrorDetector));
        let command = FanoutCommand::new("Integrated Security=True", "SELECT id FROM t");

        let reader = executor
            .execute_reader(vec![ShardLocation::new("srv", "db0")], command, None, None)
            .await
            .unwrap();

        let mut count = 0;
        while reader.read_async().await.unwrap() {
            count += 1;
        }
        assert_eq!(count, 1);
        assert!(reader.multi_shard_exceptions().is_empty());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn empty_shard_set_yields_an_immediately_closed_reader() {
        let driver = FakeShardDriver::new(schema());
        let executor = executor(driver);
        let command = FanoutCommand::new("Integrated Security=True", "SELECT id FROM t");
        let reader = executor.execute_reader(vec![], command, None, None).await.unwrap();
        assert!(!reader.read_async().await.unwrap());
        assert!(reader.is_closed());
    }
}
