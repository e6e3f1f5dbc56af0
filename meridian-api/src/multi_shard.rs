//! The ADO.NET-shaped multi-shard query surface (spec.md §6): a
//! `MultiShardConnection` bound to a fixed shard set, `MultiShardCommand`
//! carrying the SQL text and execution policy, and `MultiShardDataReader`
//! as the public name for the merged reader. Thin wrappers over
//! [`meridian_executor::FanoutExecutor`]/[`meridian_executor::FanoutCommand`]/
//! [`meridian_executor::MergedRowReader`] that speak the vocabulary callers
//! coming from the single-shard driver API already know.

use meridian_core::{CatalogError, CatalogResult, ExecutionOptions, ExecutionPolicy, RetryPolicyConfig, ShardLocation};
use meridian_executor::{
    CancellationSignal, ExecutorEventSink, FanoutCommand, FanoutError, FanoutExecutor, MergedRowReader, ShardDriver,
    Value,
};
use meridian_retry::TransientErrorDetector;
use std::sync::Arc;
use std::time::Duration;
use tracing::Span;

/// A multi-shard data reader: the public name for [`MergedRowReader`],
/// re-exported as-is since the facade adds nothing to its surface.
pub type MultiShardDataReader = MergedRowReader;

/// A connection bound to a fixed set of shard locations and a connection
/// string template (§6 "MultiShardConnection"). Each [`MultiShardCommand`]
/// executed against it fans out to every bound shard.
pub struct MultiShardConnection<Dr> {
    executor: Arc<FanoutExecutor<Dr>>,
    shards: Vec<ShardLocation>,
    connection_template: String,
}

impl<Dr: ShardDriver + 'static> MultiShardConnection<Dr> {
    pub fn new(
        driver: Arc<Dr>,
        shards: Vec<ShardLocation>,
        connection_template: impl Into<String>,
        retry_policy: RetryPolicyConfig,
        detector: Arc<dyn TransientErrorDetector<CatalogError>>,
    ) -> Self {
        Self {
            executor: Arc::new(FanoutExecutor::new(driver, retry_policy, detector)),
            shards,
            connection_template: connection_template.into(),
        }
    }

    pub fn shards(&self) -> &[ShardLocation] {
        &self.shards
    }

    /// Builds a command against this connection's shard set and connection
    /// template. `sql` is the only thing a caller must supply beyond the
    /// defaults (`PartialResults`, no timeouts, no shard-name column).
    pub fn create_command(&self, sql: impl Into<String>) -> MultiShardCommand<Dr> {
        MultiShardCommand {
            executor: self.executor.clone(),
            shards: self.shards.clone(),
            command: FanoutCommand::new(self.connection_template.clone(), sql),
            events: None,
            parent_span: None,
        }
    }
}

/// One multi-shard command: SQL text, parameters, timeouts, and the
/// execution policy/options, bound to the connection's shard set at
/// [`MultiShardConnection::create_command`] time (§6 "MultiShardCommand").
pub struct MultiShardCommand<Dr> {
    executor: Arc<FanoutExecutor<Dr>>,
    shards: Vec<ShardLocation>,
    command: FanoutCommand,
    events: Option<Arc<dyn ExecutorEventSink>>,
    parent_span: Option<Span>,
}

impl<Dr: ShardDriver + 'static> MultiShardCommand<Dr> {
    pub fn command_text(&self) -> &str {
        &self.command.sql
    }

    pub fn set_command_text(&mut self, sql: impl Into<String>) {
        self.command.sql = sql.into();
    }

    pub fn parameters_mut(&mut self) -> &mut Vec<Value> {
        &mut self.command.params
    }

    pub fn set_command_timeout(&mut self, timeout: Duration) {
        self.command.command_timeout = Some(timeout);
    }

    pub fn set_command_timeout_per_shard(&mut self, timeout: Duration) {
        self.command.command_timeout_per_shard = Some(timeout);
    }

    pub fn set_execution_policy(&mut self, policy: ExecutionPolicy) {
        self.command.policy = policy;
    }

    pub fn set_execution_options(&mut self, options: ExecutionOptions) {
        self.command.options = options;
    }

    pub fn set_event_sink(&mut self, sink: Arc<dyn ExecutorEventSink>) {
        self.events = Some(sink);
    }

    pub fn set_parent_span(&mut self, span: Span) {
        self.parent_span = Some(span);
    }

    /// Raises the command's cancellation signal, unblocking every shard
    /// task currently in flight (§5 "Cancellation"). A no-op before the
    /// first `execute_reader_async` call since the signal is created lazily
    /// on first use.
    pub fn cancel(&mut self) {
        match &self.command.cancel {
            Some(signal) => signal.cancel(),
            None => {
                let signal = Arc::new(CancellationSignal::new());
                signal.cancel();
                self.command.cancel = Some(signal);
            }
        }
    }

    pub async fn execute_reader_async(&self) -> Result<Arc<MultiShardDataReader>, FanoutError> {
        self.executor
            .execute_reader(self.shards.clone(), self.command.clone(), self.events.clone(), self.parent_span.clone())
            .await
    }

    pub fn execute_reader(&self) -> Result<Arc<MultiShardDataReader>, FanoutError> {
        futures::executor::block_on(self.execute_reader_async())
    }

    /// Always fails `NotSupported` (§6): a multi-shard command has no
    /// single scalar affected-row count or first-column value to return.
    pub async fn execute_non_query_async(&self) -> CatalogResult<u64> {
        Err(CatalogError::NotSupported { message: "MultiShardCommand does not support ExecuteNonQuery".into() })
    }

    pub fn execute_non_query(&self) -> CatalogResult<u64> {
        futures::executor::block_on(self.execute_non_query_async())
    }

    /// Always fails `NotSupported` (§6), for the same reason as
    /// [`MultiShardCommand::execute_non_query_async`].
    pub async fn execute_scalar_async(&self) -> CatalogResult<Value> {
        Err(CatalogError::NotSupported { message: "MultiShardCommand does not support ExecuteScalar".into() })
    }

    pub fn execute_scalar(&self) -> CatalogResult<Value> {
        futures::executor::block_on(self.execute_scalar_async())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_executor::driver::fake::FakeShardDriver;
    use meridian_executor::{ColumnSchema, ColumnType, Row};
    use meridian_retry::DefaultTransientErrorDetector;

    #[tokio::test]
    async fn execute_non_query_and_scalar_fail_not_supported() {
        let driver = Arc::new(FakeShardDriver::new(vec![ColumnSchema { name: "id".into(), data_type: ColumnType::Int32 }]));
        let connection = MultiShardConnection::new(
            driver,
            vec![ShardLocation::new("srv", "db0")],
            "Integrated Security=True",
            RetryPolicyConfig::default(),
            Arc::new(DefaultTransientErrorDetector),
        );
        let command = connection.create_command("SELECT id FROM t");
        assert_eq!(command.execute_non_query_async().await.unwrap_err().kind(), meridian_core::ErrorKind::NotSupported);
        assert_eq!(command.execute_scalar_async().await.unwrap_err().kind(), meridian_core::ErrorKind::NotSupported);
    }

    #[tokio::test]
    async fn execute_reader_merges_rows_from_every_bound_shard() {
        let schema = vec![ColumnSchema { name: "id".into(), data_type: ColumnType::Int32 }];
        let mut driver = FakeShardDriver::new(schema);
        let shard0 = ShardLocation::new("srv", "db0");
        let shard1 = ShardLocation::new("srv", "db1");
        let conn_str_for = |location: &ShardLocation| {
            meridian_executor::build_connection_string("Integrated Security=True", location, ";Application Name Suffix=MultiShardQuery")
        };
        driver.register(conn_str_for(&shard0), vec![Row { values: vec![Value::Int32(1)] }]);
        driver.register(conn_str_for(&shard1), vec![Row { values: vec![Value::Int32(2)] }]);

        let connection = MultiShardConnection::new(
            Arc::new(driver),
            vec![shard0, shard1],
            "Integrated Security=True",
            RetryPolicyConfig::default(),
            Arc::new(DefaultTransientErrorDetector),
        );
        let command = connection.create_command("SELECT id FROM t");
        let reader = command.execute_reader_async().await.unwrap();
        let mut count = 0;
        while reader.read_async().await.unwrap() {
            count += 1;
        }
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn cancel_before_execute_unblocks_every_shard_task_immediately() {
        let driver = Arc::new(FakeShardDriver::new(vec![ColumnSchema { name: "id".into(), data_type: ColumnType::Int32 }]));
        let connection = MultiShardConnection::new(
            driver,
            vec![ShardLocation::new("srv", "db0")],
            "Integrated Security=True",
            RetryPolicyConfig::default(),
            Arc::new(DefaultTransientErrorDetector),
        );
        let mut command = connection.create_command("SELECT id FROM t");
        command.cancel();
        let reader = command.execute_reader_async().await.unwrap();
        assert_eq!(reader.multi_shard_exceptions().len(), 1);
    }

    /// A driver whose connection opens fine but whose `execute_reader` never
    /// resolves, so a command running against it stays in flight until
    /// something else intervenes.
    struct HangingConnection;

    impl meridian_executor::ShardConnection for HangingConnection {
        fn execute_reader<'a>(
            &'a mut self,
            _sql: &'a str,
            _params: &'a [Value],
        ) -> meridian_executor::driver::BoxFuture<'a, CatalogResult<Box<dyn meridian_executor::ShardRowCursor>>> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                unreachable!("the test cancels the command long before this would resolve")
            })
        }

        fn cancel(&self) {}
        fn close(&mut self) {}
    }

    struct HangingDriver;

    impl ShardDriver for HangingDriver {
        fn open<'a>(
            &'a self,
            _connection_string: &'a str,
        ) -> meridian_executor::driver::BoxFuture<'a, CatalogResult<Box<dyn meridian_executor::ShardConnection>>> {
            Box::pin(async { Ok(Box::new(HangingConnection) as Box<dyn meridian_executor::ShardConnection>) })
        }
    }

    #[tokio::test]
    async fn cancel_mid_flight_unblocks_a_reader_already_waiting_on_a_hung_shard() {
        let connection = MultiShardConnection::new(
            Arc::new(HangingDriver),
            vec![ShardLocation::new("srv", "db0")],
            "Integrated Security=True",
            RetryPolicyConfig::default(),
            Arc::new(DefaultTransientErrorDetector),
        );
        let mut command = connection.create_command("SELECT id FROM t");
        // No timeout is set: only an explicit `cancel()` can unblock this.
        let reader = command.execute_reader_async().await.unwrap();

        let read = {
            let reader = reader.clone();
            tokio::spawn(async move { reader.read_async().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        command.cancel();

        let result = tokio::time::timeout(Duration::from_millis(200), read).await.unwrap().unwrap();
        assert!(matches!(result, Err(CatalogError::Canceled)), "expected Canceled, got {result:?}");
    }
}
