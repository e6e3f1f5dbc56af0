//! The fan-out query executor (§4.5–§4.7): scatters one command across a
//! set of shard locations and presents the results through a single
//! merged reader.

pub mod cancel;
pub mod connection;
pub mod driver;
pub mod executor;
pub mod merged_reader;
pub mod policy;
pub mod types;

pub use cancel::CancellationSignal;
pub use connection::build_connection_string;
pub use driver::{ShardConnection, ShardDriver, ShardRowCursor};
pub use executor::{FanoutCommand, FanoutExecutor};
pub use merged_reader::{LabeledReader, MergedRowReader};
pub use policy::{
    ExecutionPolicy, ExecutorEvent, ExecutorEventSink, FanoutError, MultiShardAggregateException, MultiShardException,
};
pub use types::{ColumnSchema, ColumnType, Row, RowSchema, Value};
