//! The policy & event plane (§4.7): `PartialResults`/`CompleteResults`, the
//! four per-shard lifecycle events, and the aggregate/per-shard exception
//! types a `CompleteResults` command surfaces.

use meridian_core::{CatalogError, ShardLocation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use meridian_core::ExecutionPolicy;

/// One per-shard lifecycle event (§4.5). Every shard a command dispatches
/// to ultimately triggers exactly one of `Succeeded`, `Faulted`, or
/// `Canceled`, always preceded by exactly one `Began`.
#[derive(Debug, Clone)]
pub enum ExecutorEvent {
    Began { shard: ShardLocation },
    Succeeded { shard: ShardLocation },
    Faulted { shard: ShardLocation, error: CatalogError },
    Canceled { shard: ShardLocation },
}

/// Receives [`ExecutorEvent`]s as they happen. A plain callback field
/// (mirroring `meridian_retry::RetryEngine`'s `on_retry` parameter, §9)
/// rather than a subscribe/unsubscribe API.
pub trait ExecutorEventSink: Send + Sync {
    fn on_event(&self, event: ExecutorEvent);
}

impl<F> ExecutorEventSink for F
where
    F: Fn(ExecutorEvent) + Send + Sync,
{
    fn on_event(&self, event: ExecutorEvent) {
        self(event)
    }
}

/// One shard's failure under a fan-out command: the shard that failed and
/// the error it failed with. Serializable so it round-trips across a
/// process boundary (P9) with `shard_location` intact.
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("shard {shard_location} failed: {inner}")]
pub struct MultiShardException {
    pub shard_location: ShardLocation,
    #[source]
    pub inner: CatalogError,
}

/// The error `ExecuteReader` fails with under `CompleteResults` when any
/// shard faults (§4.7): the first fault cancels every sibling, and this
/// wraps every per-shard exception observed before the command gave up.
/// The racy nature of cooperative cancellation means `errors.len()` may be
/// anywhere in `[1, shard_count]` (P6).
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("{} of {} shards failed", .errors.len(), .shard_count)]
pub struct MultiShardAggregateException {
    pub errors: Vec<MultiShardException>,
    pub shard_count: usize,
}

/// The error type `FanoutExecutor::execute_reader` returns: either a plain
/// catalog/validation error, or the `CompleteResults` aggregate.
#[derive(Debug, Error)]
pub enum FanoutError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Aggregate(#[from] MultiShardAggregateException),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_shard_exception_round_trips_through_json() {
        let exc = MultiShardException {
            shard_location: ShardLocation::new("srv1", "db0"),
            inner: CatalogError::Timeout,
        };
        let json = serde_json::to_string(&exc).unwrap();
        let back: MultiShardException = serde_json::from_str(&json).unwrap();
        assert_eq!(back.shard_location, exc.shard_location);
        assert_eq!(back.inner.kind() as u32, exc.inner.kind() as u32);
    }

    #[test]
    fn aggregate_exception_round_trips_and_preserves_count() {
        let agg = MultiShardAggregateException {
            errors: vec![MultiShardException {
                shard_location: ShardLocation::new("srv1", "db0"),
                inner: CatalogError::InternalError { message: "boom".into() },
            }],
            shard_count: 3,
        };
        let json = serde_json::to_string(&agg).unwrap();
        let back: MultiShardAggregateException = serde_json::from_str(&json).unwrap();
        assert_eq!(back.errors.len(), 1);
        assert_eq!(back.shard_count, 3);
        assert_eq!(back.errors[0].shard_location, agg.errors[0].shard_location);
    }
}
