use std::sync::Arc;

/// Structured, in-process event hook for observability.
///
/// This crate is a library; emitting logs directly is not acceptable for
/// production. Callers provide an implementation that forwards these events
/// to `tracing`, `log`, metrics, or custom sinks.
pub trait DbEventListener: std::fmt::Debug + Send + Sync + 'static {
    fn on_event(&self, event: DbEvent);
}

/// Structured events emitted by the engine.
#[derive(Debug, Clone)]
pub enum DbEvent {
    WorkerThreadStarted,
    WorkerThreadStopping,

    RecoveryStarted { ids_to_repair: usize },
    RecoveryCompleted { replayed_records: u64 },
    WalVolumeTruncated { shard: u32, seq: u64 },

    RescuePointsPublished { series: u64 },
    TreesEvicted { count: usize },

    CatalogSyncFailed { error: String },
    EvictionFailed { error: String },
}

#[derive(Debug)]
pub struct NoopEventListener;

impl DbEventListener for NoopEventListener {
    #[inline]
    fn on_event(&self, _event: DbEvent) {}
}

pub fn noop_event_listener() -> Arc<dyn DbEventListener> {
    Arc::new(NoopEventListener)
}

/// Recorder-agnostic metrics instrumentation.
///
/// Emitting is effectively a no-op until the embedding process installs a
/// `metrics` recorder; the engine never pulls in an exporter itself.
pub mod db_metrics {
    use ::metrics::{describe_counter, describe_histogram, Unit};
    use std::time::Duration;

    pub const WRITE_SAMPLES: &str = "tscore_write_samples";
    pub const BLOCKS_WRITTEN: &str = "tscore_blocks_written";
    pub const WAL_BYTES_WRITTEN: &str = "tscore_wal_bytes_written";
    pub const RECOVERY_REPLAYED_RECORDS: &str = "tscore_recovery_replayed_records";
    pub const TREES_EVICTED: &str = "tscore_trees_evicted";
    pub const QUERY_DURATION_SECONDS: &str = "tscore_query_duration_seconds";

    #[inline]
    pub fn record_write() {
        ::metrics::counter!(WRITE_SAMPLES).increment(1);
    }

    #[inline]
    pub fn record_blocks_written(blocks: u64) {
        if blocks > 0 {
            ::metrics::counter!(BLOCKS_WRITTEN).increment(blocks);
        }
    }

    #[inline]
    pub fn record_wal_bytes(bytes: u64) {
        if bytes > 0 {
            ::metrics::counter!(WAL_BYTES_WRITTEN).increment(bytes);
        }
    }

    #[inline]
    pub fn record_recovery_replayed(records: u64) {
        if records > 0 {
            ::metrics::counter!(RECOVERY_REPLAYED_RECORDS).increment(records);
        }
    }

    #[inline]
    pub fn record_trees_evicted(count: u64) {
        if count > 0 {
            ::metrics::counter!(TREES_EVICTED).increment(count);
        }
    }

    #[inline]
    pub fn record_query_duration(duration: Duration) {
        ::metrics::histogram!(QUERY_DURATION_SECONDS).record(duration.as_secs_f64());
    }

    /// Registers descriptions with the installed recorder. Optional; safe to
    /// call more than once.
    pub fn describe_all() {
        describe_counter!(
            WRITE_SAMPLES,
            Unit::Count,
            "Samples accepted through write sessions."
        );
        describe_counter!(
            BLOCKS_WRITTEN,
            Unit::Count,
            "Blocks appended to the block store."
        );
        describe_counter!(
            WAL_BYTES_WRITTEN,
            Unit::Bytes,
            "Logical bytes written to the input log."
        );
        describe_counter!(
            RECOVERY_REPLAYED_RECORDS,
            Unit::Count,
            "Input-log records replayed during recovery."
        );
        describe_counter!(
            TREES_EVICTED,
            Unit::Count,
            "Idle series trees closed by the eviction pass."
        );
        describe_histogram!(
            QUERY_DURATION_SECONDS,
            Unit::Seconds,
            "End-to-end query execution time."
        );
    }
}
