#![doc = r#"
tscore: Time-Series Storage Core in Rust

This crate provides the storage and query core of a time-series database:
ingestion of labeled numeric samples and short textual events, an append-only
compressed column store with crash recovery, and a push-based query engine.
It is designed to sit behind wire-protocol frontends, with support for:
- Per-series append trees over a content-addressed block store, with rescue
  points that make crash recovery tractable
- A bounded, sharded write-ahead input log whose replay reconstructs lost
  in-memory tree tails
- A series index with canonical `metric tag=value ...` names, tag and regex
  lookup, and name suggestion
- Scan / filter / aggregate / group-aggregate / join queries over arbitrary
  time ranges, planned from a JSON request

See the README for usage examples and more details.
"#]
// Declare modules
pub mod blockstore;
pub mod catalog;
pub mod codec;
pub mod column_store;
pub mod core;
pub mod error;
pub mod index;
pub mod nbtree;
pub mod operators;
pub mod plan;
pub mod telemetry;
pub mod types;
pub mod wal;

/// Main entry point: the standalone database engine.
pub use crate::core::{BlockStoreKind, Database, EngineConfig, Session};
/// Error type for database operations.
pub use crate::error::DbError;
/// Series index types.
pub use crate::index::{SeriesMatcher, SeriesRetriever};
/// Query cursor and cancellation surface.
pub use crate::operators::{CollectingCursor, InternalCursor, OrderBy, QueryCancelToken};
/// Query planning and output.
pub use crate::plan::{QueryKind, QueryOutput, ReshapeRequest};
/// Structured event hook for observability.
pub use crate::telemetry::{DbEvent, DbEventListener};
/// Core data model types.
pub use crate::types::{Payload, Sample, SeriesId, Timestamp, Value};
/// Input log configuration.
pub use crate::wal::InputLogConfig;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, DbError>;
