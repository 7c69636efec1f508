//! Shardpump: the sharded write path of a bulk document loader
//!
//! A loading job hands each task a stream of `(identifier, document)` records.
//! Shardpump routes every document to a storage shard through an
//! [`AssignmentPolicy`], batches documents per shard, commits per-shard
//! transactions on a statement threshold, tolerates per-document rejections
//! and feeds confirmed write volume back into the statistical policy.
//!
//! The moving parts, leaves first:
//!
//! - [`shard::policy`] maps a document key to a shard index
//! - [`connection`] is the repository boundary (one connection per shard)
//! - [`batch::BatchBuffer`] holds pending documents for one shard
//! - [`writer::ShardedWriter`] drives assignment, flush, commit and recovery
//! - [`shard::validator::TopologyValidator`] prepares the job once, before any task
//! - [`task::TaskRunner`] pulls records and owns the writer lifecycle

pub mod batch;
pub mod codec;
pub mod config;
pub mod connection;
pub mod document;
pub mod error;
pub mod metrics;
pub mod shard;
pub mod task;
pub mod writer;

pub use config::{DirectoryMode, PolicyKind, RepairLevel, WriterConfig};
pub use connection::{AdminSession, Connection, ContentSource, MemoryRepository, RequestError, TransactionMode};
pub use document::{ContentOptions, ContentValue, Document, DocumentFormat, DocumentUri};
pub use error::{Error, Result};
pub use metrics::{MetricsSnapshot, WriterMetrics};
pub use shard::policy::AssignmentPolicy;
pub use shard::{Shard, ShardHost, ShardId, ShardList, TopologyMap, TopologyValidator};
pub use task::{IterSource, Record, RecordSource, ShutdownSignal, TaskReport, TaskRunner};
pub use writer::{ShardPhase, ShardStatus, ShardedWriter, WriterStats};
