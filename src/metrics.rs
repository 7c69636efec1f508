//! Write-path metrics
//!
//! One [`WriterMetrics`] is shared through `Arc` by every writer of a task.
//! Counters are lock-free; with the `metrics` feature enabled the same events
//! are also forwarded to the `metrics` facade, labelled by shard.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Serialize, Deserialize};

/// Performance metrics collector for the write path
#[derive(Debug)]
pub struct WriterMetrics {
    // Document accounting
    documents_submitted: AtomicU64,
    documents_written: AtomicU64,
    documents_failed: AtomicU64,
    documents_discarded: AtomicU64,

    // Requests
    batches_flushed: AtomicU64,
    single_inserts: AtomicU64,
    commits: AtomicU64,
    feedback_rollbacks: AtomicU64,
    connections_opened: AtomicU64,

    // Timing, nanoseconds
    insert_duration_ns: AtomicU64,
    commit_duration_ns: AtomicU64,

    start_time: Instant,
}

impl Default for WriterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "metrics")]
fn emit(name: &'static str, value: u64, shard: &str) {
    ::metrics::counter!(name, value, "shard" => shard.to_string());
}

#[cfg(not(feature = "metrics"))]
fn emit(_name: &'static str, _value: u64, _shard: &str) {}

impl WriterMetrics {
    pub fn new() -> Self {
        Self {
            documents_submitted: AtomicU64::new(0),
            documents_written: AtomicU64::new(0),
            documents_failed: AtomicU64::new(0),
            documents_discarded: AtomicU64::new(0),
            batches_flushed: AtomicU64::new(0),
            single_inserts: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            feedback_rollbacks: AtomicU64::new(0),
            connections_opened: AtomicU64::new(0),
            insert_duration_ns: AtomicU64::new(0),
            commit_duration_ns: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// A document was handed to a writer
    pub fn record_submitted(&self) {
        self.documents_submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Documents confirmed written on a shard
    pub fn record_written(&self, shard: &str, count: u64) {
        self.documents_written.fetch_add(count, Ordering::Relaxed);
        emit("shardpump_documents_written", count, shard);
    }

    /// Documents rejected by a shard
    pub fn record_failed(&self, shard: &str, count: u64) {
        self.documents_failed.fetch_add(count, Ordering::Relaxed);
        emit("shardpump_documents_failed", count, shard);
    }

    /// Buffered documents dropped by an abort
    pub fn record_discarded(&self, shard: &str, count: u64) {
        self.documents_discarded.fetch_add(count, Ordering::Relaxed);
        emit("shardpump_documents_discarded", count, shard);
    }

    pub fn record_batch_flush(&self, shard: &str, duration: Duration) {
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
        self.insert_duration_ns.fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
        emit("shardpump_batches_flushed", 1, shard);
    }

    pub fn record_single_insert(&self, shard: &str, duration: Duration) {
        self.single_inserts.fetch_add(1, Ordering::Relaxed);
        self.insert_duration_ns.fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
        emit("shardpump_single_inserts", 1, shard);
    }

    pub fn record_commit(&self, shard: &str, duration: Duration) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.commit_duration_ns.fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
        emit("shardpump_commits", 1, shard);
    }

    /// A shard's feedback delta was rolled back
    pub fn record_rollback(&self, shard: &str) {
        self.feedback_rollbacks.fetch_add(1, Ordering::Relaxed);
        emit("shardpump_feedback_rollbacks", 1, shard);
    }

    pub fn record_connection_opened(&self, shard: &str) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        emit("shardpump_connections_opened", 1, shard);
    }

    /// Get uptime of the metrics collector
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Point-in-time copy of all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            documents_submitted: self.documents_submitted.load(Ordering::Relaxed),
            documents_written: self.documents_written.load(Ordering::Relaxed),
            documents_failed: self.documents_failed.load(Ordering::Relaxed),
            documents_discarded: self.documents_discarded.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            single_inserts: self.single_inserts.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            feedback_rollbacks: self.feedback_rollbacks.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            insert_duration: Duration::from_nanos(self.insert_duration_ns.load(Ordering::Relaxed)),
            commit_duration: Duration::from_nanos(self.commit_duration_ns.load(Ordering::Relaxed)),
            uptime: self.uptime(),
        }
    }
}

/// Serializable copy of [`WriterMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub documents_submitted: u64,
    pub documents_written: u64,
    pub documents_failed: u64,
    pub documents_discarded: u64,
    pub batches_flushed: u64,
    pub single_inserts: u64,
    pub commits: u64,
    pub feedback_rollbacks: u64,
    pub connections_opened: u64,
    pub insert_duration: Duration,
    pub commit_duration: Duration,
    pub uptime: Duration,
}

impl MetricsSnapshot {
    /// Insert statements issued (batch flushes plus single inserts)
    pub fn statements(&self) -> u64 {
        self.batches_flushed + self.single_inserts
    }

    /// Get a report of all metrics
    pub fn to_string_pretty(&self) -> String {
        let mut report = String::new();

        report.push_str("=== Shardpump Write Metrics ===\n\n");
        report.push_str(&format!("Uptime: {:?}\n\n", self.uptime));

        report.push_str("Documents:\n");
        report.push_str(&format!("  Submitted: {}\n", self.documents_submitted));
        report.push_str(&format!("  Written: {}\n", self.documents_written));
        report.push_str(&format!("  Failed: {}\n", self.documents_failed));
        report.push_str(&format!("  Discarded: {}\n\n", self.documents_discarded));

        report.push_str("Requests:\n");
        report.push_str(&format!("  Batch Flushes: {}\n", self.batches_flushed));
        report.push_str(&format!("  Single Inserts: {}\n", self.single_inserts));
        report.push_str(&format!("  Commits: {}\n", self.commits));
        report.push_str(&format!("  Feedback Rollbacks: {}\n", self.feedback_rollbacks));
        report.push_str(&format!("  Connections Opened: {}\n\n", self.connections_opened));

        report.push_str("Performance:\n");
        if self.statements() > 0 {
            let avg_insert = self.insert_duration.as_micros() / self.statements() as u128;
            report.push_str(&format!("  Avg. Insert Time: {}µs\n", avg_insert));
        }
        if self.commits > 0 {
            let avg_commit = self.commit_duration.as_micros() / self.commits as u128;
            report.push_str(&format!("  Avg. Commit Time: {}µs\n", avg_commit));
        }
        let secs = self.uptime.as_secs_f64();
        if secs > 0.0 {
            report.push_str(&format!(
                "  Documents/sec: {:.2}\n",
                self.documents_written as f64 / secs
            ));
        }

        report
    }
}
