//! Sharded writer
//!
//! One [`ShardedWriter`] serves one task. Every document is routed to a shard
//! by the assignment policy, buffered or inserted on that shard's connection,
//! and committed when the shard's statement count reaches the transaction
//! size. Shards never coordinate with each other.
//!
//! Document accounting is exact: every submitted document ends up written
//! (committed), failed (rejected by the repository or invalid), discarded
//! (lost to an abort or a fatal error) or, until the writer finishes, still
//! buffered or waiting for a commit.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::{Serialize, Deserialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::batch::BatchBuffer;
use crate::config::WriterConfig;
use crate::connection::{Connection, ContentSource, RequestError, TransactionMode};
use crate::document::{ContentOptions, ContentValue, Document, DocumentUri};
use crate::error::{Result, Error};
use crate::metrics::WriterMetrics;
use crate::shard::policy::AssignmentPolicy;
use crate::shard::{Shard, ShardId, ShardList};

/// Where a shard is in its write cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShardPhase {
    /// Created, nothing sent yet
    Idle,
    /// Accepting documents
    Buffering,
    /// A batch is on the wire
    Flushing,
    /// The last transaction was committed
    Committed,
    /// Released after a fatal error or an abort
    Aborted,
}

impl fmt::Display for ShardPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Buffering => "buffering",
            Self::Flushing => "flushing",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Document and request counts of a writer or one of its shards
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterStats {
    pub submitted: u64,
    /// Durably written: committed, or accepted on an auto-commit connection
    pub written: u64,
    pub failed: u64,
    /// Lost to an abort or a fatal shard error
    pub discarded: u64,
    pub flushes: u64,
    pub commits: u64,
}

impl WriterStats {
    /// Add another set of counts to this one
    pub fn merge(&mut self, other: &WriterStats) {
        self.submitted += other.submitted;
        self.written += other.written;
        self.failed += other.failed;
        self.discarded += other.discarded;
        self.flushes += other.flushes;
        self.commits += other.commits;
    }

    /// Documents with a final outcome
    pub fn settled(&self) -> u64 {
        self.written + self.failed + self.discarded
    }
}

/// Point-in-time view of one shard's state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardStatus {
    pub shard: ShardId,
    pub phase: ShardPhase,
    pub buffered: usize,
    /// Statements since the last commit
    pub statements: usize,
    /// Feedback applied to the policy since the last commit; `None` unless the
    /// policy takes feedback
    pub feedback_delta: Option<i64>,
    pub connection_open: bool,
    pub stats: WriterStats,
}

/// Settings and collaborators shared by all shard states of a writer
struct WriterContext {
    id: Uuid,
    source: Arc<dyn ContentSource>,
    policy: Arc<dyn AssignmentPolicy>,
    metrics: Arc<WriterMetrics>,
    mode: TransactionMode,
    transaction_size: usize,
    tolerate_errors: bool,
}

impl WriterContext {
    /// Turn a per-document failure into an error unless failures are tolerated
    fn promote(&self, uri: &str, message: &str) -> Result<()> {
        if self.tolerate_errors {
            Ok(())
        } else {
            Err(Error::Rejected {
                uri: uri.to_string(),
                message: message.to_string(),
            })
        }
    }
}

/// Per-shard state, owned by exactly one writer
struct ShardState {
    shard: Shard,
    phase: ShardPhase,
    connection: Option<Box<dyn Connection>>,
    buffer: BatchBuffer,
    /// Statements since the last commit
    statements: usize,
    /// Documents accepted but not yet committed
    uncommitted: u64,
    feedback: Option<i64>,
    stats: WriterStats,
}

impl ShardState {
    fn new(shard: Shard, batch_size: usize, tracks_feedback: bool) -> Self {
        Self {
            shard,
            phase: ShardPhase::Idle,
            connection: None,
            buffer: BatchBuffer::new(batch_size),
            statements: 0,
            uncommitted: 0,
            feedback: tracks_feedback.then_some(0),
            stats: WriterStats::default(),
        }
    }

    fn status(&self) -> ShardStatus {
        ShardStatus {
            shard: self.shard.id.clone(),
            phase: self.phase,
            buffered: self.buffer.len(),
            statements: self.statements,
            feedback_delta: self.feedback,
            connection_open: self.connection.as_ref().map_or(false, |c| c.is_open()),
            stats: self.stats,
        }
    }

    /// The shard's connection, opened on first use
    fn connection(&mut self, ctx: &WriterContext) -> std::result::Result<&mut Box<dyn Connection>, RequestError> {
        if self.connection.is_none() {
            let connection = ctx.source.open(&self.shard, ctx.mode)?;
            ctx.metrics.record_connection_opened(&self.shard.id);
            debug!(
                writer = %ctx.id,
                shard = %self.shard.id,
                host = %self.shard.host,
                mode = %ctx.mode,
                "connection opened"
            );
            self.connection = Some(connection);
        }

        match self.connection.as_mut() {
            Some(connection) => {
                connection.begin_transaction_if_needed()?;
                Ok(connection)
            }
            None => Err(RequestError::Closed),
        }
    }

    /// Documents accepted by the repository in the last statement
    fn accept(&mut self, ctx: &WriterContext, count: u64) {
        if count == 0 {
            return;
        }

        match ctx.mode {
            TransactionMode::Auto => {
                self.stats.written += count;
                ctx.metrics.record_written(&self.shard.id, count);
            }
            TransactionMode::Update => self.uncommitted += count,
        }

        if let Some(delta) = self.feedback.as_mut() {
            *delta += count as i64;
            ctx.policy.update(self.shard.index, count as i64);
        }
    }

    fn reject(&mut self, ctx: &WriterContext, count: u64) {
        if count == 0 {
            return;
        }
        self.stats.failed += count;
        ctx.metrics.record_failed(&self.shard.id, count);
    }

    /// Give back everything fed to the policy since the last commit
    fn rollback_feedback(&mut self, ctx: &WriterContext) {
        if let Some(delta) = self.feedback.as_mut() {
            if *delta != 0 {
                ctx.policy.update(self.shard.index, -*delta);
                ctx.metrics.record_rollback(&self.shard.id);
                error!(
                    writer = %ctx.id,
                    shard = %self.shard.id,
                    delta = *delta,
                    "rolled back shard feedback"
                );
            }
            *delta = 0;
        }
    }

    /// Close the connection. Accepted documents of an open transaction are lost.
    fn release(&mut self, ctx: &WriterContext) {
        if let Some(mut connection) = self.connection.take() {
            connection.close();
            debug!(writer = %ctx.id, shard = %self.shard.id, "connection closed");
        }

        if self.uncommitted > 0 {
            self.stats.discarded += self.uncommitted;
            ctx.metrics.record_discarded(&self.shard.id, self.uncommitted);
            self.uncommitted = 0;
        }
    }

    /// Handle a fatal repository error: release the shard and roll back its feedback
    fn fail(&mut self, ctx: &WriterContext, source: RequestError) -> Error {
        error!(
            writer = %ctx.id,
            shard = %self.shard.id,
            error = %source,
            "fatal shard error"
        );
        self.release(ctx);
        self.rollback_feedback(ctx);
        self.statements = 0;
        self.phase = ShardPhase::Aborted;
        Error::shard(self.shard.id.clone(), source)
    }

    fn insert_one(&mut self, ctx: &WriterContext, document: Document) -> Result<()> {
        let uri = document.uri.clone();
        let started = Instant::now();

        let outcome = match self.connection(ctx) {
            Ok(connection) => connection.insert_one(document),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                ctx.metrics.record_single_insert(&self.shard.id, started.elapsed());
                self.statements += 1;
                self.accept(ctx, 1);
                self.phase = ShardPhase::Buffering;
                Ok(())
            }
            Err(e) if e.is_rejection() => {
                // a refused document is not a statement of the transaction
                ctx.metrics.record_single_insert(&self.shard.id, started.elapsed());
                self.reject(ctx, 1);
                self.phase = ShardPhase::Buffering;
                warn!(writer = %ctx.id, shard = %self.shard.id, uri = %uri, error = %e, "document rejected");
                ctx.promote(&uri, &e.to_string())
            }
            Err(e) => {
                self.stats.discarded += 1;
                ctx.metrics.record_discarded(&self.shard.id, 1);
                Err(self.fail(ctx, e))
            }
        }
    }

    /// Send the buffered documents as one statement
    fn flush(&mut self, ctx: &WriterContext) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let batch = self.buffer.drain();
        let size = batch.len() as u64;
        let first_uri = batch.first().map(|d| d.uri.clone()).unwrap_or_default();
        self.phase = ShardPhase::Flushing;
        let started = Instant::now();

        let outcome = match self.connection(ctx) {
            Ok(connection) => connection.insert_batch(batch),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(failures) => {
                ctx.metrics.record_batch_flush(&self.shard.id, started.elapsed());
                let failed = (failures.len() as u64).min(size);

                self.statements += 1;
                self.stats.flushes += 1;
                self.accept(ctx, size - failed);
                self.reject(ctx, failed);
                self.phase = ShardPhase::Buffering;

                for failure in &failures {
                    warn!(
                        writer = %ctx.id,
                        shard = %self.shard.id,
                        uri = failure.uri().unwrap_or("?"),
                        error = %failure,
                        "document rejected in batch"
                    );
                }
                debug!(
                    writer = %ctx.id,
                    shard = %self.shard.id,
                    size,
                    failed,
                    "batch flushed"
                );

                match failures.first() {
                    Some(failure) => ctx.promote(failure.uri().unwrap_or(&first_uri), &failure.to_string()),
                    None => Ok(()),
                }
            }
            Err(e) if e.is_rejection() => {
                // the request itself was refused: nothing in it was stored
                ctx.metrics.record_batch_flush(&self.shard.id, started.elapsed());
                self.statements += 1;
                self.stats.flushes += 1;
                self.reject(ctx, size);
                self.phase = ShardPhase::Buffering;
                warn!(writer = %ctx.id, shard = %self.shard.id, size, error = %e, "batch rejected");
                ctx.promote(e.uri().unwrap_or(&first_uri), &e.to_string())
            }
            Err(e) => {
                self.stats.discarded += size;
                ctx.metrics.record_discarded(&self.shard.id, size);
                Err(self.fail(ctx, e))
            }
        }
    }

    fn commit(&mut self, ctx: &WriterContext) -> Result<()> {
        let Some(connection) = self.connection.as_mut() else {
            return Ok(());
        };

        let started = Instant::now();
        match connection.commit() {
            Ok(()) => {
                ctx.metrics.record_commit(&self.shard.id, started.elapsed());
                if self.uncommitted > 0 {
                    self.stats.written += self.uncommitted;
                    ctx.metrics.record_written(&self.shard.id, self.uncommitted);
                }
                debug!(
                    writer = %ctx.id,
                    shard = %self.shard.id,
                    statements = self.statements,
                    documents = self.uncommitted,
                    "transaction committed"
                );

                self.uncommitted = 0;
                self.statements = 0;
                self.stats.commits += 1;
                if let Some(delta) = self.feedback.as_mut() {
                    *delta = 0;
                }
                self.phase = ShardPhase::Committed;
                Ok(())
            }
            Err(e) => Err(self.fail(ctx, e)),
        }
    }

    fn commit_if_due(&mut self, ctx: &WriterContext) -> Result<()> {
        if ctx.mode == TransactionMode::Update && self.statements >= ctx.transaction_size {
            self.commit(ctx)
        } else {
            Ok(())
        }
    }

    /// End-of-task close: flush, commit, release
    fn close(&mut self, ctx: &WriterContext) -> Result<()> {
        if self.phase == ShardPhase::Aborted {
            self.release(ctx);
            return Ok(());
        }

        let mut result = self.flush(ctx);
        let fatal = matches!(result, Err(ref e) if e.is_fatal_shard_error());

        if !fatal
            && ctx.mode == TransactionMode::Update
            && self.statements > 0
            && self.connection.as_ref().map_or(false, |c| c.is_open())
        {
            let committed = self.commit(ctx);
            if result.is_ok() {
                result = committed;
            }
        }

        self.release(ctx);
        if self.phase != ShardPhase::Aborted {
            self.phase = ShardPhase::Committed;
        }
        result
    }

    /// Release without flushing or committing
    fn abort(&mut self, ctx: &WriterContext) {
        let dropped = self.buffer.clear() as u64;
        if dropped > 0 {
            self.stats.discarded += dropped;
            ctx.metrics.record_discarded(&self.shard.id, dropped);
        }

        let open_transaction = ctx.mode == TransactionMode::Update
            && self.statements > 0
            && self.connection.is_some();
        if open_transaction {
            self.rollback_feedback(ctx);
        }

        self.release(ctx);
        self.statements = 0;
        self.phase = ShardPhase::Aborted;
    }
}

/// Routes, buffers, inserts and commits the documents of one task
pub struct ShardedWriter {
    ctx: WriterContext,
    shards: ShardList,
    options: Arc<ContentOptions>,
    output_dir: Option<String>,
    batch_size: usize,
    streaming: bool,
    states: BTreeMap<usize, ShardState>,
    /// Documents that failed before reaching a shard
    unassigned: WriterStats,
    finished: bool,
}

impl fmt::Debug for ShardedWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardedWriter")
            .field("id", &self.ctx.id)
            .field("policy", &self.ctx.policy.kind())
            .field("mode", &self.ctx.mode)
            .field("shards", &self.shards.len())
            .field("active_shards", &self.states.len())
            .field("finished", &self.finished)
            .finish()
    }
}

impl ShardedWriter {
    /// Create a writer for one task
    pub fn new(
        config: &WriterConfig,
        source: Arc<dyn ContentSource>,
        shards: ShardList,
        policy: Arc<dyn AssignmentPolicy>,
    ) -> Result<Self> {
        config.validate()?;

        if policy.shard_count() != shards.len() {
            return Err(Error::config(format!(
                "{} policy covers {} shards but the task has {}",
                policy.kind(),
                policy.shard_count(),
                shards.len()
            )));
        }

        let ctx = WriterContext {
            id: Uuid::new_v4(),
            source,
            policy,
            metrics: Arc::new(WriterMetrics::new()),
            mode: config.transaction_mode(),
            transaction_size: config.transaction_size(),
            tolerate_errors: config.tolerate_errors,
        };

        debug!(
            writer = %ctx.id,
            policy = %ctx.policy.kind(),
            mode = %ctx.mode,
            batch_size = config.batch_size,
            transaction_size = ctx.transaction_size,
            "writer created"
        );

        Ok(Self {
            ctx,
            shards,
            options: Arc::new(ContentOptions::from_config(config)),
            output_dir: config.output_dir.clone().filter(|d| !d.is_empty()),
            batch_size: config.batch_size,
            streaming: config.streaming,
            states: BTreeMap::new(),
            unassigned: WriterStats::default(),
            finished: false,
        })
    }

    /// Report into a shared metrics collector instead of a private one
    pub fn with_metrics(mut self, metrics: Arc<WriterMetrics>) -> Self {
        self.ctx.metrics = metrics;
        self
    }

    pub fn id(&self) -> Uuid {
        self.ctx.id
    }

    pub fn transaction_mode(&self) -> TransactionMode {
        self.ctx.mode
    }

    pub fn transaction_size(&self) -> usize {
        self.ctx.transaction_size
    }

    pub fn policy(&self) -> &Arc<dyn AssignmentPolicy> {
        &self.ctx.policy
    }

    pub fn metrics(&self) -> &Arc<WriterMetrics> {
        &self.ctx.metrics
    }

    /// Whether `close` or `abort` has run
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Write one document.
    ///
    /// Per-document failures are logged and counted unless errors are not
    /// tolerated, in which case they are returned as [`Error::Rejected`] or
    /// [`Error::InvalidUri`]. A fatal shard error is returned as
    /// [`Error::Shard`]; the task should then [`abort`](Self::abort).
    pub fn write(&mut self, uri: impl Into<DocumentUri>, value: ContentValue) -> Result<()> {
        if self.finished {
            return Err(Error::other("write on a finished writer"));
        }

        let mut uri = uri.into();
        if let Some(dir) = &self.output_dir {
            uri.apply_output_dir(dir);
        }

        if let Err(e) = uri.validate() {
            self.ctx.metrics.record_submitted();
            self.unassigned.submitted += 1;
            self.unassigned.failed += 1;
            self.ctx.metrics.record_failed("", 1);
            warn!(writer = %self.ctx.id, error = %e, "invalid document URI");
            return if self.ctx.tolerate_errors { Ok(()) } else { Err(e) };
        }

        let index = self.ctx.policy.assign(&uri);
        let shard = self.shards.get(index).cloned().ok_or_else(|| {
            Error::topology(format!(
                "policy assigned shard {} of {}", index, self.shards.len()
            ))
        })?;

        let batch_size = self.batch_size;
        let tracks_feedback = self.ctx.policy.kind().needs_feedback();
        let state = self
            .states
            .entry(index)
            .or_insert_with(|| ShardState::new(shard, batch_size, tracks_feedback));
        let ctx = &self.ctx;

        if state.phase == ShardPhase::Aborted {
            return Err(Error::shard(state.shard.id.clone(), RequestError::Closed));
        }
        ctx.metrics.record_submitted();
        state.stats.submitted += 1;

        let document = match Document::build(&uri, &value, &self.options, self.streaming) {
            Ok(document) => document,
            Err(e) => {
                state.reject(ctx, 1);
                warn!(writer = %ctx.id, shard = %state.shard.id, uri = %uri, error = %e, "document content unusable");
                return if ctx.tolerate_errors { Ok(()) } else { Err(e) };
            }
        };

        if state.buffer.is_enabled() {
            state.phase = ShardPhase::Buffering;
            if state.buffer.append(document) {
                state.flush(ctx)?;
            } else {
                return Ok(());
            }
        } else {
            state.insert_one(ctx, document)?;
        }

        state.commit_if_due(ctx)
    }

    /// Flush, commit and release every shard.
    ///
    /// Every shard is closed even after a failure; the first error is returned.
    pub fn close(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        let mut first_error = None;
        for state in self.states.values_mut() {
            if let Err(e) = state.close(&self.ctx) {
                first_error.get_or_insert(e);
            }
        }

        let stats = self.stats();
        info!(
            writer = %self.ctx.id,
            submitted = stats.submitted,
            written = stats.written,
            failed = stats.failed,
            discarded = stats.discarded,
            commits = stats.commits,
            "writer closed"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Release every shard without flushing or committing
    pub fn abort(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        for state in self.states.values_mut() {
            state.abort(&self.ctx);
        }

        let stats = self.stats();
        warn!(
            writer = %self.ctx.id,
            submitted = stats.submitted,
            written = stats.written,
            discarded = stats.discarded,
            "writer aborted"
        );
    }

    /// Counts across all shards
    pub fn stats(&self) -> WriterStats {
        let mut stats = self.unassigned;
        for state in self.states.values() {
            stats.merge(&state.stats);
        }
        stats
    }

    /// Documents buffered or waiting for a commit
    pub fn in_flight(&self) -> u64 {
        self.states
            .values()
            .map(|s| s.buffer.len() as u64 + s.uncommitted)
            .sum()
    }

    /// State of one shard, if the writer has used it
    pub fn shard_status(&self, shard: &str) -> Option<ShardStatus> {
        let index = self.shards.find(shard)?.index;
        self.states.get(&index).map(ShardState::status)
    }

    /// State of every shard used so far, in shard list order
    pub fn shard_statuses(&self) -> Vec<ShardStatus> {
        self.states.values().map(ShardState::status).collect()
    }
}

impl Drop for ShardedWriter {
    fn drop(&mut self) {
        if !self.finished {
            warn!(writer = %self.ctx.id, "writer dropped without close; aborting");
            self.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyKind;
    use crate::connection::MemoryRepository;
    use crate::shard::policy::{self, StatisticalPolicy};

    fn writer(repo: &MemoryRepository, config: WriterConfig) -> ShardedWriter {
        let shards = repo.shard_list().unwrap();
        let policy = policy::build(config.policy, &shards);
        ShardedWriter::new(&config, Arc::new(repo.clone()), shards, policy).unwrap()
    }

    fn text(body: &str) -> ContentValue {
        ContentValue::Text(body.to_string())
    }

    #[test_log::test]
    fn test_batches_flush_and_commit() {
        let repo = MemoryRepository::with_shards(1);
        let config = WriterConfig::new().with_batch_size(3).with_transaction_size(2);
        let mut w = writer(&repo, config);
        assert_eq!(w.transaction_mode(), TransactionMode::Update);

        for i in 0..7 {
            w.write(format!("/doc-{}.txt", i), text("x")).unwrap();
        }
        let counters = repo.counters("forest-0");
        assert_eq!(counters.batch_inserts, 2);
        assert_eq!(counters.commits, 1);
        assert_eq!(w.in_flight(), 1);

        w.close().unwrap();
        let counters = repo.counters("forest-0");
        assert_eq!(counters.batch_inserts, 3);
        assert_eq!(counters.commits, 2);
        assert_eq!(repo.total_committed(), 7);
        assert_eq!(w.stats().written, 7);
        assert_eq!(repo.open_connections(), 0);
    }

    #[test_log::test]
    fn test_single_inserts_without_batching() {
        let repo = MemoryRepository::with_shards(2);
        let config = WriterConfig::new().with_batch_size(1).with_transaction_size(1);
        let mut w = writer(&repo, config);
        assert_eq!(w.transaction_mode(), TransactionMode::Auto);

        for i in 0..10 {
            w.write(format!("/d{}.txt", i), text("x")).unwrap();
        }
        // auto mode: visible before close
        assert_eq!(repo.total_committed(), 10);
        w.close().unwrap();

        let stats = w.stats();
        assert_eq!(stats.submitted, 10);
        assert_eq!(stats.written, 10);
        assert_eq!(stats.commits, 0);
    }

    #[test_log::test]
    fn test_output_dir_prefix_applied() {
        let repo = MemoryRepository::with_shards(1);
        let config = WriterConfig::new().with_batch_size(1).with_output_dir("/out");
        let mut w = writer(&repo, config);

        w.write("a.xml", ContentValue::Node("<a/>".into())).unwrap();
        w.write("/b.xml", ContentValue::Node("<b/>".into())).unwrap();
        w.close().unwrap();

        let mut uris = repo.committed_uris("forest-0");
        uris.sort();
        assert_eq!(uris, vec!["/out/a.xml", "/out/b.xml"]);
    }

    #[test_log::test]
    fn test_rejection_logged_and_skipped() {
        let repo = MemoryRepository::with_shards(1);
        repo.reject_when(|uri| uri.ends_with("bad.txt"));
        let config = WriterConfig::new()
            .with_batch_size(1)
            .with_policy(PolicyKind::Statistical);
        let mut w = writer(&repo, config);

        w.write("/bad.txt", text("x")).unwrap();
        assert_eq!(w.shard_status("forest-0").unwrap().feedback_delta, Some(0));

        w.write("/good.txt", text("y")).unwrap();
        w.close().unwrap();

        let stats = w.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.written, 1);
        assert_eq!(repo.committed_uris("forest-0"), vec!["/good.txt"]);
    }

    #[test_log::test]
    fn test_rejection_promoted_when_not_tolerated() {
        let repo = MemoryRepository::with_shards(1);
        repo.reject_when(|uri| uri.contains("bad"));
        let config = WriterConfig::new()
            .with_batch_size(2)
            .with_transaction_size(1)
            .with_tolerate_errors(false);
        let mut w = writer(&repo, config);

        w.write("/ok.txt", text("x")).unwrap();
        let err = w.write("/bad.txt", text("y")).unwrap_err();
        assert!(matches!(err, Error::Rejected { ref uri, .. } if uri == "/bad.txt"));

        // the good half of the batch was still accounted for
        let stats = w.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.flushes, 1);
        w.abort();
        assert_eq!(w.stats().settled(), 2);
    }

    #[test_log::test]
    fn test_invalid_uri_counts_as_failed() {
        let repo = MemoryRepository::with_shards(1);
        let mut w = writer(&repo, WriterConfig::new().with_batch_size(1));

        w.write("has space.txt", text("x")).unwrap();
        w.write("", text("x")).unwrap();
        w.close().unwrap();

        assert_eq!(w.stats().failed, 2);
        assert_eq!(w.stats().submitted, 2);
        assert_eq!(repo.counters("forest-0").connections_opened, 0);
    }

    #[test_log::test]
    fn test_fatal_error_rolls_back_feedback() {
        let repo = MemoryRepository::with_shards(1);
        repo.lose_connection_after("forest-0", 2);
        let shards = repo.shard_list().unwrap();
        let stats_policy = Arc::new(StatisticalPolicy::new(1));
        let config = WriterConfig::new()
            .with_batch_size(2)
            .with_transaction_size(10)
            .with_policy(PolicyKind::Statistical);
        let mut w = ShardedWriter::new(&config, Arc::new(repo.clone()), shards, stats_policy.clone()).unwrap();

        for i in 0..4 {
            w.write(format!("/d{}.txt", i), text("x")).unwrap();
        }
        assert_eq!(stats_policy.count(0), Some(4));

        w.write("/d4.txt", text("x")).unwrap();
        let err = w.write("/d5.txt", text("x")).unwrap_err();
        assert!(err.is_fatal_shard_error());
        assert_eq!(err.shard_id(), Some("forest-0"));

        assert_eq!(stats_policy.count(0), Some(0));
        let status = w.shard_status("forest-0").unwrap();
        assert_eq!(status.phase, ShardPhase::Aborted);
        assert!(!status.connection_open);
        assert_eq!(repo.open_connections(), 0);

        w.abort();
        let stats = w.stats();
        assert_eq!(stats.written, 0);
        assert_eq!(stats.discarded, 6);
        assert_eq!(repo.total_committed(), 0);
    }

    fn statistical_writer(repo: &MemoryRepository, config: WriterConfig) -> (ShardedWriter, Arc<StatisticalPolicy>) {
        let shards = repo.shard_list().unwrap();
        let policy = Arc::new(StatisticalPolicy::new(shards.len()));
        let config = config.with_policy(PolicyKind::Statistical);
        let w = ShardedWriter::new(&config, Arc::new(repo.clone()), shards, policy.clone()).unwrap();
        (w, policy)
    }

    #[test_log::test]
    fn test_permission_denied_mid_transaction_is_fatal() {
        let repo = MemoryRepository::with_shards(1);
        let (mut w, policy) = statistical_writer(&repo, WriterConfig::new().with_batch_size(1).with_transaction_size(10));

        for i in 0..3 {
            w.write(format!("/d{}.txt", i), text("x")).unwrap();
        }
        assert_eq!(policy.count(0), Some(3));

        repo.deny_permission("forest-0");
        let err = w.write("/d3.txt", text("x")).unwrap_err();
        assert!(matches!(
            err,
            Error::Shard { ref shard, source: RequestError::PermissionDenied(_) } if shard == "forest-0"
        ));

        assert_eq!(policy.count(0), Some(0));
        assert_eq!(w.metrics().snapshot().feedback_rollbacks, 1);
        assert_eq!(w.shard_status("forest-0").unwrap().phase, ShardPhase::Aborted);
        assert_eq!(repo.open_connections(), 0);

        let stats = w.stats();
        assert_eq!(stats.written, 0);
        assert_eq!(stats.discarded, 4);
        assert_eq!(stats.settled(), stats.submitted);
        assert_eq!(repo.total_committed(), 0);
    }

    #[test_log::test]
    fn test_fatal_flush_during_close() {
        let repo = MemoryRepository::with_shards(1);
        repo.lose_connection_after("forest-0", 2);
        let (mut w, policy) = statistical_writer(&repo, WriterConfig::new().with_batch_size(2).with_transaction_size(10));

        // two accepted batches, one document left in the buffer
        for i in 0..5 {
            w.write(format!("/d{}.txt", i), text("x")).unwrap();
        }
        assert_eq!(policy.count(0), Some(4));
        assert_eq!(w.in_flight(), 5);

        let err = w.close().unwrap_err();
        assert!(matches!(
            err,
            Error::Shard { ref shard, source: RequestError::ConnectionLost(_) } if shard == "forest-0"
        ));

        assert_eq!(policy.count(0), Some(0));
        assert_eq!(w.metrics().snapshot().feedback_rollbacks, 1);
        assert_eq!(w.shard_status("forest-0").unwrap().phase, ShardPhase::Aborted);
        assert_eq!(repo.counters("forest-0").commits, 0);
        assert_eq!(repo.open_connections(), 0);

        let stats = w.stats();
        assert_eq!(stats.written, 0);
        assert_eq!(stats.discarded, 5);
        assert_eq!(stats.settled(), stats.submitted);
        assert!(w.close().is_ok());
    }

    #[test_log::test]
    fn test_rejected_insert_is_not_a_statement() {
        let repo = MemoryRepository::with_shards(1);
        repo.reject_when(|uri| uri == "/bad.txt");
        let config = WriterConfig::new().with_batch_size(1).with_transaction_size(2);
        let mut w = writer(&repo, config);

        w.write("/a.txt", text("x")).unwrap();
        w.write("/bad.txt", text("x")).unwrap();
        assert_eq!(w.shard_status("forest-0").unwrap().statements, 1);
        assert_eq!(repo.counters("forest-0").commits, 0);

        w.write("/b.txt", text("x")).unwrap();
        assert_eq!(repo.counters("forest-0").commits, 1);
        assert_eq!(repo.committed_uris("forest-0"), vec!["/a.txt", "/b.txt"]);

        w.close().unwrap();
        assert_eq!(w.stats().failed, 1);
    }

    #[test_log::test]
    fn test_write_to_aborted_shard_keeps_counts_aligned() {
        let repo = MemoryRepository::with_shards(1);
        repo.lose_connection_after("forest-0", 0);
        let mut w = writer(&repo, WriterConfig::new().with_batch_size(1).with_transaction_size(1));

        assert!(w.write("/a.txt", text("x")).unwrap_err().is_fatal_shard_error());
        let err = w.write("/b.txt", text("x")).unwrap_err();
        assert!(matches!(err, Error::Shard { source: RequestError::Closed, .. }));

        let stats = w.stats();
        let snapshot = w.metrics().snapshot();
        assert_eq!(stats.submitted, 1);
        assert_eq!(snapshot.documents_submitted, stats.submitted);
        assert_eq!(snapshot.documents_discarded, stats.discarded);
        w.abort();
        assert_eq!(w.stats().settled(), 1);
    }

    #[test_log::test]
    fn test_commit_failure_is_fatal() {
        let repo = MemoryRepository::with_shards(1);
        repo.fail_commits("forest-0");
        let config = WriterConfig::new().with_batch_size(1).with_transaction_size(2);
        let mut w = writer(&repo, config);

        w.write("/a.txt", text("x")).unwrap();
        let err = w.write("/b.txt", text("x")).unwrap_err();
        assert!(matches!(err, Error::Shard { source: RequestError::CommitFailed(_), .. }));
        w.abort();
        assert_eq!(w.stats().discarded, 2);
    }

    #[test_log::test]
    fn test_close_commit_failure_still_releases() {
        let repo = MemoryRepository::with_shards(2);
        repo.fail_commits("forest-1");
        let config = WriterConfig::new().with_batch_size(5);
        let mut w = writer(&repo, config);

        for i in 0..20 {
            w.write(format!("/d{}.txt", i), text("x")).unwrap();
        }
        let err = w.close().unwrap_err();
        assert_eq!(err.shard_id(), Some("forest-1"));
        assert_eq!(repo.open_connections(), 0);
        assert_eq!(repo.total_committed() as u64, w.stats().written);
        assert!(repo.committed("forest-1").is_empty());
        assert_eq!(w.stats().settled(), 20);
    }

    #[test_log::test]
    fn test_abort_discards_buffers() {
        let repo = MemoryRepository::with_shards(3);
        let mut w = writer(&repo, WriterConfig::new().with_batch_size(100));

        for i in 0..30 {
            w.write(format!("/d{}.txt", i), text("x")).unwrap();
        }
        w.abort();

        assert_eq!(w.stats().discarded, 30);
        assert_eq!(repo.total_committed(), 0);
        assert!(w.write("/late.txt", text("x")).is_err());
        assert!(w.is_finished());
    }

    #[test_log::test]
    fn test_drop_releases_connections() {
        let repo = MemoryRepository::with_shards(2);
        {
            let mut w = writer(&repo, WriterConfig::new().with_batch_size(1).with_transaction_size(5));
            for i in 0..4 {
                w.write(format!("/d{}.txt", i), text("x")).unwrap();
            }
            assert!(repo.open_connections() > 0);
        }
        assert_eq!(repo.open_connections(), 0);
        assert_eq!(repo.total_committed(), 0);
    }

    #[test]
    fn test_policy_shard_count_must_match() {
        let repo = MemoryRepository::with_shards(2);
        let shards = repo.shard_list().unwrap();
        let result = ShardedWriter::new(
            &WriterConfig::default(),
            Arc::new(repo),
            shards,
            Arc::new(StatisticalPolicy::new(5)),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
