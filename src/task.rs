//! Task execution
//!
//! A task pulls `(identifier, value)` records from a [`RecordSource`] and
//! feeds them to a [`ShardedWriter`]. In threaded mode several workers share
//! one source; pulling the next record is the only step they synchronize on,
//! and every worker owns its own writer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::sync::WaitGroup;
use parking_lot::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::WriterConfig;
use crate::connection::ContentSource;
use crate::document::{ContentValue, DocumentUri};
use crate::error::{Result, Error};
use crate::metrics::WriterMetrics;
use crate::shard::policy::AssignmentPolicy;
use crate::shard::{ShardList, TopologyMap};
use crate::writer::{ShardedWriter, WriterStats};

/// One input record
pub type Record = (DocumentUri, ContentValue);

/// Cooperative cancellation token, checked before each record is pulled
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask every task holding this signal to stop pulling records
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Sequential supplier of records
pub trait RecordSource: Send {
    /// The next record, or `None` once the input is exhausted
    fn next_record(&mut self) -> Result<Option<Record>>;
}

/// [`RecordSource`] over any iterator of records
#[derive(Debug)]
pub struct IterSource<I> {
    iter: I,
}

impl<I> IterSource<I>
where
    I: Iterator<Item = Record> + Send,
{
    pub fn new(iter: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            iter: iter.into_iter(),
        }
    }
}

impl<I> RecordSource for IterSource<I>
where
    I: Iterator<Item = Record> + Send,
{
    fn next_record(&mut self) -> Result<Option<Record>> {
        Ok(self.iter.next())
    }
}

/// Outcome of a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub task_id: Uuid,
    /// Counts summed over every writer of the task
    pub stats: WriterStats,
    pub writers: usize,
    /// Whether the task stopped because the shutdown signal was raised
    pub shutdown_observed: bool,
    pub elapsed: Duration,
}

/// Why a worker stopped pulling records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Drained,
    Shutdown,
    PeerFailed,
}

/// Result of one worker loop
struct WorkerOutcome {
    stats: WriterStats,
    shutdown_observed: bool,
}

/// Drives the writers of one task
pub struct TaskRunner {
    id: Uuid,
    config: WriterConfig,
    source: Arc<dyn ContentSource>,
    shards: ShardList,
    policy: Arc<dyn AssignmentPolicy>,
    metrics: Arc<WriterMetrics>,
    shutdown: ShutdownSignal,
}

impl TaskRunner {
    pub fn new(
        config: WriterConfig,
        source: Arc<dyn ContentSource>,
        shards: ShardList,
        policy: Arc<dyn AssignmentPolicy>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            config,
            source,
            shards,
            policy,
            metrics: Arc::new(WriterMetrics::new()),
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Runner over a persisted topology, with the configured policy
    pub fn from_topology(
        config: WriterConfig,
        source: Arc<dyn ContentSource>,
        topology: &TopologyMap,
    ) -> Result<Self> {
        let shards = topology.shard_list()?;
        let policy = topology.policy(config.policy)?;
        Ok(Self::new(config, source, shards, policy))
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<WriterMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn metrics(&self) -> &Arc<WriterMetrics> {
        &self.metrics
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    fn writer(&self) -> Result<ShardedWriter> {
        Ok(ShardedWriter::new(
            &self.config,
            Arc::clone(&self.source),
            self.shards.clone(),
            Arc::clone(&self.policy),
        )?
        .with_metrics(Arc::clone(&self.metrics)))
    }

    /// Run the task with the configured number of threads
    pub fn run(&self, records: &mut dyn RecordSource) -> Result<TaskReport> {
        if self.config.threads > 1 {
            return self.run_threaded(records, self.config.threads);
        }

        let started = Instant::now();
        info!(task = %self.id, policy = %self.policy.kind(), shards = self.shards.len(), "task started");

        let lock = Mutex::new(records);
        let outcome = self.work(&lock, &AtomicBool::new(false), WaitGroup::new())?;

        Ok(self.report(outcome.stats, 1, outcome.shutdown_observed, started))
    }

    /// Run the task with `threads` workers sharing `records`.
    ///
    /// Workers only close their writers once every worker has stopped pulling.
    /// If any of them failed, all writers are aborted and the first error is
    /// returned, so a failed task commits nothing past its last regular commit.
    pub fn run_threaded(&self, records: &mut dyn RecordSource, threads: usize) -> Result<TaskReport> {
        let threads = threads.max(1);
        let started = Instant::now();
        info!(task = %self.id, policy = %self.policy.kind(), threads, "threaded task started");

        let lock = Mutex::new(records);
        let stop = AtomicBool::new(false);

        let outcomes = crossbeam::scope(|scope| {
            let done = WaitGroup::new();
            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    let done = done.clone();
                    let (lock, stop) = (&lock, &stop);
                    scope.spawn(move |_| self.work(lock, stop, done))
                })
                .collect();
            drop(done);

            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(Error::other("task worker panicked")))
                })
                .collect::<Vec<_>>()
        })
        .map_err(|_| Error::other("task worker panicked"))?;

        let mut stats = WriterStats::default();
        let mut shutdown_observed = false;
        let mut first_error = None;

        for outcome in outcomes {
            match outcome {
                Ok(outcome) => {
                    stats.merge(&outcome.stats);
                    shutdown_observed |= outcome.shutdown_observed;
                }
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        Ok(self.report(stats, threads, shutdown_observed, started))
    }

    /// One worker: pull, write, then close or abort its writer.
    ///
    /// `done` is released once the worker stops pulling; a worker that ran
    /// out of input waits for its peers before deciding between close and abort.
    fn work(&self, records: &Mutex<&mut dyn RecordSource>, stop: &AtomicBool, done: WaitGroup) -> Result<WorkerOutcome> {
        let mut writer = match self.writer() {
            Ok(writer) => writer,
            Err(e) => {
                stop.store(true, Ordering::SeqCst);
                return Err(e);
            }
        };

        let result = loop {
            if self.shutdown.is_triggered() {
                info!(task = %self.id, writer = %writer.id(), "shutdown observed, closing writer");
                break Ok(Exit::Shutdown);
            }
            if stop.load(Ordering::SeqCst) {
                break Ok(Exit::PeerFailed);
            }

            let next = records.lock().next_record();
            match next {
                Ok(Some((uri, value))) => {
                    if let Err(e) = writer.write(uri, value) {
                        break Err(e);
                    }
                }
                Ok(None) => break Ok(Exit::Drained),
                Err(e) => break Err(e),
            }
        };

        let exit = match result {
            Ok(exit) => exit,
            Err(e) => {
                stop.store(true, Ordering::SeqCst);
                error!(task = %self.id, writer = %writer.id(), error = %e, "task aborted");
                writer.abort();
                return Err(e);
            }
        };

        done.wait();
        if exit == Exit::PeerFailed || stop.load(Ordering::SeqCst) {
            warn!(task = %self.id, writer = %writer.id(), "peer worker failed, aborting writer");
            writer.abort();
            return Ok(WorkerOutcome {
                stats: writer.stats(),
                shutdown_observed: false,
            });
        }

        if let Err(e) = writer.close() {
            stop.store(true, Ordering::SeqCst);
            return Err(e);
        }

        Ok(WorkerOutcome {
            stats: writer.stats(),
            shutdown_observed: exit == Exit::Shutdown,
        })
    }

    fn report(&self, stats: WriterStats, writers: usize, shutdown_observed: bool, started: Instant) -> TaskReport {
        let report = TaskReport {
            task_id: self.id,
            stats,
            writers,
            shutdown_observed,
            elapsed: started.elapsed(),
        };
        info!(
            task = %self.id,
            written = stats.written,
            failed = stats.failed,
            discarded = stats.discarded,
            shutdown = shutdown_observed,
            "task finished"
        );
        report
    }
}
