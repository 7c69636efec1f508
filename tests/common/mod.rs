#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use shardpump::shard::policy;
use shardpump::{
    AssignmentPolicy, ContentValue, DocumentUri, MemoryRepository, PolicyKind, Record, ShardedWriter,
    WriterConfig,
};

pub struct TestEnv {
    pub repo: MemoryRepository,
    pub policy: Arc<dyn AssignmentPolicy>,
    pub writer: ShardedWriter,
}

impl TestEnv {
    pub fn new(shards: usize, config: WriterConfig) -> Self {
        let repo = MemoryRepository::with_shards(shards);
        let policy = policy::build(config.policy, &repo.shard_list().unwrap());
        Self::with_policy(repo, config, policy)
    }

    pub fn with_policy(repo: MemoryRepository, config: WriterConfig, policy: Arc<dyn AssignmentPolicy>) -> Self {
        let writer = ShardedWriter::new(
            &config,
            Arc::new(repo.clone()),
            repo.shard_list().unwrap(),
            Arc::clone(&policy),
        )
        .unwrap();

        Self { repo, policy, writer }
    }
}

/// Routes `/s<N>/...` to shard N and records feedback like the statistical policy
#[derive(Debug)]
pub struct RoutedPolicy {
    counts: Mutex<Vec<i64>>,
}

impl RoutedPolicy {
    pub fn new(shards: usize) -> Self {
        Self {
            counts: Mutex::new(vec![0; shards]),
        }
    }

    pub fn count(&self, shard: usize) -> i64 {
        self.counts.lock()[shard]
    }
}

impl AssignmentPolicy for RoutedPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Statistical
    }

    fn assign(&self, uri: &DocumentUri) -> usize {
        uri.as_str()
            .strip_prefix("/s")
            .and_then(|rest| rest.split('/').next())
            .and_then(|n| n.parse().ok())
            .unwrap_or(0)
    }

    fn update(&self, shard: usize, delta: i64) {
        self.counts.lock()[shard] += delta;
    }

    fn shard_count(&self) -> usize {
        self.counts.lock().len()
    }
}

pub fn text(body: impl Into<String>) -> ContentValue {
    ContentValue::Text(body.into())
}

pub fn records(prefix: &str, count: usize) -> Vec<Record> {
    (0..count)
        .map(|i| (DocumentUri::new(format!("/{}/doc-{}.txt", prefix, i)), text(format!("body {}", i))))
        .collect()
}
