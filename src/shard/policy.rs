//! Shard assignment policies
//!
//! A policy maps a document identifier to an ordinal in the task's
//! [`ShardList`](crate::shard::ShardList). The legacy and bucket policies are
//! pure functions of the identifier; the statistical policy keeps per-shard
//! document counts and steers new documents toward the least-loaded shard.

use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::PolicyKind;
use crate::document::DocumentUri;
use crate::shard::ShardList;

/// Number of buckets used by [`BucketPolicy`]
pub const BUCKET_COUNT: usize = 16384;

/// Maps document identifiers to shard ordinals
pub trait AssignmentPolicy: Send + Sync + Debug {
    /// Which policy this is
    fn kind(&self) -> PolicyKind;

    /// Shard ordinal for a document
    fn assign(&self, uri: &DocumentUri) -> usize;

    /// Adjust the weight of a shard by a signed document count.
    ///
    /// Deterministic policies ignore this.
    fn update(&self, _shard_index: usize, _delta: i64) {}

    /// Number of shards the policy assigns across
    fn shard_count(&self) -> usize;
}

fn placement_hash(uri: &DocumentUri) -> u32 {
    crc32fast::hash(uri.placement_key())
}

/// CRC-32 of the identifier modulo the shard count
#[derive(Debug, Clone)]
pub struct LegacyPolicy {
    shard_count: usize,
}

impl LegacyPolicy {
    pub fn new(shard_count: usize) -> Self {
        Self {
            shard_count: shard_count.max(1),
        }
    }
}

impl AssignmentPolicy for LegacyPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Legacy
    }

    fn assign(&self, uri: &DocumentUri) -> usize {
        placement_hash(uri) as usize % self.shard_count
    }

    fn shard_count(&self) -> usize {
        self.shard_count
    }
}

/// Hashes identifiers into a fixed bucket space and maps contiguous bucket
/// ranges onto shards.
///
/// Bucket `b` belongs to shard `b * n / BUCKET_COUNT`, so every shard owns a
/// range of either `floor` or `ceil` of `BUCKET_COUNT / n` buckets.
#[derive(Debug, Clone)]
pub struct BucketPolicy {
    shard_count: usize,
}

impl BucketPolicy {
    pub fn new(shard_count: usize) -> Self {
        Self {
            shard_count: shard_count.max(1),
        }
    }

    /// Bucket an identifier falls into
    pub fn bucket(uri: &DocumentUri) -> usize {
        placement_hash(uri) as usize % BUCKET_COUNT
    }

    /// Shard owning a bucket
    pub fn shard_for_bucket(&self, bucket: usize) -> usize {
        (bucket % BUCKET_COUNT) * self.shard_count / BUCKET_COUNT
    }
}

impl AssignmentPolicy for BucketPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Bucket
    }

    fn assign(&self, uri: &DocumentUri) -> usize {
        self.shard_for_bucket(Self::bucket(uri))
    }

    fn shard_count(&self) -> usize {
        self.shard_count
    }
}

/// Least-loaded-shard assignment driven by write feedback.
///
/// Counts are shared by every writer holding the same policy instance.
/// They are best-effort: concurrent writers may pick the same shard before
/// either reports back.
#[derive(Debug)]
pub struct StatisticalPolicy {
    counts: Mutex<Vec<u64>>,
}

impl StatisticalPolicy {
    /// All shards start empty
    pub fn new(shard_count: usize) -> Self {
        Self {
            counts: Mutex::new(vec![0; shard_count.max(1)]),
        }
    }

    /// Start from document counts reported by the repository
    pub fn seeded(counts: Vec<u64>) -> Self {
        if counts.is_empty() {
            return Self::new(1);
        }
        Self {
            counts: Mutex::new(counts),
        }
    }

    /// Current count of a shard
    pub fn count(&self, shard_index: usize) -> Option<u64> {
        self.counts.lock().get(shard_index).copied()
    }

    /// Copy of all counts in shard order
    pub fn counts(&self) -> Vec<u64> {
        self.counts.lock().clone()
    }
}

impl AssignmentPolicy for StatisticalPolicy {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Statistical
    }

    fn assign(&self, _uri: &DocumentUri) -> usize {
        let counts = self.counts.lock();
        // min_by_key keeps the first minimum, so ties go to the lowest index
        counts
            .iter()
            .enumerate()
            .min_by_key(|(_, count)| **count)
            .map(|(index, _)| index)
            .unwrap_or(0)
    }

    fn update(&self, shard_index: usize, delta: i64) {
        let mut counts = self.counts.lock();
        if let Some(count) = counts.get_mut(shard_index) {
            *count = if delta >= 0 {
                count.saturating_add(delta as u64)
            } else {
                count.saturating_sub(delta.unsigned_abs())
            };
        }
    }

    fn shard_count(&self) -> usize {
        self.counts.lock().len()
    }
}

/// Create the policy of `kind` for a shard list
pub fn build(kind: PolicyKind, shards: &ShardList) -> Arc<dyn AssignmentPolicy> {
    match kind {
        PolicyKind::Legacy => Arc::new(LegacyPolicy::new(shards.len())),
        PolicyKind::Bucket => Arc::new(BucketPolicy::new(shards.len())),
        PolicyKind::Statistical => Arc::new(StatisticalPolicy::new(shards.len())),
    }
}
