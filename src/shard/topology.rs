//! Shard-to-host topology map
//!
//! Computed once per job by the [`TopologyValidator`](super::TopologyValidator)
//! and persisted so every task of the job builds the same ordered shard list.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use uuid::Uuid;

use crate::config::PolicyKind;
use crate::error::{Result, Error};
use crate::shard::policy::{self, AssignmentPolicy, StatisticalPolicy};
use crate::shard::{util, ShardId, ShardList};

/// One shard and the host serving it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardHost {
    pub shard: ShardId,
    pub host: String,
    /// Documents the shard held when the topology was queried, if reported
    pub document_count: Option<u64>,
}

impl ShardHost {
    pub fn new(shard: impl Into<ShardId>, host: impl Into<String>) -> Self {
        Self {
            shard: shard.into(),
            host: host.into(),
            document_count: None,
        }
    }

    pub fn with_document_count(mut self, count: u64) -> Self {
        self.document_count = Some(count);
        self
    }
}

/// Ordered shard-to-host map for one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyMap {
    pub job_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub entries: Vec<ShardHost>,
}

impl TopologyMap {
    /// Create a map for a new job
    pub fn new(entries: Vec<ShardHost>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            generated_at: Utc::now(),
            entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Host serving a shard
    pub fn host_of(&self, shard: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.shard == shard)
            .map(|e| e.host.as_str())
    }

    /// The task's fixed shard list, in map order
    pub fn shard_list(&self) -> Result<ShardList> {
        ShardList::new(self.entries.iter().map(|e| (e.shard.clone(), e.host.clone())))
    }

    /// Build an assignment policy over this map's shards.
    ///
    /// The statistical policy starts from the reported document counts.
    pub fn policy(&self, kind: PolicyKind) -> Result<Arc<dyn AssignmentPolicy>> {
        let shards = self.shard_list()?;
        if kind == PolicyKind::Statistical {
            let counts = self
                .entries
                .iter()
                .map(|e| e.document_count.unwrap_or(0))
                .collect();
            return Ok(Arc::new(StatisticalPolicy::seeded(counts)));
        }
        Ok(policy::build(kind, &shards))
    }

    /// Persist the map
    pub fn save(&self, path: &Path) -> Result<()> {
        if self.entries.is_empty() {
            return Err(Error::topology("refusing to persist an empty topology"));
        }
        let payload = bincode::serialize(self)?;
        util::write_framed(path, &payload)
    }

    /// Load a persisted map
    pub fn load(path: &Path) -> Result<Self> {
        let payload = util::read_framed(path)?;
        let map: Self = bincode::deserialize(&payload)?;
        if map.entries.is_empty() {
            return Err(Error::corruption(format!(
                "{}: topology has no shards", path.display()
            )));
        }
        Ok(map)
    }
}
