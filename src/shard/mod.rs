//! Shard identity and placement
//!
//! A task writes into a fixed, ordered list of shards established once from
//! the job's topology. The ordinal of a shard in that list is the index the
//! assignment policy returns.

pub mod policy;
pub mod topology;
pub mod validator;
mod util;

pub use policy::{AssignmentPolicy, BucketPolicy, LegacyPolicy, StatisticalPolicy};
pub use topology::{ShardHost, TopologyMap};
pub use validator::TopologyValidator;

use crate::error::{Result, Error};

/// Shard ID type
pub type ShardId = String;

/// Magic bytes and version for topology files
pub(crate) const TOPOLOGY_MAGIC: &[u8; 4] = b"SPTM"; // "Shardpump Topology Map"
pub(crate) const TOPOLOGY_VERSION: u32 = 1;

/// One shard of the target repository
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shard {
    /// Shard identifier
    pub id: ShardId,
    /// Ordinal in the task's shard list
    pub index: usize,
    /// Host serving the shard
    pub host: String,
}

/// The ordered shard list of a task; immutable once built
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardList {
    shards: Vec<Shard>,
}

impl ShardList {
    /// Build a shard list from (shard, host) pairs in order
    pub fn new<I, S, H>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, H)>,
        S: Into<ShardId>,
        H: Into<String>,
    {
        let mut shards: Vec<Shard> = Vec::new();

        for (index, (id, host)) in pairs.into_iter().enumerate() {
            let id = id.into();
            if id.is_empty() {
                return Err(Error::topology(format!("empty shard id at position {}", index)));
            }
            if shards.iter().any(|s| s.id == id) {
                return Err(Error::topology(format!("duplicate shard id: {}", id)));
            }
            shards.push(Shard {
                id,
                index,
                host: host.into(),
            });
        }

        if shards.is_empty() {
            return Err(Error::topology("no shards available"));
        }

        Ok(Self { shards })
    }

    /// Number of shards
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    /// A shard list is never empty
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Shard at an ordinal
    pub fn get(&self, index: usize) -> Option<&Shard> {
        self.shards.get(index)
    }

    /// Shard by identifier
    pub fn find(&self, id: &str) -> Option<&Shard> {
        self.shards.iter().find(|s| s.id == id)
    }

    /// Shards in list order
    pub fn iter(&self) -> impl Iterator<Item = &Shard> {
        self.shards.iter()
    }
}
