//! Job-startup validation
//!
//! Runs once per job, before any writer exists: checks the output directory
//! and persists the shard-to-host map every task will load.

use std::path::Path;

use tracing::{debug, info};

use crate::config::{DirectoryMode, WriterConfig};
use crate::connection::{AdminSession, ContentSource, RequestError};
use crate::error::{Result, Error};
use crate::shard::topology::TopologyMap;

/// One-shot topology and output-location validator
#[derive(Debug, Default)]
pub struct TopologyValidator {
    used: bool,
}

impl TopologyValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `validate` has already run
    pub fn has_run(&self) -> bool {
        self.used
    }

    /// Validate the output location, query the topology and persist it to `path`.
    ///
    /// The admin session is released on every path. A validator runs once;
    /// calling this again fails without contacting the repository.
    pub fn validate(
        &mut self,
        source: &dyn ContentSource,
        config: &WriterConfig,
        path: &Path,
    ) -> Result<TopologyMap> {
        if self.used {
            return Err(Error::topology("topology already validated for this job"));
        }
        self.used = true;

        config.validate()?;

        let mut session = source.admin().map_err(pre_task)?;
        let result = Self::run(session.as_mut(), config, path);
        session.close();

        let map = result?;
        info!(
            job_id = %map.job_id,
            shards = map.len(),
            path = %path.display(),
            "topology persisted"
        );
        Ok(map)
    }

    fn run(session: &mut dyn AdminSession, config: &WriterConfig, path: &Path) -> Result<TopologyMap> {
        let hosts = session.shard_hosts().map_err(pre_task)?;
        if hosts.is_empty() {
            return Err(Error::topology("topology query returned no shards"));
        }

        let map = TopologyMap::new(hosts);
        map.save(path)?;

        if let Some(dir) = config.output_dir.as_deref().filter(|d| !d.is_empty()) {
            if config.clean_output_dir {
                debug!(dir, "deleting output directory");
                session.delete_directory(dir).map_err(pre_task)?;
            } else {
                let mode = session.directory_creation().map_err(pre_task)?;
                if mode != DirectoryMode::Manual && session.directory_exists(dir).map_err(pre_task)? {
                    return Err(Error::OutputExists(dir.to_string()));
                }
            }
        }

        Ok(map)
    }
}

fn pre_task(e: RequestError) -> Error {
    Error::topology(e.to_string())
}
