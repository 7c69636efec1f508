//! Configuration for Shardpump
//!
//! This module provides the per-task configuration bundle consumed by the
//! writer: batching and transaction thresholds, output location, content
//! creation options, error tolerance and the assignment policy kind.

use std::fs;
use std::path::Path;
use serde::{Serialize, Deserialize};

use crate::connection::TransactionMode;
use crate::document::DocumentFormat;
use crate::error::{Result, Error};

/// Batch size used when none is configured
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Statements per transaction are derived from this many documents per commit
pub const DEFAULT_DOCS_PER_TRANSACTION: usize = 1000;

/// Shard assignment policies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum PolicyKind {
    /// Hash of the document URI modulo the shard count
    Legacy,
    /// Hash of the document URI into a fixed bucket table spread over shards
    Bucket,
    /// Least-loaded shard, fed back with confirmed write volume
    Statistical,
}

impl Default for PolicyKind {
    fn default() -> Self {
        Self::Legacy
    }
}

impl std::fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl PolicyKind {
    /// Parse a policy kind from a string
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "legacy" => Ok(Self::Legacy),
            "bucket" => Ok(Self::Bucket),
            "statistical" => Ok(Self::Statistical),
            _ => Err(Error::config(format!("Unknown assignment policy: {}", s))),
        }
    }

    /// Get the name of the policy kind
    pub fn name(&self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Bucket => "bucket",
            Self::Statistical => "statistical",
        }
    }

    /// Whether writers must report confirmed write volume back to the policy
    pub fn needs_feedback(&self) -> bool {
        matches!(self, Self::Statistical)
    }
}

/// XML repair level applied by the repository on insert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepairLevel {
    /// Server default
    Default,
    /// Reject malformed markup
    None,
    /// Repair malformed markup
    Full,
}

impl Default for RepairLevel {
    fn default() -> Self {
        Self::Default
    }
}

impl std::fmt::Display for RepairLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl RepairLevel {
    /// Parse a repair level from a string
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "default" => Ok(Self::Default),
            "none" => Ok(Self::None),
            "full" => Ok(Self::Full),
            _ => Err(Error::config(format!("Unknown repair level: {}", s))),
        }
    }

    /// Get the name of the repair level
    pub fn name(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::None => "none",
            Self::Full => "full",
        }
    }
}

/// How the deployment creates directory entries for inserted documents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectoryMode {
    /// Directories are created implicitly on insert
    Automatic,
    /// Directories are created implicitly, including their properties
    AutomaticWithProperties,
    /// Directories are managed by hand; the loader never checks them
    Manual,
}

impl std::fmt::Display for DirectoryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl DirectoryMode {
    /// Parse a directory mode from the name the server reports
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "automatic" => Ok(Self::Automatic),
            "automatic-with-properties" => Ok(Self::AutomaticWithProperties),
            "manual" => Ok(Self::Manual),
            _ => Err(Error::config(format!("Unknown directory creation mode: {}", s))),
        }
    }

    /// Get the name of the directory mode
    pub fn name(&self) -> &'static str {
        match self {
            Self::Automatic => "automatic",
            Self::AutomaticWithProperties => "automatic-with-properties",
            Self::Manual => "manual",
        }
    }
}

/// Configuration bundle for one loading task
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct WriterConfig {
    // Batching and transactions
    /// Documents per insert request; 1 or less disables batching
    pub batch_size: usize,
    /// Statements per transaction; derived from the batch size when unset
    pub transaction_size: Option<i64>,

    // Output location
    /// Prefix applied to every document URI
    pub output_dir: Option<String>,
    /// Delete the output directory during job validation instead of failing on it
    pub clean_output_dir: bool,

    // Content creation options
    /// (role, capability) pairs granted on every document
    pub permissions: Vec<(String, String)>,
    /// Collections every document is added to
    pub collections: Vec<String>,
    /// Document quality
    pub quality: i32,
    /// Content language
    pub language: Option<String>,
    /// Default namespace for structured content
    pub namespace: Option<String>,
    /// XML repair level
    pub repair_level: RepairLevel,
    /// Content encoding
    pub encoding: Option<String>,
    /// Document format; `Unknown` infers the format from each value
    pub content_type: DocumentFormat,
    /// Hand stream-sourced content to the connection unbuffered
    pub streaming: bool,

    // Behaviour
    /// Log and skip per-document failures instead of aborting the task
    pub tolerate_errors: bool,
    /// Shard assignment policy
    pub policy: PolicyKind,
    /// Worker threads pulling from the task's record source
    pub threads: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            transaction_size: None,

            output_dir: None,
            clean_output_dir: false,

            permissions: Vec::new(),
            collections: Vec::new(),
            quality: 0,
            language: None,
            namespace: None,
            repair_level: RepairLevel::default(),
            encoding: None,
            content_type: DocumentFormat::Xml,
            streaming: false,

            tolerate_errors: true,
            policy: PolicyKind::default(),
            threads: 1,
        }
    }
}

impl WriterConfig {
    /// Create a new writer configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the transaction size
    pub fn with_transaction_size(mut self, size: i64) -> Self {
        self.transaction_size = Some(size);
        self
    }

    /// Set the output directory prefix
    pub fn with_output_dir(mut self, dir: impl Into<String>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// Set whether job validation deletes an existing output directory
    pub fn with_clean_output_dir(mut self, clean: bool) -> Self {
        self.clean_output_dir = clean;
        self
    }

    /// Add a (role, capability) permission pair
    pub fn with_permission(mut self, role: impl Into<String>, capability: impl Into<String>) -> Self {
        self.permissions.push((role.into(), capability.into()));
        self
    }

    /// Add an output collection
    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collections.push(collection.into());
        self
    }

    /// Set the document quality
    pub fn with_quality(mut self, quality: i32) -> Self {
        self.quality = quality;
        self
    }

    /// Set the content language
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Set the default namespace
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Set the XML repair level
    pub fn with_repair_level(mut self, level: RepairLevel) -> Self {
        self.repair_level = level;
        self
    }

    /// Set the content encoding
    pub fn with_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = Some(encoding.into());
        self
    }

    /// Set the document format
    pub fn with_content_type(mut self, format: DocumentFormat) -> Self {
        self.content_type = format;
        self
    }

    /// Set streaming mode for stream-sourced content
    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    /// Set whether per-document failures are tolerated
    pub fn with_tolerate_errors(mut self, tolerate: bool) -> Self {
        self.tolerate_errors = tolerate;
        self
    }

    /// Set the assignment policy
    pub fn with_policy(mut self, policy: PolicyKind) -> Self {
        self.policy = policy;
        self
    }

    /// Set the number of worker threads per task
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Whether documents are buffered and sent in batches
    pub fn batching_enabled(&self) -> bool {
        self.batch_size > 1
    }

    /// Statements (single inserts or batch flushes) per transaction
    pub fn transaction_size(&self) -> usize {
        match self.transaction_size {
            Some(size) if size <= 0 => 1,
            Some(size) => size as usize,
            None => (DEFAULT_DOCS_PER_TRANSACTION / self.batch_size.max(1)).max(1),
        }
    }

    /// Transaction mode every shard connection is opened with
    pub fn transaction_mode(&self) -> TransactionMode {
        if self.transaction_size() > 1 || (self.batching_enabled() && self.tolerate_errors) {
            TransactionMode::Update
        } else {
            TransactionMode::Auto
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !(-1000..=1000).contains(&self.quality) {
            return Err(Error::config(
                "Quality must be between -1000 and 1000"
            ));
        }

        if self.collections.iter().any(|c| c.trim().is_empty()) {
            return Err(Error::config(
                "Collection names must not be empty"
            ));
        }

        if self.threads < 1 {
            return Err(Error::config(
                "Threads must be at least 1"
            ));
        }

        if let Some(dir) = &self.output_dir {
            if dir.chars().any(char::is_whitespace) {
                return Err(Error::config(format!(
                    "Output directory must not contain whitespace: {:?}", dir
                )));
            }
        }

        Ok(())
    }

    /// Create a human-readable string representation of the configuration
    pub fn to_string_pretty(&self) -> String {
        let mut result = String::new();

        result.push_str("=== Shardpump Configuration ===\n\n");

        result.push_str("Batching:\n");
        result.push_str(&format!("  Batch Size: {}\n", self.batch_size));
        result.push_str(&format!("  Transaction Size: {}\n", self.transaction_size()));
        result.push_str(&format!("  Transaction Mode: {}\n", self.transaction_mode()));

        result.push_str("\nOutput:\n");
        if let Some(ref dir) = self.output_dir {
            result.push_str(&format!("  Directory: {}\n", dir));
        }
        result.push_str(&format!("  Clean Directory: {}\n", self.clean_output_dir));
        result.push_str(&format!("  Content Type: {}\n", self.content_type));
        result.push_str(&format!("  Repair Level: {}\n", self.repair_level));
        result.push_str(&format!("  Quality: {}\n", self.quality));
        if !self.collections.is_empty() {
            result.push_str(&format!("  Collections: {}\n", self.collections.join(",")));
        }
        result.push_str(&format!("  Streaming: {}\n", self.streaming));

        result.push_str("\nBehaviour:\n");
        result.push_str(&format!("  Assignment Policy: {}\n", self.policy));
        result.push_str(&format!("  Tolerate Errors: {}\n", self.tolerate_errors));
        result.push_str(&format!("  Threads: {}\n", self.threads));

        result
    }

    /// Load configuration from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}
