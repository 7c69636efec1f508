//! Repository boundary
//!
//! The writer talks to the repository through two traits: a [`ContentSource`]
//! that opens one [`Connection`] per shard, and an [`AdminSession`] used once
//! per job to read the topology and prepare the output directory. Transport
//! and authentication live behind these traits.

pub mod error;
pub mod memory;

pub use error::{RequestError, RequestResult};
pub use memory::MemoryRepository;

use std::fmt;

use serde::{Serialize, Deserialize};

use crate::config::DirectoryMode;
use crate::document::Document;
use crate::shard::{Shard, ShardHost};

/// How a connection groups statements into transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionMode {
    /// Every statement commits itself
    Auto,
    /// Statements accumulate in an open transaction until `commit`
    Update,
}

impl fmt::Display for TransactionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Update => f.write_str("update"),
        }
    }
}

/// Opens connections and admin sessions against a deployment
pub trait ContentSource: Send + Sync {
    /// Open a connection scoped to one shard
    fn open(&self, shard: &Shard, mode: TransactionMode) -> RequestResult<Box<dyn Connection>>;

    /// Open an administrative session against any host of the deployment
    fn admin(&self) -> RequestResult<Box<dyn AdminSession>>;
}

/// A session bound to one shard
///
/// A connection is owned by a single writer and never shared across threads.
pub trait Connection: Send + fmt::Debug {
    /// Shard the connection writes to
    fn shard(&self) -> &Shard;

    /// Mode the connection was opened with
    fn transaction_mode(&self) -> TransactionMode;

    /// Start a transaction unless one is open or the mode is `Auto`
    fn begin_transaction_if_needed(&mut self) -> RequestResult<()>;

    /// Insert a single document.
    ///
    /// A rejection of the document is `ServerRejected`; any other error is
    /// fatal for the connection.
    fn insert_one(&mut self, document: Document) -> RequestResult<()>;

    /// Insert documents in one request.
    ///
    /// Every document is attempted. Per-document rejections are returned,
    /// fatal errors abort the whole request.
    fn insert_batch(&mut self, documents: Vec<Document>) -> RequestResult<Vec<RequestError>>;

    /// Commit the open transaction
    fn commit(&mut self) -> RequestResult<()>;

    /// Release the connection. Idempotent; an open `Update` transaction is
    /// discarded.
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

/// Administrative queries run once per job
pub trait AdminSession: Send {
    /// Shard-to-host pairs of the deployment, in a stable order
    fn shard_hosts(&mut self) -> RequestResult<Vec<ShardHost>>;

    /// How the deployment creates directories
    fn directory_creation(&mut self) -> RequestResult<DirectoryMode>;

    fn directory_exists(&mut self, dir: &str) -> RequestResult<bool>;

    /// Delete a directory and every document under it
    fn delete_directory(&mut self, dir: &str) -> RequestResult<()>;

    /// Release the session. Idempotent.
    fn close(&mut self);
}
