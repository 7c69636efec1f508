//! In-process multi-shard repository
//!
//! `MemoryRepository` implements [`ContentSource`] with per-shard document
//! stores and real transaction semantics: statements on an `Update`
//! connection stay invisible until `commit`, and closing such a connection
//! without committing discards them. Faults can be injected per shard to
//! drive the writer's failure paths.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::DirectoryMode;
use crate::connection::{
    AdminSession, Connection, ContentSource, RequestError, RequestResult, TransactionMode,
};
use crate::document::{Document, DocumentFormat};
use crate::shard::{Shard, ShardHost, ShardId, ShardList};
use crate::error::Result;

type RejectFn = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// A document as stored by the repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    pub uri: String,
    pub body: Vec<u8>,
    pub format: DocumentFormat,
    pub collections: Vec<String>,
    pub quality: i32,
}

/// Request counters of one shard
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShardCounters {
    pub connections_opened: usize,
    pub single_inserts: usize,
    pub batch_inserts: usize,
    pub commits: usize,
    pub discarded_transactions: usize,
}

#[derive(Default)]
struct ShardStore {
    committed: Vec<StoredDocument>,
    counters: ShardCounters,
}

impl ShardStore {
    fn upsert(&mut self, doc: StoredDocument) {
        match self.committed.iter_mut().find(|d| d.uri == doc.uri) {
            Some(existing) => *existing = doc,
            None => self.committed.push(doc),
        }
    }
}

#[derive(Default)]
struct Faults {
    reject: Option<RejectFn>,
    lose_connection_after: HashMap<ShardId, usize>,
    permission_denied: HashSet<ShardId>,
    commit_failures: HashSet<ShardId>,
    unreachable: HashSet<ShardId>,
    admin_unreachable: bool,
}

struct RepoState {
    topology: Vec<ShardHost>,
    stores: HashMap<ShardId, ShardStore>,
    faults: Faults,
    directory_mode: DirectoryMode,
    directories: HashSet<String>,
    open_connections: usize,
    open_admin_sessions: usize,
}

impl RepoState {
    fn store(&mut self, shard: &str) -> &mut ShardStore {
        self.stores.entry(shard.to_string()).or_default()
    }
}

/// Cloneable handle to an in-process repository
#[derive(Clone)]
pub struct MemoryRepository {
    state: Arc<Mutex<RepoState>>,
}

impl fmt::Debug for MemoryRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryRepository")
            .field("shards", &state.topology.len())
            .field("open_connections", &state.open_connections)
            .finish()
    }
}

impl MemoryRepository {
    /// Repository serving the given shards
    pub fn new(topology: Vec<ShardHost>) -> Self {
        let stores = topology
            .iter()
            .map(|entry| (entry.shard.clone(), ShardStore::default()))
            .collect();

        Self {
            state: Arc::new(Mutex::new(RepoState {
                topology,
                stores,
                faults: Faults::default(),
                directory_mode: DirectoryMode::Automatic,
                directories: HashSet::new(),
                open_connections: 0,
                open_admin_sessions: 0,
            })),
        }
    }

    /// Repository with shards `forest-0..n` spread over two hosts
    pub fn with_shards(count: usize) -> Self {
        Self::new(
            (0..count)
                .map(|i| ShardHost::new(format!("forest-{}", i), format!("host-{}", i % 2)))
                .collect(),
        )
    }

    /// The shard list a task would build from this repository's topology
    pub fn shard_list(&self) -> Result<ShardList> {
        let state = self.state.lock();
        ShardList::new(state.topology.iter().map(|e| (e.shard.clone(), e.host.clone())))
    }

    // Fault injection

    /// Reject every document whose URI satisfies `predicate`
    pub fn reject_when<F>(&self, predicate: F)
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.state.lock().faults.reject = Some(Arc::new(move |uri: &str| {
            predicate(uri).then(|| "document rejected by repository".to_string())
        }));
    }

    /// Drop connections to `shard` once they have served `statements` statements
    pub fn lose_connection_after(&self, shard: &str, statements: usize) {
        self.state
            .lock()
            .faults
            .lose_connection_after
            .insert(shard.to_string(), statements);
    }

    /// Refuse every insert on `shard`
    pub fn deny_permission(&self, shard: &str) {
        self.state.lock().faults.permission_denied.insert(shard.to_string());
    }

    /// Fail every commit on `shard`
    pub fn fail_commits(&self, shard: &str) {
        self.state.lock().faults.commit_failures.insert(shard.to_string());
    }

    /// Make `shard` impossible to connect to
    pub fn make_unreachable(&self, shard: &str) {
        self.state.lock().faults.unreachable.insert(shard.to_string());
    }

    /// Make admin sessions impossible to open
    pub fn make_admin_unreachable(&self) {
        self.state.lock().faults.admin_unreachable = true;
    }

    pub fn set_directory_mode(&self, mode: DirectoryMode) {
        self.state.lock().directory_mode = mode;
    }

    pub fn create_directory(&self, dir: &str) {
        self.state.lock().directories.insert(dir.to_string());
    }

    // Inspection

    /// Committed documents of a shard, in first-insert order
    pub fn committed(&self, shard: &str) -> Vec<StoredDocument> {
        self.state
            .lock()
            .stores
            .get(shard)
            .map(|s| s.committed.clone())
            .unwrap_or_default()
    }

    /// Committed URIs of a shard, in first-insert order
    pub fn committed_uris(&self, shard: &str) -> Vec<String> {
        self.committed(shard).into_iter().map(|d| d.uri).collect()
    }

    /// Committed documents across all shards
    pub fn total_committed(&self) -> usize {
        self.state.lock().stores.values().map(|s| s.committed.len()).sum()
    }

    /// Find a committed document on any shard
    pub fn document(&self, uri: &str) -> Option<(ShardId, StoredDocument)> {
        let state = self.state.lock();
        state.stores.iter().find_map(|(shard, store)| {
            store
                .committed
                .iter()
                .find(|d| d.uri == uri)
                .map(|d| (shard.clone(), d.clone()))
        })
    }

    pub fn counters(&self, shard: &str) -> ShardCounters {
        self.state
            .lock()
            .stores
            .get(shard)
            .map(|s| s.counters)
            .unwrap_or_default()
    }

    /// Connections opened and not yet closed
    pub fn open_connections(&self) -> usize {
        self.state.lock().open_connections
    }

    /// Admin sessions opened and not yet closed
    pub fn open_admin_sessions(&self) -> usize {
        self.state.lock().open_admin_sessions
    }

    pub fn directory_exists(&self, dir: &str) -> bool {
        directory_exists(&self.state.lock(), dir)
    }
}

fn directory_exists(state: &RepoState, dir: &str) -> bool {
    if state.directories.contains(dir) {
        return true;
    }
    state
        .stores
        .values()
        .any(|s| s.committed.iter().any(|d| d.uri.starts_with(dir)))
}

impl ContentSource for MemoryRepository {
    fn open(&self, shard: &Shard, mode: TransactionMode) -> RequestResult<Box<dyn Connection>> {
        let mut state = self.state.lock();

        if state.faults.unreachable.contains(&shard.id) {
            return Err(RequestError::connectivity(format!(
                "host {} unreachable for shard {}", shard.host, shard.id
            )));
        }
        if !state.topology.iter().any(|e| e.shard == shard.id) {
            return Err(RequestError::connectivity(format!("unknown shard {}", shard.id)));
        }

        state.store(&shard.id).counters.connections_opened += 1;
        state.open_connections += 1;
        debug!(shard = %shard.id, mode = %mode, "memory connection opened");

        Ok(Box::new(MemoryConnection {
            state: Arc::clone(&self.state),
            shard: shard.clone(),
            mode,
            open: true,
            pending: Vec::new(),
            statements: 0,
        }))
    }

    fn admin(&self) -> RequestResult<Box<dyn AdminSession>> {
        let mut state = self.state.lock();
        if state.faults.admin_unreachable {
            return Err(RequestError::connectivity("no reachable host for admin session"));
        }
        state.open_admin_sessions += 1;

        Ok(Box::new(MemoryAdminSession {
            state: Arc::clone(&self.state),
            open: true,
        }))
    }
}

/// Connection to one shard of a [`MemoryRepository`]
pub struct MemoryConnection {
    state: Arc<Mutex<RepoState>>,
    shard: Shard,
    mode: TransactionMode,
    open: bool,
    pending: Vec<StoredDocument>,
    statements: usize,
}

impl fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("shard", &self.shard.id)
            .field("mode", &self.mode)
            .field("open", &self.open)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl MemoryConnection {
    /// Fatal faults checked before every statement
    fn check_statement(&self, state: &RepoState) -> RequestResult<()> {
        if !self.open {
            return Err(RequestError::Closed);
        }
        if state.faults.permission_denied.contains(&self.shard.id) {
            return Err(RequestError::permission_denied(format!(
                "insert not permitted on {}", self.shard.id
            )));
        }
        if let Some(&limit) = state.faults.lose_connection_after.get(&self.shard.id) {
            if self.statements >= limit {
                return Err(RequestError::connection_lost(format!(
                    "{} dropped after {} statements", self.shard.host, self.statements
                )));
            }
        }
        Ok(())
    }

    fn stage(&mut self, state: &mut RepoState, document: Document) -> RequestResult<()> {
        if let Some(reject) = &state.faults.reject {
            if let Some(message) = reject(&document.uri) {
                return Err(RequestError::rejected(document.uri, message));
            }
        }

        let uri = document.uri;
        let body = document
            .payload
            .into_bytes()
            .map_err(|e| RequestError::rejected(uri.clone(), format!("unreadable payload: {}", e)))?;

        let stored = StoredDocument {
            uri,
            body,
            format: document.format,
            collections: document.options.collections.clone(),
            quality: document.options.quality,
        };

        match self.mode {
            TransactionMode::Auto => state.store(&self.shard.id).upsert(stored),
            TransactionMode::Update => self.pending.push(stored),
        }
        Ok(())
    }
}

impl Connection for MemoryConnection {
    fn shard(&self) -> &Shard {
        &self.shard
    }

    fn transaction_mode(&self) -> TransactionMode {
        self.mode
    }

    fn begin_transaction_if_needed(&mut self) -> RequestResult<()> {
        if !self.open {
            return Err(RequestError::Closed);
        }
        Ok(())
    }

    fn insert_one(&mut self, document: Document) -> RequestResult<()> {
        let state = Arc::clone(&self.state);
        let mut state = state.lock();
        self.check_statement(&state)?;

        self.statements += 1;
        state.store(&self.shard.id).counters.single_inserts += 1;
        self.stage(&mut state, document)
    }

    fn insert_batch(&mut self, documents: Vec<Document>) -> RequestResult<Vec<RequestError>> {
        let state = Arc::clone(&self.state);
        let mut state = state.lock();
        self.check_statement(&state)?;

        self.statements += 1;
        state.store(&self.shard.id).counters.batch_inserts += 1;

        let mut failures = Vec::new();
        for document in documents {
            if let Err(e) = self.stage(&mut state, document) {
                failures.push(e);
            }
        }
        Ok(failures)
    }

    fn commit(&mut self) -> RequestResult<()> {
        if !self.open {
            return Err(RequestError::Closed);
        }
        if self.mode == TransactionMode::Auto {
            return Ok(());
        }

        let mut state = self.state.lock();
        if state.faults.commit_failures.contains(&self.shard.id) {
            return Err(RequestError::commit_failed(format!(
                "commit refused on {}", self.shard.id
            )));
        }

        let store = state.store(&self.shard.id);
        for doc in self.pending.drain(..) {
            store.upsert(doc);
        }
        store.counters.commits += 1;
        Ok(())
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;

        let mut state = self.state.lock();
        if !self.pending.is_empty() {
            state.store(&self.shard.id).counters.discarded_transactions += 1;
        }
        self.pending.clear();
        state.open_connections = state.open_connections.saturating_sub(1);
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.close();
    }
}

struct MemoryAdminSession {
    state: Arc<Mutex<RepoState>>,
    open: bool,
}

impl MemoryAdminSession {
    fn ensure_open(&self) -> RequestResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(RequestError::Closed)
        }
    }
}

impl AdminSession for MemoryAdminSession {
    fn shard_hosts(&mut self) -> RequestResult<Vec<ShardHost>> {
        self.ensure_open()?;
        let state = self.state.lock();

        Ok(state
            .topology
            .iter()
            .map(|entry| {
                let count = state
                    .stores
                    .get(&entry.shard)
                    .map(|s| s.committed.len() as u64)
                    .unwrap_or(0);
                entry.clone().with_document_count(count)
            })
            .collect())
    }

    fn directory_creation(&mut self) -> RequestResult<DirectoryMode> {
        self.ensure_open()?;
        Ok(self.state.lock().directory_mode)
    }

    fn directory_exists(&mut self, dir: &str) -> RequestResult<bool> {
        self.ensure_open()?;
        Ok(directory_exists(&self.state.lock(), dir))
    }

    fn delete_directory(&mut self, dir: &str) -> RequestResult<()> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        state.directories.remove(dir);
        for store in state.stores.values_mut() {
            store.committed.retain(|d| !d.uri.starts_with(dir));
        }
        Ok(())
    }

    fn close(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        let mut state = self.state.lock();
        state.open_admin_sessions = state.open_admin_sessions.saturating_sub(1);
    }
}

impl Drop for MemoryAdminSession {
    fn drop(&mut self) {
        self.close();
    }
}
