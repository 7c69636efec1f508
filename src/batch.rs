//! Per-shard batch buffer.
//!
//! Holds pending documents for one shard in append order. Single-writer
//! access assumed: the buffer is owned by its shard's state in one writer.

use crate::document::Document;

/// Fixed-capacity buffer of documents waiting to be flushed to one shard.
///
/// The buffer never holds more than `capacity` documents: the append that
/// fills it reports `true` and the owner is expected to [`drain`](Self::drain)
/// it immediately.
#[derive(Debug)]
pub struct BatchBuffer {
    capacity: usize,
    documents: Vec<Document>,
}

impl BatchBuffer {
    /// Create an empty buffer. A capacity of 1 or less disables batching.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            documents: Vec::with_capacity(capacity.max(1).min(1024)),
        }
    }

    /// Whether this buffer batches at all
    pub fn is_enabled(&self) -> bool {
        self.capacity > 1
    }

    /// Adds a document. Returns `true` when the buffer is now full.
    pub fn append(&mut self, document: Document) -> bool {
        debug_assert!(
            self.documents.len() < self.capacity.max(1),
            "append to a full batch buffer"
        );
        self.documents.push(document);
        self.is_full()
    }

    /// Takes the current contents in append order, leaving the buffer empty.
    pub fn drain(&mut self) -> Vec<Document> {
        std::mem::take(&mut self.documents)
    }

    /// Discards the current contents, returning how many documents were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.documents.len();
        self.documents.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.documents.len() >= self.capacity.max(1)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
