//! # Architect Memory
//!
//! Store interface for an architect's memories: free-form JSON content with an
//! importance score in `[0, 1]` and a set of tags. Queries return entries at or
//! above an importance threshold, most important first.
//!
//! [`InMemoryStore`] is volatile; it is what tests and demos use. Durable
//! backends implement [`MemoryStore`] elsewhere.

use crate::error::{Error, ErrorKind, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use uuid::Uuid;

/// Entries kept by default before the least valuable ones are evicted
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Assigned by the store when empty
    #[serde(default)]
    pub id: String,
    pub timestamp: String,
    pub content: serde_json::Value,
    pub importance: f64,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl MemoryEntry {
    pub fn new(content: serde_json::Value, importance: f64) -> Self {
        Self {
            id: String::new(),
            timestamp: crate::message::now_iso8601(),
            content,
            importance,
            tags: BTreeSet::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// True when the entry carries every tag in `tags`
    pub fn has_tags(&self, tags: &BTreeSet<String>) -> bool {
        tags.is_subset(&self.tags)
    }
}

/// Filter for [`MemoryStore::query`]
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryQuery {
    /// Entries must carry all of these
    pub tags: Option<BTreeSet<String>>,
    pub importance_threshold: f64,
    pub limit: usize,
}

impl Default for MemoryQuery {
    fn default() -> Self {
        Self {
            tags: None,
            importance_threshold: 0.0,
            limit: 100,
        }
    }
}

impl MemoryQuery {
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_threshold(mut self, importance: f64) -> Self {
        self.importance_threshold = importance;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

pub trait MemoryStore: Send + Sync {
    /// Store an entry and return its id. An id already in the store is an error.
    fn add(&self, entry: MemoryEntry) -> Result<String>;

    fn get(&self, id: &str) -> Option<MemoryEntry>;

    /// Matching entries sorted by importance, highest first
    fn query(&self, query: &MemoryQuery) -> Vec<MemoryEntry>;
}

#[derive(Debug)]
struct Slot {
    entry: MemoryEntry,
    /// Insertion order, used to break ties
    seq: u64,
}

#[derive(Debug, Default)]
struct Entries {
    slots: HashMap<String, Slot>,
    next_seq: u64,
}

/// Volatile store. When full, the least important (then oldest) entry goes.
#[derive(Debug)]
pub struct InMemoryStore {
    entries: RwLock<Entries>,
    max_entries: usize,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_max_entries(DEFAULT_MAX_ENTRIES)
    }

    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(Entries::default()),
            max_entries: max_entries.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.read().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().slots.is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Entries> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Entries> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl MemoryStore for InMemoryStore {
    fn add(&self, mut entry: MemoryEntry) -> Result<String> {
        if !(0.0..=1.0).contains(&entry.importance) {
            return Err(Error::new(
                ErrorKind::InvalidArgument,
                format!("importance must be within [0, 1], got {}", entry.importance),
            )
            .with_operation("memory::add"));
        }

        let mut entries = self.write();
        if entry.id.is_empty() {
            entry.id = format!("mem-{}", Uuid::new_v4());
        } else if entries.slots.contains_key(&entry.id) {
            return Err(Error::new(ErrorKind::InvalidArgument, "memory entries are immutable")
                .with_operation("memory::add")
                .with_context("id", entry.id));
        }
        let seq = entries.next_seq;
        entries.next_seq += 1;

        if entries.slots.len() >= self.max_entries {
            let evict = entries
                .slots
                .values()
                .min_by(|a, b| {
                    a.entry
                        .importance
                        .total_cmp(&b.entry.importance)
                        .then(a.seq.cmp(&b.seq))
                })
                .map(|slot| slot.entry.id.clone());
            if let Some(id) = evict {
                tracing::debug!(%id, "memory entry evicted");
                entries.slots.remove(&id);
            }
        }

        let id = entry.id.clone();
        entries.slots.insert(id.clone(), Slot { entry, seq });
        Ok(id)
    }

    fn get(&self, id: &str) -> Option<MemoryEntry> {
        self.read().slots.get(id).map(|slot| slot.entry.clone())
    }

    fn query(&self, query: &MemoryQuery) -> Vec<MemoryEntry> {
        let entries = self.read();
        let mut matched: Vec<&Slot> = entries
            .slots
            .values()
            .filter(|slot| slot.entry.importance >= query.importance_threshold)
            .filter(|slot| query.tags.as_ref().map_or(true, |tags| slot.entry.has_tags(tags)))
            .collect();

        matched.sort_by(|a, b| {
            b.entry
                .importance
                .total_cmp(&a.entry.importance)
                .then(a.seq.cmp(&b.seq))
        });
        matched
            .into_iter()
            .take(query.limit)
            .map(|slot| slot.entry.clone())
            .collect()
    }
}
