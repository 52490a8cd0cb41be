//! # Key/Value Engine
//!
//! The fallback engine for hosts where SQLite can't be opened.
//!
//! ## Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Key/Value Layout (one store)                         │
//! │                                                                         │
//! │  <store>_<eventId>        {"seq": 7, "doc": { "_id", "_rev", ... }}     │
//! │  <store>_rev_counter      "7"   (update sequence + revision tags)       │
//! │  <store>__meta_<key>      JSON value (checkpoints)                      │
//! │                                                                         │
//! │  Backends:                                                              │
//! │    MemoryKv   BTreeMap in memory                                        │
//! │    FileKv     one file per key, names percent-encoded                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! There is no native index: every derived ordering is a full scan plus a
//! sort. Nothing superseded is kept, so compaction has nothing to do.
//!
//! Stores may share a backend. A store named `<store>_<suffix>` lists under
//! the same prefix, so ownership of a key is decided by the `_id` of the
//! entry it holds, not by the prefix alone.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use tally_core::{Document, Revision, StorageEngine, StorageMetrics, StorageUsage, REV_COUNTER_KEY};

use super::{
    check_identity, plan_put, plan_replicated, Change, CompactionState, IndexField,
    PersistenceAdapter, WritePlan, WriteResult,
};
use crate::error::{StoreError, StoreResult};

// =============================================================================
// Backend Trait
// =============================================================================

/// Flat string-to-string storage.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set(&self, key: &str, value: String) -> StoreResult<()>;

    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;
}

// =============================================================================
// Memory Backend
// =============================================================================

/// In-memory backend. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryKv {
    entries: Arc<RwLock<BTreeMap<String, String>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// All keys, sorted.
    pub async fn keys(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl KvBackend for MemoryKv {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> StoreResult<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .entries
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }
}

// =============================================================================
// File Backend
// =============================================================================

/// One file per key in a directory.
///
/// File names are the percent-encoded key. Writes go to a dot-prefixed
/// temporary file first and are renamed into place.
#[derive(Debug, Clone)]
pub struct FileKv {
    dir: PathBuf,
}

impl FileKv {
    /// Opens (creating if needed) the directory.
    pub async fn open(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::Unavailable(format!("{}: {}", dir.display(), e)))?;

        debug!(dir = %dir.display(), "File key/value backend ready");
        Ok(FileKv { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(urlencoding::encode(key).as_ref())
    }
}

#[async_trait]
impl KvBackend for FileKv {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: String) -> StoreResult<()> {
        let target = self.path_for(key);
        let temp = self.dir.join(format!(".{}.tmp", urlencoding::encode(key)));

        tokio::fs::write(&temp, value).await?;
        tokio::fs::rename(&temp, &target).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }

            match urlencoding::decode(name) {
                Ok(key) if key.starts_with(prefix) => keys.push(key.into_owned()),
                Ok(_) => {}
                Err(e) => warn!(file = %name, error = %e, "Skipping undecodable key file"),
            }
        }

        keys.sort();
        Ok(keys)
    }
}

// =============================================================================
// Adapter
// =============================================================================

/// Stored value of a document key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KvEntry {
    /// Update sequence of the write that produced this revision.
    seq: u64,
    doc: Document,
}

/// Key/value persistence adapter.
pub struct KvAdapter {
    name: String,
    backend: Arc<dyn KvBackend>,
    write_lock: Mutex<()>,
    compaction: RwLock<CompactionState>,
}

impl KvAdapter {
    /// Opens the store on `backend`.
    ///
    /// Reads the revision counter once; a backend that can't serve that
    /// read is reported as `Unavailable`.
    pub async fn open(name: &str, backend: Arc<dyn KvBackend>) -> StoreResult<Self> {
        let adapter = KvAdapter {
            name: name.to_string(),
            backend,
            write_lock: Mutex::new(()),
            compaction: RwLock::new(CompactionState::Idle),
        };

        let counter = adapter
            .read_counter()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        info!(store = %name, update_seq = counter, "Key/value store opened");
        Ok(adapter)
    }

    fn doc_key(&self, id: &str) -> String {
        format!("{}_{}", self.name, id)
    }

    fn counter_key(&self) -> String {
        format!("{}_{}", self.name, REV_COUNTER_KEY)
    }

    fn meta_key(&self, key: &str) -> String {
        format!("{}__meta_{}", self.name, key)
    }

    fn store_prefix(&self) -> String {
        format!("{}_", self.name)
    }

    /// `(id, key)` for every key that may hold one of this store's documents.
    async fn candidate_keys(&self) -> StoreResult<Vec<(String, String)>> {
        let prefix = self.store_prefix();
        Ok(self
            .backend
            .keys_with_prefix(&prefix)
            .await?
            .into_iter()
            .filter_map(|key| {
                let id = key.strip_prefix(&prefix)?.to_string();
                (id != REV_COUNTER_KEY && !id.starts_with('_')).then_some((id, key))
            })
            .collect())
    }

    /// Parses the value under `doc_key(id)`. `None` when the key belongs to
    /// a longer store name.
    fn parse_owned(id: &str, raw: &str) -> StoreResult<Option<KvEntry>> {
        match serde_json::from_str::<KvEntry>(raw) {
            Ok(entry) if entry.doc.id == id => Ok(Some(entry)),
            Ok(_) => Ok(None),
            Err(_) if is_foreign_layout(id) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_counter(&self) -> StoreResult<u64> {
        match self.backend.get(&self.counter_key()).await? {
            Some(raw) => raw.trim().parse().map_err(|_| StoreError::InvalidDocument {
                id: self.counter_key(),
                reason: format!("counter is not a number: '{}'", raw),
            }),
            None => Ok(0),
        }
    }

    async fn read_entry(&self, id: &str) -> StoreResult<Option<KvEntry>> {
        match self.backend.get(&self.doc_key(id)).await? {
            Some(raw) => Self::parse_owned(id, &raw),
            None => Ok(None),
        }
    }

    /// Every document entry with its encoded size.
    async fn scan(&self) -> StoreResult<Vec<(KvEntry, u64)>> {
        let mut entries = Vec::new();
        for (id, key) in self.candidate_keys().await? {
            if let Some(raw) = self.backend.get(&key).await? {
                if let Some(entry) = Self::parse_owned(&id, &raw)? {
                    entries.push((entry, raw.len() as u64));
                }
            }
        }
        Ok(entries)
    }

    fn check_reserved(doc: &Document) -> StoreResult<()> {
        if doc.id == REV_COUNTER_KEY || doc.id.starts_with('_') {
            return Err(StoreError::InvalidDocument {
                id: doc.id.clone(),
                reason: "id collides with the store layout".to_string(),
            });
        }
        Ok(())
    }

    /// Applies writes in order. Not atomic: a failing document leaves the
    /// earlier ones of the same call written.
    async fn write_docs(&self, docs: Vec<Document>, replicated: bool) -> StoreResult<Vec<WriteResult>> {
        let _guard = self.write_lock.lock().await;
        let mut counter = self.read_counter().await?;
        let mut results = Vec::with_capacity(docs.len());

        for mut doc in docs {
            check_identity(&doc)?;
            Self::check_reserved(&doc)?;

            let current = match self.backend.get(&self.doc_key(&doc.id)).await? {
                Some(raw) => Some(Self::parse_owned(&doc.id, &raw)?.ok_or_else(|| {
                    StoreError::InvalidDocument {
                        id: doc.id.clone(),
                        reason: "key is held by another store on this backend".to_string(),
                    }
                })?),
                None => None,
            };
            let current_rev = current.as_ref().and_then(|entry| entry.doc.rev.clone());
            let next_seq = counter + 1;
            let tag = format!("{:08x}", next_seq);

            let plan = if replicated {
                plan_replicated(&doc.id, doc.rev.as_ref(), current_rev.as_ref(), tag)?
            } else {
                plan_put(&doc.id, doc.rev.as_ref(), current_rev.as_ref(), tag)?
            };

            if let WritePlan::Create(rev) | WritePlan::Replace(rev) = &plan {
                doc.rev = Some(rev.clone());
                if doc.aggregate_id.is_none() {
                    doc.aggregate_id = doc.event.aggregate_id().map(str::to_string);
                }
                self.commit_entry(next_seq, doc.clone()).await?;
                counter = next_seq;
            }

            results.push(plan.into_result(&doc.id));
        }

        Ok(results)
    }

    /// Counter first, so a crash never leaves two entries with one seq.
    async fn commit_entry(&self, seq: u64, doc: Document) -> StoreResult<()> {
        self.backend.set(&self.counter_key(), seq.to_string()).await?;
        let key = self.doc_key(&doc.id);
        let raw = serde_json::to_string(&KvEntry { seq, doc })?;
        self.backend.set(&key, raw).await
    }
}

/// True when `id` has the shape of another store's counter or metadata key.
fn is_foreign_layout(id: &str) -> bool {
    id.ends_with(&format!("_{}", REV_COUNTER_KEY)) || id.contains("__meta_")
}

// =============================================================================
// PersistenceAdapter Implementation
// =============================================================================

#[async_trait]
impl PersistenceAdapter for KvAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn engine(&self) -> StorageEngine {
        StorageEngine::KeyValue
    }

    async fn get(&self, id: &str) -> StoreResult<Option<Document>> {
        Ok(self.read_entry(id).await?.map(|entry| entry.doc))
    }

    async fn put(&self, doc: Document) -> StoreResult<WriteResult> {
        let id = doc.id.clone();
        self.write_docs(vec![doc], false)
            .await?
            .pop()
            .ok_or_else(|| StoreError::Internal(format!("no write result for '{}'", id)))
    }

    async fn bulk_put(&self, docs: Vec<Document>) -> StoreResult<Vec<WriteResult>> {
        self.write_docs(docs, true).await
    }

    async fn remove(&self, id: &str, rev: &Revision) -> StoreResult<WriteResult> {
        let _guard = self.write_lock.lock().await;

        let entry = self
            .read_entry(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let current = entry.doc.rev.clone();
        if current.as_ref() != Some(rev) {
            return Err(StoreError::conflict(id, Some(rev), current.as_ref()));
        }

        let seq = self.read_counter().await? + 1;
        let next = rev.next(format!("{:08x}", seq));
        let mut tombstone = entry.doc;
        tombstone.deleted = true;
        tombstone.rev = Some(next.clone());
        self.commit_entry(seq, tombstone).await?;

        debug!(store = %self.name, id = %id, rev = %next, "Tombstone written");
        Ok(WritePlan::Replace(next).into_result(id))
    }

    async fn list_all(&self) -> StoreResult<Vec<Document>> {
        let mut docs: Vec<Document> = self
            .scan()
            .await?
            .into_iter()
            .map(|(entry, _)| entry.doc)
            .filter(|doc| !doc.deleted)
            .collect();
        docs.sort_by(|a, b| a.event.seq.cmp(&b.event.seq).then_with(|| a.id.cmp(&b.id)));
        Ok(docs)
    }

    async fn find_by(&self, field: IndexField, _value: &str) -> StoreResult<Vec<Document>> {
        Err(StoreError::unsupported(
            "key_value",
            format!("find_by({})", field),
        ))
    }

    async fn changes_since(&self, since: u64, limit: usize) -> StoreResult<Vec<Change>> {
        let mut changes: Vec<Change> = self
            .scan()
            .await?
            .into_iter()
            .filter(|(entry, _)| entry.seq > since)
            .map(|(entry, _)| Change {
                seq: entry.seq,
                doc: entry.doc,
            })
            .collect();
        changes.sort_by_key(|change| change.seq);
        changes.truncate(limit);
        Ok(changes)
    }

    async fn get_meta(&self, key: &str) -> StoreResult<Option<Value>> {
        match self.backend.get(&self.meta_key(key)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn put_meta(&self, key: &str, value: Value) -> StoreResult<()> {
        self.backend
            .set(&self.meta_key(key), serde_json::to_string(&value)?)
            .await
    }

    async fn usage(&self) -> StoreResult<StorageUsage> {
        let entries = self.scan().await?;
        Ok(StorageUsage {
            bytes: entries.iter().map(|(_, size)| size).sum(),
            items: entries.iter().filter(|(entry, _)| !entry.doc.deleted).count() as u64,
        })
    }

    async fn metrics(&self) -> StoreResult<StorageMetrics> {
        let entries = self.scan().await?;
        let total_size = entries.iter().map(|(_, size)| size).sum();
        let tombstones = entries.iter().filter(|(entry, _)| entry.doc.deleted).count() as u64;
        let live = entries.len() as u64 - tombstones;

        Ok(StorageMetrics::new(
            total_size,
            live,
            tombstones,
            self.read_counter().await?,
            self.compaction.read().await.is_running(),
        ))
    }

    async fn compact(&self) -> StoreResult<()> {
        debug!(store = %self.name, "Key/value compaction is a no-op");
        *self.compaction.write().await = CompactionState::Finished;
        Ok(())
    }

    async fn compaction_state(&self) -> CompactionState {
        self.compaction.read().await.clone()
    }

    async fn destroy(&self) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;

        let mut keys = vec![self.counter_key()];
        keys.extend(
            self.backend
                .keys_with_prefix(&format!("{}__meta_", self.name))
                .await?,
        );
        for (id, key) in self.candidate_keys().await? {
            // Unreadable entries under a document key are still ours.
            let foreign = match self.backend.get(&key).await? {
                Some(raw) => matches!(Self::parse_owned(&id, &raw), Ok(None)),
                None => true,
            };
            if !foreign {
                keys.push(key);
            }
        }

        for key in &keys {
            self.backend.delete(key).await?;
        }
        *self.compaction.write().await = CompactionState::Idle;

        warn!(store = %self.name, removed = keys.len(), "Store destroyed");
        Ok(())
    }
}
