//! Model Registry (`spec.md` §4.1) — the authoritative, persistable
//! catalog of models with secondary indexes, capacity enforcement, and
//! LRU eviction. Indexing follows the teacher's `Arc<DashMap<String, _>>`
//! pattern (`analytics/anomaly.rs`'s baselines/anomalies maps) for
//! lock-free concurrent access without one big mutex around the catalog.

pub mod journal;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, RouterError};
use crate::model::descriptor::{Capability, ModelDescriptor, ModelFormat};
use crate::model::handle::ModelHandle;
use crate::model::metrics::{Metrics, MetricsSnapshot};

/// Registry entry status (`spec.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryStatus {
    Registered,
    Available,
    Loaded,
    Unloading,
    Error,
}

/// Internal mutable record. Never exposed by reference — readers get a
/// [`RegistryEntrySnapshot`] instead, so no caller can hold a lock across
/// a suspension point (`spec.md` §5).
struct RegistryRecord {
    descriptor: ModelDescriptor,
    handle: Option<Arc<dyn ModelHandle>>,
    status: EntryStatus,
    registered_at: DateTime<Utc>,
    metrics: Arc<Metrics>,
}

/// Stable, lock-free snapshot of one entry. Safe to read and hold
/// indefinitely; it never extends the lifetime of a live handle.
#[derive(Debug, Clone)]
pub struct RegistryEntrySnapshot {
    pub descriptor: ModelDescriptor,
    pub status: EntryStatus,
    pub registered_at: DateTime<Utc>,
    pub metrics: MetricsSnapshot,
}

pub struct Registry {
    capacity: usize,
    journal_path: PathBuf,
    entries: DashMap<String, RwLock<RegistryRecord>>,
    by_format: DashMap<ModelFormat, HashSet<String>>,
    by_capability: DashMap<Capability, HashSet<String>>,
    by_source: DashMap<String, HashSet<String>>,
    /// Unknown top-level journal keys from the last `load`, kept so the
    /// next `persist` round-trips them instead of dropping them.
    journal_extra: RwLock<serde_json::Map<String, serde_json::Value>>,
}

impl Registry {
    pub fn new(capacity: usize, journal_path: impl Into<PathBuf>) -> Self {
        Self {
            capacity,
            journal_path: journal_path.into(),
            entries: DashMap::new(),
            by_format: DashMap::new(),
            by_capability: DashMap::new(),
            by_source: DashMap::new(),
            journal_extra: RwLock::new(serde_json::Map::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn index_insert(&self, descriptor: &ModelDescriptor) {
        self.by_format
            .entry(descriptor.format)
            .or_default()
            .insert(descriptor.id.clone());
        for cap in descriptor.capabilities.iter() {
            self.by_capability
                .entry(*cap)
                .or_default()
                .insert(descriptor.id.clone());
        }
        self.by_source
            .entry(descriptor.source.clone())
            .or_default()
            .insert(descriptor.id.clone());
    }

    /// Removes `id` from every secondary index it appears in, dropping
    /// any bucket left empty (`spec.md` §4.1 invariant 1).
    fn index_remove(&self, descriptor: &ModelDescriptor) {
        if let Some(mut set) = self.by_format.get_mut(&descriptor.format) {
            set.remove(&descriptor.id);
            if set.is_empty() {
                drop(set);
                self.by_format.remove(&descriptor.format);
            }
        }
        for cap in descriptor.capabilities.iter() {
            if let Some(mut set) = self.by_capability.get_mut(cap) {
                set.remove(&descriptor.id);
                if set.is_empty() {
                    drop(set);
                    self.by_capability.remove(cap);
                }
            }
        }
        if let Some(mut set) = self.by_source.get_mut(&descriptor.source) {
            set.remove(&descriptor.id);
            if set.is_empty() {
                drop(set);
                self.by_source.remove(&descriptor.source);
            }
        }
    }

    /// Validates and inserts a new entry, persisting the updated catalog
    /// on success. Evicts the LRU `loaded` entry first if at capacity;
    /// fails with `CapacityExceeded` if that still doesn't free a slot.
    #[instrument(skip(self, descriptor), fields(id = %descriptor.id))]
    pub async fn register(&self, descriptor: ModelDescriptor) -> Result<RegistryEntrySnapshot> {
        descriptor
            .validate_non_empty()
            .map_err(RouterError::ValidationError)?;

        if self.entries.contains_key(&descriptor.id) {
            return Err(RouterError::DuplicateId(descriptor.id));
        }

        if self.entries.len() >= self.capacity {
            if self.evict_lru().await.is_none() {
                return Err(RouterError::CapacityExceeded(format!(
                    "registry at capacity ({}) and no loaded entry is evictable",
                    self.capacity
                )));
            }
        }

        let record = RegistryRecord {
            descriptor: descriptor.clone(),
            handle: None,
            status: EntryStatus::Registered,
            registered_at: Utc::now(),
            metrics: Arc::new(Metrics::new()),
        };
        self.index_insert(&descriptor);
        let snapshot = snapshot_of(&record);
        self.entries.insert(descriptor.id.clone(), RwLock::new(record));

        self.persist().await?;
        info!(id = %snapshot.descriptor.id, "registered model");
        Ok(snapshot)
    }

    /// Tears down the handle if loaded, removes from every index,
    /// persists the result.
    #[instrument(skip(self))]
    pub async fn unregister(&self, id: &str) -> Result<()> {
        let (_, lock) = self
            .entries
            .remove(id)
            .ok_or_else(|| RouterError::NotFound(id.to_string()))?;

        let record = lock.into_inner();
        if let Some(handle) = &record.handle {
            handle.unload().await?;
        }
        self.index_remove(&record.descriptor);
        self.persist().await?;
        info!(%id, "unregistered model");
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<RegistryEntrySnapshot> {
        let entry = self
            .entries
            .get(id)
            .ok_or_else(|| RouterError::NotFound(id.to_string()))?;
        let record = entry.read().await;
        Ok(snapshot_of(&record))
    }

    pub async fn get_by_format(&self, format: ModelFormat) -> Vec<RegistryEntrySnapshot> {
        let ids: Vec<String> = self
            .by_format
            .get(&format)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        self.snapshots_for(ids).await
    }

    pub async fn get_by_capability(&self, capability: Capability) -> Vec<RegistryEntrySnapshot> {
        let ids: Vec<String> = self
            .by_capability
            .get(&capability)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        self.snapshots_for(ids).await
    }

    pub async fn list(&self) -> Vec<RegistryEntrySnapshot> {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        self.snapshots_for(ids).await
    }

    async fn snapshots_for(&self, ids: Vec<String>) -> Vec<RegistryEntrySnapshot> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = self.entries.get(&id) {
                out.push(snapshot_of(&*entry.read().await));
            }
        }
        out
    }

    /// Attaches a freshly loaded handle and marks the entry `loaded`.
    pub async fn attach_handle(&self, id: &str, handle: Arc<dyn ModelHandle>) -> Result<()> {
        let entry = self
            .entries
            .get(id)
            .ok_or_else(|| RouterError::NotFound(id.to_string()))?;
        let mut record = entry.write().await;
        record.handle = Some(handle);
        record.status = EntryStatus::Loaded;
        Ok(())
    }

    pub async fn handle_for(&self, id: &str) -> Result<Arc<dyn ModelHandle>> {
        let entry = self
            .entries
            .get(id)
            .ok_or_else(|| RouterError::NotFound(id.to_string()))?;
        let record = entry.read().await;
        record
            .handle
            .clone()
            .ok_or_else(|| RouterError::NotFound(format!("{id} is not loaded")))
    }

    pub async fn metrics_for(&self, id: &str) -> Result<Arc<Metrics>> {
        let entry = self
            .entries
            .get(id)
            .ok_or_else(|| RouterError::NotFound(id.to_string()))?;
        Ok(entry.read().await.metrics.clone())
    }

    pub async fn mark_status(&self, id: &str, status: EntryStatus) -> Result<()> {
        let entry = self
            .entries
            .get(id)
            .ok_or_else(|| RouterError::NotFound(id.to_string()))?;
        entry.write().await.status = status;
        Ok(())
    }

    /// Evicts the `loaded` entry whose handle's `lastUsedAt` is oldest.
    /// Preserves the descriptor in `registered` status (re-loadable)
    /// rather than removing it — only `unregister` removes a descriptor
    /// entirely. Returns the evicted id, or `None` if nothing is
    /// currently loaded.
    #[instrument(skip(self))]
    pub async fn evict_lru(&self) -> Option<String> {
        let mut oldest: Option<(String, i64)> = None;
        for entry in self.entries.iter() {
            let record = entry.value().read().await;
            if record.status != EntryStatus::Loaded {
                continue;
            }
            let last_used = record.metrics.last_used_at_ms();
            if oldest.as_ref().map(|(_, t)| last_used < *t).unwrap_or(true) {
                oldest = Some((entry.key().clone(), last_used));
            }
        }

        let (id, _) = oldest?;
        if let Some(entry) = self.entries.get(&id) {
            let mut record = entry.write().await;
            if let Some(handle) = record.handle.take() {
                let _ = handle.unload().await;
            }
            record.status = EntryStatus::Registered;
        }
        warn!(id = %id, "evicted LRU entry to free a registry slot");
        Some(id)
    }

    #[instrument(skip(self))]
    pub async fn persist(&self) -> Result<()> {
        let descriptors: Vec<journal::JournalModelEntry> = {
            let mut out = Vec::with_capacity(self.entries.len());
            for entry in self.entries.iter() {
                let record = entry.value().read().await;
                out.push(journal::JournalModelEntry {
                    descriptor: record.descriptor.clone(),
                    metrics: record.metrics.snapshot(),
                    registered_at: record.registered_at,
                });
            }
            out
        };
        let extra = self.journal_extra.read().await.clone();
        journal::persist(&self.journal_path, descriptors, extra).await
    }

    /// Loads the journal, rebuilding the catalog and every secondary
    /// index. A corrupt journal is quarantined and the registry starts
    /// empty rather than aborting (`spec.md` §4.1).
    #[instrument(skip(self))]
    pub async fn load(&self) -> Result<()> {
        let (loaded, extra) = journal::load(&self.journal_path).await?;
        *self.journal_extra.write().await = extra;
        self.entries.clear();
        self.by_format.clear();
        self.by_capability.clear();
        self.by_source.clear();

        for entry in loaded {
            let metrics = Metrics::restore(&entry.metrics);

            self.index_insert(&entry.descriptor);
            let record = RegistryRecord {
                descriptor: entry.descriptor.clone(),
                handle: None,
                status: EntryStatus::Registered,
                registered_at: entry.registered_at,
                metrics: Arc::new(metrics),
            };
            self.entries.insert(entry.descriptor.id.clone(), RwLock::new(record));
        }
        debug!(count = self.entries.len(), "registry loaded from journal");
        Ok(())
    }
}

fn snapshot_of(record: &RegistryRecord) -> RegistryEntrySnapshot {
    RegistryEntrySnapshot {
        descriptor: record.descriptor.clone(),
        status: record.status,
        registered_at: record.registered_at,
        metrics: record.metrics.snapshot(),
    }
}
