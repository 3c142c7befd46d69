//! The namespaced memory store.
//!
//! Each namespace is an independent shard behind its own `RwLock`, holding
//! immutable `Arc<MemoryEntry>` values. Writers swap whole entries under the
//! write lock, so readers never observe a partially written value, and
//! traffic on one namespace never contends with another.

use crate::config::{FlushPolicy, MemoryConfig};
use crate::persistence::MemoryPersistence;
use crate::pipeline::MemoryPipeline;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use keel_core::{MemoryEntry, MemoryError, MemoryKey, MemoryResult, MemoryValue, Namespace};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

type Shard = RwLock<BTreeMap<MemoryKey, Arc<MemoryEntry>>>;

pub struct MemoryStore {
    namespaces: DashMap<Namespace, Arc<Shard>>,
    config: MemoryConfig,
    pipeline: MemoryPipeline,
    persistence: Option<Arc<dyn MemoryPersistence>>,
    dirty: AtomicBool,
    flush_lock: Mutex<()>,
}

impl MemoryStore {
    /// In-memory store without persistence.
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            namespaces: DashMap::new(),
            config,
            pipeline: MemoryPipeline::default(),
            persistence: None,
            dirty: AtomicBool::new(false),
            flush_lock: Mutex::new(()),
        }
    }

    pub fn builder() -> MemoryStoreBuilder {
        MemoryStoreBuilder::default()
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &MemoryPipeline {
        &self.pipeline
    }

    /// Store `value`, replacing any previous value under the same key.
    ///
    /// Falls back to `default_ttl` when `ttl` is `None`. Adding a new key to
    /// a full namespace first drops expired entries, then fails with
    /// `CapacityExceeded`. If the write-through flush fails, the previous
    /// value is restored and the flush error returned.
    pub fn put(
        &self,
        namespace: &Namespace,
        key: &MemoryKey,
        value: MemoryValue,
        ttl: Option<Duration>,
    ) -> MemoryResult<()> {
        let value = self.pipeline.apply_before_save(namespace, key, value)?;
        let entry = Arc::new(MemoryEntry::new(
            namespace.clone(),
            key.clone(),
            value,
            ttl.or(self.config.default_ttl),
        ));

        let shard = self.shard(namespace);
        let previous = {
            let mut entries = shard.write().unwrap_or_else(PoisonError::into_inner);
            let max = self.config.max_entries_per_namespace;
            if !entries.contains_key(key) && entries.len() >= max {
                let now = Utc::now();
                entries.retain(|_, e| !e.is_expired_at(now));
                if entries.len() >= max {
                    tracing::warn!(namespace = %namespace, max, "Memory namespace full");
                    return Err(MemoryError::CapacityExceeded {
                        namespace: namespace.to_string(),
                        max,
                    });
                }
            }
            entries.insert(key.clone(), Arc::clone(&entry))
        };

        tracing::debug!(namespace = %namespace, key = %key, "Stored memory entry");
        self.after_write().inspect_err(|e| {
            tracing::warn!(
                namespace = %namespace,
                key = %key,
                error = %e,
                "Flush failed, write rolled back"
            );
            let mut entries = shard.write().unwrap_or_else(PoisonError::into_inner);
            // A later put owns the key now; leave it alone.
            if entries.get(key).is_some_and(|current| Arc::ptr_eq(current, &entry)) {
                match &previous {
                    Some(previous) => entries.insert(key.clone(), Arc::clone(previous)),
                    None => entries.remove(key),
                };
            }
        })
    }

    /// Fetch a live value. An expired entry is removed on access.
    pub fn get(&self, namespace: &Namespace, key: &MemoryKey) -> MemoryResult<MemoryValue> {
        let not_found = || MemoryError::NotFound {
            namespace: namespace.to_string(),
            key: key.to_string(),
        };
        let shard = self
            .namespaces
            .get(namespace)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(not_found)?;

        let entry = {
            let entries = shard.read().unwrap_or_else(PoisonError::into_inner);
            entries.get(key).cloned().ok_or_else(not_found)?
        };

        if entry.is_expired() {
            let mut entries = shard.write().unwrap_or_else(PoisonError::into_inner);
            // Only remove what we saw; a concurrent put may have replaced it.
            if entries.get(key).is_some_and(|current| Arc::ptr_eq(current, &entry)) {
                entries.remove(key);
                tracing::debug!(namespace = %namespace, key = %key, "Dropped expired entry");
            }
            return Err(not_found());
        }

        Ok(self
            .pipeline
            .apply_after_load(namespace, key, entry.value.clone()))
    }

    /// Remove a key. Removing an absent key is a no-op. Like `put`, a
    /// failed write-through flush undoes the removal.
    pub fn delete(&self, namespace: &Namespace, key: &MemoryKey) -> MemoryResult<()> {
        let Some(shard) = self.namespaces.get(namespace).map(|s| Arc::clone(s.value())) else {
            return Ok(());
        };
        let removed = shard
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        let Some(removed) = removed else {
            return Ok(());
        };

        tracing::debug!(namespace = %namespace, key = %key, "Deleted memory entry");
        self.after_write().inspect_err(|e| {
            tracing::warn!(
                namespace = %namespace,
                key = %key,
                error = %e,
                "Flush failed, delete rolled back"
            );
            shard
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(key.clone())
                .or_insert_with(|| Arc::clone(&removed));
        })
    }

    /// Live entries whose key starts with `prefix`, in key order.
    ///
    /// The set of entries and the expiry cut-off are fixed when `scan` is
    /// called; writes that happen while the iterator is consumed are not
    /// reflected.
    pub fn scan(&self, namespace: &Namespace, prefix: &str) -> Scan {
        let now = Utc::now();
        let snapshot = match self.namespaces.get(namespace) {
            Some(shard) => {
                let entries = shard.read().unwrap_or_else(PoisonError::into_inner);
                entries
                    .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
                    .take_while(|(k, _)| k.as_str().starts_with(prefix))
                    .map(|(_, e)| Arc::clone(e))
                    .collect()
            }
            None => Vec::new(),
        };
        Scan {
            entries: snapshot.into_iter(),
            now,
            pipeline: self.pipeline.clone(),
        }
    }

    /// Remove every expired entry; returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let shards: Vec<_> = self
            .namespaces
            .iter()
            .map(|s| Arc::clone(s.value()))
            .collect();

        let mut removed = 0;
        for shard in shards {
            let mut entries = shard.write().unwrap_or_else(PoisonError::into_inner);
            let before = entries.len();
            entries.retain(|_, e| !e.is_expired_at(now));
            removed += before - entries.len();
        }
        if removed > 0 {
            tracing::debug!(removed, "Swept expired memory entries");
            self.dirty.store(true, Ordering::Release);
        }
        removed
    }

    /// Stored entries in `namespace`, expired ones included until swept.
    pub fn len(&self, namespace: &Namespace) -> usize {
        self.namespaces.get(namespace).map_or(0, |shard| {
            shard.read().unwrap_or_else(PoisonError::into_inner).len()
        })
    }

    pub fn is_empty(&self) -> bool {
        self.namespaces.iter().all(|shard| {
            shard
                .value()
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .is_empty()
        })
    }

    pub fn namespaces(&self) -> Vec<Namespace> {
        let mut names: Vec<_> = self.namespaces.iter().map(|s| s.key().clone()).collect();
        names.sort();
        names
    }

    /// Write all live entries to the persistence backend, if any.
    pub fn flush(&self) -> MemoryResult<()> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };
        // Serialize flushes so the last one written holds the newest state.
        let _guard = self.flush_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.dirty.store(false, Ordering::Release);
        let entries = self.live_entries(Utc::now());
        persistence.flush(&entries).inspect_err(|_| {
            self.dirty.store(true, Ordering::Release);
        })
    }

    /// Periodically sweep expired entries until the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = weak.upgrade() else {
                    break;
                };
                store.sweep();
            }
        })
    }

    /// Start the interval flusher when the policy asks for one.
    pub fn spawn_flusher(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let FlushPolicy::Interval(period) = self.config.flush_policy else {
            return None;
        };
        self.persistence.as_ref()?;
        Some(tokio::spawn(flush_loop(Arc::downgrade(self), period)))
    }

    fn shard(&self, namespace: &Namespace) -> Arc<Shard> {
        Arc::clone(
            self.namespaces
                .entry(namespace.clone())
                .or_insert_with(|| Arc::new(RwLock::new(BTreeMap::new())))
                .value(),
        )
    }

    fn live_entries(&self, now: DateTime<Utc>) -> Vec<MemoryEntry> {
        let mut out = Vec::new();
        for shard in self.namespaces.iter() {
            let entries = shard.value().read().unwrap_or_else(PoisonError::into_inner);
            out.extend(
                entries
                    .values()
                    .filter(|e| !e.is_expired_at(now))
                    .map(|e| MemoryEntry::clone(e)),
            );
        }
        out.sort_by(|a, b| (&a.namespace, &a.key).cmp(&(&b.namespace, &b.key)));
        out
    }

    fn after_write(&self) -> MemoryResult<()> {
        self.dirty.store(true, Ordering::Release);
        if self.config.flush_policy == FlushPolicy::OnWrite {
            self.flush()?;
        }
        Ok(())
    }

    fn load_entries(&self, entries: Vec<MemoryEntry>) -> usize {
        let now = Utc::now();
        let mut loaded = 0;
        for entry in entries.into_iter().filter(|e| !e.is_expired_at(now)) {
            let shard = self.shard(&entry.namespace);
            let mut guard = shard.write().unwrap_or_else(PoisonError::into_inner);
            guard.insert(entry.key.clone(), Arc::new(entry));
            loaded += 1;
        }
        loaded
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("namespaces", &self.namespaces.len())
            .field("config", &self.config)
            .field("persistent", &self.persistence.is_some())
            .finish()
    }
}

async fn flush_loop(weak: Weak<MemoryStore>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(store) = weak.upgrade() else {
            break;
        };
        if !store.dirty.load(Ordering::Acquire) {
            continue;
        }
        let result = tokio::task::spawn_blocking(move || store.flush()).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "Periodic memory flush failed"),
            Err(e) => tracing::warn!(error = %e, "Periodic memory flush task failed"),
        }
    }
}

/// Builder for a [`MemoryStore`] with a pipeline or persistence backend.
#[derive(Default)]
pub struct MemoryStoreBuilder {
    config: MemoryConfig,
    pipeline: MemoryPipeline,
    persistence: Option<Arc<dyn MemoryPersistence>>,
}

impl MemoryStoreBuilder {
    pub fn config(mut self, config: MemoryConfig) -> Self {
        self.config = config;
        self
    }

    pub fn pipeline(mut self, pipeline: MemoryPipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn persistence(mut self, persistence: Arc<dyn MemoryPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Build the store, loading any persisted entries. Entries that expired
    /// while the process was down are skipped.
    pub fn build(self) -> MemoryResult<MemoryStore> {
        let loaded = match &self.persistence {
            Some(p) => p.load()?,
            None => Vec::new(),
        };
        let store = MemoryStore {
            namespaces: DashMap::new(),
            config: self.config,
            pipeline: self.pipeline,
            persistence: self.persistence,
            dirty: AtomicBool::new(false),
            flush_lock: Mutex::new(()),
        };
        let count = store.load_entries(loaded);
        if store.persistence.is_some() {
            tracing::info!(entries = count, "Memory store loaded");
        }
        Ok(store)
    }
}

/// Iterator over a point-in-time snapshot of one namespace.
pub struct Scan {
    entries: std::vec::IntoIter<Arc<MemoryEntry>>,
    now: DateTime<Utc>,
    pipeline: MemoryPipeline,
}

impl Iterator for Scan {
    type Item = (MemoryKey, MemoryValue);

    fn next(&mut self) -> Option<Self::Item> {
        for entry in self.entries.by_ref() {
            if entry.is_expired_at(self.now) {
                continue;
            }
            let value =
                self.pipeline
                    .apply_after_load(&entry.namespace, &entry.key, entry.value.clone());
            return Some((entry.key.clone(), value));
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.entries.len()))
    }
}
