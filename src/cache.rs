//! Response cache keyed by tenant partition and normalized query.
//!
//! Each entry records the file signatures its answer was built from. A hit
//! is only returned after the caller confirms every signature still matches
//! the live manifest and storage; a mismatch evicts the entry and counts as
//! a miss.
//!
//! Partitions are labelled by their sorted tenant ids (`"HIH+RC"` for a
//! merged answer). Every tenant carries an epoch that [`ResponseCache::invalidate`]
//! bumps; a [`CacheTicket`] taken before retrieval remembers the epochs it
//! saw, and [`ResponseCache::put`] drops the value if any of them moved.
//! All of this happens under one lock, so an invalidation is visible to
//! every later `get` and no answer computed before it can be stored after it.
//!
//! With `cache.path` set, changes are written back at most once per
//! `cache.flush_interval_secs`. Invalidation and drop always flush.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};

use tenant_rag_core::models::FileSignature;
use tenant_rag_core::text::normalize_query;

use crate::config::CacheConfig;
use crate::storage::write_atomic;

const CACHE_FILE_VERSION: u32 = 1;

/// A document version an answer depended on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    pub tenant: String,
    pub signature: FileSignature,
}

/// Epochs of a partition's tenants, taken before an answer is computed.
#[derive(Debug, Clone)]
pub struct CacheTicket {
    tenants: Vec<String>,
    epochs: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry<T> {
    tenants: Vec<String>,
    query: String,
    value: T,
    dependencies: Vec<Dependency>,
    created_at: DateTime<Utc>,
    #[serde(skip)]
    seq: u64,
}

#[derive(Serialize)]
struct CacheFileOut<'a, T> {
    version: u32,
    entries: Vec<&'a CacheEntry<T>>,
}

#[derive(Deserialize)]
struct CacheFileIn<T> {
    version: u32,
    entries: Vec<CacheEntry<T>>,
}

type Key = (String, String);

struct CacheState<T> {
    entries: HashMap<Key, CacheEntry<T>>,
    epochs: HashMap<String, u64>,
    next_seq: u64,
}

impl<T> Default for CacheState<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            epochs: HashMap::new(),
            next_seq: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

pub struct ResponseCache<T: Serialize> {
    config: CacheConfig,
    state: Mutex<CacheState<T>>,
    /// Held while writing; guards the time of the last write.
    last_flush: Mutex<Instant>,
    dirty: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Partition label for a set of tenants: sorted, deduplicated, `+`-joined.
pub fn partition_label(tenants: &[String]) -> String {
    sorted_tenants(tenants).join("+")
}

fn sorted_tenants(tenants: &[String]) -> Vec<String> {
    let mut sorted = tenants.to_vec();
    sorted.sort();
    sorted.dedup();
    sorted
}

fn key(tenants: &[String], query: &str) -> Key {
    (partition_label(tenants), normalize_query(query))
}

impl<T: Clone + Serialize + DeserializeOwned> ResponseCache<T> {
    /// An empty cache. Nothing is read from `config.path`.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState::default()),
            last_flush: Mutex::new(Instant::now()),
            dirty: AtomicBool::new(false),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// A cache seeded from `config.path` when the file exists.
    ///
    /// An unreadable or incompatible file is logged and ignored.
    pub fn open(config: CacheConfig) -> Self {
        let cache = Self::new(config);
        if let Some(path) = cache.config.path.clone() {
            match load_entries::<T>(&path) {
                Ok(Some(entries)) => {
                    let mut state = cache.lock();
                    let mut loaded = 0usize;
                    for mut entry in entries {
                        if cache.is_expired(&entry) {
                            continue;
                        }
                        entry.seq = state.next_seq;
                        state.next_seq += 1;
                        state
                            .entries
                            .insert(key(&entry.tenants, &entry.query), entry);
                        loaded += 1;
                    }
                    drop(state);
                    tracing::info!(path = %path.display(), entries = loaded, "response cache loaded");
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %format!("{:#}", e), "ignoring unreadable cache file");
                }
            }
        }
        cache
    }

    fn is_expired(&self, entry: &CacheEntry<T>) -> bool {
        if self.config.ttl_hours == 0 {
            return false;
        }
        let ttl_secs = i64::try_from(self.config.ttl_hours.saturating_mul(3600)).unwrap_or(i64::MAX);
        (Utc::now() - entry.created_at).num_seconds() >= ttl_secs
    }

    /// Remember the partition epochs before computing an answer.
    pub fn ticket(&self, tenants: &[String]) -> CacheTicket {
        let tenants = sorted_tenants(tenants);
        let state = self.lock();
        let epochs = tenants
            .iter()
            .map(|t| state.epochs.get(t).copied().unwrap_or(0))
            .collect();
        CacheTicket { tenants, epochs }
    }

    /// Cached value for `query` in the `tenants` partition.
    ///
    /// `is_current` is called for each dependency outside the cache lock.
    /// Any `false` evicts the entry.
    pub fn get(
        &self,
        tenants: &[String],
        query: &str,
        is_current: impl Fn(&Dependency) -> bool,
    ) -> Option<T> {
        if !self.config.enabled {
            return None;
        }
        let key = key(tenants, query);
        let entry = {
            let mut state = self.lock();
            match state.entries.get(&key) {
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                Some(entry) if self.is_expired(entry) => {
                    state.entries.remove(&key);
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                Some(entry) => entry.clone(),
            }
        };

        if entry.dependencies.iter().all(&is_current) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry.value);
        }

        {
            let mut state = self.lock();
            if state.entries.get(&key).is_some_and(|e| e.seq == entry.seq) {
                state.entries.remove(&key);
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(partition = %key.0, "stale cache entry evicted");
        self.mark_dirty();
        None
    }

    /// Store `value` unless a partition tenant was invalidated since `ticket`.
    ///
    /// Returns whether the value was stored.
    pub fn put(
        &self,
        ticket: &CacheTicket,
        query: &str,
        value: T,
        dependencies: Vec<Dependency>,
    ) -> bool {
        if !self.config.enabled || self.config.max_entries == 0 {
            return false;
        }
        {
            let mut state = self.lock();
            let stale = ticket
                .tenants
                .iter()
                .zip(&ticket.epochs)
                .any(|(t, e)| state.epochs.get(t).copied().unwrap_or(0) != *e);
            if stale {
                tracing::debug!(
                    partition = %partition_label(&ticket.tenants),
                    "dropping answer computed before invalidation"
                );
                return false;
            }

            let seq = state.next_seq;
            state.next_seq += 1;
            let entry = CacheEntry {
                tenants: ticket.tenants.clone(),
                query: normalize_query(query),
                value,
                dependencies,
                created_at: Utc::now(),
                seq,
            };
            state.entries.insert(key(&ticket.tenants, query), entry);

            while state.entries.len() > self.config.max_entries {
                let oldest = state
                    .entries
                    .iter()
                    .min_by_key(|(_, e)| e.seq)
                    .map(|(k, _)| k.clone());
                match oldest {
                    Some(k) => {
                        state.entries.remove(&k);
                    }
                    None => break,
                }
            }
        }
        self.mark_dirty();
        true
    }

    /// Evict every entry whose partition includes `tenant`.
    ///
    /// Returns the number of entries removed.
    pub fn invalidate(&self, tenant: &str) -> usize {
        let removed = {
            let mut state = self.lock();
            *state.epochs.entry(tenant.to_string()).or_insert(0) += 1;
            let before = state.entries.len();
            state
                .entries
                .retain(|_, e| !e.tenants.iter().any(|t| t == tenant));
            before - state.entries.len()
        };
        tracing::info!(tenant, removed, "cache invalidated");
        self.dirty.store(true, Ordering::Release);
        self.flush();
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl<T: Serialize> ResponseCache<T> {
    fn lock(&self) -> MutexGuard<'_, CacheState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a change and write it back if the flush interval has passed.
    ///
    /// Never waits for a write already in progress; the change stays dirty
    /// and goes out with a later flush.
    fn mark_dirty(&self) {
        if self.config.path.is_none() {
            return;
        }
        self.dirty.store(true, Ordering::Release);
        let mut last = match self.last_flush.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(p)) => p.into_inner(),
            Err(TryLockError::WouldBlock) => return,
        };
        if last.elapsed() >= Duration::from_secs(self.config.flush_interval_secs) {
            self.write_locked(&mut last);
        }
    }

    /// Write pending changes to `config.path` now.
    pub fn flush(&self) {
        if self.config.path.is_none() {
            return;
        }
        let mut last = self
            .last_flush
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.write_locked(&mut last);
    }

    /// Whether changes are waiting to be written.
    pub fn has_pending_writes(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn write_locked(&self, last: &mut Instant) {
        let Some(path) = &self.config.path else {
            return;
        };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return;
        }
        let json = {
            let state = self.lock();
            let mut entries: Vec<&CacheEntry<T>> = state.entries.values().collect();
            entries.sort_by_key(|e| e.seq);
            serde_json::to_vec(&CacheFileOut {
                version: CACHE_FILE_VERSION,
                entries,
            })
        };
        let result = json
            .context("Failed to serialize cache")
            .and_then(|bytes| write_cache_file(path, &bytes));
        *last = Instant::now();
        if let Err(e) = result {
            self.dirty.store(true, Ordering::Release);
            tracing::warn!(path = %path.display(), error = %format!("{:#}", e), "failed to persist cache");
        }
    }
}

impl<T: Serialize> Drop for ResponseCache<T> {
    fn drop(&mut self) {
        self.flush();
    }
}

fn write_cache_file(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create cache dir: {}", dir.display()))?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("Invalid cache path: {}", path.display()))?;
    write_atomic(dir, name, bytes)
}

fn load_entries<T: DeserializeOwned>(path: &Path) -> Result<Option<Vec<CacheEntry<T>>>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let file: CacheFileIn<T> =
        serde_json::from_slice(&raw).with_context(|| format!("Corrupt cache file: {}", path.display()))?;
    if file.version != CACHE_FILE_VERSION {
        anyhow::bail!("unsupported cache file version {}", file.version);
    }
    Ok(Some(file.entries))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> ResponseCache<String> {
        ResponseCache::new(CacheConfig::default())
    }

    fn tenants(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn dep(path: &str, hash: &str) -> Dependency {
        Dependency {
            tenant: "RC".into(),
            signature: FileSignature {
                path: path.into(),
                size: 10,
                modified_ms: 1,
                hash: hash.into(),
            },
        }
    }

    #[test]
    fn hit_is_case_and_whitespace_insensitive() {
        let c = cache();
        let rc = tenants(&["RC"]);
        let t = c.ticket(&rc);
        assert!(c.put(&t, "What is  Policy 204-B?", "answer".into(), vec![dep("a.txt", "h")]));
        assert_eq!(
            c.get(&rc, "  what is policy 204-b? ", |_| true),
            Some("answer".to_string())
        );
        assert_eq!(c.get(&tenants(&["HIH"]), "what is policy 204-b?", |_| true), None);
        assert_eq!(c.stats().hits, 1);
    }

    #[test]
    fn failed_dependency_check_evicts() {
        let c = cache();
        let rc = tenants(&["RC"]);
        c.put(&c.ticket(&rc), "q1", "answer".into(), vec![dep("a.txt", "h")]);
        assert_eq!(c.get(&rc, "q1", |d| d.signature.hash == "other"), None);
        assert!(c.is_empty());
    }

    #[test]
    fn invalidate_clears_every_partition_with_the_tenant() {
        let c = cache();
        c.put(&c.ticket(&tenants(&["RC"])), "q", "rc".into(), vec![]);
        c.put(&c.ticket(&tenants(&["RC", "HIH"])), "q", "merged".into(), vec![]);
        c.put(&c.ticket(&tenants(&["HIH"])), "q", "hih".into(), vec![]);
        assert_eq!(c.invalidate("RC"), 2);
        assert_eq!(c.get(&tenants(&["HIH", "RC"]), "q", |_| true), None);
        assert_eq!(c.get(&tenants(&["HIH"]), "q", |_| true), Some("hih".to_string()));
    }

    #[test]
    fn put_with_ticket_from_before_invalidate_is_dropped() {
        let c = cache();
        let rc = tenants(&["RC"]);
        let ticket = c.ticket(&rc);
        c.invalidate("RC");
        assert!(!c.put(&ticket, "q", "stale".into(), vec![]));
        assert_eq!(c.get(&rc, "q", |_| true), None);
        assert!(c.put(&c.ticket(&rc), "q", "fresh".into(), vec![]));
    }

    #[test]
    fn oldest_entry_evicted_at_capacity() {
        let c: ResponseCache<String> = ResponseCache::new(CacheConfig {
            max_entries: 2,
            ..CacheConfig::default()
        });
        let rc = tenants(&["RC"]);
        for q in ["one", "two", "three"] {
            c.put(&c.ticket(&rc), q, q.to_string(), vec![]);
        }
        assert_eq!(c.len(), 2);
        assert_eq!(c.get(&rc, "one", |_| true), None);
        assert_eq!(c.get(&rc, "three", |_| true), Some("three".to_string()));
    }

    #[test]
    fn expired_entries_are_misses() {
        let c = cache();
        let rc = tenants(&["RC"]);
        c.put(&c.ticket(&rc), "q", "old".into(), vec![]);
        for e in c.lock().entries.values_mut() {
            e.created_at = e.created_at - chrono::Duration::hours(48);
        }
        assert_eq!(c.get(&rc, "q", |_| true), None);
    }

    #[test]
    fn disabled_cache_stores_nothing() {
        let c: ResponseCache<String> = ResponseCache::new(CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        });
        let rc = tenants(&["RC"]);
        assert!(!c.put(&c.ticket(&rc), "q", "a".into(), vec![]));
        assert_eq!(c.get(&rc, "q", |_| true), None);
    }

    #[test]
    fn persisted_entries_survive_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = CacheConfig {
            path: Some(dir.path().join("cache").join("responses.json")),
            ..CacheConfig::default()
        };
        let rc = tenants(&["RC"]);
        {
            let c: ResponseCache<String> = ResponseCache::open(config.clone());
            c.put(&c.ticket(&rc), "q", "kept".into(), vec![dep("a.txt", "h")]);
        }
        let reopened: ResponseCache<String> = ResponseCache::open(config);
        assert_eq!(reopened.get(&rc, "Q", |_| true), Some("kept".to_string()));
    }

    #[test]
    fn writes_are_deferred_until_interval_or_invalidate() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("responses.json");
        let c: ResponseCache<String> = ResponseCache::open(CacheConfig {
            path: Some(path.clone()),
            flush_interval_secs: 3600,
            ..CacheConfig::default()
        });
        let rc = tenants(&["RC"]);
        let hih = tenants(&["HIH"]);

        for q in ["q1", "q2", "q3"] {
            assert!(c.put(&c.ticket(&rc), q, "a".into(), vec![]));
        }
        assert!(!path.exists());
        assert!(c.has_pending_writes());

        c.put(&c.ticket(&hih), "q", "b".into(), vec![]);
        c.invalidate("RC");
        assert!(!c.has_pending_writes());
        let reopened: ResponseCache<String> = ResponseCache::open(CacheConfig {
            path: Some(path),
            ..CacheConfig::default()
        });
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.get(&hih, "q", |_| true), Some("b".to_string()));
    }

    #[test]
    fn zero_interval_writes_every_change() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("responses.json");
        let c: ResponseCache<String> = ResponseCache::open(CacheConfig {
            path: Some(path.clone()),
            flush_interval_secs: 0,
            ..CacheConfig::default()
        });
        c.put(&c.ticket(&tenants(&["RC"])), "q", "a".into(), vec![]);
        assert!(path.exists());
        assert!(!c.has_pending_writes());
    }

    #[test]
    fn partition_label_is_order_independent() {
        assert_eq!(partition_label(&tenants(&["RC", "HIH"])), "HIH+RC");
        assert_eq!(partition_label(&tenants(&["HIH", "RC", "RC"])), "HIH+RC");
    }
}
