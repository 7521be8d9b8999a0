//! # KV Bucket
//!
//! A named key → sequence-of-blobs map with per-key expiration.
//!
//! Each bucket owns a reaper task that sleeps until the earliest
//! scheduled expiry, then drops every due row. The data map and the
//! expiration queue are guarded by separate read-write locks. Writers
//! that touch both take the data lock first and update the queue before
//! releasing it, so a row and its scheduled deadline always agree.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use chrono::{SecondsFormat, TimeZone, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::errors::{KvError, KvResult};
use super::expiration::ExpirationQueue;

/// Expiration assigned by `set`: effectively never
pub const DEFAULT_EXPIRATION: Duration = Duration::from_secs(86_400 * 365);

/// Reaper sleep while the queue is empty
const IDLE_SLEEP: Duration = Duration::from_secs(1);

/// Stored value: many serialised documents under one logical row
pub type Blobs = Arc<[Vec<u8>]>;

#[derive(Debug, Clone)]
struct Entry {
    value: Blobs,
    expires_at: i64,
}

/// Bucket statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketStats {
    pub entries: usize,
    /// Mean expiry, unix seconds
    pub avg_expiration_time: f64,
    /// RFC 3339, empty when the queue is empty
    pub earliest_expiration_time: String,
    /// RFC 3339, empty when the queue is empty
    pub latest_expiration_time: String,
    pub expiration_queue_size: i64,
    pub total_size: i64,
    pub avg_obj_size: f64,
    pub misses: i64,
    pub hits: i64,
}

/// A named partition of the KV store
pub struct Bucket {
    name: String,
    data: RwLock<HashMap<String, Entry>>,
    expiration: RwLock<ExpirationQueue>,
    hits: AtomicI64,
    misses: AtomicI64,
    wake: Arc<Notify>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn deadline_after(ttl: Duration) -> i64 {
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    now_millis().saturating_add(ttl_ms)
}

fn format_millis(millis: i64) -> String {
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

impl Bucket {
    /// Create a bucket and start its reaper on the current tokio runtime.
    ///
    /// Outside a runtime no reaper runs; expired rows are still never
    /// returned by `get`.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let bucket = Arc::new(Self {
            name: name.into(),
            data: RwLock::new(HashMap::new()),
            expiration: RwLock::new(ExpirationQueue::new()),
            hits: AtomicI64::new(0),
            misses: AtomicI64::new(0),
            wake: Arc::new(Notify::new()),
            reaper: Mutex::new(None),
        });

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let task = handle.spawn(reap(Arc::downgrade(&bucket), bucket.wake.clone()));
                if let Ok(mut slot) = bucket.reaper.lock() {
                    *slot = Some(task);
                }
            }
            Err(_) => {
                tracing::warn!(bucket = %bucket.name, "no tokio runtime; bucket reaper disabled");
            }
        }

        bucket
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fetch the blobs stored under `key`
    pub fn get(&self, key: &str) -> KvResult<Option<Blobs>> {
        let now = now_millis();
        let found = {
            let data = self.data.read().map_err(|_| KvError::Poisoned("bucket data"))?;
            data.get(key)
                .filter(|entry| entry.expires_at > now)
                .map(|entry| entry.value.clone())
        };

        match found {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(value))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Store `value` under `key` with the default (far future) expiration
    pub fn set(&self, key: &str, value: Vec<Vec<u8>>) -> KvResult<()> {
        self.store(key, value, deadline_after(DEFAULT_EXPIRATION))
    }

    /// Store `value` under `key`, expiring after `ttl`
    pub fn set_ex(&self, key: &str, value: Vec<Vec<u8>>, ttl: Duration) -> KvResult<()> {
        self.store(key, value, deadline_after(ttl))?;
        self.wake.notify_one();
        Ok(())
    }

    fn store(&self, key: &str, value: Vec<Vec<u8>>, expires_at: i64) -> KvResult<()> {
        let mut data = self.data.write().map_err(|_| KvError::Poisoned("bucket data"))?;
        let mut queue = self
            .expiration
            .write()
            .map_err(|_| KvError::Poisoned("bucket expiration"))?;
        data.insert(
            key.to_string(),
            Entry {
                value: value.into(),
                expires_at,
            },
        );
        queue.add(key, expires_at);
        Ok(())
    }

    /// Reschedule the expiry of an existing key
    pub fn expire(&self, key: &str, ttl: Duration) -> KvResult<()> {
        let expires_at = deadline_after(ttl);
        {
            let mut data = self.data.write().map_err(|_| KvError::Poisoned("bucket data"))?;
            let entry = data
                .get_mut(key)
                .ok_or_else(|| KvError::KeyNotFound(key.to_string()))?;
            let mut queue = self
                .expiration
                .write()
                .map_err(|_| KvError::Poisoned("bucket expiration"))?;
            entry.expires_at = expires_at;
            queue.add(key, expires_at);
        }
        self.wake.notify_one();
        Ok(())
    }

    pub fn delete(&self, key: &str) -> KvResult<()> {
        let mut data = self.data.write().map_err(|_| KvError::Poisoned("bucket data"))?;
        let mut queue = self
            .expiration
            .write()
            .map_err(|_| KvError::Poisoned("bucket expiration"))?;
        data.remove(key);
        queue.remove(key);
        Ok(())
    }

    /// Drop every row
    pub fn flush(&self) -> KvResult<()> {
        let mut data = self.data.write().map_err(|_| KvError::Poisoned("bucket data"))?;
        let mut queue = self
            .expiration
            .write()
            .map_err(|_| KvError::Poisoned("bucket expiration"))?;
        data.clear();
        queue.clear();
        Ok(())
    }

    pub fn stats(&self) -> KvResult<BucketStats> {
        let snapshot = {
            let queue = self
                .expiration
                .read()
                .map_err(|_| KvError::Poisoned("bucket expiration"))?;
            queue.clone()
        };

        let data = self.data.read().map_err(|_| KvError::Poisoned("bucket data"))?;
        let pair_size = std::mem::size_of::<Entry>() as i64;

        let mut earliest: Option<i64> = None;
        let mut latest: Option<i64> = None;
        let mut expiration_sum = 0f64;
        let mut total_size = 0i64;
        let mut obj_size_sum = 0f64;
        let mut obj_count = 0usize;

        for scheduled in snapshot.iter() {
            earliest = Some(earliest.map_or(scheduled.expires_at, |e| e.min(scheduled.expires_at)));
            latest = Some(latest.map_or(scheduled.expires_at, |l| l.max(scheduled.expires_at)));
            expiration_sum += scheduled.expires_at as f64 / 1000.0;

            if let Some(entry) = data.get(&scheduled.key) {
                let bytes: usize = entry.value.iter().map(Vec::len).sum();
                // Key and pair are held twice: once in data, once in the queue
                total_size += bytes as i64 + (scheduled.key.len() * 2) as i64 + pair_size * 2;
                obj_size_sum += bytes as f64;
                obj_count += 1;
            }
        }

        Ok(BucketStats {
            entries: data.len(),
            avg_expiration_time: if snapshot.is_empty() {
                0.0
            } else {
                expiration_sum / snapshot.len() as f64
            },
            earliest_expiration_time: earliest.map(format_millis).unwrap_or_default(),
            latest_expiration_time: latest.map(format_millis).unwrap_or_default(),
            expiration_queue_size: snapshot.len() as i64,
            total_size,
            avg_obj_size: if obj_count == 0 {
                0.0
            } else {
                obj_size_sum / obj_count as f64
            },
            misses: self.misses.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
        })
    }

    /// Remove every due row. Returns the delay until the next scheduled expiry.
    fn reap_expired(&self) -> KvResult<Option<Duration>> {
        let now = now_millis();
        let due = {
            let mut queue = self
                .expiration
                .write()
                .map_err(|_| KvError::Poisoned("bucket expiration"))?;
            queue.pop_expired(now)
        };

        if !due.is_empty() {
            let mut data = self.data.write().map_err(|_| KvError::Poisoned("bucket data"))?;
            for expired in &due {
                // A concurrent set may have pushed the deadline out
                let still_due = data
                    .get(&expired.key)
                    .is_some_and(|entry| entry.expires_at <= now);
                if still_due {
                    data.remove(&expired.key);
                }
            }
        }

        let queue = self
            .expiration
            .read()
            .map_err(|_| KvError::Poisoned("bucket expiration"))?;
        Ok(queue
            .peek()
            .map(|next| Duration::from_millis((next.expires_at - now).max(0) as u64)))
    }
}

impl Drop for Bucket {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.reaper.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}

async fn reap(bucket: Weak<Bucket>, wake: Arc<Notify>) {
    loop {
        let delay = match bucket.upgrade() {
            Some(bucket) => match bucket.reap_expired() {
                Ok(next) => next.unwrap_or(IDLE_SLEEP),
                Err(err) => {
                    tracing::error!(bucket = %bucket.name, error = %err, "reaper stopped");
                    return;
                }
            },
            None => return,
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wake.notified() => {}
        }
    }
}
