//! # KV Database
//!
//! A process-scoped collection of named buckets. Buckets are created
//! on first access and live until `purge`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use super::bucket::{Bucket, BucketStats};
use super::errors::{KvError, KvResult};

/// In-memory bucketed key/value database
pub struct Database {
    name: String,
    buckets: RwLock<HashMap<String, Arc<Bucket>>>,
}

impl Database {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            buckets: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the bucket called `name`, creating it on first use
    pub fn bucket(&self, name: &str) -> KvResult<Arc<Bucket>> {
        {
            let buckets = self.buckets.read().map_err(|_| KvError::Poisoned("buckets"))?;
            if let Some(bucket) = buckets.get(name) {
                return Ok(bucket.clone());
            }
        }

        let mut buckets = self.buckets.write().map_err(|_| KvError::Poisoned("buckets"))?;
        let bucket = buckets
            .entry(name.to_string())
            .or_insert_with(|| Bucket::new(name));
        Ok(bucket.clone())
    }

    /// Stats for every bucket, keyed by bucket name
    pub fn stats(&self) -> KvResult<BTreeMap<String, BucketStats>> {
        let buckets: Vec<Arc<Bucket>> = {
            let buckets = self.buckets.read().map_err(|_| KvError::Poisoned("buckets"))?;
            buckets.values().cloned().collect()
        };

        buckets
            .iter()
            .map(|bucket| Ok((bucket.name().to_string(), bucket.stats()?)))
            .collect()
    }

    /// Flush and drop every bucket
    pub fn purge(&self) -> KvResult<()> {
        let mut buckets = self.buckets.write().map_err(|_| KvError::Poisoned("buckets"))?;
        for bucket in buckets.values() {
            bucket.flush()?;
        }
        buckets.clear();
        Ok(())
    }
}
