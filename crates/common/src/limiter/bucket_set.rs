/*
 * SPDX-FileCopyrightText: 2024 Pelican Mail Project <dev@pelicanmail.org>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::{Error, Result};

use super::{LimitSpec, MultiLimiter};

/// A keyed map of [`MultiLimiter`]s with LRU-style reaping.
///
/// Buckets are created on first use. When the map grows past `max_buckets`,
/// entries idle for longer than `reap_idle` and not currently held are
/// evicted; when nothing can be evicted, take fails with `RateLimited`.
pub struct BucketSet {
    specs: Vec<LimitSpec>,
    buckets: DashMap<String, Arc<Bucket>, ahash::RandomState>,
    max_buckets: usize,
    reap_idle: Duration,
}

struct Bucket {
    limiter: MultiLimiter,
    last_use: Mutex<Instant>,
    in_use: AtomicUsize,
}

impl BucketSet {
    pub fn new(specs: Vec<LimitSpec>, max_buckets: usize, reap_idle: Duration) -> Self {
        BucketSet {
            specs,
            buckets: DashMap::with_hasher(ahash::RandomState::default()),
            max_buckets,
            reap_idle,
        }
    }

    /// The unconfigured case: no primitives, nothing to account.
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub async fn take(&self, key: &str, deadline: Duration) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        let bucket = self.bucket_for(key)?;
        bucket.in_use.fetch_add(1, Ordering::AcqRel);
        match bucket.limiter.take(deadline).await {
            Ok(()) => {
                *bucket.last_use.lock() = Instant::now();
                Ok(())
            }
            Err(err) => {
                bucket.in_use.fetch_sub(1, Ordering::AcqRel);
                Err(err)
            }
        }
    }

    /// Must be called exactly once per successful take of the same key.
    pub fn release(&self, key: &str) {
        if self.is_empty() {
            return;
        }
        if let Some(bucket) = self.buckets.get(key) {
            bucket.limiter.release();
            bucket.in_use.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub fn close(&self) {
        for entry in self.buckets.iter() {
            entry.value().limiter.close();
        }
    }

    fn bucket_for(&self, key: &str) -> Result<Arc<Bucket>> {
        if let Some(bucket) = self.buckets.get(key) {
            return Ok(bucket.clone());
        }
        if self.buckets.len() >= self.max_buckets {
            self.reap();
            if self.buckets.len() >= self.max_buckets {
                return Err(Error::RateLimited);
            }
        }
        Ok(self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Bucket {
                    limiter: MultiLimiter::new(&self.specs),
                    last_use: Mutex::new(Instant::now()),
                    in_use: AtomicUsize::new(0),
                })
            })
            .clone())
    }

    fn reap(&self) {
        let now = Instant::now();
        self.buckets.retain(|_, bucket| {
            bucket.in_use.load(Ordering::Acquire) > 0
                || now.saturating_duration_since(*bucket.last_use.lock()) < self.reap_idle
        });
    }
}
