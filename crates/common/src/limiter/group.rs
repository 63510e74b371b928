/*
 * SPDX-FileCopyrightText: 2024 Pelican Mail Project <dev@pelicanmail.org>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::{net::IpAddr, time::Duration};

use crate::{
    address,
    error::Result,
};

use super::{BucketSet, LimitSpec, MultiLimiter};

/// Configuration of a limiter group, as resolved from the `limits` blocks.
#[derive(Debug, Clone, Default)]
pub struct GroupConfig {
    pub global: Vec<LimitSpec>,
    pub per_ip: Vec<LimitSpec>,
    pub per_source: Vec<LimitSpec>,
    pub per_destination: Vec<LimitSpec>,
    pub max_buckets: usize,
    pub reap_idle: Duration,
    pub take_deadline: Duration,
}

impl GroupConfig {
    pub fn build(self) -> LimiterGroup {
        let max_buckets = if self.max_buckets == 0 {
            10_000
        } else {
            self.max_buckets
        };
        let reap_idle = if self.reap_idle.is_zero() {
            Duration::from_secs(60)
        } else {
            self.reap_idle
        };
        LimiterGroup {
            take_deadline: if self.take_deadline.is_zero() {
                Duration::from_secs(5)
            } else {
                self.take_deadline
            },
            global: MultiLimiter::new(&self.global),
            per_ip: BucketSet::new(self.per_ip, max_buckets, reap_idle),
            per_source: BucketSet::new(self.per_source, max_buckets, reap_idle),
            per_destination: BucketSet::new(self.per_destination, max_buckets, reap_idle),
        }
    }
}

/// Message-scoped rate and concurrency accounting: one global limiter plus
/// keyed sets per client IP, per source domain and per destination domain.
pub struct LimiterGroup {
    global: MultiLimiter,
    per_ip: BucketSet,
    per_source: BucketSet,
    per_destination: BucketSet,
    take_deadline: Duration,
}

impl LimiterGroup {
    /// Acquires, in this fixed order: global, per-IP, per-source. On failure
    /// everything already taken is handed back before the error is returned.
    /// A matching [`LimiterGroup::release_msg`] must run exactly once.
    pub async fn take_msg(&self, ip: IpAddr, source_domain: &str) -> Result<()> {
        self.global.take(self.take_deadline).await?;
        let ip_key = ip.to_string();
        if let Err(err) = self.per_ip.take(&ip_key, self.take_deadline).await {
            self.global.release();
            return Err(err);
        }
        let source_key = address::fold_case(source_domain);
        if let Err(err) = self.per_source.take(&source_key, self.take_deadline).await {
            self.per_ip.release(&ip_key);
            self.global.release();
            return Err(err);
        }
        Ok(())
    }

    pub fn release_msg(&self, ip: IpAddr, source_domain: &str) {
        self.per_source.release(&address::fold_case(source_domain));
        self.per_ip.release(&ip.to_string());
        self.global.release();
    }

    /// Per-recipient-acceptance and per-queue-delivery-attempt accounting.
    pub async fn take_dest(&self, domain: &str) -> Result<()> {
        self.per_destination
            .take(&address::fold_case(domain), self.take_deadline)
            .await
    }

    pub fn release_dest(&self, domain: &str) {
        self.per_destination.release(&address::fold_case(domain));
    }

    pub fn close(&self) {
        self.global.close();
        self.per_ip.close();
        self.per_source.close();
        self.per_destination.close();
    }
}
