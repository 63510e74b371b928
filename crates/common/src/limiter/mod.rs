/*
 * SPDX-FileCopyrightText: 2024 Pelican Mail Project <dev@pelicanmail.org>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{sync::Notify, time::Instant};

use crate::error::{Error, Result};

pub mod bucket_set;
pub mod group;

pub use bucket_set::BucketSet;
pub use group::LimiterGroup;

/// Declarative limiter primitive, as it appears in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitSpec {
    /// Token bucket: `burst` tokens replenished every `interval`.
    Rate { burst: u32, interval: Duration },
    /// Semaphore: at most `max` concurrent holders.
    Concurrency { max: usize },
}

impl LimitSpec {
    pub fn build(&self) -> Limiter {
        match *self {
            LimitSpec::Rate { burst, interval } => Limiter::Rate(RateLimiter::new(burst, interval)),
            LimitSpec::Concurrency { max } => Limiter::Concurrency(ConcurrencyLimiter::new(max)),
        }
    }
}

pub enum Limiter {
    Rate(RateLimiter),
    Concurrency(ConcurrencyLimiter),
}

impl Limiter {
    pub async fn take(&self, deadline: Duration) -> Result<()> {
        match self {
            Limiter::Rate(rate) => rate.take(deadline).await,
            Limiter::Concurrency(conc) => conc.take(deadline).await,
        }
    }

    pub fn release(&self) {
        if let Limiter::Concurrency(conc) = self {
            conc.release();
        }
    }

    pub fn close(&self) {
        match self {
            Limiter::Rate(rate) => rate.close(),
            Limiter::Concurrency(conc) => conc.close(),
        }
    }
}

/// Token bucket replenished to `burst` at every `interval` boundary.
/// A zero burst is the unconfigured case and is a no-op.
pub struct RateLimiter {
    burst: u32,
    interval: Duration,
    state: Mutex<RateState>,
    closed: AtomicBool,
    wake: Notify,
}

struct RateState {
    tokens: u32,
    window_end: Instant,
}

impl RateLimiter {
    pub fn new(burst: u32, interval: Duration) -> Self {
        RateLimiter {
            burst,
            interval,
            state: Mutex::new(RateState {
                tokens: burst,
                window_end: Instant::now() + interval,
            }),
            closed: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    /// Blocks until a token is available or the deadline expires. A take
    /// that fails or is cancelled does not consume a token.
    pub async fn take(&self, deadline: Duration) -> Result<()> {
        if self.burst == 0 {
            return Ok(());
        }
        let give_up = Instant::now() + deadline;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::Cancelled);
            }
            let wake_at = {
                let mut state = self.state.lock();
                let now = Instant::now();
                if now >= state.window_end {
                    state.tokens = self.burst;
                    state.window_end = now + self.interval;
                }
                if state.tokens > 0 {
                    state.tokens -= 1;
                    return Ok(());
                }
                state.window_end
            };
            if wake_at > give_up {
                return Err(Error::Cancelled);
            }
            tokio::select! {
                _ = tokio::time::sleep_until(wake_at) => {}
                _ = self.wake.notified() => {}
            }
        }
    }

    pub fn try_take(&self) -> bool {
        if self.burst == 0 {
            return true;
        }
        let mut state = self.state.lock();
        let now = Instant::now();
        if now >= state.window_end {
            state.tokens = self.burst;
            state.window_end = now + self.interval;
        }
        if state.tokens > 0 {
            state.tokens -= 1;
            true
        } else {
            false
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.wake.notify_waiters();
    }
}

/// Semaphore capping concurrent holders. A zero maximum is the unconfigured
/// case and is a no-op.
pub struct ConcurrencyLimiter {
    max: usize,
    semaphore: tokio::sync::Semaphore,
    closed: AtomicBool,
}

impl ConcurrencyLimiter {
    pub fn new(max: usize) -> Self {
        ConcurrencyLimiter {
            max,
            semaphore: tokio::sync::Semaphore::new(max),
            closed: AtomicBool::new(false),
        }
    }

    pub async fn take(&self, deadline: Duration) -> Result<()> {
        if self.max == 0 {
            return Ok(());
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Cancelled);
        }
        match tokio::time::timeout(deadline, self.semaphore.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                Ok(())
            }
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => Err(Error::Cancelled),
        }
    }

    pub fn try_take(&self) -> bool {
        if self.max == 0 {
            return true;
        }
        match self.semaphore.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    pub fn release(&self) {
        if self.max != 0 {
            self.semaphore.add_permits(1);
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.semaphore.close();
    }
}

/// An ordered set of limiters acquired as a unit.
///
/// Take locks the wrapped limiters in declared order and unlocks in reverse
/// on partial failure; acquisition order is the same everywhere, so no
/// further deadlock avoidance is needed.
pub struct MultiLimiter {
    inner: Vec<std::sync::Arc<Limiter>>,
}

impl MultiLimiter {
    pub fn new(specs: &[LimitSpec]) -> Self {
        MultiLimiter {
            inner: specs
                .iter()
                .map(|spec| std::sync::Arc::new(spec.build()))
                .collect(),
        }
    }

    pub fn from_limiters(inner: Vec<std::sync::Arc<Limiter>>) -> Self {
        MultiLimiter { inner }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub async fn take(&self, deadline: Duration) -> Result<()> {
        let give_up = Instant::now() + deadline;
        for (taken, limiter) in self.inner.iter().enumerate() {
            let remaining = give_up.saturating_duration_since(Instant::now());
            if let Err(err) = limiter.take(remaining).await {
                for held in self.inner[..taken].iter().rev() {
                    held.release();
                }
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn release(&self) {
        for limiter in self.inner.iter().rev() {
            limiter.release();
        }
    }

    pub fn close(&self) {
        for limiter in &self.inner {
            limiter.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_paces_sequential_takes() {
        let limiter = RateLimiter::new(1, Duration::from_millis(10));
        let started = Instant::now();
        for _ in 0..20 {
            limiter.take(Duration::from_secs(5)).await.unwrap();
        }
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(190), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(300), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn zero_burst_is_noop() {
        let limiter = RateLimiter::new(0, Duration::from_secs(10));
        let started = Instant::now();
        for _ in 0..100 {
            limiter.take(Duration::from_secs(5)).await.unwrap();
        }
        assert_eq!(started.elapsed(), Duration::ZERO);

        let limiter = ConcurrencyLimiter::new(0);
        for _ in 0..100 {
            limiter.take(Duration::from_secs(5)).await.unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rate_take_past_deadline_fails_without_consuming() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        limiter.take(Duration::from_secs(5)).await.unwrap();
        assert!(matches!(
            limiter.take(Duration::from_secs(5)).await,
            Err(Error::Cancelled)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn multi_limiter_releases_on_partial_failure() {
        let outer = std::sync::Arc::new(Limiter::Concurrency(ConcurrencyLimiter::new(2)));
        let inner = std::sync::Arc::new(Limiter::Concurrency(ConcurrencyLimiter::new(1)));
        let multi = MultiLimiter::from_limiters(vec![outer.clone(), inner.clone()]);

        multi.take(Duration::from_secs(5)).await.unwrap();

        // Second acquisition times out on the inner semaphore; the outer
        // token taken on the way in must be handed back.
        assert!(matches!(
            multi.take(Duration::from_millis(50)).await,
            Err(Error::Cancelled)
        ));

        // Exactly one outer slot is held (by the first take): one more is
        // available, a second is not.
        outer.take(Duration::from_millis(10)).await.unwrap();
        assert!(matches!(
            outer.take(Duration::from_millis(10)).await,
            Err(Error::Cancelled)
        ));
        outer.release();
        multi.release();
        multi.take(Duration::from_millis(50)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn close_wakes_blocked_takers() {
        let limiter = std::sync::Arc::new(RateLimiter::new(1, Duration::from_secs(600)));
        limiter.take(Duration::from_secs(5)).await.unwrap();
        let waiter = limiter.clone();
        let task = tokio::spawn(async move { waiter.take(Duration::from_secs(700)).await });
        tokio::task::yield_now().await;
        limiter.close();
        assert!(matches!(task.await.unwrap(), Err(Error::Cancelled)));
    }
}
