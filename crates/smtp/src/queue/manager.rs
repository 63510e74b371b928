/*
 * SPDX-FileCopyrightText: 2024 Pelican Mail Project <dev@pelicanmail.org>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::{
    collections::BinaryHeap,
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use common::{
    address,
    buffer::Buffer,
    error::{Error, Result},
    limiter::LimiterGroup,
};
use futures::FutureExt;
use tokio::{
    sync::{mpsc, Semaphore},
    time::Instant,
};

use crate::{
    config::QueueConfig,
    core::MsgMetadata,
    delivery::{Delivery, StatusCollector, Target},
};

use super::{dsn, spool::Spool, QueueMetadata};

/// A scheduled entry; the heap is ordered by the earliest due time.
pub struct Schedule<T> {
    pub due: Instant,
    pub inner: T,
}

impl<T> Ord for Schedule<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.due.cmp(&self.due)
    }
}

impl<T> PartialOrd for Schedule<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for Schedule<T> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due
    }
}

impl<T> Eq for Schedule<T> {}

enum WheelEvent<T> {
    Add { due: Instant, value: T },
    Stop,
}

/// Sorted set of (time, value) entries with a single tick task that wakes at
/// the earliest entry and hands it to the dispatch callback. Adding an
/// earlier entry wakes the tick; `close` wakes it for shutdown, after which
/// `add` is a no-op.
pub struct TimeWheel<T> {
    tx: mpsc::UnboundedSender<WheelEvent<T>>,
}

impl<T: Send + 'static> TimeWheel<T> {
    pub fn start<F>(dispatch: F) -> Self
    where
        F: Fn(T) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut entries: BinaryHeap<Schedule<T>> = BinaryHeap::new();
            loop {
                let next_due = entries.peek().map(|entry| entry.due);
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(WheelEvent::Add { due, value }) => {
                            entries.push(Schedule { due, inner: value });
                        }
                        Some(WheelEvent::Stop) | None => break,
                    },
                    _ = sleep_until_due(next_due), if next_due.is_some() => {
                        if let Some(entry) = entries.pop() {
                            dispatch(entry.inner);
                        }
                    }
                }
            }
        });
        TimeWheel { tx }
    }

    pub fn add(&self, due: Instant, value: T) {
        let _ = self.tx.send(WheelEvent::Add { due, value });
    }

    pub fn close(&self) {
        let _ = self.tx.send(WheelEvent::Stop);
    }
}

async fn sleep_until_due(due: Option<Instant>) {
    match due {
        Some(due) => tokio::time::sleep_until(due).await,
        None => std::future::pending().await,
    }
}

/// The outbound queue: a delivery target that spools messages, retries the
/// downstream target with exponential backoff, and bounces what cannot be
/// delivered.
pub struct Queue {
    pub config: QueueConfig,
    spool: Spool,
    wheel: TimeWheel<String>,
    downstream: Arc<dyn Target>,
    bounce: Option<Arc<dyn Target>>,
    limits: Option<Arc<LimiterGroup>>,
    hostname: String,
    autogen_domain: String,
    dispatch_limit: Arc<Semaphore>,
}

impl Queue {
    pub fn start(
        config: QueueConfig,
        hostname: impl Into<String>,
        autogen_domain: impl Into<String>,
        downstream: Arc<dyn Target>,
        bounce: Option<Arc<dyn Target>>,
        limits: Option<Arc<LimiterGroup>>,
    ) -> Result<Arc<Self>> {
        let spool = Spool::open(&config.directory)?;
        let parallelism = config.parallelism.max(1);
        let queue = Arc::new_cyclic(|weak: &Weak<Queue>| {
            let weak = weak.clone();
            let wheel = TimeWheel::start(move |id: String| {
                if let Some(queue) = weak.upgrade() {
                    tokio::spawn(queue.dispatch(id));
                }
            });
            Queue {
                config,
                spool,
                wheel,
                downstream,
                bounce,
                limits,
                hostname: hostname.into(),
                autogen_domain: autogen_domain.into(),
                dispatch_limit: Arc::new(Semaphore::new(parallelism)),
            }
        });

        // Re-schedule everything found on disk; entries already due are
        // pushed back by the post-init delay to avoid a thundering herd.
        let now = Utc::now();
        let post_init = queue.config.post_init_delay;
        for meta in queue.spool.scan()? {
            let due_in = (meta.last_attempt + chrono::Duration::from_std(meta.next_delay(&queue.config)).unwrap_or_default() - now)
                .to_std()
                .unwrap_or_default();
            let due_in = if due_in <= post_init { post_init } else { due_in };
            tracing::info!(
                context = "queue",
                event = "rescheduled",
                id = meta.msg_meta.id.as_str(),
                next_attempt_in = ?due_in,
                "recovered from spool"
            );
            queue.wheel.add(Instant::now() + due_in, meta.msg_meta.id.clone());
        }
        Ok(queue)
    }

    pub fn close(&self) {
        self.wheel.close();
        self.dispatch_limit.close();
    }

    async fn dispatch(self: Arc<Self>, id: String) {
        let permit = match self.dispatch_limit.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        // A panicking dispatch must not take the process down; the message
        // is sidelined instead and survives for manual recovery.
        if let Err(panic) = std::panic::AssertUnwindSafe(self.attempt(&id))
            .catch_unwind()
            .await
        {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(
                context = "queue",
                event = "dispatch-panic",
                id = id.as_str(),
                reason = reason.as_str(),
                "dispatch panicked, sidelining message"
            );
            self.spool.mark_broken(&id);
        }
        drop(permit);
    }

    async fn attempt(&self, id: &str) {
        let (mut meta, header, body) = match self.spool.load(id) {
            Ok(loaded) => loaded,
            Err(err) => {
                tracing::error!(
                    context = "queue",
                    event = "load-failed",
                    id = id,
                    reason = %err,
                    "cannot load scheduled message"
                );
                return;
            }
        };

        let collector = StatusCollector::new();
        let pending = meta.to.clone();
        self.deliver_once(&meta, &pending, &header, body, &collector)
            .await;

        let utf8 = meta.msg_meta.opts.utf8;
        meta.last_attempt = Utc::now();
        let mut still_pending = Vec::new();
        for rcpt in pending {
            match collector.take(&rcpt) {
                None => {
                    tracing::info!(
                        context = "queue",
                        event = "delivered",
                        id = id,
                        rcpt = rcpt.as_str(),
                    );
                    meta.rcpt_errs.remove(&rcpt);
                }
                Some(err) => {
                    let tries = meta.tries_count.entry(rcpt.clone()).or_insert(0);
                    *tries += 1;
                    let exhausted = *tries >= self.config.max_tries;
                    meta.rcpt_errs.insert(rcpt.clone(), err.to_status(utf8));
                    if err.is_permanent() || exhausted {
                        tracing::warn!(
                            context = "queue",
                            event = "failed",
                            id = id,
                            rcpt = rcpt.as_str(),
                            reason = %err,
                            tries = *tries,
                        );
                        meta.failed_rcpts.push(rcpt);
                    } else {
                        tracing::info!(
                            context = "queue",
                            event = "deferred",
                            id = id,
                            rcpt = rcpt.as_str(),
                            reason = %err,
                            tries = *tries,
                        );
                        still_pending.push(rcpt);
                    }
                }
            }
        }
        meta.to = still_pending;
        meta.temporary_failed_rcpts = meta.to.clone();

        if !meta.to.is_empty() {
            let delay = meta.next_delay(&self.config);
            if let Err(err) = self.spool.update_meta(&meta) {
                tracing::error!(
                    context = "queue",
                    event = "update-failed",
                    id = id,
                    reason = %err,
                );
            }
            self.wheel.add(Instant::now() + delay, id.to_string());
            return;
        }

        if !meta.failed_rcpts.is_empty() {
            self.bounce(&meta, &header).await;
        }
        self.spool.remove(id);
    }

    async fn deliver_once(
        &self,
        meta: &QueueMetadata,
        pending: &[String],
        header: &[u8],
        body: Arc<dyn Buffer>,
        collector: &StatusCollector,
    ) {
        let mut delivery = match self.downstream.start(&meta.msg_meta, &meta.from).await {
            Ok(delivery) => delivery,
            Err(err) => {
                for rcpt in pending {
                    collector.set_status(rcpt, err.clone());
                }
                return;
            }
        };

        let mut accepted = Vec::new();
        let mut dest_tokens = Vec::new();
        for rcpt in pending {
            if let Some(limits) = &self.limits {
                let domain = address::domain_part(rcpt);
                if let Err(err) = limits.take_dest(domain).await {
                    collector.set_status(rcpt, err);
                    continue;
                }
                dest_tokens.push(domain.to_string());
            }
            match delivery.add_rcpt(rcpt).await {
                Ok(()) => accepted.push(rcpt.clone()),
                Err(err) => collector.set_status(rcpt, err),
            }
        }

        if accepted.is_empty() {
            let _ = delivery.abort().await;
        } else if delivery.supports_partial() {
            delivery
                .body_non_atomic(collector, &accepted, header, body)
                .await;
            if accepted.iter().all(|rcpt| collector.peek_failed(rcpt)) {
                let _ = delivery.abort().await;
            } else if let Err(err) = delivery.commit().await {
                for rcpt in &accepted {
                    if !collector.peek_failed(rcpt) {
                        collector.set_status(rcpt, err.clone());
                    }
                }
            }
        } else {
            match delivery.body(header, body).await {
                Ok(()) => {
                    if let Err(err) = delivery.commit().await {
                        for rcpt in &accepted {
                            collector.set_status(rcpt, err.clone());
                        }
                    }
                }
                Err(err) => {
                    let _ = delivery.abort().await;
                    for rcpt in &accepted {
                        collector.set_status(rcpt, err.clone());
                    }
                }
            }
        }

        if let Some(limits) = &self.limits {
            for domain in dest_tokens {
                limits.release_dest(&domain);
            }
        }
    }

    /// Queues a delivery-status notification for the permanently failed
    /// recipients. Null senders never receive DSNs, and queue-generated
    /// bounces never bounce again; a DSN that cannot be submitted is logged
    /// and dropped.
    async fn bounce(&self, meta: &QueueMetadata, original_header: &[u8]) {
        if meta.from.is_empty() || meta.msg_meta.dsn {
            return;
        }
        let Some(bounce) = &self.bounce else {
            tracing::warn!(
                context = "queue",
                event = "dsn-unrouted",
                id = meta.msg_meta.id.as_str(),
                "no bounce pipeline configured, dropping DSN"
            );
            return;
        };
        match dsn::send_dsn(
            &self.hostname,
            &self.autogen_domain,
            meta,
            original_header,
            bounce,
        )
        .await
        {
            Ok(dsn_id) => {
                tracing::info!(
                    context = "queue",
                    event = "dsn-sent",
                    id = meta.msg_meta.id.as_str(),
                    dsn_id = dsn_id.as_str(),
                    rcpt = meta.from.as_str(),
                );
            }
            Err(err) => {
                tracing::error!(
                    context = "queue",
                    event = "dsn-failed",
                    id = meta.msg_meta.id.as_str(),
                    reason = %err,
                    "dropping DSN"
                );
            }
        }
    }
}

/// The queue's face as a pipeline delivery target. Recipients and the body
/// are collected in memory; everything becomes durable at commit, after
/// which the session owns no part of the message.
pub struct QueueTarget(pub Arc<Queue>);

#[async_trait]
impl Target for QueueTarget {
    async fn start(&self, meta: &MsgMetadata, mail_from: &str) -> Result<Box<dyn Delivery>> {
        Ok(Box::new(QueueDelivery {
            queue: self.0.clone(),
            meta: meta.clone(),
            mail_from: mail_from.to_string(),
            rcpts: Vec::new(),
            message: None,
        }))
    }
}

struct QueueDelivery {
    queue: Arc<Queue>,
    meta: MsgMetadata,
    mail_from: String,
    rcpts: Vec<String>,
    message: Option<(Vec<u8>, Arc<dyn Buffer>)>,
}

#[async_trait]
impl Delivery for QueueDelivery {
    async fn add_rcpt(&mut self, rcpt: &str) -> Result<()> {
        self.rcpts.push(rcpt.to_string());
        Ok(())
    }

    async fn body(&mut self, header: &[u8], body: Arc<dyn Buffer>) -> Result<()> {
        self.message = Some((header.to_vec(), body));
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let (header, body) = self
            .message
            .take()
            .ok_or_else(|| Error::QueuePersistence("commit without body".to_string()))?;
        let meta = QueueMetadata::new(
            self.meta.clone(),
            self.mail_from.clone(),
            std::mem::take(&mut self.rcpts),
        );
        let id = meta.msg_meta.id.clone();
        self.queue.spool.store(&meta, &header, body.as_ref())?;
        tracing::info!(
            context = "queue",
            event = "queued",
            id = id.as_str(),
            from = meta.from.as_str(),
            nrcpt = meta.to.len(),
        );
        self.queue.wheel.add(Instant::now(), id);
        Ok(())
    }

    async fn abort(&mut self) -> Result<()> {
        self.message = None;
        self.rcpts.clear();
        Ok(())
    }
}
