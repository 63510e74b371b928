/*
 * SPDX-FileCopyrightText: 2024 Pelican Mail Project <dev@pelicanmail.org>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::Arc;

use ahash::AHashMap;
use async_trait::async_trait;
use common::{
    buffer::Buffer,
    error::{Error, Result},
};
use parking_lot::Mutex;

use crate::core::MsgMetadata;

/// A delivery destination: local storage, the outbound queue, a remote
/// forwarder, the bounce pipeline. Implementations are safe to call from any
/// task; a single [`Delivery`] is not reentrant.
#[async_trait]
pub trait Target: Send + Sync {
    async fn start(&self, meta: &MsgMetadata, mail_from: &str) -> Result<Box<dyn Delivery>>;
}

/// One in-progress delivery of one message to one target.
///
/// Call order is `add_rcpt`* then `body` or `body_non_atomic`, then `commit`;
/// `abort` must be tolerated after any prior step. A cancelled `body` aborts
/// internally before returning.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn add_rcpt(&mut self, rcpt: &str) -> Result<()>;

    async fn body(&mut self, header: &[u8], body: Arc<dyn Buffer>) -> Result<()>;

    /// Whether this target reports per-recipient results from the body
    /// stage (LMTP downstreams, the queue).
    fn supports_partial(&self) -> bool {
        false
    }

    /// Partial-delivery variant: per-recipient errors land in the
    /// collector, absence of an entry means success. The default funnels
    /// the atomic result to every recipient.
    async fn body_non_atomic(
        &mut self,
        collector: &StatusCollector,
        rcpts: &[String],
        header: &[u8],
        body: Arc<dyn Buffer>,
    ) {
        if let Err(err) = self.body(header, body).await {
            for rcpt in rcpts {
                collector.set_status(rcpt, err.clone());
            }
        }
    }

    async fn commit(&mut self) -> Result<()>;

    async fn abort(&mut self) -> Result<()>;
}

/// Collects per-recipient failures reported by a partial-delivery body call.
#[derive(Default)]
pub struct StatusCollector {
    statuses: Mutex<AHashMap<String, Error>>,
}

impl StatusCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, rcpt: &str, err: Error) {
        self.statuses.lock().insert(rcpt.to_string(), err);
    }

    pub fn take(&self, rcpt: &str) -> Option<Error> {
        self.statuses.lock().remove(rcpt)
    }

    pub fn peek_failed(&self, rcpt: &str) -> bool {
        self.statuses.lock().contains_key(rcpt)
    }

    pub fn into_statuses(self) -> AHashMap<String, Error> {
        self.statuses.into_inner()
    }
}
