/*
 * SPDX-FileCopyrightText: 2024 Pelican Mail Project <dev@pelicanmail.org>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::time::Duration;

use ahash::AHashMap;
use chrono::{DateTime, Utc};
use common::error::Status;
use serde::{Deserialize, Serialize};

use crate::{config::QueueConfig, core::MsgMetadata};

pub mod dsn;
pub mod manager;
pub mod spool;

pub use manager::{Queue, QueueTarget};

/// Durable per-message record, serialized as `<id>.meta`. The embedded
/// connection state is blanked by serialization; after a restart, checks
/// that need connection facts observe "unknown" instead of failing.
#[derive(Clone, Serialize, Deserialize)]
pub struct QueueMetadata {
    #[serde(rename = "MsgMeta")]
    pub msg_meta: MsgMetadata,
    #[serde(rename = "From")]
    pub from: String,
    /// Current attempt set of recipients.
    #[serde(rename = "To")]
    pub to: Vec<String>,
    /// Permanently failed recipients.
    #[serde(rename = "FailedRcpts")]
    pub failed_rcpts: Vec<String>,
    /// Recipients whose last attempt failed temporarily.
    #[serde(rename = "TemporaryFailedRcpts")]
    pub temporary_failed_rcpts: Vec<String>,
    /// Last error per recipient.
    #[serde(rename = "RcptErrs")]
    pub rcpt_errs: AHashMap<String, Status>,
    #[serde(rename = "TriesCount")]
    pub tries_count: AHashMap<String, u32>,
    #[serde(rename = "FirstAttempt")]
    pub first_attempt: DateTime<Utc>,
    #[serde(rename = "LastAttempt")]
    pub last_attempt: DateTime<Utc>,
}

impl QueueMetadata {
    pub fn new(msg_meta: MsgMetadata, from: impl Into<String>, to: Vec<String>) -> Self {
        let now = Utc::now();
        QueueMetadata {
            msg_meta,
            from: from.into(),
            to,
            failed_rcpts: Vec::new(),
            temporary_failed_rcpts: Vec::new(),
            rcpt_errs: AHashMap::new(),
            tries_count: AHashMap::new(),
            first_attempt: now,
            last_attempt: now,
        }
    }

    /// Smallest try count among recipients still pending; drives the
    /// message's next-attempt time.
    pub fn min_pending_tries(&self) -> u32 {
        self.to
            .iter()
            .map(|rcpt| self.tries_count.get(rcpt).copied().unwrap_or(0))
            .min()
            .unwrap_or(0)
    }

    /// Next-attempt delay: `initial × scale ^ (tries - 1)`.
    pub fn next_delay(&self, config: &QueueConfig) -> Duration {
        let tries = self.min_pending_tries().max(1);
        Duration::from_secs_f64(
            config.initial_retry.as_secs_f64() * config.retry_scale.powi(tries as i32 - 1),
        )
    }
}
