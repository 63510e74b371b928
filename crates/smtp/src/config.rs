/*
 * SPDX-FileCopyrightText: 2024 Pelican Mail Project <dev@pelicanmail.org>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::{path::PathBuf, time::Duration};

use common::{buffer::BufferConfig, limiter::group::GroupConfig};

/// Resolved server configuration. The declarative config file format and its
/// parser are external collaborators; these structs hold the values they
/// produce for the message-processing core.
#[derive(Clone, Default)]
pub struct ServerConfig {
    /// Our name: used in the banner, Received headers and DSN Reporting-MTA.
    pub hostname: String,
    /// Domain for generated senders (`MAILER-DAEMON@<domain>`) and ids.
    pub autogen_msg_domain: String,
    pub buffer: BufferConfig,
    pub session: SessionConfig,
    pub queue: QueueConfig,
    pub limits: GroupConfig,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub lmtp: bool,
    /// Submission endpoints require AUTH and run the message preparer.
    pub submission: bool,
    /// Offer PLAIN/LOGIN on plaintext connections.
    pub insecure_auth: bool,
    pub enable_login: bool,
    /// Advertise STARTTLS; the handshake itself is performed by the
    /// listener's TLS acceptor, an external collaborator.
    pub starttls: bool,
    /// When on, MAIL FROM always answers 250 for syntactically valid
    /// senders; pipeline rejections are replayed on each RCPT until RSET.
    pub defer_sender_reject: bool,
    /// Maximum Received header fields before assuming a routing loop.
    pub max_received: usize,
    pub max_header_size: usize,
    pub max_message_size: usize,
    pub max_recipients: usize,
    /// Consecutive failed RCPT/AUTH attempts tolerated before the
    /// connection is dropped.
    pub max_errors: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// How long a check blocks on the reverse-DNS future.
    pub rdns_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            lmtp: false,
            submission: false,
            insecure_auth: false,
            enable_login: false,
            starttls: false,
            defer_sender_reject: false,
            max_received: 50,
            max_header_size: 1024 * 1024,
            max_message_size: 32 * 1024 * 1024,
            max_recipients: 100,
            max_errors: 5,
            read_timeout: Duration::from_secs(300),
            write_timeout: Duration::from_secs(60),
            rdns_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub directory: PathBuf,
    pub max_tries: u32,
    pub initial_retry: Duration,
    pub retry_scale: f64,
    /// Messages due at startup are pushed back by this much to avoid a
    /// thundering herd after a restart.
    pub post_init_delay: Duration,
    /// Concurrent dispatch cap.
    pub parallelism: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            directory: PathBuf::from("queue"),
            max_tries: 20,
            initial_retry: Duration::from_secs(15 * 60),
            retry_scale: 2.0,
            post_init_delay: Duration::from_secs(10),
            parallelism: 16,
        }
    }
}
