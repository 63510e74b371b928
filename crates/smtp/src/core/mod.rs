/*
 * SPDX-FileCopyrightText: 2024 Pelican Mail Project <dev@pelicanmail.org>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use ahash::AHashMap;
use common::{auth::SaslAuth, future::FutureValue, limiter::LimiterGroup};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use smtp_proto::request::receiver::{DataReceiver, LineReceiver, RequestReceiver};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{config::ServerConfig, pipeline::Pipeline};

pub mod rdns;

pub struct Core {
    pub config: ServerConfig,
    pub pipeline: Arc<Pipeline>,
    pub limits: Arc<LimiterGroup>,
    pub sasl: Option<Arc<SaslAuth>>,
    pub rdns: Arc<dyn rdns::RdnsResolver>,
    /// Present on submission endpoints only.
    pub preparer: Option<crate::submission::SubmissionPrepare>,
}

/// Wire protocol of a connection, as recorded in trace headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    Esmtp,
    Esmtps,
    Lmtp,
}

impl Protocol {
    /// The `with` clause of the Received header. U-labels are preserved on
    /// SMTPUTF8 transactions, and the protocol name reflects it.
    pub fn label(&self, utf8: bool) -> &'static str {
        match (self, utf8) {
            (Protocol::Esmtp, false) => "ESMTP",
            (Protocol::Esmtp, true) => "UTF8ESMTP",
            (Protocol::Esmtps, false) => "ESMTPS",
            (Protocol::Esmtps, true) => "UTF8ESMTPS",
            (Protocol::Lmtp, _) => "LMTP",
        }
    }
}

/// Per-connection facts, shared by reference between the session, the checks
/// and the pipeline. Never copied by value; queue serialization blanks it.
pub struct ConnState {
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub proto: RwLock<Protocol>,
    /// Hostname given in EHLO/HELO/LHLO.
    pub helo: RwLock<Option<String>>,
    pub tls: AtomicBool,
    pub auth_user: RwLock<Option<String>>,
    /// Reverse-DNS name, resolved by a background task; readers block on the
    /// future with a deadline.
    pub rdns: FutureValue<Option<String>>,
}

impl ConnState {
    pub fn new(
        remote_addr: SocketAddr,
        local_addr: SocketAddr,
        proto: Protocol,
        rdns: FutureValue<Option<String>>,
    ) -> Self {
        ConnState {
            remote_addr,
            local_addr,
            proto: RwLock::new(proto),
            helo: RwLock::new(None),
            tls: AtomicBool::new(false),
            auth_user: RwLock::new(None),
            rdns,
        }
    }

    pub fn is_tls(&self) -> bool {
        self.tls.load(Ordering::Acquire)
    }

    pub fn set_tls(&self) {
        self.tls.store(true, Ordering::Release);
        let mut proto = self.proto.write();
        if *proto == Protocol::Esmtp {
            *proto = Protocol::Esmtps;
        }
    }

    pub fn authenticated(&self) -> Option<String> {
        self.auth_user.read().clone()
    }
}

/// SMTP options negotiated for one message.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SmtpOptions {
    pub utf8: bool,
    pub requiretls: bool,
    pub body_8bit: bool,
    pub size_hint: Option<u64>,
}

/// Immutable identity of a message in flight, created at MAIL FROM and
/// carried through the pipeline and the queue.
#[derive(Clone, Serialize, Deserialize)]
pub struct MsgMetadata {
    pub id: String,
    #[serde(skip)]
    pub conn: Option<Arc<ConnState>>,
    pub mail_from: String,
    pub opts: SmtpOptions,
    /// Rewritten recipient back to the original, for DSN fidelity.
    pub original_rcpts: AHashMap<String, String>,
    /// Set on queue-generated bounces; such messages never bounce again.
    pub dsn: bool,
    /// Submission sets this so trace headers do not publish the client IP.
    pub dont_trace_sender: bool,
}

impl MsgMetadata {
    pub fn new(conn: Option<Arc<ConnState>>, mail_from: impl Into<String>) -> Self {
        MsgMetadata {
            id: new_message_id(),
            conn,
            mail_from: mail_from.into(),
            opts: SmtpOptions::default(),
            original_rcpts: AHashMap::new(),
            dsn: false,
            dont_trace_sender: false,
        }
    }

    /// The original form of a (possibly rewritten) recipient.
    pub fn original_rcpt<'x>(&'x self, rcpt: &'x str) -> &'x str {
        self.original_rcpts
            .get(rcpt)
            .map(String::as_str)
            .unwrap_or(rcpt)
    }
}

/// Server-generated message id: random, lowercase hex, 128 bits.
pub fn new_message_id() -> String {
    let mut id = String::with_capacity(32);
    for b in rand::random::<[u8; 16]>() {
        id.push_str(&format!("{b:02x}"));
    }
    id
}

/// Receiver state of a session, driving the smtp-proto parsers.
pub enum State {
    Request(RequestReceiver),
    Data(DataReceiver, Vec<u8>),
    Sasl(LineReceiver<u64>),
    None,
}

impl Default for State {
    fn default() -> Self {
        State::Request(RequestReceiver::default())
    }
}

pub struct Session<T: AsyncRead + AsyncWrite + Unpin + Send> {
    pub core: Arc<Core>,
    pub stream: T,
    pub span: tracing::Span,
    pub state: State,
    pub conn: Arc<ConnState>,
    pub data: SessionData,
}

/// Mutable per-session state guarded by the session task; commands within
/// one session are strictly serialized.
pub struct SessionData {
    pub transaction: Option<crate::pipeline::MsgTransaction>,
    /// Accepted recipients in order, for LMTP per-recipient replies.
    pub rcpt_to: Vec<String>,
    /// Cached pipeline rejection replayed at RCPT when sender rejection is
    /// deferred.
    pub deferred_error: Option<common::error::Error>,
    /// Message tokens held on the limiter group: (ip, source domain).
    pub msg_token: Option<(std::net::IpAddr, String)>,
    /// Destination-domain tokens held per accepted recipient.
    pub dest_tokens: Vec<String>,
    pub sasl: Option<common::auth::SaslSession>,
    pub data_too_large: bool,
    pub rcpt_errors: usize,
    pub auth_errors: usize,
    pub messages_sent: usize,
}

impl Default for SessionData {
    fn default() -> Self {
        SessionData {
            transaction: None,
            rcpt_to: Vec::new(),
            deferred_error: None,
            msg_token: None,
            dest_tokens: Vec::new(),
            sasl: None,
            data_too_large: false,
            rcpt_errors: 0,
            auth_errors: 0,
            messages_sent: 0,
        }
    }
}
