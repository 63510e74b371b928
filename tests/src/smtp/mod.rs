/*
 * SPDX-FileCopyrightText: 2024 Pelican Mail Project <dev@pelicanmail.org>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::{
    collections::VecDeque,
    io::Read,
    sync::Arc,
};

use ahash::AHashMap;
use async_trait::async_trait;
use common::{
    auth::{IdentityMap, Normalize, PlainAuth, SaslAuth},
    buffer::Buffer,
    error::{Error, Result},
};
use parking_lot::Mutex;
use smtp::{
    config::ServerConfig,
    core::{rdns::NullResolver, Core, MsgMetadata, Session},
    delivery::{Delivery, StatusCollector, Target},
    pipeline::{Pipeline, Rule},
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};

pub mod queue;
pub mod session;

/// Planned outcome of one delivery attempt against a [`MockTarget`].
#[derive(Default, Clone)]
pub struct AttemptPlan {
    /// Per-recipient error raised from the body stage.
    pub rcpt_errors: AHashMap<String, ErrorKind>,
    /// Error raised from `start` itself.
    pub start_error: Option<ErrorKind>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Temporary,
    Permanent,
}

impl ErrorKind {
    fn to_error(self) -> Error {
        match self {
            ErrorKind::Temporary => Error::policy(450, (4, 2, 0), "mock temporary failure"),
            ErrorKind::Permanent => Error::policy(550, (5, 1, 1), "mock permanent failure"),
        }
    }
}

/// One completed (or aborted) delivery observed by a [`MockTarget`].
pub struct Recorded {
    pub mail_from: String,
    pub meta_id: String,
    pub is_dsn: bool,
    pub original_rcpts: AHashMap<String, String>,
    pub rcpts: Vec<String>,
    pub header: Vec<u8>,
    pub body: Vec<u8>,
    pub committed: bool,
    pub started_at: tokio::time::Instant,
}

/// Scriptable delivery target recording everything it is handed.
#[derive(Default)]
pub struct MockTarget {
    pub deliveries: Mutex<Vec<Recorded>>,
    pub plans: Mutex<VecDeque<AttemptPlan>>,
}

impl MockTarget {
    pub fn new() -> Arc<Self> {
        Arc::new(MockTarget::default())
    }

    pub fn push_plan(&self, plan: AttemptPlan) {
        self.plans.lock().push_back(plan);
    }

    pub fn committed(&self) -> Vec<String> {
        self.deliveries
            .lock()
            .iter()
            .filter(|recorded| recorded.committed)
            .flat_map(|recorded| recorded.rcpts.clone())
            .collect()
    }

    pub fn attempts(&self) -> usize {
        self.deliveries.lock().len()
    }

    pub fn attempt_times(&self) -> Vec<tokio::time::Instant> {
        self.deliveries
            .lock()
            .iter()
            .map(|recorded| recorded.started_at)
            .collect()
    }
}

#[async_trait]
impl Target for Arc<MockTarget> {
    async fn start(&self, meta: &MsgMetadata, mail_from: &str) -> Result<Box<dyn Delivery>> {
        let plan = self.plans.lock().pop_front().unwrap_or_default();
        if let Some(kind) = plan.start_error {
            return Err(kind.to_error());
        }
        Ok(Box::new(MockDelivery {
            target: self.clone(),
            plan,
            recorded: Recorded {
                mail_from: mail_from.to_string(),
                meta_id: meta.id.clone(),
                is_dsn: meta.dsn,
                original_rcpts: meta.original_rcpts.clone(),
                rcpts: Vec::new(),
                header: Vec::new(),
                body: Vec::new(),
                committed: false,
                started_at: tokio::time::Instant::now(),
            },
        }))
    }
}

pub struct MockDelivery {
    target: Arc<MockTarget>,
    plan: AttemptPlan,
    recorded: Recorded,
}

#[async_trait]
impl Delivery for MockDelivery {
    async fn add_rcpt(&mut self, rcpt: &str) -> Result<()> {
        self.recorded.rcpts.push(rcpt.to_string());
        Ok(())
    }

    async fn body(&mut self, header: &[u8], body: Arc<dyn Buffer>) -> Result<()> {
        self.capture(header, &body)?;
        if let Some(kind) = self
            .recorded
            .rcpts
            .iter()
            .find_map(|rcpt| self.plan.rcpt_errors.get(rcpt))
        {
            return Err(kind.to_error());
        }
        Ok(())
    }

    fn supports_partial(&self) -> bool {
        true
    }

    async fn body_non_atomic(
        &mut self,
        collector: &StatusCollector,
        _rcpts: &[String],
        header: &[u8],
        body: Arc<dyn Buffer>,
    ) {
        if self.capture(header, &body).is_err() {
            for rcpt in &self.recorded.rcpts {
                collector.set_status(rcpt, Error::policy(450, (4, 3, 0), "mock I/O failure"));
            }
            return;
        }
        for rcpt in &self.recorded.rcpts {
            if let Some(kind) = self.plan.rcpt_errors.get(rcpt) {
                collector.set_status(rcpt, kind.to_error());
            }
        }
    }

    async fn commit(&mut self) -> Result<()> {
        self.recorded.committed = true;
        self.flush();
        Ok(())
    }

    async fn abort(&mut self) -> Result<()> {
        self.flush();
        Ok(())
    }
}

impl MockDelivery {
    fn capture(&mut self, header: &[u8], body: &Arc<dyn Buffer>) -> Result<()> {
        self.recorded.header = header.to_vec();
        let mut bytes = Vec::new();
        body.open()?.read_to_end(&mut bytes)?;
        self.recorded.body = bytes;
        Ok(())
    }

    fn flush(&mut self) {
        if !self.recorded.rcpts.is_empty() || self.recorded.committed {
            let recorded = std::mem::replace(
                &mut self.recorded,
                Recorded {
                    mail_from: String::new(),
                    meta_id: String::new(),
                    is_dsn: false,
                    original_rcpts: AHashMap::new(),
                    rcpts: Vec::new(),
                    header: Vec::new(),
                    body: Vec::new(),
                    committed: false,
                    started_at: tokio::time::Instant::now(),
                },
            );
            self.target.deliveries.lock().push(recorded);
        }
    }
}

pub struct StaticAuth {
    pub username: &'static str,
    pub password: &'static str,
}

#[async_trait]
impl PlainAuth for StaticAuth {
    async fn auth_plain(&self, username: &str, password: &str) -> Result<()> {
        if username == self.username && password == self.password {
            Ok(())
        } else {
            Err(Error::AuthInvalid)
        }
    }
}

pub fn sasl_for(username: &'static str, password: &'static str) -> Arc<SaslAuth> {
    Arc::new(SaslAuth::new(
        vec![Arc::new(StaticAuth { username, password })],
        IdentityMap::new(Normalize::CaseMapped, None),
    ))
}

/// Assembles a Core around a single default destination target.
pub fn core_for(
    target: Arc<MockTarget>,
    configure: impl FnOnce(&mut ServerConfig),
) -> Arc<Core> {
    core_with_rules(target, Vec::new(), configure)
}

pub fn core_with_rules(
    target: Arc<MockTarget>,
    rules: Vec<Rule>,
    configure: impl FnOnce(&mut ServerConfig),
) -> Arc<Core> {
    let mut config = ServerConfig {
        hostname: "mail.example.com".to_string(),
        autogen_msg_domain: "example.com".to_string(),
        ..Default::default()
    };
    configure(&mut config);

    let limits = Arc::new(std::mem::take(&mut config.limits).build());
    let pipeline = Arc::new(
        Pipeline::new(config.hostname.clone(), rules)
            .with_default_destination(vec![Arc::new(target)]),
    );
    let sasl = if config.session.submission {
        Some(sasl_for("user", "pw"))
    } else {
        None
    };
    let preparer = config.session.submission.then(|| {
        use chrono::TimeZone;
        smtp::submission::SubmissionPrepare::new(config.hostname.clone())
            .with_fixed_time(chrono::Utc.with_ymd_and_hms(2024, 5, 17, 10, 30, 0).unwrap())
    });

    Arc::new(Core {
        config,
        pipeline,
        limits,
        sasl,
        rdns: Arc::new(NullResolver),
        preparer,
    })
}

/// Client end of an in-memory session, in the teacher style of
/// `cmd(...).await` assertions.
pub struct TestClient {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

pub async fn connect(core: Arc<Core>) -> TestClient {
    let (client, server) = tokio::io::duplex(1 << 20);
    tokio::spawn(async move {
        Session::new(
            core,
            server,
            "10.0.0.1:34567".parse().unwrap(),
            "127.0.0.1:25".parse().unwrap(),
        )
        .handle()
        .await;
    });
    let (reader, writer) = tokio::io::split(client);
    let mut client = TestClient {
        reader: BufReader::new(reader),
        writer,
    };
    let greeting = client.read_response().await;
    assert!(greeting.starts_with("220 "), "unexpected greeting {greeting:?}");
    client
}

impl TestClient {
    /// Sends one command line and asserts on the reply prefix.
    pub async fn cmd(&mut self, line: &str, expect: &str) -> String {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
        let response = self.read_response().await;
        assert!(
            response.starts_with(expect),
            "command {line:?}: expected {expect:?}, got {response:?}"
        );
        response
    }

    /// Sends a DATA payload (adding the final dot) and asserts on the reply.
    pub async fn data(&mut self, payload: &str, expect: &str) -> String {
        self.writer
            .write_all(payload.as_bytes())
            .await
            .unwrap();
        self.writer.write_all(b"\r\n.\r\n").await.unwrap();
        let response = self.read_response().await;
        assert!(
            response.starts_with(expect),
            "data: expected {expect:?}, got {response:?}"
        );
        response
    }

    /// Reads one SMTP reply, following continuation lines.
    pub async fn read_response(&mut self) -> String {
        let mut response = String::new();
        loop {
            let mut line = String::new();
            self.reader.read_line(&mut line).await.unwrap();
            assert!(!line.is_empty(), "connection closed mid-response");
            response.push_str(&line);
            if line.len() < 4 || line.as_bytes()[3] != b'-' {
                return response;
            }
        }
    }

    pub async fn read_line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap();
        line
    }
}
