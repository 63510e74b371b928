/*
 * SPDX-FileCopyrightText: 2024 Pelican Mail Project <dev@pelicanmail.org>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use common::{
    error::{Error, Status},
    limiter::LimitSpec,
};
use smtp::{
    checks::{Check, CheckResult, CheckState, ConfiguredCheck},
    core::MsgMetadata,
    pipeline::{Matcher, Rule, RuleAction},
};

use super::{connect, core_for, core_with_rules, AttemptPlan, ErrorKind, MockTarget};

#[tokio::test]
async fn s1_basic_delivery() {
    let target = MockTarget::new();
    let core = core_for(target.clone(), |_| {});
    let mut client = connect(core).await;

    client.cmd("EHLO mx.example.org", "250").await;
    client.cmd("MAIL FROM:<sender@example.org>", "250").await;
    client.cmd("RCPT TO:<r1@example.com>", "250").await;
    client.cmd("RCPT TO:<r2@example.com>", "250").await;
    client.cmd("DATA", "354").await;
    client.data("From: <sender@example.org>\r\n\r\nfoo", "250").await;

    let deliveries = target.deliveries.lock();
    assert_eq!(deliveries.len(), 1, "exactly one aggregated delivery");
    let delivery = &deliveries[0];
    assert!(delivery.committed);
    assert_eq!(delivery.mail_from, "sender@example.org");
    assert_eq!(delivery.rcpts, vec!["r1@example.com", "r2@example.com"]);

    let header = String::from_utf8(delivery.header.clone()).unwrap();
    assert!(
        header.starts_with("Received: from mx.example.org ("),
        "{header}"
    );
    assert!(
        header.contains("by mail.example.com (envelope-sender <sender@example.org>) with ESMTP id"),
        "{header}"
    );
    assert_eq!(delivery.body, b"foo\r\n");
}

#[tokio::test]
async fn s2_submission_fixups() {
    let target = MockTarget::new();
    let core = core_for(target.clone(), |config| {
        config.session.submission = true;
        config.session.insecure_auth = true;
    });
    let mut client = connect(core).await;

    client.cmd("EHLO client.example.net", "250").await;

    // Submission requires authentication.
    client.cmd("MAIL FROM:<user@example.org>", "530 5.7.0").await;
    client.cmd("AUTH PLAIN AHVzZXIAcHc=", "235 2.7.0").await;

    // A message without a From header is refused at the body stage.
    client.cmd("MAIL FROM:<user@example.org>", "250").await;
    client.cmd("RCPT TO:<r1@example.com>", "250").await;
    client.cmd("DATA", "354").await;
    client.data("Subject: no from here", "554 5.6.0").await;

    // A minimal valid message gets Message-ID and Date synthesized.
    client.cmd("MAIL FROM:<user@example.org>", "250").await;
    client.cmd("RCPT TO:<r1@example.com>", "250").await;
    client.cmd("DATA", "354").await;
    client.data("From: <a@x.example>\r\n\r\nhello", "250").await;

    let deliveries = target.deliveries.lock();
    assert_eq!(deliveries.len(), 1);
    let header = String::from_utf8(deliveries[0].header.clone()).unwrap();
    assert!(header.contains("Message-ID: <"), "{header}");
    assert!(header.contains("@mail.example.com>"), "{header}");
    assert!(
        header.contains("Date: Fri, 17 May 2024 10:30:00 +0000"),
        "{header}"
    );
    // The client address is not published in the trace header.
    assert!(!header.contains("10.0.0.1"), "{header}");
}

#[tokio::test]
async fn s5_smtputf8_normalization() {
    let target = MockTarget::new();
    let core = core_for(target.clone(), |_| {});
    let mut client = connect(core).await;

    client.cmd("EHLO mx.example.org", "250").await;
    client
        .cmd("MAIL FROM:<foo@E\u{301}.example.org> SMTPUTF8", "250")
        .await;
    client.cmd("RCPT TO:<r1@example.com>", "250").await;
    client.cmd("DATA", "354").await;
    client.data("From: <foo@example.org>\r\n\r\nhi", "250").await;

    let deliveries = target.deliveries.lock();
    assert_eq!(deliveries[0].mail_from, "foo@\u{e9}.example.org");
    let header = String::from_utf8(deliveries[0].header.clone()).unwrap();
    assert!(header.contains("with UTF8ESMTP id"), "{header}");
}

#[tokio::test]
async fn p9_smtputf8_gate() {
    let target = MockTarget::new();
    let core = core_for(target.clone(), |_| {});
    let mut client = connect(core).await;

    client.cmd("EHLO mx.example.org", "250").await;
    client
        .cmd("MAIL FROM:<foo@\u{e9}.example.org>", "553 5.6.7")
        .await;
    assert_eq!(target.attempts(), 0);
}

#[tokio::test]
async fn p8_routing_loop_guard() {
    let target = MockTarget::new();
    let core = core_for(target.clone(), |config| {
        config.session.max_received = 2;
    });
    let mut client = connect(core).await;

    client.cmd("EHLO mx.example.org", "250").await;
    client.cmd("MAIL FROM:<sender@example.org>", "250").await;
    client.cmd("RCPT TO:<r1@example.com>", "250").await;
    client.cmd("DATA", "354").await;
    client
        .data(
            "Received: from a by b; Mon, 1 Jan 2024 00:00:00 +0000\r\n\
             Received: from b by c; Mon, 1 Jan 2024 00:00:00 +0000\r\n\
             Received: from c by d; Mon, 1 Jan 2024 00:00:00 +0000\r\n\
             From: <sender@example.org>\r\n\r\nlooping",
            "554 5.4.6",
        )
        .await;
    assert!(target.committed().is_empty());
}

#[tokio::test(start_paused = true)]
async fn s6_rate_limited_mail_from() {
    let target = MockTarget::new();
    let core = core_for(target.clone(), |config| {
        config.limits.global = vec![LimitSpec::Rate {
            burst: 1,
            interval: Duration::from_secs(10),
        }];
        config.limits.take_deadline = Duration::from_secs(5);
    });

    let mut first = connect(core.clone()).await;
    first.cmd("EHLO one.example.net", "250").await;
    first.cmd("MAIL FROM:<a@example.org>", "250").await;

    let mut second = connect(core).await;
    second.cmd("EHLO two.example.net", "250").await;
    second.cmd("MAIL FROM:<b@example.org>", "451 4.4.5").await;
}

struct RejectSender {
    denied: &'static str,
}

impl Check for RejectSender {
    fn name(&self) -> &'static str {
        "reject_sender"
    }

    fn state_for_msg(&self, _meta: &MsgMetadata) -> Box<dyn CheckState> {
        Box::new(RejectSenderState {
            denied: self.denied,
        })
    }
}

struct RejectSenderState {
    denied: &'static str,
}

#[async_trait]
impl CheckState for RejectSenderState {
    async fn check_sender(&mut self, mail_from: &str) -> CheckResult {
        if mail_from == self.denied {
            CheckResult::reject(Error::Policy(Status::new(550, (5, 7, 1), "Sender denied")))
        } else {
            CheckResult::default()
        }
    }
}

#[tokio::test]
async fn p10_deferred_sender_reject() {
    let target = MockTarget::new();
    let rules = vec![Rule::new(Matcher::default(), RuleAction::Subtree(Vec::new()))
        .with_checks(vec![ConfiguredCheck::rejecting(Arc::new(RejectSender {
            denied: "spam@example.org",
        }))])];
    let core = core_with_rules(target.clone(), rules, |config| {
        config.session.defer_sender_reject = true;
    });
    let mut client = connect(core).await;

    client.cmd("EHLO mx.example.org", "250").await;

    // The rejection is deferred: MAIL succeeds, every RCPT replays it.
    client.cmd("MAIL FROM:<spam@example.org>", "250").await;
    client.cmd("RCPT TO:<r1@example.com>", "550 5.7.1").await;
    client.cmd("RCPT TO:<r2@example.com>", "550 5.7.1").await;

    // RSET clears the cached error.
    client.cmd("RSET", "250").await;
    client.cmd("MAIL FROM:<fine@example.org>", "250").await;
    client.cmd("RCPT TO:<r1@example.com>", "250").await;
}

#[tokio::test]
async fn lmtp_reports_per_recipient_status() {
    let target = MockTarget::new();
    let mut plan = AttemptPlan::default();
    plan.rcpt_errors
        .insert("bad@example.com".to_string(), ErrorKind::Permanent);
    target.push_plan(plan);

    let core = core_for(target.clone(), |config| {
        config.session.lmtp = true;
    });
    let mut client = connect(core).await;

    client.cmd("LHLO mx.example.org", "250").await;
    client.cmd("MAIL FROM:<sender@example.org>", "250").await;
    client.cmd("RCPT TO:<good@example.com>", "250").await;
    client.cmd("RCPT TO:<bad@example.com>", "250").await;
    client.cmd("DATA", "354").await;

    client
        .data("From: <sender@example.org>\r\n\r\nhello", "250 2.0.0 <good@example.com>")
        .await;
    let second = client.read_line().await;
    assert!(second.starts_with("550 5.1.1"), "{second}");
}

#[tokio::test]
async fn unknown_recipient_rejected_without_default() {
    let target = MockTarget::new();
    // Routing tree with a single destination-gated rule and no default.
    let rules = vec![Rule::new(
        Matcher {
            destinations: vec![smtp::pipeline::AddrPattern::Domain("example.com".to_string())],
            ..Default::default()
        },
        RuleAction::Deliver(vec![Arc::new(target.clone())]),
    )];
    let core = {
        let mut config = smtp::config::ServerConfig {
            hostname: "mail.example.com".to_string(),
            autogen_msg_domain: "example.com".to_string(),
            ..Default::default()
        };
        let limits = Arc::new(std::mem::take(&mut config.limits).build());
        let pipeline = Arc::new(smtp::pipeline::Pipeline::new(config.hostname.clone(), rules));
        Arc::new(smtp::core::Core {
            config,
            pipeline,
            limits,
            sasl: None,
            rdns: Arc::new(smtp::core::rdns::NullResolver),
            preparer: None,
        })
    };
    let mut client = connect(core).await;

    client.cmd("EHLO mx.example.org", "250").await;
    client.cmd("MAIL FROM:<sender@example.org>", "250").await;
    client.cmd("RCPT TO:<r1@example.com>", "250").await;
    client.cmd("RCPT TO:<r1@elsewhere.net>", "550 5.1.1").await;
}
