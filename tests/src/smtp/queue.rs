/*
 * SPDX-FileCopyrightText: 2024 Pelican Mail Project <dev@pelicanmail.org>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::{path::PathBuf, sync::Arc, time::Duration};

use common::buffer::MemoryBuffer;
use smtp::{
    config::QueueConfig,
    core::MsgMetadata,
    delivery::Target,
    queue::{Queue, QueueTarget},
};

use super::{AttemptPlan, ErrorKind, MockTarget};

fn queue_config(tag: &str) -> QueueConfig {
    QueueConfig {
        directory: std::env::temp_dir().join(format!(
            "pelican-queue-{tag}-{:08x}",
            rand::random::<u32>()
        )),
        max_tries: 10,
        initial_retry: Duration::from_secs(1),
        retry_scale: 2.0,
        post_init_delay: Duration::from_secs(1),
        parallelism: 4,
    }
}

fn start_queue(
    config: &QueueConfig,
    downstream: &Arc<MockTarget>,
    bounce: &Arc<MockTarget>,
) -> Arc<Queue> {
    Queue::start(
        config.clone(),
        "mail.example.com",
        "example.com",
        Arc::new(downstream.clone()),
        Some(Arc::new(bounce.clone()) as Arc<dyn Target>),
        None,
    )
    .unwrap()
}

async fn submit(queue: &Arc<Queue>, meta: MsgMetadata, from: &str, rcpts: &[&str]) -> String {
    let id = meta.id.clone();
    let target = QueueTarget(queue.clone());
    let mut delivery = target.start(&meta, from).await.unwrap();
    for rcpt in rcpts {
        delivery.add_rcpt(rcpt).await.unwrap();
    }
    delivery
        .body(
            b"Subject: queued\r\n\r\n",
            Arc::new(MemoryBuffer::new(b"payload".to_vec())),
        )
        .await
        .unwrap();
    delivery.commit().await.unwrap();
    id
}

fn spool_files(dir: &PathBuf) -> Vec<String> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test(start_paused = true)]
async fn p5_commit_is_durable_and_abort_leaves_nothing() {
    let config = queue_config("durable");
    let downstream = MockTarget::new();
    let bounce = MockTarget::new();

    // First attempt fails temporarily so the files stay on disk.
    let mut plan = AttemptPlan::default();
    plan.rcpt_errors
        .insert("r1@example.com".to_string(), ErrorKind::Temporary);
    downstream.push_plan(plan);
    let queue = start_queue(&config, &downstream, &bounce);

    let meta = MsgMetadata::new(None, "sender@example.org");
    let id = submit(&queue, meta, "sender@example.org", &["r1@example.com"]).await;

    let files = spool_files(&config.directory);
    for suffix in ["meta", "header", "body"] {
        assert!(
            files.contains(&format!("{id}.{suffix}")),
            "missing {id}.{suffix} in {files:?}"
        );
    }

    {
        let downstream = downstream.clone();
        wait_until(move || downstream.attempts() >= 1).await;
    }
    queue.close();

    // Restart from disk: the message survives and is delivered.
    let queue = start_queue(&config, &downstream, &bounce);
    {
        let downstream = downstream.clone();
        wait_until(move || downstream.committed().contains(&"r1@example.com".to_string())).await;
    }
    {
        let dir = config.directory.clone();
        wait_until(move || spool_files(&dir).is_empty()).await;
    }
    assert!(bounce.attempts() == 0);
    queue.close();

    // An aborted enqueue leaves no files behind.
    let config = queue_config("abort");
    let queue = start_queue(&config, &downstream, &bounce);
    let target = QueueTarget(queue.clone());
    let meta = MsgMetadata::new(None, "sender@example.org");
    let mut delivery = target.start(&meta, "sender@example.org").await.unwrap();
    delivery.add_rcpt("r1@example.com").await.unwrap();
    delivery
        .body(
            b"Subject: x\r\n\r\n",
            Arc::new(MemoryBuffer::new(b"y".to_vec())),
        )
        .await
        .unwrap();
    delivery.abort().await.unwrap();
    assert!(spool_files(&config.directory).is_empty());
    queue.close();
}

#[tokio::test(start_paused = true)]
async fn p6_retry_schedule_backs_off_exponentially() {
    let config = queue_config("retry");
    let downstream = MockTarget::new();
    let bounce = MockTarget::new();
    for _ in 0..3 {
        let mut plan = AttemptPlan::default();
        plan.rcpt_errors
            .insert("r1@example.com".to_string(), ErrorKind::Temporary);
        downstream.push_plan(plan);
    }
    let queue = start_queue(&config, &downstream, &bounce);

    let meta = MsgMetadata::new(None, "sender@example.org");
    submit(&queue, meta, "sender@example.org", &["r1@example.com"]).await;

    {
        let downstream = downstream.clone();
        wait_until(move || downstream.committed().contains(&"r1@example.com".to_string())).await;
    }
    let times = downstream.attempt_times();
    assert_eq!(times.len(), 4);

    // Delays of ~1s, ~2s, ~4s between attempts (± tick granularity).
    for (gap, expected) in times.windows(2).zip([1.0f64, 2.0, 4.0]) {
        let actual = (gap[1] - gap[0]).as_secs_f64();
        assert!(
            (actual - expected).abs() < 0.5,
            "expected ~{expected}s between attempts, got {actual}s"
        );
    }
    assert!(bounce.attempts() == 0);
    queue.close();
}

#[tokio::test(start_paused = true)]
async fn s3_permanent_failure_bounces_once() {
    let config = queue_config("bounce");
    let downstream = MockTarget::new();
    let bounce = MockTarget::new();
    let mut plan = AttemptPlan::default();
    plan.rcpt_errors
        .insert("real@example.com".to_string(), ErrorKind::Permanent);
    plan.rcpt_errors
        .insert("r2@example.com".to_string(), ErrorKind::Permanent);
    downstream.push_plan(plan);
    let queue = start_queue(&config, &downstream, &bounce);

    // One recipient was rewritten by the pipeline; the DSN must restore it.
    let mut meta = MsgMetadata::new(None, "sender@example.org");
    meta.original_rcpts.insert(
        "real@example.com".to_string(),
        "alias@example.com".to_string(),
    );
    submit(
        &queue,
        meta,
        "sender@example.org",
        &["real@example.com", "r2@example.com"],
    )
    .await;

    {
        let bounce = bounce.clone();
        wait_until(move || bounce.attempts() >= 1).await;
    }
    {
        let dir = config.directory.clone();
        wait_until(move || spool_files(&dir).is_empty()).await;
    }

    assert_eq!(downstream.attempts(), 1, "no retry after permanent failure");
    let dsns = bounce.deliveries.lock();
    assert_eq!(dsns.len(), 1, "exactly one DSN");
    let dsn = &dsns[0];
    assert!(dsn.committed);
    assert!(dsn.is_dsn);
    assert_eq!(dsn.mail_from, "", "DSNs use the null reverse-path");
    assert_eq!(dsn.rcpts, vec!["sender@example.org"]);

    let header = String::from_utf8(dsn.header.clone()).unwrap();
    assert!(header.contains("multipart/report"), "{header}");
    assert!(header.contains("MAILER-DAEMON@example.com"), "{header}");

    let body = String::from_utf8(dsn.body.clone()).unwrap();
    assert!(body.contains("Reporting-MTA: dns; mail.example.com"), "{body}");
    assert!(
        body.contains("Original-Recipient: rfc822; alias@example.com"),
        "{body}"
    );
    assert!(
        body.contains("Final-Recipient: rfc822; real@example.com"),
        "{body}"
    );
    assert!(body.contains("Final-Recipient: rfc822; r2@example.com"), "{body}");
    assert!(body.contains("Action: failed"), "{body}");
    assert!(body.contains("Status: 5.1.1"), "{body}");
    assert!(body.contains("Diagnostic-Code: smtp; 550"), "{body}");
    queue.close();
}

#[tokio::test(start_paused = true)]
async fn s4_mixed_outcome_bounces_only_the_permanent_failure() {
    let config = queue_config("mixed");
    let downstream = MockTarget::new();
    let bounce = MockTarget::new();

    let mut plan = AttemptPlan::default();
    plan.rcpt_errors
        .insert("a@example.com".to_string(), ErrorKind::Temporary);
    plan.rcpt_errors
        .insert("b@example.com".to_string(), ErrorKind::Permanent);
    downstream.push_plan(plan);
    // Attempt 2: no planned errors, A succeeds.
    let queue = start_queue(&config, &downstream, &bounce);

    let meta = MsgMetadata::new(None, "sender@example.org");
    submit(
        &queue,
        meta,
        "sender@example.org",
        &["a@example.com", "b@example.com"],
    )
    .await;

    {
        let dir = config.directory.clone();
        wait_until(move || spool_files(&dir).is_empty()).await;
    }

    assert_eq!(downstream.attempts(), 2);
    assert!(downstream.committed().contains(&"a@example.com".to_string()));

    let dsns = bounce.deliveries.lock();
    assert_eq!(dsns.len(), 1);
    let body = String::from_utf8(dsns[0].body.clone()).unwrap();
    assert!(body.contains("Final-Recipient: rfc822; b@example.com"), "{body}");
    assert!(!body.contains("a@example.com"), "{body}");
    queue.close();
}

#[tokio::test(start_paused = true)]
async fn p7_no_dsn_for_null_sender_or_dsn() {
    let config = queue_config("nodsn");
    let downstream = MockTarget::new();
    let bounce = MockTarget::new();
    for _ in 0..2 {
        let mut plan = AttemptPlan::default();
        plan.rcpt_errors
            .insert("r1@example.com".to_string(), ErrorKind::Permanent);
        downstream.push_plan(plan);
    }
    let queue = start_queue(&config, &downstream, &bounce);

    // Null reverse-path: no DSN.
    let meta = MsgMetadata::new(None, "");
    submit(&queue, meta, "", &["r1@example.com"]).await;
    {
        let dir = config.directory.clone();
        wait_until(move || spool_files(&dir).is_empty()).await;
    }
    assert_eq!(bounce.attempts(), 0);

    // A queue-generated DSN that itself fails: no DSN-for-DSN.
    let mut meta = MsgMetadata::new(None, "sender@example.org");
    meta.dsn = true;
    submit(&queue, meta, "sender@example.org", &["r1@example.com"]).await;
    {
        let dir = config.directory.clone();
        wait_until(move || spool_files(&dir).is_empty()).await;
    }
    assert_eq!(bounce.attempts(), 0);
    queue.close();
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_become_permanent() {
    let mut config = queue_config("exhaust");
    config.max_tries = 2;
    let downstream = MockTarget::new();
    let bounce = MockTarget::new();
    for _ in 0..2 {
        let mut plan = AttemptPlan::default();
        plan.rcpt_errors
            .insert("r1@example.com".to_string(), ErrorKind::Temporary);
        downstream.push_plan(plan);
    }
    let queue = start_queue(&config, &downstream, &bounce);

    let meta = MsgMetadata::new(None, "sender@example.org");
    submit(&queue, meta, "sender@example.org", &["r1@example.com"]).await;

    {
        let bounce = bounce.clone();
        wait_until(move || bounce.attempts() >= 1).await;
    }
    assert_eq!(downstream.attempts(), 2);
    let dsns = bounce.deliveries.lock();
    let body = String::from_utf8(dsns[0].body.clone()).unwrap();
    assert!(body.contains("Final-Recipient: rfc822; r1@example.com"), "{body}");
    assert!(body.contains("Diagnostic-Code: smtp; 450"), "{body}");
    queue.close();
}
