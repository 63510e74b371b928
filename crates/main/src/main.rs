/*
 * SPDX-FileCopyrightText: 2024 Pelican Mail Project <dev@pelicanmail.org>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::{sync::Arc, time::Duration};

use common::limiter::{group::GroupConfig, LimitSpec};
use smtp::{
    config::ServerConfig,
    core::{rdns, Core, Session},
    pipeline::Pipeline,
    queue::{Queue, QueueTarget},
    targets::MaildirTarget,
};
use tokio::net::TcpListener;

/// Minimal assembly of the message-processing core: one ESMTP listener, a
/// maildir downstream behind the outbound queue. The full declarative
/// configuration loader lives in its own crate and produces the same
/// `ServerConfig`/`Pipeline` values built by hand here.
#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let hostname = std::env::var("PELICAN_HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    let listen = std::env::var("PELICAN_LISTEN").unwrap_or_else(|_| "127.0.0.1:2525".to_string());
    let spool_dir = std::env::var("PELICAN_SPOOL").unwrap_or_else(|_| "spool".to_string());
    let maildir = std::env::var("PELICAN_MAILDIR").unwrap_or_else(|_| "maildir".to_string());

    let mut config = ServerConfig {
        hostname: hostname.clone(),
        autogen_msg_domain: hostname.clone(),
        ..Default::default()
    };
    config.queue.directory = spool_dir.into();
    config.limits = GroupConfig {
        global: vec![LimitSpec::Concurrency { max: 256 }],
        per_ip: vec![LimitSpec::Rate {
            burst: 20,
            interval: Duration::from_secs(60),
        }],
        ..Default::default()
    };

    let limits = Arc::new(config.limits.clone().build());
    let downstream = Arc::new(MaildirTarget::new(maildir));

    // Bounces route straight back into local delivery.
    let bounce_pipeline: Arc<dyn smtp::delivery::Target> = downstream.clone();
    let queue = Queue::start(
        config.queue.clone(),
        hostname.clone(),
        hostname.clone(),
        downstream,
        Some(bounce_pipeline),
        Some(limits.clone()),
    )
    .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))?;

    let pipeline = Arc::new(
        Pipeline::new(hostname.clone(), Vec::new())
            .with_default_destination(vec![Arc::new(QueueTarget(queue.clone()))]),
    );

    let core = Arc::new(Core {
        config,
        pipeline,
        limits,
        sasl: None,
        rdns: rdns::DnsResolver::system()
            .map(|resolver| -> Arc<dyn rdns::RdnsResolver> { Arc::new(resolver) })
            .unwrap_or_else(|_| Arc::new(rdns::NullResolver)),
        preparer: None,
    });

    let listener = TcpListener::bind(&listen).await?;
    tracing::info!(
        context = "server",
        event = "listening",
        addr = listen.as_str(),
        hostname = hostname.as_str(),
    );

    loop {
        let (stream, remote_addr) = listener.accept().await?;
        let local_addr = stream.local_addr()?;
        let core = core.clone();
        tokio::spawn(async move {
            Session::new(core, stream, remote_addr, local_addr)
                .handle()
                .await;
        });
    }
}
