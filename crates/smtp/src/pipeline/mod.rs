/*
 * SPDX-FileCopyrightText: 2024 Pelican Mail Project <dev@pelicanmail.org>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::{net::IpAddr, sync::Arc, time::Duration};

use ahash::AHashMap;
use common::{
    address,
    buffer::Buffer,
    error::{Error, Result, Status},
};

use crate::{
    checks::{CheckGroup, ConfiguredCheck, MergedResult},
    core::{MsgMetadata, Protocol},
    delivery::{StatusCollector, Target},
};

pub mod modify;

use modify::Modifier;

/// Address predicate of a rule matcher.
#[derive(Clone)]
pub enum AddrPattern {
    /// Case-folded full-address equality.
    Exact(String),
    /// Case-folded domain equality.
    Domain(String),
    /// The null reverse-path.
    Null,
    Any,
}

impl AddrPattern {
    fn matches(&self, addr: &str) -> bool {
        match self {
            AddrPattern::Exact(pattern) => address::equal_fold(pattern, addr),
            AddrPattern::Domain(pattern) => {
                address::equal_fold(pattern, address::domain_part(addr))
            }
            AddrPattern::Null => addr.is_empty(),
            AddrPattern::Any => true,
        }
    }
}

/// Match predicate of one pipeline rule: every configured axis must match;
/// an empty axis matches everything.
#[derive(Clone, Default)]
pub struct Matcher {
    pub sources: Vec<AddrPattern>,
    pub destinations: Vec<AddrPattern>,
    pub client_ips: Vec<IpAddr>,
    pub auth_users: Vec<String>,
}

struct MatchCtx {
    mail_from: String,
    client_ip: Option<IpAddr>,
    auth_user: Option<String>,
}

impl Matcher {
    fn matches_common(&self, ctx: &MatchCtx) -> bool {
        (self.sources.is_empty()
            || self.sources.iter().any(|p| p.matches(&ctx.mail_from)))
            && (self.client_ips.is_empty()
                || ctx
                    .client_ip
                    .map_or(false, |ip| self.client_ips.contains(&ip)))
            && (self.auth_users.is_empty()
                || ctx
                    .auth_user
                    .as_deref()
                    .map_or(false, |user| {
                        self.auth_users.iter().any(|u| address::equal_fold(u, user))
                    }))
    }

    /// At the sender stage a rule gated on destinations is not yet
    /// evaluable and is entered per recipient later.
    fn matches_sender_stage(&self, ctx: &MatchCtx) -> bool {
        self.destinations.is_empty() && self.matches_common(ctx)
    }

    fn matches_rcpt_stage(&self, ctx: &MatchCtx, rcpt: &str) -> bool {
        self.matches_common(ctx)
            && (self.destinations.is_empty()
                || self.destinations.iter().any(|p| p.matches(rcpt)))
    }
}

pub enum RuleAction {
    Deliver(Vec<Arc<dyn Target>>),
    Subtree(Vec<Rule>),
}

/// One node of the declarative routing tree.
pub struct Rule {
    pub matcher: Matcher,
    pub checks: Vec<ConfiguredCheck>,
    pub modifiers: Vec<Arc<dyn Modifier>>,
    pub action: RuleAction,
    id: usize,
}

impl Rule {
    pub fn new(matcher: Matcher, action: RuleAction) -> Self {
        Rule {
            matcher,
            checks: Vec::new(),
            modifiers: Vec::new(),
            action,
            id: 0,
        }
    }

    pub fn with_checks(mut self, checks: Vec<ConfiguredCheck>) -> Self {
        self.checks = checks;
        self
    }

    pub fn with_modifiers(mut self, modifiers: Vec<Arc<dyn Modifier>>) -> Self {
        self.modifiers = modifiers;
        self
    }
}

/// The message pipeline: a rule tree evaluated per stage and per recipient,
/// aggregating recipients into one delivery per matched target.
pub struct Pipeline {
    pub hostname: String,
    rules: Vec<Rule>,
    default_destination: Vec<Arc<dyn Target>>,
    quarantine_destination: Option<Arc<dyn Target>>,
    /// Reject the message at the body stage when the summed check score
    /// reaches this threshold.
    reject_score: Option<i32>,
    rdns_timeout: Duration,
}

impl Pipeline {
    pub fn new(hostname: impl Into<String>, mut rules: Vec<Rule>) -> Self {
        let mut next_id = 0;
        number_rules(&mut rules, &mut next_id);
        Pipeline {
            hostname: hostname.into(),
            rules,
            default_destination: Vec::new(),
            quarantine_destination: None,
            reject_score: None,
            rdns_timeout: Duration::from_secs(1),
        }
    }

    pub fn with_default_destination(mut self, targets: Vec<Arc<dyn Target>>) -> Self {
        self.default_destination = targets;
        self
    }

    pub fn with_quarantine_destination(mut self, target: Arc<dyn Target>) -> Self {
        self.quarantine_destination = Some(target);
        self
    }

    pub fn with_reject_score(mut self, threshold: i32) -> Self {
        self.reject_score = Some(threshold);
        self
    }

    pub fn with_rdns_timeout(mut self, timeout: Duration) -> Self {
        self.rdns_timeout = timeout;
        self
    }

    /// Begins a message transaction at MAIL FROM.
    pub fn start(self: &Arc<Self>, meta: MsgMetadata) -> MsgTransaction {
        let mail_from = meta.mail_from.clone();
        MsgTransaction {
            pipeline: self.clone(),
            meta,
            mail_from,
            node_states: AHashMap::new(),
            acc: MergedResult::default(),
            deliveries: Vec::new(),
            accepted: Vec::new(),
        }
    }
}

fn number_rules(rules: &mut [Rule], next_id: &mut usize) {
    for rule in rules {
        rule.id = *next_id;
        *next_id += 1;
        if let RuleAction::Subtree(children) = &mut rule.action {
            number_rules(children, next_id);
        }
    }
}

struct NodeState {
    group: CheckGroup,
    conn_run: bool,
    sender_run: bool,
}

struct TargetDelivery {
    target: Arc<dyn Target>,
    delivery: Box<dyn crate::delivery::Delivery>,
    rcpts: Vec<String>,
}

/// Per-recipient delivery outcome of the body stage, in acceptance order.
/// `None` is success.
pub type DeliveryOutcome = Vec<(String, Option<Error>)>;

/// Pipeline state for one message, from MAIL FROM to commit or abort.
pub struct MsgTransaction {
    pipeline: Arc<Pipeline>,
    pub meta: MsgMetadata,
    /// Possibly rewritten envelope sender.
    pub mail_from: String,
    node_states: AHashMap<usize, NodeState>,
    acc: MergedResult,
    deliveries: Vec<TargetDelivery>,
    accepted: Vec<String>,
}

impl MsgTransaction {
    fn match_ctx(&self) -> MatchCtx {
        let conn = self.meta.conn.as_ref();
        MatchCtx {
            mail_from: self.mail_from.clone(),
            client_ip: conn.map(|c| c.remote_addr.ip()),
            auth_user: conn.and_then(|c| c.authenticated()),
        }
    }

    /// Runs the connection- and sender-stage checks and sender modifiers
    /// along the matching path of the tree.
    pub async fn run_sender(&mut self) -> Result<()> {
        let pipeline = self.pipeline.clone();
        let mut level: &[Rule] = &pipeline.rules;
        loop {
            let ctx = self.match_ctx();
            let Some(rule) = level
                .iter()
                .find(|rule| rule.matcher.matches_sender_stage(&ctx))
            else {
                break;
            };
            self.enter_node(rule).await?;
            for modifier in &rule.modifiers {
                self.mail_from = modifier.rewrite_sender(&self.mail_from).await?;
            }
            match &rule.action {
                RuleAction::Subtree(children) => level = children,
                RuleAction::Deliver(_) => break,
            }
        }
        Ok(())
    }

    /// Routes one recipient through the tree: runs recipient-stage checks
    /// and modifiers, then attaches the recipient to the delivery of every
    /// target of the selected rule. Returns the (possibly rewritten)
    /// recipient that was accepted.
    pub async fn add_rcpt(&mut self, rcpt: &str) -> Result<String> {
        let pipeline = self.pipeline.clone();
        let original = rcpt.to_string();
        let mut rcpt = rcpt.to_string();
        let mut level: &[Rule] = &pipeline.rules;
        let mut selected: Option<&[Arc<dyn Target>]> = None;
        loop {
            let ctx = self.match_ctx();
            let Some(rule) = level
                .iter()
                .find(|rule| rule.matcher.matches_rcpt_stage(&ctx, &rcpt))
            else {
                break;
            };
            self.enter_node(rule).await?;
            let merged = self
                .node_states
                .get_mut(&rule.id)
                .expect("node entered above")
                .group
                .rcpt(&rcpt)
                .await;
            self.absorb(merged)?;
            for modifier in &rule.modifiers {
                let rewritten = modifier.rewrite_rcpt(&rcpt).await?;
                if rewritten != rcpt {
                    let first_form = self
                        .meta
                        .original_rcpts
                        .remove(&rcpt)
                        .unwrap_or_else(|| original.clone());
                    self.meta.original_rcpts.insert(rewritten.clone(), first_form);
                    rcpt = rewritten;
                }
            }
            match &rule.action {
                RuleAction::Subtree(children) => level = children,
                RuleAction::Deliver(targets) => {
                    selected = Some(targets);
                    break;
                }
            }
        }

        let targets = match selected {
            Some(targets) => targets,
            None if !pipeline.default_destination.is_empty() => &pipeline.default_destination,
            None => return Err(Error::NoSuchRecipient),
        };
        for target in targets {
            self.deliver_rcpt(target.clone(), &rcpt).await?;
        }
        self.accepted.push(rcpt.clone());
        Ok(rcpt)
    }

    /// Body stage: run body checks, enforce the score threshold, prepend the
    /// trace and check headers, then fan the message out to every target
    /// delivery and commit or abort each one.
    pub async fn run_body(
        &mut self,
        header: &[u8],
        body: Arc<dyn Buffer>,
    ) -> Result<DeliveryOutcome> {
        let pipeline = self.pipeline.clone();

        let mut node_ids: Vec<usize> = self.node_states.keys().copied().collect();
        node_ids.sort_unstable();
        for id in node_ids {
            let merged = {
                let state = self.node_states.get_mut(&id).expect("known node");
                state.group.body(header, body.as_ref()).await
            };
            self.absorb(merged)?;
        }

        if let Some(threshold) = pipeline.reject_score {
            if self.acc.score >= threshold {
                return Err(Error::Policy(Status::new(
                    550,
                    (5, 7, 1),
                    "Message refused due to content score",
                )));
            }
        }

        // Trace headers read the reverse-DNS future; give the background
        // lookup its deadline before falling back to "unknown".
        if let Some(conn) = &self.meta.conn {
            let _ = conn.rdns.get_timeout(pipeline.rdns_timeout).await;
        }
        let header = self.assemble_header(header);

        if self.acc.quarantine {
            if let Some(target) = &pipeline.quarantine_destination {
                for entry in &mut self.deliveries {
                    let _ = entry.delivery.abort().await;
                }
                self.deliveries.clear();
                let mut delivery = target.start(&self.meta, &self.mail_from).await?;
                for rcpt in &self.accepted {
                    delivery.add_rcpt(rcpt).await?;
                }
                self.deliveries.push(TargetDelivery {
                    target: target.clone(),
                    delivery,
                    rcpts: self.accepted.clone(),
                });
            } else {
                tracing::warn!(
                    context = "pipeline",
                    event = "quarantine-unrouted",
                    id = self.meta.id.as_str(),
                    "message flagged for quarantine but no quarantine destination is set"
                );
            }
        }

        let collector = StatusCollector::new();
        for entry in &mut self.deliveries {
            if entry.delivery.supports_partial() {
                entry
                    .delivery
                    .body_non_atomic(&collector, &entry.rcpts, &header, body.clone())
                    .await;
                let all_failed = entry
                    .rcpts
                    .iter()
                    .all(|rcpt| collector.peek_failed(rcpt));
                if all_failed {
                    let _ = entry.delivery.abort().await;
                } else if let Err(err) = entry.delivery.commit().await {
                    for rcpt in &entry.rcpts {
                        if !collector.peek_failed(rcpt) {
                            collector.set_status(rcpt, err.clone());
                        }
                    }
                }
            } else {
                match entry.delivery.body(&header, body.clone()).await {
                    Ok(()) => {
                        if let Err(err) = entry.delivery.commit().await {
                            for rcpt in &entry.rcpts {
                                collector.set_status(rcpt, err.clone());
                            }
                        }
                    }
                    Err(err) => {
                        let _ = entry.delivery.abort().await;
                        for rcpt in &entry.rcpts {
                            collector.set_status(rcpt, err.clone());
                        }
                    }
                }
            }
        }
        self.deliveries.clear();

        Ok(self
            .accepted
            .iter()
            .map(|rcpt| (rcpt.clone(), collector.take(rcpt)))
            .collect())
    }

    /// Aborts any in-progress target deliveries; safe after any prior step.
    pub async fn abort(&mut self) {
        for entry in &mut self.deliveries {
            let _ = entry.delivery.abort().await;
        }
        self.deliveries.clear();
    }

    pub fn quarantined(&self) -> bool {
        self.acc.quarantine
    }

    pub fn accepted_rcpts(&self) -> &[String] {
        &self.accepted
    }

    async fn enter_node(&mut self, rule: &Rule) -> Result<()> {
        if !self.node_states.contains_key(&rule.id) {
            self.node_states.insert(
                rule.id,
                NodeState {
                    group: CheckGroup::for_msg(&rule.checks, &self.meta),
                    conn_run: false,
                    sender_run: false,
                },
            );
            for modifier in &rule.modifiers {
                self.acc.headers.extend(modifier.headers(&self.meta));
            }
        }
        let conn = self.meta.conn.clone();
        let mail_from = self.mail_from.clone();
        let mut merged = MergedResult::default();
        {
            let state = self.node_states.get_mut(&rule.id).expect("inserted above");
            if !state.conn_run {
                state.conn_run = true;
                if let Some(conn) = &conn {
                    merged.merge(state.group.connection(conn).await);
                }
            }
            if !state.sender_run {
                state.sender_run = true;
                merged.merge(state.group.sender(&mail_from).await);
            }
        }
        self.absorb(merged)
    }

    fn absorb(&mut self, merged: MergedResult) -> Result<()> {
        self.acc.merge(merged);
        match &self.acc.reject {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn deliver_rcpt(&mut self, target: Arc<dyn Target>, rcpt: &str) -> Result<()> {
        let index = match self
            .deliveries
            .iter()
            .position(|entry| Arc::ptr_eq(&entry.target, &target))
        {
            Some(index) => index,
            None => {
                let delivery = target.start(&self.meta, &self.mail_from).await?;
                self.deliveries.push(TargetDelivery {
                    target,
                    delivery,
                    rcpts: Vec::new(),
                });
                self.deliveries.len() - 1
            }
        };
        let entry = &mut self.deliveries[index];
        entry.delivery.add_rcpt(rcpt).await?;
        entry.rcpts.push(rcpt.to_string());
        Ok(())
    }

    /// Prepends, in order: the Received trace header, the accumulated
    /// Authentication-Results, and the header fields contributed by checks
    /// and modifiers.
    fn assemble_header(&self, original: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(original.len() + 256);
        out.extend_from_slice(self.received_header().as_bytes());
        if !self.acc.auth_results.is_empty() {
            out.extend_from_slice(
                format!(
                    "Authentication-Results: {}; {}\r\n",
                    self.pipeline.hostname,
                    self.acc.auth_results.join("; ")
                )
                .as_bytes(),
            );
        }
        for (field, value) in &self.acc.headers {
            out.extend_from_slice(format!("{field}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(original);
        out
    }

    fn received_header(&self) -> String {
        let mut line = String::with_capacity(192);
        line.push_str("Received: from ");
        let conn = self.meta.conn.as_deref();
        let helo = conn
            .and_then(|c| c.helo.read().clone())
            .unwrap_or_else(|| "unknown".to_string());
        line.push_str(&helo);
        if !self.meta.dont_trace_sender {
            if let Some(conn) = conn {
                let rdns = conn
                    .rdns
                    .peek()
                    .flatten()
                    .unwrap_or_else(|| "unknown".to_string());
                line.push_str(&format!(" ({} [{}])", rdns, conn.remote_addr.ip()));
            }
        }
        let proto = conn
            .map(|c| *c.proto.read())
            .unwrap_or(Protocol::Esmtp)
            .label(self.meta.opts.utf8);
        line.push_str(&format!(
            " by {} (envelope-sender <{}>) with {} id {}; {}\r\n",
            self.pipeline.hostname,
            self.mail_from,
            proto,
            self.meta.id,
            chrono::Utc::now().to_rfc2822()
        ));
        line
    }
}
