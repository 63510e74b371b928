/*
 * SPDX-FileCopyrightText: 2024 Pelican Mail Project <dev@pelicanmail.org>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::Arc;

use async_trait::async_trait;
use common::{
    buffer::Buffer,
    error::{Error, Status},
};
use futures::stream::{FuturesUnordered, StreamExt};

use crate::core::{ConnState, MsgMetadata};

pub mod builtin;

/// Output of one policy check at one hook point.
#[derive(Default)]
pub struct CheckResult {
    /// SMTP-shaped rejection; sticky across a group.
    pub reject: Option<Error>,
    pub quarantine: bool,
    pub score: i32,
    /// Authentication-Results records (RFC 8601 method clauses).
    pub auth_results: Vec<String>,
    /// Header fields to prepend: (field name, value).
    pub headers: Vec<(String, String)>,
}

impl CheckResult {
    pub fn reject(err: Error) -> Self {
        CheckResult {
            reject: Some(err),
            ..Default::default()
        }
    }
}

/// What to do when a check reports a reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailAction {
    Ignore,
    Quarantine,
    Reject,
    Score(i32),
}

impl FailAction {
    /// Merges the action with the check's result. Identity when the check
    /// reported no reason.
    pub fn apply(&self, mut result: CheckResult) -> CheckResult {
        if result.reject.is_none() {
            return result;
        }
        match self {
            FailAction::Reject => result,
            FailAction::Quarantine => {
                result.reject = None;
                result.quarantine = true;
                result
            }
            FailAction::Score(delta) => {
                result.reject = None;
                result.score += delta;
                result
            }
            FailAction::Ignore => {
                result.reject = None;
                result
            }
        }
    }
}

/// A configured policy check. `state_for_msg` yields the per-message state
/// holding whatever the check accumulates across hook points.
pub trait Check: Send + Sync {
    fn name(&self) -> &'static str;
    fn state_for_msg(&self, meta: &MsgMetadata) -> Box<dyn CheckState>;
}

/// Per-message state of one check, invoked at up to four hook points.
#[async_trait]
pub trait CheckState: Send {
    async fn check_connection(&mut self, _conn: &ConnState) -> CheckResult {
        CheckResult::default()
    }

    async fn check_sender(&mut self, _mail_from: &str) -> CheckResult {
        CheckResult::default()
    }

    async fn check_rcpt(&mut self, _rcpt: &str) -> CheckResult {
        CheckResult::default()
    }

    async fn check_body(&mut self, _header: &[u8], _body: &dyn Buffer) -> CheckResult {
        CheckResult::default()
    }
}

/// A check together with its configured failure policy, as listed in a
/// pipeline rule.
#[derive(Clone)]
pub struct ConfiguredCheck {
    pub check: Arc<dyn Check>,
    pub fail: FailAction,
}

impl ConfiguredCheck {
    pub fn rejecting(check: Arc<dyn Check>) -> Self {
        ConfiguredCheck {
            check,
            fail: FailAction::Reject,
        }
    }
}

/// Merged outcome of running a group of checks at one hook point.
#[derive(Default)]
pub struct MergedResult {
    pub reject: Option<Error>,
    pub quarantine: bool,
    pub score: i32,
    pub auth_results: Vec<String>,
    pub headers: Vec<(String, String)>,
}

impl MergedResult {
    /// Merge rule: rejection is sticky, quarantine is OR, scores sum,
    /// headers and auth-results concatenate. Completion order is
    /// non-deterministic, so the concatenated lists are keyed by check name
    /// and sorted before use.
    fn absorb(&mut self, check_name: &str, result: CheckResult) {
        if self.reject.is_none() {
            self.reject = result.reject;
        }
        self.quarantine |= result.quarantine;
        self.score += result.score;
        for record in result.auth_results {
            self.auth_results.push(format!("{check_name}\u{0}{record}"));
        }
        for (field, value) in result.headers {
            self.headers
                .push((format!("{check_name}\u{0}{field}"), value));
        }
    }

    fn finish(mut self) -> MergedResult {
        self.auth_results.sort();
        self.auth_results = self
            .auth_results
            .into_iter()
            .map(strip_sort_key)
            .collect();
        self.headers.sort_by(|a, b| a.0.cmp(&b.0));
        self.headers = self
            .headers
            .into_iter()
            .map(|(field, value)| (strip_sort_key(field), value))
            .collect();
        self
    }

    pub fn merge(&mut self, other: MergedResult) {
        if self.reject.is_none() {
            self.reject = other.reject;
        }
        self.quarantine |= other.quarantine;
        self.score += other.score;
        self.auth_results.extend(other.auth_results);
        self.headers.extend(other.headers);
    }
}

fn strip_sort_key(tagged: String) -> String {
    match tagged.find('\u{0}') {
        Some(at) => tagged[at + 1..].to_string(),
        None => tagged,
    }
}

struct GroupEntry {
    name: &'static str,
    fail: FailAction,
    state: Box<dyn CheckState>,
}

/// Runs a set of per-message check states concurrently at each hook point
/// and merges their results deterministically.
pub struct CheckGroup {
    entries: Vec<GroupEntry>,
}

impl CheckGroup {
    pub fn for_msg(checks: &[ConfiguredCheck], meta: &MsgMetadata) -> Self {
        CheckGroup {
            entries: checks
                .iter()
                .map(|configured| GroupEntry {
                    name: configured.check.name(),
                    fail: configured.fail,
                    state: configured.check.state_for_msg(meta),
                })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub async fn connection(&mut self, conn: &ConnState) -> MergedResult {
        let labels = self.labels();
        let futures = self
            .entries
            .iter_mut()
            .enumerate()
            .map(|(index, entry)| async move { (index, entry.state.check_connection(conn).await) });
        Self::race(labels, futures).await
    }

    pub async fn sender(&mut self, mail_from: &str) -> MergedResult {
        let labels = self.labels();
        let futures = self
            .entries
            .iter_mut()
            .enumerate()
            .map(|(index, entry)| async move { (index, entry.state.check_sender(mail_from).await) });
        Self::race(labels, futures).await
    }

    pub async fn rcpt(&mut self, rcpt: &str) -> MergedResult {
        let labels = self.labels();
        let futures = self
            .entries
            .iter_mut()
            .enumerate()
            .map(|(index, entry)| async move { (index, entry.state.check_rcpt(rcpt).await) });
        Self::race(labels, futures).await
    }

    pub async fn body(&mut self, header: &[u8], body: &dyn Buffer) -> MergedResult {
        let labels = self.labels();
        let futures = self
            .entries
            .iter_mut()
            .enumerate()
            .map(|(index, entry)| async move { (index, entry.state.check_body(header, body).await) });
        Self::race(labels, futures).await
    }

    fn labels(&self) -> Vec<(&'static str, FailAction)> {
        self.entries
            .iter()
            .map(|entry| (entry.name, entry.fail))
            .collect()
    }

    /// Runs the per-check futures concurrently. As soon as one check's
    /// applied result carries a rejection, the remaining siblings are
    /// dropped; each cancelled check contributes a temporary error to the
    /// merge in its place.
    async fn race<F>(
        labels: Vec<(&'static str, FailAction)>,
        futures: impl IntoIterator<Item = F>,
    ) -> MergedResult
    where
        F: std::future::Future<Output = (usize, CheckResult)>,
    {
        let mut pending: FuturesUnordered<F> = futures.into_iter().collect();
        let mut completed: Vec<Option<CheckResult>> = labels.iter().map(|_| None).collect();
        while let Some((index, result)) = pending.next().await {
            let result = labels[index].1.apply(result);
            let rejected = result.reject.is_some();
            completed[index] = Some(result);
            if rejected {
                break;
            }
        }
        drop(pending);

        // Completed results merge first so the rejection that triggered the
        // cancellation wins over the synthesized cancellation errors.
        let mut merged = MergedResult::default();
        let mut cancelled = Vec::new();
        for ((name, fail), result) in labels.iter().zip(completed) {
            match result {
                Some(result) => merged.absorb(name, result),
                None => cancelled.push((*name, *fail)),
            }
        }
        for (name, fail) in cancelled {
            merged.absorb(
                name,
                fail.apply(CheckResult::reject(Error::TemporaryPolicy(Status::new(
                    451,
                    (4, 4, 5),
                    "Policy check cancelled",
                )))),
            );
        }
        merged.finish()
    }
}
