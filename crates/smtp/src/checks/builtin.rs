/*
 * SPDX-FileCopyrightText: 2024 Pelican Mail Project <dev@pelicanmail.org>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::time::Duration;

use async_trait::async_trait;
use common::error::{Error, Status};

use crate::core::{ConnState, MsgMetadata};

use super::{Check, CheckResult, CheckState};

/// Rejects mail from unauthenticated sessions.
pub struct RequireAuth;

impl Check for RequireAuth {
    fn name(&self) -> &'static str {
        "require_auth"
    }

    fn state_for_msg(&self, _meta: &MsgMetadata) -> Box<dyn CheckState> {
        Box::new(RequireAuthState)
    }
}

struct RequireAuthState;

#[async_trait]
impl CheckState for RequireAuthState {
    async fn check_connection(&mut self, conn: &ConnState) -> CheckResult {
        if conn.authenticated().is_some() {
            CheckResult::default()
        } else {
            CheckResult::reject(Error::Policy(Status::new(
                530,
                (5, 7, 0),
                "Authentication required",
            )))
        }
    }
}

/// Rejects mail on plaintext connections.
pub struct RequireTls;

impl Check for RequireTls {
    fn name(&self) -> &'static str {
        "require_tls"
    }

    fn state_for_msg(&self, _meta: &MsgMetadata) -> Box<dyn CheckState> {
        Box::new(RequireTlsState)
    }
}

struct RequireTlsState;

#[async_trait]
impl CheckState for RequireTlsState {
    async fn check_connection(&mut self, conn: &ConnState) -> CheckResult {
        if conn.is_tls() {
            CheckResult::default()
        } else {
            CheckResult::reject(Error::Policy(Status::new(
                530,
                (5, 7, 10),
                "TLS required",
            )))
        }
    }
}

/// Rejects clients whose IP has no PTR record. Reads the session's
/// reverse-DNS future, blocking up to the configured deadline; a lookup that
/// does not finish in time is a temporary failure.
pub struct RequireRdns {
    pub timeout: Duration,
}

impl Check for RequireRdns {
    fn name(&self) -> &'static str {
        "require_rdns"
    }

    fn state_for_msg(&self, _meta: &MsgMetadata) -> Box<dyn CheckState> {
        Box::new(RequireRdnsState {
            timeout: self.timeout,
        })
    }
}

struct RequireRdnsState {
    timeout: Duration,
}

#[async_trait]
impl CheckState for RequireRdnsState {
    async fn check_connection(&mut self, conn: &ConnState) -> CheckResult {
        match conn.rdns.get_timeout(self.timeout).await {
            Ok(Some(_)) => CheckResult::default(),
            Ok(None) => CheckResult::reject(Error::Policy(Status::new(
                550,
                (5, 7, 25),
                "Client IP has no PTR record",
            ))),
            Err(_) => CheckResult::reject(Error::TemporaryPolicy(Status::new(
                450,
                (4, 7, 25),
                "PTR lookup did not complete, try again later",
            ))),
        }
    }
}
