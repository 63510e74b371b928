/*
 * SPDX-FileCopyrightText: 2024 Pelican Mail Project <dev@pelicanmail.org>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use chrono::{DateTime, Utc};
use common::error::{Error, Result, Status};
use mail_parser::{Address, HeaderValue, MessageParser};

use crate::core::MsgMetadata;

/// Message preparer for submission endpoints: validates the header block a
/// client handed us and fills in what an MUA may legitimately omit, before
/// the body reaches any target.
pub struct SubmissionPrepare {
    hostname: String,
    fixed_now: Option<DateTime<Utc>>,
}

impl SubmissionPrepare {
    pub fn new(hostname: impl Into<String>) -> Self {
        SubmissionPrepare {
            hostname: hostname.into(),
            fixed_now: None,
        }
    }

    /// Pins the clock for deterministic Date synthesis in tests.
    #[cfg(any(test, feature = "test_mode"))]
    pub fn with_fixed_time(mut self, now: DateTime<Utc>) -> Self {
        self.fixed_now = Some(now);
        self
    }

    fn now(&self) -> DateTime<Utc> {
        self.fixed_now.unwrap_or_else(Utc::now)
    }

    /// Validates and fixes up a header block, returning the block to use in
    /// its place. Also marks the message so trace headers do not publish
    /// the submitting client's address.
    pub fn prepare(&self, meta: &mut MsgMetadata, header: &[u8]) -> Result<Vec<u8>> {
        let parsed = MessageParser::default()
            .parse(header)
            .ok_or_else(|| invalid("Malformed message header"))?;

        let from_count = match parsed.header("From") {
            Some(HeaderValue::Address(Address::List(list))) => list.len(),
            Some(HeaderValue::Address(Address::Group(groups))) => {
                groups.iter().map(|group| group.addresses.len()).sum()
            }
            _ => return Err(invalid("Message does not contain a valid From header")),
        };
        if from_count == 0 {
            return Err(invalid("Message does not contain a valid From header"));
        }
        if from_count > 1 && !matches!(parsed.header("Sender"), Some(HeaderValue::Address(_))) {
            return Err(invalid(
                "Message with multiple From addresses requires a Sender header",
            ));
        }

        for field in ["Sender", "To", "Cc", "Bcc", "Reply-To"] {
            if let Some(value) = parsed.header(field) {
                if !matches!(value, HeaderValue::Address(_)) {
                    return Err(invalid(format!("Malformed {field} header")));
                }
            }
        }

        let mut prepend = String::new();
        if parsed.header("Message-ID").is_none() {
            prepend.push_str(&format!(
                "Message-ID: <{}@{}>\r\n",
                uuid::Uuid::new_v4(),
                self.hostname
            ));
        }
        match parsed.header("Date") {
            None => {
                prepend.push_str(&format!("Date: {}\r\n", self.now().to_rfc2822()));
            }
            Some(HeaderValue::DateTime(_)) => {}
            Some(_) => return Err(invalid("Malformed Date header")),
        }

        meta.dont_trace_sender = true;

        if prepend.is_empty() {
            Ok(header.to_vec())
        } else {
            let mut out = Vec::with_capacity(prepend.len() + header.len());
            out.extend_from_slice(prepend.as_bytes());
            out.extend_from_slice(header);
            Ok(out)
        }
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::Policy(Status::new(554, (5, 6, 0), message))
}
