/*
 * SPDX-FileCopyrightText: 2024 Pelican Mail Project <dev@pelicanmail.org>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// An SMTP reply shape: code, enhanced status code, user-safe message.
///
/// Policy checks and delivery targets produce these; the session writes them
/// on the wire verbatim (transliterated when SMTPUTF8 was not negotiated) and
/// the queue persists them per recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: u16,
    pub enhanced: (u8, u16, u16),
    pub message: String,
}

impl Status {
    pub fn new(code: u16, enhanced: (u8, u16, u16), message: impl Into<String>) -> Self {
        Status {
            code,
            enhanced,
            message: message.into(),
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.code >= 500
    }

    /// Replaces every non-ASCII rune with '?' for sessions that did not
    /// negotiate SMTPUTF8.
    pub fn to_ascii(&self) -> Status {
        if self.message.is_ascii() {
            self.clone()
        } else {
            Status {
                code: self.code,
                enhanced: self.enhanced,
                message: self
                    .message
                    .chars()
                    .map(|c| if c.is_ascii() { c } else { '?' })
                    .collect(),
            }
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}.{}.{} {}",
            self.code, self.enhanced.0, self.enhanced.1, self.enhanced.2, self.message
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid address syntax: {0}")]
    AddressSyntax(String),

    #[error("invalid credentials")]
    AuthInvalid,

    #[error("unsupported authentication mechanism: {0}")]
    AuthUnsupportedMech(String),

    #[error("policy rejection: {0}")]
    Policy(Status),

    #[error("temporary policy failure: {0}")]
    TemporaryPolicy(Status),

    #[error("I/O failure")]
    InternalIo(#[from] std::io::Error),

    #[error("rate limited")]
    RateLimited,

    #[error("operation cancelled or timed out")]
    Cancelled,

    #[error("queue persistence failure: {0}")]
    QueuePersistence(String),

    #[error("message buffer exhausted")]
    BufferExhausted,

    #[error("possible routing loop detected")]
    RoutingLoop,

    #[error("no such recipient")]
    NoSuchRecipient,
}

impl Error {
    pub fn policy(code: u16, enhanced: (u8, u16, u16), message: impl Into<String>) -> Self {
        let status = Status::new(code, enhanced, message);
        if status.is_permanent() {
            Error::Policy(status)
        } else {
            Error::TemporaryPolicy(status)
        }
    }

    /// Maps any core error to exactly one SMTP reply.
    ///
    /// Errors carrying structured SMTP fields are honored verbatim; deadline
    /// and cancellation map to 451 4.4.5; everything else collapses to a
    /// generic 554 so internal detail never reaches the client. `utf8` is
    /// whether SMTPUTF8 was negotiated on this session.
    pub fn to_status(&self, utf8: bool) -> Status {
        let status = match self {
            Error::Policy(status) | Error::TemporaryPolicy(status) => status.clone(),
            Error::AddressSyntax(_) => Status::new(501, (5, 1, 3), "Invalid address syntax"),
            Error::AuthInvalid => Status::new(535, (5, 7, 8), "Invalid credentials"),
            Error::AuthUnsupportedMech(_) => {
                Status::new(504, (5, 5, 4), "Unsupported authentication mechanism")
            }
            Error::Cancelled => Status::new(451, (4, 4, 5), "Operation timed out, try again later"),
            Error::RateLimited => Status::new(451, (4, 7, 0), "Too many messages, try again later"),
            Error::BufferExhausted => Status::new(552, (5, 3, 4), "Message too big for system"),
            Error::RoutingLoop => Status::new(554, (5, 4, 6), "Too many Received headers"),
            Error::NoSuchRecipient => Status::new(550, (5, 1, 1), "No such recipient"),
            Error::InternalIo(_) | Error::QueuePersistence(_) => {
                Status::new(554, (5, 0, 0), "Internal server error")
            }
        };
        if utf8 {
            status
        } else {
            status.to_ascii()
        }
    }

    /// Temporary-vs-permanent split used by the queue: 4xx is temporary,
    /// 5xx permanent, anything without an SMTP annotation is temporary.
    pub fn is_permanent(&self) -> bool {
        match self {
            Error::Policy(status) | Error::TemporaryPolicy(status) => status.is_permanent(),
            _ => false,
        }
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::AddressSyntax(s) => Error::AddressSyntax(s.clone()),
            Error::AuthInvalid => Error::AuthInvalid,
            Error::AuthUnsupportedMech(s) => Error::AuthUnsupportedMech(s.clone()),
            Error::Policy(s) => Error::Policy(s.clone()),
            Error::TemporaryPolicy(s) => Error::TemporaryPolicy(s.clone()),
            Error::InternalIo(e) => {
                Error::InternalIo(std::io::Error::new(e.kind(), e.to_string()))
            }
            Error::RateLimited => Error::RateLimited,
            Error::Cancelled => Error::Cancelled,
            Error::QueuePersistence(s) => Error::QueuePersistence(s.clone()),
            Error::BufferExhausted => Error::BufferExhausted,
            Error::RoutingLoop => Error::RoutingLoop,
            Error::NoSuchRecipient => Error::NoSuchRecipient,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
