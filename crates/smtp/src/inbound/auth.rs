/*
 * SPDX-FileCopyrightText: 2024 Pelican Mail Project <dev@pelicanmail.org>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::io;

use base64::{engine::general_purpose::STANDARD, Engine};
use common::auth::SaslStep;
use smtp_proto::request::receiver::LineReceiver;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::core::Session;

/// Where the AUTH exchange goes after one step.
pub enum AuthFlow {
    /// Awaiting another base64 line from the client.
    Continue(LineReceiver<u64>),
    Done,
    Close,
}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Session<T> {
    pub async fn handle_auth(
        &mut self,
        mechanism: u64,
        initial_response: String,
    ) -> io::Result<AuthFlow> {
        if self.conn.authenticated().is_some() {
            self.write(b"503 5.5.1 Already authenticated\r\n").await?;
            return Ok(AuthFlow::Done);
        }
        if self.data.transaction.is_some() {
            self.write(b"503 5.5.1 AUTH not permitted during a transaction\r\n")
                .await?;
            return Ok(AuthFlow::Done);
        }
        let Some(sasl) = self.core.sasl.clone() else {
            self.write(b"502 5.5.1 Authentication not available\r\n")
                .await?;
            return Ok(AuthFlow::Done);
        };
        if !self.conn.is_tls() && !self.core.config.session.insecure_auth {
            self.write(
                b"538 5.7.11 Encryption required for requested authentication mechanism\r\n",
            )
            .await?;
            return Ok(AuthFlow::Done);
        }

        let session = match sasl.create_sasl(mechanism) {
            Ok(session) => session,
            Err(err) => {
                self.write_error(&err).await?;
                return Ok(AuthFlow::Done);
            }
        };
        self.data.sasl = Some(session);

        if initial_response.is_empty() {
            let challenge = self
                .data
                .sasl
                .as_ref()
                .map(|s| s.initial_challenge())
                .unwrap_or_default();
            self.write(format!("334 {}\r\n", STANDARD.encode(challenge)).as_bytes())
                .await?;
            return Ok(AuthFlow::Continue(LineReceiver::new(mechanism)));
        }

        // An initial response of "=" stands for an empty one.
        let decoded = if initial_response == "=" {
            Vec::new()
        } else {
            match STANDARD.decode(initial_response.as_bytes()) {
                Ok(decoded) => decoded,
                Err(_) => {
                    self.data.sasl = None;
                    self.write(b"501 5.5.2 Invalid base64 encoding\r\n").await?;
                    return Ok(AuthFlow::Done);
                }
            }
        };
        self.sasl_step(mechanism, decoded).await
    }

    pub async fn handle_sasl_response(&mut self, line: Vec<u8>) -> io::Result<AuthFlow> {
        let line = line
            .strip_suffix(b"\r\n")
            .or_else(|| line.strip_suffix(b"\n"))
            .unwrap_or(&line)
            .to_vec();
        if line == b"*" {
            self.data.sasl = None;
            self.write(b"501 5.7.0 Authentication cancelled\r\n").await?;
            return Ok(AuthFlow::Done);
        }
        let decoded = match STANDARD.decode(&line) {
            Ok(decoded) => decoded,
            Err(_) => {
                self.data.sasl = None;
                self.write(b"501 5.5.2 Invalid base64 encoding\r\n").await?;
                return Ok(AuthFlow::Done);
            }
        };
        self.sasl_step(0, decoded).await
    }

    async fn sasl_step(&mut self, mechanism: u64, response: Vec<u8>) -> io::Result<AuthFlow> {
        let Some(mut session) = self.data.sasl.take() else {
            self.write(b"503 5.5.1 No authentication in progress\r\n")
                .await?;
            return Ok(AuthFlow::Done);
        };
        match session.respond(&response).await {
            Ok(SaslStep::Authenticated(identity)) => {
                tracing::info!(
                    parent: &self.span,
                    context = "auth",
                    event = "authenticated",
                    identity = identity.as_str(),
                );
                *self.conn.auth_user.write() = Some(identity);
                self.data.auth_errors = 0;
                self.write(b"235 2.7.0 Authentication succeeded\r\n").await?;
                Ok(AuthFlow::Done)
            }
            Ok(SaslStep::Challenge(challenge)) => {
                self.data.sasl = Some(session);
                self.write(format!("334 {}\r\n", STANDARD.encode(challenge)).as_bytes())
                    .await?;
                Ok(AuthFlow::Continue(LineReceiver::new(mechanism)))
            }
            Err(err) => {
                self.data.auth_errors += 1;
                tracing::info!(
                    parent: &self.span,
                    context = "auth",
                    event = "failed",
                    attempt = self.data.auth_errors,
                );
                if self.data.auth_errors >= self.core.config.session.max_errors {
                    self.write(b"421 4.7.0 Too many authentication failures\r\n")
                        .await?;
                    return Ok(AuthFlow::Close);
                }
                self.write_error(&err).await?;
                Ok(AuthFlow::Done)
            }
        }
    }
}
