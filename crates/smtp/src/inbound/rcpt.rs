/*
 * SPDX-FileCopyrightText: 2024 Pelican Mail Project <dev@pelicanmail.org>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::io;

use common::address;
use smtp_proto::RcptTo;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::core::Session;

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Session<T> {
    /// Handles RCPT TO. Returns false when the connection should close
    /// (too many refused recipients, a dictionary-attack guard).
    pub async fn handle_rcpt_to(&mut self, to: RcptTo<String>) -> io::Result<bool> {
        if self.data.transaction.is_none() {
            self.write(b"503 5.5.1 MAIL is required first\r\n").await?;
            return Ok(true);
        }

        if let Some(err) = self.data.deferred_error.clone() {
            self.write_error(&err).await?;
            return self.count_rcpt_error().await;
        }

        if self.data.rcpt_to.len() >= self.core.config.session.max_recipients {
            self.write(b"452 4.5.3 Too many recipients\r\n").await?;
            return Ok(true);
        }

        let utf8 = self.msg_utf8();
        if to.address.is_empty() {
            self.write(b"501 5.1.3 Missing recipient address\r\n").await?;
            return self.count_rcpt_error().await;
        }
        if !address::is_ascii(&to.address) && !utf8 {
            self.write(b"553 5.6.7 SMTPUTF8 is required to send to this address\r\n")
                .await?;
            return self.count_rcpt_error().await;
        }
        let rcpt = match if utf8 {
            address::clean_domain_utf8(&to.address)
        } else {
            address::clean_domain(&to.address)
        } {
            Ok(rcpt) => rcpt,
            Err(err) => {
                self.write_error(&err).await?;
                return self.count_rcpt_error().await;
            }
        };

        let domain = address::domain_part(&rcpt).to_string();
        if let Err(err) = self.core.limits.take_dest(&domain).await {
            self.write_error(&err).await?;
            return Ok(true);
        }

        let tx = self.data.transaction.as_mut().expect("checked above");
        match tx.add_rcpt(&rcpt).await {
            Ok(accepted) => {
                let id = tx.meta.id.clone();
                self.data.dest_tokens.push(domain);
                tracing::info!(
                    parent: &self.span,
                    context = "smtp",
                    event = "rcpt-to",
                    id = id.as_str(),
                    rcpt = accepted.as_str(),
                );
                self.data.rcpt_to.push(accepted);
                self.write(b"250 2.1.5 OK\r\n").await?;
                Ok(true)
            }
            Err(err) => {
                self.core.limits.release_dest(&domain);
                self.write_error(&err).await?;
                self.count_rcpt_error().await
            }
        }
    }

    async fn count_rcpt_error(&mut self) -> io::Result<bool> {
        self.data.rcpt_errors += 1;
        if self.data.rcpt_errors >= self.core.config.session.max_errors {
            self.write(b"421 4.7.0 Too many failed recipients, closing connection\r\n")
                .await?;
            Ok(false)
        } else {
            Ok(true)
        }
    }
}
