/*
 * SPDX-FileCopyrightText: 2024 Pelican Mail Project <dev@pelicanmail.org>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::io;

use common::address;
use smtp_proto::{MailFrom, MAIL_BODY_8BITMIME, MAIL_REQUIRETLS, MAIL_SMTPUTF8};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::core::{MsgMetadata, Session, SmtpOptions};

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Session<T> {
    pub async fn handle_mail_from(&mut self, from: MailFrom<String>) -> io::Result<()> {
        if self.conn.helo.read().is_none() {
            return self.write(b"503 5.5.1 Polite people say EHLO first\r\n").await;
        }
        if self.data.transaction.is_some() {
            return self.write(b"503 5.5.1 Nested MAIL command\r\n").await;
        }
        if self.core.config.session.submission && self.conn.authenticated().is_none() {
            return self.write(b"530 5.7.0 Authentication required\r\n").await;
        }

        let opts = SmtpOptions {
            utf8: from.flags & MAIL_SMTPUTF8 != 0,
            requiretls: from.flags & MAIL_REQUIRETLS != 0,
            body_8bit: from.flags & MAIL_BODY_8BITMIME != 0,
            size_hint: (from.size > 0).then_some(from.size as u64),
        };
        if opts.requiretls && !self.conn.is_tls() {
            return self
                .write(b"530 5.7.10 REQUIRETLS needs a TLS connection\r\n")
                .await;
        }
        if let Some(size) = opts.size_hint {
            if size > self.core.config.session.max_message_size as u64 {
                return self
                    .write(b"552 5.3.4 Message exceeds maximum allowed size\r\n")
                    .await;
            }
        }

        // The null reverse-path is valid; anything else is split, gated on
        // SMTPUTF8 for non-ASCII, and its domain canonicalized.
        let mail_from = if from.address.is_empty() {
            String::new()
        } else {
            if !address::is_ascii(&from.address) && !opts.utf8 {
                return self
                    .write(b"553 5.6.7 SMTPUTF8 is required to send this address\r\n")
                    .await;
            }
            let cleaned = if opts.utf8 {
                address::clean_domain_utf8(&from.address)
            } else {
                address::clean_domain(&from.address)
            };
            match cleaned {
                Ok(cleaned) => cleaned,
                Err(err) => return self.write_error(&err).await,
            }
        };

        let source_domain = address::domain_part(&mail_from).to_string();
        let ip = self.conn.remote_addr.ip();
        if let Err(err) = self.core.limits.take_msg(ip, &source_domain).await {
            return self.write_error(&err).await;
        }
        self.data.msg_token = Some((ip, source_domain));

        let mut meta = MsgMetadata::new(Some(self.conn.clone()), mail_from);
        meta.opts = opts;
        let id = meta.id.clone();
        tracing::info!(
            parent: &self.span,
            context = "smtp",
            event = "mail-from",
            id = id.as_str(),
            from = meta.mail_from.as_str(),
        );

        let mut tx = self.core.pipeline.start(meta);
        match tx.run_sender().await {
            Ok(()) => {
                self.data.transaction = Some(tx);
                self.write(b"250 2.1.0 OK\r\n").await
            }
            Err(err) if self.core.config.session.defer_sender_reject => {
                // Deferred rejection: accept now, replay the error on every
                // RCPT until the client resets.
                self.data.deferred_error = Some(err);
                self.data.transaction = Some(tx);
                self.write(b"250 2.1.0 OK\r\n").await
            }
            Err(err) => {
                tx.abort().await;
                if let Some((ip, domain)) = self.data.msg_token.take() {
                    self.core.limits.release_msg(ip, &domain);
                }
                self.write_error(&err).await
            }
        }
    }
}
