/*
 * SPDX-FileCopyrightText: 2024 Pelican Mail Project <dev@pelicanmail.org>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::{fmt::Write, io};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::core::Session;

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Session<T> {
    pub async fn handle_ehlo(&mut self, host: String, extended: bool) -> io::Result<()> {
        if host.is_empty() {
            return self.write(b"501 5.5.2 Missing hostname\r\n").await;
        }

        // A new EHLO drops any transaction in progress.
        self.reset_transaction().await;
        *self.conn.helo.write() = Some(host.clone());

        let config = &self.core.config.session;
        let hostname = self.core.config.hostname.clone();
        if !extended {
            return self
                .write(format!("250 {hostname} Hello {host}\r\n").as_bytes())
                .await;
        }

        let mut response = String::with_capacity(192);
        let _ = write!(
            response,
            "250-{} Hello {} [{}]\r\n",
            hostname,
            host,
            self.conn.remote_addr.ip()
        );
        let _ = write!(response, "250-SIZE {}\r\n", config.max_message_size);
        response.push_str("250-8BITMIME\r\n250-PIPELINING\r\n250-SMTPUTF8\r\n250-REQUIRETLS\r\n");
        if config.starttls && !self.conn.is_tls() {
            response.push_str("250-STARTTLS\r\n");
        }
        if let Some(sasl) = &self.core.sasl {
            if (self.conn.is_tls() || config.insecure_auth) && sasl.mechanisms() != 0 {
                response.push_str("250-AUTH PLAIN");
                if sasl.mechanisms() & smtp_proto::AUTH_LOGIN != 0 {
                    response.push_str(" LOGIN");
                }
                response.push_str("\r\n");
            }
        }
        response.push_str("250 HELP\r\n");
        self.write(response.as_bytes()).await
    }
}
