/*
 * SPDX-FileCopyrightText: 2024 Pelican Mail Project <dev@pelicanmail.org>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::{fmt::Write, io};

use common::error::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::core::Session;

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Session<T> {
    pub async fn can_start_data(&mut self) -> io::Result<bool> {
        if self.data.transaction.is_none() {
            self.write(b"503 5.5.1 MAIL is required first\r\n").await?;
            return Ok(false);
        }
        if self.data.rcpt_to.is_empty() {
            self.write(b"503 5.5.1 RCPT is required first\r\n").await?;
            return Ok(false);
        }
        self.write(b"354 Start mail input, end with <CRLF>.<CRLF>\r\n")
            .await?;
        Ok(true)
    }

    /// Runs the body stage for a completed DATA payload and writes the
    /// final reply (one per recipient in LMTP mode).
    pub async fn handle_message(&mut self, message: Vec<u8>) -> io::Result<()> {
        if self.data.data_too_large {
            self.write(b"552 5.3.4 Message exceeds maximum allowed size\r\n")
                .await?;
            self.reset_transaction().await;
            return Ok(());
        }

        let result = self.process_message(message).await;
        match result {
            Ok(()) => {}
            Err(err) => {
                if let Some(tx) = &mut self.data.transaction {
                    tx.abort().await;
                }
                self.write_error(&err).await?;
            }
        }
        self.reset_transaction().await;
        Ok(())
    }

    async fn process_message(&mut self, message: Vec<u8>) -> Result<(), Error> {
        let config = self.core.config.session.clone();

        // Split the header block (including its terminating blank line)
        // from the body; the header-size limit applies to the block alone.
        let split = message
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .map(|at| at + 4)
            .unwrap_or(message.len());
        if split > config.max_header_size {
            return Err(Error::BufferExhausted);
        }
        let (header, body) = message.split_at(split);

        if count_received(header) > config.max_received {
            return Err(Error::RoutingLoop);
        }

        let mut header = header.to_vec();
        if config.submission {
            if let Some(preparer) = &self.core.preparer {
                let tx = self.data.transaction.as_mut().expect("transaction in DATA");
                header = preparer.prepare(&mut tx.meta, &header)?;
            }
        }

        let mut writer = self.core.config.buffer.writer();
        writer.write_chunk(body)?;
        let buffer = writer.finish()?;

        let tx = self.data.transaction.as_mut().expect("transaction in DATA");
        let id = tx.meta.id.clone();
        let outcome = match tx.run_body(&header, buffer.clone()).await {
            Ok(outcome) => outcome,
            Err(err) => {
                let _ = buffer.remove();
                return Err(err);
            }
        };
        let _ = buffer.remove();
        self.data.messages_sent += 1;

        let utf8 = self.msg_utf8();
        if config.lmtp {
            // LMTP: one final reply per accepted recipient, in order.
            let mut response = String::with_capacity(outcome.len() * 48);
            for (rcpt, status) in &outcome {
                match status {
                    None => {
                        let _ = write!(response, "250 2.0.0 <{rcpt}> OK: queued as {id}\r\n");
                    }
                    Some(err) => {
                        let _ = write!(response, "{}\r\n", err.to_status(utf8));
                    }
                }
            }
            self.write(response.as_bytes()).await?;
        } else if let Some(err) = outcome.iter().find_map(|(_, status)| status.clone()) {
            self.write_error(&err).await?;
        } else {
            tracing::info!(
                parent: &self.span,
                context = "smtp",
                event = "accepted",
                id = id.as_str(),
                nrcpt = outcome.len(),
            );
            self.write(format!("250 2.0.0 OK: queued as {id}\r\n").as_bytes())
                .await?;
        }
        Ok(())
    }
}

fn count_received(header: &[u8]) -> usize {
    header
        .split(|&b| b == b'\n')
        .filter(|line| {
            line.len() >= 9 && line[..9].eq_ignore_ascii_case(b"received:")
        })
        .count()
}
