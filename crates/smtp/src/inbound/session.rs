/*
 * SPDX-FileCopyrightText: 2024 Pelican Mail Project <dev@pelicanmail.org>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::{io, net::SocketAddr, sync::Arc};

use common::{error::Error, future, DAEMON_NAME};
use smtp_proto::{
    request::receiver::{DataReceiver, RequestReceiver},
    Request,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::auth;
use crate::core::{ConnState, Core, Protocol, Session, SessionData, State};

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Session<T> {
    pub fn new(core: Arc<Core>, stream: T, remote_addr: SocketAddr, local_addr: SocketAddr) -> Self {
        let (promise, rdns) = future::promise();
        let resolver = core.rdns.clone();
        let ip = remote_addr.ip();
        // Reverse DNS resolves in the background; the session never waits
        // for it, checks and trace headers read the future with a deadline.
        tokio::spawn(async move {
            promise.resolve(resolver.reverse_lookup(ip).await);
        });

        let proto = if core.config.session.lmtp {
            Protocol::Lmtp
        } else {
            Protocol::Esmtp
        };
        let span = tracing::info_span!("session", remote = %remote_addr);
        Session {
            core,
            stream,
            span,
            state: State::default(),
            conn: Arc::new(ConnState::new(remote_addr, local_addr, proto, rdns)),
            data: SessionData::default(),
        }
    }

    /// Drives the connection to completion: greeting, command loop,
    /// teardown. Read and write deadlines each cancel the whole session.
    pub async fn handle(mut self) {
        if self
            .write(format!("220 {} {} ready\r\n", self.core.config.hostname, DAEMON_NAME).as_bytes())
            .await
            .is_err()
        {
            return;
        }

        let mut buf = vec![0u8; 8192];
        loop {
            let read = tokio::time::timeout(
                self.core.config.session.read_timeout,
                self.stream.read(&mut buf),
            )
            .await;
            let bytes_read = match read {
                Ok(Ok(0)) | Ok(Err(_)) => break,
                Ok(Ok(bytes_read)) => bytes_read,
                Err(_) => {
                    let _ = self
                        .write(b"421 4.4.2 Idle too long, closing connection\r\n")
                        .await;
                    break;
                }
            };
            match self.ingest(&buf[..bytes_read]).await {
                Ok(true) => {}
                Ok(false) | Err(_) => break,
            }
        }
        self.reset_transaction().await;
    }

    /// Feeds raw bytes through the receiver state machine, handling as many
    /// pipelined commands as the buffer holds. Returns false to close.
    pub async fn ingest(&mut self, bytes: &[u8]) -> io::Result<bool> {
        let mut iter = bytes.iter();
        let mut state = std::mem::replace(&mut self.state, State::None);

        'outer: loop {
            match &mut state {
                State::Request(receiver) => loop {
                    match receiver.ingest(&mut iter, bytes) {
                        Ok(request) => match request {
                            Request::Ehlo { host } => {
                                if !self.core.config.session.lmtp {
                                    self.handle_ehlo(host, true).await?;
                                } else {
                                    self.write(b"500 5.5.1 Invalid command, LMTP requires LHLO\r\n")
                                        .await?;
                                }
                            }
                            Request::Lhlo { host } => {
                                if self.core.config.session.lmtp {
                                    self.handle_ehlo(host, true).await?;
                                } else {
                                    self.write(b"502 5.5.1 LHLO is LMTP only\r\n").await?;
                                }
                            }
                            Request::Helo { host } => {
                                self.handle_ehlo(host, false).await?;
                            }
                            Request::Mail { from } => {
                                self.handle_mail_from(from).await?;
                            }
                            Request::Rcpt { to } => {
                                if !self.handle_rcpt_to(to).await? {
                                    return Ok(false);
                                }
                            }
                            Request::Data => {
                                if self.can_start_data().await? {
                                    state = State::Data(DataReceiver::new(), Vec::new());
                                    continue 'outer;
                                }
                            }
                            Request::Rset => {
                                self.reset_transaction().await;
                                self.write(b"250 2.0.0 OK\r\n").await?;
                            }
                            Request::Quit => {
                                self.write(b"221 2.0.0 Bye\r\n").await?;
                                return Ok(false);
                            }
                            Request::Noop { .. } => {
                                self.write(b"250 2.0.0 OK\r\n").await?;
                            }
                            Request::Auth {
                                mechanism,
                                initial_response,
                            } => {
                                match self.handle_auth(mechanism, initial_response).await? {
                                    auth::AuthFlow::Continue(receiver) => {
                                        state = State::Sasl(receiver);
                                        continue 'outer;
                                    }
                                    auth::AuthFlow::Done => {}
                                    auth::AuthFlow::Close => return Ok(false),
                                }
                            }
                            Request::StartTls => {
                                if self.core.config.session.starttls {
                                    // The TLS acceptor is owned by the
                                    // listener; nothing to hand over here.
                                    self.write(b"454 4.7.0 TLS not available\r\n").await?;
                                } else {
                                    self.write(b"502 5.5.1 Command not implemented\r\n").await?;
                                }
                            }
                            Request::Vrfy { .. } => {
                                self.write(b"252 2.1.5 Cannot verify, but will accept message\r\n")
                                    .await?;
                            }
                            Request::Expn { .. } => {
                                self.write(b"550 5.3.3 EXPN not supported\r\n").await?;
                            }
                            Request::Help { .. } => {
                                self.write(b"214 2.0.0 See RFC 5321\r\n").await?;
                            }
                            _ => {
                                self.write(b"502 5.5.1 Command not implemented\r\n").await?;
                            }
                        },
                        Err(err) => match err {
                            smtp_proto::Error::NeedsMoreData { .. } => break 'outer,
                            smtp_proto::Error::UnknownCommand => {
                                self.write(b"500 5.5.1 Invalid command\r\n").await?;
                            }
                            _ => {
                                self.write(b"501 5.5.2 Syntax error\r\n").await?;
                            }
                        },
                    }
                },
                State::Data(receiver, buf) => {
                    if receiver.ingest(&mut iter, buf) {
                        let message = std::mem::take(buf);
                        self.handle_message(message).await?;
                        state = State::Request(RequestReceiver::default());
                    } else {
                        // Bound memory while a too-large message drains to
                        // its final dot.
                        if buf.len() > self.core.config.session.max_message_size {
                            buf.clear();
                            self.data.data_too_large = true;
                        }
                        break 'outer;
                    }
                }
                State::Sasl(receiver) => {
                    if receiver.ingest(&mut iter) {
                        let line = std::mem::take(&mut receiver.buf);
                        match self.handle_sasl_response(line).await? {
                            auth::AuthFlow::Continue(next) => {
                                state = State::Sasl(next);
                                continue 'outer;
                            }
                            auth::AuthFlow::Done => {
                                state = State::Request(RequestReceiver::default());
                            }
                            auth::AuthFlow::Close => return Ok(false),
                        }
                    } else {
                        break 'outer;
                    }
                }
                State::None => unreachable!(),
            }
        }

        self.state = state;
        Ok(true)
    }

    pub async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        match tokio::time::timeout(self.core.config.session.write_timeout, async {
            self.stream.write_all(bytes).await?;
            self.stream.flush().await
        })
        .await
        {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out")),
        }
    }

    /// Writes the single SMTP reply for an error, transliterated to ASCII
    /// unless this transaction negotiated SMTPUTF8.
    pub async fn write_error(&mut self, err: &Error) -> io::Result<()> {
        let utf8 = self
            .data
            .transaction
            .as_ref()
            .map_or(false, |tx| tx.meta.opts.utf8);
        let status = err.to_status(utf8);
        self.write(format!("{status}\r\n").as_bytes()).await
    }

    /// Whether SMTPUTF8 is in effect for the message in flight.
    pub fn msg_utf8(&self) -> bool {
        self.data
            .transaction
            .as_ref()
            .map_or(false, |tx| tx.meta.opts.utf8)
    }

    /// Drops the in-flight message state: aborts target deliveries, hands
    /// back limiter tokens, clears the deferred rejection.
    pub async fn reset_transaction(&mut self) {
        if let Some(mut tx) = self.data.transaction.take() {
            tx.abort().await;
        }
        if let Some((ip, domain)) = self.data.msg_token.take() {
            self.core.limits.release_msg(ip, &domain);
        }
        for domain in std::mem::take(&mut self.data.dest_tokens) {
            self.core.limits.release_dest(&domain);
        }
        self.data.rcpt_to.clear();
        self.data.deferred_error = None;
        self.data.data_too_large = false;
    }
}
