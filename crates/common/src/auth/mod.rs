/*
 * SPDX-FileCopyrightText: 2024 Pelican Mail Project <dev@pelicanmail.org>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::Arc;

use async_trait::async_trait;
use smtp_proto::{AUTH_LOGIN, AUTH_PLAIN};

use crate::error::{Error, Result};

pub mod normalize;

pub use normalize::{IdentityMap, Normalize};

/// A credential verification backend (PAM, shadow, table, ...). The backends
/// themselves are external collaborators; the core only drives this trait.
#[async_trait]
pub trait PlainAuth: Send + Sync {
    async fn auth_plain(&self, username: &str, password: &str) -> Result<()>;
}

/// Wraps the configured "plain auth" providers behind the SASL mechanisms
/// offered to SMTP and IMAP endpoints.
pub struct SaslAuth {
    providers: Vec<Arc<dyn PlainAuth>>,
    identity: IdentityMap,
    enable_login: bool,
}

impl SaslAuth {
    pub fn new(providers: Vec<Arc<dyn PlainAuth>>, identity: IdentityMap) -> Self {
        SaslAuth {
            providers,
            identity,
            enable_login: false,
        }
    }

    /// LOGIN is deprecated and only offered when explicitly enabled.
    pub fn with_login(mut self, enable_login: bool) -> Self {
        self.enable_login = enable_login;
        self
    }

    /// Advertised mechanism set: PLAIN whenever any provider is configured,
    /// LOGIN only when enabled on top of that.
    pub fn mechanisms(&self) -> u64 {
        if self.providers.is_empty() {
            0
        } else if self.enable_login {
            AUTH_PLAIN | AUTH_LOGIN
        } else {
            AUTH_PLAIN
        }
    }

    pub fn create_sasl(self: &Arc<Self>, mechanism: u64) -> Result<SaslSession> {
        if self.mechanisms() & mechanism == 0 {
            return Err(Error::AuthUnsupportedMech(format!("{mechanism:#x}")));
        }
        let state = match mechanism {
            AUTH_PLAIN => SaslState::Plain,
            AUTH_LOGIN => SaslState::LoginUser,
            _ => return Err(Error::AuthUnsupportedMech(format!("{mechanism:#x}"))),
        };
        Ok(SaslSession {
            auth: self.clone(),
            state,
        })
    }

    async fn verify(&self, authzid: &str, authcid: &str, password: &str) -> Result<String> {
        let authcid = self.identity.normalize(authcid)?;
        // RFC 4616: an authorization identity, when present, must match the
        // authentication identity; the mapping layer may only relax it to
        // the same mapped account.
        if !authzid.is_empty() {
            let authzid = self.identity.normalize(authzid)?;
            if authzid != authcid {
                return Err(Error::AuthInvalid);
            }
        }
        for provider in &self.providers {
            if provider.auth_plain(&authcid, password).await.is_ok() {
                return self.identity.map(&authcid);
            }
        }
        Err(Error::AuthInvalid)
    }
}

enum SaslState {
    Plain,
    LoginUser,
    LoginPass { username: String },
    Done,
}

/// One step of a SASL exchange. Challenges are raw octets; the protocol
/// layer applies base64 framing.
pub enum SaslStep {
    Challenge(&'static [u8]),
    /// Credential exchange succeeded; carries the mapped identity.
    Authenticated(String),
}

/// A per-exchange mechanism server created by [`SaslAuth::create_sasl`].
pub struct SaslSession {
    auth: Arc<SaslAuth>,
    state: SaslState,
}

impl SaslSession {
    /// The challenge to send before any client response, when the client
    /// did not provide an initial response.
    pub fn initial_challenge(&self) -> &'static [u8] {
        match self.state {
            SaslState::LoginUser => b"Username:",
            _ => b"",
        }
    }

    /// Feeds one (already base64-decoded) client response into the exchange.
    pub async fn respond(&mut self, data: &[u8]) -> Result<SaslStep> {
        match std::mem::replace(&mut self.state, SaslState::Done) {
            SaslState::Plain => {
                let mut parts = data.split(|&b| b == 0);
                let (authzid, authcid, password) =
                    match (parts.next(), parts.next(), parts.next(), parts.next()) {
                        (Some(authzid), Some(authcid), Some(password), None) => {
                            (authzid, authcid, password)
                        }
                        _ => return Err(Error::AuthInvalid),
                    };
                let identity = self
                    .auth
                    .verify(
                        std::str::from_utf8(authzid).map_err(|_| Error::AuthInvalid)?,
                        std::str::from_utf8(authcid).map_err(|_| Error::AuthInvalid)?,
                        std::str::from_utf8(password).map_err(|_| Error::AuthInvalid)?,
                    )
                    .await?;
                Ok(SaslStep::Authenticated(identity))
            }
            SaslState::LoginUser => {
                let username = String::from_utf8(data.to_vec()).map_err(|_| Error::AuthInvalid)?;
                self.state = SaslState::LoginPass { username };
                Ok(SaslStep::Challenge(b"Password:"))
            }
            SaslState::LoginPass { username } => {
                let password =
                    std::str::from_utf8(data).map_err(|_| Error::AuthInvalid)?;
                let identity = self.auth.verify("", &username, password).await?;
                Ok(SaslStep::Authenticated(identity))
            }
            SaslState::Done => Err(Error::AuthInvalid),
        }
    }
}
