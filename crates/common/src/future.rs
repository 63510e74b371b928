/*
 * SPDX-FileCopyrightText: 2024 Pelican Mail Project <dev@pelicanmail.org>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::time::Duration;

use tokio::sync::watch;

use crate::error::{Error, Result};

/// Write-once value observed by many readers, used for facts resolved in the
/// background (the reverse-DNS name of a connection).
///
/// Dropping the [`Promise`] without resolving it wakes all readers with
/// [`Error::Cancelled`].
pub struct Promise<T> {
    tx: watch::Sender<Option<T>>,
}

#[derive(Clone)]
pub struct FutureValue<T> {
    rx: watch::Receiver<Option<T>>,
}

pub fn promise<T: Clone>() -> (Promise<T>, FutureValue<T>) {
    let (tx, rx) = watch::channel(None);
    (Promise { tx }, FutureValue { rx })
}

impl<T: Clone> Promise<T> {
    pub fn resolve(self, value: T) {
        let _ = self.tx.send(Some(value));
    }
}

impl<T: Clone> FutureValue<T> {
    /// Returns the value immediately if already resolved.
    pub fn peek(&self) -> Option<T> {
        self.rx.borrow().clone()
    }

    pub async fn get(&self) -> Result<T> {
        let mut rx = self.rx.clone();
        loop {
            {
                let value = rx.borrow_and_update();
                if let Some(value) = value.as_ref() {
                    return Ok(value.clone());
                }
            }
            if rx.changed().await.is_err() {
                return Err(Error::Cancelled);
            }
        }
    }

    pub async fn get_timeout(&self, deadline: Duration) -> Result<T> {
        tokio::time::timeout(deadline, self.get())
            .await
            .map_err(|_| Error::Cancelled)?
    }
}
