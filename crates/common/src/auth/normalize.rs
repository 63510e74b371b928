/*
 * SPDX-FileCopyrightText: 2024 Pelican Mail Project <dev@pelicanmail.org>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use ahash::AHashMap;

use crate::{
    address,
    error::{Error, Result},
};

/// Username normalization applied before credential lookup and identity
/// mapping. `CaseMapped` is email-aware: the local part is case-folded and
/// the domain canonicalized through IDNA; `CaseFold` folds the whole string;
/// `Noop` preserves the input (the case-preserved profile).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Normalize {
    #[default]
    CaseMapped,
    CaseFold,
    Noop,
}

impl Normalize {
    pub fn apply(&self, input: &str) -> Result<String> {
        if input.is_empty() {
            return Err(Error::AuthInvalid);
        }
        match self {
            Normalize::Noop => Ok(input.to_string()),
            Normalize::CaseFold => Ok(address::fold_case(input)),
            Normalize::CaseMapped => {
                if input.contains('@') {
                    let (local, domain) = address::split(input).map_err(|_| Error::AuthInvalid)?;
                    let cleaned = address::clean_domain(&address::compose(
                        &address::fold_case(&local),
                        &domain,
                    ))
                    .map_err(|_| Error::AuthInvalid)?;
                    Ok(cleaned)
                } else {
                    Ok(address::fold_case(input))
                }
            }
        }
    }
}

/// A normalize+map chain. The SMTP auth identity and the storage account
/// identity each run an independent instance of this, so `User@Example.COM`
/// can authenticate while landing in storage account `user@example.com`.
#[derive(Default)]
pub struct IdentityMap {
    normalize: Normalize,
    table: Option<AHashMap<String, String>>,
}

impl IdentityMap {
    pub fn new(normalize: Normalize, table: Option<AHashMap<String, String>>) -> Self {
        IdentityMap { normalize, table }
    }

    pub fn normalize(&self, input: &str) -> Result<String> {
        self.normalize.apply(input)
    }

    /// Runs the mapping table over an already-normalized identity. A miss
    /// on a configured table is a credential error.
    pub fn map(&self, normalized: &str) -> Result<String> {
        match &self.table {
            None => Ok(normalized.to_string()),
            Some(table) => table
                .get(normalized)
                .cloned()
                .ok_or(Error::AuthInvalid),
        }
    }

    pub fn resolve(&self, input: &str) -> Result<String> {
        self.map(&self.normalize(input)?)
    }
}
