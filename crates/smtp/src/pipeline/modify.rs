/*
 * SPDX-FileCopyrightText: 2024 Pelican Mail Project <dev@pelicanmail.org>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use async_trait::async_trait;
use common::{address, error::Result};

use crate::core::MsgMetadata;

/// A message modifier attached to a pipeline rule. Modifiers run in declared
/// order; recipient rewrites are recorded in `OriginalRcpts` by the caller.
#[async_trait]
pub trait Modifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn rewrite_sender(&self, mail_from: &str) -> Result<String> {
        Ok(mail_from.to_string())
    }

    async fn rewrite_rcpt(&self, rcpt: &str) -> Result<String> {
        Ok(rcpt.to_string())
    }

    /// Header fields contributed at the body stage.
    fn headers(&self, _meta: &MsgMetadata) -> Vec<(String, String)> {
        Vec::new()
    }
}

/// Table-driven recipient aliasing: exact `user@domain` entries first, then
/// whole-domain `@domain` entries that keep the local part.
pub struct AliasModifier {
    table: ahash::AHashMap<String, String>,
}

impl AliasModifier {
    pub fn new(table: ahash::AHashMap<String, String>) -> Self {
        AliasModifier {
            table: table
                .into_iter()
                .map(|(k, v)| (address::fold_case(&k), v))
                .collect(),
        }
    }
}

#[async_trait]
impl Modifier for AliasModifier {
    fn name(&self) -> &'static str {
        "alias"
    }

    async fn rewrite_rcpt(&self, rcpt: &str) -> Result<String> {
        let folded = address::fold_case(rcpt);
        if let Some(replacement) = self.table.get(&folded) {
            return Ok(replacement.clone());
        }
        let (local, domain) = address::split(rcpt)?;
        if !domain.is_empty() {
            if let Some(replacement) = self.table.get(&format!("@{}", address::fold_case(&domain)))
            {
                let new_domain = replacement.strip_prefix('@').unwrap_or(replacement);
                return Ok(address::compose(&local, new_domain));
            }
        }
        Ok(rcpt.to_string())
    }
}

/// Prepends a fixed header field to every message passing the rule.
pub struct AddHeader {
    field: String,
    value: String,
}

impl AddHeader {
    pub fn new(field: impl Into<String>, value: impl Into<String>) -> Self {
        AddHeader {
            field: field.into(),
            value: value.into(),
        }
    }
}

#[async_trait]
impl Modifier for AddHeader {
    fn name(&self) -> &'static str {
        "add_header"
    }

    fn headers(&self, _meta: &MsgMetadata) -> Vec<(String, String)> {
        vec![(self.field.clone(), self.value.clone())]
    }
}
