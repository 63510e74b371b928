/*
 * SPDX-FileCopyrightText: 2024 Pelican Mail Project <dev@pelicanmail.org>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::error::{Error, Result};

/// Splits an address into its local part and domain.
///
/// `postmaster` (case-insensitive, no domain) is a recognized special address
/// and splits as `("postmaster", "")`. The local part keeps its original
/// casing and may be `"`-quoted; a `\` inside quotes escapes the next
/// character. Outside quotes, `@` terminates the local part and at most one
/// unquoted `@` may appear.
pub fn split(addr: &str) -> Result<(String, String)> {
    if addr.eq_ignore_ascii_case("postmaster") {
        return Ok(("postmaster".to_string(), String::new()));
    }

    let mut local = String::with_capacity(addr.len());
    let mut chars = addr.chars();
    let mut in_quotes = false;
    let mut quoted = false;
    let mut seen_at = false;
    let mut domain = String::new();

    while let Some(c) = chars.next() {
        match c {
            '"' if local.is_empty() && !quoted => {
                in_quotes = true;
                quoted = true;
            }
            '"' if in_quotes => {
                in_quotes = false;
                match chars.next() {
                    Some('@') => {
                        seen_at = true;
                        domain = chars.as_str().to_string();
                        break;
                    }
                    _ => {
                        return Err(Error::AddressSyntax(
                            "closing quote must be followed by '@'".to_string(),
                        ));
                    }
                }
            }
            '\\' if in_quotes => match chars.next() {
                Some(escaped) => local.push(escaped),
                None => {
                    return Err(Error::AddressSyntax("unterminated quoted string".to_string()));
                }
            },
            '\\' => {
                return Err(Error::AddressSyntax(
                    "escape outside quoted string".to_string(),
                ));
            }
            '@' if !in_quotes => {
                seen_at = true;
                domain = chars.as_str().to_string();
                break;
            }
            _ => local.push(c),
        }
    }

    if in_quotes {
        return Err(Error::AddressSyntax("unterminated quoted string".to_string()));
    }
    if seen_at && domain.contains('@') {
        return Err(Error::AddressSyntax("multiple '@' characters".to_string()));
    }
    if local.is_empty() {
        return Err(Error::AddressSyntax("empty local part".to_string()));
    }
    if seen_at && domain.is_empty() {
        return Err(Error::AddressSyntax("empty domain".to_string()));
    }

    Ok((local, domain))
}

/// Inverse of [`split`]: re-quotes the local part when it contains characters
/// that do not fit the dot-atom form.
pub fn compose(local: &str, domain: &str) -> String {
    let needs_quoting = local.is_empty()
        || local.starts_with('.')
        || local.ends_with('.')
        || local.contains("..")
        || local.chars().any(|c| {
            !(c.is_alphanumeric() || "!#$%&'*+-/=?^_`{|}~.".contains(c) || !c.is_ascii())
        });

    let local = if needs_quoting {
        let mut quoted = String::with_capacity(local.len() + 2);
        quoted.push('"');
        for c in local.chars() {
            if c == '"' || c == '\\' {
                quoted.push('\\');
            }
            quoted.push(c);
        }
        quoted.push('"');
        quoted
    } else {
        local.to_string()
    };

    if domain.is_empty() {
        local
    } else {
        format!("{local}@{domain}")
    }
}

/// Canonicalizes the domain of an address to its lowercased A-label form,
/// leaving the local part untouched.
pub fn clean_domain(addr: &str) -> Result<String> {
    let (local, domain) = split(addr)?;
    if domain.is_empty() {
        return Ok(compose(&local, ""));
    }
    let ascii = idna::domain_to_ascii(&domain)
        .map_err(|_| Error::AddressSyntax(format!("invalid domain: {domain}")))?;
    Ok(compose(&local, &ascii.to_lowercase()))
}

/// Canonicalizes the domain of an address to its lowercased U-label (NFC)
/// form, used on sessions that negotiated SMTPUTF8.
pub fn clean_domain_utf8(addr: &str) -> Result<String> {
    let (local, domain) = split(addr)?;
    if domain.is_empty() {
        return Ok(compose(&local, ""));
    }
    let ascii = idna::domain_to_ascii(&domain)
        .map_err(|_| Error::AddressSyntax(format!("invalid domain: {domain}")))?;
    let (unicode, result) = idna::domain_to_unicode(&ascii);
    result.map_err(|_| Error::AddressSyntax(format!("invalid domain: {domain}")))?;
    Ok(compose(&local, &unicode))
}

pub fn is_ascii(addr: &str) -> bool {
    addr.is_ascii()
}

/// Unicode simple case folding over the whole address, used for
/// case-insensitive comparisons of identities and routing keys.
pub fn fold_case(addr: &str) -> String {
    addr.chars().flat_map(|c| c.to_lowercase()).collect()
}

pub fn equal_fold(a: &str, b: &str) -> bool {
    fold_case(a) == fold_case(b)
}

/// Extracts the domain of an already-split address string, empty when the
/// address has no domain.
pub fn domain_part(addr: &str) -> &str {
    addr.rsplit_once('@').map(|(_, d)| d).unwrap_or_default()
}
