/*
 * SPDX-FileCopyrightText: 2024 Pelican Mail Project <dev@pelicanmail.org>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::net::IpAddr;

use async_trait::async_trait;

/// PTR lookup behind the per-connection reverse-DNS future. The stub
/// resolver wrapper itself is an external collaborator; this is the seam the
/// session drives.
#[async_trait]
pub trait RdnsResolver: Send + Sync {
    async fn reverse_lookup(&self, ip: IpAddr) -> Option<String>;
}

pub struct DnsResolver {
    resolver: mail_auth::MessageAuthenticator,
}

impl DnsResolver {
    pub fn system() -> std::io::Result<Self> {
        Ok(DnsResolver {
            resolver: mail_auth::MessageAuthenticator::new_system_conf()
                .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))?,
        })
    }
}

#[async_trait]
impl RdnsResolver for DnsResolver {
    async fn reverse_lookup(&self, ip: IpAddr) -> Option<String> {
        self.resolver
            .ptr_lookup(ip, None::<&mail_auth::common::cache::NoCache<IpAddr, std::sync::Arc<Vec<String>>>>)
            .await
            .ok()
            .and_then(|names| names.first().map(|name| name.trim_end_matches('.').to_string()))
    }
}

/// Resolver that never finds a name, for endpoints where reverse DNS is
/// disabled and for tests.
pub struct NullResolver;

#[async_trait]
impl RdnsResolver for NullResolver {
    async fn reverse_lookup(&self, _ip: IpAddr) -> Option<String> {
        None
    }
}
