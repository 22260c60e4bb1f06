//! Destination checks run before the first attempt
//!
//! A destination must be an http(s) URL whose host is on the allow-list
//! (when one is configured) and resolves within the DNS timeout. Failures
//! are permanent: the record is marked failed without retry and the
//! breaker is not involved.

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;
use url::Url;

use crate::error::DeliveryError;

/// Host name resolution port
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>>;
}

/// System resolver via `tokio::net::lookup_host`
#[derive(Debug, Default, Clone, Copy)]
pub struct DnsResolver;

#[async_trait]
impl Resolver for DnsResolver {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        Ok(tokio::net::lookup_host((host, port)).await?.collect())
    }
}

pub struct DestinationGuard {
    allowed_domains: Vec<String>,
    dns_timeout: Duration,
    resolver: Arc<dyn Resolver>,
    verified: Mutex<HashSet<String>>,
}

impl DestinationGuard {
    pub fn new(allowed_domains: &[String], dns_timeout: Duration, resolver: Arc<dyn Resolver>) -> Self {
        Self {
            allowed_domains: allowed_domains
                .iter()
                .map(|d| d.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
            dns_timeout,
            resolver,
            verified: Mutex::new(HashSet::new()),
        }
    }

    /// An empty allow-list admits every host
    pub fn is_allowed_host(&self, host: &str) -> bool {
        if self.allowed_domains.is_empty() {
            return true;
        }
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.allowed_domains
            .iter()
            .any(|domain| host == *domain || host.ends_with(&format!(".{}", domain)))
    }

    /// Validate a destination URL; successful checks are remembered
    pub async fn check(&self, destination: &str) -> Result<(), DeliveryError> {
        if self.verified.lock().contains(destination) {
            return Ok(());
        }

        let url = Url::parse(destination)
            .map_err(|e| DeliveryError::Destination(format!("invalid URL {}: {}", destination, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(DeliveryError::Destination(format!(
                "unsupported scheme '{}' in {}",
                url.scheme(),
                destination
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| DeliveryError::Destination(format!("no host in {}", destination)))?;
        // IPv6 literals arrive bracketed
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if !self.is_allowed_host(host) {
            return Err(DeliveryError::Destination(format!(
                "host {} is not in the allowed domains",
                host
            )));
        }

        let port = url.port_or_known_default().unwrap_or(443);
        let addrs = tokio::time::timeout(self.dns_timeout, self.resolver.resolve(host, port))
            .await
            .map_err(|_| {
                DeliveryError::Destination(format!(
                    "DNS resolution for {} timed out after {:?}",
                    host, self.dns_timeout
                ))
            })?
            .map_err(|e| DeliveryError::Destination(format!("DNS resolution for {} failed: {}", host, e)))?;
        if addrs.is_empty() {
            return Err(DeliveryError::Destination(format!("{} resolved to no addresses", host)));
        }

        debug!(destination, addresses = addrs.len(), "destination verified");
        self.verified.lock().insert(destination.to_string());
        Ok(())
    }
}
