//! Mail exchanger resolution.
//!
//! MX records are looked up through hickory and cached for the record TTL
//! (clamped to configured bounds). Resolution never fails: a domain without
//! MX records, or whose lookup fails, resolves to the domain itself.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use hickory_resolver::{
    TokioResolver, config::ResolverOpts, name_server::TokioConnectionProvider,
};
use serde::{Deserialize, Serialize};
use tern_common::internal;

use crate::config::DomainConfigRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsConfig {
    /// DNS query timeout in seconds (default: 5)
    #[serde(default = "defaults::timeout_secs")]
    pub timeout_secs: u64,

    /// Minimum cache TTL in seconds (default: 60)
    #[serde(default = "defaults::min_cache_ttl_secs")]
    pub min_cache_ttl_secs: u64,

    /// Maximum cache TTL in seconds (default: 3600)
    #[serde(default = "defaults::max_cache_ttl_secs")]
    pub max_cache_ttl_secs: u64,
}

mod defaults {
    pub const fn timeout_secs() -> u64 {
        5
    }

    pub const fn min_cache_ttl_secs() -> u64 {
        60
    }

    pub const fn max_cache_ttl_secs() -> u64 {
        3600
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: defaults::timeout_secs(),
            min_cache_ttl_secs: defaults::min_cache_ttl_secs(),
            max_cache_ttl_secs: defaults::max_cache_ttl_secs(),
        }
    }
}

/// One exchanger to try.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailServer {
    pub host: String,
    /// MX preference, lower first. 0 for fallbacks and overrides.
    pub priority: u16,
    pub port: u16,
}

impl MailServer {
    #[must_use]
    pub fn new(host: impl Into<String>, priority: u16, port: u16) -> Self {
        Self {
            host: host.into(),
            priority,
            port,
        }
    }

    /// Parse `host` or `host:port`.
    #[must_use]
    pub fn parse(address: &str, default_port: u16) -> Self {
        match address.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => port.parse().map_or_else(
                |_| Self::new(address, 0, default_port),
                |port| Self::new(host, 0, port),
            ),
            _ => Self::new(address, 0, default_port),
        }
    }

    /// Returns the full address as `host:port`.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Order exchangers by ascending preference, keeping discovery order for
/// ties, and strip the trailing root dot from each name.
fn order_exchangers(records: impl IntoIterator<Item = (u16, String)>, port: u16) -> Vec<MailServer> {
    let mut servers: Vec<MailServer> = records
        .into_iter()
        .map(|(priority, host)| {
            let host = host.strip_suffix('.').map_or_else(|| host.clone(), str::to_string);
            MailServer::new(host, priority, port)
        })
        .collect();

    servers.sort_by_key(|server| server.priority);
    servers
}

#[derive(Debug, Clone)]
struct CachedResult {
    servers: Arc<Vec<MailServer>>,
    expires_at: Instant,
}

/// Resolves a recipient domain to the exchangers to try, in order.
#[derive(Debug)]
pub struct MxResolver {
    /// `None` when the system resolver configuration could not be loaded;
    /// every domain then resolves to itself.
    resolver: Option<TokioResolver>,
    cache: DashMap<String, CachedResult>,
    overrides: DomainConfigRegistry,
    config: DnsConfig,
    port: u16,
}

impl MxResolver {
    /// Build a resolver from the system configuration.
    ///
    /// `port` is used for every exchanger found through DNS; overrides may
    /// name their own.
    #[must_use]
    pub fn new(config: DnsConfig, overrides: DomainConfigRegistry, port: u16) -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(config.timeout_secs);

        let resolver = match TokioResolver::builder(TokioConnectionProvider::default()) {
            Ok(builder) => Some(builder.with_options(opts).build()),
            Err(err) => {
                internal!(
                    level = WARN,
                    "Unable to load system DNS configuration, exchangers will not be looked up: {err}"
                );
                None
            }
        };

        Self {
            resolver,
            cache: DashMap::new(),
            overrides,
            config,
            port,
        }
    }

    /// A resolver that never queries DNS: overrides apply, everything else
    /// resolves to the domain itself.
    #[must_use]
    pub fn offline(overrides: DomainConfigRegistry, port: u16) -> Self {
        Self {
            resolver: None,
            cache: DashMap::new(),
            overrides,
            config: DnsConfig::default(),
            port,
        }
    }

    fn fallback(&self, domain: &str) -> Arc<Vec<MailServer>> {
        Arc::new(vec![MailServer::new(domain, 0, self.port)])
    }

    /// The exchangers for `domain`, most preferred first. Never empty.
    pub async fn resolve(&self, domain: &str) -> Arc<Vec<MailServer>> {
        let domain = domain.trim().to_ascii_lowercase();

        if let Some(address) = self
            .overrides
            .get(&domain)
            .and_then(|config| config.mx_override.as_deref())
        {
            internal!(level = DEBUG, "Using MX override {address} for {domain}");
            return Arc::new(vec![MailServer::parse(address, self.port)]);
        }

        if let Some(cached) = self.cache.get(&domain)
            && cached.expires_at > Instant::now()
        {
            return Arc::clone(&cached.servers);
        }

        let Some(resolver) = &self.resolver else {
            return self.fallback(&domain);
        };

        match resolver.mx_lookup(domain.as_str()).await {
            Ok(lookup) => {
                let ttl = lookup
                    .as_lookup()
                    .records()
                    .iter()
                    .map(hickory_resolver::proto::rr::Record::ttl)
                    .min()
                    .unwrap_or(300);

                let servers = order_exchangers(
                    lookup
                        .iter()
                        .map(|mx| (mx.preference(), mx.exchange().to_utf8())),
                    self.port,
                );

                let servers = if servers.is_empty() {
                    self.fallback(&domain)
                } else {
                    Arc::new(servers)
                };

                let ttl = u64::from(ttl)
                    .clamp(self.config.min_cache_ttl_secs, self.config.max_cache_ttl_secs);
                self.cache.insert(
                    domain.clone(),
                    CachedResult {
                        servers: Arc::clone(&servers),
                        expires_at: Instant::now() + Duration::from_secs(ttl),
                    },
                );

                internal!(
                    level = DEBUG,
                    "Resolved {} exchanger(s) for {domain}, cached for {ttl}s",
                    servers.len()
                );
                servers
            }
            Err(err) if err.is_no_records_found() => {
                internal!(level = DEBUG, "No MX records for {domain}, using the domain itself");
                self.fallback(&domain)
            }
            Err(err) => {
                internal!(level = WARN, "MX lookup failed for {domain}: {err}");
                self.fallback(&domain)
            }
        }
    }
}
