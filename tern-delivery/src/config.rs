//! Delivery engine configuration.

use std::time::Duration;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use tern_common::config::ClientTimeouts;

use crate::dns::DnsConfig;

/// Settings for one recipient domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainConfig {
    /// Send mail for this domain to `host` or `host:port` instead of
    /// looking up its exchangers.
    ///
    /// ```ron
    /// domains: {
    ///     "test.example.com": (
    ///         mx_override: "localhost:1025",
    ///     ),
    /// }
    /// ```
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mx_override: Option<String>,
}

impl DomainConfig {
    #[must_use]
    pub fn with_mx_override(host: impl Into<String>) -> Self {
        Self {
            mx_override: Some(host.into()),
        }
    }
}

/// Per-domain configuration, looked up case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "AHashMap<String, DomainConfig>", into = "AHashMap<String, DomainConfig>")]
pub struct DomainConfigRegistry {
    domains: AHashMap<String, DomainConfig>,
}

impl DomainConfigRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, domain: &str) -> Option<&DomainConfig> {
        self.domains.get(&domain.to_ascii_lowercase())
    }

    pub fn insert(&mut self, domain: &str, config: DomainConfig) {
        self.domains.insert(domain.to_ascii_lowercase(), config);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.domains.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

impl From<AHashMap<String, DomainConfig>> for DomainConfigRegistry {
    fn from(domains: AHashMap<String, DomainConfig>) -> Self {
        Self {
            domains: domains
                .into_iter()
                .map(|(domain, config)| (domain.to_ascii_lowercase(), config))
                .collect(),
        }
    }
}

impl From<DomainConfigRegistry> for AHashMap<String, DomainConfig> {
    fn from(registry: DomainConfigRegistry) -> Self {
        registry.domains
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Number of worker loops pulling from the queue.
    ///
    /// Default: 3
    #[serde(default = "defaults::workers")]
    pub workers: usize,

    /// How long an idle worker waits on the queue before checking whether
    /// the engine is still running.
    ///
    /// Default: 1000 milliseconds
    #[serde(default = "defaults::poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Interval between retry sweeps.
    ///
    /// Default: 300 seconds
    #[serde(default = "defaults::retry_interval_secs")]
    pub retry_interval_secs: u64,

    /// Retries allowed after the first attempt.
    ///
    /// Default: 3
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,

    /// How long `stop` waits for workers before aborting them.
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Port used for exchangers found through DNS.
    ///
    /// Default: 25
    #[serde(default = "defaults::port")]
    pub port: u16,

    /// Name sent in EHLO.
    #[serde(default = "defaults::helo_name")]
    pub helo_name: String,

    #[serde(default)]
    pub domains: DomainConfigRegistry,

    #[serde(default)]
    pub timeouts: ClientTimeouts,

    #[serde(default)]
    pub dns: DnsConfig,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            workers: defaults::workers(),
            poll_interval_ms: defaults::poll_interval_ms(),
            retry_interval_secs: defaults::retry_interval_secs(),
            max_retries: defaults::max_retries(),
            shutdown_timeout_secs: defaults::shutdown_timeout_secs(),
            port: defaults::port(),
            helo_name: defaults::helo_name(),
            domains: DomainConfigRegistry::default(),
            timeouts: ClientTimeouts::default(),
            dns: DnsConfig::default(),
        }
    }
}

impl DeliveryConfig {
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub const fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

mod defaults {
    pub const fn workers() -> usize {
        3
    }

    pub const fn poll_interval_ms() -> u64 {
        1000
    }

    pub const fn retry_interval_secs() -> u64 {
        300
    }

    pub const fn max_retries() -> u32 {
        3
    }

    pub const fn shutdown_timeout_secs() -> u64 {
        30
    }

    pub const fn port() -> u16 {
        25
    }

    pub fn helo_name() -> String {
        "localhost".to_string()
    }
}
