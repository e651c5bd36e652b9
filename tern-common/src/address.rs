//! Mailbox address helpers and the local-domain set.

use std::{
    fmt::{self, Display},
    ops::Deref,
    sync::Arc,
};

use ahash::AHashSet;
use serde::{Deserialize, Serialize};

/// A lowercased domain name.
///
/// Domains compare case-insensitively on the wire, so the value is folded
/// once on construction rather than on every comparison.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Domain(Arc<str>);

impl Domain {
    #[must_use]
    pub fn new(domain: &str) -> Self {
        Self(Arc::from(domain.trim().to_ascii_lowercase()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for Domain {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Domain {
    fn from(value: String) -> Self {
        Self::new(&value)
    }
}

impl From<&str> for Domain {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<Domain> for String {
    fn from(value: Domain) -> Self {
        value.0.to_string()
    }
}

/// The part of `address` after the last `@`, if there is one.
#[must_use]
pub fn domain_of(address: &str) -> Option<&str> {
    address
        .rsplit_once('@')
        .map(|(_, domain)| domain)
        .filter(|domain| !domain.is_empty())
}

/// The part of `address` before the last `@`, or the whole string.
#[must_use]
pub fn local_part(address: &str) -> &str {
    address.rsplit_once('@').map_or(address, |(local, _)| local)
}

/// The only syntax check performed on envelope addresses: an `@` and more
/// than three characters.
#[must_use]
pub fn is_plausible(address: &str) -> bool {
    address.len() > 3 && address.contains('@')
}

/// Domains this server delivers to directly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalDomains(AHashSet<Domain>);

impl LocalDomains {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(domains.into_iter().map(|d| Domain::new(d.as_ref())).collect())
    }

    #[must_use]
    pub fn contains(&self, domain: &str) -> bool {
        self.0.contains(&Domain::new(domain))
    }

    /// Whether mail for `address` stays on this server.
    ///
    /// An address without a domain is never local.
    #[must_use]
    pub fn is_local_address(&self, address: &str) -> bool {
        domain_of(address).is_some_and(|domain| self.contains(domain))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_is_case_folded() {
        assert_eq!(Domain::new("Example.COM"), Domain::new("example.com"));
        assert_eq!(Domain::new(" mail.test ").as_str(), "mail.test");
    }

    #[test]
    fn address_parts() {
        assert_eq!(domain_of("user@example.com"), Some("example.com"));
        assert_eq!(domain_of("\"a@b\"@example.com"), Some("example.com"));
        assert_eq!(domain_of("user@"), None);
        assert_eq!(domain_of("user"), None);

        assert_eq!(local_part("user@example.com"), "user");
        assert_eq!(local_part("postmaster"), "postmaster");
    }

    #[test]
    fn plausible_addresses() {
        assert!(is_plausible("a@b.c"));
        assert!(!is_plausible("a@b"));
        assert!(!is_plausible("nobody.example.com"));
    }

    #[test]
    fn local_domain_matching() {
        let local = LocalDomains::new(["localhost", "Example.com"]);

        assert_eq!(local.len(), 2);
        assert!(local.is_local_address("friend@EXAMPLE.com"));
        assert!(local.is_local_address("root@localhost"));
        assert!(!local.is_local_address("someone@elsewhere.org"));
        assert!(!local.is_local_address("example.com"));
    }

    #[test]
    fn local_domains_deserialize_from_list() {
        let local: LocalDomains =
            ron::from_str(r#"["Example.com", "test.local"]"#).expect("valid domains");

        assert!(local.contains("example.com"));
        assert!(local.contains("TEST.LOCAL"));
    }
}
