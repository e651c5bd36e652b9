//! The `tern.config.ron` file.
//!
//! ```ron
//! (
//!     smtp: (
//!         listen: "0.0.0.0:2525",
//!         banner: "mx.example.com",
//!         local_domains: ["example.com"],
//!     ),
//!     storage: (mailboxes: "/var/lib/tern/mail", spool: "/var/lib/tern/spool"),
//!     delivery: (workers: 3, helo_name: "mx.example.com"),
//!     users: [(email: "user@example.com", password: "password")],
//! )
//! ```

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tern_common::config::ServerTimeouts;
use tern_delivery::DeliveryConfig;

/// Inbound listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// Default: 0.0.0.0:2525
    #[serde(default = "defaults::listen")]
    pub listen: SocketAddr,

    /// Name used in the greeting and replies. Empty means `$HOSTNAME`.
    #[serde(default)]
    pub banner: String,

    /// Domains whose recipients are stored locally. Everything else is relayed.
    #[serde(default)]
    pub local_domains: Vec<String>,

    /// Default: true
    #[serde(default = "defaults::require_auth")]
    pub require_auth: bool,

    /// Default: 100
    #[serde(default = "defaults::max_connections")]
    pub max_connections: usize,

    /// In bytes. Default: 10 MiB
    #[serde(default = "defaults::max_message_size")]
    pub max_message_size: usize,

    #[serde(default)]
    pub timeouts: ServerTimeouts,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            listen: defaults::listen(),
            banner: String::new(),
            local_domains: Vec::new(),
            require_auth: defaults::require_auth(),
            max_connections: defaults::max_connections(),
            max_message_size: defaults::max_message_size(),
            timeouts: ServerTimeouts::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of the mailbox tree. Default: ./mail
    #[serde(default = "defaults::mailboxes")]
    pub mailboxes: PathBuf,

    /// Where relay bodies wait for delivery. Default: ./spool
    #[serde(default = "defaults::spool")]
    pub spool: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mailboxes: defaults::mailboxes(),
            spool: defaults::spool(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tern {
    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub users: Vec<User>,
}

impl Tern {
    /// Read and parse a configuration file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|err| {
            anyhow::anyhow!("Failed to read config from {}: {err}", path.display())
        })?;

        ron::from_str(&content)
            .map_err(|err| anyhow::anyhow!("Invalid config in {}: {err}", path.display()))
    }
}

/// Find the configuration file using the following precedence:
/// 1. `TERN_CONFIG` environment variable
/// 2. ./tern.config.ron (current working directory)
/// 3. /etc/tern/tern.config.ron (system-wide config)
pub fn find_config_file() -> anyhow::Result<PathBuf> {
    if let Ok(env_path) = std::env::var("TERN_CONFIG") {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!("TERN_CONFIG points to non-existent file: {}", path.display());
    }

    let default_paths = [
        PathBuf::from("./tern.config.ron"),
        PathBuf::from("/etc/tern/tern.config.ron"),
    ];

    if let Some(path) = default_paths.iter().find(|path| path.exists()) {
        return Ok(path.clone());
    }

    let paths_tried = default_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - TERN_CONFIG environment variable\n{paths_tried}"
    )
}

mod defaults {
    use std::{
        net::{IpAddr, Ipv4Addr, SocketAddr},
        path::PathBuf,
    };

    pub const fn listen() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 2525)
    }

    pub const fn require_auth() -> bool {
        true
    }

    pub const fn max_connections() -> usize {
        100
    }

    pub const fn max_message_size() -> usize {
        10 * 1024 * 1024
    }

    pub fn mailboxes() -> PathBuf {
        PathBuf::from("./mail")
    }

    pub fn spool() -> PathBuf {
        PathBuf::from("./spool")
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: Tern = ron::from_str("()").unwrap();

        assert_eq!(config, Tern::default());
        assert_eq!(config.smtp.listen.port(), 2525);
        assert!(config.smtp.require_auth);
        assert_eq!(config.smtp.max_connections, 100);
        assert_eq!(config.storage.spool, PathBuf::from("./spool"));
        assert_eq!(config.delivery.max_retries, 3);
        assert!(config.users.is_empty());
    }

    #[test]
    fn full_config() {
        let config: Tern = ron::from_str(
            r#"(
                smtp: (
                    listen: "127.0.0.1:1025",
                    banner: "mx.example.com",
                    local_domains: ["example.com", "example.org"],
                    require_auth: false,
                    max_message_size: 1024,
                    timeouts: (command_secs: 60),
                ),
                storage: (mailboxes: "/tmp/mail"),
                delivery: (
                    workers: 1,
                    domains: {
                        "relay.test": (mx_override: "localhost:2526"),
                    },
                ),
                users: [
                    (email: "user@example.com", password: "password"),
                ],
            )"#,
        )
        .unwrap();

        assert_eq!(config.smtp.listen, "127.0.0.1:1025".parse().unwrap());
        assert_eq!(config.smtp.banner, "mx.example.com");
        assert_eq!(config.smtp.local_domains, vec!["example.com", "example.org"]);
        assert!(!config.smtp.require_auth);
        assert_eq!(config.smtp.max_message_size, 1024);
        assert_eq!(config.smtp.timeouts.command_secs, 60);
        assert_eq!(config.smtp.timeouts.data_secs, 180);

        assert_eq!(config.storage.mailboxes, PathBuf::from("/tmp/mail"));
        assert_eq!(config.storage.spool, PathBuf::from("./spool"));

        assert_eq!(config.delivery.workers, 1);
        assert!(config.delivery.domains.get("relay.test").is_some());

        assert_eq!(
            config.users,
            vec![User {
                email: "user@example.com".to_string(),
                password: "password".to_string(),
            }]
        );
    }

    #[test]
    fn shipped_example_parses() {
        let config = Tern::load(Path::new(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/tern.config.ron"
        )))
        .unwrap();

        assert!(!config.smtp.local_domains.is_empty());
    }
}
