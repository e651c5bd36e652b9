//! Timeout configuration for both directions of SMTP traffic.
//!
//! The server side guards idle clients and overall connection lifetime. The
//! client side bounds each phase of an outbound transfer so a stalled
//! exchanger can never wedge a delivery worker.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Common interface for timeout configuration.
pub trait TimeoutConfig {
    /// Timeout for a single command round trip.
    fn command_timeout(&self) -> Duration;

    /// Timeout for the message transfer phase.
    fn data_timeout(&self) -> Duration;

    /// Maximum connection duration.
    fn connection_timeout(&self) -> Duration;
}

/// Inbound session timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerTimeouts {
    /// Idle time allowed between two commands.
    ///
    /// Default: 300 seconds
    #[serde(default = "defaults::server_command_secs")]
    pub command_secs: u64,

    /// Idle time allowed between two lines while receiving DATA.
    ///
    /// Default: 180 seconds
    #[serde(default = "defaults::server_data_secs")]
    pub data_secs: u64,

    /// Maximum total connection duration.
    ///
    /// Default: 1800 seconds
    #[serde(default = "defaults::server_connection_secs")]
    pub connection_secs: u64,
}

impl Default for ServerTimeouts {
    fn default() -> Self {
        Self {
            command_secs: defaults::server_command_secs(),
            data_secs: defaults::server_data_secs(),
            connection_secs: defaults::server_connection_secs(),
        }
    }
}

impl TimeoutConfig for ServerTimeouts {
    fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    fn data_timeout(&self) -> Duration {
        Duration::from_secs(self.data_secs)
    }

    fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_secs)
    }
}

/// Outbound transfer timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientTimeouts {
    /// Timeout for establishing the TCP connection.
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::client_connect_secs")]
    pub connect_secs: u64,

    /// Timeout for reading any single reply.
    ///
    /// Default: 30 seconds
    #[serde(default = "defaults::client_read_secs")]
    pub read_secs: u64,

    /// Timeout for the final reply after the message body.
    ///
    /// Default: 120 seconds
    #[serde(default = "defaults::client_data_secs")]
    pub data_secs: u64,

    /// Timeout for QUIT. Expiry never fails a delivery.
    ///
    /// Default: 10 seconds
    #[serde(default = "defaults::client_quit_secs")]
    pub quit_secs: u64,
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        Self {
            connect_secs: defaults::client_connect_secs(),
            read_secs: defaults::client_read_secs(),
            data_secs: defaults::client_data_secs(),
            quit_secs: defaults::client_quit_secs(),
        }
    }
}

impl ClientTimeouts {
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    #[must_use]
    pub const fn quit_timeout(&self) -> Duration {
        Duration::from_secs(self.quit_secs)
    }
}

impl TimeoutConfig for ClientTimeouts {
    fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.read_secs)
    }

    fn data_timeout(&self) -> Duration {
        Duration::from_secs(self.data_secs)
    }

    fn connection_timeout(&self) -> Duration {
        // No overall limit on the client; the sum of the phases bounds it
        Duration::from_secs(
            self.connect_secs + self.read_secs * 4 + self.data_secs + self.quit_secs,
        )
    }
}

mod defaults {
    pub const fn server_command_secs() -> u64 {
        300
    }
    pub const fn server_data_secs() -> u64 {
        180
    }
    pub const fn server_connection_secs() -> u64 {
        1800
    }

    pub const fn client_connect_secs() -> u64 {
        30
    }
    pub const fn client_read_secs() -> u64 {
        30
    }
    pub const fn client_data_secs() -> u64 {
        120
    }
    pub const fn client_quit_secs() -> u64 {
        10
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_timeouts_defaults() {
        let timeouts = ServerTimeouts::default();
        assert_eq!(timeouts.command_timeout(), Duration::from_secs(300));
        assert_eq!(timeouts.data_timeout(), Duration::from_secs(180));
        assert_eq!(timeouts.connection_timeout(), Duration::from_secs(1800));
    }

    #[test]
    fn test_client_timeouts_defaults() {
        let timeouts = ClientTimeouts::default();
        assert_eq!(timeouts.connect_timeout(), Duration::from_secs(30));
        assert_eq!(timeouts.command_timeout(), Duration::from_secs(30));
        assert_eq!(timeouts.data_timeout(), Duration::from_secs(120));
        assert_eq!(timeouts.quit_timeout(), Duration::from_secs(10));
        assert_eq!(
            timeouts.connection_timeout(),
            Duration::from_secs(30 + 30 * 4 + 120 + 10)
        );
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let timeouts: ServerTimeouts =
            ron::from_str("(command_secs: 5)").expect("valid timeouts");

        assert_eq!(timeouts.command_secs, 5);
        assert_eq!(timeouts.data_secs, 180);
        assert_eq!(timeouts.connection_secs, 1800);
    }
}
