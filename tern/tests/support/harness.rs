//! A complete tern instance on an ephemeral port, relaying one domain to a
//! [`MockSmtpServer`].
//!
//! ```no_run
//! let harness = TestHarness::builder().build().await.unwrap();
//! harness
//!     .send_email("user@example.com", &["friend@relay.test"], "Subject: Hi\r\n\r\nBody")
//!     .await
//!     .unwrap();
//! harness.wait_for_delivery(Duration::from_secs(5)).await.unwrap();
//! harness.shutdown().await.unwrap();
//! ```
#![allow(dead_code)]

use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD};
use tempfile::TempDir;
use tern::{
    Running, Tern,
    config::{SmtpConfig, StorageConfig, User},
};
use tern_common::config::ClientTimeouts;
use tern_delivery::{DeliveryConfig, DomainConfig, DomainConfigRegistry};
use tern_mailbox::{FileMessageStore, INBOX, Message, MessageStore};
use tern_smtp::client::{Response, SmtpClient};

use super::mock_server::{MockSmtpServer, SmtpCommand};

pub const USER: &str = "user@example.com";
pub const PASSWORD: &str = "password";
pub const LOCAL_DOMAIN: &str = "example.com";

const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestHarness {
    running: Running,
    mock_server: MockSmtpServer,
    _dir: TempDir,
}

impl TestHarness {
    #[must_use]
    pub fn builder() -> TestHarnessBuilder {
        TestHarnessBuilder::new()
    }

    #[must_use]
    pub const fn running(&self) -> &Running {
        &self.running
    }

    /// Connect and read the greeting.
    pub async fn connect(&self) -> anyhow::Result<SmtpClient> {
        let mut client = SmtpClient::connect_timeout(self.running.address(), CLIENT_TIMEOUT)
            .await?
            .with_read_timeout(CLIENT_TIMEOUT);

        let greeting = client.read_greeting().await?;
        anyhow::ensure!(greeting.code == 220, "Unexpected greeting: {greeting:?}");

        Ok(client)
    }

    pub async fn authenticate(
        client: &mut SmtpClient,
        username: &str,
        password: &str,
    ) -> anyhow::Result<Response> {
        let token = STANDARD.encode(format!("\0{username}\0{password}"));
        Ok(client.command(&format!("AUTH PLAIN {token}")).await?)
    }

    /// Run a full authenticated transaction and return the reply to the end
    /// of DATA.
    pub async fn send_email(
        &self,
        from: &str,
        recipients: &[&str],
        body: &str,
    ) -> anyhow::Result<Response> {
        let mut client = self.connect().await?;

        let ehlo = client.ehlo("client.test").await?;
        anyhow::ensure!(ehlo.code == 250, "EHLO refused: {ehlo:?}");

        let auth = Self::authenticate(&mut client, USER, PASSWORD).await?;
        anyhow::ensure!(auth.code == 235, "AUTH refused: {auth:?}");

        let mail = client.mail_from(from).await?;
        anyhow::ensure!(mail.code == 250, "MAIL refused: {mail:?}");

        for recipient in recipients {
            let rcpt = client.rcpt_to(recipient).await?;
            anyhow::ensure!(rcpt.code == 250, "RCPT {recipient} refused: {rcpt:?}");
        }

        let data = client.data().await?;
        anyhow::ensure!(data.code == 354, "DATA refused: {data:?}");

        let reply = client.send_data(body.as_bytes()).await?;
        let _ = client.quit().await;

        Ok(reply)
    }

    /// Poll the mock exchanger until it has received a message body.
    pub async fn wait_for_delivery(&self, timeout: Duration) -> anyhow::Result<Vec<u8>> {
        let start = tokio::time::Instant::now();

        loop {
            if let Some(content) = self.mock_server.messages().await.into_iter().next() {
                return Ok(content);
            }

            if start.elapsed() > timeout {
                anyhow::bail!(
                    "Timeout waiting for delivery. Mock server received {} commands",
                    self.mock_server.commands().await.len()
                );
            }

            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn mock_commands(&self) -> Vec<SmtpCommand> {
        self.mock_server.commands().await
    }

    pub async fn inbox(&self, address: &str) -> anyhow::Result<Vec<Message>> {
        Ok(self.running.mailboxes().get_messages(address, INBOX).await?)
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.mock_server.shutdown();
        tokio::time::timeout(Duration::from_secs(10), self.running.shutdown()).await?
    }
}

pub struct TestHarnessBuilder {
    relay_domain: String,
    require_auth: bool,
    max_connections: usize,
    leftovers: Vec<Message>,
}

impl TestHarnessBuilder {
    fn new() -> Self {
        Self {
            relay_domain: "relay.test".to_string(),
            require_auth: true,
            max_connections: 16,
            leftovers: Vec::new(),
        }
    }

    /// A relay body already in the spool when the server starts, as if a
    /// previous run had not finished with it.
    #[must_use]
    pub fn with_leftover(mut self, message: Message) -> Self {
        self.leftovers.push(message);
        self
    }

    /// Domain routed to the mock exchanger.
    #[must_use]
    pub fn with_relay_domain(mut self, domain: impl Into<String>) -> Self {
        self.relay_domain = domain.into();
        self
    }

    #[must_use]
    pub const fn with_require_auth(mut self, require_auth: bool) -> Self {
        self.require_auth = require_auth;
        self
    }

    #[must_use]
    pub const fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub async fn build(self) -> anyhow::Result<TestHarness> {
        let mock_server = MockSmtpServer::builder().build().await?;
        let dir = TempDir::new()?;

        if !self.leftovers.is_empty() {
            let spool = FileMessageStore::open(dir.path().join("spool")).await?;
            for message in &self.leftovers {
                spool.store(message).await?;
            }
        }

        let mut domains = DomainConfigRegistry::new();
        domains.insert(
            &self.relay_domain,
            DomainConfig::with_mx_override(mock_server.override_address()),
        );

        let config = Tern {
            smtp: SmtpConfig {
                listen: "127.0.0.1:0".parse()?,
                banner: "mx.test".to_string(),
                local_domains: vec![LOCAL_DOMAIN.to_string()],
                require_auth: self.require_auth,
                max_connections: self.max_connections,
                ..SmtpConfig::default()
            },
            storage: StorageConfig {
                mailboxes: dir.path().join("mail"),
                spool: dir.path().join("spool"),
            },
            delivery: DeliveryConfig {
                workers: 2,
                poll_interval_ms: 10,
                retry_interval_secs: 3600,
                shutdown_timeout_secs: 2,
                helo_name: "mx.test".to_string(),
                domains,
                timeouts: ClientTimeouts {
                    connect_secs: 2,
                    read_secs: 2,
                    data_secs: 2,
                    quit_secs: 1,
                },
                ..DeliveryConfig::default()
            },
            users: vec![User {
                email: USER.to_string(),
                password: PASSWORD.to_string(),
            }],
        };

        let running = config.start().await?;

        Ok(TestHarness {
            running,
            mock_server,
            _dir: dir,
        })
    }
}
