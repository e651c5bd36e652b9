use std::{fmt, net::SocketAddr, sync::Arc, time::Instant};

use tern_common::{
    Signal,
    address::LocalDomains,
    config::{ServerTimeouts, TimeoutConfig},
    error::SessionError,
    internal, outgoing,
    status::Status,
    traits::RelayQueue,
    tracing,
};
use tern_mailbox::{MailboxStorage, MessageStore};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{Notify, broadcast},
};

use crate::{
    auth::{Credentials, InMemoryCredentials},
    connection::Connection,
    dispatch::{Event, Reply},
    error::ConnectionError,
    registry::SessionGuard,
    state::{Context, State},
};

mod delivery;
mod io;

/// Default maximum message size: 10 MiB.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

pub struct SessionConfig {
    pub banner: String,
    pub local_domains: LocalDomains,
    /// Whether MAIL requires a prior successful AUTH.
    pub require_auth: bool,
    /// Largest DATA body accepted, in bytes. 0 disables the check.
    pub max_message_size: usize,
    pub timeouts: ServerTimeouts,
    pub credentials: Arc<dyn Credentials>,
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("banner", &self.banner)
            .field("local_domains", &self.local_domains)
            .field("require_auth", &self.require_auth)
            .field("max_message_size", &self.max_message_size)
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

impl SessionConfig {
    /// Create a new `SessionConfig` builder
    #[must_use]
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }
}

/// Builder for `SessionConfig`
#[derive(Debug)]
pub struct SessionConfigBuilder {
    banner: String,
    local_domains: LocalDomains,
    require_auth: bool,
    max_message_size: usize,
    timeouts: ServerTimeouts,
    credentials: Option<Arc<dyn Credentials>>,
}

impl Default for SessionConfigBuilder {
    fn default() -> Self {
        Self {
            banner: String::new(),
            local_domains: LocalDomains::default(),
            require_auth: true,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            timeouts: ServerTimeouts::default(),
            credentials: None,
        }
    }
}

impl SessionConfigBuilder {
    /// Set the server banner hostname
    #[must_use]
    pub fn with_banner(mut self, banner: impl Into<String>) -> Self {
        self.banner = banner.into();
        self
    }

    #[must_use]
    pub fn with_local_domains(mut self, local_domains: LocalDomains) -> Self {
        self.local_domains = local_domains;
        self
    }

    #[must_use]
    pub const fn with_require_auth(mut self, require_auth: bool) -> Self {
        self.require_auth = require_auth;
        self
    }

    #[must_use]
    pub const fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Set the timeout configuration for this session
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: ServerTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, credentials: Arc<dyn Credentials>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Build the final `SessionConfig`
    ///
    /// An empty banner falls back to `$HOSTNAME`, then `localhost`.
    #[must_use]
    pub fn build(self) -> SessionConfig {
        SessionConfig {
            banner: if self.banner.is_empty() {
                std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
            } else {
                self.banner
            },
            local_domains: self.local_domains,
            require_auth: self.require_auth,
            max_message_size: self.max_message_size,
            timeouts: self.timeouts,
            credentials: self
                .credentials
                .unwrap_or_else(|| Arc::new(InMemoryCredentials::new())),
        }
    }
}

/// Where accepted mail goes.
#[derive(Clone)]
pub struct Backends {
    pub mailboxes: Arc<MailboxStorage>,
    pub relay_store: Arc<dyn MessageStore>,
    pub relay: Arc<dyn RelayQueue>,
}

impl fmt::Debug for Backends {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backends")
            .field("mailboxes", &self.mailboxes.root())
            .field("relay_store", &self.relay_store)
            .finish_non_exhaustive()
    }
}

pub struct Session<Stream: AsyncRead + AsyncWrite + Unpin + Send> {
    peer: SocketAddr,
    pub(super) context: Context,
    pub(super) config: Arc<SessionConfig>,
    pub(super) backends: Backends,
    pub(super) connection: Connection<Stream>,
    guard: Option<SessionGuard>,
    kill: Arc<Notify>,
    /// Start time for tracking connection lifetime
    start_time: Instant,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Session<Stream> {
    pub fn new(
        stream: Stream,
        peer: SocketAddr,
        config: Arc<SessionConfig>,
        backends: Backends,
    ) -> Self {
        Self {
            peer,
            context: Context::default(),
            config,
            backends,
            connection: Connection::new(stream),
            guard: None,
            kill: Arc::new(Notify::new()),
            start_time: Instant::now(),
        }
    }

    /// Tie the session to a registry slot: activity is reported to the
    /// registry and the registry can close the session.
    #[must_use]
    pub fn with_guard(mut self, guard: SessionGuard) -> Self {
        self.kill = guard.kill_signal();
        self.guard = Some(guard);
        self
    }

    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.guard.as_ref().map(SessionGuard::id)
    }

    #[must_use]
    pub const fn context(&self) -> &Context {
        &self.context
    }

    /// Idle limit for the current state.
    fn idle_timeout(&self) -> std::time::Duration {
        if self.context.state == State::ReceivingData {
            self.config.timeouts.data_timeout()
        } else {
            self.config.timeouts.command_timeout()
        }
    }

    pub(super) async fn reply(&mut self, reply: &Reply) -> Result<(), SessionError> {
        outgoing!("{reply}");

        self.connection.send(reply).await.map_err(|err| {
            internal!(level = ERROR, "{err}");
            SessionError::Protocol(format!("Failed to send response: {err}"))
        })?;

        Ok(())
    }

    async fn close_with(&mut self, status: Status, text: &'static str) {
        self.context.state = State::Closed;
        if let Err(err) = self.reply(&Reply::new(status, text)).await {
            internal!(level = DEBUG, "Unable to say goodbye: {err}");
        }
    }

    /// Drive the conversation until the client quits, the stream ends, a
    /// timeout fires or shutdown is signalled.
    #[tracing::instrument(level = tracing::Level::TRACE, skip_all, fields(peer = %self.peer, id = ?self.id()), ret)]
    pub async fn run(mut self, mut signal: broadcast::Receiver<Signal>) -> Result<(), SessionError> {
        internal!("Connected");

        let greeting = Reply::new(
            Status::ServiceReady,
            format!("{} ESMTP Service Ready", self.config.banner),
        );
        self.reply(&greeting).await?;

        let result = self.command_loop(&mut signal).await;
        internal!("Connection closed");

        result
    }

    async fn command_loop(
        &mut self,
        signal: &mut broadcast::Receiver<Signal>,
    ) -> Result<(), SessionError> {
        let max_lifetime = self.config.timeouts.connection_timeout();

        loop {
            if self.start_time.elapsed() >= max_lifetime {
                tracing::warn!(
                    peer = ?self.peer,
                    max_secs = max_lifetime.as_secs(),
                    "Connection exceeded maximum lifetime, closing"
                );
                self.close_with(Status::Unavailable, "4.4.2 Connection lifetime exceeded")
                    .await;
                return Err(SessionError::Timeout(max_lifetime.as_secs()));
            }

            let idle = self.idle_timeout();
            let kill = Arc::clone(&self.kill);

            tokio::select! {
                _ = signal.recv() => {
                    self.close_with(Status::Unavailable, "Server shutting down").await;
                    return Ok(());
                }

                () = kill.notified() => {
                    self.close_with(Status::Unavailable, "4.4.2 Idle timeout").await;
                    return Err(SessionError::Timeout(idle.as_secs()));
                }

                line = tokio::time::timeout(idle, self.connection.read_line()) => {
                    match line {
                        Err(_) => {
                            tracing::warn!(
                                peer = ?self.peer,
                                state = %self.context.state,
                                timeout_secs = idle.as_secs(),
                                "Client connection timed out"
                            );
                            self.close_with(Status::Unavailable, "4.4.2 Idle timeout").await;
                            return Err(SessionError::Timeout(idle.as_secs()));
                        }
                        Ok(Ok(None)) => {
                            internal!(level = DEBUG, "Peer closed the connection");
                            return Ok(());
                        }
                        Ok(Err(ConnectionError::LineTooLong(limit))) => {
                            internal!(level = WARN, "Discarded line longer than {limit} bytes");
                            if self.context.state == State::ReceivingData {
                                // Answered with 552 once the body ends
                                self.context.overflow_body();
                            } else {
                                self.reply(&Reply::new(Status::Unrecognised, "5.5.2 Line too long")).await?;
                            }
                        }
                        Ok(Err(ConnectionError::Io(err))) => {
                            return Err(SessionError::Connection(err));
                        }
                        Ok(Ok(Some(line))) => {
                            if let Some(guard) = &self.guard {
                                guard.touch();
                            }

                            if self.handle_line(&line).await? == Event::ConnectionClose {
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
    }
}
