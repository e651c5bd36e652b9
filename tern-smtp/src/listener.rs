use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures_util::future::join_all;
use tern_common::{
    Signal, config::TimeoutConfig, error::ListenerError, internal, status::Status, tracing,
};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    sync::broadcast,
};

use crate::{
    dispatch::Reply,
    registry::SessionRegistry,
    session::{Backends, Session, SessionConfig},
};

/// How often idle sessions are swept from the registry.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Pause after an accept failure such as running out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// How long to wait before accepting again after `err`. Failures tied to a
/// single connection are retried straight away.
fn accept_backoff(err: &std::io::Error) -> Duration {
    use std::io::ErrorKind;

    match err.kind() {
        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset | ErrorKind::Interrupted => {
            Duration::ZERO
        }
        _ => ACCEPT_BACKOFF,
    }
}

/// Accepts SMTP connections and runs one [`Session`] per connection.
#[derive(Debug)]
pub struct Listener {
    listener: TcpListener,
    config: Arc<SessionConfig>,
    backends: Backends,
    registry: Arc<SessionRegistry>,
}

impl Listener {
    pub async fn bind(
        address: SocketAddr,
        config: SessionConfig,
        backends: Backends,
        registry: Arc<SessionRegistry>,
    ) -> Result<Self, ListenerError> {
        let listener =
            TcpListener::bind(address)
                .await
                .map_err(|source| ListenerError::BindFailed {
                    address: address.to_string(),
                    source,
                })?;

        Ok(Self {
            listener,
            config: Arc::new(config),
            backends,
            registry,
        })
    }

    /// The bound address, useful when binding port 0.
    pub fn local_addr(&self) -> Result<SocketAddr, ListenerError> {
        Ok(self.listener.local_addr()?)
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Accept connections until a shutdown signal arrives, then wait for
    /// every running session to finish.
    #[tracing::instrument(level = tracing::Level::TRACE, skip_all, err)]
    pub async fn serve(
        &self,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), ListenerError> {
        let address = self.local_addr()?;
        internal!(level = INFO, "SMTP listener serving on {address}");

        let mut sessions = Vec::default();
        let mut cleanup = tokio::time::interval(CLEANUP_INTERVAL);
        let max_idle = self.config.timeouts.command_timeout();

        loop {
            tokio::select! {
                sig = shutdown.recv() => {
                    if matches!(sig, Ok(Signal::Shutdown) | Err(broadcast::error::RecvError::Closed)) {
                        internal!(level = INFO, "SMTP listener {address} received shutdown signal, finishing sessions ...");
                        for info in self.registry.sessions() {
                            internal!(
                                level = DEBUG,
                                "Waiting on {} from {}, connected {}s",
                                info.id,
                                info.peer,
                                info.connected_at.elapsed().as_secs()
                            );
                        }
                        join_all(sessions).await;
                        self.registry.shutdown();
                        break;
                    }
                }

                _ = cleanup.tick() => {
                    let expired = self.registry.cleanup_expired(max_idle);
                    if expired > 0 {
                        internal!(level = DEBUG, "Closed {expired} idle sessions");
                    }
                    sessions.retain(|handle: &tokio::task::JoinHandle<()>| !handle.is_finished());
                }

                connection = self.listener.accept() => {
                    let (stream, peer) = match connection {
                        Ok(connection) => connection,
                        Err(err) => {
                            let backoff = accept_backoff(&err);
                            tracing::warn!(%address, error = %err, backoff_ms = backoff.as_millis(), "Failed to accept connection");
                            tokio::time::sleep(backoff).await;
                            continue;
                        }
                    };
                    tracing::debug!("Connection received on {address} from {peer}");

                    if let Some(handle) = self.accept(stream, peer, shutdown.resubscribe()).await {
                        sessions.push(handle);
                    }
                }
            }
        }

        Ok(())
    }

    async fn accept(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
        signal: broadcast::Receiver<Signal>,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let Some(guard) = self.registry.register(peer) else {
            internal!(
                level = WARN,
                "Refusing {peer}: {} connections already open",
                self.registry.max_connections()
            );
            let refusal = Reply::new(Status::Unavailable, "Too many connections");
            if let Err(err) = stream.write_all(format!("{refusal}\r\n").as_bytes()).await {
                internal!(level = DEBUG, "Unable to refuse {peer}: {err}");
            }
            return None;
        };

        let session = Session::new(stream, peer, Arc::clone(&self.config), self.backends.clone())
            .with_guard(guard);

        Some(tokio::spawn(async move {
            if let Err(err) = session.run(signal).await {
                if err.is_client_error() {
                    internal!(level = DEBUG, "Session with {peer} ended: {err}");
                } else {
                    internal!(level = ERROR, "Session with {peer} failed: {err}");
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Error, ErrorKind};

    use super::*;

    #[test]
    fn accept_failures_back_off() {
        // EMFILE
        assert_eq!(accept_backoff(&Error::from_raw_os_error(24)), ACCEPT_BACKOFF);
        assert_eq!(accept_backoff(&Error::from(ErrorKind::OutOfMemory)), ACCEPT_BACKOFF);

        for kind in [
            ErrorKind::ConnectionAborted,
            ErrorKind::ConnectionReset,
            ErrorKind::Interrupted,
        ] {
            assert_eq!(accept_backoff(&Error::from(kind)), Duration::ZERO, "{kind:?}");
        }
    }
}
