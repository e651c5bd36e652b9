use std::{net::SocketAddr, sync::Arc};

use tern_common::{Signal, address::LocalDomains, error::ListenerError, internal, logging};
use tern_delivery::{DeliveryEngine, MxResolver, OutboundTransferClient};
use tern_mailbox::{FileMessageStore, MailboxStorage, MessageStore};
use tern_smtp::{
    Backends, InMemoryCredentials, Listener, SessionConfig, SessionRegistry,
};
use tokio::{sync::broadcast, task::JoinHandle};

use crate::config::Tern;

/// Everything [`Tern::start`] brought up.
#[derive(Debug)]
pub struct Running {
    address: SocketAddr,
    shutdown: broadcast::Sender<Signal>,
    mailboxes: Arc<MailboxStorage>,
    spool: Arc<dyn MessageStore>,
    engine: DeliveryEngine,
    registry: Arc<SessionRegistry>,
    listener: JoinHandle<Result<(), ListenerError>>,
    delivery: JoinHandle<()>,
}

impl Running {
    /// The address the listener is bound to.
    #[must_use]
    pub const fn address(&self) -> SocketAddr {
        self.address
    }

    #[must_use]
    pub const fn mailboxes(&self) -> &Arc<MailboxStorage> {
        &self.mailboxes
    }

    #[must_use]
    pub const fn spool(&self) -> &Arc<dyn MessageStore> {
        &self.spool
    }

    #[must_use]
    pub const fn engine(&self) -> &DeliveryEngine {
        &self.engine
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Signal shutdown and wait for the listener and delivery engine.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        if let Err(err) = self.shutdown.send(Signal::Shutdown) {
            internal!(level = DEBUG, "Nothing left to receive shutdown: {err}");
        }

        self.listener.await??;
        self.delivery.await?;

        internal!(level = INFO, "Shutdown complete");
        Ok(())
    }
}

async fn wait_for_signal() -> anyhow::Result<()> {
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!(level = INFO, "CTRL+C entered, shutting down");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate signal received, shutting down");
        }
    }

    Ok(())
}

impl Tern {
    /// Run until SIGINT or SIGTERM.
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();

        let running = self.start().await?;
        internal!(level = INFO, "Listening on {}", running.address());

        wait_for_signal().await?;
        running.shutdown().await
    }

    /// Open storage, start the delivery engine and begin accepting
    /// connections.
    pub async fn start(self) -> anyhow::Result<Running> {
        internal!("Controller starting ...");

        let mailboxes = Arc::new(MailboxStorage::open(self.storage.mailboxes.clone()).await?);
        let spool: Arc<dyn MessageStore> =
            Arc::new(FileMessageStore::open(self.storage.spool.clone()).await?);

        let resolver = MxResolver::new(
            self.delivery.dns.clone(),
            self.delivery.domains.clone(),
            self.delivery.port,
        );
        let transport =
            OutboundTransferClient::new(&self.delivery.helo_name, self.delivery.timeouts.clone());
        let engine = DeliveryEngine::new(
            self.delivery,
            Arc::clone(&spool),
            Arc::new(resolver),
            Arc::new(transport),
        );

        let credentials: InMemoryCredentials = self
            .users
            .iter()
            .map(|user| (user.email.as_str(), user.password.as_str()))
            .collect();
        if credentials.is_empty() && self.smtp.require_auth {
            internal!(
                level = WARN,
                "Authentication is required but no users are configured"
            );
        }

        let session = SessionConfig::builder()
            .with_banner(self.smtp.banner)
            .with_local_domains(LocalDomains::new(&self.smtp.local_domains))
            .with_require_auth(self.smtp.require_auth)
            .with_max_message_size(self.smtp.max_message_size)
            .with_timeouts(self.smtp.timeouts)
            .with_credentials(Arc::new(credentials))
            .build();

        let registry = Arc::new(SessionRegistry::new(self.smtp.max_connections));
        let backends = Backends {
            mailboxes: Arc::clone(&mailboxes),
            relay_store: Arc::clone(&spool),
            relay: Arc::new(engine.clone()),
        };

        let listener =
            Listener::bind(self.smtp.listen, session, backends, Arc::clone(&registry)).await?;
        let address = listener.local_addr()?;

        // Running before the first session can hand it work, and holding
        // whatever the last run left behind
        engine.start();
        engine.recover().await;

        let (shutdown, _) = broadcast::channel(16);

        let delivery = {
            let engine = engine.clone();
            let signal = shutdown.subscribe();
            tokio::spawn(async move { engine.serve(signal).await })
        };
        let listener = {
            let signal = shutdown.subscribe();
            tokio::spawn(async move { listener.serve(signal).await })
        };

        Ok(Running {
            address,
            shutdown,
            mailboxes,
            spool,
            engine,
            registry,
            listener,
            delivery,
        })
    }
}
