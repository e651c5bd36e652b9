//! The queued, retrying delivery engine.
//!
//! One [`DeliveryTask`] exists per relayed message, keyed by message id, and
//! lives in the active map until it is delivered or given up on. Work is a
//! FIFO of ids: fresh enqueues and retry sweeps both push onto it, and a
//! fixed pool of workers pops from it. A task is never in the queue twice,
//! so only one worker handles a given task at a time.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use dashmap::{DashMap, mapref::entry::Entry};
use parking_lot::Mutex;
use tern_common::{Signal, address::domain_of, internal, traits::RelayQueue};
use tern_mailbox::{Message, MessageStore};
use tokio::{
    sync::{Notify, broadcast},
    task::JoinSet,
    time::Instant,
};

use crate::{
    config::DeliveryConfig,
    dns::MxResolver,
    error::{DeliveryError, TransferError},
    stats::{Counters, DeliveryStats},
    task::{DeliveryStatus, DeliveryTask},
    transfer::Transport,
};

#[derive(Debug, Default)]
struct WorkQueue {
    items: Mutex<VecDeque<String>>,
    ready: Notify,
}

impl WorkQueue {
    fn push(&self, message_id: String) {
        self.items.lock().push_back(message_id);
        self.ready.notify_one();
    }

    /// Wait up to `timeout` for an id.
    async fn pop_timeout(&self, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.ready.notified();
            let mut notified = std::pin::pin!(notified);
            notified.as_mut().enable();

            let next = self.items.lock().pop_front();
            if next.is_some() {
                return next;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    fn wake_all(&self) {
        self.ready.notify_waiters();
    }
}

/// What to do with a task once an attempt has been recorded on it.
enum Next {
    Delivered,
    Requeue,
    AwaitRetry,
    Abandon,
}

#[derive(Debug)]
struct Inner {
    config: DeliveryConfig,
    store: Arc<dyn MessageStore>,
    resolver: Arc<MxResolver>,
    transport: Arc<dyn Transport>,
    queue: WorkQueue,
    active: DashMap<String, DeliveryTask>,
    running: AtomicBool,
    counters: Counters,
    stop: Notify,
    tasks: Mutex<Option<JoinSet<()>>>,
}

/// Handle to the engine. Clones share the same queue and workers.
#[derive(Debug, Clone)]
pub struct DeliveryEngine {
    inner: Arc<Inner>,
}

impl DeliveryEngine {
    #[must_use]
    pub fn new(
        config: DeliveryConfig,
        store: Arc<dyn MessageStore>,
        resolver: Arc<MxResolver>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                resolver,
                transport,
                queue: WorkQueue::default(),
                active: DashMap::new(),
                running: AtomicBool::new(false),
                counters: Counters::default(),
                stop: Notify::new(),
                tasks: Mutex::new(None),
            }),
        }
    }

    /// Spawn the workers and the retry sweep. Must be called from within a
    /// tokio runtime. Does nothing if the engine is already running.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut tasks = JoinSet::new();
        for worker in 0..self.inner.config.workers {
            tasks.spawn(Arc::clone(&self.inner).work(worker));
        }
        tasks.spawn(Arc::clone(&self.inner).sweep());

        internal!(
            level = INFO,
            "Delivery engine started with {} worker(s), retrying every {}s",
            self.inner.config.workers,
            self.inner.config.retry_interval_secs
        );

        *self.inner.tasks.lock() = Some(tasks);
    }

    /// Stop accepting work, cancel the retry sweep and wait for workers to
    /// finish their current task. Workers still busy after the shutdown
    /// timeout are aborted; tasks still queued are dropped.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        internal!("Delivery engine stopping ...");
        self.inner.stop.notify_waiters();
        self.inner.queue.wake_all();

        let Some(mut tasks) = self.inner.tasks.lock().take() else {
            return;
        };

        let timeout = self.inner.config.shutdown_timeout();
        let drained = tokio::time::timeout(timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            internal!(
                level = WARN,
                "Delivery workers still busy after {}s, aborting them",
                timeout.as_secs()
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        internal!(
            level = INFO,
            "Delivery engine stopped with {} task(s) outstanding",
            self.inner.active.len()
        );
    }

    /// Run until told to shut down, then stop.
    pub async fn serve(&self, mut shutdown: broadcast::Receiver<Signal>) {
        self.start();

        loop {
            match shutdown.recv().await {
                Ok(Signal::Shutdown) | Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(_)) => {}
            }
        }

        self.stop().await;
    }

    #[must_use]
    pub fn stats(&self) -> DeliveryStats {
        self.inner
            .counters
            .snapshot(self.inner.running.load(Ordering::SeqCst))
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Snapshot of a task still in the active set.
    #[must_use]
    pub fn active_task(&self, message_id: &str) -> Option<DeliveryTask> {
        self.inner
            .active
            .get(message_id)
            .map(|task| task.value().clone())
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }

    /// Queue every body left in the store by a previous run, using the
    /// recipients recorded with it. Bodies with nobody left to deliver to
    /// are removed. Call after [`Self::start`] and before new work arrives;
    /// returns the number of tasks queued.
    pub async fn recover(&self) -> usize {
        self.inner.recover().await
    }

    /// Re-enqueue failed tasks that have retries left and evict the rest.
    /// Runs on the retry interval while the engine is running; returns the
    /// number of tasks re-enqueued.
    pub async fn retry_sweep(&self) -> usize {
        self.inner.retry_sweep().await
    }
}

impl RelayQueue for DeliveryEngine {
    fn enqueue(&self, message_id: &str, recipients: Vec<String>) -> bool {
        self.inner.admit(message_id, recipients)
    }
}

impl Inner {
    fn admit(&self, message_id: &str, recipients: Vec<String>) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            internal!(
                level = WARN,
                "Delivery engine is not running, dropping relay of {message_id}"
            );
            return false;
        }

        if recipients.is_empty() {
            return false;
        }

        match self.active.entry(message_id.to_string()) {
            Entry::Occupied(mut existing) => {
                existing.get_mut().merge_recipients(recipients);
                internal!(level = DEBUG, "Merged recipients into pending task {message_id}");
            }
            Entry::Vacant(slot) => {
                slot.insert(DeliveryTask::new(message_id, recipients));
                self.queue.push(message_id.to_string());
                self.counters.queued();
                internal!(level = DEBUG, "Queued {message_id} for delivery");
            }
        }

        true
    }

    async fn recover(&self) -> usize {
        if !self.running.load(Ordering::SeqCst) {
            internal!(level = WARN, "Delivery engine is not running, skipping recovery");
            return 0;
        }

        let ids = match self.store.ids().await {
            Ok(ids) => ids,
            Err(err) => {
                internal!(level = ERROR, "Unable to list stored relay bodies: {err}");
                return 0;
            }
        };

        let mut recovered = 0;
        for message_id in ids {
            if self.active.contains_key(&message_id) {
                continue;
            }

            match self.store.fetch(&message_id).await {
                Ok(Some(message)) if !message.recipients().is_empty() => {
                    if self.admit(&message_id, message.recipients().to_vec()) {
                        recovered += 1;
                    }
                }
                Ok(Some(_)) => {
                    internal!(
                        level = WARN,
                        "Stored relay body {message_id} has no recipients, removing it"
                    );
                    self.discard_body(&message_id).await;
                }
                Ok(None) => {}
                Err(err) => {
                    internal!(level = WARN, "Unable to read stored relay body {message_id}: {err}");
                }
            }
        }

        if recovered > 0 {
            internal!(level = INFO, "Recovered {recovered} relay task(s) from the store");
        }

        recovered
    }

    async fn work(self: Arc<Self>, worker: usize) {
        internal!(level = DEBUG, "Delivery worker {worker} started");

        while self.running.load(Ordering::SeqCst) {
            if let Some(message_id) = self.queue.pop_timeout(self.config.poll_interval()).await {
                self.process(&message_id).await;
            }
        }

        internal!(level = DEBUG, "Delivery worker {worker} exiting");
    }

    async fn sweep(self: Arc<Self>) {
        let stopped = self.stop.notified();
        let mut stopped = std::pin::pin!(stopped);
        stopped.as_mut().enable();

        let mut interval = tokio::time::interval(self.config.retry_interval());
        // The first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                biased;

                () = stopped.as_mut() => break,
                _ = interval.tick() => {
                    if !self.running.load(Ordering::SeqCst) {
                        break;
                    }

                    let requeued = self.retry_sweep().await;
                    if requeued > 0 {
                        internal!(level = INFO, "Retry sweep re-queued {requeued} task(s)");
                    }
                }
            }
        }

        internal!(level = DEBUG, "Retry sweep cancelled");
    }

    async fn retry_sweep(&self) -> usize {
        if !self.running.load(Ordering::SeqCst) {
            return 0;
        }

        let mut requeue = Vec::new();
        let mut exhausted = Vec::new();

        for mut entry in self.active.iter_mut() {
            let task = entry.value_mut();
            if task.status != DeliveryStatus::Failed {
                continue;
            }

            if task.exhausted(self.config.max_retries) {
                exhausted.push(task.message_id.clone());
            } else {
                task.retry_count += 1;
                task.status = DeliveryStatus::Retry;
                requeue.push(task.message_id.clone());
            }
        }

        for message_id in exhausted {
            if let Some((_, task)) = self.active.remove(&message_id) {
                self.abandon(task).await;
            }
        }

        for message_id in &requeue {
            if let Some(mut task) = self.active.get_mut(message_id) {
                task.status = DeliveryStatus::Queued;
            }
            self.queue.push(message_id.clone());
            self.counters.retried();
        }

        requeue.len()
    }

    #[tracing::instrument(level = tracing::Level::DEBUG, skip(self))]
    async fn process(&self, message_id: &str) {
        let recipients = {
            let Some(mut task) = self.active.get_mut(message_id) else {
                return;
            };
            task.begin_attempt();
            task.recipients.clone()
        };

        let (delivered, result) = self.attempt(message_id, &recipients).await;

        let (next, pending) = {
            let Some(mut task) = self.active.get_mut(message_id) else {
                return;
            };

            task.recipients.retain(|pending| {
                !delivered
                    .iter()
                    .any(|done| done.eq_ignore_ascii_case(pending))
            });
            let pending = (!delivered.is_empty()).then(|| task.recipients.clone());

            let next = match result {
                Ok(()) if task.recipients.is_empty() => {
                    task.status = DeliveryStatus::Delivered;
                    Next::Delivered
                }
                // Recipients were merged in while this attempt ran
                Ok(()) => {
                    task.status = DeliveryStatus::Queued;
                    Next::Requeue
                }
                Err(err) => {
                    let missing = matches!(err, DeliveryError::MessageNotFound(_));
                    internal!(
                        level = WARN,
                        "Delivery attempt {} for {message_id} failed: {err}",
                        task.retry_count + 1
                    );
                    task.fail(&err);

                    if missing || task.exhausted(self.config.max_retries) {
                        Next::Abandon
                    } else {
                        Next::AwaitRetry
                    }
                }
            };

            (next, pending)
        };

        if let (Next::Requeue | Next::AwaitRetry, Some(pending)) = (&next, pending) {
            self.narrow_envelope(message_id, pending).await;
        }

        match next {
            Next::Delivered => {
                if self.active.remove(message_id).is_some() {
                    internal!(level = INFO, "Delivered {message_id}");
                    self.counters.delivered();
                    self.discard_body(message_id).await;
                }
            }
            Next::Requeue => self.queue.push(message_id.to_string()),
            Next::AwaitRetry => {}
            Next::Abandon => {
                if let Some((_, task)) = self.active.remove(message_id) {
                    self.abandon(task).await;
                }
            }
        }
    }

    /// Try every pending recipient once. Returns the recipients delivered to
    /// alongside the overall outcome.
    async fn attempt(
        &self,
        message_id: &str,
        recipients: &[String],
    ) -> (Vec<String>, Result<(), DeliveryError>) {
        let message = match self.store.fetch(message_id).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                return (
                    Vec::new(),
                    Err(DeliveryError::MessageNotFound(message_id.to_string())),
                );
            }
            Err(err) => return (Vec::new(), Err(err.into())),
        };

        let body = message.content();
        let mut delivered = Vec::with_capacity(recipients.len());
        let mut failed = 0;
        let mut last = None;

        for recipient in recipients {
            match self.deliver_to(message.from(), recipient, &body).await {
                Ok(()) => delivered.push(recipient.clone()),
                Err(err) => {
                    failed += 1;
                    last = Some(err);
                }
            }
        }

        let result = match last {
            None => Ok(()),
            Some(last) if recipients.len() == 1 => Err(last),
            Some(last) => Err(DeliveryError::Partial {
                failed,
                total: recipients.len(),
                last: Box::new(last),
            }),
        };

        (delivered, result)
    }

    /// Walk the recipient's exchangers in preference order until one accepts.
    /// A permanent refusal stops the walk.
    async fn deliver_to(
        &self,
        from: &str,
        recipient: &str,
        body: &[u8],
    ) -> Result<(), DeliveryError> {
        let failed = |source| DeliveryError::Recipient {
            recipient: recipient.to_string(),
            source,
        };

        let Some(domain) = domain_of(recipient) else {
            return Err(failed(TransferError::NoExchanger(recipient.to_string())));
        };

        let servers = self.resolver.resolve(domain).await;
        let mut last = TransferError::NoExchanger(domain.to_string());

        for server in servers.iter() {
            match self
                .transport
                .transfer(&server.host, server.port, from, recipient, body)
                .await
            {
                Ok(()) => {
                    internal!(
                        level = DEBUG,
                        "Transferred to {recipient} via {}",
                        server.address()
                    );
                    return Ok(());
                }
                Err(err) => {
                    internal!(
                        level = WARN,
                        "Transfer to {recipient} via {} failed: {err}",
                        server.address()
                    );
                    let permanent = err.is_permanent();
                    last = err;
                    if permanent {
                        break;
                    }
                }
            }
        }

        Err(failed(last))
    }

    /// Rewrite the stored envelope so a restart only retries `pending`.
    async fn narrow_envelope(&self, message_id: &str, pending: Vec<String>) {
        let result = match self.store.fetch(message_id).await {
            Ok(Some(message)) => {
                let mut narrowed = Message::new(message.from().to_string(), pending, message.content())
                    .with_received_at(message.received_at());
                narrowed.assign_id(message_id);
                self.store.store(&narrowed).await.map(|_| ())
            }
            Ok(None) => Ok(()),
            Err(err) => Err(err),
        };

        if let Err(err) = result {
            internal!(
                level = WARN,
                "Unable to record delivered recipients for {message_id}: {err}"
            );
        }
    }

    async fn abandon(&self, task: DeliveryTask) {
        internal!(
            level = ERROR,
            "Giving up on {} after {} retries, {} recipient(s) undelivered: {}",
            task.message_id,
            task.retry_count,
            task.recipients.len(),
            task.last_error.as_deref().unwrap_or("unknown error")
        );

        self.counters.failed();
        self.discard_body(&task.message_id).await;
    }

    async fn discard_body(&self, message_id: &str) {
        if let Err(err) = self.store.remove(message_id).await {
            internal!(
                level = WARN,
                "Unable to remove relay body for {message_id}: {err}"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tern_mailbox::MemoryMessageStore;

    use super::*;
    use crate::config::{DomainConfig, DomainConfigRegistry};

    #[derive(Debug, Default)]
    struct MockTransport {
        failing_hosts: Vec<String>,
        fail_all: bool,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl MockTransport {
        fn failing(hosts: &[&str]) -> Self {
            Self {
                failing_hosts: hosts.iter().map(ToString::to_string).collect(),
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn transfer(
            &self,
            host: &str,
            _port: u16,
            _from: &str,
            to: &str,
            _body: &[u8],
        ) -> Result<(), TransferError> {
            self.calls.lock().push((host.to_string(), to.to_string()));

            if self.fail_all || self.failing_hosts.iter().any(|failing| failing == host) {
                Err(TransferError::UnexpectedReply {
                    stage: "RCPT TO",
                    code: 451,
                    message: "Try again later".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    struct Fixture {
        engine: DeliveryEngine,
        store: Arc<MemoryMessageStore>,
        transport: Arc<MockTransport>,
    }

    fn fixture(transport: MockTransport, workers: usize) -> Fixture {
        fixture_with_store(transport, workers, Arc::new(MemoryMessageStore::new()))
    }

    fn fixture_with_store(
        transport: MockTransport,
        workers: usize,
        store: Arc<MemoryMessageStore>,
    ) -> Fixture {
        let mut overrides = DomainConfigRegistry::new();
        overrides.insert("good.test", DomainConfig::with_mx_override("good-mx:25"));
        overrides.insert("bad.test", DomainConfig::with_mx_override("bad-mx:25"));

        let config = DeliveryConfig {
            workers,
            poll_interval_ms: 10,
            retry_interval_secs: 3600,
            shutdown_timeout_secs: 2,
            ..DeliveryConfig::default()
        };

        let transport = Arc::new(transport);
        let engine = DeliveryEngine::new(
            config,
            Arc::clone(&store) as Arc<dyn MessageStore>,
            Arc::new(MxResolver::offline(overrides, 25)),
            Arc::clone(&transport) as Arc<dyn Transport>,
        );

        Fixture {
            engine,
            store,
            transport,
        }
    }

    async fn stored(store: &MemoryMessageStore, id: &str, recipients: &[&str]) {
        let mut message = Message::new(
            "sender@example.com",
            recipients.iter().map(ToString::to_string).collect(),
            b"Subject: relay\r\n\r\nbody\r\n".to_vec(),
        );
        message.assign_id(id);
        store.store(&message).await.expect("store relay body");
    }

    async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
        for _ in 0..300 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    fn owned(recipients: &[&str]) -> Vec<String> {
        recipients.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn enqueue_dropped_when_not_running() {
        let fixture = fixture(MockTransport::default(), 1);

        assert!(!fixture.engine.enqueue("MSG1", owned(&["a@good.test"])));
        assert_eq!(fixture.engine.active_count(), 0);
        assert_eq!(fixture.engine.stats(), DeliveryStats::default());
    }

    #[tokio::test]
    async fn delivered_task_leaves_active_set() {
        let fixture = fixture(MockTransport::default(), 2);
        stored(&fixture.store, "MSG1", &["a@good.test"]).await;

        fixture.engine.start();
        assert!(fixture.engine.enqueue("MSG1", owned(&["a@good.test"])));

        eventually("delivery", || fixture.engine.stats().delivered == 1).await;

        assert!(fixture.engine.active_task("MSG1").is_none());
        assert!(fixture.store.is_empty());
        assert_eq!(
            fixture.transport.calls(),
            vec![("good-mx".to_string(), "a@good.test".to_string())]
        );

        let stats = fixture.engine.stats();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.failed, 0);
        assert!(stats.running);

        fixture.engine.stop().await;
    }

    #[tokio::test]
    async fn unresolved_domain_falls_back_to_itself() {
        let fixture = fixture(MockTransport::default(), 1);
        stored(&fixture.store, "MSG1", &["a@remote.test"]).await;

        fixture.engine.start();
        fixture.engine.enqueue("MSG1", owned(&["a@remote.test"]));

        eventually("delivery", || fixture.engine.stats().delivered == 1).await;
        assert_eq!(fixture.transport.calls()[0].0, "remote.test");

        fixture.engine.stop().await;
    }

    #[tokio::test]
    async fn failing_task_retried_three_times_then_evicted() {
        let fixture = fixture(
            MockTransport {
                fail_all: true,
                ..MockTransport::default()
            },
            1,
        );
        stored(&fixture.store, "MSG1", &["a@good.test"]).await;

        fixture.engine.start();
        fixture.engine.enqueue("MSG1", owned(&["a@good.test"]));

        for retry in 0..3 {
            eventually("failed attempt", || {
                fixture.engine.active_task("MSG1").is_some_and(|task| {
                    task.status == DeliveryStatus::Failed && task.retry_count == retry
                })
            })
            .await;

            let task = fixture.engine.active_task("MSG1").expect("task still active");
            assert!(
                task.last_error
                    .as_deref()
                    .is_some_and(|error| error.contains("451"))
            );
            assert_eq!(fixture.engine.retry_sweep().await, 1);
        }

        eventually("eviction", || fixture.engine.active_task("MSG1").is_none()).await;

        let stats = fixture.engine.stats();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.retried, 3);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.delivered, 0);
        assert_eq!(fixture.transport.calls().len(), 4);
        assert!(fixture.store.is_empty());

        fixture.engine.stop().await;
    }

    #[tokio::test]
    async fn partial_failure_keeps_only_pending_recipients() {
        let fixture = fixture(MockTransport::failing(&["bad-mx"]), 1);
        stored(&fixture.store, "MSG1", &["x@good.test", "y@bad.test"]).await;

        fixture.engine.start();
        fixture
            .engine
            .enqueue("MSG1", owned(&["x@good.test", "y@bad.test"]));

        eventually("failed attempt", || {
            fixture
                .engine
                .active_task("MSG1")
                .is_some_and(|task| task.status == DeliveryStatus::Failed)
        })
        .await;

        let task = fixture.engine.active_task("MSG1").expect("task still active");
        assert_eq!(task.recipients, vec!["y@bad.test"]);
        assert!(
            task.last_error
                .as_deref()
                .is_some_and(|error| error.starts_with("1 of 2 recipients failed"))
        );

        assert_eq!(fixture.engine.retry_sweep().await, 1);
        eventually("second attempt", || {
            fixture
                .engine
                .active_task("MSG1")
                .is_some_and(|task| task.status == DeliveryStatus::Failed && task.retry_count == 1)
        })
        .await;

        let good_calls = fixture
            .transport
            .calls()
            .iter()
            .filter(|(host, _)| host == "good-mx")
            .count();
        assert_eq!(good_calls, 1);
        assert_eq!(fixture.store.len(), 1);

        fixture.engine.stop().await;
    }

    #[tokio::test]
    async fn restart_resumes_pending_recipients() {
        let store = Arc::new(MemoryMessageStore::new());
        stored(&store, "MSG1", &["x@good.test", "y@bad.test"]).await;

        let first = fixture_with_store(MockTransport::failing(&["bad-mx"]), 1, Arc::clone(&store));
        first.engine.start();
        first.engine.enqueue("MSG1", owned(&["x@good.test", "y@bad.test"]));

        eventually("failed attempt", || {
            first
                .engine
                .active_task("MSG1")
                .is_some_and(|task| task.status == DeliveryStatus::Failed)
        })
        .await;
        first.engine.stop().await;

        // Only the undelivered recipient is left on record
        let kept = store.fetch("MSG1").await.unwrap().expect("body kept");
        assert_eq!(kept.recipients(), ["y@bad.test".to_string()].as_slice());
        assert_eq!(kept.raw_content(), b"Subject: relay\r\n\r\nbody\r\n");

        let second = fixture_with_store(MockTransport::default(), 1, Arc::clone(&store));
        second.engine.start();
        assert_eq!(second.engine.recover().await, 1);

        eventually("delivery", || second.engine.stats().delivered == 1).await;
        assert_eq!(
            second.transport.calls(),
            vec![("bad-mx".to_string(), "y@bad.test".to_string())]
        );
        assert!(store.is_empty());

        second.engine.stop().await;
    }

    #[tokio::test]
    async fn recovery_discards_bodies_without_recipients() {
        let fixture = fixture(MockTransport::default(), 0);
        stored(&fixture.store, "EMPTY", &[]).await;
        stored(&fixture.store, "MSG1", &["a@good.test"]).await;

        // Nothing happens until the engine runs
        assert_eq!(fixture.engine.recover().await, 0);
        assert_eq!(fixture.store.len(), 2);

        fixture.engine.start();
        assert_eq!(fixture.engine.recover().await, 1);
        assert_eq!(fixture.store.len(), 1);

        let task = fixture.engine.active_task("MSG1").expect("task queued");
        assert_eq!(task.recipients, vec!["a@good.test"]);
        assert_eq!(task.retry_count, 0);

        // Already active, so a second pass adds nothing
        assert_eq!(fixture.engine.recover().await, 0);
        assert_eq!(fixture.engine.stats().queued, 1);

        fixture.engine.stop().await;
    }

    #[tokio::test]
    async fn missing_body_abandons_task() {
        let fixture = fixture(MockTransport::default(), 1);

        fixture.engine.start();
        fixture.engine.enqueue("GONE", owned(&["a@good.test"]));

        eventually("abandonment", || fixture.engine.stats().failed == 1).await;
        assert!(fixture.engine.active_task("GONE").is_none());
        assert!(fixture.transport.calls().is_empty());

        fixture.engine.stop().await;
    }

    #[tokio::test]
    async fn repeated_enqueue_merges_recipients() {
        // No workers, so the task stays queued
        let fixture = fixture(MockTransport::default(), 0);
        fixture.engine.start();

        assert!(fixture.engine.enqueue("MSG1", owned(&["a@good.test"])));
        assert!(
            fixture
                .engine
                .enqueue("MSG1", owned(&["A@good.test", "b@good.test"]))
        );

        let task = fixture.engine.active_task("MSG1").expect("task queued");
        assert_eq!(task.status, DeliveryStatus::Queued);
        assert_eq!(task.recipients, vec!["a@good.test", "b@good.test"]);
        assert_eq!(fixture.engine.stats().queued, 1);

        fixture.engine.stop().await;
    }

    #[tokio::test]
    async fn stop_rejects_work_and_cancels_sweep() {
        let fixture = fixture(MockTransport::default(), 2);
        fixture.engine.start();
        assert!(fixture.engine.is_running());

        tokio::time::timeout(Duration::from_secs(1), fixture.engine.stop())
            .await
            .expect("stop completes promptly");

        assert!(!fixture.engine.stats().running);
        assert!(!fixture.engine.enqueue("MSG1", owned(&["a@good.test"])));
        assert_eq!(fixture.engine.retry_sweep().await, 0);

        // A second stop is a no-op
        fixture.engine.stop().await;
    }

    #[tokio::test]
    async fn serve_stops_on_shutdown() {
        let fixture = fixture(MockTransport::default(), 1);
        let (tx, rx) = broadcast::channel(4);

        let engine = fixture.engine.clone();
        let handle = tokio::spawn(async move { engine.serve(rx).await });

        eventually("start", || fixture.engine.is_running()).await;
        tx.send(Signal::Shutdown).expect("engine is listening");

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("serve returns")
            .expect("serve does not panic");
        assert!(!fixture.engine.is_running());
    }
}
