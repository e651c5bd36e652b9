//! Bookkeeping for live inbound sessions.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use parking_lot::Mutex;
use tern_common::internal;
use tokio::sync::Notify;

/// A snapshot of one live session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub peer: SocketAddr,
    pub connected_at: Instant,
    pub last_activity: Instant,
    kill: Arc<Notify>,
}

impl SessionInfo {
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

/// Tracks every accepted connection and enforces the connection limit.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionInfo, ahash::RandomState>,
    active: AtomicUsize,
    counter: AtomicU64,
    rng: Mutex<rand::rngs::StdRng>,
    max_connections: usize,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(max_connections: usize) -> Self {
        use rand::SeedableRng;

        Self {
            sessions: DashMap::default(),
            active: AtomicUsize::new(0),
            counter: AtomicU64::new(0),
            rng: Mutex::new(rand::rngs::StdRng::from_os_rng()),
            max_connections,
        }
    }

    #[must_use]
    pub const fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Claim a slot for a new connection.
    ///
    /// Returns `None` when the registry is full. The slot is released when
    /// the returned guard is dropped.
    pub fn register(self: &Arc<Self>, peer: SocketAddr) -> Option<SessionGuard> {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (active < self.max_connections).then_some(active + 1)
            })
            .ok()?;

        let id = self.next_id();
        let now = Instant::now();
        let kill = Arc::new(Notify::new());

        self.sessions.insert(
            id.clone(),
            SessionInfo {
                id: id.clone(),
                peer,
                connected_at: now,
                last_activity: now,
                kill: Arc::clone(&kill),
            },
        );

        internal!(level = DEBUG, "Registered {id} for {peer}");

        Some(SessionGuard {
            registry: Arc::clone(self),
            id,
            kill,
        })
    }

    fn next_id(&self) -> String {
        use rand::Rng;

        let sequence = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let suffix: u32 = self.rng.lock().random();
        format!("session-{sequence}-{suffix:08x}")
    }

    /// Record activity for `id`.
    pub fn touch(&self, id: &str) {
        if let Some(mut info) = self.sessions.get_mut(id) {
            info.last_activity = Instant::now();
        }
    }

    #[must_use]
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Drop every session idle for longer than `max_idle`, telling each one
    /// to close. Returns how many were removed.
    pub fn cleanup_expired(&self, max_idle: Duration) -> usize {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.idle_for() > max_idle)
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for id in expired {
            if let Some((_, info)) = self.sessions.remove(&id) {
                info.kill.notify_one();
                removed += 1;
                internal!(level = INFO, "Expired idle session {id} from {}", info.peer);
            }
        }

        removed
    }

    /// Tell every session to close and forget them all.
    pub fn shutdown(&self) {
        for entry in &self.sessions {
            entry.kill.notify_one();
        }
        self.sessions.clear();
    }
}

/// Holds a registry slot for the lifetime of a session.
#[derive(Debug)]
pub struct SessionGuard {
    registry: Arc<SessionRegistry>,
    id: String,
    kill: Arc<Notify>,
}

impl SessionGuard {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn touch(&self) {
        self.registry.touch(&self.id);
    }

    /// Notified when the registry wants this session closed.
    #[must_use]
    pub fn kill_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.kill)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.sessions.remove(&self.id);
        self.registry.active.fetch_sub(1, Ordering::AcqRel);
        internal!(level = DEBUG, "Unregistered {}", self.id);
    }
}
