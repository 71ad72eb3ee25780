//! Registry of live terminal sessions
//!
//! Each session owns one container from the [ContainerPool] until it is
//! terminated, either explicitly, by the idle sweep, or at shutdown.

use crate::{
    errors::SessionError,
    pool::ContainerPool,
    runtime::{ContainerId, Runtime},
};
use parking_lot::Mutex;
use rand::{rngs::OsRng, RngCore};
use std::{borrow::Borrow, collections::HashMap, fmt, sync::Arc, time::Duration};
use tokio::{
    sync::Notify,
    task::JoinHandle,
    time::{self, Instant},
};

/// Bytes of OS randomness behind each session secret
const SECRET_LEN: usize = 32;

/// Capacity and liveness limits for sessions
#[derive(Debug, Clone)]
pub struct Limits {
    /// Maximum active sessions across all origins
    pub max_sessions: usize,
    /// Maximum active sessions held by one origin
    pub max_sessions_per_origin: usize,
    /// How long a session may go without a heartbeat
    pub idle_timeout: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_sessions: 20,
            max_sessions_per_origin: 2,
            idle_timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// Public identifier of a session
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SessionId(String);

impl SessionId {
    fn generate() -> Self {
        SessionId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Lifecycle stage of a session
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SessionStatus {
    Active,
    /// Destruction has begun; the session is about to be removed
    Terminating,
}

/// One session and the container it owns
#[derive(Clone)]
pub struct Session {
    pub session_id: SessionId,
    pub container_id: ContainerId,
    pub status: SessionStatus,
    pub last_heartbeat_at: Instant,
    /// Who created the session, for per-origin limits
    pub origin: String,
    secret: String,
}

impl Session {
    /// Token required alongside the id to open the session's terminal
    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Check a presented secret without leaking timing information
    pub fn secret_matches(&self, presented: &str) -> bool {
        constant_time_eq(self.secret.as_bytes(), presented.as_bytes())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("container_id", &self.container_id)
            .field("status", &self.status)
            .field("last_heartbeat_at", &self.last_heartbeat_at)
            .field("origin", &self.origin)
            .finish()
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_LEN];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[derive(Debug, Default)]
struct RegistryState {
    sessions: HashMap<SessionId, Session>,
    // Sessions whose container is still being allocated. They count against
    // the limits exactly like active ones.
    pending: HashMap<String, usize>,
    // Set at shutdown; no reservation is granted afterwards.
    closed: bool,
}

impl RegistryState {
    fn active_count(&self) -> usize {
        self.sessions.values().filter(|s| s.is_active()).count()
    }

    fn active_count_for(&self, origin: &str) -> usize {
        self.sessions
            .values()
            .filter(|s| s.is_active() && s.origin == origin)
            .count()
    }

    fn pending_total(&self) -> usize {
        self.pending.values().sum()
    }

    fn pending_for(&self, origin: &str) -> usize {
        self.pending.get(origin).copied().unwrap_or(0)
    }

    fn release_pending(&mut self, origin: &str) {
        if let Some(count) = self.pending.get_mut(origin) {
            *count -= 1;
            if *count == 0 {
                self.pending.remove(origin);
            }
        }
    }
}

/// A capacity slot held while a session's container is allocated
///
/// Dropping the reservation gives the slot back, which also covers a
/// creation future that is cancelled part way through.
struct Reservation<'a> {
    registry: &'a SessionRegistry,
    origin: String,
    committed: bool,
}

impl Reservation<'_> {
    /// Swap the pending slot for an active session under one lock
    fn commit(mut self, session: Session) {
        let mut state = self.registry.state.lock();
        state.release_pending(&self.origin);
        state.sessions.insert(session.session_id.clone(), session);
        self.committed = true;
        self.registry.settled.notify_waiters();
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.registry.state.lock().release_pending(&self.origin);
            self.registry.settled.notify_waiters();
        }
    }
}

/// Owner of every session, and the only way to create or end one
pub struct SessionRegistry {
    pool: Arc<ContainerPool>,
    runtime: Arc<dyn Runtime>,
    limits: Limits,
    state: Arc<Mutex<RegistryState>>,
    // Woken whenever a reservation is committed or given back
    settled: Notify,
}

impl SessionRegistry {
    pub fn new(pool: Arc<ContainerPool>, runtime: Arc<dyn Runtime>, limits: Limits) -> Self {
        SessionRegistry {
            pool,
            runtime,
            limits,
            state: Arc::new(Mutex::new(RegistryState::default())),
            settled: Notify::new(),
        }
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    fn reserve(&self, origin: &str) -> Result<Reservation<'_>, SessionError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(SessionError::ShuttingDown);
        }
        if state.active_count() + state.pending_total() >= self.limits.max_sessions {
            return Err(SessionError::GlobalCapacityExceeded);
        }
        if state.active_count_for(origin) + state.pending_for(origin)
            >= self.limits.max_sessions_per_origin
        {
            return Err(SessionError::OriginCapacityExceeded);
        }
        *state.pending.entry(origin.to_string()).or_insert(0) += 1;
        Ok(Reservation {
            registry: self,
            origin: origin.to_string(),
            committed: false,
        })
    }

    /// Create a session for `origin`, backed by a container from the pool
    pub async fn create_session(&self, origin: &str) -> Result<Session, SessionError> {
        let reservation = self.reserve(origin)?;
        let container_id = self.pool.allocate().await?;

        let session = Session {
            session_id: SessionId::generate(),
            container_id,
            status: SessionStatus::Active,
            last_heartbeat_at: Instant::now(),
            origin: origin.to_string(),
            secret: generate_secret(),
        };
        reservation.commit(session.clone());
        log::info!(
            "created session {} for {} with container {}",
            session.session_id,
            origin,
            session.container_id
        );
        Ok(session)
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.state.lock().sessions.get(session_id).cloned()
    }

    /// Look up an active session whose secret matches
    pub fn authorize(&self, session_id: &str, secret: &str) -> Option<Session> {
        self.get(session_id)
            .filter(|session| session.is_active() && session.secret_matches(secret))
    }

    /// Record a heartbeat, if the session is still active
    pub fn touch(&self, session_id: &str) {
        if let Some(session) = self.state.lock().sessions.get_mut(session_id) {
            if session.is_active() {
                session.last_heartbeat_at = Instant::now();
            }
        }
    }

    /// Refuse any further sessions, then wait for creations already under
    /// way to either commit or fail
    ///
    /// Once this returns, [SessionRegistry::export_all()] lists every session
    /// that will ever exist.
    pub async fn close(&self) {
        loop {
            let settled = self.settled.notified();
            {
                let mut state = self.state.lock();
                state.closed = true;
                if state.pending_total() == 0 {
                    break;
                }
                log::info!(
                    "waiting for {} session creations to settle",
                    state.pending_total()
                );
            }
            settled.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// End a session and destroy its container
    ///
    /// Only the first call for a session does anything. The session is
    /// removed once the destroy has been attempted, whether or not it worked.
    /// The destroy and removal run in their own task, so they complete even
    /// if the caller stops waiting.
    pub async fn terminate(&self, session_id: &str) {
        let container_id = {
            let mut state = self.state.lock();
            match state.sessions.get_mut(session_id) {
                Some(session) if session.is_active() => {
                    session.status = SessionStatus::Terminating;
                    session.container_id.clone()
                }
                _ => return,
            }
        };
        log::info!(
            "terminating session {} with container {}",
            session_id,
            container_id
        );

        self.pool.mark_terminating(&container_id);

        let pool = self.pool.clone();
        let runtime = self.runtime.clone();
        let state = self.state.clone();
        let session_id = session_id.to_string();
        let cleanup = tokio::spawn(async move {
            if let Err(err) = runtime.destroy(&container_id).await {
                log::error!("failed to destroy container {}, {}", container_id, err);
            }
            pool.forget(&container_id);
            state.lock().sessions.remove(session_id.as_str());
        });
        if let Err(err) = cleanup.await {
            log::error!("session cleanup task failed, {}", err);
        }
    }

    /// Start terminating every active session that missed its heartbeats
    ///
    /// Terminations run as independent tasks; the returned handles may be
    /// awaited or simply dropped.
    pub fn sweep_idle(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let now = Instant::now();
        let expired: Vec<SessionId> = self
            .state
            .lock()
            .sessions
            .values()
            .filter(|s| {
                s.is_active() && now.duration_since(s.last_heartbeat_at) > self.limits.idle_timeout
            })
            .map(|s| s.session_id.clone())
            .collect();

        expired
            .into_iter()
            .map(|session_id| {
                log::info!("session {} idle timeout", session_id);
                let registry = self.clone();
                tokio::spawn(async move { registry.terminate(session_id.as_str()).await })
            })
            .collect()
    }

    /// Run [SessionRegistry::sweep_idle()] forever, once per `period`
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                let started = registry.sweep_idle();
                if !started.is_empty() {
                    log::debug!("idle sweep terminating {} sessions", started.len());
                }
            }
        })
    }

    /// Snapshot of every session, active or terminating
    pub fn export_all(&self) -> Vec<Session> {
        self.state.lock().sessions.values().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active_count()
    }

    /// Number of sessions, including ones still terminating
    pub fn len(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
