use super::ParticipantRef;
use crate::record::Record;
use crate::tracker::Scope;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// ```text
/// Loading ──> Active ──┐
///    │                 ├──> Finalizing ──> Closed
///    ├─────────────────┘
///    └──> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Loading,
    Active,
    Failed,
    Finalizing,
    Closed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Failed | SessionState::Closed)
    }

    fn can_become(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Loading, Active)
                | (Loading, Failed)
                | (Loading, Finalizing)
                | (Active, Finalizing)
                | (Finalizing, Closed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Loading => "loading",
            SessionState::Active => "active",
            SessionState::Failed => "failed",
            SessionState::Finalizing => "finalizing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// One participant's claim on one record.
///
/// Everything the session acquires (the load task, the relay from record
/// updates to the manager) is registered in its [`Scope`] and released
/// together when the session ends.
pub struct RecordSession {
    participant: ParticipantRef,
    key: String,
    scope: Scope,
    state: watch::Sender<SessionState>,
    record: Mutex<Option<Arc<Record>>>,
    load: Mutex<Option<JoinHandle<()>>>,
    announced: AtomicBool,
    published: AtomicBool,
    predecessors: Mutex<Vec<Arc<RecordSession>>>,
}

impl RecordSession {
    /// `predecessors` are earlier sessions for the same identity that are
    /// still finalizing; the load must not start before they close.
    pub fn new(
        participant: ParticipantRef,
        key: String,
        predecessors: Vec<Arc<RecordSession>>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::Loading);
        Arc::new(Self {
            participant,
            key,
            scope: Scope::new(),
            state,
            record: Mutex::new(None),
            load: Mutex::new(None),
            announced: AtomicBool::new(false),
            published: AtomicBool::new(false),
            predecessors: Mutex::new(predecessors),
        })
    }

    pub fn participant(&self) -> &ParticipantRef {
        &self.participant
    }

    pub fn user_id(&self) -> u64 {
        self.participant.user_id()
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Moves to `next` if the current state allows it.
    pub fn transition(&self, next: SessionState) -> bool {
        self.state.send_if_modified(|current| {
            if current.can_become(next) {
                *current = next;
                true
            } else {
                false
            }
        })
    }

    pub fn record(&self) -> Option<Arc<Record>> {
        lock(&self.record).clone()
    }

    pub fn set_record(&self, record: Arc<Record>) {
        *lock(&self.record) = Some(record);
    }

    pub fn attach_load(&self, handle: JoinHandle<()>) {
        *lock(&self.load) = Some(handle);
    }

    pub fn take_load(&self) -> Option<JoinHandle<()>> {
        lock(&self.load).take()
    }

    pub fn take_predecessors(&self) -> Vec<Arc<RecordSession>> {
        std::mem::take(&mut *lock(&self.predecessors))
    }

    /// Set right before `constructed` fires; record updates are relayed
    /// as `changed` from then on.
    pub fn mark_announced(&self) {
        self.announced.store(true, Ordering::SeqCst);
    }

    pub fn is_announced(&self) -> bool {
        self.announced.load(Ordering::SeqCst)
    }

    /// Set once `constructed` has been delivered. Wakes [`wait_settled`](Self::wait_settled).
    pub fn publish(&self) {
        self.published.store(true, Ordering::SeqCst);
        self.state.send_modify(|_| {});
    }

    pub fn is_published(&self) -> bool {
        self.published.load(Ordering::SeqCst)
    }

    /// Waits until the load has finished one way or another. An active
    /// session only counts once it has been published.
    pub async fn wait_settled(&self) -> SessionState {
        self.wait_until(|state| match state {
            SessionState::Loading => false,
            SessionState::Active => self.is_published(),
            _ => true,
        })
        .await
    }

    pub async fn wait_closed(&self) -> SessionState {
        self.wait_until(SessionState::is_terminal).await
    }

    async fn wait_until(&self, ready: impl FnMut(&SessionState) -> bool) -> SessionState {
        let mut rx = self.state.subscribe();
        match rx.wait_for(ready).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }
}

impl fmt::Debug for RecordSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordSession")
            .field("user_id", &self.user_id())
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}
