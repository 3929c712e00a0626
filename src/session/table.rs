use super::access::RecordSession;
use std::collections::HashMap;
use std::sync::Arc;

/// Sessions by user id. At most one live session per identity; detached
/// sessions stay listed under `closing` until their finalization is done.
#[derive(Debug, Default)]
pub struct SessionTable {
    live: HashMap<u64, Arc<RecordSession>>,
    closing: HashMap<u64, Vec<Arc<RecordSession>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live(&self, user_id: u64) -> Option<Arc<RecordSession>> {
        self.live.get(&user_id).cloned()
    }

    pub fn closing(&self, user_id: u64) -> Vec<Arc<RecordSession>> {
        self.closing.get(&user_id).cloned().unwrap_or_default()
    }

    pub fn insert(&mut self, session: Arc<RecordSession>) {
        self.live.insert(session.user_id(), session);
    }

    /// Moves the live session for `user_id` to the closing list.
    pub fn detach(&mut self, user_id: u64) -> Option<Arc<RecordSession>> {
        let session = self.live.remove(&user_id)?;
        self.closing
            .entry(user_id)
            .or_default()
            .push(Arc::clone(&session));
        Some(session)
    }

    /// Like [`detach`](Self::detach), but only if `session` is the live one.
    pub fn detach_session(&mut self, session: &Arc<RecordSession>) -> bool {
        match self.live.get(&session.user_id()) {
            Some(current) if Arc::ptr_eq(current, session) => {
                self.detach(session.user_id());
                true
            }
            _ => false,
        }
    }

    pub fn remove_closing(&mut self, session: &Arc<RecordSession>) -> bool {
        let user_id = session.user_id();
        let Some(list) = self.closing.get_mut(&user_id) else {
            return false;
        };
        let before = list.len();
        list.retain(|entry| !Arc::ptr_eq(entry, session));
        let removed = list.len() != before;
        if list.is_empty() {
            self.closing.remove(&user_id);
        }
        removed
    }

    pub fn live_sessions(&self) -> Vec<Arc<RecordSession>> {
        self.live.values().cloned().collect()
    }

    pub fn closing_sessions(&self) -> Vec<Arc<RecordSession>> {
        self.closing.values().flatten().cloned().collect()
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}
