// ============================================================================
// Sessions
// ============================================================================
//
// The participant side of the lifecycle: who is connected, how they are
// kicked and tagged, and the per-participant record access session.
//
//   Participant     - one connected entity (trait; `Player` is ours)
//   SessionSource   - membership events (trait; `Roster` is ours)
//   RecordSession   - one participant bound to one record load
//   SessionTable    - live and finalizing sessions per identity
//
// ============================================================================

pub mod access;
pub mod table;

pub use access::{RecordSession, SessionState};
pub use table::SessionTable;

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Tag added once a participant's record is usable.
pub const DATA_LOADED_TAG: &str = "DataLoaded";

pub trait Participant: Send + Sync {
    fn user_id(&self) -> u64;

    fn display_name(&self) -> &str;

    fn account_age_days(&self) -> u32;

    /// Removes the participant with a message shown to them.
    fn kick(&self, message: &str);

    fn add_tag(&self, tag: &str);

    fn has_tag(&self, tag: &str) -> bool;
}

pub type ParticipantRef = Arc<dyn Participant>;

/// In-process participant. Remembers kicks and tags so hosts and tests can
/// inspect them.
#[derive(Debug)]
pub struct Player {
    user_id: u64,
    display_name: String,
    account_age_days: u32,
    tags: Mutex<HashSet<String>>,
    kicks: Mutex<Vec<String>>,
}

impl Player {
    pub fn new(user_id: u64, display_name: &str, account_age_days: u32) -> Self {
        Self {
            user_id,
            display_name: display_name.to_string(),
            account_age_days,
            tags: Mutex::new(HashSet::new()),
            kicks: Mutex::new(Vec::new()),
        }
    }

    pub fn shared(user_id: u64, display_name: &str, account_age_days: u32) -> Arc<Self> {
        Arc::new(Self::new(user_id, display_name, account_age_days))
    }

    pub fn kick_messages(&self) -> Vec<String> {
        self.kicks.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn was_kicked(&self) -> bool {
        !self.kick_messages().is_empty()
    }
}

impl Participant for Player {
    fn user_id(&self) -> u64 {
        self.user_id
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn account_age_days(&self) -> u32 {
        self.account_age_days
    }

    fn kick(&self, message: &str) {
        self.kicks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(message.to_string());
    }

    fn add_tag(&self, tag: &str) {
        self.tags
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(tag.to_string());
    }

    fn has_tag(&self, tag: &str) -> bool {
        self.tags
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(tag)
    }
}

#[derive(Clone)]
pub enum SessionEvent {
    Joined(ParticipantRef),
    Leaving(ParticipantRef),
}

impl fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::Joined(p) => write!(f, "Joined({})", p.user_id()),
            SessionEvent::Leaving(p) => write!(f, "Leaving({})", p.user_id()),
        }
    }
}

pub trait SessionSource: Send + Sync {
    /// Everyone connected right now.
    fn participants(&self) -> Vec<ParticipantRef>;

    /// Membership events from now on, in order.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent>;
}

#[derive(Default)]
struct RosterInner {
    members: BTreeMap<u64, ParticipantRef>,
    subscribers: Vec<mpsc::UnboundedSender<SessionEvent>>,
}

/// A local [`SessionSource`] driven by explicit `join`/`leave` calls.
#[derive(Default)]
pub struct Roster {
    inner: Mutex<RosterInner>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, participant: ParticipantRef) {
        let mut inner = self.lock();
        inner
            .members
            .insert(participant.user_id(), Arc::clone(&participant));
        Self::broadcast(&mut inner, SessionEvent::Joined(participant));
    }

    /// Returns false if nobody with that id was connected.
    pub fn leave(&self, user_id: u64) -> bool {
        let mut inner = self.lock();
        match inner.members.remove(&user_id) {
            Some(participant) => {
                Self::broadcast(&mut inner, SessionEvent::Leaving(participant));
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn broadcast(inner: &mut RosterInner, event: SessionEvent) {
        inner
            .subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RosterInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl SessionSource for Roster {
    fn participants(&self) -> Vec<ParticipantRef> {
        self.lock().members.values().cloned().collect()
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_player_records_kicks_and_tags() {
        let player = Player::new(9, "Nova", 12);
        assert!(!player.has_tag(DATA_LOADED_TAG));
        player.add_tag(DATA_LOADED_TAG);
        player.kick("bye");
        assert!(player.has_tag(DATA_LOADED_TAG));
        assert_eq!(player.kick_messages(), vec!["bye".to_string()]);
    }

    #[tokio::test]
    async fn test_roster_events_in_order() {
        let roster = Roster::new();
        let mut events = roster.subscribe();
        roster.join(Player::shared(1, "A", 10));
        roster.join(Player::shared(2, "B", 10));
        assert!(roster.leave(1));
        assert!(!roster.leave(1));

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(format!("{:?}", events.recv().await.unwrap()));
        }
        assert_eq!(seen, vec!["Joined(1)", "Joined(2)", "Leaving(1)"]);
        assert_eq!(roster.participants().len(), 1);
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let roster = Roster::new();
        drop(roster.subscribe());
        roster.join(Player::shared(1, "A", 10));
        assert!(roster.lock().subscribers.is_empty());
    }
}
