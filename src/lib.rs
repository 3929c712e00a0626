// ============================================================================
// DataSockets Library
// ============================================================================
//
// Per-participant persistent records for live multi-user services: load on
// connect, reconcile against a default shape, autosave, wipe on request and
// save-and-release on disconnect.
//
// ============================================================================

pub mod codec;
pub mod config;
pub mod core;
pub mod manager;
pub mod record;
pub mod rules;
pub mod schema;
pub mod session;
pub mod signal;
pub mod storage;
pub mod tracker;

// Re-export main types for convenience
pub use config::DataOptions;
pub use core::{Color, DataError, FieldMap, FieldValue, Pose, Result, Vec3};
pub use manager::{Constructed, DataChanged, DataSockets};
pub use record::{FieldUpdate, Record, RecordMetadata};
pub use rules::{EligibilityRules, RecordPresence, Rule, ShutdownFlag, Verdict};
pub use schema::{TemplateKind, TemplateNode, resolve_structure};
pub use session::{
    Participant, ParticipantRef, Player, RecordSession, Roster, SessionEvent, SessionSource,
    SessionState,
};
pub use signal::{Connection, Signal};
pub use storage::{
    DataNetwork, LoadFallback, LoadIssue, LoadIssueKind, LoadMethod, StorageBackend,
};
pub use tracker::Scope;
