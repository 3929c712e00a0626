// ============================================================================
// Eligibility Rules
// ============================================================================
//
// Decides whether a participant may obtain a record. Checks run in a fixed
// order and the first broken rule wins:
//
//   1. account younger than the configured minimum  -> TooNew
//   2. record absent                                 -> NoRecord
//   3. service shutting down                         -> ShuttingDown
//
// ============================================================================

use crate::session::Participant;
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rule {
    NoRecord,
    TooNew,
    ShuttingDown,
}

struct RuleMessages {
    server: &'static str,
    player: &'static str,
}

lazy_static! {
    static ref RULE_MESSAGES: HashMap<Rule, RuleMessages> = {
        let mut messages = HashMap::new();
        messages.insert(
            Rule::NoRecord,
            RuleMessages {
                server: "Player data for {name} could not be loaded; removing them from the server.",
                player: "Hey {name}, your data could not be loaded. Please rejoin in a moment.",
            },
        );
        messages.insert(
            Rule::TooNew,
            RuleMessages {
                server: "{name} was refused: account is younger than the required minimum age.",
                player: "Sorry {name}, your account is too new to join this experience.",
            },
        );
        messages.insert(
            Rule::ShuttingDown,
            RuleMessages {
                server: "{name} tried to join while the server is shutting down.",
                player: "Sorry {name}, this server is shutting down. Please join another one.",
            },
        );
        messages
    };
}

impl Rule {
    /// Numeric rule code used in operator logs.
    pub fn code(&self) -> u8 {
        match self {
            Rule::NoRecord => 1,
            Rule::TooNew => 2,
            Rule::ShuttingDown => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Rule> {
        match code {
            1 => Some(Rule::NoRecord),
            2 => Some(Rule::TooNew),
            3 => Some(Rule::ShuttingDown),
            _ => None,
        }
    }

    /// `(operator message, user message)` for `display_name`.
    pub fn messages(&self, display_name: &str) -> (String, String) {
        let template = &RULE_MESSAGES[self];
        (
            template.server.replace("{name}", display_name),
            template.player.replace("{name}", display_name),
        )
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Rule::NoRecord => "no-record",
            Rule::TooNew => "too-new",
            Rule::ShuttingDown => "shutting-down",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Violation(Rule),
}

impl Verdict {
    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }

    pub fn rule(&self) -> Option<Rule> {
        match self {
            Verdict::Pass => None,
            Verdict::Violation(rule) => Some(*rule),
        }
    }
}

/// What is known about the participant's record when rules are evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordPresence {
    /// Not loaded yet (connect time).
    Pending,
    Present,
    Absent,
}

impl RecordPresence {
    pub fn of<T>(record: Option<&T>) -> Self {
        if record.is_some() {
            RecordPresence::Present
        } else {
            RecordPresence::Absent
        }
    }
}

/// Service-wide "shutting down" status shared with the rules.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn lower(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct EligibilityRules {
    min_account_age_days: u32,
    shutdown: ShutdownFlag,
}

impl EligibilityRules {
    pub fn new(min_account_age_days: u32, shutdown: ShutdownFlag) -> Self {
        Self {
            min_account_age_days,
            shutdown,
        }
    }

    pub fn min_account_age_days(&self) -> u32 {
        self.min_account_age_days
    }

    pub fn shutdown_flag(&self) -> &ShutdownFlag {
        &self.shutdown
    }

    pub fn evaluate(&self, participant: &dyn Participant, presence: RecordPresence) -> Verdict {
        if participant.account_age_days() < self.min_account_age_days {
            Verdict::Violation(Rule::TooNew)
        } else if presence == RecordPresence::Absent {
            Verdict::Violation(Rule::NoRecord)
        } else if self.shutdown.is_raised() {
            Verdict::Violation(Rule::ShuttingDown)
        } else {
            Verdict::Pass
        }
    }
}
