// icp-core/src/recovery/mod.rs

//! Multi-level recovery validation.
//!
//! Before restarting, every rank of a group checks whether it can recover
//! from a given resilience level: each rank inspects its own files and casts
//! a [`LevelVote`], the votes are exchanged with an all-gather, and every
//! rank evaluates the same votes with the same rule, so the whole group
//! reaches the same verdict.
//!
//! Levels, from cheapest to most robust:
//! 1. Local: each rank's own base file.
//! 2. Partner: a copy of each rank's file held by its right neighbour.
//! 3. Erasure: files plus redundancy files of the group; a bounded number of
//!    losses is tolerated.
//! 4. Global: files on shared storage.

pub mod exchange;
pub mod files;
pub mod validator;
pub mod vote;

pub use exchange::{GroupExchange, InProcessGroup, SoloExchange};
pub use files::LevelFiles;
pub use validator::{evaluate, LevelValidator, VoteCollector};
pub use vote::{Expectation, LevelVote, VoteDetail};

use serde::{Deserialize, Serialize};

/// Redundancy tier a checkpoint can be recovered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResilienceLevel {
    Local,
    Partner,
    Erasure,
    Global,
}

impl ResilienceLevel {
    /// All levels, in validation order.
    pub const ALL: [ResilienceLevel; 4] = [
        ResilienceLevel::Local,
        ResilienceLevel::Partner,
        ResilienceLevel::Erasure,
        ResilienceLevel::Global,
    ];

    /// Level from its number (1..=4).
    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(Self::Local),
            2 => Some(Self::Partner),
            3 => Some(Self::Erasure),
            4 => Some(Self::Global),
            _ => None,
        }
    }

    pub fn number(self) -> u8 {
        match self {
            Self::Local => 1,
            Self::Partner => 2,
            Self::Erasure => 3,
            Self::Global => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Partner => "partner",
            Self::Erasure => "erasure",
            Self::Global => "global",
        }
    }
}

impl std::fmt::Display for ResilienceLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{} ({})", self.number(), self.as_str())
    }
}

/// Group-wide decision for one level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Recoverable,
    NotRecoverable,
}

impl Verdict {
    pub fn is_recoverable(self) -> bool {
        self == Self::Recoverable
    }
}

/// Verdicts of every level that was validated.
///
/// The report does not pick a level; escalation policy is the caller's.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub checkpoint_id: i32,
    pub verdicts: Vec<(ResilienceLevel, Verdict)>,
}

impl RecoveryReport {
    pub fn verdict(&self, level: ResilienceLevel) -> Option<Verdict> {
        self.verdicts
            .iter()
            .find(|(l, _)| *l == level)
            .map(|(_, v)| *v)
    }

    /// Cheapest level the group can recover from, if any.
    pub fn first_recoverable(&self) -> Option<ResilienceLevel> {
        self.verdicts
            .iter()
            .filter(|(_, v)| v.is_recoverable())
            .map(|(l, _)| *l)
            .min()
    }
}
