//! Capsule lifecycle state machine
//!
//! ```text
//! CREATED ─▶ RUNNING ─▶ COMPLETED
//!               │  ▲
//!               │  ├──── ASSISTED ◀─┐
//!               ▼  │                │
//!             BLOCKED ──────────────┤
//!               │  └──── ESCALATED ◀┘
//!               ▼            │
//!             FAILED ◀───────┘
//! ```
//!
//! `COMPLETED` and `FAILED` end an attempt. A later attempt on the same id
//! re-enters `RUNNING`.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CapsuleState {
    #[default]
    Created,
    Running,
    Blocked,
    Assisted,
    Escalated,
    Completed,
    Failed,
}

impl CapsuleState {
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Running => "RUNNING",
            Self::Blocked => "BLOCKED",
            Self::Assisted => "ASSISTED",
            Self::Escalated => "ESCALATED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub const fn valid_transitions(&self) -> &'static [Self] {
        match self {
            Self::Created => &[Self::Running],
            Self::Running => &[Self::Completed, Self::Blocked, Self::Failed],
            Self::Blocked => &[Self::Assisted, Self::Escalated, Self::Failed],
            Self::Assisted | Self::Escalated => &[Self::Running, Self::Failed],
            // a new attempt on a finished capsule
            Self::Completed | Self::Failed => &[Self::Running],
        }
    }

    pub fn can_transition_to(&self, target: Self) -> bool {
        self.valid_transitions().contains(&target)
    }
}

impl fmt::Display for CapsuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
