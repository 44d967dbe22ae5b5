//! Build and job status.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Status of a build or job.
///
/// Variants are declared in severity order, so `Ord` can be used to pick
/// the strongest status observed across a set of jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Queued,
    Running,
    Passed,
    PassedWithFailures,
    Failed,
    Killed,
    TimedOut,
}

/// Returned when decoding a status token that is not part of the codec.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown status: {0}")]
pub struct UnknownStatus(pub String);

impl Status {
    /// All statuses in severity order.
    pub const ALL: [Status; 7] = [
        Status::Queued,
        Status::Running,
        Status::Passed,
        Status::PassedWithFailures,
        Status::Failed,
        Status::Killed,
        Status::TimedOut,
    ];

    /// Wire form of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Queued => "queued",
            Status::Running => "running",
            Status::Passed => "passed",
            Status::PassedWithFailures => "passed_with_failures",
            Status::Failed => "failed",
            Status::Killed => "killed",
            Status::TimedOut => "timed_out",
        }
    }

    /// Whether the status is final.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Status::Queued | Status::Running)
    }

    /// Whether the status counts as a failed outcome.
    pub fn is_failure(&self) -> bool {
        matches!(self, Status::Failed | Status::Killed | Status::TimedOut)
    }

    fn phase(&self) -> u8 {
        match self {
            Status::Queued => 0,
            Status::Running => 1,
            _ => 2,
        }
    }

    /// Statuses only move forward: queued, then running, then one terminal
    /// status. A terminal status never changes.
    pub fn can_transition_to(&self, next: Status) -> bool {
        next.phase() > self.phase()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .iter()
            .copied()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}
