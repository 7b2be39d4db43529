//! Core data model.
//!
//! An execution record is one invocation of an external long-running tool.
//! Every status change it goes through is appended to a transition log, and
//! activity records are the lines of output it produced along the way. All
//! of it is written by the executor; the relay only ever reads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cursor::{LineKey, StatusKey};
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Newtype for project IDs. A project is the scope of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProjectId(pub Uuid);

impl ProjectId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ProjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ProjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ProjectId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| Error::NotFound(format!("project {s}")))
    }
}

/// Newtype for execution IDs.
///
/// Random, so it carries no ordering information. It is only ever used to
/// break ties between records that share a timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Execution status
// ---------------------------------------------------------------------------

/// Lifecycle status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Accepted by the executor, not started yet.
    Queued,
    /// The tool is running and may be producing output.
    Running,
    /// Finished successfully. Terminal.
    Completed,
    /// Finished unsuccessfully. Terminal.
    Failed,
}

impl ExecutionStatus {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, to),
            (Queued, Running)
                | (Queued, Failed)      // rejected before start
                | (Running, Completed)
                | (Running, Failed)
        )
    }

    /// Is this a terminal status?
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Queued => "queued",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(ExecutionStatus::Queued),
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            other => Err(Error::Other(format!("unknown execution status: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One invocation of an external tool and its status lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    pub project_id: ProjectId,

    /// Command or operation identifier (e.g., "deploy", "test-suite").
    pub kind: String,

    pub status: ExecutionStatus,

    /// Set once at creation, never mutated.
    pub started_at: DateTime<Utc>,

    /// Set on the terminal transition, and only then.
    pub completed_at: Option<DateTime<Utc>>,

    /// Accumulated output. May stay empty until completion.
    pub output: String,
}

/// One status change of an execution. Append-only.
///
/// The status an execution is created with is not a transition; the log
/// starts with the first change after insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub execution_id: ExecutionId,
    pub project_id: ProjectId,
    /// Kind of the execution, copied so the log reads on its own.
    pub kind: String,
    /// Status entered by this transition.
    pub status: ExecutionStatus,
    /// Never earlier than the previous transition of the same execution.
    pub at: DateTime<Utc>,
    /// Strictly increasing within the execution, starting at 0.
    pub seq: i64,
}

impl StatusTransition {
    /// Position of this transition in the coarse subsequence.
    pub fn status_key(&self) -> StatusKey {
        StatusKey {
            at: self.at,
            seq: self.seq,
            execution_id: self.execution_id,
        }
    }
}

/// One line of incremental output belonging to an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub execution_id: ExecutionId,
    pub project_id: ProjectId,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Strictly increasing within the execution. Never reused.
    pub seq: i64,
}

impl ActivityRecord {
    /// Position of this line in the fine subsequence.
    pub fn line_key(&self) -> LineKey {
        LineKey {
            at: self.timestamp,
            seq: self.seq,
            execution_id: self.execution_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Verbosity
// ---------------------------------------------------------------------------

/// Granularity a subscriber asks for. Each tier is a superset of the one below.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Verbosity {
    /// Terminal status transitions only.
    Low = 1,
    /// Every status transition.
    #[default]
    Medium = 2,
    /// Every status transition plus every output line.
    High = 3,
}

impl Verbosity {
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            1 => Some(Verbosity::Low),
            2 => Some(Verbosity::Medium),
            3 => Some(Verbosity::High),
            _ => None,
        }
    }

    pub fn level(self) -> u8 {
        self as u8
    }

    pub fn includes_lines(self) -> bool {
        self == Verbosity::High
    }

    pub fn status_filter(self) -> StatusFilter {
        match self {
            Verbosity::Low => StatusFilter::TerminalOnly,
            Verbosity::Medium | Verbosity::High => StatusFilter::All,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Verbosity::Low => "low",
            Verbosity::Medium => "medium",
            Verbosity::High => "high",
        }
    }
}

impl std::fmt::Display for Verbosity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Verbosity {
    type Err = Error;

    /// Accepts `1..3` or a tier name.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Ok(level) = s.parse::<u8>() {
            return Verbosity::from_level(level)
                .ok_or_else(|| Error::InvalidRequest(format!("verbosity out of range: {level}")));
        }
        match s.to_ascii_lowercase().as_str() {
            "low" | "terminal" => Ok(Verbosity::Low),
            "medium" | "coarse" => Ok(Verbosity::Medium),
            "high" | "fine" => Ok(Verbosity::High),
            other => Err(Error::InvalidRequest(format!("unknown verbosity: {other}"))),
        }
    }
}

/// Which status events a tier sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    All,
    TerminalOnly,
}

impl StatusFilter {
    pub fn admits(self, status: ExecutionStatus) -> bool {
        match self {
            StatusFilter::All => true,
            StatusFilter::TerminalOnly => status.is_terminal(),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for a new execution record, used by executor-side writers.
pub struct NewExecution {
    pub(crate) project_id: ProjectId,
    pub(crate) kind: String,
    pub(crate) status: ExecutionStatus,
    pub(crate) started_at: Option<DateTime<Utc>>,
}

impl NewExecution {
    pub fn new(project_id: ProjectId, kind: impl Into<String>) -> Self {
        Self {
            project_id,
            kind: kind.into(),
            status: ExecutionStatus::Queued,
            started_at: None,
        }
    }

    /// Start in `running` instead of `queued`.
    pub fn running(mut self) -> Self {
        self.status = ExecutionStatus::Running;
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_only_moves_forward() {
        use ExecutionStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Queued));
        assert!(!Running.can_transition_to(Queued));
        assert!(!Queued.can_transition_to(Completed));
    }

    #[test]
    fn verbosity_parses_levels_and_names() {
        assert_eq!("1".parse::<Verbosity>().unwrap(), Verbosity::Low);
        assert_eq!("fine".parse::<Verbosity>().unwrap(), Verbosity::High);
        assert_eq!("Medium".parse::<Verbosity>().unwrap(), Verbosity::Medium);
        assert!("4".parse::<Verbosity>().is_err());
        assert!("loud".parse::<Verbosity>().is_err());
    }

    #[test]
    fn tiers_are_nested() {
        assert!(Verbosity::Low < Verbosity::Medium && Verbosity::Medium < Verbosity::High);
        assert!(!Verbosity::Low.status_filter().admits(ExecutionStatus::Running));
        assert!(Verbosity::Low.status_filter().admits(ExecutionStatus::Failed));
        assert!(Verbosity::Medium.status_filter().admits(ExecutionStatus::Running));
        assert!(Verbosity::High.includes_lines() && !Verbosity::Medium.includes_lines());
    }

    #[test]
    fn transition_key_follows_its_position() {
        let at = Utc::now();
        let transition = StatusTransition {
            execution_id: ExecutionId::new(),
            project_id: ProjectId::new(),
            kind: "build".into(),
            status: ExecutionStatus::Completed,
            at,
            seq: 1,
        };
        let key = transition.status_key();
        assert_eq!((key.at, key.seq), (at, 1));
        assert_eq!(key.execution_id, transition.execution_id);
    }
}
