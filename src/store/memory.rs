//! In-process activity log.
//!
//! Mirrors the Postgres store closely enough to drive the poller in tests
//! and in `relay demo`: timestamps are truncated to microseconds, sequence
//! numbers are assigned per execution, and status changes are validated
//! against the execution state machine and appended to a transition log.
//! Unlike the relay itself, it exposes the executor-side write API.

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};

use super::ActivityLog;
use crate::cursor::{LineKey, StatusKey};
use crate::error::{Error, Result};
use crate::model::*;

#[derive(Default)]
struct Inner {
    projects: HashSet<ProjectId>,
    executions: HashMap<ExecutionId, ExecutionRecord>,
    transitions: Vec<StatusTransition>,
    lines: Vec<ActivityRecord>,
}

/// Activity log held in memory.
#[derive(Default)]
pub struct MemoryLog {
    inner: RwLock<Inner>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Executor-side writes
    // -----------------------------------------------------------------------

    /// Register a new project scope.
    pub fn create_project(&self) -> ProjectId {
        let id = ProjectId::new();
        self.write().projects.insert(id);
        id
    }

    /// Insert a new execution record.
    pub fn insert_execution(&self, new: NewExecution) -> Result<ExecutionRecord> {
        let mut inner = self.write();
        if !inner.projects.contains(&new.project_id) {
            return Err(Error::NotFound(format!("project {}", new.project_id)));
        }

        let record = ExecutionRecord {
            id: ExecutionId::new(),
            project_id: new.project_id,
            kind: new.kind,
            status: new.status,
            started_at: store_time(new.started_at.unwrap_or_else(Utc::now)),
            completed_at: None,
            output: String::new(),
        };
        inner.executions.insert(record.id, record.clone());
        Ok(record)
    }

    /// Append one line of output. The sequence number is assigned here.
    pub fn append_line(
        &self,
        execution_id: ExecutionId,
        message: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Result<ActivityRecord> {
        let at = store_time(at);
        let message = message.into();
        let mut inner = self.write();

        let last = inner
            .lines
            .iter()
            .filter(|l| l.execution_id == execution_id)
            .map(|l| (l.timestamp, l.seq))
            .max();
        if let Some((last_at, _)) = last.filter(|(last_at, _)| at < *last_at) {
            return Err(Error::Other(format!(
                "line for {execution_id} at {at} precedes previous line at {last_at}"
            )));
        }

        let execution = inner
            .executions
            .get_mut(&execution_id)
            .ok_or_else(|| Error::NotFound(format!("execution {execution_id}")))?;
        execution.output.push_str(&message);
        execution.output.push('\n');

        let line = ActivityRecord {
            execution_id,
            project_id: execution.project_id,
            message,
            timestamp: at,
            seq: last.map_or(0, |(_, seq)| seq + 1),
        };
        inner.lines.push(line.clone());
        Ok(line)
    }

    /// Move an execution forward through its lifecycle and log the change.
    ///
    /// `at` is raised to the execution's previous transition (or its start)
    /// if it would land before it.
    pub fn transition(
        &self,
        execution_id: ExecutionId,
        to: ExecutionStatus,
        at: DateTime<Utc>,
    ) -> Result<StatusTransition> {
        let mut inner = self.write();
        let last = inner
            .transitions
            .iter()
            .filter(|t| t.execution_id == execution_id)
            .map(|t| (t.at, t.seq))
            .max();
        let execution = inner
            .executions
            .get_mut(&execution_id)
            .ok_or_else(|| Error::NotFound(format!("execution {execution_id}")))?;

        if !execution.status.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: execution.status.to_string(),
                to: to.to_string(),
            });
        }

        let floor = last.map_or(execution.started_at, |(last_at, _)| last_at);
        let at = store_time(at).max(floor);
        execution.status = to;
        if to.is_terminal() {
            execution.completed_at = Some(at);
        }

        let transition = StatusTransition {
            execution_id,
            project_id: execution.project_id,
            kind: execution.kind.clone(),
            status: to,
            at,
            seq: last.map_or(0, |(_, seq)| seq + 1),
        };
        inner.transitions.push(transition.clone());
        Ok(transition)
    }

    fn statuses(&self, project: ProjectId, filter: StatusFilter) -> Vec<StatusTransition> {
        let mut transitions: Vec<_> = self
            .read()
            .transitions
            .iter()
            .filter(|t| t.project_id == project && filter.admits(t.status))
            .cloned()
            .collect();
        transitions.sort_by_key(StatusTransition::status_key);
        transitions
    }

    fn lines(&self, project: ProjectId) -> Vec<ActivityRecord> {
        let mut lines: Vec<_> = self
            .read()
            .lines
            .iter()
            .filter(|l| l.project_id == project)
            .cloned()
            .collect();
        lines.sort_by_key(ActivityRecord::line_key);
        lines
    }
}

#[async_trait]
impl ActivityLog for MemoryLog {
    async fn project_exists(&self, project: ProjectId) -> Result<bool> {
        Ok(self.read().projects.contains(&project))
    }

    async fn status_events_after(
        &self,
        project: ProjectId,
        filter: StatusFilter,
        after: Option<StatusKey>,
        limit: usize,
    ) -> Result<Vec<StatusTransition>> {
        Ok(self
            .statuses(project, filter)
            .into_iter()
            .filter(|t| after.is_none_or(|k| t.status_key() > k))
            .take(limit)
            .collect())
    }

    async fn latest_status_events(
        &self,
        project: ProjectId,
        filter: StatusFilter,
        limit: usize,
    ) -> Result<Vec<StatusTransition>> {
        let all = self.statuses(project, filter);
        let skip = all.len().saturating_sub(limit);
        Ok(all.into_iter().skip(skip).collect())
    }

    async fn lines_after(
        &self,
        project: ProjectId,
        after: Option<LineKey>,
        limit: usize,
    ) -> Result<Vec<ActivityRecord>> {
        Ok(self
            .lines(project)
            .into_iter()
            .filter(|l| after.is_none_or(|k| l.line_key() > k))
            .take(limit)
            .collect())
    }

    async fn latest_lines(&self, project: ProjectId, limit: usize) -> Result<Vec<ActivityRecord>> {
        let all = self.lines(project);
        let skip = all.len().saturating_sub(limit);
        Ok(all.into_iter().skip(skip).collect())
    }
}

/// Timestamps as Postgres stores them.
fn store_time(at: DateTime<Utc>) -> DateTime<Utc> {
    at.trunc_subsecs(6)
}
