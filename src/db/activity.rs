//! Activity log queries: keyset pagination over status transitions and lines.
//!
//! Reads after a cursor compare row values against the key, so a page never
//! depends on OFFSET or on the random execution id for progress. The key
//! predicate is only added when there is a key, which leaves the stream
//! indexes usable as a range scan.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, QueryBuilder};
use uuid::Uuid;

use crate::cursor::{LineKey, StatusKey};
use crate::error::Result;
use crate::model::*;
use crate::store::ActivityLog;

const SELECT_TRANSITIONS: &str = "SELECT execution_id, project_id, kind, status, changed_at, seq \
     FROM execution_transitions WHERE project_id = ";

const SELECT_LINES: &str = "SELECT execution_id, project_id, message, created_at, seq \
     FROM activity_lines WHERE project_id = ";

fn push_status_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: StatusFilter) {
    if filter == StatusFilter::TerminalOnly {
        qb.push(" AND status IN ('completed', 'failed')");
    }
}

#[async_trait]
impl ActivityLog for super::Db {
    async fn project_exists(&self, project: ProjectId) -> Result<bool> {
        let row: (bool,) = sqlx::query_as("SELECT EXISTS (SELECT 1 FROM projects WHERE id = $1)")
            .bind(project.0)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    async fn status_events_after(
        &self,
        project: ProjectId,
        filter: StatusFilter,
        after: Option<StatusKey>,
        limit: usize,
    ) -> Result<Vec<StatusTransition>> {
        let mut qb = QueryBuilder::<Postgres>::new(SELECT_TRANSITIONS);
        qb.push_bind(project.0);
        push_status_filter(&mut qb, filter);
        if let Some(key) = after {
            qb.push(" AND (changed_at, seq, execution_id) > (")
                .push_bind(key.at)
                .push(", ")
                .push_bind(key.seq)
                .push(", ")
                .push_bind(key.execution_id.0)
                .push(")");
        }
        qb.push(" ORDER BY changed_at, seq, execution_id LIMIT ")
            .push_bind(limit as i64);

        let rows: Vec<TransitionRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(TransitionRow::try_into_transition)
            .collect()
    }

    async fn latest_status_events(
        &self,
        project: ProjectId,
        filter: StatusFilter,
        limit: usize,
    ) -> Result<Vec<StatusTransition>> {
        let mut qb = QueryBuilder::<Postgres>::new(SELECT_TRANSITIONS);
        qb.push_bind(project.0);
        push_status_filter(&mut qb, filter);
        qb.push(" ORDER BY changed_at DESC, seq DESC, execution_id DESC LIMIT ")
            .push_bind(limit as i64);

        let rows: Vec<TransitionRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        let mut transitions = rows
            .into_iter()
            .map(TransitionRow::try_into_transition)
            .collect::<Result<Vec<_>>>()?;
        transitions.reverse();
        Ok(transitions)
    }

    async fn lines_after(
        &self,
        project: ProjectId,
        after: Option<LineKey>,
        limit: usize,
    ) -> Result<Vec<ActivityRecord>> {
        let mut qb = QueryBuilder::<Postgres>::new(SELECT_LINES);
        qb.push_bind(project.0);
        if let Some(key) = after {
            qb.push(" AND (created_at, seq, execution_id) > (")
                .push_bind(key.at)
                .push(", ")
                .push_bind(key.seq)
                .push(", ")
                .push_bind(key.execution_id.0)
                .push(")");
        }
        qb.push(" ORDER BY created_at, seq, execution_id LIMIT ")
            .push_bind(limit as i64);

        let rows: Vec<LineRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(LineRow::into_record).collect())
    }

    async fn latest_lines(&self, project: ProjectId, limit: usize) -> Result<Vec<ActivityRecord>> {
        let mut qb = QueryBuilder::<Postgres>::new(SELECT_LINES);
        qb.push_bind(project.0);
        qb.push(" ORDER BY created_at DESC, seq DESC, execution_id DESC LIMIT ")
            .push_bind(limit as i64);

        let rows: Vec<LineRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        let mut lines: Vec<_> = rows.into_iter().map(LineRow::into_record).collect();
        lines.reverse();
        Ok(lines)
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct TransitionRow {
    execution_id: Uuid,
    project_id: Uuid,
    kind: String,
    status: String,
    changed_at: DateTime<Utc>,
    seq: i64,
}

impl TransitionRow {
    fn try_into_transition(self) -> Result<StatusTransition> {
        Ok(StatusTransition {
            execution_id: ExecutionId(self.execution_id),
            project_id: ProjectId(self.project_id),
            kind: self.kind,
            status: self.status.parse()?,
            at: self.changed_at,
            seq: self.seq,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LineRow {
    execution_id: Uuid,
    project_id: Uuid,
    message: String,
    created_at: DateTime<Utc>,
    seq: i64,
}

impl LineRow {
    fn into_record(self) -> ActivityRecord {
        ActivityRecord {
            execution_id: ExecutionId(self.execution_id),
            project_id: ProjectId(self.project_id),
            message: self.message,
            timestamp: self.created_at,
            seq: self.seq,
        }
    }
}
