//! Read surface over the activity log written by the executor.
//!
//! The relay never writes through this trait. Every query is a single
//! statement against committed data, so read-committed isolation is enough
//! and nothing spans more than one poll.

pub mod memory;

use async_trait::async_trait;

use crate::cursor::{LineKey, StatusKey};
use crate::error::Result;
use crate::model::{ActivityRecord, ProjectId, StatusFilter, StatusTransition};

pub use memory::MemoryLog;

/// Queryable, ordered view of status transitions and activity records.
///
/// All list methods return records in ascending key order.
#[async_trait]
pub trait ActivityLog: Send + Sync {
    /// Does the project scope exist?
    async fn project_exists(&self, project: ProjectId) -> Result<bool>;

    /// Status transitions whose key is strictly greater than `after`.
    async fn status_events_after(
        &self,
        project: ProjectId,
        filter: StatusFilter,
        after: Option<StatusKey>,
        limit: usize,
    ) -> Result<Vec<StatusTransition>>;

    /// The `limit` most recent status transitions.
    async fn latest_status_events(
        &self,
        project: ProjectId,
        filter: StatusFilter,
        limit: usize,
    ) -> Result<Vec<StatusTransition>>;

    /// Activity lines whose line key is strictly greater than `after`.
    async fn lines_after(
        &self,
        project: ProjectId,
        after: Option<LineKey>,
        limit: usize,
    ) -> Result<Vec<ActivityRecord>>;

    /// The `limit` most recent activity lines.
    async fn latest_lines(&self, project: ProjectId, limit: usize) -> Result<Vec<ActivityRecord>>;
}
