//! Incremental poller: records strictly after a cursor, in delivery order.
//!
//! The first poll of a fresh subscription replays a bounded backlog. Every
//! later poll reads forward from the cursor, one capped page per
//! subsequence. The cursor only moves when a poll succeeds, so a failed or
//! timed-out read is simply retried from the same position.
//!
//! A record that becomes visible with a key at or below the cursor (a late
//! commit under writer/reader clock skew) is never delivered: order wins
//! over completeness.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::multiplex::{self, Batch, Page};
use crate::config::StreamSettings;
use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::model::{ProjectId, Verbosity};
use crate::store::ActivityLog;

pub struct Poller {
    log: Arc<dyn ActivityLog>,
    project: ProjectId,
    verbosity: Verbosity,
    cursor: Option<Cursor>,
    backlog_limit: usize,
    page_cap: usize,
    store_timeout: Duration,
}

impl Poller {
    pub fn new(
        log: Arc<dyn ActivityLog>,
        project: ProjectId,
        verbosity: Verbosity,
        cursor: Option<Cursor>,
        settings: &StreamSettings,
    ) -> Self {
        Self {
            log,
            project,
            verbosity,
            cursor,
            backlog_limit: settings.backlog_limit,
            page_cap: settings.page_cap,
            store_timeout: settings.store_timeout(),
        }
    }

    /// Position after everything returned so far. `None` until the first
    /// successful poll of a fresh subscription.
    pub fn cursor(&self) -> Option<Cursor> {
        self.cursor
    }

    /// Read the next batch and advance the cursor past it.
    pub async fn poll(&mut self) -> Result<Batch> {
        let batch = match self.cursor {
            None => self.backlog().await?,
            Some(cursor) => self.next_page(cursor).await?,
        };
        self.cursor = Some(batch.cursor);
        Ok(batch)
    }

    async fn backlog(&self) -> Result<Batch> {
        let filter = self.verbosity.status_filter();
        // One extra row per subsequence marks the floor of the window.
        let fetch = self.backlog_limit + 1;

        let mut statuses = self
            .timed(self.log.latest_status_events(self.project, filter, fetch))
            .await?;
        let mut lines = if self.verbosity.includes_lines() {
            self.timed(self.log.latest_lines(self.project, fetch)).await?
        } else {
            Vec::new()
        };

        let mut floor = Cursor::start();
        if statuses.len() == fetch {
            floor.advance_status(statuses.remove(0).status_key());
        }
        if lines.len() == fetch {
            floor.advance_line(lines.remove(0).line_key());
        }

        let batch = multiplex::backlog(floor, statuses, lines, self.backlog_limit);
        debug!(
            project = %self.project,
            records = batch.deliveries.len(),
            "backlog read"
        );
        Ok(batch)
    }

    async fn next_page(&self, cursor: Cursor) -> Result<Batch> {
        let filter = self.verbosity.status_filter();
        let fetch = self.page_cap + 1;

        let statuses = self
            .timed(
                self.log
                    .status_events_after(self.project, filter, cursor.status, fetch),
            )
            .await?;
        let lines = if self.verbosity.includes_lines() {
            let lines = self
                .timed(self.log.lines_after(self.project, cursor.line, fetch))
                .await?;
            Page::from_overfetch(lines, self.page_cap)
        } else {
            Page::empty()
        };

        Ok(multiplex::merge(
            cursor,
            Page::from_overfetch(statuses, self.page_cap),
            lines,
        ))
    }

    async fn timed<T>(&self, query: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.store_timeout, query)
            .await
            .map_err(|_| Error::StoreTimeout(self.store_timeout))?
    }
}
