//! Merge the coarse and fine subsequences into one ordered stream.
//!
//! Records interleave by timestamp. On an identical timestamp an output
//! line sorts before a status event: a transition follows the output that
//! belongs to it. Each delivery carries the combined cursor after that
//! record, built from two independently advancing positions.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use crate::cursor::Cursor;
use crate::model::{ActivityRecord, StatusTransition};
use crate::protocol::{ActivityPayload, Source, StreamEvent};

/// A record from either subsequence.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamRecord {
    Status(StatusTransition),
    Line(ActivityRecord),
}

impl StreamRecord {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            StreamRecord::Status(t) => t.at,
            StreamRecord::Line(l) => l.timestamp,
        }
    }

    pub fn source(&self) -> Source {
        match self {
            StreamRecord::Status(_) => Source::Status,
            StreamRecord::Line(_) => Source::Output,
        }
    }

    /// Stable identity on the wire. Unique because an execution enters each
    /// status at most once and line sequence numbers are never reused.
    pub fn record_id(&self) -> String {
        match self {
            StreamRecord::Status(t) => format!("status:{}:{}", t.execution_id, t.status),
            StreamRecord::Line(l) => format!("line:{}:{}", l.execution_id, l.seq),
        }
    }

    /// Human-readable ordering key, for logs.
    pub fn ordering_key(&self) -> String {
        match self {
            StreamRecord::Status(t) => t.status_key().to_string(),
            StreamRecord::Line(l) => l.line_key().to_string(),
        }
    }

    pub fn to_payload(&self) -> ActivityPayload {
        match self {
            StreamRecord::Status(t) => ActivityPayload {
                id: self.record_id(),
                timestamp: t.at,
                source: Source::Status,
                message: format!("{} {}", t.kind, t.status),
                kind: Some(t.kind.clone()),
                execution_id: t.execution_id,
                status: Some(t.status),
            },
            StreamRecord::Line(l) => ActivityPayload {
                id: self.record_id(),
                timestamp: l.timestamp,
                source: Source::Output,
                message: l.message.clone(),
                kind: None,
                execution_id: l.execution_id,
                status: None,
            },
        }
    }

    fn advance(&self, cursor: &mut Cursor) {
        match self {
            StreamRecord::Status(t) => cursor.advance_status(t.status_key()),
            StreamRecord::Line(l) => cursor.advance_line(l.line_key()),
        }
    }

    /// Delivery order across both subsequences.
    pub fn delivery_cmp(&self, other: &Self) -> Ordering {
        use StreamRecord::*;
        self.timestamp()
            .cmp(&other.timestamp())
            .then_with(|| match (self, other) {
                (Line(a), Line(b)) => a.line_key().cmp(&b.line_key()),
                (Status(a), Status(b)) => a.status_key().cmp(&b.status_key()),
                (Line(_), Status(_)) => Ordering::Less,
                (Status(_), Line(_)) => Ordering::Greater,
            })
    }
}

/// One record ready to go out, with the cursor that resumes after it.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub record: StreamRecord,
    pub cursor: Cursor,
}

impl Delivery {
    pub fn to_event(&self) -> StreamEvent {
        StreamEvent::Activity {
            cursor: self.cursor,
            payload: self.record.to_payload(),
        }
    }
}

/// Records read from one subsequence in a single poll.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub records: Vec<T>,
    /// More records were available than the page could hold.
    pub capped: bool,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            records: Vec::new(),
            capped: false,
        }
    }

    /// Build a page from a read of `cap + 1` rows.
    pub fn from_overfetch(mut records: Vec<T>, cap: usize) -> Self {
        let capped = records.len() > cap;
        records.truncate(cap);
        Self { records, capped }
    }
}

/// The outcome of one poll.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub deliveries: Vec<Delivery>,
    /// Cursor after the whole batch; the next poll resumes from here.
    pub cursor: Cursor,
    /// A page was capped; more records are waiting for the next poll.
    pub capped: bool,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty()
    }
}

/// Merge two already-sorted subsequences.
pub fn interleave(statuses: Vec<StatusTransition>, lines: Vec<ActivityRecord>) -> Vec<StreamRecord> {
    let mut out = Vec::with_capacity(statuses.len() + lines.len());
    let mut statuses = statuses.into_iter().map(StreamRecord::Status).peekable();
    let mut lines = lines.into_iter().map(StreamRecord::Line).peekable();

    loop {
        let next = match (statuses.peek(), lines.peek()) {
            (Some(s), Some(l)) => {
                if l.delivery_cmp(s) == Ordering::Greater {
                    statuses.next()
                } else {
                    lines.next()
                }
            }
            (Some(_), None) => statuses.next(),
            (None, Some(_)) => lines.next(),
            (None, None) => break,
        };
        out.extend(next);
    }
    out
}

/// Merge the pages of an incremental poll, starting from `start`.
///
/// When a page was capped, the other subsequence may still hold records
/// that sort before that page's next, unread record. Nothing past the
/// earliest capped page's last record is emitted; the cursor stops there
/// and the rest is read again on the next poll.
pub fn merge(start: Cursor, statuses: Page<StatusTransition>, lines: Page<ActivityRecord>) -> Batch {
    let horizon = [
        statuses
            .capped
            .then(|| statuses.records.last().cloned().map(StreamRecord::Status))
            .flatten(),
        lines
            .capped
            .then(|| lines.records.last().cloned().map(StreamRecord::Line))
            .flatten(),
    ]
    .into_iter()
    .flatten()
    .min_by(|a, b| a.delivery_cmp(b));
    let capped = statuses.capped || lines.capped;

    let mut records = interleave(statuses.records, lines.records);
    if let Some(horizon) = horizon {
        records.retain(|r| r.delivery_cmp(&horizon) != Ordering::Greater);
    }

    let (deliveries, cursor) = deliver(start, records, 0);
    Batch {
        deliveries,
        cursor,
        capped,
    }
}

/// Merge the most recent records of each subsequence into a bounded backlog.
///
/// `floor` already covers everything older than what was read. Records that
/// fall outside the `limit` newest are skipped but still move the cursor,
/// so they are never replayed later.
pub fn backlog(
    floor: Cursor,
    statuses: Vec<StatusTransition>,
    lines: Vec<ActivityRecord>,
    limit: usize,
) -> Batch {
    let records = interleave(statuses, lines);
    let skip = records.len().saturating_sub(limit);
    let (deliveries, cursor) = deliver(floor, records, skip);
    Batch {
        deliveries,
        cursor,
        capped: false,
    }
}

fn deliver(start: Cursor, records: Vec<StreamRecord>, skip: usize) -> (Vec<Delivery>, Cursor) {
    let mut cursor = start;
    let mut deliveries = Vec::with_capacity(records.len().saturating_sub(skip));
    for (i, record) in records.into_iter().enumerate() {
        record.advance(&mut cursor);
        if i >= skip {
            deliveries.push(Delivery { record, cursor });
        }
    }
    (deliveries, cursor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use chrono::TimeZone;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    fn transition(
        execution_id: ExecutionId,
        status: ExecutionStatus,
        ms: i64,
        seq: i64,
    ) -> StatusTransition {
        StatusTransition {
            execution_id,
            project_id: ProjectId(uuid::Uuid::nil()),
            kind: "build".into(),
            status,
            at: at(ms),
            seq,
        }
    }

    fn line(execution_id: ExecutionId, ms: i64, seq: i64) -> ActivityRecord {
        ActivityRecord {
            execution_id,
            project_id: ProjectId(uuid::Uuid::nil()),
            message: format!("line {seq}"),
            timestamp: at(ms),
            seq,
        }
    }

    fn ids(batch: &Batch) -> Vec<String> {
        batch.deliveries.iter().map(|d| d.record.record_id()).collect()
    }

    #[test]
    fn output_precedes_status_on_equal_timestamp() {
        let exec = ExecutionId::new();
        let done = transition(exec, ExecutionStatus::Completed, 5, 1);
        let last = line(exec, 5, 0);
        let merged = interleave(vec![done.clone()], vec![last.clone()]);
        assert_eq!(merged[0], StreamRecord::Line(last));
        assert_eq!(merged[1], StreamRecord::Status(done));
    }

    #[test]
    fn changes_at_one_instant_keep_their_order() {
        let exec = ExecutionId::new();
        let running = transition(exec, ExecutionStatus::Running, 0, 0);
        let done = transition(exec, ExecutionStatus::Completed, 0, 1);
        let batch = merge(
            Cursor::start(),
            Page { records: vec![running.clone(), done.clone()], capped: false },
            Page::empty(),
        );
        assert_eq!(
            ids(&batch),
            vec![
                format!("status:{exec}:running"),
                format!("status:{exec}:completed"),
            ]
        );
        assert_eq!(batch.deliveries[0].cursor.status, Some(running.status_key()));
        assert_eq!(batch.cursor.status, Some(done.status_key()));
    }

    #[test]
    fn per_delivery_cursor_covers_both_subsequences() {
        let exec = ExecutionId::new();
        let done = transition(exec, ExecutionStatus::Completed, 5, 0);
        let lines = vec![line(exec, 1, 0), line(exec, 1, 1)];
        let batch = merge(
            Cursor::start(),
            Page { records: vec![done.clone()], capped: false },
            Page { records: lines.clone(), capped: false },
        );

        assert_eq!(batch.deliveries.len(), 3);
        let after_second_line = batch.deliveries[1].cursor;
        assert_eq!(after_second_line.line, Some(lines[1].line_key()));
        assert_eq!(after_second_line.status, None);
        assert_eq!(batch.cursor.status, Some(done.status_key()));
        assert_eq!(batch.cursor, batch.deliveries[2].cursor);
    }

    #[test]
    fn capped_page_bounds_the_other_subsequence() {
        let exec = ExecutionId::new();
        let other = ExecutionId::new();
        let first = transition(exec, ExecutionStatus::Running, 0, 0);
        let second = transition(other, ExecutionStatus::Running, 2, 0);
        // The status page is capped after t=2; an unread transition could sit
        // anywhere after that, so the line at t=3 has to wait.
        let batch = merge(
            Cursor::start(),
            Page { records: vec![first.clone(), second.clone()], capped: true },
            Page { records: vec![line(exec, 1, 0), line(exec, 3, 1)], capped: false },
        );

        assert!(batch.capped);
        assert_eq!(
            ids(&batch),
            vec![
                format!("status:{exec}:running"),
                format!("line:{exec}:0"),
                format!("status:{other}:running"),
            ]
        );
        assert_eq!(batch.cursor.line.unwrap().seq, 0);
        assert_eq!(batch.cursor.status, Some(second.status_key()));
    }

    #[test]
    fn backlog_skips_old_records_but_moves_past_them() {
        let exec = ExecutionId::new();
        let running = transition(exec, ExecutionStatus::Running, 0, 0);
        let lines: Vec<_> = (0..5).map(|i| line(exec, 10 + i, i)).collect();
        let batch = backlog(Cursor::start(), vec![running.clone()], lines.clone(), 3);

        assert_eq!(batch.deliveries.len(), 3);
        assert_eq!(batch.deliveries[0].record, StreamRecord::Line(lines[2].clone()));
        // The skipped status still counts as consumed.
        assert_eq!(batch.deliveries[0].cursor.status, Some(running.status_key()));
        assert_eq!(batch.cursor.line, Some(lines[4].line_key()));
    }
}
