//! One live subscription: scope check, backlog, then the poll loop.
//!
//! A session owns its poller and runs as its own task. Events go to the
//! connection through a bounded channel; when the connection goes away the
//! receiver drops, `tx.closed()` resolves, and the loop stops at once.

use std::sync::Arc;
use std::time::Instant;

use opentelemetry::KeyValue;
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use super::multiplex::Batch;
use super::poller::Poller;
use crate::config::StreamSettings;
use crate::cursor::Cursor;
use crate::error::Error;
use crate::model::{ProjectId, Verbosity};
use crate::protocol::{ErrorPayload, StreamEvent};
use crate::store::ActivityLog;
use crate::telemetry::metrics;
use crate::telemetry::stream::{record_close, start_subscription_span};

/// What a client asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    pub project: ProjectId,
    pub verbosity: Verbosity,
    /// Resume point; `None` replays the backlog.
    pub cursor: Option<Cursor>,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientDisconnected,
    Cancelled,
    InvalidScope,
    StoreUnavailable,
    Internal,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::ClientDisconnected => "client_disconnected",
            CloseReason::Cancelled => "cancelled",
            CloseReason::InvalidScope => "invalid_scope",
            CloseReason::StoreUnavailable => "store_unavailable",
            CloseReason::Internal => "internal",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counts consecutive failed polls.
#[derive(Debug)]
struct FailureBudget {
    limit: u32,
    consecutive: u32,
}

impl FailureBudget {
    fn new(limit: u32) -> Self {
        Self {
            limit,
            consecutive: 0,
        }
    }

    /// Record a failure; true once the budget is spent.
    fn fail(&mut self) -> bool {
        self.consecutive += 1;
        self.consecutive >= self.limit
    }

    fn reset(&mut self) {
        self.consecutive = 0;
    }
}

pub struct Session {
    log: Arc<dyn ActivityLog>,
    settings: StreamSettings,
    subscription: Subscription,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(
        log: Arc<dyn ActivityLog>,
        settings: StreamSettings,
        subscription: Subscription,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            log,
            settings,
            subscription,
            cancel,
        }
    }

    /// Run the session on its own task and hand back the event receiver.
    /// Dropping the receiver ends the session.
    pub fn spawn(self) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(self.settings.channel_capacity);
        tokio::spawn(self.run(tx));
        rx
    }

    /// Drive the subscription until it closes, and say why it did.
    pub async fn run(self, tx: mpsc::Sender<StreamEvent>) -> CloseReason {
        let Subscription {
            project,
            verbosity,
            cursor,
        } = self.subscription;
        let span = start_subscription_span(&project, verbosity);
        metrics::subscriptions_opened().add(1, &[KeyValue::new("verbosity", verbosity.as_str())]);

        let reason = async {
            info!(
                project = %project,
                verbosity = %verbosity,
                resume = cursor.is_some(),
                "subscription opened"
            );
            match self.stream(&tx).await {
                Ok(()) => CloseReason::Internal,
                Err(reason) => reason,
            }
        }
        .instrument(span.clone())
        .await;

        record_close(&span, reason.as_str());
        metrics::subscriptions_closed().add(1, &[KeyValue::new("reason", reason.as_str())]);
        reason
    }

    /// The body of the session. Only ever returns by closing.
    async fn stream(&self, tx: &mpsc::Sender<StreamEvent>) -> Result<(), CloseReason> {
        self.check_scope(tx).await?;

        let mut poller = Poller::new(
            Arc::clone(&self.log),
            self.subscription.project,
            self.subscription.verbosity,
            self.subscription.cursor,
            &self.settings,
        );
        let mut budget = FailureBudget::new(self.settings.max_poll_failures);
        let mut poll_tick = ticker(self.settings.poll_interval());
        let mut heartbeat_tick = ticker(self.settings.heartbeat_interval());

        loop {
            if self.cancel.is_cancelled() {
                return Err(CloseReason::Cancelled);
            }
            // Both tickers fire immediately; polling wins, so the backlog
            // goes out before the first heartbeat.
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(CloseReason::Cancelled),
                _ = tx.closed() => return Err(CloseReason::ClientDisconnected),
                _ = poll_tick.tick() => {
                    let batch = self.poll(&mut poller, &mut budget, tx).await?;
                    if let Some(batch) = batch {
                        self.deliver(batch, tx, &mut poll_tick).await?;
                    }
                }
                _ = heartbeat_tick.tick() => {
                    // Everything up to the poller's cursor has been sent.
                    self.send(tx, StreamEvent::heartbeat(poller.cursor())).await?;
                }
            }
        }
    }

    async fn check_scope(&self, tx: &mpsc::Sender<StreamEvent>) -> Result<(), CloseReason> {
        let project = self.subscription.project;
        let timeout = self.settings.store_timeout();
        let exists = tokio::select! {
            _ = self.cancel.cancelled() => return Err(CloseReason::Cancelled),
            res = tokio::time::timeout(timeout, self.log.project_exists(project)) => {
                res.unwrap_or(Err(Error::StoreTimeout(timeout)))
            }
        };

        match exists {
            Ok(true) => Ok(()),
            Ok(false) => {
                let err = Error::NotFound(format!("project {project}"));
                warn!(project = %project, "subscription scope does not exist");
                self.close_with(tx, &err, CloseReason::InvalidScope).await
            }
            Err(e) => {
                error!(project = %project, "scope check failed: {e}");
                let reason = if e.is_transient() {
                    CloseReason::StoreUnavailable
                } else {
                    CloseReason::Internal
                };
                self.close_with(tx, &e, reason).await
            }
        }
    }

    /// One poll. `Ok(None)` means it failed but the budget is not spent.
    async fn poll(
        &self,
        poller: &mut Poller,
        budget: &mut FailureBudget,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> Result<Option<Batch>, CloseReason> {
        let started = Instant::now();
        let result = tokio::select! {
            _ = self.cancel.cancelled() => return Err(CloseReason::Cancelled),
            _ = tx.closed() => return Err(CloseReason::ClientDisconnected),
            res = poller.poll() => res,
        };
        metrics::poll_duration_ms().record(started.elapsed().as_secs_f64() * 1000.0, &[]);

        match result {
            Ok(batch) => {
                budget.reset();
                Ok(Some(batch))
            }
            Err(e) if e.is_transient() => {
                metrics::poll_failures().add(1, &[]);
                if budget.fail() {
                    error!(
                        project = %self.subscription.project,
                        failures = budget.consecutive,
                        "poll failures exhausted, closing: {e}"
                    );
                    let err = Error::Unavailable(e.to_string());
                    return self
                        .close_with(tx, &err, CloseReason::StoreUnavailable)
                        .await
                        .map(|()| None);
                }
                warn!(
                    project = %self.subscription.project,
                    failures = budget.consecutive,
                    "poll failed, retrying next tick: {e}"
                );
                Ok(None)
            }
            Err(e) => {
                error!(project = %self.subscription.project, "poll failed: {e}");
                self.close_with(tx, &e, CloseReason::Internal)
                    .await
                    .map(|()| None)
            }
        }
    }

    async fn deliver(
        &self,
        batch: Batch,
        tx: &mpsc::Sender<StreamEvent>,
        poll_tick: &mut Interval,
    ) -> Result<(), CloseReason> {
        let delivered = metrics::events_delivered();
        for delivery in &batch.deliveries {
            let source = delivery.record.source();
            debug!(
                record = %delivery.record.record_id(),
                key = %delivery.record.ordering_key(),
                "delivering"
            );
            self.send(tx, delivery.to_event()).await?;
            delivered.add(1, &[KeyValue::new("source", source.as_str())]);
        }
        // More is waiting behind a capped page; read it without waiting a
        // full interval.
        if batch.capped {
            poll_tick.reset_immediately();
        }
        Ok(())
    }

    async fn send(
        &self,
        tx: &mpsc::Sender<StreamEvent>,
        event: StreamEvent,
    ) -> Result<(), CloseReason> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(CloseReason::Cancelled),
            res = tx.send(event) => res.map_err(|_| CloseReason::ClientDisconnected),
        }
    }

    /// Send the closing `error` event, then close with `reason`.
    async fn close_with(
        &self,
        tx: &mpsc::Sender<StreamEvent>,
        err: &Error,
        reason: CloseReason,
    ) -> Result<(), CloseReason> {
        self.send(tx, StreamEvent::Error(ErrorPayload::from(err)))
            .await?;
        Err(reason)
    }
}

fn ticker(period: std::time::Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
