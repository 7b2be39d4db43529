//! Consumer side of the activity stream.
//!
//! A [`Connector`] holds one logical subscription open across any number of
//! HTTP connections. It resumes from the last position it has fully caught up
//! to (the cursor of the last activity it applied, or of a later heartbeat),
//! drops repeats, treats silence as a dead connection, and backs off between
//! attempts until it either gets through or gives up.

pub mod backoff;
pub mod dedup;
pub mod state;

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::ACCEPT;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use backoff::{Backoff, BackoffPolicy};
pub use dedup::RecentIds;
pub use state::{ConnectionState, Presence};

use crate::error::Result;
use crate::model::{ProjectId, Verbosity};
use crate::protocol::{ActivityPayload, FrameDecoder, Incoming};
use crate::telemetry::metrics;
use crate::transport::LAST_EVENT_ID;

/// How long a connection may stay silent, as a multiple of the server's
/// heartbeat interval.
pub const LIVENESS_FACTOR: f64 = 2.5;

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Server root, e.g. `http://localhost:8000`.
    pub base_url: String,
    pub project: ProjectId,
    pub verbosity: Verbosity,
    /// Token to resume after. `None` asks for the backlog.
    pub cursor: Option<String>,
    pub backoff: BackoffPolicy,
    /// Silence longer than this marks the connection dead.
    pub liveness_timeout: Duration,
    /// Number of recent record ids remembered for dedup.
    pub dedup_window: usize,
}

impl ConnectorConfig {
    pub fn new(base_url: impl Into<String>, project: ProjectId) -> Self {
        Self {
            base_url: base_url.into(),
            project,
            verbosity: Verbosity::default(),
            cursor: None,
            backoff: BackoffPolicy::default(),
            liveness_timeout: liveness_for(Duration::from_secs(30)),
            dedup_window: 1024,
        }
    }

    pub fn stream_url(&self) -> String {
        format!(
            "{}/projects/{}/activity/stream?verbosity={}",
            self.base_url.trim_end_matches('/'),
            self.project,
            self.verbosity.level()
        )
    }
}

/// Liveness timeout for a given server heartbeat interval.
pub fn liveness_for(heartbeat: Duration) -> Duration {
    heartbeat.mul_f64(LIVENESS_FACTOR)
}

/// What the connector tells its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientUpdate {
    Activity {
        cursor: Option<String>,
        payload: ActivityPayload,
    },
    State(ConnectionState),
}

/// How a connector finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorExit {
    /// Cancelled, or the owner stopped listening.
    Cancelled,
    GivenUp { reason: String },
}

/// How one connection ended, when it is worth retrying.
struct Dropped {
    state: ConnectionState,
    received_any: bool,
}

type Step<T> = std::result::Result<T, ConnectorExit>;

pub struct Connector {
    http: reqwest::Client,
    config: ConnectorConfig,
    state: ConnectionState,
    resume: Option<String>,
    seen: RecentIds,
    updates: mpsc::Sender<ClientUpdate>,
    cancel: CancellationToken,
}

impl Connector {
    pub fn new(
        config: ConnectorConfig,
        updates: mpsc::Sender<ClientUpdate>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            resume: config.cursor.clone(),
            seen: RecentIds::new(config.dedup_window),
            config,
            state: ConnectionState::Connecting,
            updates,
            cancel,
        })
    }

    /// Start a connector on its own task.
    pub fn spawn(
        config: ConnectorConfig,
        capacity: usize,
        cancel: CancellationToken,
    ) -> Result<(mpsc::Receiver<ClientUpdate>, JoinHandle<ConnectorExit>)> {
        let (tx, rx) = mpsc::channel(capacity);
        let connector = Self::new(config, tx, cancel)?;
        Ok((rx, tokio::spawn(connector.run())))
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Where the next connection resumes.
    pub fn resume_token(&self) -> Option<&str> {
        self.resume.as_deref()
    }

    pub async fn run(mut self) -> ConnectorExit {
        let mut backoff = Backoff::new(self.config.backoff.clone());
        match self.cycle(&mut backoff).await {
            Ok(never) => match never {},
            Err(exit) => {
                info!(project = %self.config.project, ?exit, "connector stopped");
                exit
            }
        }
    }

    async fn cycle(&mut self, backoff: &mut Backoff) -> Step<std::convert::Infallible> {
        self.announce(ConnectionState::Connecting).await?;
        loop {
            let dropped = self.connect_once().await?;
            if dropped.received_any {
                backoff.reset();
            }
            self.enter(dropped.state).await?;

            let Some(delay) = backoff.next_delay() else {
                return self
                    .give_up(format!(
                        "{} consecutive failed attempts",
                        backoff.failures()
                    ))
                    .await;
            };
            self.enter(ConnectionState::Reconnecting).await?;
            metrics::client_reconnects().add(1, &[]);
            info!(
                project = %self.config.project,
                delay_ms = delay.as_millis() as u64,
                attempt = backoff.failures(),
                "reconnecting"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(ConnectorExit::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            self.enter(ConnectionState::Connecting).await?;
        }
    }

    /// One HTTP connection, from request to whatever ends it.
    async fn connect_once(&mut self) -> Step<Dropped> {
        let mut request = self
            .http
            .get(self.config.stream_url())
            .header(ACCEPT, "text/event-stream");
        if let Some(token) = &self.resume {
            request = request.header(LAST_EVENT_ID, token);
        }

        let liveness = self.config.liveness_timeout;
        let failed = Dropped {
            state: ConnectionState::Error,
            received_any: false,
        };
        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Err(ConnectorExit::Cancelled),
            res = tokio::time::timeout(liveness, request.send()) => res,
        };
        let response = match response {
            Ok(Ok(r)) if r.status().is_success() => r,
            Ok(Ok(r)) => {
                warn!(status = %r.status(), "stream request rejected");
                return Ok(failed);
            }
            Ok(Err(e)) => {
                warn!("stream request failed: {e}");
                return Ok(failed);
            }
            Err(_) => {
                warn!("stream request timed out");
                return Ok(failed);
            }
        };

        self.enter(ConnectionState::Connected).await?;
        let body = response.bytes_stream();
        tokio::pin!(body);
        let mut decoder = FrameDecoder::new();
        let mut received_any = false;

        loop {
            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => return Err(ConnectorExit::Cancelled),
                chunk = tokio::time::timeout(liveness, body.next()) => chunk,
            };
            let bytes = match chunk {
                Ok(Some(Ok(bytes))) => bytes,
                Ok(Some(Err(e))) => {
                    warn!("stream read failed: {e}");
                    return Ok(Dropped {
                        state: ConnectionState::Error,
                        received_any,
                    });
                }
                Ok(None) => {
                    info!("server closed the stream");
                    return Ok(Dropped {
                        state: ConnectionState::DisconnectedByPeer,
                        received_any,
                    });
                }
                Err(_) => {
                    warn!(timeout_ms = liveness.as_millis() as u64, "stream went silent");
                    return Ok(Dropped {
                        state: ConnectionState::Error,
                        received_any,
                    });
                }
            };

            for frame in decoder.push(&bytes) {
                let event = match Incoming::try_from(frame) {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("ignoring frame: {e}");
                        continue;
                    }
                };
                match event {
                    Incoming::Heartbeat { cursor, .. } => {
                        received_any = true;
                        // Every activity before this heartbeat has been applied.
                        if cursor.is_some() {
                            self.resume = cursor;
                        }
                    }
                    Incoming::Activity { cursor, payload } => {
                        received_any = true;
                        self.apply(cursor, payload).await?;
                    }
                    Incoming::Error(err) if err.code.is_retryable() => {
                        warn!(code = ?err.code, "server error: {}", err.message);
                        return Ok(Dropped {
                            state: ConnectionState::Error,
                            received_any,
                        });
                    }
                    Incoming::Error(err) => {
                        let reason = format!("{}: {}", err.code.as_str(), err.message);
                        return self.give_up(reason).await;
                    }
                }
            }
        }
    }

    async fn apply(&mut self, cursor: Option<String>, payload: ActivityPayload) -> Step<()> {
        if !self.seen.insert(&payload.id) {
            debug!(record = %payload.id, "dropping repeat");
            return Ok(());
        }
        if let Some(token) = &cursor {
            self.resume = Some(token.clone());
        }
        self.publish(ClientUpdate::Activity { cursor, payload }).await
    }

    async fn enter(&mut self, to: ConnectionState) -> Step<()> {
        if !self.state.can_transition_to(to) {
            warn!(from = %self.state, to = %to, "unexpected connection state change");
        }
        self.announce(to).await
    }

    async fn announce(&mut self, state: ConnectionState) -> Step<()> {
        self.state = state;
        debug!(state = %state, "connection state");
        self.publish(ClientUpdate::State(state)).await
    }

    async fn give_up<T>(&mut self, reason: String) -> Step<T> {
        warn!(project = %self.config.project, %reason, "giving up");
        self.enter(ConnectionState::GivenUp).await?;
        Err(ConnectorExit::GivenUp { reason })
    }

    async fn publish(&self, update: ClientUpdate) -> Step<()> {
        self.updates
            .send(update)
            .await
            .map_err(|_| ConnectorExit::Cancelled)
    }
}
