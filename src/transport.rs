//! HTTP surface: one SSE endpoint per project plus a health check.
//!
//! Every subscription gets its own session task. Request problems (unknown
//! project, bad verbosity, bad cursor) are not HTTP errors: the stream opens,
//! carries a single `error` event, and closes.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event as SseEvent, Sse};
use axum::routing::get;
use axum::Router;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::StreamSettings;
use crate::cursor::Cursor;
use crate::error::Result;
use crate::model::{ProjectId, Verbosity};
use crate::protocol::{ErrorPayload, StreamEvent};
use crate::store::ActivityLog;
use crate::stream::{Session, Subscription};

/// Request header a reconnecting SSE client uses to send its last `id:`.
pub const LAST_EVENT_ID: &str = "last-event-id";

type EventStream = BoxStream<'static, std::result::Result<SseEvent, Infallible>>;

#[derive(Clone)]
pub struct AppState {
    pub log: Arc<dyn ActivityLog>,
    pub settings: StreamSettings,
    /// Cancelled on server shutdown; every session runs under a child.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(log: Arc<dyn ActivityLog>, settings: StreamSettings) -> Self {
        Self {
            log,
            settings,
            shutdown: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    pub verbosity: Option<String>,
    pub cursor: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/projects/{project_id}/activity/stream",
            get(stream_activity),
        )
        .with_state(state)
}

/// Serve until `state.shutdown` is cancelled. Open streams end when their
/// sessions see the cancellation.
pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    let shutdown = state.shutdown.clone();
    info!(addr = %listener.local_addr()?, "relay listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("relay stopped");
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

async fn stream_activity(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Sse<EventStream> {
    let resume = headers
        .get(LAST_EVENT_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(query.cursor.clone());

    let subscription = match parse_subscription(&project_id, &query, resume.as_deref()) {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!(project = %project_id, "rejecting subscription: {e}");
            let event = StreamEvent::Error(ErrorPayload::from(&e));
            return Sse::new(stream::once(async move { Ok(to_sse(&event)) }).boxed());
        }
    };

    let cancel = state.shutdown.child_token();
    // Dropping the response body (client went away) cancels the session.
    let guard = cancel.clone().drop_guard();
    let rx = Session::new(state.log, state.settings, subscription, cancel).spawn();

    let events = ReceiverStream::new(rx).map(move |event| {
        let _guard = &guard;
        Ok(to_sse(&event))
    });
    Sse::new(events.boxed())
}

/// Resolve the request into a subscription. A `resume` token, when given,
/// must decode; without one the subscription starts with the backlog.
pub fn parse_subscription(
    project_id: &str,
    query: &StreamQuery,
    resume: Option<&str>,
) -> Result<Subscription> {
    let project: ProjectId = project_id.parse()?;
    let verbosity = match query.verbosity.as_deref() {
        Some(v) => v.parse::<Verbosity>()?,
        None => Verbosity::default(),
    };
    let cursor = resume.map(str::parse::<Cursor>).transpose()?;
    Ok(Subscription {
        project,
        verbosity,
        cursor,
    })
}

fn to_sse(event: &StreamEvent) -> SseEvent {
    let frame = event.to_frame();
    let sse = SseEvent::default()
        .event(event.name().as_str())
        .data(frame.data);
    match frame.id {
        Some(id) => sse.id(id),
        None => sse,
    }
}
