//! HTTP surface and the client connector against a live server.

use std::sync::Arc;
use std::time::Duration;

use activity_relay::client::{
    BackoffPolicy, ClientUpdate, ConnectionState, Connector, ConnectorConfig, ConnectorExit,
};
use activity_relay::config::StreamSettings;
use activity_relay::cursor::Cursor;
use activity_relay::model::*;
use activity_relay::protocol::{ErrorCode, Frame, FrameDecoder, Incoming};
use activity_relay::store::MemoryLog;
use activity_relay::transport::{self, AppState, router};
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use chrono::{DateTime, TimeZone, Utc};
use futures_util::StreamExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

fn at(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
}

fn fast_settings() -> StreamSettings {
    StreamSettings {
        poll_interval_ms: 20,
        heartbeat_secs: 1,
        ..StreamSettings::default()
    }
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

/// Read frames off an SSE body until `want` arrived or the body ended.
async fn read_frames(body: Body, want: usize) -> Vec<Frame> {
    let mut stream = body.into_data_stream();
    let mut decoder = FrameDecoder::new();
    let mut frames = Vec::new();
    while frames.len() < want {
        let next = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("stream stalled");
        match next {
            Some(chunk) => frames.extend(decoder.push(&chunk.unwrap())),
            None => break,
        }
    }
    frames
}

fn incoming(frames: Vec<Frame>) -> Vec<Incoming> {
    frames
        .into_iter()
        .map(|f| Incoming::try_from(f).unwrap())
        .collect()
}

fn only_error(frames: Vec<Frame>) -> ErrorCode {
    let events = incoming(frames);
    assert_eq!(events.len(), 1, "expected exactly one event: {events:?}");
    match &events[0] {
        Incoming::Error(e) => e.code,
        other => panic!("expected error, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_returns_ok() {
    let app = router(AppState::new(Arc::new(MemoryLog::new()), fast_settings()));
    let resp = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"ok");
}

#[tokio::test]
async fn malformed_project_id_is_a_single_not_found_event() {
    let app = router(AppState::new(Arc::new(MemoryLog::new()), fast_settings()));
    let resp = app
        .oneshot(get("/projects/not-a-uuid/activity/stream"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(
        resp.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );
    assert_eq!(only_error(read_frames(resp.into_body(), 2).await), ErrorCode::NotFound);
}

#[tokio::test]
async fn unknown_project_is_not_found_then_closed() {
    let app = router(AppState::new(Arc::new(MemoryLog::new()), fast_settings()));
    let uri = format!("/projects/{}/activity/stream", ProjectId::new());
    let resp = app.oneshot(get(&uri)).await.unwrap();
    assert_eq!(only_error(read_frames(resp.into_body(), 2).await), ErrorCode::NotFound);
}

#[tokio::test]
async fn bad_verbosity_and_cursor_are_rejected() {
    let log = Arc::new(MemoryLog::new());
    let project = log.create_project();
    let state = AppState::new(log, fast_settings());

    let uri = format!("/projects/{project}/activity/stream?verbosity=9");
    let resp = router(state.clone()).oneshot(get(&uri)).await.unwrap();
    assert_eq!(
        only_error(read_frames(resp.into_body(), 2).await),
        ErrorCode::InvalidRequest
    );

    let uri = format!("/projects/{project}/activity/stream?cursor=garbage");
    let resp = router(state).oneshot(get(&uri)).await.unwrap();
    assert_eq!(
        only_error(read_frames(resp.into_body(), 2).await),
        ErrorCode::InvalidCursor
    );
}

#[tokio::test]
async fn activity_frames_are_named_and_carry_a_cursor() {
    let log = Arc::new(MemoryLog::new());
    let project = log.create_project();
    let exec = log
        .insert_execution(NewExecution::new(project, "build").started_at(at(0)))
        .unwrap();
    log.transition(exec.id, ExecutionStatus::Running, at(0)).unwrap();
    log.append_line(exec.id, "compiling", at(1)).unwrap();

    let app = router(AppState::new(log, fast_settings()));
    let uri = format!("/projects/{project}/activity/stream?verbosity=high");
    let resp = app.oneshot(get(&uri)).await.unwrap();
    let frames = read_frames(resp.into_body(), 3).await;

    let names: Vec<_> = frames.iter().map(|f| f.event.as_deref()).collect();
    assert_eq!(names, vec![Some("activity"), Some("activity"), Some("heartbeat")]);
    let token = frames[1].id.as_deref().expect("activity without id");
    let cursor: Cursor = token.parse().unwrap();
    assert_eq!(cursor.line.map(|k| k.seq), Some(0));
    // The heartbeat repeats the position of everything sent before it.
    assert_eq!(frames[2].id.as_deref(), Some(token));
}

#[tokio::test]
async fn last_event_id_wins_over_query_cursor() {
    let log = Arc::new(MemoryLog::new());
    let project = log.create_project();
    let exec = log
        .insert_execution(NewExecution::new(project, "build").running().started_at(at(0)))
        .unwrap();
    log.append_line(exec.id, "old", at(1)).unwrap();
    let mut resume = Cursor::start();
    resume.advance_line(log.append_line(exec.id, "seen", at(2)).unwrap().line_key());
    log.append_line(exec.id, "new", at(3)).unwrap();

    let app = router(AppState::new(log, fast_settings()));
    let request = Request::builder()
        .uri(format!(
            "/projects/{project}/activity/stream?verbosity=3&cursor=garbage"
        ))
        .header(transport::LAST_EVENT_ID, resume.encode())
        .body(Body::empty())
        .unwrap();
    let resp = app.oneshot(request).await.unwrap();

    let events = incoming(read_frames(resp.into_body(), 1).await);
    match &events[0] {
        Incoming::Activity { payload, .. } => assert_eq!(payload.message, "new"),
        other => panic!("expected activity, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Client connector end to end
// ---------------------------------------------------------------------------

async fn start_server(
    listener: TcpListener,
    log: Arc<MemoryLog>,
) -> (CancellationToken, tokio::task::JoinHandle<()>) {
    let state = AppState::new(log, fast_settings());
    let shutdown = state.shutdown.clone();
    let handle = tokio::spawn(async move {
        transport::serve(listener, state).await.unwrap();
    });
    (shutdown, handle)
}

fn quick_backoff(max_attempts: u32) -> BackoffPolicy {
    BackoffPolicy {
        base: Duration::from_millis(20),
        cap: Duration::from_millis(80),
        max_attempts,
    }
}

async fn next_update(rx: &mut tokio::sync::mpsc::Receiver<ClientUpdate>) -> ClientUpdate {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no update within 5s")
        .expect("connector channel closed")
}

/// Collect activity messages until `n` arrived, recording states on the way.
async fn collect_messages(
    rx: &mut tokio::sync::mpsc::Receiver<ClientUpdate>,
    n: usize,
    states: &mut Vec<ConnectionState>,
) -> Vec<String> {
    let mut messages = Vec::new();
    while messages.len() < n {
        match next_update(rx).await {
            ClientUpdate::Activity { payload, .. } => messages.push(payload.message),
            ClientUpdate::State(s) => states.push(s),
        }
    }
    messages
}

#[tokio::test]
async fn connector_resumes_after_server_restart_without_gaps_or_repeats() {
    let log = Arc::new(MemoryLog::new());
    let project = log.create_project();
    let exec = log
        .insert_execution(NewExecution::new(project, "build").running().started_at(at(0)))
        .unwrap();
    log.append_line(exec.id, "line 0", at(1)).unwrap();
    log.append_line(exec.id, "line 1", at(2)).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, server) = start_server(listener, log.clone()).await;

    let mut config = ConnectorConfig::new(format!("http://{addr}"), project);
    config.verbosity = Verbosity::High;
    config.backoff = quick_backoff(50);
    config.liveness_timeout = Duration::from_secs(3);
    // A window of one makes a replayed backlog visible as repeats.
    config.dedup_window = 1;
    let cancel = CancellationToken::new();
    let (mut rx, handle) = Connector::spawn(config, 64, cancel.clone()).unwrap();

    let mut states = Vec::new();
    let first = collect_messages(&mut rx, 2, &mut states).await;
    assert_eq!(first, vec!["line 0", "line 1"]);
    assert_eq!(
        states,
        vec![ConnectionState::Connecting, ConnectionState::Connected]
    );

    shutdown.cancel();
    server.await.unwrap();
    log.append_line(exec.id, "line 2", at(3)).unwrap();
    log.transition(exec.id, ExecutionStatus::Completed, at(4))
        .unwrap();

    let listener = TcpListener::bind(addr).await.unwrap();
    let (shutdown, _server) = start_server(listener, log.clone()).await;

    states.clear();
    let rest = collect_messages(&mut rx, 2, &mut states).await;
    assert_eq!(rest, vec!["line 2", "build completed"]);
    assert!(states.contains(&ConnectionState::Reconnecting));
    assert_eq!(states.last(), Some(&ConnectionState::Connected));

    cancel.cancel();
    assert_eq!(handle.await.unwrap(), ConnectorExit::Cancelled);
    shutdown.cancel();
}

#[tokio::test]
async fn connector_reconnecting_before_any_activity_misses_nothing() {
    let log = Arc::new(MemoryLog::new());
    let project = log.create_project();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, server) = start_server(listener, log.clone()).await;

    let mut config = ConnectorConfig::new(format!("http://{addr}"), project);
    config.verbosity = Verbosity::High;
    config.backoff = quick_backoff(50);
    config.liveness_timeout = Duration::from_secs(3);
    let cancel = CancellationToken::new();
    let (mut rx, handle) = Connector::spawn(config, 64, cancel.clone()).unwrap();

    loop {
        if let ClientUpdate::State(ConnectionState::Connected) = next_update(&mut rx).await {
            break;
        }
    }
    // Only heartbeats arrive on an idle project.
    tokio::time::sleep(Duration::from_millis(300)).await;
    shutdown.cancel();
    server.await.unwrap();

    // More than a backlog's worth, written while the client is away.
    let exec = log
        .insert_execution(NewExecution::new(project, "build").running().started_at(at(0)))
        .unwrap();
    let total = StreamSettings::default().backlog_limit + 11;
    for i in 0..total {
        log.append_line(exec.id, format!("line {i}"), at(1 + i as i64))
            .unwrap();
    }

    let listener = TcpListener::bind(addr).await.unwrap();
    let (shutdown, _server) = start_server(listener, log.clone()).await;

    let mut states = Vec::new();
    let messages = collect_messages(&mut rx, total, &mut states).await;
    let expected: Vec<String> = (0..total).map(|i| format!("line {i}")).collect();
    assert_eq!(messages, expected);
    assert!(states.contains(&ConnectionState::Reconnecting));

    cancel.cancel();
    assert_eq!(handle.await.unwrap(), ConnectorExit::Cancelled);
    shutdown.cancel();
}

#[tokio::test]
async fn connector_gives_up_on_not_found_without_retrying() {
    let log = Arc::new(MemoryLog::new());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, _server) = start_server(listener, log).await;

    let mut config = ConnectorConfig::new(format!("http://{addr}"), ProjectId::new());
    config.backoff = quick_backoff(10);
    let (mut rx, handle) = Connector::spawn(config, 64, CancellationToken::new()).unwrap();

    let mut states = Vec::new();
    while let Some(update) = rx.recv().await {
        if let ClientUpdate::State(s) = update {
            states.push(s);
        }
    }
    assert_eq!(
        states,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::GivenUp
        ]
    );
    match handle.await.unwrap() {
        ConnectorExit::GivenUp { reason } => assert!(reason.starts_with("not_found")),
        other => panic!("expected GivenUp, got {other:?}"),
    }
    shutdown.cancel();
}

#[tokio::test]
async fn connector_gives_up_after_max_attempts() {
    // Grab a free port, then close it so every attempt is refused.
    let addr = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap();

    let mut config = ConnectorConfig::new(format!("http://{addr}"), ProjectId::new());
    config.backoff = quick_backoff(3);
    let (mut rx, handle) = Connector::spawn(config, 64, CancellationToken::new()).unwrap();

    let mut states = Vec::new();
    while let Some(update) = rx.recv().await {
        if let ClientUpdate::State(s) = update {
            states.push(s);
        }
    }
    use ConnectionState::*;
    assert_eq!(
        states,
        vec![
            Connecting, Error, Reconnecting, Connecting, Error, Reconnecting, Connecting, Error,
            GivenUp
        ]
    );
    assert!(matches!(
        handle.await.unwrap(),
        ConnectorExit::GivenUp { .. }
    ));
}

#[tokio::test]
async fn cancelling_during_backoff_stops_at_once() {
    let addr = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap();

    let mut config = ConnectorConfig::new(format!("http://{addr}"), ProjectId::new());
    config.backoff = BackoffPolicy {
        base: Duration::from_secs(60),
        ..BackoffPolicy::default()
    };
    let cancel = CancellationToken::new();
    let (mut rx, handle) = Connector::spawn(config, 64, cancel.clone()).unwrap();

    while let ClientUpdate::State(s) = next_update(&mut rx).await {
        if s == ConnectionState::Reconnecting {
            break;
        }
    }
    cancel.cancel();
    let exit = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("connector kept sleeping")
        .unwrap();
    assert_eq!(exit, ConnectorExit::Cancelled);
}
