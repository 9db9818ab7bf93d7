use crate::mock_server::{Flavor, MockServer, is_omm_login, is_omm_request};
use crate::{Events, codes, init_logging, wait_until};
use rdplink::{
    ConnectionConfig, EventCode, FailoverState, OmmListener, Protocol, ReconnectConfig, Session,
    SessionConfig, SessionRegistry, StreamListener, StreamState,
};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn fast_reconnect(max_retry_rotations: u32) -> ReconnectConfig {
    ReconnectConfig {
        enabled: true,
        base_delay: Duration::from_millis(20),
        max_retry_rotations,
        loop_pause: Duration::from_millis(20),
        unbounded: false,
    }
}

fn session(server: &MockServer, reconnect: ReconnectConfig, events: &Events) -> Session {
    let recorded = events.clone();
    Session::builder(
        SessionConfig::new("app-key")
            .with_access_token("token-abc")
            .with_reconnect(reconnect)
            .with_stream_open_timeout(Duration::from_secs(2))
            .with_connection(
                "pricing",
                ConnectionConfig::static_endpoints(Protocol::Omm, [server.authority()]),
            ),
    )
    .with_registry(Arc::new(SessionRegistry::new()))
    .on_event(move |event| recorded.lock().unwrap().push(event.clone()))
    .build()
    .unwrap()
}

type Log = Arc<Mutex<Vec<String>>>;

/// Records "<name> <Type>" for refreshes and updates.
fn recording(name: &str, log: &Log) -> StreamListener {
    let (on_refresh, on_update) = (log.clone(), log.clone());
    StreamListener::new(OmmListener::new(name))
        .on_refresh(move |stream, _| {
            on_refresh
                .lock()
                .unwrap()
                .push(format!("{} Refresh", stream.name()))
        })
        .on_update(move |stream, _| {
            on_update
                .lock()
                .unwrap()
                .push(format!("{} Update", stream.name()))
        })
}

fn count(log: &Log, entry: &str) -> usize {
    log.lock().unwrap().iter().filter(|e| *e == entry).count()
}

fn status_codes(statuses: &Arc<Mutex<Vec<Value>>>) -> Vec<String> {
    statuses
        .lock()
        .unwrap()
        .iter()
        .filter_map(|status| status["State"]["Code"].as_str().map(str::to_string))
        .collect()
}

#[tokio::test]
async fn test_dropped_connection_resubscribes() {
    init_logging();
    let server = MockServer::new(Flavor::Omm).await;
    let events: Events = Arc::new(Mutex::new(Vec::new()));
    let session = session(&server, fast_reconnect(5), &events);
    session.open().await.unwrap();

    let refreshes = Arc::new(AtomicUsize::new(0));
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let (on_refresh, on_status) = (refreshes.clone(), statuses.clone());
    let stream = session
        .subscribe(
            StreamListener::new(OmmListener::new("EUR="))
                .on_refresh(move |_, _| {
                    on_refresh.fetch_add(1, Ordering::SeqCst);
                })
                .on_status(move |_, message| on_status.lock().unwrap().push(message.clone())),
        )
        .await
        .unwrap();
    assert_eq!(refreshes.load(Ordering::SeqCst), 1);

    server.kill_connections();

    assert!(
        wait_until(
            || refreshes.load(Ordering::SeqCst) == 2,
            Duration::from_secs(5)
        )
        .await
    );
    assert!(session.wait_for_streaming_reconnection("pricing").await);
    assert_eq!(stream.state(), StreamState::Open);

    let requests = server.frames_where(|f| is_omm_request(f, "EUR="));
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0]["ID"], requests[1]["ID"]);
    assert_eq!(server.frames_where(is_omm_login).len(), 2);
    assert_eq!(server.handshakes.lock().unwrap().len(), 2);

    let codes = codes(&events);
    let reconnecting = codes
        .iter()
        .position(|code| *code == EventCode::StreamReconnecting)
        .unwrap();
    let reconnected = events
        .lock()
        .unwrap()
        .iter()
        .position(|event| {
            event.code == EventCode::StreamConnected && event.message.ends_with("reconnected")
        })
        .unwrap();
    assert!(reconnecting < reconnected);
    assert_eq!(
        session.stream_status("pricing"),
        Some(EventCode::StreamConnected)
    );

    assert_eq!(
        status_codes(&statuses),
        vec![
            FailoverState::Started.status_code().to_string(),
            FailoverState::Completed.status_code().to_string()
        ]
    );
    let connection = session.connection("pricing").unwrap();
    assert_eq!(connection.retries(), 0);

    session.close().await;
}

#[tokio::test]
async fn test_gives_up_after_max_retry_rotations() {
    init_logging();
    let server = MockServer::new(Flavor::Omm).await;
    let events: Events = Arc::new(Mutex::new(Vec::new()));
    let session = session(&server, fast_reconnect(2), &events);
    session.open().await.unwrap();

    let statuses = Arc::new(Mutex::new(Vec::new()));
    let on_status = statuses.clone();
    let stream = session
        .subscribe(
            StreamListener::new(OmmListener::new("EUR="))
                .on_status(move |_, message| on_status.lock().unwrap().push(message.clone())),
        )
        .await
        .unwrap();
    let connection = session.connection("pricing").unwrap();

    server.stop_accepting();
    tokio::time::sleep(Duration::from_millis(50)).await;
    server.kill_connections();

    assert!(
        wait_until(
            || session.stream_status("pricing") == Some(EventCode::StreamDisconnected),
            Duration::from_secs(5)
        )
        .await
    );
    assert!(connection.is_terminated());
    assert_eq!(stream.state(), StreamState::Closed);
    assert!(session.streams().is_empty());

    let last = events.lock().unwrap().last().cloned().unwrap();
    assert_eq!(last.code, EventCode::StreamDisconnected);
    assert_eq!(
        last.message,
        "Streaming connection to API 'pricing' cannot reconnect after multiple unsuccessful attempts."
    );
    assert_eq!(
        status_codes(&statuses),
        vec![
            FailoverState::Started.status_code().to_string(),
            FailoverState::Error.status_code().to_string()
        ]
    );
    assert_eq!(statuses.lock().unwrap()[1]["State"]["Stream"], "Closed");

    session.close().await;
}

#[tokio::test]
async fn test_disabled_reconnect_is_terminal() {
    init_logging();
    let server = MockServer::new(Flavor::Omm).await;
    let events: Events = Arc::new(Mutex::new(Vec::new()));
    let reconnect = ReconnectConfig {
        enabled: false,
        ..fast_reconnect(5)
    };
    let session = session(&server, reconnect, &events);
    session.open().await.unwrap();
    let stream = session
        .subscribe(StreamListener::new(OmmListener::new("EUR=")))
        .await
        .unwrap();

    server.kill_connections();
    assert!(
        wait_until(
            || stream.state() == StreamState::Closed,
            Duration::from_secs(5)
        )
        .await
    );
    assert!(!codes(&events).contains(&EventCode::StreamReconnecting));
    assert_eq!(
        events.lock().unwrap().last().unwrap().message,
        "Streaming connection to API 'pricing' was disconnected."
    );
    assert_eq!(server.handshakes.lock().unwrap().len(), 1);

    // A later subscription starts a fresh connection.
    let again = session
        .subscribe(StreamListener::new(OmmListener::new("GBP=")))
        .await
        .unwrap();
    assert_eq!(again.state(), StreamState::Open);
    assert_eq!(server.handshakes.lock().unwrap().len(), 2);

    session.close().await;
}

#[tokio::test]
async fn test_resubscribes_only_open_streams() {
    init_logging();
    let server = MockServer::new(Flavor::Omm).await;
    let events: Events = Arc::new(Mutex::new(Vec::new()));
    let session = session(&server, fast_reconnect(5), &events);
    session.open().await.unwrap();

    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let mut open = Vec::new();
    for name in ["EUR=", "JPY=", "GBP="] {
        open.push(session.subscribe(recording(name, &log)).await.unwrap());
    }
    let closed = session.subscribe(recording("CHF=", &log)).await.unwrap();
    let paused = session.subscribe(recording("AUD=", &log)).await.unwrap();
    assert_eq!(session.unsubscribe(&closed), StreamState::Closed);
    assert_eq!(paused.pause(), StreamState::Paused);

    server.kill_connections();
    assert!(
        wait_until(
            || ["EUR=", "JPY=", "GBP="]
                .iter()
                .all(|name| count(&log, &format!("{} Refresh", name)) == 2),
            Duration::from_secs(5)
        )
        .await
    );
    assert!(session.wait_for_streaming_reconnection("pricing").await);

    for name in ["EUR=", "JPY=", "GBP="] {
        assert_eq!(server.frames_where(|f| is_omm_request(f, name)).len(), 2);
    }
    assert_eq!(server.frames_where(|f| is_omm_request(f, "CHF=")).len(), 1);
    assert_eq!(server.frames_where(|f| is_omm_request(f, "AUD=")).len(), 1);
    assert_eq!(count(&log, "AUD= Refresh"), 1);

    // Frames after the reconnection reach the same stream objects.
    let live = session.streams();
    for stream in &open {
        assert_eq!(stream.state(), StreamState::Open);
        assert!(live.iter().any(|known| Arc::ptr_eq(known, stream)));
        server.push(json!([
            {"ID": stream.id().unwrap(), "Type": "Update", "Fields": {"BID": 2.0}}
        ]));
    }
    assert!(
        wait_until(
            || ["EUR=", "JPY=", "GBP="]
                .iter()
                .all(|name| count(&log, &format!("{} Update", name)) == 3),
            Duration::from_secs(5)
        )
        .await
    );
    assert!(live.iter().any(|known| Arc::ptr_eq(known, &paused)));
    assert!(!live.iter().any(|known| Arc::ptr_eq(known, &closed)));

    session.close().await;
}

#[tokio::test]
async fn test_stream_opened_during_reconnection_subscribes_once() {
    init_logging();
    let server = MockServer::new(Flavor::Omm).await;
    let events: Events = Arc::new(Mutex::new(Vec::new()));
    let reconnect = ReconnectConfig {
        loop_pause: Duration::from_millis(500),
        ..fast_reconnect(5)
    };
    let session = session(&server, reconnect, &events);
    session.open().await.unwrap();

    let log: Log = Arc::new(Mutex::new(Vec::new()));
    session.subscribe(recording("EUR=", &log)).await.unwrap();

    server.kill_connections();
    assert!(
        wait_until(
            || codes(&events).contains(&EventCode::StreamReconnecting),
            Duration::from_secs(5)
        )
        .await
    );
    let late = session.subscribe(recording("GBP=", &log)).await.unwrap();
    assert_eq!(late.state(), StreamState::Open);

    // Give a duplicate request time to show up.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.frames_where(|f| is_omm_request(f, "GBP=")).len(), 1);
    assert_eq!(count(&log, "GBP= Refresh"), 1);
    assert_eq!(server.frames_where(|f| is_omm_request(f, "EUR=")).len(), 2);

    session.close().await;
}
