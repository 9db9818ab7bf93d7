use crate::mock_http::MockTokenServer;
use crate::mock_server::{Flavor, MockServer, is_omm_login, is_omm_request};
use crate::{Events, codes, init_logging};
use rdplink::{
    ConnectionConfig, EventCode, Grant, OmmListener, Protocol, Session, SessionConfig,
    SessionRegistry, StreamListener, StreamState, StreamingError,
};
use serde_json::Value;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn config(tokens: &MockTokenServer, server: &MockServer) -> SessionConfig {
    SessionConfig::new("app-key")
        .with_grant(Grant::password("user@example.com", "secret"))
        .with_platform_url(tokens.url())
        .with_token_timing(Duration::from_millis(100), Duration::from_millis(100))
        .with_stream_open_timeout(Duration::from_secs(2))
        .with_connection(
            "pricing",
            ConnectionConfig::static_endpoints(Protocol::Omm, [server.authority()]),
        )
}

fn build(config: SessionConfig, events: &Events) -> Session {
    let recorded = events.clone();
    Session::builder(config)
        .with_registry(Arc::new(SessionRegistry::new()))
        .on_event(move |event| recorded.lock().unwrap().push(event.clone()))
        .build()
        .unwrap()
}

fn login_token(frame: &Value) -> String {
    frame["Key"]["Elements"]["AuthenticationToken"]
        .as_str()
        .unwrap_or_default()
        .to_string()
}

#[tokio::test]
async fn test_refreshed_token_reauthenticates_login_stream() {
    init_logging();
    let tokens = MockTokenServer::new();
    tokens.expires_in.store(2, Ordering::SeqCst);
    let server = MockServer::new(Flavor::Omm).await;
    let events: Events = Arc::new(Mutex::new(Vec::new()));
    let session = build(config(&tokens, &server), &events);
    session.open().await.unwrap();
    let stream = session
        .subscribe(StreamListener::new(OmmListener::new("EUR=")))
        .await
        .unwrap();

    let logins = server
        .wait_for_frames(2, is_omm_login, Duration::from_secs(5))
        .await;
    assert!(logins.len() >= 2);
    assert_eq!(logins[0]["ID"], logins[1]["ID"]);
    assert_eq!(login_token(&logins[0]), "token-1");
    assert_eq!(login_token(&logins[1]), "token-2");

    assert!(tokens.count("refresh_token") >= 1);
    let refresh = tokens
        .requests
        .lock()
        .unwrap()
        .iter()
        .find(|form| form["grant_type"] == "refresh_token")
        .cloned()
        .unwrap();
    assert_eq!(refresh["refresh_token"], "refresh-1");
    assert_eq!(refresh["username"], "user@example.com");

    // Re-authentication keeps the subscriptions.
    assert_eq!(server.frames_where(|f| is_omm_request(f, "EUR=")).len(), 1);
    assert_eq!(stream.state(), StreamState::Open);
    assert!(codes(&events).contains(&EventCode::SessionAuthenticationSuccess));

    session.close().await;
}

#[tokio::test]
async fn test_rejected_login_retries_with_new_token() {
    init_logging();
    let tokens = MockTokenServer::new();
    let server = MockServer::new(Flavor::Omm).await;
    server.reject_logins.store(1, Ordering::SeqCst);
    let events: Events = Arc::new(Mutex::new(Vec::new()));
    let session = build(config(&tokens, &server), &events);
    session.open().await.unwrap();

    let stream = session
        .subscribe(StreamListener::new(OmmListener::new("EUR=")))
        .await
        .unwrap();
    assert_eq!(stream.state(), StreamState::Open);

    let logins = server.frames_where(is_omm_login);
    assert_eq!(logins.len(), 2);
    assert_ne!(logins[0]["ID"], logins[1]["ID"]);
    assert_eq!(login_token(&logins[0]), "token-1");
    assert_eq!(login_token(&logins[1]), "token-2");

    let codes = codes(&events);
    let failed = codes
        .iter()
        .position(|code| *code == EventCode::StreamAuthenticationFailed)
        .unwrap();
    let succeeded = codes
        .iter()
        .position(|code| *code == EventCode::StreamAuthenticationSuccess)
        .unwrap();
    assert!(failed < succeeded);

    session.close().await;
}

#[tokio::test]
async fn test_rejected_login_without_grant_is_terminal() {
    init_logging();
    let server = MockServer::new(Flavor::Omm).await;
    server.reject_logins.store(1, Ordering::SeqCst);
    let events: Events = Arc::new(Mutex::new(Vec::new()));
    let session = build(
        SessionConfig::new("app-key")
            .with_access_token("token-abc")
            .with_connection(
                "pricing",
                ConnectionConfig::static_endpoints(Protocol::Omm, [server.authority()]),
            ),
        &events,
    );
    session.open().await.unwrap();

    let result = session
        .subscribe(StreamListener::new(OmmListener::new("EUR=")))
        .await;
    assert!(matches!(result, Err(StreamingError::Connection(_))));
    let last = events.lock().unwrap().last().cloned().unwrap();
    assert_eq!(last.code, EventCode::StreamDisconnected);
    assert!(last.message.contains("login failed"));
    assert_eq!(server.frames_where(is_omm_login).len(), 1);

    session.close().await;
}

#[tokio::test]
async fn test_manual_access_token_is_forwarded() {
    init_logging();
    let server = MockServer::new(Flavor::Omm).await;
    let events: Events = Arc::new(Mutex::new(Vec::new()));
    let session = build(
        SessionConfig::new("app-key")
            .with_access_token("token-abc")
            .with_connection(
                "pricing",
                ConnectionConfig::static_endpoints(Protocol::Omm, [server.authority()]),
            ),
        &events,
    );
    session.open().await.unwrap();
    assert!(session.wait_for_streaming("pricing").await);

    session.set_access_token("token-manual");
    let logins = server
        .wait_for_frames(2, is_omm_login, Duration::from_secs(5))
        .await;
    assert_eq!(logins.len(), 2);
    assert_eq!(logins[0]["ID"], logins[1]["ID"]);
    assert_eq!(login_token(&logins[0]), "token-abc");
    assert_eq!(login_token(&logins[1]), "token-manual");
    assert_eq!(
        session.connection("pricing").unwrap().state(),
        rdplink::ConnectionState::Open
    );
    session.close().await;
}

#[tokio::test]
async fn test_token_during_login_waits_for_the_login_reply() {
    init_logging();
    let server = MockServer::new(Flavor::Omm).await;
    server.login_delay_ms.store(500, Ordering::SeqCst);
    let events: Events = Arc::new(Mutex::new(Vec::new()));
    let session = build(
        SessionConfig::new("app-key")
            .with_access_token("token-abc")
            .with_connection(
                "pricing",
                ConnectionConfig::static_endpoints(Protocol::Omm, [server.authority()]),
            ),
        &events,
    );
    session.open().await.unwrap();

    let (ready, ()) = tokio::join!(session.wait_for_streaming("pricing"), async {
        let first = server
            .wait_for_frames(1, is_omm_login, Duration::from_secs(5))
            .await;
        assert_eq!(first.len(), 1);
        session.set_access_token("token-2");
        tokio::time::sleep(Duration::from_millis(200)).await;
        // Still one login in flight.
        assert_eq!(server.frames_where(is_omm_login).len(), 1);
    });
    assert!(ready);

    let logins = server
        .wait_for_frames(2, is_omm_login, Duration::from_secs(5))
        .await;
    assert_eq!(logins.len(), 2);
    assert_eq!(logins[0]["ID"], logins[1]["ID"]);
    assert_eq!(login_token(&logins[0]), "token-abc");
    assert_eq!(login_token(&logins[1]), "token-2");
    assert_eq!(
        session.connection("pricing").unwrap().state(),
        rdplink::ConnectionState::Open
    );

    session.close().await;
}
