use crate::mock_http::{MockDiscoveryServer, MockTokenServer};
use crate::mock_server::{Flavor, MockServer, is_omm_login};
use crate::{init_logging, wait_until};
use rdplink::{
    ConnectionConfig, DacsParams, Grant, HeartbeatConfig, OmmListener, Protocol, RdpListener,
    Session, SessionConfig, SessionRegistry, StreamListener, StreamState,
};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn build(config: SessionConfig) -> Session {
    Session::builder(config.with_stream_open_timeout(Duration::from_secs(2)))
        .with_registry(Arc::new(SessionRegistry::new()))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_discovered_endpoint_is_used() {
    init_logging();
    let tokens = MockTokenServer::new();
    let server = MockServer::new(Flavor::Omm).await;
    let discovery = MockDiscoveryServer::new(vec![server.authority()]);
    let session = build(
        SessionConfig::new("app-key")
            .with_grant(Grant::password("user@example.com", "secret"))
            .with_platform_url(tokens.url())
            .with_connection(
                "pricing",
                ConnectionConfig::discovery(
                    Protocol::Omm,
                    format!("{}/streaming/pricing/v1", discovery.url()),
                )
                .with_secure(false),
            ),
    );
    session.open().await.unwrap();

    let stream = session
        .subscribe(StreamListener::new(OmmListener::new("EUR=")))
        .await
        .unwrap();
    assert_eq!(stream.state(), StreamState::Open);
    assert_eq!(
        *discovery.authorizations.lock().unwrap(),
        vec!["Bearer token-1".to_string()]
    );
    assert_eq!(server.handshakes.lock().unwrap().len(), 1);

    // A second stream reuses the connection and the resolved endpoints.
    session
        .subscribe(StreamListener::new(OmmListener::new("JPY=")))
        .await
        .unwrap();
    assert_eq!(discovery.authorizations.lock().unwrap().len(), 1);
    assert_eq!(server.handshakes.lock().unwrap().len(), 1);
    assert_eq!(session.streams().len(), 2);

    session.close().await;
}

#[tokio::test]
async fn test_rdp_subscription() {
    init_logging();
    let server = MockServer::new(Flavor::Rdp).await;
    let session = build(
        SessionConfig::new("app-key")
            .with_access_token("token-abc")
            .with_connection(
                "quantitative-analytics",
                ConnectionConfig::static_endpoints(Protocol::Rdp, [server.authority()]),
            ),
    );
    session.open().await.unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let (on_refresh, on_update) = (received.clone(), received.clone());
    let listener = RdpListener::new("quantitative-analytics", ["EUR="])
        .with_views(["price"])
        .with_parameters(json!({"tenor": "1Y"}));
    let stream = session
        .subscribe(
            StreamListener::new(listener)
                .on_refresh(move |_, message| {
                    on_refresh.lock().unwrap().push(message["type"].clone())
                })
                .on_update(move |_, message| on_update.lock().unwrap().push(message["type"].clone())),
        )
        .await
        .unwrap();
    assert_eq!(stream.state(), StreamState::Open);
    assert!(wait_until(|| received.lock().unwrap().len() == 2, Duration::from_secs(5)).await);
    assert_eq!(
        *received.lock().unwrap(),
        vec![json!("Response"), json!("Update")]
    );

    let handshake = server.handshakes.lock().unwrap()[0].clone();
    assert_eq!(handshake.sub_protocol.as_deref(), Some("rdp_streaming"));

    // The stream registers before the login stream id is drawn.
    let id = stream.id().unwrap().to_string();
    let frames = server.frames();
    assert_eq!(frames[0]["method"], "Auth");
    assert_eq!(frames[0]["token"], "token-abc");
    assert_ne!(frames[0]["streamID"], json!(id));
    assert_eq!(frames[1]["streamID"], json!(id));
    assert_eq!(frames[1]["method"], "Subscribe");
    assert_eq!(frames[1]["universe"], json!(["EUR="]));
    assert_eq!(frames[1]["views"], json!(["price"]));
    assert_eq!(frames[1]["parameters"], json!({"tenor": "1Y"}));

    stream.close();
    let closes = server
        .wait_for_frames(
            1,
            |f| f["method"] == "Close" && f["streamID"] == json!(id),
            Duration::from_secs(2),
        )
        .await;
    assert_eq!(closes.len(), 1);

    session.close().await;
}

#[tokio::test]
async fn test_deployed_login_uses_dacs_parameters() {
    init_logging();
    let server = MockServer::new(Flavor::Omm).await;
    let session = build(
        SessionConfig::new("app-key").with_connection(
            "pricing",
            ConnectionConfig::static_endpoints(Protocol::Omm, [server.authority()])
                .with_dacs(DacsParams::new("dacs-user", "256", "10.0.0.1/host")),
        ),
    );
    session.open().await.unwrap();
    let stream = session
        .subscribe(StreamListener::new(
            OmmListener::new("EUR=").with_service("ELEKTRON_DD"),
        ))
        .await
        .unwrap();
    assert_eq!(stream.state(), StreamState::Open);

    let logins = server.frames_where(is_omm_login);
    assert_eq!(logins.len(), 1);
    assert_eq!(
        logins[0]["Key"],
        json!({
            "Name": "dacs-user",
            "Elements": {"ApplicationId": "256", "Position": "10.0.0.1/host"}
        })
    );
    let request = server
        .frames_where(|f| f["Key"]["Name"] == "EUR=")
        .remove(0);
    assert_eq!(request["Key"]["Service"], "ELEKTRON_DD");

    session.close().await;
}

#[tokio::test]
async fn test_heartbeat_pings_idle_connection() {
    init_logging();
    let server = MockServer::new(Flavor::Omm).await;
    let session = build(
        SessionConfig::new("app-key")
            .with_access_token("token-abc")
            .with_heartbeat(HeartbeatConfig {
                enabled: true,
                idle_timeout: Duration::from_millis(100),
                ping_timeout: Duration::from_secs(1),
            })
            .with_connection(
                "pricing",
                ConnectionConfig::static_endpoints(Protocol::Omm, [server.authority()]),
            ),
    );
    session.open().await.unwrap();
    assert!(session.wait_for_streaming("pricing").await);

    let pings = server
        .wait_for_frames(2, |f| f["Type"] == "Ping", Duration::from_secs(5))
        .await;
    assert!(pings.len() >= 2);

    // Server pings are answered with a pong.
    server.push(json!([{"Type": "Ping"}]));
    let pongs = server
        .wait_for_frames(1, |f: &Value| f["Type"] == "Pong", Duration::from_secs(2))
        .await;
    assert_eq!(pongs.len(), 1);

    assert_eq!(server.handshakes.lock().unwrap().len(), 1);
    assert_eq!(
        session.connection("pricing").unwrap().state(),
        rdplink::ConnectionState::Open
    );
    session.close().await;
}

#[tokio::test]
async fn test_outbound_traffic_does_not_suppress_heartbeat() {
    init_logging();
    let server = MockServer::new(Flavor::Omm).await;
    let session = build(
        SessionConfig::new("app-key")
            .with_access_token("token-abc")
            .with_heartbeat(HeartbeatConfig {
                enabled: true,
                idle_timeout: Duration::from_millis(300),
                ping_timeout: Duration::from_secs(5),
            })
            .with_connection(
                "pricing",
                ConnectionConfig::static_endpoints(Protocol::Omm, [server.authority()]),
            ),
    );
    session.open().await.unwrap();
    assert!(session.wait_for_streaming("pricing").await);

    // The server stays silent while the client keeps writing.
    for _ in 0..30 {
        session.send("pricing", json!({"Type": "Pong"}));
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let pings = server.frames_where(|f| f["Type"] == "Ping");
    assert!(!pings.is_empty());

    session.close().await;
}
