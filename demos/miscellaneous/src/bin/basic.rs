use rdplink::{
    ConnectionConfig, Grant, OmmListener, Protocol, Session, SessionConfig, StreamListener,
};
use std::env;
use std::error::Error;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Configure logging
    tracing_subscriber::fmt::init();

    info!("Starting rdplink session...");

    // Credentials come from the environment
    let app_key = env::var("RDP_APP_KEY")?;
    let username = env::var("RDP_USERNAME")?;
    let password = env::var("RDP_PASSWORD")?;

    let config = SessionConfig::new(app_key)
        .with_grant(Grant::password(username, password))
        .with_connection(
            "pricing",
            ConnectionConfig::discovery(Protocol::Omm, "/streaming/pricing/v1/"),
        );

    let session = Session::builder(config)
        .on_state(|state, message| info!("Session {}: {}", state, message))
        .on_event(|event| info!("Event {}", event))
        .build()?;

    info!("Opening session...");
    session.open().await?;
    info!("Session open");

    // Subscribe to a few instruments on the pricing connection
    let mut streams = Vec::new();
    for ric in ["EUR=", "JPY=", "GBP="] {
        let listener = StreamListener::new(OmmListener::new(ric).with_fields(["BID", "ASK"]))
            .on_refresh(|stream, message| {
                info!("Refresh {}: {}", stream.name(), message["Fields"])
            })
            .on_update(|stream, message| info!("Update {}: {}", stream.name(), message["Fields"]))
            .on_status(|stream, message| warn!("Status {}: {}", stream.name(), message["State"]));
        let stream = session.subscribe(listener).await?;
        info!("Stream {} is {}", ric, stream.state());
        streams.push(stream);
    }

    // Keep streaming for 2 minutes
    info!("Receiving data for 2 minutes...");
    sleep(Duration::from_secs(120)).await;

    // Cleanup
    info!("Closing streams...");
    for stream in &streams {
        session.unsubscribe(stream);
    }
    session.close().await;
    info!("Session closed");

    Ok(())
}
