//! # rdplink
//!
//! `rdplink` is a Rust client library for streaming market data over the OMM
//! (`tr_json2`) and RDP (`rdp_streaming`) WebSocket protocols. It manages the whole
//! lifecycle of a streaming session: obtaining and refreshing OAuth access tokens,
//! resolving endpoints (static, legacy or through service discovery), logging in on
//! each WebSocket, multiplexing many subscriptions over one connection and
//! reconnecting through the candidate endpoints when a connection drops.
//!
//! ## Features
//!
//! - Password and refresh token grants with background token refresh
//! - Static, legacy and service discovery endpoint resolution
//! - OMM and RDP login, subscription and close frames
//! - Deployed (DACS) logins for local servers
//! - Round-robin reconnection with increasing back-off and automatic resubscription
//! - Application and WebSocket level heartbeats
//! - Pause and resume of individual streams
//! - Session and connection events through callbacks
//!
//! ## Example
//!
//! ```rust,no_run
//! use rdplink::{
//!     ConnectionConfig, Grant, OmmListener, Protocol, Session, SessionConfig, StreamListener,
//! };
//! use tracing::info;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SessionConfig::new("your_app_key")
//!         .with_grant(Grant::password("user", "password"))
//!         .with_connection(
//!             "pricing",
//!             ConnectionConfig::discovery(Protocol::Omm, "/streaming/pricing/v1/"),
//!         );
//!
//!     let session = Session::builder(config)
//!         .on_event(|event| info!("{}", event))
//!         .build()?;
//!     session.open().await?;
//!
//!     let listener = StreamListener::new(OmmListener::new("EUR=").with_fields(["BID", "ASK"]))
//!         .on_refresh(|stream, message| info!("Refresh for {}: {}", stream.name(), message))
//!         .on_update(|stream, message| info!("Update for {}: {}", stream.name(), message));
//!     let stream = session.subscribe(listener).await?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(60)).await;
//!
//!     stream.close();
//!     session.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Deployed servers
//!
//! A connection to a local server logs in with DACS parameters instead of a token:
//!
//! ```rust,no_run
//! use rdplink::{ConnectionConfig, DacsParams, Protocol, SessionConfig};
//!
//! let config = SessionConfig::new("your_app_key").with_connection(
//!     "pricing",
//!     ConnectionConfig::static_endpoints(Protocol::Omm, ["ads1:15000", "ads2:15000"])
//!         .with_dacs(DacsParams::default()),
//! );
//! ```
//!
//! ## Error Handling
//!
//! The library uses a custom error type `StreamingError`:
//!
//! ```rust,no_run
//! use tracing::{error, info};
//! use rdplink::{Session, StreamingError};
//!
//! async fn example_error_handling(session: &Session) {
//!     match session.open().await {
//!         Ok(_) => info!("Session opened"),
//!         Err(StreamingError::Authentication { status, message }) => {
//!             error!("Authentication failed ({:?}): {}", status, message)
//!         }
//!         Err(StreamingError::Timeout(e)) => error!("No token in time: {}", e),
//!         Err(e) => error!("Other error: {}", e),
//!     }
//! }
//! ```
//!
//! ## License
//!
//! This project is licensed under the MIT License. See the LICENSE file for details.
//!
//!  ## Contribution and Contact
//!
//!  We welcome contributions to this project! If you would like to contribute, please follow these steps:
//!
//!  1. Fork the repository.
//!  2. Create a new branch for your feature or bug fix.
//!  3. Make your changes and ensure that the project still builds and all tests pass.
//!  4. Commit your changes and push your branch to your forked repository.
//!  5. Submit a pull request to the main repository.
//!
//!  If you have any questions, issues, or would like to provide feedback, please feel free to contact the project maintainer:
//!
//!  **Joaquín Béjar García**
//!  - Email: jb@taunais.com
//!  - GitHub: [joaquinbejar](https://github.com/joaquinbejar)
//!

/// Session, connection, reconnection and heartbeat configuration.
///
/// Configuration is built in code with `with_*` methods, or read per connection
/// from flat `<name>.<key>` maps.
pub mod config;

/// WebSocket transport.
///
/// Wraps a tokio-tungstenite socket split into read and write halves, requests the
/// sub-protocol of the connection and sends extra handshake headers.
pub mod connection;

/// Service discovery documents and endpoint selection by data format and location.
pub mod discovery;

/// Error handling module for the library.
///
/// Defines `StreamingError`, covering:
/// - Configuration and endpoint resolution errors
/// - Token endpoint and login rejections
/// - HTTP and WebSocket transport failures
/// - Serialization failures and protocol violations
/// - Registry misuse, timeouts and closed objects
pub mod error;

/// Session event codes and the session, connection, stream and failover states.
pub mod events;

/// Serializable OMM and RDP wire frames.
pub mod messages;

/// Protocol specific frame building and classification of inbound frames.
pub mod protocol;

/// Endpoint rotation and back-off delays used when reconnecting.
pub mod reconnect;

/// Subscription registry of a session and the process wide session registry.
pub mod registry;

/// Resolution of connection names into candidate WebSocket endpoints.
pub mod resolver;

/// The `Session` façade.
///
/// A session authorizes, starts one streaming connection per connection name on
/// demand, forwards new tokens to its connections and reports events.
pub mod session;

/// Streams, listeners and their callbacks.
pub mod stream;

/// Streaming connection task: login, frame dispatch, heartbeat and reconnection.
pub mod stream_connection;

/// Access tokens and the background token provider.
pub mod token;

pub use config::{
    ConnectionConfig, DacsParams, EndpointSource, HeartbeatConfig, Protocol, ReconnectConfig,
    SessionConfig,
};
pub use discovery::DiscoveryVersion;
pub use error::{StreamingError, StreamingResult};
pub use events::{ConnectionState, EventCode, FailoverState, SessionEvent, SessionState, StreamState};
pub use registry::SessionRegistry;
pub use session::{Session, SessionBuilder};
pub use stream::{OmmListener, RdpListener, Stream, StreamListener};
pub use token::{Grant, TokenInfo};
