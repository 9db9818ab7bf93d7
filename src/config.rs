/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 19/10/26
******************************************************************************/

use crate::discovery::DiscoveryVersion;
use crate::error::{StreamingError, StreamingResult};
use crate::token::Grant;
use std::collections::HashMap;
use std::fmt;
use std::net::ToSocketAddrs;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_PLATFORM_URL: &str = "https://api.refinitiv.com";
pub const DEFAULT_TOKEN_PATH: &str = "/auth/oauth2/v1/token";
pub const DEFAULT_SCOPE: &str = "trapi";

/// Wire protocol spoken over a streaming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Open Message Model (`ID` / `Domain` / `Key` frames).
    Omm,
    /// Data platform streaming (`streamID` / `method` frames).
    Rdp,
}

impl Protocol {
    /// WebSocket sub-protocol requested during the handshake.
    pub fn sub_protocol(&self) -> &'static str {
        match self {
            Protocol::Omm => "tr_json2",
            Protocol::Rdp => "rdp_streaming",
        }
    }

    /// Data format advertised by discovery for this protocol.
    pub fn default_data_format(&self) -> &'static str {
        match self {
            Protocol::Omm => "tr_json2",
            Protocol::Rdp => "rdp_streaming",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Protocol::Omm => write!(f, "OMM"),
            Protocol::Rdp => write!(f, "RDP"),
        }
    }
}

impl FromStr for Protocol {
    type Err = StreamingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "OMM" => Ok(Protocol::Omm),
            "RDP" => Ok(Protocol::Rdp),
            other => Err(StreamingError::Config(format!(
                "unknown streaming protocol '{}'",
                other
            ))),
        }
    }
}

/// Position reported when the local address cannot be determined.
pub const FALLBACK_POSITION: &str = "127.0.0.1/net";

/// Login parameters for deployed (on-premise) distribution systems.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DacsParams {
    pub username: String,
    pub application_id: String,
    pub position: String,
}

impl DacsParams {
    pub fn new(
        username: impl Into<String>,
        application_id: impl Into<String>,
        position: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            application_id: application_id.into(),
            position: position.into(),
        }
    }

    /// `<ip>/<hostname>` of the local machine, or [`FALLBACK_POSITION`] when it cannot
    /// be determined. Resolves the host name, so it blocks.
    pub fn local_position() -> String {
        let Ok(host) = hostname::get() else {
            return FALLBACK_POSITION.to_string();
        };
        let host = host.to_string_lossy().to_string();
        let address = (host.as_str(), 0)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.find(|addr| addr.is_ipv4()));
        match address {
            Some(addr) => format!("{}/{}", addr.ip(), host),
            None => FALLBACK_POSITION.to_string(),
        }
    }
}

impl Default for DacsParams {
    fn default() -> Self {
        Self {
            username: "user".to_string(),
            application_id: "256".to_string(),
            position: Self::local_position(),
        }
    }
}

/// Where the candidate WebSocket endpoints of a connection come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointSource {
    /// Fixed `host:port` authorities, tried in order.
    Static { authorities: Vec<String> },
    /// Endpoints listed by the service discovery endpoint.
    Discovery {
        /// Absolute URL or a path relative to the platform URL.
        url: String,
        /// Overrides the session platform URL for this connection.
        platform_url: Option<String>,
        version: DiscoveryVersion,
        /// Preferred location tags, empty for no preference.
        locations: Vec<String>,
    },
    /// A complete WebSocket URL used verbatim.
    Legacy { url: String },
}

/// Static description of one named streaming connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub source: EndpointSource,
    pub protocol: Protocol,
    pub data_format: String,
    pub secure: bool,
    /// Extra headers sent with the WebSocket handshake.
    pub headers: Vec<(String, String)>,
    /// Present for deployed connections, which log in with DACS parameters.
    pub dacs: Option<DacsParams>,
}

impl ConnectionConfig {
    pub fn static_endpoints<I, S>(protocol: Protocol, authorities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_source(
            protocol,
            EndpointSource::Static {
                authorities: authorities.into_iter().map(Into::into).collect(),
            },
            false,
        )
    }

    pub fn discovery(protocol: Protocol, url: impl Into<String>) -> Self {
        Self::with_source(
            protocol,
            EndpointSource::Discovery {
                url: url.into(),
                platform_url: None,
                version: DiscoveryVersion::V1,
                locations: Vec::new(),
            },
            true,
        )
    }

    pub fn legacy(protocol: Protocol, url: impl Into<String>) -> Self {
        let url = url.into();
        let secure = url.starts_with("wss://");
        Self::with_source(protocol, EndpointSource::Legacy { url }, secure)
    }

    fn with_source(protocol: Protocol, source: EndpointSource, secure: bool) -> Self {
        Self {
            source,
            protocol,
            data_format: protocol.default_data_format().to_string(),
            secure,
            headers: Vec::new(),
            dacs: None,
        }
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn with_data_format(mut self, data_format: impl Into<String>) -> Self {
        self.data_format = data_format.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_dacs(mut self, dacs: DacsParams) -> Self {
        self.dacs = Some(dacs);
        self
    }

    /// Sets the preferred locations of a discovery connection. Ignored for other sources.
    pub fn with_locations<I, S>(mut self, wanted: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let EndpointSource::Discovery { locations, .. } = &mut self.source {
            *locations = wanted.into_iter().map(Into::into).collect();
        }
        self
    }

    /// Sets the discovery document version. Ignored for other sources.
    pub fn with_discovery_version(mut self, wanted: DiscoveryVersion) -> Self {
        if let EndpointSource::Discovery { version, .. } = &mut self.source {
            *version = wanted;
        }
        self
    }

    /// Builds a connection configuration from flat `<name>.<key>` entries.
    ///
    /// Recognised keys: `type` (`service-discovery`, `ads-websocket` or `legacy`),
    /// `protocol`, `format`, `secure`, `base-url`, `platform-url`, `version`,
    /// `locations`, `websocket-url`, `url`, `dacs_username`, `dacs_application_id`
    /// and `dacs_position`.
    ///
    /// # Errors
    ///
    /// Returns `StreamingError::Config` when the type is missing or unknown, when a
    /// key required by the type is absent, or when a value cannot be parsed.
    pub fn from_key_map(name: &str, map: &HashMap<String, String>) -> StreamingResult<Self> {
        let get = |key: &str| map.get(&format!("{}.{}", name, key)).map(|v| v.trim());
        let require = |key: &str| {
            get(key).filter(|v| !v.is_empty()).ok_or_else(|| {
                StreamingError::Config(format!("missing configuration key '{}.{}'", name, key))
            })
        };
        let split = |value: &str| -> Vec<String> {
            value
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .collect()
        };

        let protocol = match get("protocol") {
            Some(value) => value.parse()?,
            None => Protocol::Omm,
        };

        let mut config = match require("type")? {
            "service-discovery" => {
                let version = match get("version") {
                    Some(value) => value.parse()?,
                    None => DiscoveryVersion::V1,
                };
                let mut config = ConnectionConfig::discovery(protocol, require("base-url")?)
                    .with_discovery_version(version)
                    .with_locations(get("locations").map(split).unwrap_or_default());
                if let EndpointSource::Discovery { platform_url, .. } = &mut config.source {
                    *platform_url = get("platform-url").map(str::to_string);
                }
                config
            }
            "ads-websocket" => {
                let authorities = split(require("websocket-url")?);
                let defaults = DacsParams::default();
                let dacs = DacsParams {
                    username: get("dacs_username")
                        .map(str::to_string)
                        .unwrap_or(defaults.username),
                    application_id: get("dacs_application_id")
                        .map(str::to_string)
                        .unwrap_or(defaults.application_id),
                    position: get("dacs_position")
                        .map(str::to_string)
                        .unwrap_or(defaults.position),
                };
                ConnectionConfig::static_endpoints(protocol, authorities).with_dacs(dacs)
            }
            "legacy" => ConnectionConfig::legacy(protocol, require("url")?),
            other => {
                return Err(StreamingError::Config(format!(
                    "unknown connection type '{}' for '{}'",
                    other, name
                )));
            }
        };

        if let Some(format) = get("format") {
            config.data_format = format.to_string();
        }
        if let Some(secure) = get("secure") {
            config.secure = secure.parse().map_err(|_| {
                StreamingError::Config(format!("invalid boolean '{}' for '{}.secure'", secure, name))
            })?;
        }
        Ok(config)
    }
}

/// Reconnection policy of a streaming connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    pub enabled: bool,
    /// Step added to the back-off delay after each full rotation through the endpoints.
    pub base_delay: Duration,
    /// Number of full rotations attempted before giving up.
    pub max_retry_rotations: u32,
    /// Pause between two socket loop iterations.
    pub loop_pause: Duration,
    /// Never stop retrying.
    pub unbounded: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay: Duration::from_secs(5),
            max_retry_rotations: 5,
            loop_pause: Duration::from_secs(3),
            unbounded: false,
        }
    }
}

/// Client initiated liveness checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    /// Silence after which a ping is sent.
    pub idle_timeout: Duration,
    /// How long to wait for traffic after a ping. Replaced by the server `PingTimeout` on login.
    pub ping_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_timeout: Duration::from_secs(15),
            ping_timeout: Duration::from_secs(60),
        }
    }
}

/// Everything a [`Session`](crate::session::Session) needs to authenticate and connect.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Application key, sent as `client_id` and `x-tr-applicationid`.
    pub app_key: String,
    pub grant: Option<Grant>,
    /// Fixed access token for sessions without a grant.
    pub access_token: Option<String>,
    pub platform_url: String,
    pub token_url: String,
    pub server_mode: bool,
    pub take_exclusive_sign_on_control: bool,
    pub connections: HashMap<String, ConnectionConfig>,
    pub reconnect: ReconnectConfig,
    pub heartbeat: HeartbeatConfig,
    pub auth_timeout: Duration,
    pub http_timeout: Duration,
    pub stream_open_timeout: Duration,
    pub close_timeout: Duration,
    pub token_refresh_tick: Duration,
    pub token_retry_delay: Duration,
    pub max_login_retries: u32,
}

impl SessionConfig {
    pub fn new(app_key: impl Into<String>) -> Self {
        Self {
            app_key: app_key.into(),
            grant: None,
            access_token: None,
            platform_url: DEFAULT_PLATFORM_URL.to_string(),
            token_url: format!("{}{}", DEFAULT_PLATFORM_URL, DEFAULT_TOKEN_PATH),
            server_mode: false,
            take_exclusive_sign_on_control: true,
            connections: HashMap::new(),
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            auth_timeout: Duration::from_secs(5),
            http_timeout: Duration::from_secs(20),
            stream_open_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
            token_refresh_tick: Duration::from_secs(1),
            token_retry_delay: Duration::from_secs(1),
            max_login_retries: 3,
        }
    }

    pub fn with_grant(mut self, grant: Grant) -> Self {
        self.grant = Some(grant);
        self
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Sets the platform URL and derives the default token endpoint from it.
    pub fn with_platform_url(mut self, url: impl Into<String>) -> Self {
        let url = url.into().trim_end_matches('/').to_string();
        self.token_url = format!("{}{}", url, DEFAULT_TOKEN_PATH);
        self.platform_url = url;
        self
    }

    pub fn with_token_url(mut self, url: impl Into<String>) -> Self {
        self.token_url = url.into();
        self
    }

    pub fn with_server_mode(mut self, server_mode: bool) -> Self {
        self.server_mode = server_mode;
        self
    }

    pub fn with_connection(mut self, name: impl Into<String>, config: ConnectionConfig) -> Self {
        self.connections.insert(name.into(), config);
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_stream_open_timeout(mut self, timeout: Duration) -> Self {
        self.stream_open_timeout = timeout;
        self
    }

    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    /// Poll period and retry delay of the token refresh loop.
    pub fn with_token_timing(mut self, tick: Duration, retry_delay: Duration) -> Self {
        self.token_refresh_tick = tick;
        self.token_retry_delay = retry_delay;
        self
    }

    pub fn with_max_login_retries(mut self, retries: u32) -> Self {
        self.max_login_retries = retries;
        self
    }

    pub fn connection(&self, name: &str) -> StreamingResult<&ConnectionConfig> {
        self.connections
            .get(name)
            .ok_or_else(|| StreamingError::Config(format!("unknown connection name '{}'", name)))
    }
}
