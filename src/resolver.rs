/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 19/10/26
******************************************************************************/

use crate::config::{ConnectionConfig, EndpointSource, Protocol};
use crate::discovery::DiscoveryDocument;
use crate::error::{StreamingError, StreamingResult};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};
use url::Url;

/// Candidate endpoints of one named connection, in the order they are tried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEndpoints {
    pub uris: Vec<String>,
    pub protocol: Protocol,
    pub sub_protocol: &'static str,
    pub secure: bool,
    pub headers: Vec<(String, String)>,
}

/// Turns connection names into endpoint lists and keeps them for the session lifetime.
pub struct ConnectionResolver {
    http: reqwest::Client,
    platform_url: String,
    app_key: String,
    configs: HashMap<String, ConnectionConfig>,
    cache: Mutex<HashMap<String, Arc<ResolvedEndpoints>>>,
}

impl ConnectionResolver {
    pub fn new(
        http: reqwest::Client,
        platform_url: impl Into<String>,
        app_key: impl Into<String>,
        configs: HashMap<String, ConnectionConfig>,
    ) -> Self {
        Self {
            http,
            platform_url: platform_url.into(),
            app_key: app_key.into(),
            configs,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self, name: &str) -> StreamingResult<&ConnectionConfig> {
        self.configs.get(name).ok_or_else(|| {
            StreamingError::Config(format!("no configuration for connection '{}'", name))
        })
    }

    /// Resolves `name`, calling the discovery endpoint at most once per name.
    ///
    /// `token` is sent as a bearer token on discovery requests.
    ///
    /// # Errors
    ///
    /// * `StreamingError::Config` for an unknown name or an invalid discovery URL.
    /// * `StreamingError::Discovery` when the discovery endpoint does not answer 200.
    /// * `StreamingError::Resolution` when no endpoint is left after filtering.
    pub async fn resolve(
        &self,
        name: &str,
        token: Option<&str>,
    ) -> StreamingResult<Arc<ResolvedEndpoints>> {
        if let Some(cached) = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Ok(cached.clone());
        }

        let config = self.config(name)?;
        let scheme = if config.secure { "wss" } else { "ws" };
        let uris: Vec<String> = match &config.source {
            EndpointSource::Static { authorities } => authorities
                .iter()
                .map(|authority| format!("{}://{}/WebSocket", scheme, authority))
                .collect(),
            EndpointSource::Legacy { url } => vec![url.clone()],
            EndpointSource::Discovery {
                url,
                platform_url,
                version,
                locations,
            } => {
                let discovery_url =
                    self.discovery_url(url, platform_url.as_deref().unwrap_or(&self.platform_url))?;
                let body = self.fetch(&discovery_url, token).await?;
                DiscoveryDocument::parse(&body, *version)?
                    .websocket_authorities(&config.data_format, locations)?
                    .into_iter()
                    .map(|authority| format!("{}://{}/WebSocket", scheme, authority))
                    .collect()
            }
        };

        if uris.is_empty() {
            return Err(StreamingError::Resolution(format!(
                "connection '{}' has no endpoint",
                name
            )));
        }
        info!("Connection '{}' resolved to {:?}", name, uris);

        let resolved = Arc::new(ResolvedEndpoints {
            uris,
            protocol: config.protocol,
            sub_protocol: config.protocol.sub_protocol(),
            secure: config.secure,
            headers: config.headers.clone(),
        });
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), resolved.clone());
        Ok(resolved)
    }

    /// Forgets the cached endpoints of `name`; the next resolve asks discovery again.
    pub fn invalidate(&self, name: &str) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }

    fn discovery_url(&self, url: &str, platform_url: &str) -> StreamingResult<Url> {
        match Url::parse(url) {
            Ok(absolute) => Ok(absolute),
            Err(url::ParseError::RelativeUrlWithoutBase) => Ok(Url::parse(platform_url)?.join(url)?),
            Err(e) => Err(e.into()),
        }
    }

    async fn fetch(&self, url: &Url, token: Option<&str>) -> StreamingResult<Value> {
        debug!("Requesting service discovery from {}", url);
        let mut request = self
            .http
            .get(url.clone())
            .header("x-tr-applicationid", &self.app_key);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(StreamingError::Discovery {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<Value>().await?)
    }
}
