/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 19/10/26
******************************************************************************/

use crate::config::{DEFAULT_SCOPE, SessionConfig};
use crate::error::{StreamingError, StreamingResult};
use crate::events::EventCode;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

/// Credentials used to obtain access tokens.
#[derive(Clone, PartialEq, Eq)]
pub enum Grant {
    Password {
        username: String,
        password: String,
        scope: String,
    },
    RefreshToken {
        username: String,
        refresh_token: String,
    },
}

impl Grant {
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Grant::Password {
            username: username.into(),
            password: password.into(),
            scope: DEFAULT_SCOPE.to_string(),
        }
    }

    pub fn refresh_token(username: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Grant::RefreshToken {
            username: username.into(),
            refresh_token: refresh_token.into(),
        }
    }

    /// Overrides the scope of a password grant.
    pub fn with_scope(mut self, wanted: impl Into<String>) -> Self {
        if let Grant::Password { scope, .. } = &mut self {
            *scope = wanted.into();
        }
        self
    }

    pub fn username(&self) -> &str {
        match self {
            Grant::Password { username, .. } | Grant::RefreshToken { username, .. } => username,
        }
    }
}

impl fmt::Debug for Grant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Grant::Password {
                username, scope, ..
            } => f
                .debug_struct("Password")
                .field("username", username)
                .field("password", &"****")
                .field("scope", scope)
                .finish(),
            Grant::RefreshToken {
                username,
                refresh_token,
            } => f
                .debug_struct("RefreshToken")
                .field("username", username)
                .field("refresh_token", &mask_token(refresh_token))
                .finish(),
        }
    }
}

/// Keeps only the last four characters of a secret.
pub fn mask_token(token: &str) -> String {
    match token.char_indices().rev().nth(3) {
        Some((start, _)) if start > 0 => format!("****{}", &token[start..]),
        _ => "****".to_string(),
    }
}

/// An access token as issued by the token endpoint. Replaced, never mutated.
#[derive(Clone)]
pub struct TokenInfo {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<Duration>,
    pub scope: Option<String>,
    pub token_type: Option<String>,
    pub issued_at: Instant,
}

impl TokenInfo {
    /// A token that never expires, for sessions configured with a fixed token.
    pub fn fixed(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_in: None,
            scope: None,
            token_type: None,
            issued_at: Instant::now(),
        }
    }

    /// Refresh is due once half of the lifetime has elapsed.
    pub fn refresh_due(&self, now: Instant) -> bool {
        match self.expires_in {
            Some(lifetime) => now > self.issued_at + lifetime / 2,
            None => false,
        }
    }

    fn from_response(response: TokenResponse, issued_at: Instant) -> StreamingResult<Self> {
        let expires_in = match response.expires_in {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
            _ => None,
        }
        .map(Duration::from_secs);
        if response.access_token.is_empty() {
            return Err(StreamingError::Authentication {
                status: None,
                message: "token endpoint returned an empty access token".to_string(),
            });
        }
        Ok(Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            expires_in,
            scope: response.scope,
            token_type: response.token_type,
            issued_at,
        })
    }
}

impl fmt::Debug for TokenInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenInfo")
            .field("access_token", &mask_token(&self.access_token))
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<Value>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Progress of authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStatus {
    Pending,
    Ready,
    Failed {
        status: Option<u16>,
        message: String,
    },
}

/// Receives session level notifications from the provider.
pub type TokenEventHook = Arc<dyn Fn(EventCode, String) + Send + Sync>;

struct ProviderInner {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    grant: Grant,
    server_mode: bool,
    take_exclusive_sign_on_control: bool,
    tick: Duration,
    retry_delay: Duration,
    token_tx: watch::Sender<Option<Arc<TokenInfo>>>,
    status_tx: watch::Sender<AuthStatus>,
    refresh_requested: Notify,
    event_hook: Mutex<Option<TokenEventHook>>,
}

/// Obtains an access token and keeps it fresh from a background task.
///
/// New tokens are published on a watch channel; see [`TokenProvider::subscribe`].
pub struct TokenProvider {
    inner: Arc<ProviderInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TokenProvider {
    /// # Errors
    ///
    /// `StreamingError::Config` when the configuration carries no grant.
    pub fn new(config: &SessionConfig, client: reqwest::Client) -> StreamingResult<Self> {
        let grant = config.grant.clone().ok_or_else(|| {
            StreamingError::Config("a grant is required to request access tokens".to_string())
        })?;
        let (token_tx, _) = watch::channel(None);
        let (status_tx, _) = watch::channel(AuthStatus::Pending);
        Ok(Self {
            inner: Arc::new(ProviderInner {
                client,
                token_url: config.token_url.clone(),
                client_id: config.app_key.clone(),
                grant,
                server_mode: config.server_mode,
                take_exclusive_sign_on_control: config.take_exclusive_sign_on_control,
                tick: config.token_refresh_tick,
                retry_delay: config.token_retry_delay,
                token_tx,
                status_tx,
                refresh_requested: Notify::new(),
                event_hook: Mutex::new(None),
            }),
            task: Mutex::new(None),
        })
    }

    pub fn set_event_hook(&self, hook: TokenEventHook) {
        *self
            .inner
            .event_hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    /// Starts the refresh task if needed and waits up to `wait` for the first token.
    ///
    /// When the task is already running and holds a token, a refresh is scheduled and
    /// the current token is returned immediately.
    ///
    /// # Errors
    ///
    /// * `StreamingError::Authentication` if the token endpoint rejected the grant.
    /// * `StreamingError::Timeout` if no token arrived in time.
    pub async fn authorize(&self, wait: Duration) -> StreamingResult<Arc<TokenInfo>> {
        let mut status = self.inner.status_tx.subscribe();
        {
            let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
            let running = task.as_ref().is_some_and(|handle| !handle.is_finished());
            if running {
                if let Some(token) = self.current() {
                    self.request_new_token();
                    return Ok(token);
                }
            } else {
                debug!("Starting token refresh task for {}", self.inner.token_url);
                self.inner.status_tx.send_replace(AuthStatus::Pending);
                *task = Some(tokio::spawn(run(self.inner.clone())));
            }
        }

        let outcome = match timeout(wait, status.wait_for(|s| *s != AuthStatus::Pending)).await {
            Err(_) => {
                return Err(StreamingError::Timeout(format!(
                    "no access token received within {:?}",
                    wait
                )));
            }
            Ok(Err(_)) => {
                return Err(StreamingError::Closed("token provider stopped".to_string()));
            }
            Ok(Ok(state)) => state.clone(),
        };

        match outcome {
            AuthStatus::Ready => self.current().ok_or_else(|| {
                StreamingError::Closed("token provider holds no token".to_string())
            }),
            AuthStatus::Failed { status, message } => {
                Err(StreamingError::Authentication { status, message })
            }
            AuthStatus::Pending => Err(StreamingError::Timeout(
                "authorization still pending".to_string(),
            )),
        }
    }

    /// Asks the background task for a new token as soon as possible.
    pub fn request_new_token(&self) {
        self.inner.refresh_requested.notify_one();
    }

    pub fn current(&self) -> Option<Arc<TokenInfo>> {
        self.inner.token_tx.borrow().clone()
    }

    pub fn status(&self) -> AuthStatus {
        self.inner.status_tx.borrow().clone()
    }

    /// Receiver notified every time a new token is committed.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<TokenInfo>>> {
        self.inner.token_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stops the refresh task. The last token stays readable.
    pub fn stop(&self) {
        if let Some(handle) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
            debug!("Token refresh task stopped");
        }
    }
}

impl Drop for TokenProvider {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(inner: Arc<ProviderInner>) {
    match inner.request_by_grant().await {
        Ok(token) => inner.publish(token, "Successfully authorized"),
        Err(e) => {
            inner.fail(e);
            return;
        }
    }

    loop {
        let requested = tokio::select! {
            _ = inner.refresh_requested.notified() => true,
            _ = sleep(inner.tick) => false,
        };
        let due = inner
            .token_tx
            .borrow()
            .as_ref()
            .is_none_or(|token| token.refresh_due(Instant::now()));
        if !requested && !due {
            continue;
        }

        match inner.refresh().await {
            Ok(token) => inner.publish(token, "Access token refreshed"),
            Err(e) => {
                inner.fail(e);
                break;
            }
        }
    }
}

impl ProviderInner {
    fn notify(&self, code: EventCode, message: String) {
        let hook = self
            .event_hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            hook(code, message);
        }
    }

    fn publish(&self, token: TokenInfo, message: &str) {
        info!(
            "{} (token {}, expires in {:?})",
            message,
            mask_token(&token.access_token),
            token.expires_in
        );
        self.token_tx.send_replace(Some(Arc::new(token)));
        self.status_tx.send_replace(AuthStatus::Ready);
        self.notify(EventCode::SessionAuthenticationSuccess, message.to_string());
    }

    fn fail(&self, e: StreamingError) {
        error!("Authorization failed: {}", e);
        let failed = match &e {
            StreamingError::Authentication { status, message } => AuthStatus::Failed {
                status: *status,
                message: message.clone(),
            },
            other => AuthStatus::Failed {
                status: None,
                message: other.to_string(),
            },
        };
        self.status_tx.send_replace(failed);
        self.notify(EventCode::SessionAuthenticationFailed, e.to_string());
    }

    async fn request_by_grant(&self) -> StreamingResult<TokenInfo> {
        match &self.grant {
            Grant::Password { .. } => self.request_password().await,
            Grant::RefreshToken { refresh_token, .. } => self.request_refresh(refresh_token).await,
        }
    }

    /// Refresh with retries on network failures and, in server mode, a password fallback.
    async fn refresh(&self) -> StreamingResult<TokenInfo> {
        loop {
            let refresh_token = self
                .token_tx
                .borrow()
                .as_ref()
                .and_then(|token| token.refresh_token.clone());
            let attempt = match refresh_token {
                Some(refresh_token) => self.request_refresh(&refresh_token).await,
                None => self.request_by_grant().await,
            };

            match attempt {
                Ok(token) => return Ok(token),
                Err(e) if e.is_network() => {
                    warn!("Token refresh failed, retrying: {}", e);
                    sleep(self.retry_delay).await;
                }
                Err(e) => {
                    if self.server_mode && matches!(self.grant, Grant::Password { .. }) {
                        warn!("Token refresh rejected ({}), authenticating again by password", e);
                        return self.reauthorize_by_password().await;
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn reauthorize_by_password(&self) -> StreamingResult<TokenInfo> {
        loop {
            sleep(self.retry_delay).await;
            match self.request_password().await {
                Ok(token) => return Ok(token),
                Err(e) if e.is_client_rejection() => return Err(e),
                Err(e) => warn!("Password authentication failed, retrying: {}", e),
            }
        }
    }

    async fn request_password(&self) -> StreamingResult<TokenInfo> {
        let Grant::Password {
            username,
            password,
            scope,
        } = &self.grant
        else {
            return Err(StreamingError::Config(
                "password authentication requires a password grant".to_string(),
            ));
        };
        debug!("Requesting access token by password for {}", username);
        let form = [
            ("grant_type", "password".to_string()),
            ("client_id", self.client_id.clone()),
            ("username", username.clone()),
            ("password", password.clone()),
            ("scope", scope.clone()),
            (
                "takeExclusiveSignOnControl",
                self.take_exclusive_sign_on_control.to_string(),
            ),
        ];
        self.request_token(&form).await
    }

    async fn request_refresh(&self, refresh_token: &str) -> StreamingResult<TokenInfo> {
        debug!(
            "Requesting access token with refresh token {}",
            mask_token(refresh_token)
        );
        let form = [
            ("grant_type", "refresh_token".to_string()),
            ("client_id", self.client_id.clone()),
            ("username", self.grant.username().to_string()),
            ("refresh_token", refresh_token.to_string()),
            (
                "takeExclusiveSignOnControl",
                self.take_exclusive_sign_on_control.to_string(),
            ),
        ];
        self.request_token(&form).await
    }

    async fn request_token(&self, form: &[(&str, String)]) -> StreamingResult<TokenInfo> {
        let issued_at = Instant::now();
        let response = self
            .client
            .post(&self.token_url)
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            let parsed: TokenResponse = serde_json::from_str(&body)?;
            return TokenInfo::from_response(parsed, issued_at);
        }

        let message = match serde_json::from_str::<TokenErrorResponse>(&body) {
            Ok(TokenErrorResponse {
                error,
                error_description: Some(description),
            }) => format!("{}: {}", error, description),
            Ok(TokenErrorResponse { error, .. }) => error,
            Err(_) => body,
        };
        warn!("Token endpoint answered {}: {}", status.as_u16(), message);
        Err(StreamingError::Authentication {
            status: Some(status.as_u16()),
            message,
        })
    }
}
