// Mock token and service discovery endpoints used by the integration tests
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use warp::Filter;
use warp::http::StatusCode;

/// Token endpoint handing out `token-1`, `token-2`, ... for every accepted request.
pub struct MockTokenServer {
    pub address: SocketAddr,
    /// Forms received, in order.
    pub requests: Arc<Mutex<Vec<HashMap<String, String>>>>,
    /// Status answered to every request; 200 issues a token.
    pub status: Arc<AtomicU16>,
    /// Lifetime advertised in `expires_in`, in seconds.
    pub expires_in: Arc<AtomicU64>,
    issued: Arc<AtomicUsize>,
}

impl MockTokenServer {
    pub fn new() -> Self {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let status = Arc::new(AtomicU16::new(200));
        let expires_in = Arc::new(AtomicU64::new(600));
        let issued = Arc::new(AtomicUsize::new(0));

        let (recorded, answer_status, lifetime, counter) = (
            requests.clone(),
            status.clone(),
            expires_in.clone(),
            issued.clone(),
        );
        let route = warp::post()
            .and(warp::path!("auth" / "oauth2" / "v1" / "token"))
            .and(warp::body::form::<HashMap<String, String>>())
            .map(move |form: HashMap<String, String>| {
                recorded.lock().unwrap().push(form);
                let code = answer_status.load(Ordering::SeqCst);
                if code != 200 {
                    let body = json!({
                        "error": "invalid_grant",
                        "error_description": "Invalid username or password."
                    });
                    let status =
                        StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                    return warp::reply::with_status(warp::reply::json(&body), status);
                }
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                let body = json!({
                    "access_token": format!("token-{}", n),
                    "refresh_token": format!("refresh-{}", n),
                    "expires_in": lifetime.load(Ordering::SeqCst).to_string(),
                    "scope": "trapi",
                    "token_type": "Bearer"
                });
                warp::reply::with_status(warp::reply::json(&body), StatusCode::OK)
            });
        let (address, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        Self {
            address,
            requests,
            status,
            expires_in,
            issued,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.address)
    }

    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }

    /// Number of requests made with `grant_type`.
    pub fn count(&self, grant_type: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|form| form.get("grant_type").map(String::as_str) == Some(grant_type))
            .count()
    }
}

/// Discovery endpoint at `/streaming/pricing/v1/` listing the given authorities.
pub struct MockDiscoveryServer {
    pub address: SocketAddr,
    pub authorizations: Arc<Mutex<Vec<String>>>,
}

impl MockDiscoveryServer {
    pub fn new(authorities: Vec<String>) -> Self {
        let authorizations = Arc::new(Mutex::new(Vec::new()));
        let recorded = authorizations.clone();
        let services: Vec<Value> = authorities
            .iter()
            .map(|authority| {
                let (host, port) = authority.rsplit_once(':').unwrap();
                json!({
                    "dataFormat": ["tr_json2"],
                    "endpoint": host,
                    "location": ["us-east-1a"],
                    "port": port.parse::<u16>().unwrap(),
                    "provider": "aws",
                    "transport": "websocket"
                })
            })
            .collect();
        let body = json!({ "services": services });

        let route = warp::get()
            .and(warp::path!("streaming" / "pricing" / "v1"))
            .and(warp::header::optional::<String>("authorization"))
            .map(move |authorization: Option<String>| {
                recorded
                    .lock()
                    .unwrap()
                    .push(authorization.unwrap_or_default());
                warp::reply::json(&body)
            });
        let (address, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);

        Self {
            address,
            authorizations,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.address)
    }
}
