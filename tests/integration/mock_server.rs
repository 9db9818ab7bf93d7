// Mock OMM / RDP streaming server used by the integration tests
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Omm,
    Rdp,
}

/// Handshake details of one accepted client.
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    pub sub_protocol: Option<String>,
    pub app_key: Option<String>,
}

struct Client {
    sender: mpsc::UnboundedSender<String>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct MockServer {
    pub address: SocketAddr,
    pub received_messages: Arc<Mutex<Vec<Value>>>,
    pub handshakes: Arc<Mutex<Vec<Handshake>>>,
    /// Logins still to be rejected before logins are accepted.
    pub reject_logins: Arc<AtomicU32>,
    /// Milliseconds to hold back each login reply.
    pub login_delay_ms: Arc<AtomicU64>,
    clients: Arc<Mutex<Vec<Client>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl MockServer {
    pub async fn new(flavor: Flavor) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind");
        let address = listener.local_addr().expect("Failed to get local address");

        let received_messages = Arc::new(Mutex::new(Vec::new()));
        let handshakes = Arc::new(Mutex::new(Vec::new()));
        let reject_logins = Arc::new(AtomicU32::new(0));
        let login_delay_ms = Arc::new(AtomicU64::new(0));
        let clients: Arc<Mutex<Vec<Client>>> = Arc::new(Mutex::new(Vec::new()));

        let received = received_messages.clone();
        let seen_handshakes = handshakes.clone();
        let rejects = reject_logins.clone();
        let delay = login_delay_ms.clone();
        let known_clients = clients.clone();

        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let record = seen_handshakes.clone();
                let callback = move |request: &Request,
                                     mut response: Response|
                      -> Result<Response, ErrorResponse> {
                    let header = |name: &str| {
                        request
                            .headers()
                            .get(name)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string)
                    };
                    record.lock().unwrap().push(Handshake {
                        sub_protocol: header("Sec-WebSocket-Protocol"),
                        app_key: header("x-tr-applicationid"),
                    });
                    if let Some(protocol) = request.headers().get("Sec-WebSocket-Protocol") {
                        response
                            .headers_mut()
                            .insert("Sec-WebSocket-Protocol", protocol.clone());
                    }
                    Ok(response)
                };
                let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
                    Ok(ws_stream) => ws_stream,
                    Err(e) => {
                        error!("Mock server handshake failed: {}", e);
                        continue;
                    }
                };
                let (mut write, mut read) = ws_stream.split();
                let (client_tx, mut client_rx) = mpsc::unbounded_channel::<String>();

                let writer = tokio::spawn(async move {
                    while let Some(text) = client_rx.recv().await {
                        if write.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                });

                let replies = client_tx.clone();
                let received = received.clone();
                let rejects = rejects.clone();
                let delay = delay.clone();
                let reader = tokio::spawn(async move {
                    while let Some(Ok(message)) = read.next().await {
                        let Message::Text(text) = message else {
                            continue;
                        };
                        let Ok(Value::Array(frames)) = serde_json::from_str::<Value>(text.as_str())
                        else {
                            continue;
                        };
                        for frame in frames {
                            debug!("Mock server received {}", frame);
                            received.lock().unwrap().push(frame.clone());
                            let answers = match flavor {
                                Flavor::Omm => omm_answers(&frame, &rejects),
                                Flavor::Rdp => rdp_answers(&frame, &rejects),
                            };
                            let held = delay.load(Ordering::SeqCst);
                            if held > 0 && is_login(&frame) {
                                let replies = replies.clone();
                                tokio::spawn(async move {
                                    tokio::time::sleep(Duration::from_millis(held)).await;
                                    for answer in answers {
                                        let _ = replies.send(json!([answer]).to_string());
                                    }
                                });
                                continue;
                            }
                            for answer in answers {
                                let _ = replies.send(json!([answer]).to_string());
                            }
                        }
                    }
                });

                known_clients.lock().unwrap().push(Client {
                    sender: client_tx,
                    tasks: vec![writer, reader],
                });
            }
        });

        Self {
            address,
            received_messages,
            handshakes,
            reject_logins,
            login_delay_ms,
            clients,
            accept_task: Mutex::new(Some(accept_task)),
        }
    }

    pub fn uri(&self) -> String {
        format!("ws://{}/WebSocket", self.address)
    }

    pub fn authority(&self) -> String {
        self.address.to_string()
    }

    /// Sends a raw frame array to every connected client.
    pub fn push(&self, frames: Value) {
        for client in self.clients.lock().unwrap().iter() {
            let _ = client.sender.send(frames.to_string());
        }
    }

    /// Drops every client socket without a closing handshake.
    pub fn kill_connections(&self) {
        for client in self.clients.lock().unwrap().drain(..) {
            for task in client.tasks {
                task.abort();
            }
        }
    }

    /// Stops accepting new clients; further connection attempts are refused.
    pub fn stop_accepting(&self) {
        if let Some(task) = self.accept_task.lock().unwrap().take() {
            task.abort();
        }
    }

    pub fn frames(&self) -> Vec<Value> {
        self.received_messages.lock().unwrap().clone()
    }

    /// Frames received that match `predicate`.
    pub fn frames_where<F: Fn(&Value) -> bool>(&self, predicate: F) -> Vec<Value> {
        self.frames().into_iter().filter(|f| predicate(f)).collect()
    }

    /// Polls until at least `count` received frames match `predicate`.
    pub async fn wait_for_frames<F: Fn(&Value) -> bool>(
        &self,
        count: usize,
        predicate: F,
        within: Duration,
    ) -> Vec<Value> {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            let frames = self.frames_where(&predicate);
            if frames.len() >= count || tokio::time::Instant::now() >= deadline {
                return frames;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.stop_accepting();
        self.kill_connections();
    }
}

fn take_reject(rejects: &AtomicU32) -> bool {
    rejects
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

pub fn is_omm_login(frame: &Value) -> bool {
    frame["Domain"] == "Login" && frame.get("Type").is_none()
}

fn is_login(frame: &Value) -> bool {
    is_omm_login(frame) || frame["method"] == "Auth"
}

pub fn is_omm_request(frame: &Value, name: &str) -> bool {
    frame.get("Type").is_none() && frame["Domain"] != "Login" && frame["Key"]["Name"] == name
}

fn omm_answers(frame: &Value, rejects: &AtomicU32) -> Vec<Value> {
    let id = frame["ID"].clone();
    match frame.get("Type").and_then(Value::as_str) {
        Some("Ping") => vec![json!({"Type": "Pong"})],
        Some(_) => Vec::new(),
        None if frame["Domain"] == "Login" => {
            if take_reject(rejects) {
                vec![json!({
                    "ID": id, "Type": "Status", "Domain": "Login",
                    "State": {"Stream": "Closed", "Data": "Suspect", "Text": "Login rejected"}
                })]
            } else {
                vec![json!({
                    "ID": id, "Type": "Refresh", "Domain": "Login",
                    "Key": {"Name": "user"},
                    "State": {"Stream": "Open", "Data": "Ok", "Text": "Login accepted"},
                    "Elements": {"PingTimeout": 30, "MaxMsgSize": 61426}
                })]
            }
        }
        None => {
            let name = frame["Key"]["Name"].clone();
            vec![
                json!({
                    "ID": id, "Type": "Refresh", "Key": {"Name": name},
                    "State": {"Stream": "Open", "Data": "Ok", "Text": "All is well"},
                    "Fields": {"BID": 1.0856, "ASK": 1.0857}
                }),
                json!({
                    "ID": id, "Type": "Update", "Key": {"Name": name},
                    "Fields": {"BID": 1.0858}
                }),
            ]
        }
    }
}

fn rdp_answers(frame: &Value, rejects: &AtomicU32) -> Vec<Value> {
    let stream_id = frame["streamID"].clone();
    match frame["method"].as_str() {
        Some("Auth") => {
            if take_reject(rejects) {
                vec![json!({
                    "streamID": stream_id, "type": "Error",
                    "state": {"code": 401, "text": "Unauthorized"}
                })]
            } else {
                vec![json!({
                    "streamID": stream_id, "type": "Ack",
                    "state": {"code": 200, "text": "Ok"}
                })]
            }
        }
        Some("Subscribe") => vec![
            json!({
                "streamID": stream_id, "type": "Response",
                "headers": [{"name": "price"}], "data": [[1.0]]
            }),
            json!({"streamID": stream_id, "type": "Update", "data": [[1.5]]}),
        ],
        _ => Vec::new(),
    }
}
