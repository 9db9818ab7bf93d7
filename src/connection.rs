/******************************************************************************
   Author: Joaquín Béjar García
   Email: jb@taunais.com
   Date: 19/10/26
******************************************************************************/

use super::error::{StreamingError, StreamingResult};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error};

type WsSink = futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// A message read from the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    Text(String),
    /// Control ping; tungstenite answers it with a pong on its own.
    Ping,
    Pong,
    Binary(usize),
    /// The peer closed the connection or the stream ended.
    Closed(Option<String>),
}

/// Represents a WebSocket connection.
///
/// The read and write halves sit behind separate `Arc<Mutex>` so a writer can send
/// while the receive loop waits for the next message.
#[derive(Debug, Clone)]
pub struct WebSocketConnection {
    write: Arc<Mutex<WsSink>>,
    read: Arc<Mutex<WsSource>>,
    sub_protocol: Option<String>,
}

impl WebSocketConnection {
    /// Establishes a WebSocket connection to `url`.
    ///
    /// # Arguments
    ///
    /// * `url`: WebSocket URL, `ws://` or `wss://`.
    /// * `sub_protocol`: value of the `Sec-WebSocket-Protocol` request header, if any.
    /// * `headers`: additional handshake headers.
    ///
    /// # Returns
    ///
    /// The connected socket, or `StreamingError::Connection` when the request cannot be
    /// built or the handshake fails.
    ///
    pub async fn connect(
        url: &str,
        sub_protocol: Option<&str>,
        headers: &[(String, String)],
    ) -> StreamingResult<Self> {
        debug!("Connecting to WebSocket at: {}", url);

        let mut request = url
            .into_client_request()
            .map_err(|e| StreamingError::Connection(format!("Invalid URL {}: {}", url, e)))?;
        let request_headers = request.headers_mut();
        if let Some(protocol) = sub_protocol {
            let value = HeaderValue::from_str(protocol).map_err(|e| {
                StreamingError::Connection(format!("Invalid sub-protocol {}: {}", protocol, e))
            })?;
            request_headers.insert("Sec-WebSocket-Protocol", value);
        }
        for (name, value) in headers {
            let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                StreamingError::Connection(format!("Invalid header name {}: {}", name, e))
            })?;
            let header_value = HeaderValue::from_str(value).map_err(|e| {
                StreamingError::Connection(format!("Invalid value for header {}: {}", name, e))
            })?;
            request_headers.insert(header_name, header_value);
        }

        let (ws_stream, response) = connect_async(request)
            .await
            .map_err(|e| StreamingError::Connection(format!("Failed to connect: {}", e)))?;

        let negotiated = response
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        debug!(
            "WebSocket connection established (sub-protocol {:?})",
            negotiated
        );

        let (write, read) = ws_stream.split();

        Ok(Self {
            write: Arc::new(Mutex::new(write)),
            read: Arc::new(Mutex::new(read)),
            sub_protocol: negotiated,
        })
    }

    /// Sub-protocol accepted by the server.
    pub fn sub_protocol(&self) -> Option<&str> {
        self.sub_protocol.as_deref()
    }

    /// Serializes `message` to JSON and sends it as a text message.
    pub async fn send<T: Serialize>(&self, message: &T) -> StreamingResult<()> {
        let json = serde_json::to_string(message)?;
        self.send_text(json).await
    }

    pub async fn send_text(&self, text: String) -> StreamingResult<()> {
        debug!("Sending message: {}", text);
        let mut write = self.write.lock().await;
        write.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Sends a WebSocket control ping.
    pub async fn ping(&self) -> StreamingResult<()> {
        let mut write = self.write.lock().await;
        write.send(Message::Ping(Vec::new().into())).await?;
        Ok(())
    }

    /// Receives the next message.
    ///
    /// # Returns
    ///
    /// * `Ok(WsMessage)`: the next message; `WsMessage::Closed` once the peer closed.
    /// * `Err(StreamingError::WebSocket)`: a transport error.
    ///
    pub async fn receive(&self) -> StreamingResult<WsMessage> {
        let mut read = self.read.lock().await;

        match read.next().await {
            Some(Ok(Message::Text(text))) => {
                debug!("Received message: {}", text);
                Ok(WsMessage::Text(text.to_string()))
            }
            Some(Ok(Message::Ping(_))) => Ok(WsMessage::Ping),
            Some(Ok(Message::Pong(_))) => Ok(WsMessage::Pong),
            Some(Ok(Message::Binary(data))) => Ok(WsMessage::Binary(data.len())),
            Some(Ok(Message::Close(frame))) => {
                debug!("WebSocket closed by peer: {:?}", frame);
                Ok(WsMessage::Closed(frame.map(|f| f.reason.to_string())))
            }
            Some(Ok(Message::Frame(_))) => Ok(WsMessage::Binary(0)),
            Some(Err(e)) => {
                error!("WebSocket error: {}", e);
                Err(StreamingError::WebSocket(Box::new(e)))
            }
            None => {
                debug!("WebSocket stream ended");
                Ok(WsMessage::Closed(None))
            }
        }
    }

    /// Like [`receive`](WebSocketConnection::receive), but returns `Ok(None)` when
    /// nothing arrived within `duration`.
    pub async fn receive_with_timeout(
        &self,
        duration: Duration,
    ) -> StreamingResult<Option<WsMessage>> {
        match timeout(duration, self.receive()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Sends a close frame. Errors are ignored since the socket is going away.
    pub async fn close(&self) {
        let mut write = self.write.lock().await;
        if let Err(e) = write.close().await {
            debug!("Error while closing WebSocket: {}", e);
        }
    }
}
