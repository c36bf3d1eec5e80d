//! Outbound WebSocket helpers shared by shard agents and callers
//!
//! Connection metadata travels as upgrade request headers; every message is
//! one JSON text frame.

use crate::error::{ClusterError, Result};
use cluster_proto::{Route, RouteKey, SECRET_KEY_HEADER, SHARD_ID_HEADER, UUID_HEADER};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, Request};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::trace;

/// Client side of a broker connection
pub type BrokerStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Metadata presented when opening a connection
#[derive(Debug, Clone, Copy, Default)]
pub struct Handshake<'a> {
    pub secret_key: Option<&'a str>,
    pub shard_id: Option<&'a RouteKey>,
    pub uuid: Option<&'a str>,
}

impl<'a> Handshake<'a> {
    pub fn new(secret_key: Option<&'a str>) -> Self {
        Self {
            secret_key,
            ..Self::default()
        }
    }

    pub fn shard(mut self, shard_id: &'a RouteKey) -> Self {
        self.shard_id = Some(shard_id);
        self
    }

    pub fn uuid(mut self, uuid: &'a str) -> Self {
        self.uuid = Some(uuid);
        self
    }

    /// Upgrade request for `route` on the broker at `base_url`
    pub fn request(&self, base_url: &str, route: Route) -> Result<Request<()>> {
        let url = format!("{}{}", base_url.trim_end_matches('/'), route.path());
        let mut request = url.into_client_request()?;
        let headers = request.headers_mut();

        if let Some(secret_key) = self.secret_key {
            headers.insert(SECRET_KEY_HEADER, HeaderValue::from_str(secret_key)?);
        }
        if let Some(shard_id) = self.shard_id {
            headers.insert(SHARD_ID_HEADER, HeaderValue::from_str(shard_id.as_str())?);
        }
        if let Some(uuid) = self.uuid {
            headers.insert(UUID_HEADER, HeaderValue::from_str(uuid)?);
        }

        Ok(request)
    }
}

/// Open a connection to `route` on the broker
pub async fn open(base_url: &str, route: Route, handshake: Handshake<'_>) -> Result<BrokerStream> {
    let request = handshake.request(base_url, route)?;
    let (stream, _response) = tokio_tungstenite::connect_async(request).await?;
    trace!("Opened {}{}", base_url, route);
    Ok(stream)
}

/// Send one JSON message
pub async fn send_json<T: Serialize + ?Sized>(stream: &mut BrokerStream, value: &T) -> Result<()> {
    let text = serde_json::to_string(value)?;
    stream.send(Message::text(text)).await?;
    Ok(())
}

/// Wait for the next text message, skipping control frames
pub async fn recv_text(stream: &mut BrokerStream) -> Result<String> {
    while let Some(frame) = stream.next().await {
        match frame? {
            Message::Text(text) => return Ok(text.as_str().to_string()),
            Message::Binary(bytes) => {
                return String::from_utf8(bytes.to_vec())
                    .map_err(|_| ClusterError::protocol("received a non UTF-8 frame"));
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    Err(ClusterError::connection("connection closed before a message arrived"))
}
