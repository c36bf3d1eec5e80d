//! WebSocket accept loop
//!
//! Each accepted socket gets a read loop, which dispatches text frames to the
//! broker in arrival order, and a writer task draining the connection's
//! outbound channel.

use crate::broker::Broker;
use crate::connection::Connection;
use cluster_common::error::Result;
use cluster_proto::ConnectionMeta;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, trace, warn};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Listening broker
pub struct BrokerServer {
    broker: Arc<Broker>,
    listener: TcpListener,
}

impl BrokerServer {
    /// Bind the broker to `host:port`
    pub async fn bind(broker: Arc<Broker>, host: &str, port: u16) -> Result<Self> {
        let listener = TcpListener::bind((host, port)).await?;
        Ok(Self::from_listener(broker, listener))
    }

    pub fn from_listener(broker: Arc<Broker>, listener: TcpListener) -> Self {
        Self { broker, listener }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the task is cancelled
    pub async fn serve(self) -> Result<()> {
        info!("Broker listening on {}", self.local_addr()?);

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let broker = self.broker.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(broker, stream, peer).await {
                    debug!("Connection from {} ended during handshake: {}", peer, e);
                }
            });
        }
    }
}

impl Broker {
    /// Bind to `host:port` and serve until the task is cancelled
    pub async fn serve(self: Arc<Self>, host: &str, port: u16) -> Result<()> {
        BrokerServer::bind(self, host, port).await?.serve().await
    }
}

async fn handle_connection(broker: Arc<Broker>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let mut meta = ConnectionMeta::default();

    let websocket = tokio_tungstenite::accept_hdr_async(
        stream,
        |request: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
            meta = ConnectionMeta::from_headers(request.uri().path(), |name| {
                request
                    .headers()
                    .get(name)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string)
            });
            Ok(response)
        },
    )
    .await?;

    let (sink, mut stream) = websocket.split();
    let (connection, outbound) = Connection::new(Some(peer));
    let writer = tokio::spawn(write_loop(sink, outbound, connection.clone()));

    debug!("Connection {} from {} on {}", connection.id(), peer, meta.path);

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                trace!("Received on {}: {}", meta.path, text.as_str());
                broker.dispatch(&meta, &connection, text.as_str()).await;
            }
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => broker.dispatch(&meta, &connection, text).await,
                Err(_) => debug!("Ignoring non UTF-8 frame on {}", connection.id()),
            },
            Ok(Message::Pong(payload)) => connection.record_pong(&payload),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Connection {} closed: {}", connection.id(), e);
                break;
            }
        }
    }

    connection.mark_closed();
    writer.abort();
    debug!("Connection {} from {} finished", connection.id(), peer);

    Ok(())
}

async fn write_loop(
    mut sink: WsSink,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    connection: Arc<Connection>,
) {
    while let Some(message) = outbound.recv().await {
        let closing = matches!(message, Message::Close(_));

        if let Err(e) = sink.send(message).await {
            debug!("Write to {} failed: {}", connection.id(), e);
            break;
        }
        if closing {
            break;
        }
    }

    connection.mark_closed();
    let _ = sink.close().await;
}
