//! Broker-side handle for one live WebSocket connection
//!
//! Outbound frames go through an unbounded channel drained by the connection's
//! writer task, so a handle can be shared by the route table, the pending-call
//! table and the connection's own read loop.

use cluster_common::error::{ClusterError, Result};
use cluster_proto::Ack;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::Message;
use tracing::trace;
use uuid::Uuid;

/// Shared handle to a peer connection
#[derive(Debug)]
pub struct Connection {
    /// Connection identifier, used in logs
    id: Uuid,

    /// Remote address, when known
    peer: Option<SocketAddr>,

    /// Frames queued for the writer task
    outbound: mpsc::UnboundedSender<Message>,

    /// Set once either half of the socket has gone away
    closed: AtomicBool,

    /// Nonce of the most recent ping sent by `probe`
    probes: AtomicU64,

    /// Nonce carried by the most recent matching pong
    answered: AtomicU64,

    /// Woken whenever a pong arrives or the connection closes
    pong: Notify,
}

impl Connection {
    /// Create a handle and the receiving end its writer task drains
    pub fn new(peer: Option<SocketAddr>) -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            id: Uuid::new_v4(),
            peer,
            outbound,
            closed: AtomicBool::new(false),
            probes: AtomicU64::new(0),
            answered: AtomicU64::new(0),
            pong: Notify::new(),
        });

        (connection, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Queue a text frame
    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        let text: String = text.into();
        self.send(Message::text(text))
    }

    /// Queue a status acknowledgment
    pub fn send_ack(&self, ack: &Ack) -> Result<()> {
        self.send_text(ack.to_json())
    }

    /// Queue a close frame; the writer task stops after sending it
    pub fn close(&self) -> Result<()> {
        self.send(Message::Close(None))
    }

    fn send(&self, message: Message) -> Result<()> {
        if self.is_closed() {
            return Err(ClusterError::connection(format!(
                "connection {} is closed",
                self.id
            )));
        }

        self.outbound
            .send(message)
            .map_err(|_| ClusterError::connection(format!("connection {} is closed", self.id)))
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.outbound.is_closed()
    }

    /// Record that the socket is gone and wake any pending probe
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
        self.pong.notify_waiters();
    }

    /// Record a pong from the peer. Pongs that do not echo a probe nonce are ignored.
    pub fn record_pong(&self, payload: &[u8]) {
        let Ok(nonce) = <[u8; 8]>::try_from(payload) else {
            trace!(connection = %self.id, "unsolicited pong");
            return;
        };

        trace!(connection = %self.id, "pong received");
        self.answered.store(u64::from_be_bytes(nonce), Ordering::Release);
        self.pong.notify_waiters();
    }

    /// Liveness probe: send a ping and wait up to `timeout` for the pong echoing it.
    ///
    /// Returns `false` when the connection is already closed, the ping cannot
    /// be queued, the connection closes while waiting, or no matching pong
    /// arrives in time. A late pong for an earlier probe does not count.
    pub async fn probe(&self, timeout: Duration) -> bool {
        if self.is_closed() {
            return false;
        }

        let nonce = self.probes.fetch_add(1, Ordering::AcqRel) + 1;
        let ping = Message::Ping(nonce.to_be_bytes().to_vec().into());
        if self.outbound.send(ping).is_err() {
            return false;
        }

        let answered = async {
            loop {
                let pong = self.pong.notified();
                tokio::pin!(pong);
                pong.as_mut().enable();

                if self.answered.load(Ordering::Acquire) == nonce {
                    return true;
                }
                if self.is_closed() {
                    return false;
                }
                pong.await;
            }
        };

        tokio::time::timeout(timeout, answered).await.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_text_reaches_writer() {
        let (connection, mut rx) = Connection::new(None);

        connection.send_text(r#"{"pong": true}"#).unwrap();

        match rx.recv().await {
            Some(Message::Text(text)) => assert_eq!(text.as_str(), r#"{"pong": true}"#),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (connection, _rx) = Connection::new(None);

        connection.mark_closed();

        assert!(connection.is_closed());
        assert!(connection.send_text("{}").is_err());
    }

    #[tokio::test]
    async fn test_dropped_writer_counts_as_closed() {
        let (connection, rx) = Connection::new(None);
        drop(rx);

        assert!(connection.is_closed());
        assert!(!connection.probe(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn test_probe_succeeds_on_pong() {
        let (connection, mut rx) = Connection::new(None);

        let peer = connection.clone();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Message::Ping(payload) = frame {
                    peer.record_pong(&payload);
                }
            }
        });

        assert!(connection.probe(Duration::from_secs(1)).await);
        assert!(connection.probe(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_late_pong_does_not_satisfy_next_probe() {
        let (connection, mut rx) = Connection::new(None);

        assert!(!connection.probe(Duration::from_millis(50)).await);
        let Some(Message::Ping(first)) = rx.recv().await else {
            panic!("expected the first ping");
        };

        // Answer only the ping that already timed out
        let peer = connection.clone();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if matches!(frame, Message::Ping(_)) {
                    peer.record_pong(&first);
                }
            }
        });

        assert!(!connection.probe(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn test_empty_pong_is_ignored() {
        let (connection, mut rx) = Connection::new(None);

        let peer = connection.clone();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if matches!(frame, Message::Ping(_)) {
                    peer.record_pong(&[]);
                }
            }
        });

        assert!(!connection.probe(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn test_probe_times_out_without_pong() {
        let (connection, _rx) = Connection::new(None);

        assert!(!connection.probe(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn test_probe_fails_when_closed_while_waiting() {
        let (connection, _rx) = Connection::new(None);

        let peer = connection.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            peer.mark_closed();
        });

        assert!(!connection.probe(Duration::from_secs(5)).await);
    }
}
