use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::client::ConnectionId;

/// Per-connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connected,
    Reading,
    Closing,
    Closed,
}

impl ConnectionState {
    /// Human-readable description for log output
    pub fn description(&self) -> &'static str {
        match self {
            ConnectionState::Connected => "A connection is established.",
            ConnectionState::Reading => "The socket is waiting for data from the peer.",
            ConnectionState::Closing => {
                "The socket is about to close (data may still be waiting to be written)."
            }
            ConnectionState::Closed => "The socket is not connected.",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reading => write!(f, "reading"),
            ConnectionState::Closing => write!(f, "closing"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Lifecycle events emitted by the relay core
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum RelayEvent {
    #[serde(rename = "listening")]
    Listening { address: String, port: u16 },

    #[serde(rename = "connection_accepted")]
    ConnectionAccepted {
        connection_id: ConnectionId,
        address: String,
        port: u16,
        connected_at: DateTime<Utc>,
    },

    #[serde(rename = "connection_closed")]
    ConnectionClosed {
        connection_id: ConnectionId,
        address: String,
        port: u16,
    },

    /// `text` is the payload decoded lossily, for display only
    #[serde(rename = "message_received")]
    MessageReceived {
        connection_id: ConnectionId,
        address: String,
        port: u16,
        byte_length: usize,
        text: String,
    },

    #[serde(rename = "connection_state_changed")]
    ConnectionStateChanged {
        connection_id: ConnectionId,
        address: String,
        port: u16,
        new_state: ConnectionState,
    },

    #[serde(rename = "stopped")]
    Stopped,
}

impl RelayEvent {
    /// Convert event to JSON string with newline
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let json = serde_json::to_string(self)?;
        Ok(format!("{}\n", json))
    }
}

/// Receiver of lifecycle events. Display and persistence are up to the implementor.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: RelayEvent);
}

/// Writes every event to the `tracing` log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: RelayEvent) {
        match event {
            RelayEvent::Listening { address, port } => {
                tracing::info!("Server has started. Listening on {}:{}", address, port);
            }
            RelayEvent::ConnectionAccepted { connection_id, address, port, .. } => {
                tracing::info!("Socket {} connected from {}:{}", connection_id, address, port);
            }
            RelayEvent::ConnectionClosed { connection_id, address, port } => {
                tracing::info!("Socket {} disconnected from {}:{}", connection_id, address, port);
            }
            RelayEvent::MessageReceived { address, port, byte_length, text, .. } => {
                tracing::info!("Message: {} ({}:{}, {} bytes)", text, address, port, byte_length);
            }
            RelayEvent::ConnectionStateChanged { address, port, new_state, .. } => {
                tracing::debug!(
                    "Socket state changed ({}:{}): {}",
                    address,
                    port,
                    new_state.description()
                );
            }
            RelayEvent::Stopped => {
                tracing::info!("Server stopped");
            }
        }
    }
}

/// Forwards events into a channel, for a front end or for tests
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<RelayEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RelayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: RelayEvent) {
        // Receiver gone just means nobody is watching
        let _ = self.tx.send(event);
    }
}
