//! TCP broadcast relay
//!
//! Accepts any number of concurrent TCP clients and forwards every chunk of
//! bytes received from one client, verbatim, to every connected client.
//!
//! # Features
//!
//! - Configurable bind address, port and listen backlog
//! - No framing: payloads are relayed exactly as read
//! - Sender echo on by default, optional sender exclusion
//! - One writer task per client, so a stalled peer never blocks the others
//! - Lifecycle events (accepted, closed, message, state change) for a front end
//! - Optional idle read timeout, graceful shutdown
//!
//! # Architecture
//!
//! - [`Listener`] accepts connections and registers a [`ClientHandle`] for each
//! - [`ClientRegistry`] holds the live clients and hands out snapshots
//! - [`ConnectionLifecycleManager`] runs one read loop per connection
//! - [`BroadcastRouter`] queues each received chunk on every client in a snapshot
//!
//! # Example Usage
//!
//! ```no_run
//! use chatrelay_broadcaster::{Listener, ListenerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let listener = Listener::new(ListenerConfig::default());
//!     listener.start().await?;
//!
//!     // Relay for a minute
//!     tokio::time::sleep(std::time::Duration::from_secs(60)).await;
//!
//!     listener.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod listener;
pub mod registry;
pub mod router;

// Re-exports
pub use client::{ClientHandle, ConnectionId, Message};
pub use config::ListenerConfig;
pub use connection::ConnectionLifecycleManager;
pub use error::{BindError, RelayError, Result};
pub use events::{ChannelSink, ConnectionState, EventSink, RelayEvent, TracingSink};
pub use listener::Listener;
pub use registry::ClientRegistry;
pub use router::BroadcastRouter;
