//! Listener configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings fixed for the lifetime of a running [`Listener`](crate::Listener)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// IP address to bind ("0.0.0.0" = all IPv4 interfaces, "::" = all IPv6)
    pub bind_address: String,

    /// TCP port (0 picks an ephemeral port)
    pub port: u16,

    /// Backlog of connections the OS queues before they are accepted
    pub max_pending: u32,

    /// Relay a client's own messages back to it
    pub echo_to_sender: bool,

    /// Upper bound on the size of a single forwarded chunk
    pub read_buffer_size: usize,

    /// Tear down connections idle for this long (None = wait forever)
    pub read_timeout_secs: Option<u64>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            max_pending: 10,
            echo_to_sender: true,
            read_buffer_size: 4096,
            read_timeout_secs: None,
        }
    }
}

impl ListenerConfig {
    /// Loopback on an ephemeral port, handy for tests and local tools
    pub fn loopback() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 0,
            ..Self::default()
        }
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_secs.map(Duration::from_secs)
    }
}
