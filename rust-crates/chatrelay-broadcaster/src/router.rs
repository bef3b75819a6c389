use std::sync::Arc;

use crate::client::Message;
use crate::registry::ClientRegistry;

/// Fans each inbound message out to every registered client.
pub struct BroadcastRouter {
    registry: Arc<ClientRegistry>,
    echo_to_sender: bool,
}

impl BroadcastRouter {
    pub fn new(registry: Arc<ClientRegistry>, echo_to_sender: bool) -> Self {
        Self {
            registry,
            echo_to_sender,
        }
    }

    pub fn echo_to_sender(&self) -> bool {
        self.echo_to_sender
    }

    /// Deliver `message` to a snapshot of the registry.
    ///
    /// A failed recipient is logged and skipped. Returns how many recipients
    /// the payload was queued for.
    pub async fn route(&self, message: &Message) -> usize {
        let recipients = self.registry.snapshot().await;
        let mut delivered = 0;

        for client in recipients {
            if !self.echo_to_sender && client.id() == message.origin {
                continue;
            }
            if !client.is_writable() {
                continue;
            }

            match client.send(&message.payload) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(
                        "Failed to relay message from {} to {} ({}): {}",
                        message.origin,
                        client.id(),
                        client.peer_addr(),
                        e
                    );
                }
            }
        }

        tracing::trace!("Relayed {} bytes from {} to {} clients", message.len(), message.origin, delivered);
        delivered
    }
}
