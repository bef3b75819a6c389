use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;

use crate::client::{ClientHandle, Message};
use crate::error::{RelayError, Result};
use crate::events::{ConnectionState, EventSink, RelayEvent};
use crate::registry::ClientRegistry;
use crate::router::BroadcastRouter;

/// Runs the read side of each connection:
/// `Connected -> Reading -> Closing -> Closed`.
pub struct ConnectionLifecycleManager {
    registry: Arc<ClientRegistry>,
    router: Arc<BroadcastRouter>,
    events: Arc<dyn EventSink>,
    read_buffer_size: usize,
    read_timeout: Option<Duration>,
}

enum CloseReason {
    EndOfStream,
    Shutdown,
    Failed(RelayError),
}

impl ConnectionLifecycleManager {
    pub fn new(
        registry: Arc<ClientRegistry>,
        router: Arc<BroadcastRouter>,
        events: Arc<dyn EventSink>,
        read_buffer_size: usize,
        read_timeout: Option<Duration>,
    ) -> Self {
        Self {
            registry,
            router,
            events,
            read_buffer_size: read_buffer_size.max(1),
            read_timeout,
        }
    }

    /// Drive one registered connection until the peer leaves, a read fails or
    /// `shutdown` fires. The handle is deregistered and closed before returning.
    ///
    /// A read error is returned for the caller's information only; teardown
    /// has already happened.
    pub async fn run<R>(
        &self,
        handle: ClientHandle,
        mut reader: R,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        self.transition(&handle, ConnectionState::Connected);
        self.transition(&handle, ConnectionState::Reading);

        let mut buf = vec![0u8; self.read_buffer_size];

        let reason = if *shutdown.borrow_and_update() {
            CloseReason::Shutdown
        } else {
            loop {
                let read = tokio::select! {
                    result = self.read_chunk(&mut reader, &mut buf) => result,
                    _ = shutdown.changed() => break CloseReason::Shutdown,
                };

                match read {
                    Ok(0) => break CloseReason::EndOfStream,
                    Ok(n) => {
                        let message = Message::new(handle.id(), &buf[..n]);
                        self.events.emit(RelayEvent::MessageReceived {
                            connection_id: handle.id(),
                            address: handle.address(),
                            port: handle.port(),
                            byte_length: n,
                            text: message.text().into_owned(),
                        });
                        self.router.route(&message).await;
                    }
                    Err(e) => break CloseReason::Failed(RelayError::Read(handle.id(), e)),
                }
            }
        };

        match &reason {
            CloseReason::EndOfStream => tracing::debug!("Peer {} closed the connection", handle.id()),
            CloseReason::Shutdown => tracing::debug!("Closing {} for server shutdown", handle.id()),
            CloseReason::Failed(e) => tracing::info!("{}", e),
        }

        self.transition(&handle, ConnectionState::Closing);
        self.registry.remove(handle.id()).await;
        handle.close();
        self.transition(&handle, ConnectionState::Closed);

        self.events.emit(RelayEvent::ConnectionClosed {
            connection_id: handle.id(),
            address: handle.address(),
            port: handle.port(),
        });

        match reason {
            CloseReason::Failed(e) => Err(e),
            _ => Ok(()),
        }
    }

    async fn read_chunk<R>(&self, reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        match self.read_timeout {
            Some(limit) => tokio::time::timeout(limit, reader.read(buf))
                .await
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "read timed out"))?,
            None => reader.read(buf).await,
        }
    }

    fn transition(&self, handle: &ClientHandle, new_state: ConnectionState) {
        self.events.emit(RelayEvent::ConnectionStateChanged {
            connection_id: handle.id(),
            address: handle.address(),
            port: handle.port(),
            new_state,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChannelSink;
    use std::net::SocketAddr;
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        registry: Arc<ClientRegistry>,
        manager: Arc<ConnectionLifecycleManager>,
        events: UnboundedReceiver<RelayEvent>,
    }

    fn fixture(read_timeout: Option<Duration>) -> Fixture {
        let registry = Arc::new(ClientRegistry::new());
        let router = Arc::new(BroadcastRouter::new(Arc::clone(&registry), true));
        let (sink, events) = ChannelSink::new();
        let manager = Arc::new(ConnectionLifecycleManager::new(
            Arc::clone(&registry),
            router,
            Arc::new(sink),
            64,
            read_timeout,
        ));
        Fixture {
            registry,
            manager,
            events,
        }
    }

    /// Registered handle plus the far ends of its write and read sides
    async fn register(registry: &ClientRegistry) -> (ClientHandle, DuplexStream, DuplexStream, DuplexStream) {
        let (write_ours, write_theirs) = tokio::io::duplex(256);
        let (read_ours, read_theirs) = tokio::io::duplex(256);
        let peer: SocketAddr = "127.0.0.1:41000".parse().unwrap();
        let (handle, _task) = ClientHandle::spawn(registry.next_id(), peer, write_ours);
        registry.add(handle.clone()).await.unwrap();
        (handle, read_ours, read_theirs, write_theirs)
    }

    fn states(events: &mut UnboundedReceiver<RelayEvent>) -> Vec<ConnectionState> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let RelayEvent::ConnectionStateChanged { new_state, .. } = event {
                seen.push(new_state);
            }
        }
        seen
    }

    #[tokio::test]
    async fn test_end_of_stream_tears_down() {
        let mut fx = fixture(None);
        let (handle, reader, mut peer_tx, _peer_rx) = register(&fx.registry).await;
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        peer_tx.shutdown().await.unwrap();
        fx.manager.run(handle.clone(), reader, shutdown_rx).await.unwrap();

        assert!(!fx.registry.contains(handle.id()).await);
        assert!(handle.is_closed());
        assert_eq!(
            states(&mut fx.events),
            vec![
                ConnectionState::Connected,
                ConnectionState::Reading,
                ConnectionState::Closing,
                ConnectionState::Closed,
            ]
        );
    }

    #[tokio::test]
    async fn test_received_chunk_is_echoed() {
        let fx = fixture(None);
        let (handle, reader, mut peer_tx, mut peer_rx) = register(&fx.registry).await;
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let manager = Arc::clone(&fx.manager);
        let task = tokio::spawn(async move { manager.run(handle, reader, shutdown_rx).await });

        peer_tx.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        peer_rx.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(peer_tx);
        task.await.unwrap().unwrap();
        assert!(fx.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_shutdown_signal_closes_connection() {
        let fx = fixture(None);
        let (handle, reader, _peer_tx, _peer_rx) = register(&fx.registry).await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let manager = Arc::clone(&fx.manager);
        let task = tokio::spawn(async move { manager.run(handle, reader, shutdown_rx).await });

        shutdown_tx.send_replace(true);
        task.await.unwrap().unwrap();
        assert!(fx.registry.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout_is_a_read_error() {
        let fx = fixture(Some(Duration::from_secs(5)));
        let (handle, reader, _peer_tx, _peer_rx) = register(&fx.registry).await;
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let err = fx.manager.run(handle, reader, shutdown_rx).await.unwrap_err();
        assert!(matches!(err, RelayError::Read(_, ref e) if e.kind() == std::io::ErrorKind::TimedOut));
        assert!(fx.registry.is_empty().await);
    }
}
