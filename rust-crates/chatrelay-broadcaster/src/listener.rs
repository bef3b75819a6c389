use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::client::ClientHandle;
use crate::config::ListenerConfig;
use crate::connection::ConnectionLifecycleManager;
use crate::error::{BindError, RelayError, Result};
use crate::events::{EventSink, RelayEvent, TracingSink};
use crate::registry::ClientRegistry;
use crate::router::BroadcastRouter;

/// TCP relay server: accepts clients and relays every chunk they send to
/// all connected clients.
pub struct Listener {
    config: ListenerConfig,
    registry: Arc<ClientRegistry>,
    router: Arc<BroadcastRouter>,
    lifecycle: Arc<ConnectionLifecycleManager>,
    events: Arc<dyn EventSink>,
    shutdown: Arc<watch::Sender<bool>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: RwLock<Option<SocketAddr>>,
}

impl Listener {
    /// Create a listener that reports lifecycle events to the log
    pub fn new(config: ListenerConfig) -> Self {
        Self::with_event_sink(config, Arc::new(TracingSink))
    }

    pub fn with_event_sink(config: ListenerConfig, events: Arc<dyn EventSink>) -> Self {
        let registry = Arc::new(ClientRegistry::new());
        let router = Arc::new(BroadcastRouter::new(
            Arc::clone(&registry),
            config.echo_to_sender,
        ));
        let lifecycle = Arc::new(ConnectionLifecycleManager::new(
            Arc::clone(&registry),
            Arc::clone(&router),
            Arc::clone(&events),
            config.read_buffer_size,
            config.read_timeout(),
        ));
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            registry,
            router,
            lifecycle,
            events,
            shutdown: Arc::new(shutdown),
            accept_task: Mutex::new(None),
            local_addr: RwLock::new(None),
        }
    }

    /// Bind and start accepting clients in the background.
    ///
    /// A bind failure is returned as [`RelayError::Bind`] and no accept loop
    /// is started.
    pub async fn start(&self) -> Result<()> {
        let mut accept_task = self.accept_task.lock().await;
        if accept_task.is_some() {
            return Err(RelayError::AlreadyRunning);
        }

        let (listener, local_addr) = bind(&self.config)?;
        *self.local_addr.write().await = Some(local_addr);

        self.shutdown.send_replace(false);
        self.events.emit(RelayEvent::Listening {
            address: local_addr.ip().to_string(),
            port: local_addr.port(),
        });

        let acceptor = Acceptor {
            registry: Arc::clone(&self.registry),
            lifecycle: Arc::clone(&self.lifecycle),
            events: Arc::clone(&self.events),
            shutdown: Arc::clone(&self.shutdown),
        };

        *accept_task = Some(tokio::spawn(acceptor.run(listener)));
        Ok(())
    }

    /// Stop accepting and close every connected client
    pub async fn stop(&self) -> Result<()> {
        let task = self
            .accept_task
            .lock()
            .await
            .take()
            .ok_or(RelayError::NotStarted)?;
        task.abort();
        // Make sure no admit is still in flight before draining
        let _ = task.await;

        // Wakes every read loop into Closing
        self.shutdown.send_replace(true);

        let clients = self.registry.drain().await;
        for client in &clients {
            client.close();
        }
        tracing::debug!("Closed {} clients on shutdown", clients.len());

        *self.local_addr.write().await = None;
        self.events.emit(RelayEvent::Stopped);
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.accept_task.lock().await.is_some()
    }

    /// Address actually bound, while running
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().await
    }

    pub async fn client_count(&self) -> usize {
        self.registry.len().await
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<BroadcastRouter> {
        &self.router
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.get_mut().take() {
            task.abort();
        }
        self.shutdown.send_replace(true);
    }
}

/// Everything the accept loop needs, detached from the `Listener`
struct Acceptor {
    registry: Arc<ClientRegistry>,
    lifecycle: Arc<ConnectionLifecycleManager>,
    events: Arc<dyn EventSink>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Acceptor {
    async fn run(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => self.admit(stream, peer).await,
                Err(e) => {
                    tracing::error!("{}", RelayError::Accept(e));
                }
            }
        }
    }

    async fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        let (reader, writer) = stream.into_split();
        let (handle, _writer_task) = ClientHandle::spawn(self.registry.next_id(), peer, writer);

        if let Err(e) = self.registry.add(handle.clone()).await {
            tracing::error!("Rejected connection from {}: {}", peer, e);
            handle.close();
            return;
        }

        self.events.emit(RelayEvent::ConnectionAccepted {
            connection_id: handle.id(),
            address: handle.address(),
            port: handle.port(),
            connected_at: handle.connected_at(),
        });

        let lifecycle = Arc::clone(&self.lifecycle);
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            // Teardown is complete by the time run returns; the error is only informative
            let _ = lifecycle.run(handle, reader, shutdown).await;
        });
    }
}

/// Bind and listen, returning the socket with the address it actually got
fn bind(config: &ListenerConfig) -> std::result::Result<(TcpListener, SocketAddr), BindError> {
    let ip: IpAddr = config
        .bind_address
        .parse()
        .map_err(|_| BindError::InvalidAddress(config.bind_address.clone()))?;
    let addr = SocketAddr::new(ip, config.port);

    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(|e| BindError::from_io(addr, e))?;

    #[cfg(unix)]
    socket
        .set_reuseaddr(true)
        .map_err(|e| BindError::from_io(addr, e))?;

    socket.bind(addr).map_err(|e| BindError::from_io(addr, e))?;
    let listener = socket
        .listen(config.max_pending)
        .map_err(|e| BindError::from_io(addr, e))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| BindError::from_io(addr, e))?;

    Ok((listener, local_addr))
}
