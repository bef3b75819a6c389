use std::borrow::Cow;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{RelayError, Result};

/// Opaque identifier for one accepted connection. Never reissued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One chunk read from a connection, tagged with the connection it came from.
#[derive(Debug, Clone)]
pub struct Message {
    pub origin: ConnectionId,
    pub payload: Arc<[u8]>,
}

impl Message {
    pub fn new(origin: ConnectionId, payload: &[u8]) -> Self {
        Self {
            origin,
            payload: Arc::from(payload),
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Payload as text, replacing invalid UTF-8
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// How long a closing writer keeps flushing to a peer that is not reading
pub const CLOSE_FLUSH_GRACE: Duration = Duration::from_millis(500);

enum Outbound {
    Payload(Arc<[u8]>),
    Close,
}

/// Server-side handle for one connected peer.
///
/// The write half of the transport is owned by a dedicated writer task fed
/// through an unbounded queue, so `send` never waits on the network. Clones
/// share the same connection.
///
/// The queue has no bound: a peer that stops reading grows it until the
/// connection is closed.
#[derive(Clone)]
pub struct ClientHandle {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    id: ConnectionId,
    peer: SocketAddr,
    connected_at: DateTime<Utc>,
    outbound: mpsc::UnboundedSender<Outbound>,
    closing: watch::Sender<bool>,
    writable: Arc<AtomicBool>,
    closed: AtomicBool,
    retired: AtomicBool,
}

impl ClientHandle {
    /// Wrap a connection's write side and start its writer task.
    pub fn spawn<W>(id: ConnectionId, peer: SocketAddr, writer: W) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let (closing, closing_rx) = watch::channel(false);
        let writable = Arc::new(AtomicBool::new(true));

        let task = tokio::spawn(write_loop(
            id,
            peer,
            writer,
            rx,
            closing_rx,
            Arc::clone(&writable),
        ));

        let handle = Self {
            inner: Arc::new(ClientInner {
                id,
                peer,
                connected_at: Utc::now(),
                outbound: tx,
                closing,
                writable,
                closed: AtomicBool::new(false),
                retired: AtomicBool::new(false),
            }),
        };

        (handle, task)
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Peer IP address as text
    pub fn address(&self) -> String {
        self.inner.peer.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.inner.peer.port()
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.inner.connected_at
    }

    pub fn is_writable(&self) -> bool {
        self.inner.writable.load(Ordering::Acquire)
    }

    /// Queue a payload for delivery to this peer
    pub fn send(&self, payload: &Arc<[u8]>) -> Result<()> {
        if !self.is_writable() {
            return Err(RelayError::NotWritable(self.id()));
        }

        self.inner
            .outbound
            .send(Outbound::Payload(Arc::clone(payload)))
            .map_err(|_| {
                RelayError::Write(
                    self.id(),
                    std::io::Error::new(std::io::ErrorKind::BrokenPipe, "writer task has stopped"),
                )
            })
    }

    /// Stop accepting sends, flush what is queued and shut the write side down.
    ///
    /// A peer that is not reading gets [`CLOSE_FLUSH_GRACE`] to drain; after
    /// that the pending output is dropped and the transport released anyway.
    ///
    /// Returns `true` only for the call that actually closed the handle.
    pub fn close(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inner.writable.store(false, Ordering::Release);
        self.inner.closing.send_replace(true);
        // Writer may already be gone after a write error.
        let _ = self.inner.outbound.send(Outbound::Close);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub(crate) fn retire(&self) -> bool {
        !self.inner.retired.swap(true, Ordering::AcqRel)
    }

    pub fn is_retired(&self) -> bool {
        self.inner.retired.load(Ordering::Acquire)
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("writable", &self.is_writable())
            .finish()
    }
}

async fn write_loop<W>(
    id: ConnectionId,
    peer: SocketAddr,
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    mut closing: watch::Receiver<bool>,
    writable: Arc<AtomicBool>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let drain = async {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Payload(bytes) => {
                    if let Err(e) = writer.write_all(&bytes).await {
                        writable.store(false, Ordering::Release);
                        tracing::warn!("Write to {} ({}) failed: {}", id, peer, e);
                        break;
                    }
                }
                Outbound::Close => break,
            }
        }
    };

    let grace_expired = async {
        if closing.wait_for(|closing| *closing).await.is_err() {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(CLOSE_FLUSH_GRACE).await;
    };

    tokio::select! {
        _ = drain => {}
        _ = grace_expired => {
            writable.store(false, Ordering::Release);
            tracing::debug!("Dropping unflushed output for {} ({}), peer is not reading", id, peer);
        }
    }

    if let Err(e) = writer.shutdown().await {
        tracing::debug!("Shutdown of {} ({}) write side failed: {}", id, peer, e);
    }
    tracing::debug!("Writer for {} ({}) stopped", id, peer);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn peer() -> SocketAddr {
        "10.0.0.7:50123".parse().unwrap()
    }

    #[tokio::test]
    async fn test_send_reaches_peer() {
        let (ours, mut theirs) = tokio::io::duplex(1024);
        let (handle, _task) = ClientHandle::spawn(ConnectionId::new(1), peer(), ours);

        assert_eq!(handle.address(), "10.0.0.7");
        assert_eq!(handle.port(), 50123);

        let payload: Arc<[u8]> = Arc::from(&b"hello"[..]);
        handle.send(&payload).unwrap();

        let mut buf = [0u8; 5];
        theirs.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_close_flushes_then_rejects_sends() {
        let (ours, mut theirs) = tokio::io::duplex(1024);
        let (handle, task) = ClientHandle::spawn(ConnectionId::new(2), peer(), ours);

        let payload: Arc<[u8]> = Arc::from(&b"last words"[..]);
        handle.send(&payload).unwrap();

        assert!(handle.close());
        assert!(!handle.close(), "second close is a no-op");
        assert!(!handle.is_writable());
        assert!(matches!(handle.send(&payload), Err(RelayError::NotWritable(_))));

        task.await.unwrap();

        let mut received = Vec::new();
        theirs.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"last words");
    }

    #[tokio::test]
    async fn test_write_failure_marks_unwritable() {
        let (ours, theirs) = tokio::io::duplex(16);
        let (handle, task) = ClientHandle::spawn(ConnectionId::new(3), peer(), ours);
        drop(theirs);

        let payload: Arc<[u8]> = Arc::from(&b"nobody is listening"[..]);
        handle.send(&payload).unwrap();

        task.await.unwrap();
        assert!(!handle.is_writable());
        assert!(handle.send(&payload).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_releases_peer_that_never_reads() {
        let (ours, theirs) = tokio::io::duplex(16);
        let (handle, task) = ClientHandle::spawn(ConnectionId::new(4), peer(), ours);

        let payload: Arc<[u8]> = Arc::from(vec![b'x'; 1024]);
        handle.send(&payload).unwrap();
        assert!(handle.close());

        let finished = tokio::time::timeout(Duration::from_secs(2), task).await;
        assert!(finished.is_ok(), "writer still holds the transport after close");
        assert!(!handle.is_writable());

        // Far end stayed open and unread the whole time
        drop(theirs);
    }

    #[test]
    fn test_message_text_is_lossy() {
        let msg = Message::new(ConnectionId::new(9), &[b'h', b'i', 0xff]);
        assert_eq!(msg.len(), 3);
        assert_eq!(msg.text(), "hi\u{fffd}");
        assert_eq!(ConnectionId::new(9).to_string(), "#9");
    }
}
