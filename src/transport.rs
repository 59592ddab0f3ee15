// ring-node/src/transport.rs
//! Length-framed TCP connections and the per-address connection cache.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{FutureExt, SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, warn};

use crate::wire::{Message, WireError};

pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection to {0} is closed")]
    Closed(SocketAddr),
    #[error("timed out connecting to {0}")]
    Timeout(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Wire(#[from] WireError),
}

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub connect_timeout: Duration,
    pub max_frame_len: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// `[u32 big-endian length][payload]` frames.
pub fn codec(max_frame_len: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_len)
        .new_codec()
}

/// Receives every decoded message together with the connection it came in on.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn on_event(&self, message: Message, connection: Connection);
}

/// Something that can deliver a message to an address, reporting only success.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn send(&self, address: &str, message: &Message, start: bool) -> bool;
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type Reader = FramedRead<OwnedReadHalf, LengthDelimitedCodec>;
type Writer = FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>;

struct Inner {
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    writer: Mutex<Writer>,
    reader: StdMutex<Option<Reader>>,
    started: AtomicBool,
    closed: AtomicBool,
    receiver: StdMutex<Option<AbortHandle>>,
}

/// A bidirectional framed channel. Clones share the same socket.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer_addr", &self.inner.peer_addr)
            .field("local_addr", &self.inner.local_addr)
            .field("started", &self.is_started())
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Connection {
    pub fn new(stream: TcpStream, max_frame_len: usize) -> std::io::Result<Self> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            inner: Arc::new(Inner {
                peer_addr,
                local_addr,
                writer: Mutex::new(FramedWrite::new(write_half, codec(max_frame_len))),
                reader: StdMutex::new(Some(FramedRead::new(read_half, codec(max_frame_len)))),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                receiver: StdMutex::new(None),
            }),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// False once the receive loop has ended, a send failed, or (for a
    /// connection nobody reads from) the remote side has hung up.
    pub fn is_open(&self) -> bool {
        if self.inner.closed.load(Ordering::SeqCst) {
            return false;
        }
        let mut reader = lock(&self.inner.reader);
        if let Some(reader) = reader.as_mut() {
            let mut probe = [0u8; 1];
            match reader.get_mut().peek(&mut probe).now_or_never() {
                Some(Ok(0)) | Some(Err(_)) => {
                    self.inner.closed.store(true, Ordering::SeqCst);
                    return false;
                }
                _ => {}
            }
        }
        true
    }

    pub async fn send(&self, message: &Message) -> Result<(), TransportError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed(self.inner.peer_addr));
        }
        let frame = message.encode()?;
        let mut writer = self.inner.writer.lock().await;
        if let Err(e) = writer.send(frame).await {
            self.inner.closed.store(true, Ordering::SeqCst);
            return Err(e.into());
        }
        debug!("Sent {} to {}", message.kind(), self.inner.peer_addr);
        Ok(())
    }

    /// Start the receive loop. Later calls do nothing.
    ///
    /// Messages are handed to `handler` one at a time in arrival order. A
    /// malformed frame or end of stream ends this loop only.
    pub fn start(&self, handler: Weak<dyn EventHandler>) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(mut reader) = lock(&self.inner.reader).take() else {
            return;
        };
        let connection = self.clone();
        let task = tokio::spawn(async move {
            let peer = connection.inner.peer_addr;
            while let Some(frame) = reader.next().await {
                let frame = match frame {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!("Read from {} failed: {}", peer, e);
                        break;
                    }
                };
                let message = match Message::decode(&frame) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("Malformed frame from {}, dropping connection: {}", peer, e);
                        break;
                    }
                };
                let Some(handler) = handler.upgrade() else {
                    break;
                };
                debug!("Received {} from {}", message.kind(), peer);
                handler.on_event(message, connection.clone()).await;
            }
            connection.inner.closed.store(true, Ordering::SeqCst);
            debug!("Receive loop for {} finished", peer);
        });
        *lock(&self.inner.receiver) = Some(task.abort_handle());
    }

    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Some(receiver) = lock(&self.inner.receiver).take() {
            receiver.abort();
        }
        let mut writer = self.inner.writer.lock().await;
        let _ = SinkExt::<Bytes>::close(&mut *writer).await;
    }
}

/// Accept connections forever, starting a receive loop on each. Accepted
/// connections are answered on directly and never cached.
pub async fn serve(listener: TcpListener, handler: Weak<dyn EventHandler>, max_frame_len: usize) {
    loop {
        if handler.strong_count() == 0 {
            return;
        }
        match listener.accept().await {
            Ok((stream, remote)) => {
                let _ = stream.set_nodelay(true);
                match Connection::new(stream, max_frame_len) {
                    Ok(connection) => {
                        debug!("Accepted connection from {}", remote);
                        connection.start(handler.clone());
                    }
                    Err(e) => debug!("Dropping connection from {}: {}", remote, e),
                }
            }
            Err(e) => {
                warn!("Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

type Slot = Arc<Mutex<Option<Connection>>>;

/// Outgoing connections keyed by `host:port`.
///
/// Each address has its own slot lock, so sends to one address queue behind
/// each other while other addresses proceed.
pub struct ConnectionCache {
    handler: Weak<dyn EventHandler>,
    settings: TransportSettings,
    slots: StdMutex<HashMap<String, Slot>>,
}

impl ConnectionCache {
    pub fn new(handler: Weak<dyn EventHandler>, settings: TransportSettings) -> Self {
        Self {
            handler,
            settings,
            slots: StdMutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    fn slot(&self, address: &str) -> Slot {
        lock(&self.slots).entry(address.to_string()).or_default().clone()
    }

    /// Drop the map entry for `address` unless another send is queued on it.
    fn forget(&self, address: &str, slot: &Slot) {
        let mut slots = lock(&self.slots);
        let ours = slots.get(address).is_some_and(|current| Arc::ptr_eq(current, slot));
        // The map and the caller hold the only references.
        if ours && Arc::strong_count(slot) == 2 {
            slots.remove(address);
        }
    }

    async fn connect(&self, address: &str) -> Result<Connection, TransportError> {
        let stream = tokio::time::timeout(self.settings.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| TransportError::Timeout(address.to_string()))??;
        stream.set_nodelay(true)?;
        Ok(Connection::new(stream, self.settings.max_frame_len)?)
    }

    /// Deliver `message` to `address`, reusing the cached connection when it
    /// still works and reconnecting once when it does not.
    ///
    /// Only a connection that just carried a message successfully is cached.
    pub async fn send(&self, address: &str, message: &Message, start: bool) -> bool {
        let slot = self.slot(address);
        let mut cached = slot.lock().await;

        if let Some(connection) = cached.take() {
            if connection.is_open() {
                match connection.send(message).await {
                    Ok(()) => {
                        if start {
                            connection.start(self.handler.clone());
                        }
                        *cached = Some(connection);
                        return true;
                    }
                    Err(e) => debug!("Cached connection to {} failed: {}", address, e),
                }
            }
            connection.close().await;
        }

        let connection = match self.connect(address).await {
            Ok(connection) => connection,
            Err(e) => {
                debug!("Cannot connect to {}: {}", address, e);
                self.forget(address, &slot);
                return false;
            }
        };
        match connection.send(message).await {
            Ok(()) => {
                if start {
                    connection.start(self.handler.clone());
                }
                *cached = Some(connection);
                true
            }
            Err(e) => {
                debug!("Send to {} failed on a fresh connection: {}", address, e);
                connection.close().await;
                self.forget(address, &slot);
                false
            }
        }
    }

    /// The connection currently cached for `address`, if any.
    pub async fn cached(&self, address: &str) -> Option<Connection> {
        let slot = lock(&self.slots).get(address).cloned()?;
        let cached = slot.lock().await;
        cached.clone()
    }

    pub async fn close_all(&self) {
        let slots: Vec<Slot> = lock(&self.slots).drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            if let Some(connection) = slot.lock().await.take() {
                connection.close().await;
            }
        }
    }
}

#[async_trait]
impl Outbound for ConnectionCache {
    async fn send(&self, address: &str, message: &Message, start: bool) -> bool {
        ConnectionCache::send(self, address, message, start).await
    }
}
