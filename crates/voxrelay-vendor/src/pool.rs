//! Bounded pool of authenticated vendor connections.
//!
//! Connections are created lazily up to `max_size` and handed out
//! exclusively: a [`PooledConnection`] is a move-only handle, so at most one
//! owner can use it at a time. Returning it with [`ConnectionPool::release`]
//! makes it available again if it is still open; dropping it anywhere else
//! closes it and frees its slot.

use crate::config::PoolSettings;
use crate::error::VoiceError;
use crate::signing::UrlSigner;
use crate::transport::{Dialer, VendorChannel, VendorMessage};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

/// Lifecycle of one vendor socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            _ => Self::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Connecting => 0,
            Self::Open => 1,
            Self::Closed => 2,
        }
    }
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections alive, idle or checked out.
    pub total: usize,
    pub idle: usize,
    pub max_size: usize,
}

/// State shared between a connection handle and its reader task.
struct ConnShared {
    state: AtomicU8,
    handler: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl ConnShared {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn handler(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<String>>> {
        self.handler.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Cloneable handle that queues frames on one connection.
///
/// All clones feed the same FIFO writer, so frames go out in the order they
/// were submitted.
#[derive(Debug, Clone)]
pub struct ConnectionSender {
    conn_id: u64,
    tx: mpsc::Sender<VendorMessage>,
}

impl ConnectionSender {
    pub fn new(conn_id: u64, tx: mpsc::Sender<VendorMessage>) -> Self {
        Self { conn_id, tx }
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub async fn send(&self, message: VendorMessage) -> Result<(), VoiceError> {
        self.tx.send(message).await.map_err(|_| {
            VoiceError::Transport(format!("connection {} is closed", self.conn_id))
        })
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), VoiceError> {
        self.send(VendorMessage::Text(text.into())).await
    }

    pub async fn send_binary(&self, bytes: Vec<u8>) -> Result<(), VoiceError> {
        self.send(VendorMessage::Binary(bytes)).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// One live vendor socket.
struct Connection {
    id: u64,
    signed_url: String,
    sender: ConnectionSender,
    shared: Arc<ConnShared>,
}

impl Connection {
    fn open(id: u64, pool: &str, signed_url: String, channel: VendorChannel) -> Self {
        let shared = Arc::new(ConnShared {
            state: AtomicU8::new(ConnectionState::Connecting.as_u8()),
            handler: Mutex::new(None),
        });

        let VendorChannel {
            outgoing,
            mut incoming,
        } = channel;

        let reader_shared = shared.clone();
        let pool_name = pool.to_string();
        tokio::spawn(async move {
            while let Some(message) = incoming.recv().await {
                let mut handler = reader_shared.handler();
                match handler.as_ref() {
                    Some(tx) => {
                        if tx.send(message).is_err() {
                            *handler = None;
                        }
                    }
                    None => {
                        tracing::trace!(pool = %pool_name, conn_id = id, "no handler registered; dropping vendor message");
                    }
                }
            }
            reader_shared.set_state(ConnectionState::Closed);
            reader_shared.handler().take();
            tracing::debug!(pool = %pool_name, conn_id = id, "vendor connection closed");
        });

        shared.set_state(ConnectionState::Open);
        Self {
            id,
            signed_url,
            sender: ConnectionSender::new(id, outgoing),
            shared,
        }
    }

    fn is_open(&self) -> bool {
        self.shared.state() == ConnectionState::Open && !self.sender.is_closed()
    }

    fn close(&self) {
        self.shared.set_state(ConnectionState::Closed);
        self.shared.handler().take();
        let _ = self.sender.tx.try_send(VendorMessage::Close);
    }
}

enum Checkout {
    Reuse(Connection),
    Create,
    Wait,
}

struct PoolState {
    idle: VecDeque<Connection>,
    total: usize,
    shut_down: bool,
}

struct PoolInner {
    name: String,
    settings: PoolSettings,
    signer: Arc<dyn UrlSigner>,
    dialer: Arc<dyn Dialer>,
    state: Mutex<PoolState>,
    available: Notify,
    next_id: AtomicU64,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Closes a connection that will not come back and frees its slot.
    fn discard(&self, conn: Connection) {
        conn.close();
        {
            let mut state = self.lock();
            state.total = state.total.saturating_sub(1);
        }
        tracing::debug!(pool = %self.name, conn_id = conn.id, "discarded vendor connection");
        self.available.notify_one();
    }
}

/// Rolls back a capacity reservation unless the connection was created.
struct Reservation<'a> {
    inner: &'a PoolInner,
    committed: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            {
                let mut state = self.inner.lock();
                state.total = state.total.saturating_sub(1);
            }
            self.inner.available.notify_one();
        }
    }
}

/// A vendor connection checked out of a [`ConnectionPool`].
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.pool.name)
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

impl PooledConnection {
    fn conn(&self) -> Option<&Connection> {
        self.conn.as_ref()
    }

    pub fn id(&self) -> u64 {
        self.conn().map(|c| c.id).unwrap_or_default()
    }

    pub fn state(&self) -> ConnectionState {
        self.conn()
            .map(|c| c.shared.state())
            .unwrap_or(ConnectionState::Closed)
    }

    pub fn is_open(&self) -> bool {
        self.conn().map(Connection::is_open).unwrap_or(false)
    }

    /// The URL this connection was opened with. Signed once, at creation.
    pub fn signed_url(&self) -> &str {
        self.conn().map(|c| c.signed_url.as_str()).unwrap_or_default()
    }

    pub fn sender(&self) -> Result<ConnectionSender, VoiceError> {
        self.conn()
            .map(|c| c.sender.clone())
            .ok_or_else(|| VoiceError::Transport("connection already returned".to_string()))
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), VoiceError> {
        self.sender()?.send_text(text).await
    }

    pub async fn send_binary(&self, bytes: Vec<u8>) -> Result<(), VoiceError> {
        self.sender()?.send_binary(bytes).await
    }

    /// Registers the single inbound message handler, replacing any previous
    /// one. The returned receiver yields `None` once the socket closes.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(conn) = self.conn() {
            if conn.shared.state() != ConnectionState::Closed {
                *conn.shared.handler() = Some(tx);
            }
        }
        rx
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.discard(conn);
        }
    }
}

/// Bounded, lazily filled pool of vendor connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("name", &self.inner.name)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(
        name: impl Into<String>,
        settings: PoolSettings,
        signer: Arc<dyn UrlSigner>,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                settings,
                signer,
                dialer,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    total: 0,
                    shut_down: false,
                }),
                available: Notify::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        PoolStats {
            total: state.total,
            idle: state.idle.len(),
            max_size: self.inner.settings.max_size,
        }
    }

    /// Checks out an open connection.
    ///
    /// Reuses an idle connection when one is healthy, creates one while under
    /// `max_size`, and otherwise waits for a release until the acquisition
    /// timeout elapses.
    ///
    /// # Errors
    ///
    /// `PoolExhausted` on timeout; `Auth` or `Connect` when creating a new
    /// connection fails. A failed creation leaves the pool's count unchanged.
    pub async fn acquire(&self) -> Result<PooledConnection, VoiceError> {
        let started = Instant::now();
        let deadline = started + self.inner.settings.acquire_timeout();

        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut stale = Vec::new();
            let outcome = {
                let mut state = self.inner.lock();
                if state.shut_down {
                    return Err(VoiceError::Connect(format!(
                        "{} pool is shut down",
                        self.inner.name
                    )));
                }

                let mut found = None;
                while let Some(conn) = state.idle.pop_front() {
                    if conn.is_open() {
                        found = Some(conn);
                        break;
                    }
                    state.total = state.total.saturating_sub(1);
                    stale.push(conn);
                }

                match found {
                    Some(conn) => Checkout::Reuse(conn),
                    None if state.total < self.inner.settings.max_size => {
                        state.total += 1;
                        Checkout::Create
                    }
                    None => Checkout::Wait,
                }
            };

            for conn in stale {
                tracing::debug!(pool = %self.inner.name, conn_id = conn.id, "dropping stale idle connection");
                conn.close();
            }

            match outcome {
                Checkout::Reuse(conn) => {
                    tracing::debug!(pool = %self.inner.name, conn_id = conn.id, "reusing idle connection");
                    return Ok(self.checkout(conn));
                }
                Checkout::Create => return self.create().await,
                Checkout::Wait => {}
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let waited = started.elapsed();
                tracing::warn!(
                    pool = %self.inner.name,
                    waited_ms = waited.as_millis() as u64,
                    "connection pool exhausted"
                );
                return Err(VoiceError::PoolExhausted {
                    pool: self.inner.name.clone(),
                    waited,
                });
            }
        }
    }

    /// Opens a new connection in a slot already reserved by `acquire`.
    async fn create(&self) -> Result<PooledConnection, VoiceError> {
        let mut reservation = Reservation {
            inner: &self.inner,
            committed: false,
        };

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let signed_url = self.inner.signer.signed_url().map_err(|e| {
            tracing::warn!(pool = %self.inner.name, "failed to sign vendor url: {}", e);
            e
        })?;

        let channel = self
            .inner
            .dialer
            .dial(&signed_url, self.inner.settings.handshake_timeout())
            .await
            .map_err(|e| {
                tracing::warn!(pool = %self.inner.name, conn_id = id, "failed to open vendor connection: {}", e);
                e
            })?;

        let conn = Connection::open(id, &self.inner.name, signed_url, channel);
        reservation.committed = true;
        tracing::info!(pool = %self.inner.name, conn_id = id, "opened vendor connection");
        Ok(self.checkout(conn))
    }

    fn checkout(&self, conn: Connection) -> PooledConnection {
        PooledConnection {
            conn: Some(conn),
            pool: self.inner.clone(),
        }
    }

    /// Returns a connection to the pool.
    ///
    /// Open connections go back to the idle set with their handler cleared;
    /// anything else is closed and its slot freed.
    pub fn release(&self, mut pooled: PooledConnection) {
        let Some(conn) = pooled.conn.take() else {
            return;
        };

        if !Arc::ptr_eq(&pooled.pool, &self.inner) {
            pooled.pool.discard(conn);
            return;
        }

        conn.shared.handler().take();
        if !conn.is_open() {
            self.inner.discard(conn);
            return;
        }

        let id = conn.id;
        {
            let mut state = self.inner.lock();
            if state.shut_down {
                drop(state);
                self.inner.discard(conn);
                return;
            }
            state.idle.push_back(conn);
        }
        tracing::debug!(pool = %self.inner.name, conn_id = id, "connection returned to pool");
        self.inner.available.notify_one();
    }

    /// Closes idle connections and rejects further acquisitions.
    ///
    /// Connections still checked out are closed when their holders drop or
    /// release them.
    pub fn shutdown(&self) {
        let idle: Vec<Connection> = {
            let mut state = self.inner.lock();
            state.shut_down = true;
            let drained: Vec<Connection> = state.idle.drain(..).collect();
            state.total = state.total.saturating_sub(drained.len());
            drained
        };
        for conn in &idle {
            conn.close();
        }
        tracing::info!(pool = %self.inner.name, closed = idle.len(), "connection pool shut down");
        self.inner.available.notify_waiters();
    }
}
