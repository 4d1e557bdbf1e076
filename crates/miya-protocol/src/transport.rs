//! Reconnecting TCP transport for the RS-485 bridge
//!
//! The bridge exposes the device's RS-485 bus as a raw TCP byte stream.
//! [`TcpTransport`] owns that connection: it reassembles inbound bytes into
//! frames, serializes outbound writes, probes the link, and reconnects with
//! linear backoff when the link drops.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::Serialize;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::framer::FrameAssembler;
use crate::hexfmt::{decode_hex, encode_hex};
use crate::queue::{FrameQueue, DEFAULT_CAPACITY};
use crate::subscribers::{SubscriberError, SubscriberRegistry, SubscriptionId};
use crate::types::ProtocolError;

/// Default TCP port of the RS-485 bridge
pub const DEFAULT_PORT: u16 = 38;

/// Default connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default keepalive probe period
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Poll slice used by [`TcpTransport::next_frame`]
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

const READ_BUFFER_SIZE: usize = 1024;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Reconnect attempts and linear backoff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub backoff_step: Duration,
    pub max_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_step: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Wait after the `failures`-th consecutive failed attempt
    #[must_use]
    pub fn delay_after(&self, failures: u32) -> Duration {
        self.backoff_step
            .saturating_mul(failures)
            .min(self.max_backoff)
    }
}

/// Connection settings for [`TcpTransport`]
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    /// Periodic zero-length write plus OS-level TCP keepalive
    pub keepalive: bool,
    pub keepalive_interval: Duration,
    pub reconnect: ReconnectPolicy,
    pub queue_capacity: usize,
}

impl TransportConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            keepalive: true,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            reconnect: ReconnectPolicy::default(),
            queue_capacity: DEFAULT_CAPACITY,
        }
    }

    /// `host:port` as passed to the resolver
    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Connection events broadcast to observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportEvent {
    Connected,
    Disconnected {
        reason: String,
    },
    ReconnectAttempt {
        attempt: u32,
        max_attempts: u32,
    },
    ReconnectAttemptFailed {
        attempt: u32,
        error: String,
        /// `None` after the last attempt
        next_delay_ms: Option<u64>,
    },
    ReconnectFailed {
        attempts: u32,
    },
}

/// One reassembled inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFrame {
    bytes: Bytes,
}

impl ReceivedFrame {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn hex(&self) -> String {
        encode_hex(&self.bytes)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Debug, Default)]
struct StatsCounters {
    messages_sent: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    frames_received: AtomicU64,
    noise_bytes: AtomicU64,
    keepalive_probes: AtomicU64,
    reconnect_attempts: AtomicU64,
    reconnects: AtomicU64,
    /// Unix seconds, 0 while disconnected
    connected_since: AtomicU64,
    /// Unix seconds, 0 before any traffic
    last_activity: AtomicU64,
}

impl StatsCounters {
    fn touch(&self) {
        self.last_activity.store(unix_now(), Ordering::Relaxed);
    }

    fn snapshot(&self, frames_evicted: u64) -> TransportStats {
        let timestamp = |value: &AtomicU64| match value.load(Ordering::Relaxed) {
            0 => None,
            secs => Some(secs),
        };
        TransportStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_evicted,
            noise_bytes: self.noise_bytes.load(Ordering::Relaxed),
            keepalive_probes: self.keepalive_probes.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            connected_since: timestamp(&self.connected_since),
            last_activity: timestamp(&self.last_activity),
        }
    }
}

/// Point-in-time transport counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub frames_received: u64,
    pub frames_evicted: u64,
    /// Bytes dropped while looking for a frame boundary
    pub noise_bytes: u64,
    pub keepalive_probes: u64,
    pub reconnect_attempts: u64,
    pub reconnects: u64,
    /// Unix seconds
    pub connected_since: Option<u64>,
    /// Unix seconds
    pub last_activity: Option<u64>,
}

/// Connection summary for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    pub state: ConnectionState,
    pub keepalive: bool,
    pub keepalive_interval_secs: u64,
    pub queue_enabled: bool,
    pub queued_frames: usize,
    pub subscribers: usize,
    pub stats: TransportStats,
}

struct Session {
    id: u64,
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

struct TaskSet {
    /// Cancelled by `disconnect`; replaced by the next explicit `connect`
    lifecycle: CancellationToken,
    session: Option<Session>,
    reconnect: Option<JoinHandle<()>>,
    reconnect_active: bool,
    reconnect_requested: bool,
}

struct Inner {
    config: TransportConfig,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    connect_lock: tokio::sync::Mutex<()>,
    tasks: Mutex<TaskSet>,
    next_session: AtomicU64,
    state_tx: watch::Sender<ConnectionState>,
    event_tx: broadcast::Sender<TransportEvent>,
    queue: FrameQueue<ReceivedFrame>,
    queue_enabled: AtomicBool,
    subscribers: SubscriberRegistry<ReceivedFrame>,
    stats: StatsCounters,
}

impl Inner {
    fn tasks(&self) -> MutexGuard<'_, TaskSet> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                tracing::debug!("Transport state {} -> {}", current, state);
                *current = state;
                true
            }
        });
    }

    fn emit(&self, event: TransportEvent) {
        // No receivers is fine
        let _ = self.event_tx.send(event);
    }

    fn current_session(&self) -> Option<u64> {
        self.tasks().session.as_ref().map(|s| s.id)
    }

    fn dispatch(&self, frame: ReceivedFrame) {
        tracing::debug!("Received frame ({} bytes): {}", frame.len(), frame.hex());

        if self.queue_enabled.load(Ordering::Relaxed) && self.queue.push(frame.clone()) {
            tracing::warn!(
                "Frame queue full ({} frames), dropped oldest",
                self.queue.capacity()
            );
        }
        self.subscribers.notify(&frame);
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
    }
}

/// Reconnecting frame stream over TCP
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("addr", &self.inner.config.addr())
            .field("state", &self.inner.state())
            .finish()
    }
}

impl TcpTransport {
    pub fn new(config: TransportConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let queue = FrameQueue::new(config.queue_capacity);

        Self {
            inner: Arc::new(Inner {
                config,
                writer: tokio::sync::Mutex::new(None),
                connect_lock: tokio::sync::Mutex::new(()),
                tasks: Mutex::new(TaskSet {
                    lifecycle: CancellationToken::new(),
                    session: None,
                    reconnect: None,
                    reconnect_active: false,
                    reconnect_requested: false,
                }),
                next_session: AtomicU64::new(1),
                state_tx,
                event_tx,
                queue,
                queue_enabled: AtomicBool::new(true),
                subscribers: SubscriberRegistry::new("frame"),
                stats: StatsCounters::default(),
            }),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    /// Open the connection
    ///
    /// Errors are returned to the caller; automatic reconnection only kicks
    /// in once an established connection is lost. Returns immediately when
    /// already connected.
    pub async fn connect(&self) -> Result<(), ProtocolError> {
        let config = &self.inner.config;
        if config.keepalive && config.keepalive_interval.is_zero() {
            return Err(ProtocolError::Validation(
                "keepalive interval must be non-zero".to_string(),
            ));
        }
        {
            let mut tasks = self.inner.tasks();
            if tasks.lifecycle.is_cancelled() {
                tasks.lifecycle = CancellationToken::new();
            }
        }
        establish(&self.inner, ConnectionState::Connecting).await
    }

    /// Close the connection and stop all background activity
    ///
    /// Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let lifecycle = self.inner.tasks().lifecycle.clone();
        lifecycle.cancel();

        // Wait out any connect attempt so it cannot install a session after us
        let (session, reconnect) = {
            let _connecting = self.inner.connect_lock.lock().await;
            let mut tasks = self.inner.tasks();
            tasks.reconnect_requested = false;
            (tasks.session.take(), tasks.reconnect.take())
        };

        let mut handles = Vec::new();
        if let Some(session) = session {
            session.token.cancel();
            handles.extend(session.handles);
        }
        handles.extend(reconnect);

        for mut handle in handles {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle)
                .await
                .is_err()
            {
                tracing::warn!("Background task did not stop within {:?}", SHUTDOWN_GRACE);
                handle.abort();
            }
        }
        self.inner.tasks().reconnect_active = false;

        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!("Socket shutdown: {}", e);
            }
        }

        self.inner.stats.connected_since.store(0, Ordering::Relaxed);
        if self.inner.state() != ConnectionState::Disconnected {
            self.inner.set_state(ConnectionState::Disconnected);
            self.inner.emit(TransportEvent::Disconnected {
                reason: "disconnect requested".to_string(),
            });
            tracing::info!("Disconnected from {}", self.inner.config.addr());
        }
    }

    /// Write one frame
    pub async fn send(&self, data: &[u8]) -> Result<(), ProtocolError> {
        if self.inner.state() != ConnectionState::Connected {
            return Err(ProtocolError::NotConnected);
        }

        let result = {
            let mut writer = self.inner.writer.lock().await;
            let Some(writer) = writer.as_mut() else {
                return Err(ProtocolError::NotConnected);
            };
            match writer.write_all(data).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            }
        };

        match result {
            Ok(()) => {
                let stats = &self.inner.stats;
                stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                stats
                    .bytes_sent
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                stats.touch();
                tracing::debug!("Sent {} bytes: {}", data.len(), encode_hex(data));
                Ok(())
            }
            Err(e) => {
                if let Some(id) = self.inner.current_session() {
                    connection_lost(&self.inner, id, format!("write failed: {e}"));
                }
                Err(ProtocolError::Io(e))
            }
        }
    }

    /// Write a frame given as hex text
    pub async fn send_hex(&self, text: &str) -> Result<(), ProtocolError> {
        let data = decode_hex(text)?;
        self.send(&data).await
    }

    /// Next queued frame, waiting at most `timeout`
    pub async fn recv_frame(&self, timeout: Duration) -> Option<ReceivedFrame> {
        self.inner.queue.recv_timeout(timeout).await
    }

    pub fn try_recv_frame(&self) -> Option<ReceivedFrame> {
        self.inner.queue.try_pop()
    }

    /// Next queued frame; `None` once the transport has been disconnected
    pub async fn next_frame(&self) -> Option<ReceivedFrame> {
        let lifecycle = self.inner.tasks().lifecycle.clone();
        loop {
            if let Some(frame) = self.inner.queue.try_pop() {
                return Some(frame);
            }
            if lifecycle.is_cancelled() {
                return None;
            }
            tokio::select! {
                frame = self.inner.queue.recv_timeout(POLL_INTERVAL) => {
                    if frame.is_some() {
                        return frame;
                    }
                }
                _ = lifecycle.cancelled() => {}
            }
        }
    }

    /// Enable or disable the pull queue; disabling clears it
    pub fn set_queue_enabled(&self, enabled: bool) {
        self.inner.queue_enabled.store(enabled, Ordering::Relaxed);
        if !enabled {
            self.inner.queue.clear();
        }
    }

    pub fn queue_enabled(&self) -> bool {
        self.inner.queue_enabled.load(Ordering::Relaxed)
    }

    /// Register a callback run for every received frame
    ///
    /// Callbacks run on the read loop; keep them short.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ReceivedFrame) -> Result<(), SubscriberError> + Send + Sync + 'static,
    {
        self.inner.subscribers.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.subscribers.unsubscribe(id)
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state() == ConnectionState::Connected
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.event_tx.subscribe()
    }

    pub fn stats(&self) -> TransportStats {
        self.inner.stats.snapshot(self.inner.queue.evicted())
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        let config = &self.inner.config;
        ConnectionInfo {
            host: config.host.clone(),
            port: config.port,
            state: self.state(),
            keepalive: config.keepalive,
            keepalive_interval_secs: config.keepalive_interval.as_secs(),
            queue_enabled: self.queue_enabled(),
            queued_frames: self.inner.queue.len(),
            subscribers: self.inner.subscribers.len(),
            stats: self.stats(),
        }
    }
}

/// Connect and start the session tasks
async fn establish(inner: &Arc<Inner>, during: ConnectionState) -> Result<(), ProtocolError> {
    let _connecting = inner.connect_lock.lock().await;
    if inner.state() == ConnectionState::Connected {
        return Ok(());
    }
    let lifecycle = inner.tasks().lifecycle.clone();
    if lifecycle.is_cancelled() {
        return Err(ProtocolError::Cancelled);
    }

    inner.set_state(during);
    let config = &inner.config;
    let addr = config.addr();
    tracing::info!("Connecting to RS-485 bridge at {}", addr);

    let stream = match open_stream(config, &addr, &lifecycle).await {
        Ok(stream) => stream,
        Err(e) => {
            if during == ConnectionState::Connecting {
                inner.set_state(ConnectionState::Disconnected);
            }
            return Err(e);
        }
    };

    let (reader, writer) = stream.into_split();
    *inner.writer.lock().await = Some(writer);

    let id = inner.next_session.fetch_add(1, Ordering::Relaxed);
    let token = lifecycle.child_token();
    let previous = inner.tasks().session.replace(Session {
        id,
        token: token.clone(),
        handles: Vec::new(),
    });
    if let Some(previous) = previous {
        previous.token.cancel();
    }

    let mut handles = vec![tokio::spawn(read_loop(
        inner.clone(),
        id,
        token.clone(),
        reader,
    ))];
    if config.keepalive {
        handles.push(tokio::spawn(keepalive_loop(inner.clone(), id, token)));
    }
    if let Some(session) = inner.tasks().session.as_mut().filter(|s| s.id == id) {
        session.handles = handles;
    }

    let stats = &inner.stats;
    stats.connected_since.store(unix_now(), Ordering::Relaxed);
    stats.touch();
    inner.set_state(ConnectionState::Connected);
    inner.emit(TransportEvent::Connected);
    tracing::info!("Connected to RS-485 bridge at {}", addr);
    Ok(())
}

async fn open_stream(
    config: &TransportConfig,
    addr: &str,
    lifecycle: &CancellationToken,
) -> Result<TcpStream, ProtocolError> {
    let connect = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr));
    let stream = tokio::select! {
        _ = lifecycle.cancelled() => return Err(ProtocolError::Cancelled),
        result = connect => match result {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(ProtocolError::Connect {
                    addr: addr.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(ProtocolError::ConnectTimeout {
                    addr: addr.to_string(),
                    timeout: config.connect_timeout,
                })
            }
        },
    };

    stream.set_nodelay(true)?;
    if config.keepalive {
        // The kernel counts keepalive idle time in whole seconds
        let idle = config.keepalive_interval.max(Duration::from_secs(1));
        let keepalive = TcpKeepalive::new().with_time(idle);
        SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
    }
    Ok(stream)
}

async fn read_loop(
    inner: Arc<Inner>,
    session: u64,
    token: CancellationToken,
    mut reader: OwnedReadHalf,
) {
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    let mut assembler = FrameAssembler::new();

    let reason = loop {
        let read = tokio::select! {
            _ = token.cancelled() => {
                tracing::debug!("Read loop for session {} cancelled", session);
                return;
            }
            read = reader.read(&mut buffer) => read,
        };

        match read {
            Ok(0) => break "connection closed by peer".to_string(),
            Ok(n) => {
                inner
                    .stats
                    .bytes_received
                    .fetch_add(n as u64, Ordering::Relaxed);
                inner.stats.touch();
                let discarded = assembler.discarded();
                let frames = assembler.feed(&buffer[..n]);
                inner
                    .stats
                    .noise_bytes
                    .fetch_add(assembler.discarded() - discarded, Ordering::Relaxed);
                for frame in frames {
                    inner.dispatch(ReceivedFrame::new(frame));
                }
            }
            Err(e) => break format!("read failed: {e}"),
        }
    };

    connection_lost(&inner, session, reason);
}

async fn keepalive_loop(inner: Arc<Inner>, session: u64, token: CancellationToken) {
    let period = inner.config.keepalive_interval;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let result = {
            let mut writer = inner.writer.lock().await;
            let Some(writer) = writer.as_mut() else {
                break;
            };
            match writer.write(&[]).await {
                Ok(_) => writer.flush().await,
                Err(e) => Err(e),
            }
        };

        match result {
            Ok(()) => {
                inner.stats.keepalive_probes.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("Keepalive probe sent");
            }
            Err(e) => {
                connection_lost(&inner, session, format!("keepalive failed: {e}"));
                break;
            }
        }
    }
}

/// Tear down `session` and start reconnecting
///
/// Only the first report for a session has any effect.
fn connection_lost(inner: &Arc<Inner>, session: u64, reason: String) {
    let lost = {
        let mut tasks = inner.tasks();
        match tasks.session.as_ref() {
            Some(current) if current.id == session => tasks.session.take(),
            _ => None,
        }
    };
    let Some(lost) = lost else {
        return;
    };
    lost.token.cancel();

    // A writer busy in `send` is replaced by the next session instead
    if let Ok(mut writer) = inner.writer.try_lock() {
        writer.take();
    }

    tracing::warn!("Connection to {} lost: {}", inner.config.addr(), reason);
    inner.stats.connected_since.store(0, Ordering::Relaxed);
    inner.set_state(ConnectionState::Disconnected);
    inner.emit(TransportEvent::Disconnected { reason });

    schedule_reconnect(inner);
}

fn schedule_reconnect(inner: &Arc<Inner>) {
    let mut tasks = inner.tasks();
    if tasks.lifecycle.is_cancelled() {
        return;
    }
    if inner.config.reconnect.max_attempts == 0 {
        tracing::warn!("Automatic reconnect disabled");
        return;
    }
    if tasks.reconnect_active {
        tasks.reconnect_requested = true;
        return;
    }

    tasks.reconnect_active = true;
    let lifecycle = tasks.lifecycle.clone();
    tasks.reconnect = Some(tokio::spawn(reconnect_loop(inner.clone(), lifecycle)));
}

async fn reconnect_loop(inner: Arc<Inner>, lifecycle: CancellationToken) {
    let policy = inner.config.reconnect.clone();

    loop {
        if !reconnect_attempts(&inner, &policy, &lifecycle).await {
            tracing::error!(
                "Giving up on {} after {} reconnect attempts",
                inner.config.addr(),
                policy.max_attempts
            );
            inner.set_state(ConnectionState::Disconnected);
            inner.emit(TransportEvent::ReconnectFailed {
                attempts: policy.max_attempts,
            });
        }

        // A loss reported while we were finishing restarts the loop
        let mut tasks = inner.tasks();
        if tasks.reconnect_requested && !lifecycle.is_cancelled() {
            tasks.reconnect_requested = false;
            continue;
        }
        tasks.reconnect_active = false;
        return;
    }
}

/// Returns `false` when every attempt failed
async fn reconnect_attempts(
    inner: &Arc<Inner>,
    policy: &ReconnectPolicy,
    lifecycle: &CancellationToken,
) -> bool {
    for attempt in 1..=policy.max_attempts {
        if lifecycle.is_cancelled() || inner.state() == ConnectionState::Connected {
            return true;
        }

        inner.set_state(ConnectionState::Reconnecting);
        inner.stats.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
        inner.emit(TransportEvent::ReconnectAttempt {
            attempt,
            max_attempts: policy.max_attempts,
        });
        tracing::info!(
            "Reconnect attempt {}/{} to {}",
            attempt,
            policy.max_attempts,
            inner.config.addr()
        );

        match establish(inner, ConnectionState::Reconnecting).await {
            Ok(()) => {
                inner.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                tracing::info!("Reconnected after {} attempt(s)", attempt);
                return true;
            }
            Err(ProtocolError::Cancelled) => return true,
            Err(e) => {
                let next_delay = (attempt < policy.max_attempts).then(|| policy.delay_after(attempt));
                tracing::warn!("Reconnect attempt {} failed: {}", attempt, e);
                inner.emit(TransportEvent::ReconnectAttemptFailed {
                    attempt,
                    error: e.to_string(),
                    next_delay_ms: next_delay.map(|d| d.as_millis() as u64),
                });

                if let Some(delay) = next_delay {
                    tokio::select! {
                        _ = lifecycle.cancelled() => return true,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
    false
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
