//! Per-connection session state and the outbox seam.
//!
//! A session never touches its socket directly: frames go through an
//! [`Outbox`], which is either a per-session writer task (spawned
//! transport) or a handle into the mio loop (polled transport).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use crate::config::BatchConfig;
use crate::core::cache::ReplayCache;
use crate::core::error::SendError;
use crate::core::message::{encode_message_frame, ClientId, SubjectMap};
use crate::core::subscription::{KeyFilter, SubscriptionTable};
use crate::dispatch::worker::SendTarget;

pub type SessionId = u64;

/// Where a session's outbound frames go.
pub trait Outbox: Send + Sync {
    fn forward(&self, frame: Bytes) -> Result<(), SendError>;
    fn close(&self);
}

#[derive(Debug, Default)]
struct SessionCounters {
    sent: AtomicU64,
    sent_bytes: AtomicU64,
    send_micros: AtomicU64,
}

/// Point-in-time counter snapshot for the management surface.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SessionStats {
    pub sent: u64,
    pub sent_bytes: u64,
    pub send_micros: u64,
}

impl SessionStats {
    pub fn avg_send_micros(&self) -> f64 {
        if self.sent == 0 {
            0.0
        } else {
            self.send_micros as f64 / self.sent as f64
        }
    }

    pub fn avg_bytes(&self) -> f64 {
        if self.sent == 0 {
            0.0
        } else {
            self.sent_bytes as f64 / self.sent as f64
        }
    }

    pub fn merge(&mut self, other: &SessionStats) {
        self.sent += other.sent;
        self.sent_bytes += other.sent_bytes;
        self.send_micros += other.send_micros;
    }
}

pub struct ClientSession {
    id: SessionId,
    peer: SocketAddr,
    client_id: RwLock<Option<ClientId>>,
    enabled: AtomicBool,
    receiving: AtomicBool,
    closing: AtomicBool,
    subscriptions: RwLock<SubscriptionTable>,
    counters: SessionCounters,
    /// Serialises replay batches against live fan-out.
    send_gate: Mutex<()>,
    outbox: Box<dyn Outbox>,
}

impl ClientSession {
    pub fn new(id: SessionId, peer: SocketAddr, outbox: Box<dyn Outbox>, enabled: bool) -> Self {
        Self {
            id,
            peer,
            client_id: RwLock::new(None),
            enabled: AtomicBool::new(enabled),
            receiving: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            subscriptions: RwLock::new(SubscriptionTable::new()),
            counters: SessionCounters::default(),
            send_gate: Mutex::new(()),
            outbox,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn client(&self) -> Option<ClientId> {
        self.client_id.read().clone()
    }

    pub fn bind_client(&self, client: ClientId) -> Option<ClientId> {
        self.client_id.write().replace(client)
    }

    /// Sticky-routing key: the bound client id, or a session-local tag.
    pub fn sticky_key(&self) -> ClientId {
        self.client()
            .unwrap_or_else(|| ClientId::from(format!("#{}", self.id)))
    }

    /// Log label: bound client id, or the session id and peer address.
    pub fn display_label(&self) -> String {
        match self.client() {
            Some(client) => client.to_string(),
            None => format!("session-{}@{}", self.id, self.peer),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_receiving(&self) -> bool {
        self.receiving.load(Ordering::Relaxed)
    }

    /// Returns the previous value.
    pub fn set_receiving(&self, receiving: bool) -> bool {
        self.receiving.swap(receiving, Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Relaxed)
    }

    pub fn add_subscriptions(&self, subject: &str, keys: Option<&[String]>) -> Vec<KeyFilter> {
        self.subscriptions.write().add(subject, keys)
    }

    pub fn remove_subscriptions(&self, subject: &str, keys: Option<&[String]>) -> Vec<KeyFilter> {
        self.subscriptions.write().remove(subject, keys)
    }

    pub fn matches(&self, subjects: &SubjectMap) -> bool {
        self.subscriptions.read().matches(subjects)
    }

    pub fn subjects(&self) -> Vec<String> {
        self.subscriptions.read().subjects()
    }

    pub fn subscription_snapshot(&self) -> Vec<(String, Vec<KeyFilter>)> {
        self.subscriptions.read().snapshot()
    }

    /// True when the destination filter admits this session.
    pub fn accepts_destinations(&self, destinations: &[ClientId]) -> bool {
        if destinations.is_empty() {
            return true;
        }
        match self.client() {
            Some(client) => destinations.contains(&client),
            None => false,
        }
    }

    /// Hand one frame to the outbox. Counters update only on success.
    pub fn forward(&self, frame: Bytes) -> Result<(), SendError> {
        let _gate = self.send_gate.lock();
        self.forward_locked(frame)
    }

    /// Flip the session into receiving state and, when a resume point is
    /// given, replay the cached backlog that matches this session's
    /// current subscriptions and destination filters. The whole batch
    /// runs under one gate hold, so live fan-out cannot interleave with
    /// it, and the cache snapshot is taken with the gate already held.
    ///
    /// Returns whether the session was already receiving.
    pub fn start_receiving(&self, replay: Option<(u64, &ReplayCache)>) -> Result<bool, SendError> {
        let _gate = self.send_gate.lock();
        let was_receiving = self.receiving.swap(true, Ordering::Relaxed);
        if let Some((from_ms, cache)) = replay {
            let backlog = cache.replay_from(from_ms);
            if !backlog.is_empty() {
                debug!(
                    session = self.id,
                    from_ms,
                    messages = backlog.len(),
                    "replaying backlog"
                );
            }
            for message in backlog {
                if !self.matches(&message.subjects)
                    || !self.accepts_destinations(&message.destinations)
                {
                    continue;
                }
                match encode_message_frame(&message) {
                    Ok(frame) => self.forward_locked(frame)?,
                    Err(err) => {
                        warn!(session = self.id, error = %err, "dropping unencodable cached message")
                    }
                }
            }
        }
        Ok(was_receiving)
    }

    fn forward_locked(&self, frame: Bytes) -> Result<(), SendError> {
        if self.is_closed() {
            return Err(SendError::SessionClosed);
        }
        let len = frame.len() as u64;
        let started = Instant::now();
        self.outbox.forward(frame)?;
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        self.counters.sent_bytes.fetch_add(len, Ordering::Relaxed);
        self.counters
            .send_micros
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        Ok(())
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            sent_bytes: self.counters.sent_bytes.load(Ordering::Relaxed),
            send_micros: self.counters.send_micros.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        self.counters.sent.store(0, Ordering::Relaxed);
        self.counters.sent_bytes.store(0, Ordering::Relaxed);
        self.counters.send_micros.store(0, Ordering::Relaxed);
    }

    /// Idempotent: the first caller closes the outbox, later calls return.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.outbox.close();
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("client", &self.client())
            .field("enabled", &self.is_enabled())
            .field("receiving", &self.is_receiving())
            .finish()
    }
}

impl SendTarget for ClientSession {
    fn forward(&self, frame: Bytes) -> Result<(), SendError> {
        ClientSession::forward(self, frame)
    }

    fn label(&self) -> String {
        self.display_label()
    }
}

/// Outbox backed by a per-session tokio writer task.
pub struct TaskOutbox {
    frames: Mutex<Option<flume::Sender<Bytes>>>,
    failed: Arc<AtomicBool>,
}

impl TaskOutbox {
    /// Spawn the writer task owning `writer` and return the outbox handle.
    pub fn new<W>(writer: W, batch: BatchConfig, capacity: usize) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = flume::bounded(capacity.max(1));
        let failed = Arc::new(AtomicBool::new(false));
        let handle = spawn_session_writer(writer, rx, failed.clone(), batch);
        (
            Self {
                frames: Mutex::new(Some(tx)),
                failed,
            },
            handle,
        )
    }
}

impl Outbox for TaskOutbox {
    fn forward(&self, frame: Bytes) -> Result<(), SendError> {
        if self.failed.load(Ordering::Relaxed) {
            return Err(SendError::SessionClosed);
        }
        let guard = self.frames.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(SendError::SessionClosed);
        };
        tx.try_send(frame).map_err(|err| match err {
            flume::TrySendError::Full(_) => SendError::Backpressure,
            flume::TrySendError::Disconnected(_) => SendError::SessionClosed,
        })
    }

    /// Dropping the sender lets the writer drain buffered frames, then exit.
    fn close(&self) {
        self.frames.lock().take();
    }
}

/// Writer task: drains the outbox channel into the socket, batching frames
/// until `max_bytes` is buffered or the buffer ages past `max_delay`. The
/// flush tick doubles as the idle-buffer checker, so an aged buffer is
/// written out even when no new frame arrives.
pub fn spawn_session_writer<W>(
    mut writer: W,
    frames: flume::Receiver<Bytes>,
    failed: Arc<AtomicBool>,
    batch: BatchConfig,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(batch.max_bytes.clamp(1024, 64 * 1024));
        let mut first_at: Option<Instant> = None;
        let mut tick = tokio::time::interval(batch.max_delay());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                received = frames.recv_async() => {
                    match received {
                        Ok(frame) => {
                            if !batch.enabled {
                                if write_now(&mut writer, &frame).await.is_err() {
                                    failed.store(true, Ordering::Relaxed);
                                    break;
                                }
                                continue;
                            }
                            if buf.is_empty() {
                                first_at = Some(Instant::now());
                            }
                            buf.extend_from_slice(&frame);
                            // Coalesce whatever else is already queued.
                            while buf.len() < batch.max_bytes {
                                match frames.try_recv() {
                                    Ok(frame) => buf.extend_from_slice(&frame),
                                    Err(_) => break,
                                }
                            }
                            if buf.len() >= batch.max_bytes {
                                if flush_buffer(&mut writer, &mut buf).await.is_err() {
                                    failed.store(true, Ordering::Relaxed);
                                    break;
                                }
                                first_at = None;
                            }
                        }
                        // Outbox closed: drain what is buffered and stop.
                        Err(_) => {
                            let _ = flush_buffer(&mut writer, &mut buf).await;
                            break;
                        }
                    }
                }
                _ = tick.tick() => {
                    if first_at.is_some_and(|t| t.elapsed() >= batch.max_delay()) {
                        if flush_buffer(&mut writer, &mut buf).await.is_err() {
                            failed.store(true, Ordering::Relaxed);
                            break;
                        }
                        first_at = None;
                    }
                }
            }
        }

        trace!("session writer exiting");
        let _ = writer.shutdown().await;
    })
}

async fn write_now<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Bytes) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

async fn flush_buffer<W: AsyncWrite + Unpin>(
    writer: &mut W,
    buf: &mut BytesMut,
) -> std::io::Result<()> {
    if buf.is_empty() {
        return Ok(());
    }
    writer.write_all(buf).await?;
    writer.flush().await?;
    buf.clear();
    Ok(())
}
