//! Async hub client: control commands upstream, envelope stream down.
//!
//! The client never publishes; it identifies itself, manages
//! subscriptions and receives application messages on a bounded inbox
//! channel. A dropped connection is re-established by the reader task
//! itself, which replays the desired state (identity, subscriptions,
//! receive mode) with raw sends, since nobody else is around to consume
//! the acknowledgements while the reader is busy reconnecting.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::core::command::{
    encode_command_frame, new_add, new_bye, new_id, new_remove, new_start_receive,
    new_stop_receive, ClientCommand, RequestIds,
};
use crate::core::error::{HubError, SendError};
use crate::core::frame::try_decode_frame;
use crate::core::message::{current_timestamp, decode_message, ClientId, Message, MessageKind};
use crate::core::subscription::{KeyFilter, SubscriptionTable};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub addr: String,
    /// Identity announced on connect and on every reconnect.
    pub identifier: Option<ClientId>,
    /// Zero skips waiting for command acknowledgements.
    pub ack_timeout: Duration,
    pub inbox_capacity: usize,
    /// Zero disables reconnection.
    pub reconnect_count: u32,
    pub reconnect_interval: Duration,
    /// Catch-up overlap subtracted from the last received timestamp.
    pub reconnect_buffer: Duration,
}

impl ClientOptions {
    pub fn new(addr: impl Into<String>) -> Self {
        Self::from_config(addr, &ClientConfig::default())
    }

    pub fn from_config(addr: impl Into<String>, config: &ClientConfig) -> Self {
        Self {
            addr: addr.into(),
            identifier: None,
            ack_timeout: Duration::from_millis(config.ack_timeout_ms),
            inbox_capacity: config.inbox_capacity,
            reconnect_count: config.reconnect_count,
            reconnect_interval: Duration::from_millis(config.reconnect_interval_ms),
            reconnect_buffer: Duration::from_millis(config.reconnect_buffer_ms),
        }
    }

    pub fn with_identifier(mut self, client: impl Into<ClientId>) -> Self {
        self.identifier = Some(client.into());
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn without_reconnect(mut self) -> Self {
        self.reconnect_count = 0;
        self
    }
}

struct ClientShared {
    options: ClientOptions,
    write: AsyncMutex<Option<OwnedWriteHalf>>,
    request_ids: RequestIds,
    pending: DashMap<i16, oneshot::Sender<()>>,
    /// Desired state replayed after a reconnect.
    identifier: Mutex<Option<ClientId>>,
    subscriptions: Mutex<SubscriptionTable>,
    receiving: AtomicBool,
    /// Send stamp of the newest received application message; 0 = never.
    last_received_ms: AtomicU64,
    closing: AtomicBool,
    server_closed: AtomicBool,
    reconnecting: AtomicBool,
}

impl ClientShared {
    async fn send_raw(&self, cmd: &ClientCommand) -> Result<(), HubError> {
        let frame = encode_command_frame(cmd)?;
        let mut guard = self.write.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(HubError::Closed);
        };
        writer
            .write_all(&frame)
            .await
            .map_err(|err| HubError::Send(SendError::Io(err)))?;
        writer
            .flush()
            .await
            .map_err(|err| HubError::Send(SendError::Io(err)))?;
        Ok(())
    }

    /// Transmit a command and, unless acknowledgements are disabled, hand
    /// back the wait for the echo. A `None` means nothing to wait on.
    async fn transmit(
        &self,
        cmd: &ClientCommand,
    ) -> Result<Option<oneshot::Receiver<()>>, HubError> {
        if self.options.ack_timeout.is_zero() {
            self.send_raw(cmd).await?;
            return Ok(None);
        }

        let (tx, rx) = oneshot::channel();
        self.pending.insert(cmd.request_id, tx);
        if let Err(err) = self.send_raw(cmd).await {
            self.pending.remove(&cmd.request_id);
            return Err(err);
        }
        Ok(Some(rx))
    }

    async fn await_ack(
        &self,
        request_id: i16,
        ack: Option<oneshot::Receiver<()>>,
    ) -> Result<(), HubError> {
        let Some(rx) = ack else {
            return Ok(());
        };
        match tokio::time::timeout(self.options.ack_timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            // The reader dropped our waiter: orderly close, or the
            // connection died under the wait.
            Ok(Err(_)) => {
                self.pending.remove(&request_id);
                if self.closing.load(Ordering::SeqCst) || self.server_closed.load(Ordering::SeqCst)
                {
                    Err(HubError::Closed)
                } else {
                    Err(HubError::Communicate(
                        "connection lost while awaiting acknowledgement".into(),
                    ))
                }
            }
            Err(_) => {
                self.pending.remove(&request_id);
                Err(HubError::Send(SendError::AckTimeout(
                    self.options.ack_timeout,
                )))
            }
        }
    }

    /// Send and, unless acknowledgements are disabled, wait for the echo.
    async fn send_command(&self, cmd: ClientCommand) -> Result<(), HubError> {
        let ack = self.transmit(&cmd).await?;
        self.await_ack(cmd.request_id, ack).await
    }

    /// Re-announce identity, subscriptions and receive mode after a
    /// reconnect. Raw sends only; the stray acks are ignored on arrival.
    async fn replay_state(&self) -> Result<(), HubError> {
        let identifier = self.identifier.lock().clone();
        if let Some(client) = identifier {
            self.send_raw(&new_id(self.request_ids.next(), client.as_str()))
                .await?;
        }

        let rows = self.subscriptions.lock().snapshot();
        for (subject, filters) in rows {
            let keys = resubscribe_keys(&filters);
            self.send_raw(&new_add(self.request_ids.next(), subject, keys))
                .await?;
        }

        if self.receiving.load(Ordering::SeqCst) {
            let last = self.last_received_ms.load(Ordering::Relaxed);
            let buffer = self.options.reconnect_buffer.as_millis() as u64;
            // Nothing received yet means nothing to catch up on.
            let from_ms = (last > 0).then(|| last.saturating_sub(buffer));
            self.send_raw(&new_start_receive(self.request_ids.next(), from_ms))
                .await?;
        }
        Ok(())
    }
}

/// What a subject row replays as: the wildcard swallows keyed filters.
fn resubscribe_keys(filters: &[KeyFilter]) -> Option<Vec<String>> {
    if filters.iter().any(|f| matches!(f, KeyFilter::Any)) {
        return None;
    }
    Some(
        filters
            .iter()
            .filter_map(|f| match f {
                KeyFilter::Any => None,
                KeyFilter::Key(key) => Some(key.clone()),
            })
            .collect(),
    )
}

pub struct HubClient {
    shared: Arc<ClientShared>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl HubClient {
    /// Connect and return the client plus the application-message inbox.
    /// The inbox is bounded; a full inbox stalls envelope reading until
    /// the embedder drains it.
    pub async fn connect(
        options: ClientOptions,
    ) -> Result<(Self, mpsc::Receiver<Message>), HubError> {
        let stream = TcpStream::connect(&options.addr)
            .await
            .map_err(HubError::Connect)?;
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();

        let (inbox_tx, inbox_rx) = mpsc::channel(options.inbox_capacity.max(1));
        // Every connection identifies itself; callers that do not care
        // get a generated identity.
        let identifier = Some(
            options
                .identifier
                .clone()
                .unwrap_or_else(|| ClientId::from(Uuid::new_v4().to_string())),
        );
        let shared = Arc::new(ClientShared {
            options,
            write: AsyncMutex::new(Some(writer)),
            request_ids: RequestIds::new(),
            pending: DashMap::new(),
            identifier: Mutex::new(identifier),
            subscriptions: Mutex::new(SubscriptionTable::new()),
            receiving: AtomicBool::new(false),
            last_received_ms: AtomicU64::new(0),
            closing: AtomicBool::new(false),
            server_closed: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
        });

        let handle = tokio::spawn(read_loop(shared.clone(), reader, inbox_tx));
        let client = Self {
            shared,
            reader_task: Mutex::new(Some(handle)),
        };

        let announced = client.shared.identifier.lock().clone();
        if let Some(client_id) = announced {
            client
                .shared
                .send_command(new_id(
                    client.shared.request_ids.next(),
                    client_id.as_str(),
                ))
                .await?;
        }
        Ok((client, inbox_rx))
    }

    /// Bind (or re-bind) this connection's public identity.
    pub async fn identify(&self, client: impl Into<ClientId>) -> Result<(), HubError> {
        let client = client.into();
        let cmd = new_id(self.shared.request_ids.next(), client.as_str());
        let ack = self.shared.transmit(&cmd).await?;
        *self.shared.identifier.lock() = Some(client);
        self.shared.await_ack(cmd.request_id, ack).await
    }

    /// Subscribe to a subject; `None` keys is the wildcard filter.
    ///
    /// The local table mirrors the change once the command is on the
    /// wire, whether or not the hub's acknowledgement arrives. A failed
    /// send leaves the mirror untouched.
    pub async fn subscribe(
        &self,
        subject: impl Into<String>,
        keys: Option<Vec<String>>,
    ) -> Result<(), HubError> {
        let subject = subject.into();
        let cmd = new_add(self.shared.request_ids.next(), subject.clone(), keys.clone());
        let ack = self.shared.transmit(&cmd).await?;
        self.shared
            .subscriptions
            .lock()
            .add(&subject, keys.as_deref());
        self.shared.await_ack(cmd.request_id, ack).await
    }

    /// Drop key filters, or the whole subject when `keys` is `None`.
    /// Mirrors on send success, like [`HubClient::subscribe`].
    pub async fn unsubscribe(
        &self,
        subject: impl Into<String>,
        keys: Option<Vec<String>>,
    ) -> Result<(), HubError> {
        let subject = subject.into();
        let cmd = new_remove(self.shared.request_ids.next(), subject.clone(), keys.clone());
        let ack = self.shared.transmit(&cmd).await?;
        self.shared
            .subscriptions
            .lock()
            .remove(&subject, keys.as_deref());
        self.shared.await_ack(cmd.request_id, ack).await
    }

    /// Begin receiving envelopes. `from_ms` asks the hub to replay its
    /// cached backlog from that send timestamp first.
    pub async fn start_receive(&self, from_ms: Option<u64>) -> Result<(), HubError> {
        let cmd = new_start_receive(self.shared.request_ids.next(), from_ms);
        let ack = self.shared.transmit(&cmd).await?;
        self.shared.receiving.store(true, Ordering::SeqCst);
        self.shared.await_ack(cmd.request_id, ack).await
    }

    /// Pause delivery; subscriptions stay in place.
    pub async fn stop_receive(&self) -> Result<(), HubError> {
        let cmd = new_stop_receive(self.shared.request_ids.next());
        let ack = self.shared.transmit(&cmd).await?;
        self.shared.receiving.store(false, Ordering::SeqCst);
        self.shared.await_ack(cmd.request_id, ack).await
    }

    /// Subjects this client currently wants, sorted.
    pub fn subjects(&self) -> Vec<String> {
        self.shared.subscriptions.lock().subjects()
    }

    /// Send stamp of the newest received application message.
    pub fn last_received_ms(&self) -> Option<u64> {
        let last = self.shared.last_received_ms.load(Ordering::Relaxed);
        (last > 0).then_some(last)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closing.load(Ordering::SeqCst)
            || self.shared.server_closed.load(Ordering::SeqCst)
    }

    /// Ack waits still outstanding; zero once every send has settled.
    pub fn pending_acks(&self) -> usize {
        self.shared.pending.len()
    }

    /// Orderly goodbye: fire-and-forget `Bye`, drop the writer, cancel
    /// outstanding ack waits and stop the reader. Idempotent.
    pub async fn close(&self) {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let bye = new_bye(self.shared.request_ids.next());
        if let Err(err) = self.shared.send_raw(&bye).await {
            debug!(error = %err, "bye not sent");
        }
        *self.shared.write.lock().await = None;
        self.shared.pending.clear();
        if let Some(handle) = self.reader_task.lock().take() {
            handle.abort();
        }
        info!("client closed");
    }
}

impl Drop for HubClient {
    fn drop(&mut self) {
        if let Some(handle) = self.reader_task.lock().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for HubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubClient")
            .field("addr", &self.shared.options.addr)
            .field("identifier", &self.shared.identifier.lock().clone())
            .field("closed", &self.is_closed())
            .finish()
    }
}

enum ReadOutcome {
    /// Connection dropped out from under us.
    Lost,
    /// The hub announced an orderly close; do not reconnect.
    ServerClosed,
    /// The embedder dropped the inbox receiver.
    InboxGone,
}

async fn read_loop(shared: Arc<ClientShared>, mut reader: OwnedReadHalf, inbox: mpsc::Sender<Message>) {
    let mut buf = BytesMut::with_capacity(4 * 1024);
    'conn: loop {
        let outcome = 'read: loop {
            match reader.read_buf(&mut buf).await {
                Ok(0) => break 'read ReadOutcome::Lost,
                Ok(_) => loop {
                    match try_decode_frame(&mut buf) {
                        Ok(Some(frame)) => match decode_message(&frame) {
                            Ok(mut msg) => match msg.kind {
                                MessageKind::ServerResponse => {
                                    if let Some((_, tx)) = shared.pending.remove(&msg.request_id) {
                                        let _ = tx.send(());
                                    }
                                }
                                MessageKind::ServerClose => {
                                    info!("hub closed the connection");
                                    shared.server_closed.store(true, Ordering::SeqCst);
                                    break 'read ReadOutcome::ServerClosed;
                                }
                                MessageKind::Application => {
                                    msg.received_at_ms = current_timestamp();
                                    shared
                                        .last_received_ms
                                        .store(msg.sent_at_ms, Ordering::Relaxed);
                                    if inbox.send(msg).await.is_err() {
                                        break 'read ReadOutcome::InboxGone;
                                    }
                                }
                            },
                            Err(err) => {
                                warn!(error = %err, "bad envelope");
                                break 'read ReadOutcome::Lost;
                            }
                        },
                        Ok(None) => break,
                        Err(err) => {
                            warn!(error = %err, "bad frame");
                            break 'read ReadOutcome::Lost;
                        }
                    }
                },
                Err(err) => {
                    debug!(error = %err, "read failed");
                    break 'read ReadOutcome::Lost;
                }
            }
        };

        match outcome {
            ReadOutcome::Lost if !shared.closing.load(Ordering::SeqCst) => {
                match reconnect(&shared).await {
                    Some(new_reader) => {
                        reader = new_reader;
                        buf.clear();
                        continue 'conn;
                    }
                    None => break 'conn,
                }
            }
            _ => break 'conn,
        }
    }

    // Outstanding ack waits fail fast once the reader is gone.
    shared.pending.clear();
    debug!("client reader exiting");
}

/// Dial the hub again, install the new writer and replay desired state.
/// Single-flight: a second caller backs off immediately.
async fn reconnect(shared: &Arc<ClientShared>) -> Option<OwnedReadHalf> {
    if shared.options.reconnect_count == 0 {
        return None;
    }
    if shared.reconnecting.swap(true, Ordering::SeqCst) {
        return None;
    }

    let mut restored = None;
    for attempt in 1..=shared.options.reconnect_count {
        if shared.closing.load(Ordering::SeqCst) {
            break;
        }
        // The interval spaces retries; the first redial goes out at once.
        if attempt > 1 {
            tokio::time::sleep(shared.options.reconnect_interval).await;
        }
        match TcpStream::connect(&shared.options.addr).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                let (reader, writer) = stream.into_split();
                *shared.write.lock().await = Some(writer);
                match shared.replay_state().await {
                    Ok(()) => {
                        info!(attempt, "reconnected");
                        restored = Some(reader);
                        break;
                    }
                    Err(err) => {
                        warn!(attempt, error = %err, "state replay failed");
                        *shared.write.lock().await = None;
                    }
                }
            }
            Err(err) => {
                warn!(attempt, error = %err, "reconnect attempt failed");
            }
        }
    }

    shared.reconnecting.store(false, Ordering::SeqCst);
    if restored.is_none() {
        warn!("reconnect attempts exhausted");
    }
    restored
}
