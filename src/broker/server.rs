//! The hub engine: listener, command handling and the publish path.
//!
//! The engine is embedding-first. Applications construct a [`Hub`], call
//! [`Hub::start`] to open the listener, and push messages through
//! [`Hub::publish`]; connected processes only ever send control commands
//! upstream. Envelope traffic flows downstream exclusively.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::broker::fanout::{collect_candidates, Dispatcher};
use crate::broker::poller::Poller;
use crate::broker::registry::{DisableRule, SessionRegistry};
use crate::broker::session::{ClientSession, SessionId, SessionStats, TaskOutbox};
use crate::config::{Config, DeliveryStrategy, Transport};
use crate::core::cache::ReplayCache;
use crate::core::command::{decode_command, ClientCommand, Control};
use crate::core::error::HubError;
use crate::core::frame::try_decode_frame;
use crate::core::message::{current_timestamp, encode_message_frame, ClientId, Message, SubjectMap};
use crate::core::pool::MessagePool;
use crate::core::subscription::KeyFilter;

/// Cap on recycled envelopes kept between publishes.
const POOLED_ENVELOPES: usize = 1024;

/// State changes the engine announces to embedding code.
#[derive(Debug, Clone)]
pub enum HubEvent {
    SessionOpened {
        session: SessionId,
        peer: SocketAddr,
    },
    ClientIdentified {
        session: SessionId,
        client: ClientId,
    },
    SubscriptionAdded {
        session: SessionId,
        subject: String,
        keys: Vec<KeyFilter>,
    },
    SubscriptionRemoved {
        session: SessionId,
        subject: String,
        keys: Vec<KeyFilter>,
    },
    ReceiveStarted {
        session: SessionId,
        /// Resume point the delivery picks up from. A start without an
        /// explicit timestamp resolves to the moment it was applied.
        from_ms: u64,
    },
    ReceiveStopped {
        session: SessionId,
    },
    SessionClosed {
        session: SessionId,
        client: Option<ClientId>,
    },
}

/// Management snapshot of one connected session.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub session: SessionId,
    pub peer: SocketAddr,
    pub client: Option<ClientId>,
    pub enabled: bool,
    pub receiving: bool,
    pub subjects: Vec<String>,
    pub stats: SessionStats,
}

/// Engine-wide counters for the management surface.
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    pub sessions: usize,
    pub totals: SessionStats,
    pub cached_messages: usize,
    /// Per-worker dispatch queue depths; empty under the direct strategy.
    pub queue_depths: Vec<usize>,
    pub sticky_bindings: usize,
    /// Recycled envelopes waiting in this hub's message pool.
    pub pooled_messages: usize,
}

pub struct Hub {
    config: Config,
    registry: Arc<SessionRegistry>,
    pool: Arc<MessagePool>,
    cache: Arc<ReplayCache>,
    dispatcher: Dispatcher,
    events: broadcast::Sender<HubEvent>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    housekeeping_task: Mutex<Option<JoinHandle<()>>>,
    poller: Mutex<Option<Poller>>,
    local_addr: RwLock<Option<SocketAddr>>,
    open_connections: AtomicUsize,
    started: AtomicBool,
    stopping: AtomicBool,
}

impl Hub {
    pub fn new(config: Config) -> Arc<Self> {
        let pool = Arc::new(MessagePool::new(POOLED_ENVELOPES));
        let cache = Arc::new(ReplayCache::with_pool(
            config.cache.retention(),
            pool.clone(),
        ));
        let dispatcher = Dispatcher::new(&config.delivery, &config.server, cache.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events, _) = broadcast::channel(256);

        Arc::new(Self {
            config,
            registry: Arc::new(SessionRegistry::new()),
            pool,
            cache,
            dispatcher,
            events,
            shutdown_tx,
            shutdown_rx,
            accept_task: Mutex::new(None),
            housekeeping_task: Mutex::new(None),
            poller: Mutex::new(None),
            local_addr: RwLock::new(None),
            open_connections: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Bound listener address, available once [`Hub::start`] returns.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    /// Open the listener and begin accepting connections. Binding to
    /// port 0 picks an ephemeral port; the bound address is returned.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<SocketAddr> {
        if self.started.swap(true, Ordering::SeqCst) {
            anyhow::bail!("hub already started");
        }

        let local = match self.config.server.transport {
            Transport::Spawned => {
                let listener = TcpListener::bind(&self.config.server.bind_addr)
                    .await
                    .with_context(|| {
                        format!("binding hub listener on {}", self.config.server.bind_addr)
                    })?;
                let local = listener.local_addr().context("resolving listener address")?;
                let handle = tokio::spawn(accept_loop(
                    self.clone(),
                    listener,
                    self.shutdown_rx.clone(),
                ));
                *self.accept_task.lock() = Some(handle);
                local
            }
            Transport::Polled => {
                let poller = Poller::start(self.clone(), &self.config.server.bind_addr)
                    .with_context(|| {
                        format!("starting poller on {}", self.config.server.bind_addr)
                    })?;
                let local = poller.local_addr();
                *self.poller.lock() = Some(poller);
                local
            }
        };
        *self.local_addr.write() = Some(local);

        if self.config.delivery.strategy == DeliveryStrategy::Sticky {
            let handle = tokio::spawn(sticky_housekeeping(self.clone(), self.shutdown_rx.clone()));
            *self.housekeeping_task.lock() = Some(handle);
        }

        info!(
            addr = %local,
            transport = ?self.config.server.transport,
            strategy = ?self.config.delivery.strategy,
            "hub listening"
        );
        Ok(local)
    }

    /// Application envelope drawn from this hub's message pool. Envelopes
    /// published through [`Hub::publish`] return to the pool once their
    /// replay-cache retention expires.
    pub fn create_message(&self, subjects: SubjectMap, payload: impl Into<Bytes>) -> Message {
        let mut message = self.pool.acquire();
        message.subjects = subjects;
        message.payload = payload.into();
        message
    }

    /// Fan a message out to every matching receiving session and append
    /// it to the replay cache. The send timestamp is stamped here.
    pub async fn publish(&self, mut message: Message) -> Result<(), HubError> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(HubError::Closed);
        }
        message.sent_at_ms = current_timestamp();
        let message = Arc::new(message);
        let candidates = collect_candidates(&self.registry, &message);
        trace!(candidates = candidates.len(), "publishing");
        self.dispatcher.dispatch(message, candidates).await
    }

    pub fn events(&self) -> broadcast::Receiver<HubEvent> {
        self.events.subscribe()
    }

    /// Sessions currently connected, ordered by session id.
    pub fn clients(&self) -> Vec<ClientInfo> {
        let mut infos: Vec<ClientInfo> = self
            .registry
            .snapshot()
            .iter()
            .map(|session| ClientInfo {
                session: session.id(),
                peer: session.peer(),
                client: session.client(),
                enabled: session.is_enabled(),
                receiving: session.is_receiving(),
                subjects: session.subjects(),
                stats: session.stats(),
            })
            .collect();
        infos.sort_by_key(|info| info.session);
        infos
    }

    /// Sessions currently eligible for delivery.
    pub fn enabled_clients(&self) -> Vec<ClientInfo> {
        let mut infos = self.clients();
        infos.retain(|info| info.enabled);
        infos
    }

    /// Sessions suppressed by a disable rule.
    pub fn disabled_clients(&self) -> Vec<ClientInfo> {
        let mut infos = self.clients();
        infos.retain(|info| !info.enabled);
        infos
    }

    /// Subjects held by the session bound to `client`, if connected.
    pub fn subjects_of(&self, client: &ClientId) -> Option<Vec<String>> {
        self.registry
            .by_client(client)
            .map(|session| session.subjects())
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            sessions: self.registry.len(),
            totals: self.registry.total_stats(),
            cached_messages: self.cache.len(),
            queue_depths: self.dispatcher.queue_depths().unwrap_or_default(),
            sticky_bindings: self.dispatcher.sticky_bindings(),
            pooled_messages: self.pool.len(),
        }
    }

    /// Zeroes every session's send counters.
    pub fn reset_stats(&self) {
        self.registry.reset_stats();
    }

    /// Suppress envelope delivery to `addr`; port 0 covers every port.
    /// Disabled sessions stay connected and keep processing commands.
    pub fn disable_sends(&self, addr: IpAddr, port: u16) {
        self.registry.disable(addr, port);
    }

    pub fn enable_sends(&self, addr: IpAddr, port: u16) {
        self.registry.enable(addr, port);
    }

    pub fn disabled_rules(&self) -> Vec<DisableRule> {
        self.registry.disabled_rules()
    }

    /// Drop the session bound to `client`, if any.
    pub fn disconnect_client(&self, client: &ClientId) -> bool {
        match self.registry.by_client(client) {
            Some(session) => {
                info!(%client, session = session.id(), "disconnecting client");
                self.teardown_session(&session);
                true
            }
            None => false,
        }
    }

    /// Stop accepting, notify every session with a `ServerClose` envelope,
    /// close the sessions and join the background tasks. Idempotent.
    pub async fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("hub stopping");

        // Queue the close notice on every outbox before anything can tear
        // the sessions down; outboxes drain queued frames on close.
        let mut close = Message::server_close();
        close.sent_at_ms = current_timestamp();
        if let Ok(frame) = encode_message_frame(&close) {
            for session in self.registry.snapshot() {
                if let Err(err) = session.forward(frame.clone()) {
                    debug!(session = session.id(), error = %err, "close notice not delivered");
                }
            }
        }

        let _ = self.shutdown_tx.send(true);
        for session in self.registry.snapshot() {
            self.teardown_session(&session);
        }

        // Thread joins happen off the runtime so a shutdown on a
        // single-threaded runtime cannot stall its only worker.
        if let Some(poller) = self.poller.lock().take() {
            let _ = tokio::task::spawn_blocking(move || poller.shutdown()).await;
        }
        if let Some(handle) = self.accept_task.lock().take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.housekeeping_task.lock().take() {
            let _ = handle.await;
        }
        if let Some(pool) = self.dispatcher.worker_pool() {
            let _ = tokio::task::spawn_blocking(move || pool.shutdown()).await;
        }
        info!("hub stopped");
    }

    pub(crate) fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub(crate) fn emit(&self, event: HubEvent) {
        let _ = self.events.send(event);
    }

    /// Reserve a connection slot; refused once `max_connections` is hit.
    pub(crate) fn admit_connection(&self) -> bool {
        let limit = self.config.server.max_connections;
        self.open_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |open| {
                (open < limit).then_some(open + 1)
            })
            .is_ok()
    }

    pub(crate) fn release_connection(&self) {
        self.open_connections.fetch_sub(1, Ordering::SeqCst);
    }

    /// Apply one decoded command to its session. Returns `false` when the
    /// connection should close. Sync on purpose so both transports can
    /// call it from their read paths.
    pub(crate) fn apply_command(&self, session: &Arc<ClientSession>, cmd: ClientCommand) -> bool {
        let request_id = cmd.request_id;
        match cmd.control {
            Control::Id { identifier } => {
                let client = ClientId::from(identifier);
                self.registry.bind(session.id(), client.clone());
                self.emit(HubEvent::ClientIdentified {
                    session: session.id(),
                    client,
                });
            }
            Control::AddSubscription { subject, keys } => {
                let added = session.add_subscriptions(&subject, keys.as_deref());
                debug!(
                    session = session.id(),
                    subject,
                    added = added.len(),
                    "subscription added"
                );
                if !added.is_empty() {
                    self.emit(HubEvent::SubscriptionAdded {
                        session: session.id(),
                        subject,
                        keys: added,
                    });
                }
            }
            Control::RemoveSubscription { subject, keys } => {
                let removed = session.remove_subscriptions(&subject, keys.as_deref());
                debug!(
                    session = session.id(),
                    subject,
                    removed = removed.len(),
                    "subscription removed"
                );
                if !removed.is_empty() {
                    self.emit(HubEvent::SubscriptionRemoved {
                        session: session.id(),
                        subject,
                        keys: removed,
                    });
                }
            }
            Control::StartReceive { from_ms } => {
                let resolved_from = from_ms.unwrap_or_else(current_timestamp);
                let replay = from_ms.map(|from| (from, self.cache.as_ref()));
                match session.start_receiving(replay) {
                    // Listeners only hear about the transition, not a
                    // repeated start.
                    Ok(false) => self.emit(HubEvent::ReceiveStarted {
                        session: session.id(),
                        from_ms: resolved_from,
                    }),
                    Ok(true) => {}
                    Err(err) => {
                        warn!(session = session.id(), error = %err, "backlog replay failed")
                    }
                }
            }
            Control::StopReceive => {
                session.set_receiving(false);
                self.emit(HubEvent::ReceiveStopped {
                    session: session.id(),
                });
            }
            Control::Bye => {
                debug!(session = session.id(), "bye");
                return false;
            }
        }
        self.acknowledge(session, request_id);
        true
    }

    fn acknowledge(&self, session: &Arc<ClientSession>, request_id: i16) {
        if !self.config.server.ack_responses {
            return;
        }
        let mut ack = Message::server_response(request_id);
        ack.sent_at_ms = current_timestamp();
        match encode_message_frame(&ack) {
            Ok(frame) => {
                if let Err(err) = session.forward(frame) {
                    debug!(session = session.id(), request_id, error = %err, "ack not delivered");
                }
            }
            Err(err) => debug!(request_id, error = %err, "ack encode failed"),
        }
    }

    /// Close and unregister a session. Safe to call more than once; the
    /// closed event fires only for the call that removed it.
    pub(crate) fn teardown_session(&self, session: &Arc<ClientSession>) {
        session.close();
        if self.registry.remove(session.id()).is_some() {
            self.dispatcher.unbind(&session.sticky_key());
            debug!(session = session.id(), "session closed");
            self.emit(HubEvent::SessionClosed {
                session: session.id(),
                client: session.client(),
            });
        }
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("addr", &self.local_addr())
            .field("sessions", &self.registry.len())
            .field("strategy", &self.config.delivery.strategy)
            .finish()
    }
}

async fn accept_loop(hub: Arc<Hub>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if !hub.admit_connection() {
                        warn!(
                            %peer,
                            limit = hub.config.server.max_connections,
                            "connection refused, at capacity"
                        );
                        drop(stream);
                        continue;
                    }
                    if let Err(err) = stream.set_nodelay(true) {
                        trace!(%peer, error = %err, "set_nodelay failed");
                    }
                    let (reader, writer) = stream.into_split();
                    let (outbox, _writer_task) = TaskOutbox::new(
                        writer,
                        hub.config.batch.clone(),
                        hub.config.server.outbox_capacity,
                    );
                    let session = hub.registry.register(peer, Box::new(outbox));
                    hub.emit(HubEvent::SessionOpened {
                        session: session.id(),
                        peer,
                    });
                    tokio::spawn(run_session(hub.clone(), session, reader, shutdown.clone()));
                }
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
    debug!("accept loop stopped");
}

/// Read task for one spawned-transport connection: decode frames, apply
/// commands, tear the session down on EOF, error or shutdown.
async fn run_session(
    hub: Arc<Hub>,
    session: Arc<ClientSession>,
    mut reader: OwnedReadHalf,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = BytesMut::with_capacity(4 * 1024);
    'session: loop {
        tokio::select! {
            _ = shutdown.changed() => break 'session,
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => {
                    debug!(session = session.id(), "peer closed");
                    break 'session;
                }
                Ok(_) => loop {
                    match try_decode_frame(&mut buf) {
                        Ok(Some(frame)) => match decode_command(&frame) {
                            Ok(cmd) => {
                                trace!(session = session.id(), ?cmd, "command");
                                if !hub.apply_command(&session, cmd) {
                                    break 'session;
                                }
                            }
                            Err(err) => {
                                warn!(session = session.id(), error = %err, "bad command, closing");
                                break 'session;
                            }
                        },
                        Ok(None) => break,
                        Err(err) => {
                            warn!(session = session.id(), error = %err, "bad frame, closing");
                            break 'session;
                        }
                    }
                },
                Err(err) => {
                    debug!(session = session.id(), error = %err, "read failed");
                    break 'session;
                }
            }
        }
    }
    hub.teardown_session(&session);
    hub.release_connection();
}

/// Periodically drops sticky worker bindings that have gone idle.
async fn sticky_housekeeping(hub: Arc<Hub>, mut shutdown: watch::Receiver<bool>) {
    let idle = hub.config.delivery.sticky_idle();
    let period = idle.min(Duration::from_secs(60)).max(Duration::from_secs(1));
    let mut tick = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                let evicted = hub.dispatcher.evict_idle_bindings(idle);
                if evicted > 0 {
                    debug!(evicted, "sticky bindings evicted");
                }
            }
        }
    }
}
