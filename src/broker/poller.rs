//! Polled transport: one mio event loop on a dedicated thread.
//!
//! Every connection lives in the loop's token map. Other threads reach a
//! connection only through [`PolledOutbox`], which queues an op on an
//! unbounded channel and nudges the loop with a waker; the channel is
//! unbounded because the loop itself queues ops while replaying, and a
//! bounded channel would deadlock it. Slow consumers are bounded by a
//! per-connection cap on unflushed bytes instead.

use std::collections::HashMap;
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::broker::server::{Hub, HubEvent};
use crate::broker::session::{ClientSession, Outbox};
use crate::core::command::decode_command;
use crate::core::error::SendError;
use crate::core::frame::try_decode_frame;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CONNECTION: usize = 2;
const MAX_EVENTS: usize = 1024;
/// Unflushed bytes a connection may accumulate: two maximum frames.
const MAX_PENDING_WRITE_BYTES: usize = 16 * 1024 * 1024;

enum PollerOp {
    Write { token: Token, frame: Bytes },
    Close { token: Token },
    Shutdown,
}

/// Outbox handle into the poll loop.
struct PolledOutbox {
    token: Token,
    ops: flume::Sender<PollerOp>,
    waker: Arc<Waker>,
    pending_bytes: Arc<AtomicUsize>,
    gone: Arc<AtomicBool>,
}

impl Outbox for PolledOutbox {
    fn forward(&self, frame: Bytes) -> Result<(), SendError> {
        if self.gone.load(Ordering::Relaxed) {
            return Err(SendError::SessionClosed);
        }
        if self.pending_bytes.load(Ordering::Relaxed) + frame.len() > MAX_PENDING_WRITE_BYTES {
            return Err(SendError::Backpressure);
        }
        self.pending_bytes.fetch_add(frame.len(), Ordering::Relaxed);
        self.ops
            .send(PollerOp::Write {
                token: self.token,
                frame,
            })
            .map_err(|_| SendError::SessionClosed)?;
        let _ = self.waker.wake();
        Ok(())
    }

    fn close(&self) {
        let _ = self.ops.send(PollerOp::Close { token: self.token });
        let _ = self.waker.wake();
    }
}

struct Conn {
    socket: TcpStream,
    session: Arc<ClientSession>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    pending_bytes: Arc<AtomicUsize>,
    gone: Arc<AtomicBool>,
    armed_writable: bool,
    /// Orderly close requested: flush what is buffered, then drop.
    draining: bool,
    closed: bool,
}

/// Handle owned by the hub; stopping it joins the loop thread.
pub(crate) struct Poller {
    ops: flume::Sender<PollerOp>,
    waker: Arc<Waker>,
    local_addr: SocketAddr,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Poller {
    pub(crate) fn start(hub: Arc<Hub>, bind_addr: &str) -> io::Result<Poller> {
        let addr: SocketAddr = bind_addr
            .parse()
            .map_err(|err| io::Error::new(ErrorKind::InvalidInput, err))?;
        let mut listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);

        let (ops_tx, ops_rx) = flume::unbounded();
        let thread = thread::Builder::new().name("hub-poll".into()).spawn({
            let ops_tx = ops_tx.clone();
            let waker = waker.clone();
            move || {
                PollLoop {
                    hub,
                    poll,
                    listener,
                    ops_tx,
                    ops_rx,
                    waker,
                    conns: HashMap::new(),
                    next_token: FIRST_CONNECTION,
                    stopping: false,
                }
                .run()
            }
        })?;

        Ok(Poller {
            ops: ops_tx,
            waker,
            local_addr,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.ops.send(PollerOp::Shutdown);
        let _ = self.waker.wake();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

struct PollLoop {
    hub: Arc<Hub>,
    poll: Poll,
    listener: TcpListener,
    ops_tx: flume::Sender<PollerOp>,
    ops_rx: flume::Receiver<PollerOp>,
    waker: Arc<Waker>,
    conns: HashMap<Token, Conn>,
    next_token: usize,
    stopping: bool,
}

impl PollLoop {
    fn run(mut self) {
        debug!("poller started");
        let mut events = Events::with_capacity(MAX_EVENTS);
        while !self.stopping {
            if let Err(err) = self.poll.poll(&mut events, Some(Duration::from_millis(100))) {
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                warn!(error = %err, "poll failed");
                break;
            }
            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_all(),
                    // The waker exists to cut the poll timeout short; the
                    // op drain below runs every iteration regardless.
                    WAKER => {}
                    token => self.handle_conn_event(token, event.is_readable(), event.is_writable()),
                }
            }
            self.drain_ops();
            self.sweep();
        }
        self.close_all();
        debug!("poller stopped");
    }

    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut socket, peer)) => {
                    if !self.hub.admit_connection() {
                        warn!(%peer, "connection refused, at capacity");
                        continue;
                    }
                    let _ = socket.set_nodelay(true);
                    let token = Token(self.next_token);
                    self.next_token += 1;

                    if let Err(err) =
                        self.poll
                            .registry()
                            .register(&mut socket, token, Interest::READABLE)
                    {
                        warn!(%peer, error = %err, "register failed");
                        self.hub.release_connection();
                        continue;
                    }

                    let pending_bytes = Arc::new(AtomicUsize::new(0));
                    let gone = Arc::new(AtomicBool::new(false));
                    let outbox = PolledOutbox {
                        token,
                        ops: self.ops_tx.clone(),
                        waker: self.waker.clone(),
                        pending_bytes: pending_bytes.clone(),
                        gone: gone.clone(),
                    };
                    let session = self.hub.registry().register(peer, Box::new(outbox));
                    self.hub.emit(HubEvent::SessionOpened {
                        session: session.id(),
                        peer,
                    });
                    self.conns.insert(
                        token,
                        Conn {
                            socket,
                            session,
                            read_buf: BytesMut::with_capacity(4 * 1024),
                            write_buf: BytesMut::with_capacity(4 * 1024),
                            pending_bytes,
                            gone,
                            armed_writable: false,
                            draining: false,
                            closed: false,
                        },
                    );
                }
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    break;
                }
            }
        }
    }

    fn handle_conn_event(&mut self, token: Token, readable: bool, writable: bool) {
        let hub = self.hub.clone();
        let Some(conn) = self.conns.get_mut(&token) else {
            return;
        };

        if readable && !conn.draining {
            let mut scratch = [0u8; 8 * 1024];
            loop {
                match conn.socket.read(&mut scratch) {
                    Ok(0) => {
                        debug!(session = conn.session.id(), "peer closed");
                        conn.closed = true;
                        break;
                    }
                    Ok(n) => conn.read_buf.extend_from_slice(&scratch[..n]),
                    Err(ref err) if err.kind() == ErrorKind::WouldBlock => break,
                    Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(err) => {
                        debug!(session = conn.session.id(), error = %err, "read failed");
                        conn.closed = true;
                        break;
                    }
                }
            }

            while !conn.closed && !conn.draining {
                match try_decode_frame(&mut conn.read_buf) {
                    Ok(Some(frame)) => match decode_command(&frame) {
                        Ok(cmd) => {
                            trace!(session = conn.session.id(), ?cmd, "command");
                            let session = conn.session.clone();
                            if !hub.apply_command(&session, cmd) {
                                conn.draining = true;
                            }
                        }
                        Err(err) => {
                            warn!(session = conn.session.id(), error = %err, "bad command, closing");
                            conn.closed = true;
                        }
                    },
                    Ok(None) => break,
                    Err(err) => {
                        warn!(session = conn.session.id(), error = %err, "bad frame, closing");
                        conn.closed = true;
                    }
                }
            }
        }

        if writable && flush_conn(conn).is_err() {
            conn.closed = true;
        }
    }

    /// Apply queued outbox ops. Ops for tokens that are no longer in the
    /// map belonged to dropped connections and are discarded.
    fn drain_ops(&mut self) {
        let ops: Vec<PollerOp> = self.ops_rx.try_iter().collect();
        for op in ops {
            match op {
                PollerOp::Write { token, frame } => {
                    if let Some(conn) = self.conns.get_mut(&token) {
                        conn.write_buf.extend_from_slice(&frame);
                        if flush_conn(conn).is_err() {
                            conn.closed = true;
                        }
                    }
                }
                PollerOp::Close { token } => {
                    if let Some(conn) = self.conns.get_mut(&token) {
                        conn.draining = true;
                        if flush_conn(conn).is_err() {
                            conn.closed = true;
                        }
                    }
                }
                PollerOp::Shutdown => self.stopping = true,
            }
        }
    }

    /// Drop finished connections and re-arm write interest for the rest.
    fn sweep(&mut self) {
        let done: Vec<Token> = self
            .conns
            .iter()
            .filter(|(_, conn)| conn.closed || (conn.draining && conn.write_buf.is_empty()))
            .map(|(token, _)| *token)
            .collect();
        for token in done {
            self.drop_conn(token);
        }

        let rearm: Vec<Token> = self
            .conns
            .iter()
            .filter(|(_, conn)| !conn.write_buf.is_empty() != conn.armed_writable)
            .map(|(token, _)| *token)
            .collect();
        for token in rearm {
            self.update_interest(token);
        }
    }

    fn update_interest(&mut self, token: Token) {
        if let Some(conn) = self.conns.get_mut(&token) {
            let want_writable = !conn.write_buf.is_empty();
            let interest = if want_writable {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            match self
                .poll
                .registry()
                .reregister(&mut conn.socket, token, interest)
            {
                Ok(()) => conn.armed_writable = want_writable,
                Err(err) => {
                    debug!(session = conn.session.id(), error = %err, "reregister failed");
                    conn.closed = true;
                }
            }
        }
    }

    fn drop_conn(&mut self, token: Token) {
        if let Some(mut conn) = self.conns.remove(&token) {
            conn.gone.store(true, Ordering::Relaxed);
            let _ = self.poll.registry().deregister(&mut conn.socket);
            self.hub.teardown_session(&conn.session);
            self.hub.release_connection();
            debug!(session = conn.session.id(), "polled connection dropped");
        }
    }

    fn close_all(&mut self) {
        let tokens: Vec<Token> = self.conns.keys().copied().collect();
        for token in tokens {
            if let Some(conn) = self.conns.get_mut(&token) {
                let _ = flush_conn(conn);
            }
            self.drop_conn(token);
        }
    }
}

/// Write until empty or the socket pushes back. `WouldBlock` is fine;
/// the caller re-arms write interest for the leftover.
fn flush_conn(conn: &mut Conn) -> io::Result<()> {
    while !conn.write_buf.is_empty() {
        match conn.socket.write(&conn.write_buf) {
            Ok(0) => {
                return Err(io::Error::new(ErrorKind::WriteZero, "connection closed"));
            }
            Ok(n) => {
                let _ = conn.write_buf.split_to(n);
                conn.pending_bytes.fetch_sub(n, Ordering::Relaxed);
            }
            Err(ref err) if err.kind() == ErrorKind::WouldBlock => return Ok(()),
            Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbox_fixture() -> (PolledOutbox, flume::Receiver<PollerOp>, Arc<AtomicBool>) {
        let poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), WAKER).unwrap());
        let (ops_tx, ops_rx) = flume::unbounded();
        let gone = Arc::new(AtomicBool::new(false));
        let outbox = PolledOutbox {
            token: Token(7),
            ops: ops_tx,
            waker,
            pending_bytes: Arc::new(AtomicUsize::new(0)),
            gone: gone.clone(),
        };
        (outbox, ops_rx, gone)
    }

    #[test]
    fn forward_queues_write_ops_and_tracks_pending_bytes() {
        let (outbox, ops_rx, _gone) = outbox_fixture();

        outbox.forward(Bytes::from_static(b"12345")).unwrap();
        assert_eq!(outbox.pending_bytes.load(Ordering::Relaxed), 5);

        match ops_rx.try_recv().unwrap() {
            PollerOp::Write { token, frame } => {
                assert_eq!(token, Token(7));
                assert_eq!(frame.as_ref(), b"12345");
            }
            _ => panic!("expected a write op"),
        }
    }

    #[test]
    fn forward_pushes_back_when_pending_cap_is_hit() {
        let (outbox, _ops_rx, _gone) = outbox_fixture();
        outbox
            .pending_bytes
            .store(MAX_PENDING_WRITE_BYTES, Ordering::Relaxed);

        assert!(matches!(
            outbox.forward(Bytes::from_static(b"x")),
            Err(SendError::Backpressure)
        ));
    }

    #[test]
    fn forward_fails_once_the_connection_is_gone() {
        let (outbox, _ops_rx, gone) = outbox_fixture();
        gone.store(true, Ordering::Relaxed);

        assert!(matches!(
            outbox.forward(Bytes::from_static(b"x")),
            Err(SendError::SessionClosed)
        ));
    }

    #[test]
    fn close_queues_a_close_op() {
        let (outbox, ops_rx, _gone) = outbox_fixture();
        outbox.close();
        assert!(matches!(
            ops_rx.try_recv().unwrap(),
            PollerOp::Close { token: Token(7) }
        ));
    }
}
