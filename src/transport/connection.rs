//! A full-duplex socket with one reader and one writer worker.
//!
//! The writer drains an outbound deque (control messages jump the line via
//! push-front) and emits keepalives when the deque stays empty. The reader
//! feeds the incremental decoder, dispatches system control in-band, routes
//! everything else to the target channel's queue, and tears the connection
//! down when the peer goes stagnant.

use super::codec::{write_message, Decoder};
use super::group::Bus;
use super::message::{sys, Message, CONTROL_CHANNEL};
use std::collections::HashSet;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

/// Liveness bound when keepalives are disabled.
const DEFAULT_STAGNANT: Duration = Duration::from_secs(120);

/// How long a blocked poll may go before the worker re-checks its world.
const POLL_TICK: Duration = Duration::from_secs(1);

const READ_BUF_LEN: usize = 16 * 1024;

pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}
pub type BoxedIo = Box<dyn Io>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Tcp,
    Tls,
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Kind::Tcp => write!(f, "tcp"),
            Kind::Tls => write!(f, "tls"),
        }
    }
}

/// Messages waiting for the writer. The deque itself is unbounded, but
/// data pushes pace against a high-water mark so a slow remote stalls the
/// producing state machine instead of ballooning memory. Control traffic
/// jumps the line and is never paced.
pub(crate) struct Outbound {
    deque: Mutex<VecDeque<Message>>,
    notify: Notify,
    capacity: Notify,
}

/// Data pushes wait once this many messages are queued.
pub(crate) const OUTBOUND_HIGH_WATER: usize = 256;

impl Outbound {
    fn new() -> Self {
        Self {
            deque: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Message>> {
        self.deque.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue at the tail unless the deque is at the high-water mark; a
    /// refused message comes back to the caller.
    pub(crate) fn try_push_back(&self, msg: Message) -> Result<(), Message> {
        let mut deque = self.lock();
        if deque.len() >= OUTBOUND_HIGH_WATER {
            return Err(msg);
        }
        deque.push_back(msg);
        drop(deque);
        self.notify.notify_one();
        Ok(())
    }

    /// Control traffic goes to the front to bound its latency.
    pub(crate) fn push_front(&self, msg: Message) {
        self.lock().push_front(msg);
        self.notify.notify_one();
    }

    pub(crate) async fn pop(&self) -> Message {
        loop {
            let notified = self.notify.notified();
            {
                let mut deque = self.lock();
                if let Some(msg) = deque.pop_front() {
                    if !deque.is_empty() {
                        self.notify.notify_one();
                    }
                    if deque.len() < OUTBOUND_HIGH_WATER {
                        self.capacity.notify_waiters();
                    }
                    return msg;
                }
            }
            notified.await;
        }
    }

    /// Wait until the deque drains below the high-water mark. Teardown
    /// also releases waiters (the deque is cleared).
    pub(crate) async fn wait_capacity(&self) {
        loop {
            let notified = self.capacity.notified();
            if self.lock().len() < OUTBOUND_HIGH_WATER {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn clear(&self) {
        self.lock().clear();
        self.capacity.notify_waiters();
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

pub(crate) struct Connection {
    pub id: i32,
    pub peer: SocketAddr,
    pub kind: Kind,
    /// Keepalive period in seconds; 0 disables writer keepalives.
    pub keepalive: u32,
    pub(crate) outbound: Outbound,
    last_recv: Mutex<Instant>,
    /// Local ids of the channels attached here; the connection dies when
    /// the set empties.
    channels: Mutex<HashSet<u16>>,
    /// Pre-created channel consumed by the first inbound announce.
    pub(crate) first_channel: Mutex<Option<u16>>,
    /// Group that receives responder-side channels on this connection.
    pub(crate) accept_group: Mutex<Option<i32>>,
    closed: AtomicBool,
    pub(crate) close_notify: Notify,
    /// Most recent error observed by a worker.
    pub(crate) last_error: Mutex<Option<String>>,
}

impl Connection {
    pub(crate) fn new(id: i32, peer: SocketAddr, kind: Kind, keepalive: u32) -> Self {
        Self {
            id,
            peer,
            kind,
            keepalive,
            outbound: Outbound::new(),
            last_recv: Mutex::new(Instant::now()),
            channels: Mutex::new(HashSet::new()),
            first_channel: Mutex::new(None),
            accept_group: Mutex::new(None),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            last_error: Mutex::new(None),
        }
    }

    pub(crate) fn touch(&self) {
        *self
            .last_recv
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// True when the peer has been silent for longer than twice the
    /// keepalive period (or the fixed default when keepalives are off).
    pub(crate) fn stagnant(&self) -> bool {
        let bound = if self.keepalive > 0 {
            Duration::from_secs(u64::from(self.keepalive) * 2)
        } else {
            DEFAULT_STAGNANT
        };
        self.last_recv
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
            > bound
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Flip to closed; true on the first call only.
    pub(crate) fn mark_closed(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        if first {
            self.close_notify.notify_waiters();
            // Break the writer out of its blocking pop without transmitting.
            self.outbound
                .push_front(Message::control(sys::WRITER_UNBLOCKER));
        }
        first
    }

    pub(crate) fn attach_channel(&self, local: u16) {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(local);
    }

    /// Detach a channel; returns how many remain.
    pub(crate) fn detach_channel(&self, local: u16) -> usize {
        let mut set = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        set.remove(&local);
        set.len()
    }

    pub(crate) fn channel_ids(&self) -> Vec<u16> {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    pub(crate) fn record_error(&self, err: impl Into<String>) {
        *self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(err.into());
    }
}

pub(crate) fn spawn_workers(bus: &Bus, conn: std::sync::Arc<Connection>, io: BoxedIo) {
    let (read_half, write_half) = tokio::io::split(io);
    let reader = tokio::spawn(reader_worker(bus.clone(), conn.clone(), read_half));
    let writer = tokio::spawn(writer_worker(bus.clone(), conn, write_half));
    bus.track_task(reader);
    bus.track_task(writer);
}

async fn reader_worker(
    bus: Bus,
    conn: std::sync::Arc<Connection>,
    mut read_half: tokio::io::ReadHalf<BoxedIo>,
) {
    let mut decoder = Decoder::new();
    let mut buf = vec![0u8; READ_BUF_LEN];

    loop {
        if conn.is_closed() || bus.is_shutdown() {
            break;
        }
        tokio::select! {
            _ = conn.close_notify.notified() => break,
            polled = timeout(POLL_TICK, read_half.read(&mut buf)) => match polled {
                Err(_) => {
                    if conn.stagnant() {
                        warn!(peer = %conn.peer, "connection stagnant, dropping");
                        conn.record_error("stagnant peer");
                        break;
                    }
                }
                Ok(Ok(0)) => {
                    debug!(peer = %conn.peer, "peer closed connection");
                    break;
                }
                Ok(Ok(n)) => {
                    conn.touch();
                    decoder.feed(&buf[..n]);
                    while let Some(msg) = decoder.next_message() {
                        dispatch(&bus, &conn, msg);
                    }
                }
                Ok(Err(err)) => {
                    debug!(peer = %conn.peer, %err, "read failed");
                    conn.record_error(err.to_string());
                    break;
                }
            }
        }
    }

    bus.destroy_connection(conn.id);
}

fn dispatch(bus: &Bus, conn: &std::sync::Arc<Connection>, msg: Message) {
    if msg.channel == CONTROL_CHANNEL && sys::is_wire_control(msg.ty) {
        match msg.ty {
            sys::CHANNEL_ANNOUNCE => bus.handle_announce(conn, &msg),
            sys::CHANNEL_REPLY => bus.handle_reply(conn, &msg),
            sys::CHANNEL_KILL => bus.handle_kill(conn, &msg),
            sys::CHANNEL_KEEPALIVE => trace!(peer = %conn.peer, "keepalive"),
            _ => unreachable!(),
        }
        return;
    }
    if sys::is_reserved(msg.ty) {
        // Forged process-local types or control traffic on a data channel.
        debug!(peer = %conn.peer, ty = msg.ty, "dropping bogus system message");
        return;
    }
    bus.route_inbound(conn, msg);
}

async fn writer_worker(
    bus: Bus,
    conn: std::sync::Arc<Connection>,
    mut write_half: tokio::io::WriteHalf<BoxedIo>,
) {
    loop {
        if conn.is_closed() || bus.is_shutdown() {
            break;
        }

        let msg = tokio::select! {
            _ = conn.close_notify.notified() => break,
            msg = pop_or_keepalive(&conn) => msg,
        };

        if msg.channel == CONTROL_CHANNEL && msg.ty == sys::WRITER_UNBLOCKER {
            // Sentinel: re-check the closed flag, transmit nothing.
            continue;
        }

        let written = tokio::select! {
            _ = conn.close_notify.notified() => break,
            written = write_message(&mut write_half, &msg) => written,
        };
        if let Err(err) = written {
            debug!(peer = %conn.peer, %err, "write failed");
            conn.record_error(err.to_string());
            break;
        }
    }

    conn.outbound.clear();
    bus.destroy_connection(conn.id);
}

/// Pop the next outbound message; when keepalives are enabled and the pop
/// times out, synthesize one.
async fn pop_or_keepalive(conn: &Connection) -> Message {
    if conn.keepalive == 0 {
        return conn.outbound.pop().await;
    }
    match timeout(
        Duration::from_secs(u64::from(conn.keepalive)),
        conn.outbound.pop(),
    )
    .await
    {
        Ok(msg) => msg,
        Err(_) => Message::control(sys::CHANNEL_KEEPALIVE),
    }
}
