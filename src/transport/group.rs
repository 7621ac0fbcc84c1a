//! Process-wide bus state and channel groups.
//!
//! The bus owns connections and channels by id; channels carry id
//! back-references instead of strong pointers, so the ownership graph stays
//! acyclic. A group bundles a set of channels whose inbound traffic is
//! drained through one multiqueue; groups can be split and merged by moving
//! a channel's subqueue atomically.

use super::channel::{Channel, Phase};
use super::connection::{spawn_workers, BoxedIo, Connection, Kind};
use super::listener;
use super::message::{sys, Message, CONTROL_CHANNEL};
use super::tls::Credentials;
use crate::error::{Error, Result};
use crate::intmap::IntMap;
use crate::multiqueue::{Multiqueue, Order, QueueError, Subqueue};
use bytes::Bytes;
use rustls::pki_types::ServerName;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

struct Alloc {
    next_channel: u16,
    next_conn: i32,
    next_group: i32,
}

/// Per-group shared pieces kept in the bus index.
#[derive(Clone)]
pub(crate) struct GroupHandle {
    pub mq: Multiqueue<Message>,
    pub events: Subqueue<Message>,
    /// Split-created groups are dropped from the index once their last
    /// channel dies; explicitly created groups live as long as the bus.
    ephemeral: bool,
}

pub(crate) struct BusInner {
    alloc: Mutex<Alloc>,
    pub(crate) channels: IntMap<Arc<Channel>>,
    chan_group: IntMap<i32>,
    groups: IntMap<GroupHandle>,
    pub(crate) connections: IntMap<Arc<Connection>>,
    credentials: Option<Credentials>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to the shared bus; cheap to clone.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    pub fn new(credentials: Option<Credentials>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(BusInner {
                alloc: Mutex::new(Alloc {
                    next_channel: 0,
                    next_conn: 1,
                    next_group: 1,
                }),
                channels: IntMap::new(),
                chan_group: IntMap::new(),
                groups: IntMap::new(),
                connections: IntMap::new(),
                credentials,
                shutdown,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    fn alloc(&self) -> MutexGuard<'_, Alloc> {
        self.inner
            .alloc
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_shutdown(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    pub(crate) fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.subscribe()
    }

    pub(crate) fn track_task(&self, handle: JoinHandle<()>) {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    pub(crate) fn credentials(&self) -> Option<&Credentials> {
        self.inner.credentials.as_ref()
    }

    /// Create a fresh group on this bus.
    pub fn group(&self) -> Group {
        self.make_group(false)
    }

    fn make_group(&self, ephemeral: bool) -> Group {
        let id = {
            let mut alloc = self.alloc();
            let id = alloc.next_group;
            alloc.next_group += 1;
            id
        };
        let mq = Multiqueue::new(Order::Fair);
        let events = mq.subqueue();
        self.inner.groups.insert(
            id,
            GroupHandle {
                mq: mq.clone(),
                events: events.clone(),
                ephemeral,
            },
        );
        if self.is_shutdown() {
            // Too late to be useful; make sure nobody blocks on it.
            mq.shutdown();
        }
        Group {
            bus: self.clone(),
            id,
            mq,
            events,
        }
    }

    fn alloc_channel_id(&self) -> Result<u16> {
        let mut alloc = self.alloc();
        for _ in 0..=u16::MAX {
            let id = alloc.next_channel;
            alloc.next_channel = alloc.next_channel.wrapping_add(1);
            if id == CONTROL_CHANNEL {
                continue;
            }
            if !self.inner.channels.contains(i32::from(id)) {
                return Ok(id);
            }
        }
        Err(Error::generic("no free channel ids"))
    }

    fn alloc_conn_id(&self) -> i32 {
        let mut alloc = self.alloc();
        let id = alloc.next_conn;
        alloc.next_conn += 1;
        id
    }

    /// Dial a peer, establish the transport (and TLS when configured), and
    /// open the first channel on it. Returns the local channel id once the
    /// peer's reply arrives.
    pub async fn connect(
        &self,
        group: &Group,
        host: &str,
        addr: SocketAddr,
        keepalive: u32,
    ) -> Result<u16> {
        if self.is_shutdown() {
            return Err(Error::Closed);
        }
        let tcp = TcpStream::connect(addr).await?;
        tcp.set_nodelay(true)?;

        let (io, kind): (BoxedIo, Kind) = match self.credentials() {
            Some(creds) => {
                let name = ServerName::try_from(host.to_owned())
                    .map_err(|e| Error::generic(format!("bad TLS server name {host}: {e}")))?;
                let tls = creds.connector().connect(name, tcp).await.map_err(|e| {
                    Error::generic(format!("TLS handshake with {addr} failed: {e}"))
                })?;
                (Box::new(tls), Kind::Tls)
            }
            None => (Box::new(tcp), Kind::Tcp),
        };

        let conn = Arc::new(Connection::new(
            self.alloc_conn_id(),
            addr,
            kind,
            keepalive,
        ));
        self.inner.connections.insert(conn.id, Arc::clone(&conn));
        spawn_workers(self, Arc::clone(&conn), io);
        info!(peer = %addr, %kind, "connection established");

        self.open_channel(&conn, group).await
    }

    /// Announce a new channel on an existing connection and wait for the
    /// peer's reply.
    pub(crate) async fn open_channel(&self, conn: &Arc<Connection>, group: &Group) -> Result<u16> {
        let local = self.alloc_channel_id()?;
        let queue = group.mq.subqueue();
        let chan = Arc::new(Channel::new(local, conn.id, Phase::Connecting, queue));
        chan.set_connecting();
        self.inner.channels.insert(i32::from(local), Arc::clone(&chan));
        self.inner.chan_group.insert(i32::from(local), group.id);
        conn.attach_channel(local);

        conn.outbound.push_front(Message::control_with(
            sys::CHANNEL_ANNOUNCE,
            Bytes::copy_from_slice(&local.to_be_bytes()),
        ));

        match chan.wait_connected().await {
            Ok(remote) => {
                trace!(local, remote, "channel connected");
                Ok(local)
            }
            Err(err) => Err(err),
        }
    }

    /// Register an accepted socket: wrap it in a connection with one
    /// pre-created channel that the first inbound announce will consume.
    pub(crate) fn accept_connection(
        &self,
        io: BoxedIo,
        peer: SocketAddr,
        kind: Kind,
        group_id: i32,
        keepalive: u32,
    ) -> Result<()> {
        let group = self
            .inner
            .groups
            .get(group_id)
            .ok_or_else(|| Error::generic("listener group is gone"))?;

        let conn = Arc::new(Connection::new(
            self.alloc_conn_id(),
            peer,
            kind,
            keepalive,
        ));

        let local = self.alloc_channel_id()?;
        let queue = group.mq.subqueue();
        let chan = Arc::new(Channel::new(local, conn.id, Phase::Created, queue));
        self.inner.channels.insert(i32::from(local), Arc::clone(&chan));
        self.inner.chan_group.insert(i32::from(local), group_id);
        conn.attach_channel(local);
        *conn
            .first_channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(local);
        *conn
            .accept_group
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(group_id);

        self.inner.connections.insert(conn.id, Arc::clone(&conn));
        spawn_workers(self, conn, io);
        Ok(())
    }

    /// Bind the given addresses and start accepting into `group`. Succeeds
    /// when at least one address binds; returns the bound local addresses.
    pub async fn listen(
        &self,
        group: &Group,
        addrs: &[SocketAddr],
        keepalive: u32,
    ) -> Result<Vec<SocketAddr>> {
        listener::start(self, group.id, addrs, keepalive).await
    }

    /// Queue an application message on a connected channel. The wire header
    /// carries the peer's id for the stream, so it lands on the matching
    /// channel over there. When the connection's outbound deque is at its
    /// high-water mark this waits for the writer to drain, which is what
    /// throttles a producer facing a slow remote.
    pub async fn send(&self, channel: u16, mut msg: Message) -> Result<()> {
        if sys::is_reserved(msg.ty) {
            return Err(Error::protocol(format!(
                "application message uses reserved type {:#06x}",
                msg.ty
            )));
        }
        loop {
            let chan = self
                .inner
                .channels
                .get(i32::from(channel))
                .ok_or(Error::Closed)?;
            if chan.phase() != Phase::Connected {
                return Err(Error::Closed);
            }
            let remote = chan.remote().ok_or(Error::Closed)?;
            let conn = self
                .inner
                .connections
                .get(chan.conn)
                .ok_or(Error::Closed)?;
            if conn.is_closed() {
                return Err(Error::Closed);
            }
            msg.channel = remote;
            match conn.outbound.try_push_back(msg) {
                Ok(()) => return Ok(()),
                Err(back) => {
                    msg = back;
                    conn.outbound.wait_capacity().await;
                }
            }
        }
    }

    /// Orderly local close: tell the peer with CHANNEL_KILL and tear down
    /// our end without a died event (the caller asked for this).
    pub fn close_channel(&self, channel: u16) {
        self.teardown_channel(channel, false, true);
    }

    /// Remove a channel from every index. `fire_died` delivers a
    /// CHANNEL_DIED event to the owning group; `send_kill` notifies the
    /// peer first. Idempotent.
    pub(crate) fn teardown_channel(&self, local: u16, fire_died: bool, send_kill: bool) {
        let Some(chan) = self.inner.channels.remove(i32::from(local)) else {
            return;
        };

        if send_kill {
            if let (Some(remote), Some(conn)) =
                (chan.remote(), self.inner.connections.get(chan.conn))
            {
                if !conn.is_closed() {
                    conn.outbound.push_front(Message::control_with(
                        sys::CHANNEL_KILL,
                        Bytes::copy_from_slice(&remote.to_be_bytes()),
                    ));
                }
            }
        }

        chan.close();

        let group_id = self.inner.chan_group.remove(i32::from(local));
        if let Some(gid) = group_id {
            if let Some(group) = self.inner.groups.get(gid) {
                let residual = group.mq.detach(&chan.queue);
                if !residual.is_empty() {
                    trace!(local, dropped = residual.len(), "dropping undelivered messages");
                }
                if fire_died {
                    let _ = group.events.push_back(Message::new(local, sys::CHANNEL_DIED));
                }
                if group.ephemeral
                    && !self
                        .inner
                        .chan_group
                        .snapshot()
                        .iter()
                        .any(|(_, owner)| *owner == gid)
                {
                    // Last channel of a session group: the consumer still
                    // holds the queue and will drain the died event; the
                    // index entry is no longer needed.
                    self.inner.groups.remove(gid);
                }
            }
        }

        if let Some(conn) = self.inner.connections.get(chan.conn) {
            if conn.detach_channel(local) == 0 {
                if send_kill {
                    // The kill is still queued; give the writer a moment to
                    // put it on the wire before the socket goes away.
                    let bus = self.clone();
                    let conn_id = chan.conn;
                    tokio::spawn(async move {
                        bus.flush_then_destroy(conn_id).await;
                    });
                } else {
                    self.destroy_connection(chan.conn);
                }
            }
        }
    }

    async fn flush_then_destroy(&self, conn_id: i32) {
        if let Some(conn) = self.inner.connections.get(conn_id) {
            let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(500);
            while !conn.outbound.is_empty() && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
            // The writer may still be mid-frame on the popped message.
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        self.destroy_connection(conn_id);
    }

    /// Drop a connection and everything attached to it. Safe to call from
    /// the connection's own workers and safe to call twice.
    pub(crate) fn destroy_connection(&self, id: i32) {
        let Some(conn) = self.inner.connections.remove(id) else {
            return;
        };
        // Drain pending writes first: mark_closed queues the writer
        // unblocker, which must survive.
        conn.outbound.clear();
        conn.mark_closed();
        for local in conn.channel_ids() {
            conn.detach_channel(local);
            self.teardown_channel(local, true, false);
        }
        debug!(peer = %conn.peer, "connection destroyed");
    }

    pub(crate) fn handle_announce(&self, conn: &Arc<Connection>, msg: &Message) {
        let body = msg.body();
        if body.len() != 2 {
            debug!(peer = %conn.peer, "malformed channel announce");
            return;
        }
        let initiator = u16::from_be_bytes([body[0], body[1]]);

        let first = conn
            .first_channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let local = match first {
            Some(id) => id,
            None => {
                // A further channel on an already accepted connection.
                let group_id = *conn
                    .accept_group
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                let Some(group_id) = group_id else {
                    debug!(peer = %conn.peer, "announce on a connection we dialed; dropping");
                    return;
                };
                let Some(group) = self.inner.groups.get(group_id) else {
                    return;
                };
                let Ok(id) = self.alloc_channel_id() else {
                    return;
                };
                let queue = group.mq.subqueue();
                let chan = Arc::new(Channel::new(id, conn.id, Phase::Created, queue));
                self.inner.channels.insert(i32::from(id), chan);
                self.inner.chan_group.insert(i32::from(id), group_id);
                conn.attach_channel(id);
                id
            }
        };

        let Some(chan) = self.inner.channels.get(i32::from(local)) else {
            return;
        };
        chan.set_connected(initiator);

        let mut reply = Vec::with_capacity(4);
        reply.extend_from_slice(&initiator.to_be_bytes());
        reply.extend_from_slice(&local.to_be_bytes());
        conn.outbound
            .push_front(Message::control_with(sys::CHANNEL_REPLY, Bytes::from(reply)));

        // Hand the connected channel to whoever is consuming the group.
        if let Some(group) = self
            .inner
            .chan_group
            .get(i32::from(local))
            .and_then(|gid| self.inner.groups.get(gid))
        {
            let event = Message::control_with(
                sys::NEW_CONNECTION,
                Bytes::copy_from_slice(&local.to_be_bytes()),
            );
            let _ = group.events.push_back(event);
        }
    }

    pub(crate) fn handle_reply(&self, conn: &Arc<Connection>, msg: &Message) {
        let body = msg.body();
        if body.len() != 4 {
            debug!(peer = %conn.peer, "malformed channel reply");
            return;
        }
        let ours = u16::from_be_bytes([body[0], body[1]]);
        let theirs = u16::from_be_bytes([body[2], body[3]]);
        match self.inner.channels.get(i32::from(ours)) {
            Some(chan) if chan.conn == conn.id => chan.set_connected(theirs),
            _ => debug!(peer = %conn.peer, channel = ours, "reply for unknown channel"),
        }
    }

    pub(crate) fn handle_kill(&self, conn: &Arc<Connection>, msg: &Message) {
        let body = msg.body();
        if body.len() != 2 {
            debug!(peer = %conn.peer, "malformed channel kill");
            return;
        }
        let local = u16::from_be_bytes([body[0], body[1]]);
        match self.inner.channels.get(i32::from(local)) {
            Some(chan) if chan.conn == conn.id => {
                self.teardown_channel(local, true, false);
            }
            _ => debug!(peer = %conn.peer, channel = local, "kill for unknown channel"),
        }
    }

    /// Put an inbound message back at the head of its channel's queue. Used
    /// by group consumers that popped channel traffic before the channel's
    /// NEW_CONNECTION event moved it to a dedicated group.
    pub fn requeue_front(&self, msg: Message) {
        if let Some(chan) = self.inner.channels.get(i32::from(msg.channel)) {
            let _ = chan.queue.push_front(msg);
        }
    }

    /// Deliver an inbound application message to its channel's queue.
    /// Messages for unknown or not-yet-connected channels are dropped.
    pub(crate) fn route_inbound(&self, conn: &Arc<Connection>, msg: Message) {
        match self.inner.channels.get(i32::from(msg.channel)) {
            Some(chan) if chan.conn == conn.id && chan.phase() == Phase::Connected => {
                let _ = chan.queue.push_back(msg);
            }
            _ => trace!(peer = %conn.peer, channel = msg.channel, "dropping unroutable message"),
        }
    }

    /// Phase one of shutdown: flag everyone, close sockets, unblock every
    /// waiter. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        for (id, _) in self.inner.connections.snapshot() {
            self.destroy_connection(id);
        }
        for (_, group) in self.inner.groups.snapshot() {
            group.mq.shutdown();
        }
    }

    /// Phase two: wait for every worker task to exit. Call after
    /// [`Bus::shutdown`].
    pub async fn join(&self) {
        loop {
            let handles: Vec<_> = {
                let mut tasks = self
                    .inner
                    .tasks
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                tasks.drain(..).collect()
            };
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                let _ = handle.await;
            }
        }
    }
}

/// A set of channels drained as one logical queue.
#[derive(Clone)]
pub struct Group {
    bus: Bus,
    id: i32,
    pub(crate) mq: Multiqueue<Message>,
    events: Subqueue<Message>,
}

impl Group {
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Next inbound message from any channel in the group, or a
    /// NEW_CONNECTION / CHANNEL_DIED event.
    pub async fn recv(&self) -> Result<Message, QueueError> {
        self.mq.get().await
    }

    pub fn try_recv(&self) -> Result<Option<Message>, QueueError> {
        self.mq.try_get()
    }

    /// Move `channel` out of this group into a brand new one.
    pub fn split(&self, channel: u16) -> Result<Group> {
        let group = self.bus.make_group(true);
        group.adopt_channel(channel)?;
        Ok(group)
    }

    /// Move `channel` (wherever it currently lives) into this group.
    pub fn adopt_channel(&self, channel: u16) -> Result<()> {
        let chan = self
            .bus
            .inner
            .channels
            .get(i32::from(channel))
            .ok_or(Error::Closed)?;
        self.mq.adopt(&chan.queue);
        self.bus
            .inner
            .chan_group
            .insert(i32::from(channel), self.id);
        Ok(())
    }

    pub fn shutdown(&self) {
        self.mq.shutdown();
    }
}
