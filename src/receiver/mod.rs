//! Receiving daemon: accepts files from peers and lands them in the
//! destination directory.
//!
//! One session task per authenticated channel runs the receive loop in
//! [`session`]; admission control in [`space`] and the shared in-progress
//! inode set keep concurrent sessions honest.

pub mod post;
pub mod session;
pub mod space;

pub use session::{Inflight, SessionShared};
pub use space::SpaceAdmitter;

use crate::config::{Mode, PeerConfig, ReceiverConfig};
use crate::error::Result;
use crate::fsutil;
use crate::shutdown::Shutdown;
use crate::transfer::{establish, Role};
use crate::transport::{sys, Bus, Group};
use post::PostCommand;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Run the receiver until shutdown. Fatal startup problems surface as an
/// error; session failures are logged and survived.
pub async fn run(config: ReceiverConfig, shutdown: Shutdown) -> Result<()> {
    config.validate()?;

    fsutil::ensure_dir(&config.destination_dir)?;
    for dup in &config.duplicate_destinations {
        fsutil::ensure_dir(dup)?;
    }

    let credentials = match &config.tls {
        Some(tls) => Some(tls.build()?),
        None => None,
    };
    let bus = Bus::new(credentials);

    let shared = Arc::new(SessionShared::new(
        config.destination_dir.clone(),
        config.duplicate_destinations.clone(),
        config.unique_duplicates,
        SpaceAdmitter::new(
            config.destination_dir.clone(),
            config.freespace_minimum,
            config.space_maximum_percent,
        ),
        config.post_command.as_ref().map(PostCommand::new),
    ));

    // One task turns the shutdown flag into bus teardown, which in turn
    // unblocks every group receiver below.
    {
        let bus = bus.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown.wait().await;
            bus.shutdown();
        });
    }

    match config.mode {
        Mode::Server => {
            let group = bus.group();
            bus.listen(&group, &config.listen, config.keepalive).await?;
            serve(&bus, &group, &config, Arc::clone(&shared)).await;
        }
        Mode::Client => {
            let mut workers = Vec::new();
            for peer in config.peers.clone() {
                let bus = bus.clone();
                let config = config.clone();
                let shared = Arc::clone(&shared);
                let shutdown = shutdown.clone();
                workers.push(tokio::spawn(async move {
                    dial_loop(bus, peer, config, shared, shutdown).await;
                }));
            }
            for worker in workers {
                let _ = worker.await;
            }
        }
    }

    bus.shutdown();
    bus.join().await;
    info!("receiver stopped");
    Ok(())
}

/// Server mode: peel NEW_CONNECTION events off the listen group and hand
/// each fresh channel its own session task.
async fn serve(bus: &Bus, group: &Group, config: &ReceiverConfig, shared: Arc<SessionShared>) {
    let allowed = config.allowed_idents();
    loop {
        let msg = match group.recv().await {
            Ok(msg) => msg,
            Err(_) => break,
        };
        match msg.ty {
            sys::NEW_CONNECTION => {
                let body = msg.body();
                if body.len() != 2 {
                    continue;
                }
                let channel = u16::from_be_bytes([body[0], body[1]]);
                let session_group = match group.split(channel) {
                    Ok(session_group) => session_group,
                    Err(err) => {
                        debug!(channel, %err, "fresh channel vanished before split");
                        continue;
                    }
                };
                let shared = Arc::clone(&shared);
                let ident = config.ident.clone();
                let allowed = allowed.clone();
                let task = tokio::spawn(async move {
                    run_session(session_group, channel, ident, allowed, shared).await;
                });
                bus.track_task(task);
            }
            sys::CHANNEL_DIED => {
                debug!(channel = msg.channel, "channel died before a session claimed it");
            }
            ty if sys::is_reserved(ty) => {
                debug!(ty, "stray system message on the listen group");
            }
            _ => {
                // Handshake traffic raced ahead of its NEW_CONNECTION event;
                // hand it back for the session group to claim.
                bus.requeue_front(msg);
                tokio::task::yield_now().await;
            }
        }
    }
}

async fn run_session(
    group: Group,
    channel: u16,
    ident: String,
    allowed: Option<Vec<String>>,
    shared: Arc<SessionShared>,
) {
    match establish(group, channel, Role::Receiver, &ident, allowed.as_deref()).await {
        Ok(link) => {
            let peer = link.peer_ident.clone();
            match session::run(link, shared).await {
                Ok(files) => info!(%peer, files, "session ended"),
                Err(err) => warn!(%peer, %err, "session failed"),
            }
        }
        Err(err) => debug!(%err, "handshake failed"),
    }
}

/// Client mode: keep dialing one sender, with a delay between attempts.
async fn dial_loop(
    bus: Bus,
    peer: PeerConfig,
    config: ReceiverConfig,
    shared: Arc<SessionShared>,
    shutdown: Shutdown,
) {
    let retry = Duration::from_secs(config.reconnect_interval.max(1));
    // One group serves every connection this task ever makes.
    let dial_group = bus.group();
    loop {
        if shutdown.is_triggered() {
            return;
        }
        // Clear anything a previous dead link left behind.
        while let Ok(Some(_)) = dial_group.try_recv() {}
        match dial_once(&bus, &dial_group, &peer, &config, Arc::clone(&shared)).await {
            Ok(files) => info!(peer = %peer.ident, files, "session ended"),
            Err(err) => debug!(peer = %peer.ident, %err, "connection attempt failed"),
        }
        tokio::select! {
            _ = shutdown.wait() => return,
            _ = tokio::time::sleep(retry) => {}
        }
    }
}

async fn dial_once(
    bus: &Bus,
    group: &Group,
    peer: &PeerConfig,
    config: &ReceiverConfig,
    shared: Arc<SessionShared>,
) -> Result<u64> {
    let endpoints = peer.resolve()?;
    let mut last_err = crate::error::Error::Closed;
    for (host, addr) in endpoints {
        match bus.connect(group, &host, addr, config.keepalive).await {
            Ok(channel) => {
                let expected = [peer.ident.clone()];
                let link = establish(
                    group.clone(),
                    channel,
                    Role::Receiver,
                    &config.ident,
                    Some(&expected),
                )
                .await?;
                return session::run(link, shared).await;
            }
            Err(err) => {
                debug!(peer = %peer.ident, %addr, %err, "dial failed");
                last_err = err;
            }
        }
    }
    Err(last_err)
}
