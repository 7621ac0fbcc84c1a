//! Sending daemon: watch a directory, stage matching files per peer, and
//! deliver them over the bus.
//!
//! [`intake`] turns dropped files into queued work; [`peer`] drains each
//! peer's prioritized queue through the transfer protocol, with retries and
//! an error parking lot for rejected files.

pub mod intake;
pub mod peer;

pub use intake::Intake;
pub use peer::{Peer, WorkItem, WorkerConfig};

use crate::config::{Mode, SenderConfig};
use crate::error::Result;
use crate::fsutil;
use crate::shutdown::Shutdown;
use crate::transfer::{establish, Role};
use crate::transport::{sys, Bus, Group};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Run the sender until shutdown. Fatal startup problems surface as an
/// error; delivery failures are retried per the configured policy.
pub async fn run(config: SenderConfig, shutdown: Shutdown) -> Result<()> {
    config.validate()?;

    fsutil::ensure_dir(&config.incoming_dir)?;
    fsutil::ensure_dir(&config.processing_dir)?;
    fsutil::ensure_dir(&config.error_dir)?;
    for peer in &config.peers {
        fsutil::ensure_dir(&config.processing_dir.join(&peer.ident))?;
        fsutil::ensure_dir(&config.error_dir.join(&peer.ident))?;
    }
    for local in &config.local_directories {
        fsutil::ensure_dir(&local.path)?;
    }

    let credentials = match &config.tls {
        Some(tls) => Some(tls.build()?),
        None => None,
    };
    let bus = Bus::new(credentials);

    let peers: Vec<Arc<Peer>> = config
        .peers
        .iter()
        .map(|p| Arc::new(Peer::new(p.clone())))
        .collect();

    let intake = Intake::new(&config, peers.clone())?;
    intake.enqueue_leftovers()?;

    // Turn the shutdown flag into queue and bus teardown so every blocked
    // worker wakes up.
    {
        let peers = peers.clone();
        let bus = bus.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown.wait().await;
            for peer in &peers {
                peer.shutdown_queue();
            }
            bus.shutdown();
        });
    }

    let intake_task = tokio::spawn(intake.run(shutdown.clone()));

    let worker_config = WorkerConfig {
        local_ident: config.ident.clone(),
        block_size: config.block_size,
        send_attempts: config.send_attempts,
        error_dir: config.error_dir.clone(),
        keepalive: config.keepalive,
        reconnect_interval: config.reconnect_interval,
        dial: config.mode == Mode::Client,
    };
    let workers: Vec<_> = peers
        .iter()
        .map(|p| {
            tokio::spawn(peer::worker(
                bus.clone(),
                Arc::clone(p),
                worker_config.clone(),
                shutdown.clone(),
            ))
        })
        .collect();

    if config.mode == Mode::Server {
        let group = bus.group();
        bus.listen(&group, &config.listen, config.keepalive).await?;
        dispatch(&bus, &group, &config, &peers).await;
    }

    let _ = intake_task.await;
    for worker in workers {
        let _ = worker.await;
    }
    bus.shutdown();
    bus.join().await;

    for peer in &peers {
        info!(
            peer = %peer.ident(),
            files = peer.files_sent.load(Ordering::Relaxed),
            bytes = peer.bytes_sent.load(Ordering::Relaxed),
            pending = peer.queue_len(),
            "delivery totals"
        );
    }
    info!("sender stopped");
    Ok(())
}

/// Server mode: receivers dial us. Each accepted channel is handshaked and
/// handed to the matching peer's worker.
async fn dispatch(bus: &Bus, group: &Group, config: &SenderConfig, peers: &[Arc<Peer>]) {
    let allowed: Vec<String> = peers.iter().map(|p| p.ident().to_string()).collect();
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
                let ident = config.ident.clone();
                let allowed = allowed.clone();
                let peers: Vec<Arc<Peer>> = peers.to_vec();
                let task = tokio::spawn(async move {
                    match establish(session_group, channel, Role::Sender, &ident, Some(&allowed))
                        .await
                    {
                        Ok(link) => {
                            match peers.iter().find(|p| p.ident() == link.peer_ident) {
                                Some(peer) => peer.offer_link(link).await,
                                None => {
                                    // The allowlist already vetted this; a miss
                                    // here means the peer set changed.
                                    warn!(peer = %link.peer_ident, "no worker for peer");
                                    link.disconnect().await;
                                }
                            }
                        }
                        Err(err) => debug!(%err, "handshake failed"),
                    }
                });
                bus.track_task(task);
            }
            sys::CHANNEL_DIED => {
                debug!(channel = msg.channel, "channel died before a worker claimed it");
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
