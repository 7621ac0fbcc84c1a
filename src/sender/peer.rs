//! Per-peer delivery: a prioritized queue of staged files and the worker
//! that drains it.
//!
//! Each peer owns an unfair multiqueue with a high and a low subqueue, so
//! every high-priority file leaves before any low-priority one. A failed
//! attempt requeues on low priority until the attempt ceiling drops the
//! item; a rejected file moves to the error directory and is never retried.

use crate::config::PeerConfig;
use crate::error::Result;
use crate::fsutil;
use crate::multiqueue::{Multiqueue, Order, Subqueue};
use crate::shutdown::Shutdown;
use crate::transfer::{establish, send_file, Link, Role, SendOutcome};
use crate::transport::{Bus, Group};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Priorities above this are drained first.
pub const HIGH_PRIORITY_THRESHOLD: u8 = 50;
pub const DEFAULT_PRIORITY: u8 = 50;

/// One staged file awaiting delivery to one peer.
#[derive(Debug, Clone)]
pub struct WorkItem {
    /// Path under `processing-dir/<peer-ident>/`; immutable for the life of
    /// the item.
    pub path: PathBuf,
    /// Fresh sends of this item so far.
    pub attempts: u32,
    /// Assigned at intake; decides the subqueue on every (re)queue.
    pub priority: u8,
}

impl WorkItem {
    pub fn new(path: PathBuf, priority: u8) -> Self {
        Self {
            path,
            attempts: 0,
            priority,
        }
    }

    pub fn is_high(&self) -> bool {
        self.priority > HIGH_PRIORITY_THRESHOLD
    }
}

/// Delivery state for one configured peer.
pub struct Peer {
    pub config: PeerConfig,
    queue: Multiqueue<WorkItem>,
    high: Subqueue<WorkItem>,
    low: Subqueue<WorkItem>,
    disconnecting: AtomicBool,
    remote_version: AtomicU32,
    /// Incoming links handed over by the server-mode dispatcher.
    link_tx: mpsc::Sender<Link>,
    link_rx: tokio::sync::Mutex<mpsc::Receiver<Link>>,
    pub files_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
}

impl Peer {
    pub fn new(config: PeerConfig) -> Self {
        let queue = Multiqueue::new(Order::Unfair);
        let high = queue.subqueue();
        let low = queue.subqueue();
        let (link_tx, link_rx) = mpsc::channel(1);
        Self {
            config,
            queue,
            high,
            low,
            disconnecting: AtomicBool::new(false),
            remote_version: AtomicU32::new(0),
            link_tx,
            link_rx: tokio::sync::Mutex::new(link_rx),
            files_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        }
    }

    pub fn ident(&self) -> &str {
        &self.config.ident
    }

    /// Queue a staged file on the subqueue its priority selects.
    pub fn enqueue(&self, item: WorkItem) {
        let target = if item.is_high() { &self.high } else { &self.low };
        if let Err(rejected) = target.push_back(item) {
            warn!(
                peer = %self.config.ident,
                file = %rejected.item.path.display(),
                "queue refused item ({})",
                rejected.reason
            );
        }
    }

    /// Put an item back at the head of its subqueue (shutdown or
    /// disconnect interrupted it before a fresh attempt began).
    fn requeue_front(&self, item: WorkItem) {
        let target = if item.is_high() { &self.high } else { &self.low };
        let _ = target.push_front(item);
    }

    /// A failed attempt always retries at low priority.
    fn requeue_low(&self, item: WorkItem) {
        let _ = self.low.push_back(item);
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn shutdown_queue(&self) {
        self.queue.shutdown();
    }

    pub fn set_disconnecting(&self, value: bool) {
        self.disconnecting.store(value, AtomicOrdering::SeqCst);
    }

    pub fn is_disconnecting(&self) -> bool {
        self.disconnecting.load(AtomicOrdering::SeqCst)
    }

    pub fn remote_version(&self) -> u32 {
        self.remote_version.load(AtomicOrdering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) async fn queue_get_for_test(&self) -> WorkItem {
        self.queue.get().await.unwrap()
    }

    /// Server-mode dispatcher hands an authenticated link to the worker.
    pub async fn offer_link(&self, link: Link) {
        if self.link_tx.send(link).await.is_err() {
            debug!(peer = %self.config.ident, "worker gone, dropping link");
        }
    }
}

/// Knobs the worker needs from the sender configuration.
#[derive(Clone)]
pub struct WorkerConfig {
    pub local_ident: String,
    pub block_size: u32,
    /// 0 means unlimited.
    pub send_attempts: u32,
    pub error_dir: PathBuf,
    pub keepalive: u32,
    pub reconnect_interval: u64,
    pub dial: bool,
}

/// Drive one peer until shutdown: obtain a link (dialing or waiting for
/// the dispatcher), then drain the queue through it.
pub async fn worker(bus: Bus, peer: Arc<Peer>, config: WorkerConfig, shutdown: Shutdown) {
    let retry = Duration::from_secs(config.reconnect_interval.max(1));
    // One group serves every connection this worker ever makes.
    let dial_group = bus.group();
    loop {
        if shutdown.is_triggered() {
            return;
        }

        let link = if config.dial {
            // Clear anything a previous dead link left behind.
            while let Ok(Some(_)) = dial_group.try_recv() {}
            match dial(&bus, &dial_group, &peer, &config).await {
                Ok(link) => link,
                Err(err) => {
                    debug!(peer = %peer.ident(), %err, "connection attempt failed");
                    tokio::select! {
                        _ = shutdown.wait() => return,
                        _ = tokio::time::sleep(retry) => continue,
                    }
                }
            }
        } else {
            let mut link_rx = peer.link_rx.lock().await;
            tokio::select! {
                _ = shutdown.wait() => return,
                link = link_rx.recv() => match link {
                    Some(link) => link,
                    None => return,
                },
            }
        };

        peer.remote_version
            .store(link.peer_version, AtomicOrdering::SeqCst);
        peer.set_disconnecting(false);
        info!(peer = %peer.ident(), version = link.peer_version, "delivery link up");

        if let Err(fatal) = drain(&peer, &link, &config, &shutdown).await {
            warn!(peer = %peer.ident(), %fatal, "worker going down");
            link.close();
            return;
        }
        link.close();

        if config.dial && !shutdown.is_triggered() {
            tokio::select! {
                _ = shutdown.wait() => return,
                _ = tokio::time::sleep(retry) => {}
            }
        }
    }
}

async fn dial(bus: &Bus, group: &Group, peer: &Peer, config: &WorkerConfig) -> Result<Link> {
    let endpoints = peer.config.resolve()?;
    let mut last_err = crate::error::Error::Closed;
    for (host, addr) in endpoints {
        match bus.connect(group, &host, addr, config.keepalive).await {
            Ok(channel) => {
                let expected = [peer.config.ident.clone()];
                return establish(
                    group.clone(),
                    channel,
                    Role::Sender,
                    &config.local_ident,
                    Some(&expected),
                )
                .await;
            }
            Err(err) => {
                debug!(peer = %peer.config.ident, %addr, %err, "dial failed");
                last_err = err;
            }
        }
    }
    Err(last_err)
}

/// Pump queue items through one link until it dies or shutdown. `Err`
/// means a fatal local condition; the worker must not continue.
async fn drain(
    peer: &Peer,
    link: &Link,
    config: &WorkerConfig,
    shutdown: &Shutdown,
) -> Result<()> {
    loop {
        let item = tokio::select! {
            item = peer.queue.get() => match item {
                Ok(item) => item,
                // Queue shut down: the engine is coming down.
                Err(_) => return Ok(()),
            },
            // Anything arriving outside a transfer means the link is done;
            // a death notification lands here too.
            out_of_band = link.recv() => {
                match out_of_band {
                    Ok((ty, _)) => debug!(peer = %peer.ident(), ?ty, "unexpected message between files"),
                    Err(_) => debug!(peer = %peer.ident(), "link lost"),
                }
                peer.set_disconnecting(true);
                return Ok(());
            }
        };

        if shutdown.is_triggered() || peer.is_disconnecting() {
            peer.requeue_front(item);
            return Ok(());
        }

        let mut item = item;
        item.attempts += 1;
        let size = std::fs::metadata(&item.path).map(|m| m.len()).unwrap_or(0);

        match send_file(link, &item.path, config.block_size).await {
            SendOutcome::Succeeded => {
                peer.files_sent.fetch_add(1, AtomicOrdering::Relaxed);
                peer.bytes_sent.fetch_add(size, AtomicOrdering::Relaxed);
            }
            SendOutcome::Impossible => {
                move_to_error_dir(&config.error_dir, peer.ident(), &item);
            }
            SendOutcome::LocalFailed => {
                // The file went away or could not be mapped; the link is
                // still fine.
                retry_or_drop(peer, config, item);
            }
            SendOutcome::Failed => {
                retry_or_drop(peer, config, item);
                peer.set_disconnecting(true);
                return Ok(());
            }
            SendOutcome::Fatal => {
                return Err(crate::error::Error::generic(format!(
                    "cannot clean up after delivering {}",
                    item.path.display()
                )));
            }
        }
    }
}

/// Requeue a failed item at low priority, or drop it (leaving the staged
/// file for the operator) once the attempt ceiling is reached.
fn retry_or_drop(peer: &Peer, config: &WorkerConfig, item: WorkItem) {
    if config.send_attempts > 0 && item.attempts >= config.send_attempts {
        warn!(
            peer = %peer.ident(),
            file = %item.path.display(),
            attempts = item.attempts,
            "giving up on file"
        );
    } else {
        peer.requeue_low(item);
    }
}

/// Peer-rejected files are parked under `error-dir/<peer-ident>/` for the
/// operator.
fn move_to_error_dir(error_dir: &std::path::Path, ident: &str, item: &WorkItem) {
    let dir = error_dir.join(ident);
    let Some(name) = item.path.file_name() else {
        return;
    };
    let target = dir.join(name);
    if let Err(err) = fsutil::ensure_dir(&dir).and_then(|()| fsutil::move_file(&item.path, &target))
    {
        warn!(
            file = %item.path.display(),
            %err,
            "cannot move rejected file to the error directory"
        );
    } else {
        info!(file = %target.display(), peer = %ident, "file parked in error directory");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> Peer {
        Peer::new(PeerConfig {
            ident: "downstream".to_string(),
            addresses: vec![],
        })
    }

    #[tokio::test]
    async fn high_priority_drains_before_low() {
        let peer = peer();
        peer.enqueue(WorkItem::new(PathBuf::from("/q/b-low"), 20));
        peer.enqueue(WorkItem::new(PathBuf::from("/q/a-high"), 80));
        peer.enqueue(WorkItem::new(PathBuf::from("/q/c-default"), DEFAULT_PRIORITY));

        // Scenario: priorities 80, 20, default 50 deliver as high, then the
        // two lows in arrival order.
        let first = peer.queue.get().await.unwrap();
        assert_eq!(first.path, PathBuf::from("/q/a-high"));
        let second = peer.queue.get().await.unwrap();
        assert_eq!(second.path, PathBuf::from("/q/b-low"));
        let third = peer.queue.get().await.unwrap();
        assert_eq!(third.path, PathBuf::from("/q/c-default"));
    }

    #[tokio::test]
    async fn requeue_front_preserves_position_and_priority() {
        let peer = peer();
        peer.enqueue(WorkItem::new(PathBuf::from("/q/one"), 80));
        peer.enqueue(WorkItem::new(PathBuf::from("/q/two"), 80));

        let got = peer.queue.get().await.unwrap();
        peer.requeue_front(got);
        assert_eq!(peer.queue.get().await.unwrap().path, PathBuf::from("/q/one"));
        assert_eq!(peer.queue.get().await.unwrap().path, PathBuf::from("/q/two"));
    }

    #[tokio::test]
    async fn failed_items_requeue_on_low() {
        let peer = peer();
        let mut item = WorkItem::new(PathBuf::from("/q/urgent"), 90);
        item.attempts = 1;
        peer.requeue_low(item);
        peer.enqueue(WorkItem::new(PathBuf::from("/q/fresh-high"), 70));

        // The retried item lost its head start.
        assert_eq!(
            peer.queue.get().await.unwrap().path,
            PathBuf::from("/q/fresh-high")
        );
        assert_eq!(peer.queue.get().await.unwrap().path, PathBuf::from("/q/urgent"));
    }

    #[test]
    fn priority_threshold() {
        assert!(WorkItem::new(PathBuf::new(), 51).is_high());
        assert!(!WorkItem::new(PathBuf::new(), 50).is_high());
        assert!(!WorkItem::new(PathBuf::new(), 0).is_high());
        assert!(WorkItem::new(PathBuf::new(), 100).is_high());
    }
}
