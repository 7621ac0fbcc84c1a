//! Incoming-directory intake: discover files, mirror them to local
//! destinations, stage them per peer, and queue the work.
//!
//! A file is only picked up once its size is stable across two consecutive
//! polls, so half-written drops are left alone. Staging hard-links the file
//! into every matching peer's processing directory before anything is
//! queued, so no worker can deliver and unlink ahead of the other peers
//! seeing the source.

use super::peer::{Peer, WorkItem, DEFAULT_PRIORITY};
use crate::config::{LocalDirectory, SenderConfig};
use crate::error::Result;
use crate::fsutil;
use crate::shutdown::Shutdown;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct Intake {
    incoming_dir: PathBuf,
    processing_dir: PathBuf,
    local_dirs: Vec<LocalDirectory>,
    unique_local_copies: bool,
    filters: Vec<(String, Regex)>,
    priorities: Vec<(u8, Regex)>,
    peers: Vec<Arc<Peer>>,
    polling_interval: Duration,
    /// name -> size seen on the previous poll; equal size means settled.
    settling: HashMap<OsString, u64>,
    /// Files already reported as matching no destination.
    unmatched_reported: HashSet<OsString>,
}

impl Intake {
    pub fn new(config: &SenderConfig, peers: Vec<Arc<Peer>>) -> Result<Self> {
        let mut filters = Vec::with_capacity(config.filters.len());
        for rule in &config.filters {
            filters.push((rule.ident.clone(), rule.compile()?));
        }
        let mut priorities = Vec::with_capacity(config.priorities.len());
        for rule in &config.priorities {
            priorities.push((rule.priority, rule.compile()?));
        }
        Ok(Self {
            incoming_dir: config.incoming_dir.clone(),
            processing_dir: config.processing_dir.clone(),
            local_dirs: config.local_directories.clone(),
            unique_local_copies: config.unique_local_copies,
            filters,
            priorities,
            peers,
            polling_interval: Duration::from_secs(config.polling_interval.max(1)),
            settling: HashMap::new(),
            unmatched_reported: HashSet::new(),
        })
    }

    /// First matching priority rule wins; unmatched files run at the
    /// default.
    pub fn priority_for(&self, name: &str) -> u8 {
        self.priorities
            .iter()
            .find(|(_, regex)| regex.is_match(name))
            .map(|(priority, _)| *priority)
            .unwrap_or(DEFAULT_PRIORITY)
    }

    /// An identity with no filter rules takes everything; with rules, any
    /// match selects the file.
    pub fn ident_matches(&self, ident: &str, name: &str) -> bool {
        let mut saw_rule = false;
        for (rule_ident, regex) in &self.filters {
            if rule_ident == ident {
                saw_rule = true;
                if regex.is_match(name) {
                    return true;
                }
            }
        }
        !saw_rule
    }

    /// Startup pass: files already staged under `processing-dir/<ident>`
    /// (left over from a previous run) go straight onto the queues.
    pub fn enqueue_leftovers(&self) -> Result<()> {
        for peer in &self.peers {
            let dir = self.processing_dir.join(peer.ident());
            fsutil::ensure_dir(&dir)?;
            let mut leftovers = Vec::new();
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                if !entry.file_type()?.is_file() {
                    continue;
                }
                let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                    warn!(path = %entry.path().display(), "skipping non-UTF-8 name");
                    continue;
                };
                leftovers.push((self.priority_for(&name), entry.path()));
            }
            if leftovers.is_empty() {
                continue;
            }
            info!(
                peer = %peer.ident(),
                files = leftovers.len(),
                "re-queueing staged files from a previous run"
            );
            leftovers.sort_by(|a, b| b.0.cmp(&a.0));
            for (priority, path) in leftovers {
                peer.enqueue(WorkItem::new(path, priority));
            }
        }
        Ok(())
    }

    /// Poll the incoming directory until shutdown.
    pub async fn run(mut self, shutdown: Shutdown) {
        loop {
            if let Err(err) = self.scan_once() {
                warn!(%err, "incoming-directory scan failed");
            }
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = tokio::time::sleep(self.polling_interval) => {}
            }
        }
        debug!("intake stopped");
    }

    fn scan_once(&mut self) -> Result<()> {
        let mut settled = Vec::new();
        let mut seen = HashSet::new();

        for entry in fs::read_dir(&self.incoming_dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let os_name = entry.file_name();
            if os_name.to_string_lossy().starts_with('.') {
                continue;
            }
            seen.insert(os_name.clone());
            let size = meta.len();
            match self.settling.get(&os_name) {
                Some(previous) if *previous == size => {
                    settled.push((os_name, entry.path()));
                }
                _ => {
                    self.settling.insert(os_name, size);
                }
            }
        }
        // Names that vanished between polls.
        self.settling.retain(|name, _| seen.contains(name));
        self.unmatched_reported.retain(|name| seen.contains(name));

        // Stage the batch in priority order so a higher-priority file is
        // queued ahead of its contemporaries everywhere.
        let mut batch = Vec::with_capacity(settled.len());
        for (os_name, path) in settled {
            let Some(name) = os_name.to_str().map(str::to_owned) else {
                warn!(path = %path.display(), "skipping non-UTF-8 name");
                continue;
            };
            batch.push((self.priority_for(&name), name, path));
        }
        batch.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

        for (priority, name, path) in batch {
            self.stage_file(&name, &path, priority);
        }
        Ok(())
    }

    /// Mirror one settled file to the matching local destinations, stage it
    /// for the matching peers, and remove the source once every consumer
    /// has its link.
    fn stage_file(&mut self, name: &str, path: &PathBuf, priority: u8) {
        let mut mirrored = false;
        for local in &self.local_dirs {
            let applies = match &local.ident {
                Some(ident) => self.ident_matches(ident, name),
                None => true,
            };
            if !applies {
                continue;
            }
            let dest = local.path.join(name);
            match fsutil::link_or_copy(path, &dest, self.unique_local_copies) {
                Ok(()) => mirrored = true,
                Err(err) => {
                    warn!(file = %name, dest = %local.path.display(), %err, "local mirror failed")
                }
            }
        }

        let mut staged: Vec<(usize, WorkItem)> = Vec::new();
        for (idx, peer) in self.peers.iter().enumerate() {
            if !self.ident_matches(peer.ident(), name) {
                continue;
            }
            let staged_path = self.processing_dir.join(peer.ident()).join(name);
            match fsutil::link_or_copy(path, &staged_path, false) {
                Ok(()) => staged.push((idx, WorkItem::new(staged_path, priority))),
                Err(err) => {
                    warn!(file = %name, peer = %peer.ident(), %err, "staging failed");
                }
            }
        }

        if staged.is_empty() && !mirrored {
            if self.unmatched_reported.insert(OsString::from(name)) {
                info!(file = %name, "no peer or local destination matches; leaving in place");
            }
            return;
        }

        // Every peer has its own link now; queueing can no longer race the
        // source unlink below.
        for (idx, item) in staged {
            self.peers[idx].enqueue(item);
        }

        if let Err(err) = fs::remove_file(path) {
            warn!(file = %name, %err, "cannot remove intake file");
        }
        self.settling.remove(&OsString::from(name));
        debug!(file = %name, priority, "file dispatched");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FilterRule, PeerConfig, PriorityRule};
    use tempfile::TempDir;

    fn base_config(tmp: &TempDir) -> SenderConfig {
        toml::from_str::<SenderConfig>(&format!(
            r#"
                ident = "site-a"
                incoming_dir = "{0}/incoming"
                processing_dir = "{0}/processing"
                error_dir = "{0}/error"

                [[peers]]
                ident = "site-b"
                addresses = ["127.0.0.1:1"]
            "#,
            tmp.path().display()
        ))
        .unwrap()
    }

    fn setup(config: &SenderConfig) -> Vec<Arc<Peer>> {
        fs::create_dir_all(&config.incoming_dir).unwrap();
        let peers: Vec<Arc<Peer>> = config
            .peers
            .iter()
            .map(|p| Arc::new(Peer::new(p.clone())))
            .collect();
        for peer in &peers {
            fs::create_dir_all(config.processing_dir.join(peer.ident())).unwrap();
        }
        peers
    }

    fn settle_and_scan(intake: &mut Intake) {
        // Two scans: the first observes the size, the second stages.
        intake.scan_once().unwrap();
        intake.scan_once().unwrap();
    }

    #[test]
    fn priority_rules_first_match_wins() {
        let tmp = TempDir::new().unwrap();
        let mut config = base_config(&tmp);
        config.priorities = vec![
            PriorityRule {
                priority: 80,
                pattern: "^urgent-".to_string(),
            },
            PriorityRule {
                priority: 20,
                pattern: "-bulk\\.".to_string(),
            },
            PriorityRule {
                priority: 90,
                pattern: "^urgent-really".to_string(),
            },
        ];
        let peers = setup(&config);
        let intake = Intake::new(&config, peers).unwrap();

        assert_eq!(intake.priority_for("urgent-really.bin"), 80);
        assert_eq!(intake.priority_for("data-bulk.bin"), 20);
        assert_eq!(intake.priority_for("plain.bin"), DEFAULT_PRIORITY);
    }

    #[test]
    fn filterless_ident_takes_everything() {
        let tmp = TempDir::new().unwrap();
        let mut config = base_config(&tmp);
        config.filters = vec![FilterRule {
            ident: "site-c".to_string(),
            pattern: "\\.bin$".to_string(),
        }];
        let peers = setup(&config);
        let intake = Intake::new(&config, peers).unwrap();

        assert!(intake.ident_matches("site-b", "anything.txt"));
        assert!(intake.ident_matches("site-c", "file.bin"));
        assert!(!intake.ident_matches("site-c", "file.txt"));
    }

    #[test]
    fn settled_file_is_staged_and_source_removed() {
        let tmp = TempDir::new().unwrap();
        let config = base_config(&tmp);
        let peers = setup(&config);
        let mut intake = Intake::new(&config, peers.clone()).unwrap();

        let src = config.incoming_dir.join("payload.bin");
        fs::write(&src, b"data").unwrap();
        settle_and_scan(&mut intake);

        assert!(!src.exists());
        let staged = config.processing_dir.join("site-b/payload.bin");
        assert!(staged.exists());
        assert_eq!(peers[0].queue_len(), 1);
    }

    #[test]
    fn growing_file_is_left_alone() {
        let tmp = TempDir::new().unwrap();
        let config = base_config(&tmp);
        let peers = setup(&config);
        let mut intake = Intake::new(&config, peers.clone()).unwrap();

        let src = config.incoming_dir.join("growing.bin");
        fs::write(&src, b"v1").unwrap();
        intake.scan_once().unwrap();
        // The file grew between polls: not settled yet.
        fs::write(&src, b"v1 plus more").unwrap();
        intake.scan_once().unwrap();
        assert!(src.exists());
        assert_eq!(peers[0].queue_len(), 0);

        // Stable across the next poll: picked up.
        intake.scan_once().unwrap();
        assert!(!src.exists());
        assert_eq!(peers[0].queue_len(), 1);
    }

    #[test]
    fn unmatched_file_stays_in_incoming() {
        let tmp = TempDir::new().unwrap();
        let mut config = base_config(&tmp);
        config.filters = vec![FilterRule {
            ident: "site-b".to_string(),
            pattern: "\\.bin$".to_string(),
        }];
        let peers = setup(&config);
        let mut intake = Intake::new(&config, peers.clone()).unwrap();

        let src = config.incoming_dir.join("notes.txt");
        fs::write(&src, b"keep me").unwrap();
        settle_and_scan(&mut intake);

        assert!(src.exists());
        assert_eq!(peers[0].queue_len(), 0);
    }

    #[test]
    fn multi_peer_staging_links_before_queueing() {
        let tmp = TempDir::new().unwrap();
        let mut config = base_config(&tmp);
        config.peers.push(PeerConfig {
            ident: "site-c".to_string(),
            addresses: vec!["127.0.0.1:2".to_string()],
        });
        let peers = setup(&config);
        let mut intake = Intake::new(&config, peers.clone()).unwrap();

        let src = config.incoming_dir.join("shared.bin");
        fs::write(&src, b"payload").unwrap();
        settle_and_scan(&mut intake);

        assert!(config.processing_dir.join("site-b/shared.bin").exists());
        assert!(config.processing_dir.join("site-c/shared.bin").exists());
        assert!(!src.exists());
        assert_eq!(peers[0].queue_len(), 1);
        assert_eq!(peers[1].queue_len(), 1);
    }

    #[test]
    fn local_mirror_without_peers_consumes_the_file() {
        let tmp = TempDir::new().unwrap();
        let mut config = base_config(&tmp);
        let mirror = tmp.path().join("mirror");
        fs::create_dir_all(&mirror).unwrap();
        config.local_directories = vec![LocalDirectory {
            ident: None,
            path: mirror.clone(),
        }];
        config.filters = vec![FilterRule {
            ident: "site-b".to_string(),
            pattern: "never-matches-anything".to_string(),
        }];
        let peers = setup(&config);
        let mut intake = Intake::new(&config, peers.clone()).unwrap();

        let src = config.incoming_dir.join("report.txt");
        fs::write(&src, b"body").unwrap();
        settle_and_scan(&mut intake);

        assert!(mirror.join("report.txt").exists());
        assert!(!src.exists());
        assert_eq!(peers[0].queue_len(), 0);
    }

    #[test]
    fn batch_is_queued_in_priority_order() {
        let tmp = TempDir::new().unwrap();
        let mut config = base_config(&tmp);
        config.priorities = vec![
            PriorityRule {
                priority: 80,
                pattern: "^a-".to_string(),
            },
            PriorityRule {
                priority: 20,
                pattern: "^b-".to_string(),
            },
        ];
        let peers = setup(&config);
        let mut intake = Intake::new(&config, peers.clone()).unwrap();

        for name in ["a-first.bin", "b-second.bin", "c-third.bin"] {
            fs::write(config.incoming_dir.join(name), b"data").unwrap();
        }
        settle_and_scan(&mut intake);

        // Scenario: 80 drains as high; default 50 precedes 20 in low.
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let order: Vec<String> = rt.block_on(async {
            let mut out = Vec::new();
            for _ in 0..3 {
                let item = peers[0].queue_get_for_test().await;
                out.push(item.path.file_name().unwrap().to_str().unwrap().to_string());
            }
            out
        });
        assert_eq!(order, ["a-first.bin", "c-third.bin", "b-second.bin"]);
    }

    #[test]
    fn leftovers_are_requeued_with_priorities() {
        let tmp = TempDir::new().unwrap();
        let mut config = base_config(&tmp);
        config.priorities = vec![PriorityRule {
            priority: 90,
            pattern: "^hot-".to_string(),
        }];
        let peers = setup(&config);
        fs::write(
            config.processing_dir.join("site-b/cold.bin"),
            b"left behind",
        )
        .unwrap();
        fs::write(config.processing_dir.join("site-b/hot-1.bin"), b"urgent").unwrap();

        let intake = Intake::new(&config, peers.clone()).unwrap();
        intake.enqueue_leftovers().unwrap();
        assert_eq!(peers[0].queue_len(), 2);

        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        rt.block_on(async {
            let first = peers[0].queue_get_for_test().await;
            assert_eq!(first.path.file_name().unwrap(), "hot-1.bin");
        });
    }
}
