//! Hot reload for config.json and apikey.json.
//!
//! The watcher polls content hashes on a short interval rather than
//! subscribing to filesystem events; the poll interval subsumes the burst
//! of events editors produce per save, and deletion/recreation needs no
//! re-attachment. Parsed snapshots publish through an `ArcSwap` read by
//! the router and a watch channel for anyone who wants change
//! notifications.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::{self, ApiKeyRecord, AppConfig};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub config: AppConfig,
    pub api_key: Option<ApiKeyRecord>,
}

pub struct ConfigWatcher {
    snapshot: Arc<ArcSwap<Snapshot>>,
    receiver: watch::Receiver<Arc<Snapshot>>,
    handle: tokio::task::JoinHandle<()>,
}

impl ConfigWatcher {
    /// Load once synchronously, then poll in the background.
    pub fn spawn(dir: PathBuf, poll_interval: Duration) -> Self {
        let initial = Arc::new(load_snapshot(&dir, &Snapshot::default()));
        let snapshot = Arc::new(ArcSwap::from(initial.clone()));
        let (sender, receiver) = watch::channel(initial);

        let shared = Arc::clone(&snapshot);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last_digest = files_digest(&dir);
            loop {
                ticker.tick().await;
                let digest = files_digest(&dir);
                eprintln!("DEBUG tick digest={:?} last={:?}", digest, last_digest);
                if digest == last_digest {
                    continue;
                }
                last_digest = digest;
                let next = load_snapshot(&dir, &shared.load_full());
                if *shared.load_full() == next {
                    continue;
                }
                info!("configuration change detected; reloading");
                let next = Arc::new(next);
                shared.store(Arc::clone(&next));
                if sender.send(next).is_err() {
                    break;
                }
            }
        });

        Self {
            snapshot,
            receiver,
            handle,
        }
    }

    /// Cheap per-request read.
    pub fn snapshot(&self) -> Arc<ArcSwap<Snapshot>> {
        Arc::clone(&self.snapshot)
    }

    /// Change notifications for subscribers.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.receiver.clone()
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

/// A malformed file keeps its previous parsed value; a missing file resets
/// to defaults.
fn load_snapshot(dir: &std::path::Path, previous: &Snapshot) -> Snapshot {
    let config = match config::load_config(dir) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "config.json unreadable; keeping previous value");
            previous.config.clone()
        }
    };
    let api_key = match config::load_api_key(dir) {
        Ok(api_key) => api_key,
        Err(err) => {
            warn!(error = %err, "apikey.json unreadable; keeping previous value");
            previous.api_key.clone()
        }
    };
    Snapshot { config, api_key }
}

/// A digest over both files' contents; missing files hash as absent.
fn files_digest(dir: &std::path::Path) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for path in [config::config_path(dir), config::api_key_path(dir)] {
        match std::fs::read(&path) {
            Ok(bytes) => {
                hasher.update([1u8]);
                hasher.update((bytes.len() as u64).to_le_bytes());
                hasher.update(&bytes);
            }
            Err(_) => hasher.update([0u8]),
        }
    }
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[tokio::test]
    async fn publishes_changes_and_survives_recreation() {
        let dir = tempdir().unwrap();
        let watcher = ConfigWatcher::spawn(dir.path().to_path_buf(), Duration::from_millis(20));
        let snapshot = watcher.snapshot();
        assert!(snapshot.load().config.model_mapping.is_empty());

        fs::write(
            config::config_path(dir.path()),
            r#"{"modelMapping": {"gpt-4": "claude-sonnet-4-5"}}"#,
        )
        .unwrap();
        let mut receiver = watcher.subscribe();
        tokio::time::timeout(Duration::from_secs(2), receiver.changed())
            .await
            .expect("change published")
            .unwrap();
        assert_eq!(snapshot.load().config.map_model("gpt-4"), "claude-sonnet-4-5");

        // Delete and recreate; the poller keeps watching.
        fs::remove_file(config::config_path(dir.path())).unwrap();
        tokio::time::timeout(Duration::from_secs(2), receiver.changed())
            .await
            .expect("deletion published")
            .unwrap();
        assert!(snapshot.load().config.model_mapping.is_empty());

        fs::write(
            config::config_path(dir.path()),
            r#"{"modelMapping": {"gpt-4": "claude-opus-4-1"}}"#,
        )
        .unwrap();
        tokio::time::timeout(Duration::from_secs(2), receiver.changed())
            .await
            .expect("recreation published")
            .unwrap();
        assert_eq!(snapshot.load().config.map_model("gpt-4"), "claude-opus-4-1");

        watcher.abort();
    }

    #[tokio::test]
    async fn malformed_file_keeps_last_good_value() {
        let dir = tempdir().unwrap();
        fs::write(
            config::config_path(dir.path()),
            r#"{"modelMapping": {"a": "b"}}"#,
        )
        .unwrap();
        let watcher = ConfigWatcher::spawn(dir.path().to_path_buf(), Duration::from_millis(20));
        let snapshot = watcher.snapshot();
        assert_eq!(snapshot.load().config.map_model("a"), "b");

        // A half-saved file must not wipe the running mapping.
        fs::write(config::config_path(dir.path()), "{not json").unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(snapshot.load().config.map_model("a"), "b");
        watcher.abort();
    }
}
