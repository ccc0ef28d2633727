//! Per-session single-flight admission plus short-window duplicate
//! suppression.
//!
//! At most one request per session key is in flight; a byte-identical body
//! arriving within the dedupe window is rejected outright. Entries decay:
//! sessions after five minutes (abandoned), dedupe records after a minute.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::session;

#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub dedupe_window: Duration,
    pub session_ttl: Duration,
    pub dedupe_ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            dedupe_window: Duration::from_secs(2),
            session_ttl: Duration::from_secs(300),
            dedupe_ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct ActiveRequest {
    started_at: Instant,
    content_hash: String,
}

#[derive(Debug)]
struct DedupeEntry {
    first_seen: Instant,
    in_progress: bool,
}

#[derive(Debug, Default)]
struct Tables {
    active: HashMap<String, ActiveRequest>,
    dedupe: HashMap<String, DedupeEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Accepted,
    Rejected { reason: String },
}

#[derive(Debug)]
pub struct AdmissionController {
    config: AdmissionConfig,
    tables: Mutex<Tables>,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            config,
            tables: Mutex::new(Tables::default()),
        }
    }

    pub fn begin(&self, session_key: &str, body: &[u8]) -> Admission {
        let content_hash = session::content_hash(body);
        let now = Instant::now();
        let mut tables = match self.tables.lock() {
            Ok(tables) => tables,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(entry) = tables.dedupe.get(&content_hash) {
            if entry.in_progress && now.duration_since(entry.first_seen) < self.config.dedupe_window
            {
                warn!(session = %session_key, "rejecting duplicate request");
                return Admission::Rejected {
                    reason: "Duplicate request".to_string(),
                };
            }
        }

        if let Some(active) = tables.active.get(session_key) {
            if now.duration_since(active.started_at) < self.config.session_ttl {
                warn!(session = %session_key, "rejecting concurrent request for busy session");
                return Admission::Rejected {
                    reason: "Session busy".to_string(),
                };
            }
            // Older than the TTL: abandoned, the slot may be taken over.
            debug!(session = %session_key, "evicting abandoned session entry");
        }

        tables.active.insert(
            session_key.to_string(),
            ActiveRequest {
                started_at: now,
                content_hash: content_hash.clone(),
            },
        );
        tables.dedupe.insert(
            content_hash,
            DedupeEntry {
                first_seen: now,
                in_progress: true,
            },
        );
        Admission::Accepted
    }

    pub fn end(&self, session_key: &str) {
        let mut tables = match self.tables.lock() {
            Ok(tables) => tables,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(active) = tables.active.remove(session_key) {
            // The dedupe record stays for the rest of its window, no longer
            // blocking retries.
            if let Some(entry) = tables.dedupe.get_mut(&active.content_hash) {
                entry.in_progress = false;
            }
        }
    }

    pub fn sweep(&self) {
        let now = Instant::now();
        let mut tables = match self.tables.lock() {
            Ok(tables) => tables,
            Err(poisoned) => poisoned.into_inner(),
        };
        let session_ttl = self.config.session_ttl;
        let dedupe_ttl = self.config.dedupe_ttl;
        tables
            .active
            .retain(|_, entry| now.duration_since(entry.started_at) < session_ttl);
        tables
            .dedupe
            .retain(|_, entry| now.duration_since(entry.first_seen) < dedupe_ttl);
    }

    /// Background eviction pass.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let controller = Arc::clone(self);
        let interval = controller.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                controller.sweep();
            }
        })
    }
}

/// Releases the admission slot when dropped, so teardown fires on success,
/// error, and client disconnect alike.
#[derive(Debug)]
pub struct AdmissionGuard {
    controller: Arc<AdmissionController>,
    session_key: String,
}

impl AdmissionGuard {
    pub fn new(controller: Arc<AdmissionController>, session_key: String) -> Self {
        Self {
            controller,
            session_key,
        }
    }
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.controller.end(&self.session_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> AdmissionController {
        AdmissionController::new(AdmissionConfig::default())
    }

    #[test]
    fn second_request_same_session_rejected() {
        let controller = controller();
        assert_eq!(controller.begin("s1", b"body-a"), Admission::Accepted);
        match controller.begin("s1", b"body-b") {
            Admission::Rejected { reason } => assert!(reason.contains("busy")),
            other => panic!("unexpected admission: {other:?}"),
        }
        controller.end("s1");
        assert_eq!(controller.begin("s1", b"body-c"), Admission::Accepted);
    }

    #[test]
    fn duplicate_body_rejected_inside_window() {
        let controller = controller();
        assert_eq!(controller.begin("s1", b"same"), Admission::Accepted);
        match controller.begin("s2", b"same") {
            Admission::Rejected { reason } => assert!(reason.contains("Duplicate")),
            other => panic!("unexpected admission: {other:?}"),
        }
    }

    #[test]
    fn duplicate_allowed_after_completion_and_window() {
        let controller = AdmissionController::new(AdmissionConfig {
            dedupe_window: Duration::from_millis(0),
            ..AdmissionConfig::default()
        });
        assert_eq!(controller.begin("s1", b"same"), Admission::Accepted);
        controller.end("s1");
        // Window elapsed (zero here): the retry is admitted.
        assert_eq!(controller.begin("s1", b"same"), Admission::Accepted);
    }

    #[test]
    fn never_more_than_one_admitted_per_session() {
        let controller = controller();
        let mut admitted = 0u32;
        for attempt in 0..10 {
            let body = format!("body-{attempt}");
            if controller.begin("session", body.as_bytes()) == Admission::Accepted {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }

    #[test]
    fn sweep_evicts_expired_entries() {
        let controller = AdmissionController::new(AdmissionConfig {
            session_ttl: Duration::from_millis(0),
            dedupe_ttl: Duration::from_millis(0),
            ..AdmissionConfig::default()
        });
        controller.begin("s1", b"body");
        controller.sweep();
        // Entry is gone; the same session admits again.
        assert_eq!(controller.begin("s1", b"body-2"), Admission::Accepted);
    }

    #[test]
    fn guard_releases_on_drop() {
        let controller = Arc::new(controller());
        assert_eq!(controller.begin("s1", b"a"), Admission::Accepted);
        {
            let _guard = AdmissionGuard::new(Arc::clone(&controller), "s1".to_string());
        }
        assert_eq!(controller.begin("s1", b"b"), Admission::Accepted);
    }
}
