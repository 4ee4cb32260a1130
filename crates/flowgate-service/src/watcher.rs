//! Hot-reload watcher for a single policy file.
//!
//! The notifier sits on the file's parent directory (watching the file
//! directly breaks on editors that replace-by-rename); every event touching
//! the file restarts the debounce timer, and only a quiet period triggers a
//! read-validate-apply through the engine worker. Failures of any step leave
//! the previously applied policy in force: the watcher is strictly
//! fail-open. Rename or deletion of the file is an error-counted apply
//! attempt, not a state change; the watcher stays armed until reset.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use notify::{RecursiveMode, Watcher as _};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use flowgate_common::proto::Source;
use flowgate_common::{Error, Result};
use flowgate_store::{AuditEntry, AuditEvent, AuditLog};

use crate::worker::{ApplyRequest, WorkerHandle};

const READ_RETRIES: u32 = 3;
const READ_RETRY_DELAY: Duration = Duration::from_millis(120);

#[derive(Debug, Clone, Default)]
struct WatchStats {
    apply_count: u64,
    error_count: u64,
    last_apply_time: Option<DateTime<Utc>>,
    last_error: Option<String>,
    last_error_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchStatus {
    pub watching: Option<String>,
    pub debounce_ms: u64,
    pub apply_count: u64,
    pub error_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_apply_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_time: Option<DateTime<Utc>>,
}

struct Shared {
    watching: Option<PathBuf>,
    stop: Option<mpsc::Sender<()>>,
    stats: WatchStats,
}

pub struct FileWatcher {
    worker: WorkerHandle,
    audit: Arc<AuditLog>,
    debounce: Duration,
    shared: Arc<Mutex<Shared>>,
}

impl FileWatcher {
    pub fn new(worker: WorkerHandle, audit: Arc<AuditLog>, debounce_ms: u64) -> Self {
        Self {
            worker,
            audit,
            debounce: Duration::from_millis(debounce_ms),
            shared: Arc::new(Mutex::new(Shared {
                watching: None,
                stop: None,
                stats: WatchStats::default(),
            })),
        }
    }

    /// Points the watcher at a new file, or clears it with `None`. Active
    /// filters are never touched by a watch change.
    pub fn set(&self, path: Option<PathBuf>) -> Result<WatchStatus> {
        // Stop the previous notifier task, if any.
        {
            let mut shared = self.shared.lock().unwrap();
            shared.stop.take();
            shared.watching = None;
        }

        if let Some(path) = path {
            let parent = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => PathBuf::from("."),
            };
            if !parent.is_dir() {
                return Err(Error::InvalidArgument(format!(
                    "watch directory '{}' does not exist",
                    parent.display()
                )));
            }

            // Register the notifier before reporting success, so a write
            // that lands right after watch-set is already covered.
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            let mut notifier = notify::recommended_watcher(move |event| {
                let _ = event_tx.send(event);
            })
            .map_err(|err| Error::Service(format!("filesystem notifier failed: {err}")))?;
            notifier
                .watch(&parent, RecursiveMode::NonRecursive)
                .map_err(|err| {
                    Error::Service(format!(
                        "cannot watch '{}': {err}",
                        parent.display()
                    ))
                })?;

            let (stop_tx, stop_rx) = mpsc::channel(1);
            {
                let mut shared = self.shared.lock().unwrap();
                shared.watching = Some(path.clone());
                shared.stop = Some(stop_tx);
                shared.stats = WatchStats::default();
            }
            let task = WatchTask {
                worker: self.worker.clone(),
                audit: Arc::clone(&self.audit),
                shared: Arc::clone(&self.shared),
                debounce: self.debounce,
                path: path.clone(),
            };
            tokio::spawn(task.run(notifier, event_rx, stop_rx));
            info!(path = %path.display(), "watch set");
        } else {
            info!("watch cleared");
        }
        Ok(self.status())
    }

    pub fn status(&self) -> WatchStatus {
        let shared = self.shared.lock().unwrap();
        WatchStatus {
            watching: shared
                .watching
                .as_ref()
                .map(|p| p.display().to_string()),
            debounce_ms: self.debounce.as_millis() as u64,
            apply_count: shared.stats.apply_count,
            error_count: shared.stats.error_count,
            last_apply_time: shared.stats.last_apply_time,
            last_error: shared.stats.last_error.clone(),
            last_error_time: shared.stats.last_error_time,
        }
    }
}

struct WatchTask {
    worker: WorkerHandle,
    audit: Arc<AuditLog>,
    shared: Arc<Mutex<Shared>>,
    debounce: Duration,
    path: PathBuf,
}

impl WatchTask {
    async fn run(
        self,
        notifier: notify::RecommendedWatcher,
        mut event_rx: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
        mut stop_rx: mpsc::Receiver<()>,
    ) {
        // Dropping the notifier unregisters the watch; keep it alive for the
        // lifetime of this task.
        let _notifier = notifier;

        let far_future = Duration::from_secs(24 * 3600);
        let mut deadline = Instant::now() + far_future;
        let mut pending = false;

        loop {
            tokio::select! {
                // Sender dropped or explicit stop: either way, stand down.
                _ = stop_rx.recv() => break,
                event = event_rx.recv() => {
                    match event {
                        None => break,
                        Some(Err(err)) => {
                            debug!(?err, "notifier error event");
                        }
                        Some(Ok(event)) => {
                            if self.is_ours(&event) {
                                // Coalesce bursts: each event re-arms the timer.
                                pending = true;
                                deadline = Instant::now() + self.debounce;
                            }
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline), if pending => {
                    pending = false;
                    deadline = Instant::now() + far_future;
                    self.reload().await;
                }
            }
        }
        debug!(path = %self.path.display(), "watch task stopped");
    }

    fn is_ours(&self, event: &notify::Event) -> bool {
        let ours = self.path.file_name();
        event
            .paths
            .iter()
            .any(|p| p.file_name() == ours && ours.is_some())
    }

    async fn reload(&self) {
        self.audit.append(
            &AuditEntry::new(AuditEvent::WatchApplyStarted, Source::HotReload)
                .policy_file(&self.path.display().to_string()),
        );
        match self.read_and_apply().await {
            Ok(stats) => {
                let mut shared = self.shared.lock().unwrap();
                shared.stats.apply_count += 1;
                shared.stats.last_apply_time = Some(Utc::now());
                drop(shared);
                self.audit.append(
                    &AuditEntry::new(AuditEvent::WatchApplyFinished, Source::HotReload)
                        .success()
                        .policy_file(&self.path.display().to_string())
                        .policy_version(&stats.policy_version)
                        .counts(
                            stats.filters_created,
                            stats.filters_removed,
                            stats.rules_skipped,
                            stats.total_rules,
                        ),
                );
            }
            Err(err) => {
                warn!(?err, path = %self.path.display(), "watched reload failed; previous policy stays in effect");
                self.record_error(err.to_string());
                self.audit.append(
                    &AuditEntry::new(AuditEvent::WatchApplyFinished, Source::HotReload)
                        .failure(&err)
                        .policy_file(&self.path.display().to_string()),
                );
            }
        }
    }

    async fn read_and_apply(&self) -> Result<flowgate_engine::ApplyStats> {
        let bytes = self.read_with_retries().await?;
        let policy_json = String::from_utf8(bytes)
            .map_err(|_| Error::InvalidArgument("policy file is not UTF-8".to_string()))?;
        self.worker
            .apply(ApplyRequest {
                policy_json,
                source: Source::HotReload,
                source_path: self.path.display().to_string(),
                save_lkg: true,
            })
            .await
    }

    /// Editors briefly hold the file locked or truncated mid-save.
    async fn read_with_retries(&self) -> Result<Vec<u8>> {
        let mut last_err: Option<std::io::Error> = None;
        for attempt in 0..READ_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(READ_RETRY_DELAY).await;
            }
            match tokio::fs::read(&self.path).await {
                Ok(bytes) => return Ok(bytes),
                Err(err) => last_err = Some(err),
            }
        }
        Err(Error::from(last_err.expect("at least one attempt")))
    }

    fn record_error(&self, message: String) {
        let mut shared = self.shared.lock().unwrap();
        shared.stats.error_count += 1;
        shared.stats.last_error = Some(message);
        shared.stats.last_error_time = Some(Utc::now());
    }
}
