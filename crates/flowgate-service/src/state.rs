//! The one long-lived service state, constructed at startup and torn down
//! at shutdown. Everything the handlers need hangs off this.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{info, warn};

use flowgate_common::consts;
use flowgate_common::proto::Source;
use flowgate_common::{Error, Result};
use flowgate_engine::Orchestrator;
use flowgate_policy::Policy;
use flowgate_store::{AuditEntry, AuditEvent, AuditLog, HistoryStore, LkgLoad, LkgStore};
use flowgate_wfp::EngineBackend;

use crate::config::ServiceConfig;
use crate::ratelimit::RateLimiter;
use crate::watcher::FileWatcher;
use crate::worker::{ApplyRequest, Worker, WorkerHandle};

pub struct ServiceState {
    pub config: ServiceConfig,
    pub data_dir: PathBuf,
    pub started_at: Instant,
    pub audit: Arc<AuditLog>,
    pub lkg: Arc<LkgStore>,
    pub history: Arc<HistoryStore>,
    pub current_policy: Arc<Mutex<Option<Policy>>>,
    pub worker: WorkerHandle,
    pub watcher: FileWatcher,
    pub rate_limiter: RateLimiter,
}

impl ServiceState {
    pub fn new(
        config: ServiceConfig,
        data_dir: PathBuf,
        backend: Arc<dyn EngineBackend>,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&data_dir)
            .map_err(|e| Error::Service(format!("data dir create failed: {e}")))?;

        let audit = Arc::new(AuditLog::new(&data_dir));
        let lkg = Arc::new(LkgStore::new(&data_dir));
        let history = Arc::new(HistoryStore::new(&data_dir));
        let current_policy = Arc::new(Mutex::new(None));

        let worker = Worker::spawn(
            Orchestrator::new(backend),
            Arc::clone(&lkg),
            Arc::clone(&history),
            Arc::clone(&current_policy),
        );
        let watcher = FileWatcher::new(
            worker.clone(),
            Arc::clone(&audit),
            config.file_watch.debounce_ms,
        );

        Ok(Arc::new(Self {
            config,
            data_dir,
            started_at: Instant::now(),
            audit,
            lkg,
            history,
            current_policy,
            worker,
            watcher,
            rate_limiter: RateLimiter::default(),
        }))
    }

    pub fn socket_path(&self) -> PathBuf {
        self.data_dir.join(consts::SOCKET_FILE)
    }

    pub fn loaded_policy(&self) -> Option<Policy> {
        self.current_policy.lock().unwrap().clone()
    }

    /// Startup recovery: apply the LKG if configured. Every outcome is
    /// audited and none of them is fatal; a broken LKG leaves the host
    /// fail-open with no filters installed.
    pub async fn apply_lkg_on_startup(&self) {
        if !self.config.auto_apply_lkg_on_startup {
            return;
        }
        match self.lkg.load() {
            LkgLoad::NotFound => {
                info!("no LKG policy to apply on startup");
            }
            LkgLoad::Corrupt(reason) => {
                warn!(%reason, "LKG policy is corrupt; starting with no filters");
                self.audit.append(
                    &AuditEntry::new(AuditEvent::LkgLoad, Source::Startup)
                        .failure_reason("InvalidState", reason),
                );
            }
            LkgLoad::Ok { record, .. } => {
                let request = ApplyRequest {
                    policy_json: record.policy_json,
                    source: Source::Startup,
                    source_path: record.source_path,
                    save_lkg: false,
                };
                match self.worker.apply(request).await {
                    Ok(stats) => {
                        info!(created = stats.filters_created, "LKG policy applied on startup");
                        self.audit.append(
                            &AuditEntry::new(AuditEvent::LkgLoad, Source::Startup)
                                .success()
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
                        warn!(?err, "startup LKG apply failed; starting with no filters");
                        self.audit.append(
                            &AuditEntry::new(AuditEvent::LkgLoad, Source::Startup).failure(&err),
                        );
                    }
                }
            }
        }
    }

    /// Binds the control endpoint, replacing a stale socket file from a
    /// previous run. Mode 0o660: the service principal and its group.
    #[cfg(unix)]
    pub fn bind_endpoint(&self) -> Result<tokio::net::UnixListener> {
        let path = self.socket_path();
        if path.exists() {
            let _ = std::fs::remove_file(&path);
        }
        let listener = tokio::net::UnixListener::bind(&path)
            .map_err(|e| Error::Service(format!("endpoint bind failed: {e}")))?;
        restrict_socket(&path);
        Ok(listener)
    }
}

#[cfg(unix)]
fn restrict_socket(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(err) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o660)) {
        warn!(?err, path = %path.display(), "socket permission tightening failed");
    }
}
