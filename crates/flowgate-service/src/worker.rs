//! The serial engine worker.
//!
//! Exactly one task owns the engine backing; every verb from the IPC
//! surface and the file watcher is a queued work item answered over a
//! oneshot. This is what makes observed→diff→mutate atomic across
//! concurrent callers: there are no concurrent callers by construction.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use flowgate_common::proto::Source;
use flowgate_common::{Error, Result};
use flowgate_engine::{ApplyStats, BootstrapOutcome, Orchestrator};
use flowgate_policy::{Policy, ValidatedPolicy};
use flowgate_store::{HistoryStore, LkgStore};

type Reply<T> = oneshot::Sender<Result<T>>;

/// One apply-shaped request with its provenance.
#[derive(Debug)]
pub struct ApplyRequest {
    pub policy_json: String,
    pub source: Source,
    pub source_path: String,
    /// Reverting to the stored LKG must not re-save it.
    pub save_lkg: bool,
}

enum WorkItem {
    Bootstrap(Reply<BootstrapOutcome>),
    Teardown(Reply<()>),
    Apply(ApplyRequest, Reply<ApplyStats>),
    Rollback(Reply<usize>),
    DemoBlockEnable(Reply<bool>),
    DemoBlockDisable(Reply<bool>),
    DemoBlockStatus(Reply<bool>),
}

/// Cloneable handle used by IPC handlers and the watcher.
#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<WorkItem>,
}

impl WorkerHandle {
    async fn submit<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> WorkItem,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| Error::ServiceUnavailable("engine worker is gone".to_string()))?;
        reply_rx
            .await
            .map_err(|_| Error::ServiceUnavailable("engine worker dropped the request".to_string()))?
    }

    pub async fn bootstrap(&self) -> Result<BootstrapOutcome> {
        self.submit(WorkItem::Bootstrap).await
    }

    pub async fn teardown(&self) -> Result<()> {
        self.submit(WorkItem::Teardown).await
    }

    pub async fn apply(&self, request: ApplyRequest) -> Result<ApplyStats> {
        self.submit(|reply| WorkItem::Apply(request, reply)).await
    }

    pub async fn rollback(&self) -> Result<usize> {
        self.submit(WorkItem::Rollback).await
    }

    pub async fn demo_block_enable(&self) -> Result<bool> {
        self.submit(WorkItem::DemoBlockEnable).await
    }

    pub async fn demo_block_disable(&self) -> Result<bool> {
        self.submit(WorkItem::DemoBlockDisable).await
    }

    pub async fn demo_block_status(&self) -> Result<bool> {
        self.submit(WorkItem::DemoBlockStatus).await
    }
}

pub struct Worker {
    orchestrator: Orchestrator,
    lkg: Arc<LkgStore>,
    history: Arc<HistoryStore>,
    current_policy: Arc<Mutex<Option<Policy>>>,
}

impl Worker {
    /// Spawns the worker task; dropping every handle drains and stops it.
    pub fn spawn(
        orchestrator: Orchestrator,
        lkg: Arc<LkgStore>,
        history: Arc<HistoryStore>,
        current_policy: Arc<Mutex<Option<Policy>>>,
    ) -> WorkerHandle {
        let (tx, rx) = mpsc::channel(32);
        let worker = Worker {
            orchestrator,
            lkg,
            history,
            current_policy,
        };
        tokio::spawn(worker.run(rx));
        WorkerHandle { tx }
    }

    async fn run(self, mut rx: mpsc::Receiver<WorkItem>) {
        while let Some(item) = rx.recv().await {
            match item {
                WorkItem::Bootstrap(reply) => {
                    let _ = reply.send(self.orchestrator.bootstrap());
                }
                WorkItem::Teardown(reply) => {
                    let _ = reply.send(self.orchestrator.teardown());
                }
                WorkItem::Apply(request, reply) => {
                    let _ = reply.send(self.apply(request));
                }
                WorkItem::Rollback(reply) => {
                    let _ = reply.send(self.orchestrator.remove_all_filters());
                }
                WorkItem::DemoBlockEnable(reply) => {
                    let _ = reply.send(self.orchestrator.demo_block_enable());
                }
                WorkItem::DemoBlockDisable(reply) => {
                    let _ = reply.send(self.orchestrator.demo_block_disable());
                }
                WorkItem::DemoBlockStatus(reply) => {
                    let _ = reply.send(self.orchestrator.demo_block_status());
                }
            }
        }
        info!("engine worker drained");
    }

    /// Validate, reconcile, then persist: in-memory policy, LKG, history.
    /// Persistence failures degrade to warnings; the filters are already in.
    fn apply(&self, request: ApplyRequest) -> Result<ApplyStats> {
        let validated = ValidatedPolicy::from_slice(request.policy_json.as_bytes())?;
        let mut stats = self.orchestrator.apply(&validated)?;

        *self.current_policy.lock().unwrap() = Some(validated.policy().clone());

        if request.save_lkg {
            if let Err(err) = self.lkg.save(&request.policy_json, &request.source_path) {
                warn!(?err, "LKG save failed after successful apply");
                stats
                    .warnings
                    .push(format!("last-known-good save failed: {err}"));
            }
        }
        if let Err(err) = self.history.append(
            &request.policy_json,
            &stats.policy_version,
            stats.total_rules,
            request.source,
            &request.source_path,
            stats.filters_created,
            stats.filters_removed,
        ) {
            warn!(?err, "history append failed after successful apply");
            stats
                .warnings
                .push(format!("policy history save failed: {err}"));
        }
        Ok(stats)
    }
}
