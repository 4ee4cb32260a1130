//! Request dispatch: a closed table of handler types.
//!
//! State-changing handlers bracket the work with `-started`/`-finished`
//! audit entries; failures always produce a `-finished` carrying the error
//! code and message. The `source` is the caller's unauthenticated hint,
//! used for provenance only.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};

use flowgate_common::proto::{
    AuditLogsParams, HistoryIdParams, PolicyPathParams, RequestEnvelope, SimulateParams, Source,
    WatchSetParams,
};
use flowgate_common::{Error, Result};
use flowgate_policy::{simulate, Direction, Protocol, SimQuery};
use flowgate_store::{AuditEntry, AuditEvent, AuditStatus, LkgLoad};

use crate::state::ServiceState;
use crate::worker::ApplyRequest;

pub async fn dispatch(
    state: &Arc<ServiceState>,
    env: &RequestEnvelope,
    source: Source,
) -> Result<Value> {
    let kind = env
        .kind
        .as_deref()
        .ok_or_else(|| Error::InvalidArgument("missing request type".to_string()))?;

    match kind {
        "ping" => Ok(json!({
            "version": env!("CARGO_PKG_VERSION"),
            "time": Utc::now().to_rfc3339(),
            "uptimeSecs": state.started_at.elapsed().as_secs(),
        })),

        "bootstrap" => {
            audited(state, source, AuditEvent::BootstrapStarted, AuditEvent::BootstrapFinished, || async {
                let outcome = state.worker.bootstrap().await?;
                Ok(serde_json::to_value(outcome).unwrap_or(Value::Null))
            })
            .await
        }

        "teardown" => {
            audited(state, source, AuditEvent::TeardownStarted, AuditEvent::TeardownFinished, || async {
                state.worker.teardown().await?;
                Ok(json!({}))
            })
            .await
        }

        "rollback" => {
            audited(state, source, AuditEvent::RollbackStarted, AuditEvent::RollbackFinished, || async {
                let removed = state.worker.rollback().await?;
                Ok(json!({ "filtersRemoved": removed }))
            })
            .await
        }

        "demo-block-enable" => {
            audited(state, source, AuditEvent::DemoBlockStarted, AuditEvent::DemoBlockFinished, || async {
                let created = state.worker.demo_block_enable().await?;
                Ok(json!({ "enabled": true, "created": created }))
            })
            .await
        }

        "demo-block-disable" => {
            audited(state, source, AuditEvent::DemoBlockStarted, AuditEvent::DemoBlockFinished, || async {
                let removed = state.worker.demo_block_disable().await?;
                Ok(json!({ "enabled": false, "removed": removed }))
            })
            .await
        }

        "demo-block-status" => {
            let enabled = state.worker.demo_block_status().await?;
            Ok(json!({ "enabled": enabled }))
        }

        "validate" => {
            let params: PolicyPathParams = env.params()?;
            let bytes = read_policy_file(&params.policy_path).await?;
            match flowgate_policy::ValidatedPolicy::from_slice(&bytes) {
                Ok(policy) => Ok(json!({
                    "valid": true,
                    "policyVersion": policy.version,
                    "ruleCount": policy.rules.len(),
                    "issues": [],
                })),
                Err(Error::InvalidPolicy(issues)) => Ok(json!({
                    "valid": false,
                    "issues": issues,
                })),
                Err(other) => Err(other),
            }
        }

        "apply" => {
            let params: PolicyPathParams = env.params()?;
            state.audit.append(
                &AuditEntry::new(AuditEvent::ApplyStarted, source)
                    .policy_file(&params.policy_path),
            );
            let result = apply_from_path(state, &params.policy_path, source).await;
            finish_apply_audit(state, AuditEvent::ApplyFinished, source, &params.policy_path, &result);
            result
        }

        "lkg-show" => match state.lkg.metadata()? {
            None => Ok(json!({ "exists": false })),
            Some(meta) => {
                let mut value = serde_json::to_value(meta).unwrap_or(Value::Null);
                if let Value::Object(map) = &mut value {
                    map.insert("exists".into(), Value::Bool(true));
                }
                Ok(value)
            }
        },

        "lkg-revert" => {
            state
                .audit
                .append(&AuditEntry::new(AuditEvent::LkgRevertStarted, source));
            let result = lkg_revert(state, source).await;
            match &result {
                Ok(_) => state.audit.append(
                    &AuditEntry::new(AuditEvent::LkgRevertFinished, source).success(),
                ),
                Err(err) => state.audit.append(
                    &AuditEntry::new(AuditEvent::LkgRevertFinished, source).failure(err),
                ),
            }
            result
        }

        "watch-set" => {
            let params: WatchSetParams = env.params()?;
            let path = params.policy_path.map(std::path::PathBuf::from);
            if let Some(path) = &path {
                if !path.is_absolute() {
                    return Err(Error::InvalidArgument(format!(
                        "watch path '{}' must be absolute",
                        path.display()
                    )));
                }
            }
            let entry = match &path {
                Some(p) => AuditEntry::new(AuditEvent::WatchSet, source)
                    .policy_file(&p.display().to_string()),
                None => AuditEntry::new(AuditEvent::WatchSet, source),
            };
            state.audit.append(&entry);
            let status = state.watcher.set(path)?;
            Ok(serde_json::to_value(status).unwrap_or(Value::Null))
        }

        "watch-status" => {
            Ok(serde_json::to_value(state.watcher.status()).unwrap_or(Value::Null))
        }

        "audit-logs" => {
            let params: AuditLogsParams = env.params()?;
            let entries = match (params.tail, params.since_minutes) {
                (Some(n), None) => state.audit.tail(n)?,
                (None, Some(minutes)) => state.audit.since(minutes)?,
                (None, None) => state.audit.tail(50)?,
                (Some(_), Some(_)) => {
                    return Err(Error::InvalidArgument(
                        "specify either tail or sinceMinutes, not both".to_string(),
                    ));
                }
            };
            let count = entries.len();
            Ok(json!({ "entries": entries, "count": count }))
        }

        "block-rules" => {
            let rules = state
                .loaded_policy()
                .map(|p| p.enabled_block_rules())
                .unwrap_or_default();
            Ok(json!({
                "loaded": state.loaded_policy().is_some(),
                "count": rules.len(),
                "rules": rules,
            }))
        }

        "simulate" => {
            let params: SimulateParams = env.params()?;
            let policy = state
                .loaded_policy()
                .ok_or_else(|| Error::InvalidState("no policy loaded".to_string()))?;
            let query = build_sim_query(&params)?;
            let outcome = simulate(&policy, &query);
            Ok(serde_json::to_value(outcome).unwrap_or(Value::Null))
        }

        "policy-history" => {
            let entries = state.history.list()?;
            let count = entries.len();
            Ok(json!({ "entries": entries, "count": count }))
        }

        "policy-history-get" => {
            let params: HistoryIdParams = env.params()?;
            let (entry, policy_json) = state.history.get(&params.id)?;
            Ok(json!({ "entry": entry, "policyJson": policy_json }))
        }

        "policy-history-revert" => {
            let params: HistoryIdParams = env.params()?;
            state
                .audit
                .append(&AuditEntry::new(AuditEvent::HistoryRevertStarted, source));
            let result = history_revert(state, &params.id, source).await;
            match &result {
                Ok(_) => state.audit.append(
                    &AuditEntry::new(AuditEvent::HistoryRevertFinished, source).success(),
                ),
                Err(err) => state.audit.append(
                    &AuditEntry::new(AuditEvent::HistoryRevertFinished, source).failure(err),
                ),
            }
            result
        }

        other => Err(Error::InvalidArgument(format!(
            "unknown request type '{other}'"
        ))),
    }
}

/// Brackets a simple verb with started/finished audit entries.
async fn audited<F, Fut>(
    state: &Arc<ServiceState>,
    source: Source,
    started: AuditEvent,
    finished: AuditEvent,
    op: F,
) -> Result<Value>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<Value>>,
{
    state.audit.append(&AuditEntry::new(started, source));
    let result = op().await;
    match &result {
        Ok(_) => state
            .audit
            .append(&AuditEntry::new(finished, source).success()),
        Err(err) => state
            .audit
            .append(&AuditEntry::new(finished, source).failure(err)),
    }
    result
}

/// One read, no prior stat: the buffer length is the size that gets
/// validated, so the file cannot grow between check and use.
async fn read_policy_file(path: &str) -> Result<Vec<u8>> {
    let path_ref = Path::new(path);
    if !path_ref.is_absolute() {
        return Err(Error::InvalidArgument(format!(
            "policy path '{path}' must be absolute"
        )));
    }
    let bytes = tokio::fs::read(path_ref)
        .await
        .map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(format!("policy file '{path}'")),
            std::io::ErrorKind::PermissionDenied => {
                Error::PermissionDenied(format!("policy file '{path}'"))
            }
            _ => Error::Service(format!("policy read failed: {err}")),
        })?;
    if bytes.len() > flowgate_common::consts::MAX_POLICY_BYTES {
        return Err(Error::InvalidPolicy(vec![flowgate_common::PolicyIssue::new(
            "$",
            format!(
                "policy JSON is {} bytes; the limit is {}",
                bytes.len(),
                flowgate_common::consts::MAX_POLICY_BYTES
            ),
        )]));
    }
    Ok(bytes)
}

async fn apply_from_path(
    state: &Arc<ServiceState>,
    path: &str,
    source: Source,
) -> Result<Value> {
    let bytes = read_policy_file(path).await?;
    let policy_json = String::from_utf8(bytes)
        .map_err(|_| Error::InvalidArgument("policy file is not UTF-8".to_string()))?;
    let stats = state
        .worker
        .apply(ApplyRequest {
            policy_json,
            source,
            source_path: path.to_string(),
            save_lkg: true,
        })
        .await?;
    Ok(serde_json::to_value(stats).unwrap_or(Value::Null))
}

async fn lkg_revert(state: &Arc<ServiceState>, source: Source) -> Result<Value> {
    match state.lkg.load() {
        LkgLoad::NotFound => Err(Error::NotFound("no last-known-good policy".to_string())),
        LkgLoad::Corrupt(reason) => Err(Error::InvalidState(format!(
            "last-known-good record is corrupt: {reason}"
        ))),
        LkgLoad::Ok { record, .. } => {
            let stats = state
                .worker
                .apply(ApplyRequest {
                    policy_json: record.policy_json,
                    source,
                    source_path: record.source_path,
                    save_lkg: false,
                })
                .await?;
            Ok(serde_json::to_value(stats).unwrap_or(Value::Null))
        }
    }
}

async fn history_revert(
    state: &Arc<ServiceState>,
    id: &str,
    source: Source,
) -> Result<Value> {
    let (entry, policy_json) = state.history.get(id)?;
    let stats = state
        .worker
        .apply(ApplyRequest {
            policy_json,
            source,
            source_path: entry.source_path,
            save_lkg: true,
        })
        .await?;
    Ok(serde_json::to_value(stats).unwrap_or(Value::Null))
}

fn finish_apply_audit(
    state: &Arc<ServiceState>,
    event: AuditEvent,
    source: Source,
    path: &str,
    result: &Result<Value>,
) {
    let entry = AuditEntry::new(event, source).policy_file(path);
    let entry = match result {
        Ok(value) => {
            let mut entry = entry;
            entry.status = Some(AuditStatus::Success);
            entry.policy_version = value
                .get("policyVersion")
                .and_then(Value::as_str)
                .map(str::to_owned);
            entry.filters_created = value.get("filtersCreated").and_then(Value::as_u64).map(|n| n as usize);
            entry.filters_removed = value.get("filtersRemoved").and_then(Value::as_u64).map(|n| n as usize);
            entry.rules_skipped = value.get("rulesSkipped").and_then(Value::as_u64).map(|n| n as usize);
            entry.total_rules = value.get("totalRules").and_then(Value::as_u64).map(|n| n as usize);
            entry
        }
        Err(err) => entry.failure(err),
    };
    state.audit.append(&entry);
}

fn build_sim_query(params: &SimulateParams) -> Result<SimQuery> {
    let direction: Direction = serde_json::from_value(Value::String(params.direction.clone()))
        .map_err(|_| Error::InvalidArgument(format!("unknown direction '{}'", params.direction)))?;
    if direction == Direction::Both {
        return Err(Error::InvalidArgument(
            "simulate direction must be inbound or outbound".to_string(),
        ));
    }
    let protocol: Protocol = serde_json::from_value(Value::String(params.protocol.clone()))
        .map_err(|_| Error::InvalidArgument(format!("unknown protocol '{}'", params.protocol)))?;
    if protocol == Protocol::Any {
        return Err(Error::InvalidArgument(
            "simulate protocol must be tcp or udp".to_string(),
        ));
    }
    let parse_ip = |text: &str| {
        text.parse::<std::net::Ipv4Addr>()
            .map_err(|_| Error::InvalidArgument(format!("'{text}' is not an IPv4 address")))
    };
    Ok(SimQuery {
        direction,
        protocol,
        remote_ip: params.remote_ip.as_deref().map(parse_ip).transpose()?,
        remote_port: params.remote_port,
        local_ip: params.local_ip.as_deref().map(parse_ip).transpose()?,
        local_port: params.local_port,
        process_path: params.process_path.clone(),
    })
}
