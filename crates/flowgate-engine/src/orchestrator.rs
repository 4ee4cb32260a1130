//! Reconciliation verbs.
//!
//! Flow for apply:
//! 1. Compile the validated policy into the desired filter set.
//! 2. Enumerate observed filters in our sublayer (no transaction needed).
//! 3. Diff desired against observed by key.
//! 4. Empty diff: return without ever opening a transaction.
//! 5. Otherwise, inside one transaction: deletes first, then adds; commit.
//!
//! Every mutation path runs under a [`Transaction`] guard, so an error
//! return or panic leaves the engine exactly as it was.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use flowgate_common::{consts, Error, Result};
use flowgate_policy::{
    compile, CompiledFilter, IpCondition, Layer, PortCondition, ValidatedPolicy,
};
use flowgate_wfp::{
    EngineBackend, EngineSession, FilterSpec, ProviderSpec, SublayerSpec, Transaction, WfpError,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapOutcome {
    pub provider_exists: bool,
    pub sublayer_exists: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyStats {
    pub filters_created: usize,
    pub filters_removed: usize,
    pub unchanged: usize,
    pub rules_skipped: usize,
    pub total_rules: usize,
    pub policy_version: String,
    pub warnings: Vec<String>,
}

/// Owns the engine backing. One orchestrator per service; callers serialize
/// access (the service funnels every verb through its worker).
pub struct Orchestrator {
    backend: Arc<dyn EngineBackend>,
}

impl Orchestrator {
    pub fn new(backend: Arc<dyn EngineBackend>) -> Self {
        Self { backend }
    }

    fn open(&self) -> Result<Box<dyn EngineSession>> {
        Ok(self.backend.open()?)
    }

    /// Ensures our provider and sublayer exist. Safe to call repeatedly;
    /// `AlreadyExists` from a racing bootstrap counts as success.
    pub fn bootstrap(&self) -> Result<BootstrapOutcome> {
        let mut session = self.open()?;
        let mut txn = Transaction::begin(session.as_mut())?;

        if !txn.session().provider_exists(consts::PROVIDER_KEY)? {
            let spec = ProviderSpec {
                key: consts::PROVIDER_KEY,
                name: consts::SERVICE_DISPLAY_NAME.to_string(),
                description: "Filters managed by the Flowgate policy service".to_string(),
            };
            match txn.session().add_provider(&spec) {
                Ok(()) | Err(WfpError::AlreadyExists) => {}
                Err(err) => return Err(err.into()),
            }
        }
        if !txn.session().sublayer_exists(consts::SUBLAYER_KEY)? {
            let spec = SublayerSpec {
                key: consts::SUBLAYER_KEY,
                provider_key: consts::PROVIDER_KEY,
                weight: consts::SUBLAYER_WEIGHT,
                name: consts::SERVICE_DISPLAY_NAME.to_string(),
                description: "Flowgate policy sublayer".to_string(),
            };
            match txn.session().add_sublayer(&spec) {
                Ok(()) | Err(WfpError::AlreadyExists) => {}
                Err(err) => return Err(err.into()),
            }
        }
        txn.commit()?;
        info!("bootstrap complete");
        Ok(BootstrapOutcome {
            provider_exists: true,
            sublayer_exists: true,
        })
    }

    /// Removes the sublayer and provider. Absent objects count as success;
    /// a sublayer still holding filters is a caller error, and the provider
    /// is left alone in that case.
    pub fn teardown(&self) -> Result<()> {
        let mut session = self.open()?;
        let mut txn = Transaction::begin(session.as_mut())?;

        match txn.session().delete_sublayer(consts::SUBLAYER_KEY) {
            Ok(()) => {}
            Err(err) if err.is_benign_on_delete() => {}
            Err(WfpError::InUse) => {
                return Err(Error::InvalidState(
                    "sublayer still holds filters; run rollback before teardown".to_string(),
                ));
            }
            Err(err) => return Err(err.into()),
        }
        match txn.session().delete_provider(consts::PROVIDER_KEY) {
            Ok(()) => {}
            Err(err) if err.is_benign_on_delete() => {}
            Err(err) => return Err(err.into()),
        }
        txn.commit()?;
        info!("teardown complete");
        Ok(())
    }

    /// Reconciles the engine to the given policy.
    pub fn apply(&self, policy: &ValidatedPolicy) -> Result<ApplyStats> {
        let output = compile(policy);
        if !output.is_ok() {
            return Err(Error::InvalidPolicy(output.errors));
        }
        let mut warnings = output.warnings;

        let mut session = self.open()?;
        let observed = session.enumerate_filters(consts::SUBLAYER_KEY)?;
        let diff = flowgate_policy::diff(&output.filters, &observed);
        debug!(
            to_add = diff.to_add.len(),
            to_remove = diff.to_remove.len(),
            unchanged = diff.unchanged,
            "computed filter diff"
        );

        let mut stats = ApplyStats {
            filters_created: 0,
            filters_removed: 0,
            unchanged: diff.unchanged,
            rules_skipped: output.rules_skipped,
            total_rules: policy.rules.len(),
            policy_version: policy.version.clone(),
            warnings: Vec::new(),
        };

        // Idempotency fast path: nothing to change, no transaction at all.
        if diff.is_empty() {
            stats.warnings = warnings;
            info!(unchanged = stats.unchanged, "policy already in effect");
            return Ok(stats);
        }

        let mut txn = Transaction::begin(session.as_mut())?;
        for filter in &diff.to_remove {
            match txn.session().delete_filter_by_key(filter.key) {
                Ok(()) => stats.filters_removed += 1,
                // Raced with an external delete; the end state is what we
                // wanted.
                Err(err) if err.is_benign_on_delete() => {}
                Err(err) => return Err(err.into()),
            }
        }
        for filter in &diff.to_add {
            let app_id = resolve_app_id(txn.session(), filter, &mut warnings);
            let spec = FilterSpec {
                filter,
                provider_key: consts::PROVIDER_KEY,
                sublayer_key: consts::SUBLAYER_KEY,
                app_id,
            };
            txn.session().add_filter(&spec)?;
            stats.filters_created += 1;
        }
        txn.commit()?;

        stats.warnings = warnings;
        info!(
            created = stats.filters_created,
            removed = stats.filters_removed,
            unchanged = stats.unchanged,
            version = %stats.policy_version,
            "policy applied"
        );
        Ok(stats)
    }

    /// Deletes every filter in our sublayer by runtime id. Returns how many
    /// went away; zero when the sublayer is already clean.
    pub fn remove_all_filters(&self) -> Result<usize> {
        let mut session = self.open()?;
        let observed = session.enumerate_filters(consts::SUBLAYER_KEY)?;
        if observed.is_empty() {
            return Ok(0);
        }

        let mut removed = 0;
        let mut txn = Transaction::begin(session.as_mut())?;
        for filter in &observed {
            match txn.session().delete_filter_by_id(filter.id) {
                Ok(()) => removed += 1,
                Err(err) if err.is_benign_on_delete() => {}
                Err(err) => return Err(err.into()),
            }
        }
        txn.commit()?;
        info!(removed, "removed all managed filters");
        Ok(removed)
    }

    /// Installs the fixed end-to-end verification filter. Returns `true`
    /// when this call created it.
    pub fn demo_block_enable(&self) -> Result<bool> {
        let mut session = self.open()?;
        if session.filter_exists(consts::DEMO_BLOCK_FILTER_KEY)? {
            return Ok(false);
        }
        let filter = demo_block_filter();
        let mut txn = Transaction::begin(session.as_mut())?;
        let spec = FilterSpec {
            filter: &filter,
            provider_key: consts::PROVIDER_KEY,
            sublayer_key: consts::SUBLAYER_KEY,
            app_id: None,
        };
        match txn.session().add_filter(&spec) {
            Ok(_) => {}
            Err(WfpError::AlreadyExists) => {
                return Ok(false);
            }
            Err(err) => return Err(err.into()),
        }
        txn.commit()?;
        Ok(true)
    }

    /// Removes the verification filter. Returns `true` when it was present.
    pub fn demo_block_disable(&self) -> Result<bool> {
        let mut session = self.open()?;
        let mut txn = Transaction::begin(session.as_mut())?;
        let removed = match txn.session().delete_filter_by_key(consts::DEMO_BLOCK_FILTER_KEY) {
            Ok(()) => true,
            Err(err) if err.is_benign_on_delete() => false,
            Err(err) => return Err(err.into()),
        };
        txn.commit()?;
        Ok(removed)
    }

    pub fn demo_block_status(&self) -> Result<bool> {
        let mut session = self.open()?;
        Ok(session.filter_exists(consts::DEMO_BLOCK_FILTER_KEY)?)
    }
}

/// Device-form translation at apply time. A path the engine cannot resolve
/// drops the process condition with a warning; the filter still installs.
fn resolve_app_id(
    session: &mut dyn EngineSession,
    filter: &CompiledFilter,
    warnings: &mut Vec<String>,
) -> Option<Vec<u8>> {
    let path = filter.process_path.as_deref()?;
    match session.app_id_from_path(path) {
        Ok(blob) => Some(blob),
        Err(err) => {
            warn!(rule = %filter.rule_id, %path, ?err, "process path translation failed");
            warnings.push(format!(
                "rule '{}': process path translation failed; filter installed without process condition",
                filter.rule_id
            ));
            None
        }
    }
}

fn demo_block_filter() -> CompiledFilter {
    CompiledFilter {
        key: consts::DEMO_BLOCK_FILTER_KEY,
        rule_id: "demo-block".to_string(),
        display_name: "Flowgate demo block".to_string(),
        description: Some("Pipeline verification filter".to_string()),
        action: flowgate_policy::Action::Block,
        layer: Layer::AleAuthConnectV4,
        protocol: flowgate_policy::compile::PROTO_TCP,
        process_path: None,
        remote_ip: Some(IpCondition::Exact(consts::DEMO_BLOCK_REMOTE_IP.into())),
        remote_port: Some(PortCondition::Single(consts::DEMO_BLOCK_REMOTE_PORT)),
        weight: consts::BASE_FILTER_WEIGHT as u64,
    }
}
