//! End-to-end reconciliation against the in-memory engine.

use std::sync::Arc;

use chrono::{TimeZone, Utc};

use flowgate_common::{consts, ErrorKind};
use flowgate_engine::Orchestrator;
use flowgate_policy::{filter_key, ValidatedPolicy};
use flowgate_wfp::memory::MemoryBackend;

fn orchestrator() -> (Orchestrator, MemoryBackend) {
    let backend = MemoryBackend::new();
    (Orchestrator::new(Arc::new(backend.clone())), backend)
}

fn policy(rules_json: &str) -> ValidatedPolicy {
    let json = format!(
        r#"{{
            "version": "1.0.0",
            "defaultAction": "allow",
            "updatedAt": "2026-07-01T11:00:00Z",
            "rules": {rules_json}
        }}"#
    );
    let parsed = serde_json::from_str(&json).unwrap();
    ValidatedPolicy::from_policy_at(parsed, Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap())
        .unwrap()
}

fn block_rule(id: &str, ip: &str, ports: &str) -> String {
    format!(
        r#"{{"id":"{id}","action":"block","direction":"outbound","protocol":"tcp",
            "remote":{{"ip":"{ip}","ports":"{ports}"}},"priority":100,"enabled":true}}"#
    )
}

#[test]
fn bootstrap_is_idempotent() {
    let (orch, backend) = orchestrator();
    let first = orch.bootstrap().unwrap();
    assert!(first.provider_exists && first.sublayer_exists);
    assert!(backend.has_provider(consts::PROVIDER_KEY));
    assert!(backend.has_sublayer(consts::SUBLAYER_KEY));

    let second = orch.bootstrap().unwrap();
    assert!(second.provider_exists && second.sublayer_exists);
}

#[test]
fn apply_rollback_apply_cycle() {
    let (orch, backend) = orchestrator();
    orch.bootstrap().unwrap();
    let p = policy(&format!("[{}]", block_rule("r1", "1.1.1.1", "443")));

    let stats = orch.apply(&p).unwrap();
    assert_eq!(
        (stats.filters_created, stats.filters_removed, stats.unchanged),
        (1, 0, 0)
    );

    // Idempotent re-apply takes the no-transaction fast path.
    let stats = orch.apply(&p).unwrap();
    assert_eq!(
        (stats.filters_created, stats.filters_removed, stats.unchanged),
        (0, 0, 1)
    );

    assert_eq!(orch.remove_all_filters().unwrap(), 1);
    assert_eq!(orch.remove_all_filters().unwrap(), 0);
    assert!(backend.filters_in(consts::SUBLAYER_KEY).is_empty());

    let stats = orch.apply(&p).unwrap();
    assert_eq!(
        (stats.filters_created, stats.filters_removed, stats.unchanged),
        (1, 0, 0)
    );
}

#[test]
fn partial_change_swaps_only_the_difference() {
    let (orch, backend) = orchestrator();
    orch.bootstrap().unwrap();

    let abc = policy(&format!(
        "[{},{},{}]",
        block_rule("a", "10.0.0.1", "80"),
        block_rule("b", "10.0.0.2", "80"),
        block_rule("c", "10.0.0.3", "80"),
    ));
    orch.apply(&abc).unwrap();

    let abd = policy(&format!(
        "[{},{},{}]",
        block_rule("a", "10.0.0.1", "80"),
        block_rule("b", "10.0.0.2", "80"),
        block_rule("d", "10.0.0.4", "80"),
    ));
    let stats = orch.apply(&abd).unwrap();
    assert_eq!(
        (stats.filters_created, stats.filters_removed, stats.unchanged),
        (1, 1, 2)
    );

    let keys: Vec<_> = backend
        .filters_in(consts::SUBLAYER_KEY)
        .into_iter()
        .map(|f| f.key)
        .collect();
    assert!(keys.contains(&filter_key("d", 0)));
    assert!(!keys.contains(&filter_key("c", 0)));
}

#[test]
fn reconcile_matches_compiled_key_set() {
    let (orch, backend) = orchestrator();
    orch.bootstrap().unwrap();

    let p = policy(
        r#"[{"id":"multi","action":"block","direction":"outbound","protocol":"tcp",
             "remote":{"ports":"80,443,8000-9000"},"priority":1}]"#,
    );
    let stats = orch.apply(&p).unwrap();
    assert_eq!(stats.filters_created, 3);

    let mut installed: Vec<_> = backend
        .filters_in(consts::SUBLAYER_KEY)
        .into_iter()
        .map(|f| f.key)
        .collect();
    installed.sort();
    let mut expected: Vec<_> = (0..3).map(|i| filter_key("multi", i)).collect();
    expected.sort();
    assert_eq!(installed, expected);
}

#[test]
fn failed_add_leaves_engine_untouched() {
    let (orch, backend) = orchestrator();
    orch.bootstrap().unwrap();

    let p = policy(&format!("[{}]", block_rule("keep", "10.0.0.1", "80")));
    orch.apply(&p).unwrap();
    let before = backend.fingerprint();

    // Second rule's filter is made to fail mid-transaction.
    backend.fail_add_filter(Some(filter_key("boom", 0)));
    let next = policy(&format!(
        "[{},{}]",
        block_rule("keep2", "10.0.0.2", "80"),
        block_rule("boom", "10.0.0.3", "80"),
    ));
    let err = orch.apply(&next).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WfpError);

    // Abort on drop: the removal of "keep" and the add of "keep2" are gone.
    assert_eq!(backend.fingerprint(), before);
}

#[test]
fn failed_commit_leaves_engine_untouched() {
    let (orch, backend) = orchestrator();
    orch.bootstrap().unwrap();
    let before = backend.fingerprint();

    backend.fail_next_commit();
    let p = policy(&format!("[{}]", block_rule("r1", "1.1.1.1", "443")));
    let err = orch.apply(&p).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WfpError);
    assert_eq!(backend.fingerprint(), before);
}

#[test]
fn empty_diff_never_opens_a_transaction() {
    let (orch, backend) = orchestrator();
    orch.bootstrap().unwrap();
    let p = policy(&format!("[{}]", block_rule("r1", "1.1.1.1", "443")));
    orch.apply(&p).unwrap();

    // If the fast path opened a transaction, this would make it fail.
    backend.fail_next_commit();
    let stats = orch.apply(&p).unwrap();
    assert_eq!(stats.filters_created, 0);
    assert_eq!(stats.unchanged, 1);
}

#[test]
fn teardown_refuses_while_filters_remain() {
    let (orch, backend) = orchestrator();
    orch.bootstrap().unwrap();
    let p = policy(&format!("[{}]", block_rule("r1", "1.1.1.1", "443")));
    orch.apply(&p).unwrap();

    let err = orch.teardown().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert!(err.to_string().contains("rollback"));
    // Provider untouched by the failed teardown.
    assert!(backend.has_provider(consts::PROVIDER_KEY));

    orch.remove_all_filters().unwrap();
    orch.teardown().unwrap();
    assert!(!backend.has_provider(consts::PROVIDER_KEY));
    assert!(!backend.has_sublayer(consts::SUBLAYER_KEY));

    // Idempotent once everything is gone.
    orch.teardown().unwrap();
}

#[test]
fn demo_block_lifecycle() {
    let (orch, backend) = orchestrator();
    orch.bootstrap().unwrap();

    assert!(!orch.demo_block_status().unwrap());
    assert!(orch.demo_block_enable().unwrap());
    assert!(!orch.demo_block_enable().unwrap(), "second enable is a no-op");
    assert!(orch.demo_block_status().unwrap());
    assert_eq!(backend.filters_in(consts::SUBLAYER_KEY).len(), 1);

    assert!(orch.demo_block_disable().unwrap());
    assert!(!orch.demo_block_disable().unwrap());
    assert!(!orch.demo_block_status().unwrap());
}

#[test]
fn untranslatable_process_path_drops_condition_with_warning() {
    let (orch, backend) = orchestrator();
    orch.bootstrap().unwrap();
    backend.mark_untranslatable("/opt/ghost/tool");

    let p = policy(
        r#"[{"id":"ghost","action":"block","direction":"outbound","protocol":"tcp",
             "process":"/opt/ghost/tool","remote":{"ports":"443"},"priority":1}]"#,
    );
    let stats = orch.apply(&p).unwrap();
    assert_eq!(stats.filters_created, 1, "filter still installs");
    assert_eq!(stats.warnings.len(), 1);
    assert!(stats.warnings[0].contains("'ghost'"));
    assert!(stats.warnings[0].contains("without process condition"));
}

#[test]
fn compile_errors_abort_before_touching_the_engine() {
    let (orch, backend) = orchestrator();
    orch.bootstrap().unwrap();
    let before = backend.fingerprint();

    let p = policy(
        r#"[{"id":"nope","action":"block","direction":"both","protocol":"tcp"}]"#,
    );
    let err = orch.apply(&p).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidPolicy);
    assert_eq!(backend.fingerprint(), before);
}
