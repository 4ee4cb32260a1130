//! Rule compilation: validated rules become zero-or-more filter descriptors
//! with deterministic keys.
//!
//! The supported subset is outbound/tcp, outbound/udp and inbound/tcp; the
//! inbound accept layer has no UDP decision, `both` and `any` must be split
//! by the author, and only the v4 layers are wired up. A comma-separated
//! port spec fans out into one filter per element, and the element ordinal
//! participates in key derivation so the rule-to-filter mapping is bijective
//! and stable across applies.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use flowgate_common::{consts, PolicyIssue};

use crate::model::{Action, Direction, Protocol};
use crate::netspec::{self, IpSpec, PortCondition};
use crate::validate::ValidatedPolicy;

pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// Enforcement layer a filter is pinned into. ALE layers evaluate per
/// connection, so rule count does not tax steady-state throughput.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Layer {
    /// Outbound connect authorization (v4).
    AleAuthConnectV4,
    /// Inbound accept authorization (v4).
    AleAuthRecvAcceptV4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IpCondition {
    /// Exact address, installed with a /32 mask.
    Exact(Ipv4Addr),
    Cidr(Ipv4Net),
}

impl IpCondition {
    pub fn matches(&self, addr: Ipv4Addr) -> bool {
        match self {
            Self::Exact(exact) => *exact == addr,
            Self::Cidr(net) => net.contains(&addr),
        }
    }
}

/// One filter ready for installation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledFilter {
    pub key: Uuid,
    pub rule_id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub action: Action,
    pub layer: Layer,
    pub protocol: u8,
    /// Raw executable path; device-form translation happens at apply time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_ip: Option<IpCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_port: Option<PortCondition>,
    pub weight: u64,
}

#[derive(Debug, Clone, Default)]
pub struct CompileOutput {
    pub filters: Vec<CompiledFilter>,
    pub warnings: Vec<String>,
    pub errors: Vec<PolicyIssue>,
    /// Disabled rules skipped with a warning.
    pub rules_skipped: usize,
}

impl CompileOutput {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Stable filter key: the MD5 of `ruleId:portIndex` reinterpreted as a UUID.
/// Identical input policies therefore compile to identical key sets.
pub fn filter_key(rule_id: &str, port_index: usize) -> Uuid {
    let digest = md5::compute(format!("{rule_id}:{port_index}"));
    Uuid::from_bytes(digest.0)
}

pub fn compile(policy: &ValidatedPolicy) -> CompileOutput {
    let mut out = CompileOutput::default();

    for (index, rule) in policy.rules.iter().enumerate() {
        let at = |field: &str| format!("$.rules[{index}].{field}");

        if !rule.enabled {
            out.warnings
                .push(format!("rule '{}' is disabled; skipped", rule.id));
            out.rules_skipped += 1;
            continue;
        }

        if rule.direction == Direction::Both {
            out.errors.push(PolicyIssue::new(
                at("direction"),
                format!(
                    "rule '{}': direction 'both' is not compilable; split into inbound and outbound rules",
                    rule.id
                ),
            ));
            continue;
        }
        if rule.protocol == Protocol::Any {
            out.errors.push(PolicyIssue::new(
                at("protocol"),
                format!(
                    "rule '{}': protocol 'any' is not compilable; use tcp or udp",
                    rule.id
                ),
            ));
            continue;
        }
        if rule.direction == Direction::Inbound && rule.protocol == Protocol::Udp {
            out.errors.push(PolicyIssue::new(
                at("protocol"),
                format!(
                    "rule '{}': the inbound accept layer exposes no UDP decision",
                    rule.id
                ),
            ));
            continue;
        }
        if rule.local.is_some() {
            out.errors.push(PolicyIssue::new(
                at("local"),
                format!("rule '{}': local endpoint filters are not supported", rule.id),
            ));
            continue;
        }

        let mut remote_ip = None;
        let mut port_conditions: Vec<Option<PortCondition>> = vec![None];
        if let Some(remote) = &rule.remote {
            if let Some(ip) = &remote.ip {
                // Grammar already validated; v6 is the one rejection left.
                match netspec::parse_ip_spec(ip) {
                    Ok(spec) if spec.is_v6() => {
                        out.errors.push(PolicyIssue::new(
                            at("remote.ip"),
                            format!(
                                "rule '{}': IPv6 remotes are not supported in this revision",
                                rule.id
                            ),
                        ));
                        continue;
                    }
                    Ok(IpSpec::V4(addr)) => remote_ip = Some(IpCondition::Exact(addr)),
                    Ok(IpSpec::V4Net(net)) => remote_ip = Some(IpCondition::Cidr(net)),
                    Ok(_) => unreachable!("v6 handled above"),
                    Err(message) => {
                        out.errors
                            .push(PolicyIssue::new(at("remote.ip"), message));
                        continue;
                    }
                }
            }
            if let Some(ports) = &remote.ports {
                match netspec::parse_port_spec(ports) {
                    Ok(parsed) => {
                        port_conditions = parsed.into_iter().map(Some).collect();
                    }
                    Err(message) => {
                        out.errors
                            .push(PolicyIssue::new(at("remote.ports"), message));
                        continue;
                    }
                }
            }
        }

        let layer = match rule.direction {
            Direction::Outbound => Layer::AleAuthConnectV4,
            Direction::Inbound => Layer::AleAuthRecvAcceptV4,
            Direction::Both => unreachable!("rejected above"),
        };
        let protocol = match rule.protocol {
            Protocol::Tcp => PROTO_TCP,
            Protocol::Udp => PROTO_UDP,
            Protocol::Any => unreachable!("rejected above"),
        };
        let weight = (consts::BASE_FILTER_WEIGHT + i64::from(rule.priority)).max(0) as u64;
        let fan_out = port_conditions.len();

        for (port_index, remote_port) in port_conditions.into_iter().enumerate() {
            let display_name = if fan_out > 1 {
                format!("{} [{}/{}]", rule.id, port_index + 1, fan_out)
            } else {
                rule.id.clone()
            };
            out.filters.push(CompiledFilter {
                key: filter_key(&rule.id, port_index),
                rule_id: rule.id.clone(),
                display_name,
                description: rule.comment.clone(),
                action: rule.action,
                layer,
                protocol,
                process_path: rule.process.clone(),
                remote_ip,
                remote_port,
                weight,
            });
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    fn validated(rules_json: &str) -> ValidatedPolicy {
        let json = format!(
            r#"{{
                "version": "1.0.0",
                "defaultAction": "allow",
                "updatedAt": "2026-07-01T11:00:00Z",
                "rules": {rules_json}
            }}"#
        );
        let policy = serde_json::from_str(&json).unwrap();
        ValidatedPolicy::from_policy_at(policy, Utc.with_ymd_and_hms(2026, 7, 1, 12, 0, 0).unwrap())
            .unwrap()
    }

    #[test]
    fn port_list_fans_out_with_ordinal_keys() {
        let policy = validated(
            r#"[{"id":"r1","action":"block","direction":"outbound","protocol":"tcp",
                 "remote":{"ports":"80,443,8000-9000"}}]"#,
        );
        let out = compile(&policy);
        assert!(out.is_ok(), "{:?}", out.errors);
        assert_eq!(out.filters.len(), 3);
        for (i, filter) in out.filters.iter().enumerate() {
            assert_eq!(filter.key, filter_key("r1", i));
        }
        assert_eq!(out.filters[2].remote_port, Some(PortCondition::Range(8000, 9000)));
    }

    #[test]
    fn key_derivation_matches_md5_of_id_and_ordinal() {
        let digest = md5::compute("r1:0");
        assert_eq!(filter_key("r1", 0), Uuid::from_bytes(digest.0));
        assert_ne!(filter_key("r1", 0), filter_key("r1", 1));
        assert_ne!(filter_key("r1", 0), filter_key("r2", 0));
    }

    #[test]
    fn unsupported_combinations_error_with_rule_id() {
        for rules in [
            r#"[{"id":"x","action":"block","direction":"both","protocol":"tcp"}]"#,
            r#"[{"id":"x","action":"block","direction":"outbound","protocol":"any"}]"#,
            r#"[{"id":"x","action":"block","direction":"inbound","protocol":"udp"}]"#,
            r#"[{"id":"x","action":"block","direction":"outbound","protocol":"tcp",
                 "local":{"ports":"80"}}]"#,
            r#"[{"id":"x","action":"block","direction":"outbound","protocol":"tcp",
                 "remote":{"ip":"2001:db8::1"}}]"#,
        ] {
            let out = compile(&validated(rules));
            assert_eq!(out.errors.len(), 1, "{rules}");
            assert!(out.errors[0].message.contains("'x'"), "{:?}", out.errors);
            assert!(out.filters.is_empty());
        }
    }

    #[test]
    fn disabled_rule_warns_and_skips() {
        let policy = validated(
            r#"[{"id":"off","action":"block","direction":"outbound","protocol":"tcp",
                 "remote":{"ports":"80"},"enabled":false}]"#,
        );
        let out = compile(&policy);
        assert!(out.is_ok());
        assert!(out.filters.is_empty());
        assert_eq!(out.rules_skipped, 1);
        assert!(out.warnings[0].contains("'off'"));
    }

    #[test]
    fn weight_is_base_plus_priority_floored_at_zero() {
        let policy = validated(
            r#"[{"id":"hi","action":"block","direction":"outbound","protocol":"tcp",
                 "remote":{"ports":"80"},"priority":100},
                {"id":"deep","action":"block","direction":"outbound","protocol":"tcp",
                 "remote":{"ports":"81"},"priority":-5000}]"#,
        );
        let out = compile(&policy);
        assert_eq!(out.filters[0].weight, 1100);
        assert_eq!(out.filters[1].weight, 0);
    }

    #[test]
    fn direction_selects_layer_and_protocol_byte() {
        let policy = validated(
            r#"[{"id":"out-udp","action":"block","direction":"outbound","protocol":"udp",
                 "remote":{"ports":"53"}},
                {"id":"in-tcp","action":"allow","direction":"inbound","protocol":"tcp",
                 "remote":{"ports":"22"}}]"#,
        );
        let out = compile(&policy);
        assert_eq!(out.filters[0].layer, Layer::AleAuthConnectV4);
        assert_eq!(out.filters[0].protocol, PROTO_UDP);
        assert_eq!(out.filters[1].layer, Layer::AleAuthRecvAcceptV4);
        assert_eq!(out.filters[1].protocol, PROTO_TCP);
    }

    #[test]
    fn rule_without_remote_emits_single_unconditioned_filter() {
        let policy = validated(
            r#"[{"id":"all-out","action":"block","direction":"outbound","protocol":"tcp"}]"#,
        );
        let out = compile(&policy);
        assert_eq!(out.filters.len(), 1);
        assert!(out.filters[0].remote_ip.is_none());
        assert!(out.filters[0].remote_port.is_none());
        assert_eq!(out.filters[0].key, filter_key("all-out", 0));
    }

    proptest! {
        // Compile determinism: the same policy always yields the same keys.
        #[test]
        fn compile_is_deterministic(ids in proptest::collection::vec("[a-z][a-z0-9]{0,8}", 1..20)) {
            let mut seen = std::collections::HashSet::new();
            let rules: Vec<String> = ids
                .iter()
                .filter(|id| seen.insert((*id).clone()))
                .map(|id| format!(
                    r#"{{"id":"{id}","action":"block","direction":"outbound","protocol":"tcp",
                        "remote":{{"ports":"80,443"}}}}"#
                ))
                .collect();
            let policy = validated(&format!("[{}]", rules.join(",")));
            let first: Vec<_> = compile(&policy).filters.iter().map(|f| f.key).collect();
            let second: Vec<_> = compile(&policy).filters.iter().map(|f| f.key).collect();
            prop_assert_eq!(&first, &second);
            let unique: std::collections::HashSet<_> = first.iter().collect();
            prop_assert_eq!(unique.len(), first.len());
        }
    }
}
