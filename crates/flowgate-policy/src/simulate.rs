//! What-if evaluation of a policy against a hypothetical connection.
//!
//! Operates on the declarative rules, not on compiled filters, so it can
//! answer for rules the compiler would refuse (e.g. `both`). First match in
//! descending priority order wins; the policy default applies otherwise.
//! Touches nothing outside its arguments.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::model::{Action, Direction, Policy, Protocol, Rule};
use crate::netspec;

#[derive(Debug, Clone)]
pub struct SimQuery {
    pub direction: Direction,
    pub protocol: Protocol,
    pub remote_ip: Option<Ipv4Addr>,
    pub remote_port: Option<u16>,
    pub local_ip: Option<Ipv4Addr>,
    pub local_port: Option<u16>,
    pub process_path: Option<String>,
}

impl Default for SimQuery {
    fn default() -> Self {
        Self {
            direction: Direction::Outbound,
            protocol: Protocol::Tcp,
            remote_ip: None,
            remote_port: None,
            local_ip: None,
            local_port: None,
            process_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationOutcome {
    pub would_allow: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_rule_id: Option<String>,
    pub trace: Vec<String>,
}

pub fn simulate(policy: &Policy, query: &SimQuery) -> SimulationOutcome {
    let mut order: Vec<&Rule> = policy.rules.iter().collect();
    // Stable sort keeps document order among equal priorities.
    order.sort_by(|a, b| b.priority.cmp(&a.priority));

    let mut trace = Vec::new();
    for rule in order {
        if !rule.enabled {
            trace.push(format!("rule '{}' skipped: disabled", rule.id));
            continue;
        }
        match rule_mismatch(rule, query) {
            Some(reason) => trace.push(format!("rule '{}' skipped: {reason}", rule.id)),
            None => {
                trace.push(format!(
                    "rule '{}' matched: verdict {}",
                    rule.id, rule.action
                ));
                return SimulationOutcome {
                    would_allow: rule.action == Action::Allow,
                    matched_rule_id: Some(rule.id.clone()),
                    trace,
                };
            }
        }
    }

    trace.push(format!(
        "no rule matched: default action {}",
        policy.default_action
    ));
    SimulationOutcome {
        would_allow: policy.default_action == Action::Allow,
        matched_rule_id: None,
        trace,
    }
}

/// Returns the first reason the rule does not apply, or `None` on a match.
fn rule_mismatch(rule: &Rule, query: &SimQuery) -> Option<String> {
    if rule.direction != Direction::Both && rule.direction != query.direction {
        return Some(format!(
            "direction {} != {}",
            rule.direction, query.direction
        ));
    }
    if rule.protocol != Protocol::Any && rule.protocol != query.protocol {
        return Some(format!("protocol {} != {}", rule.protocol, query.protocol));
    }
    if let Some(process) = &rule.process {
        match &query.process_path {
            None => return Some("rule constrains process; query has none".to_string()),
            Some(queried) if !process.eq_ignore_ascii_case(queried) => {
                return Some(format!("process {process} != {queried}"));
            }
            Some(_) => {}
        }
    }
    if let Some(reason) =
        endpoint_mismatch("remote", rule.remote.as_ref(), query.remote_ip, query.remote_port)
    {
        return Some(reason);
    }
    if let Some(reason) =
        endpoint_mismatch("local", rule.local.as_ref(), query.local_ip, query.local_port)
    {
        return Some(reason);
    }
    None
}

fn endpoint_mismatch(
    side: &str,
    endpoint: Option<&crate::model::EndpointFilter>,
    ip: Option<Ipv4Addr>,
    port: Option<u16>,
) -> Option<String> {
    let endpoint = endpoint?;
    if let Some(spec_text) = &endpoint.ip {
        let Ok(spec) = netspec::parse_ip_spec(spec_text) else {
            return Some(format!("{side}.ip '{spec_text}' unparseable"));
        };
        match ip {
            None => return Some(format!("rule constrains {side}.ip; query has none")),
            Some(addr) if !spec.matches_v4(addr) => {
                return Some(format!("{side} ip {addr} outside {spec_text}"));
            }
            Some(_) => {}
        }
    }
    if let Some(ports_text) = &endpoint.ports {
        let Ok(conditions) = netspec::parse_port_spec(ports_text) else {
            return Some(format!("{side}.ports '{ports_text}' unparseable"));
        };
        match port {
            None => return Some(format!("rule constrains {side}.ports; query has none")),
            Some(p) if !conditions.iter().any(|c| c.contains(p)) => {
                return Some(format!("{side} port {p} outside '{ports_text}'"));
            }
            Some(_) => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(rules_json: &str, default_action: &str) -> Policy {
        let json = format!(
            r#"{{
                "version": "1.0.0",
                "defaultAction": "{default_action}",
                "updatedAt": "2026-07-01T11:00:00Z",
                "rules": {rules_json}
            }}"#
        );
        serde_json::from_str(&json).unwrap()
    }

    fn outbound_tcp(ip: &str, port: u16) -> SimQuery {
        SimQuery {
            direction: Direction::Outbound,
            protocol: Protocol::Tcp,
            remote_ip: Some(ip.parse().unwrap()),
            remote_port: Some(port),
            ..SimQuery::default()
        }
    }

    #[test]
    fn first_match_by_priority_wins() {
        let policy = policy(
            r#"[{"id":"broad-allow","action":"allow","direction":"outbound","protocol":"tcp",
                 "remote":{"ip":"0.0.0.0/0"},"priority":1},
                {"id":"block-dns","action":"block","direction":"outbound","protocol":"tcp",
                 "remote":{"ip":"1.1.1.1"},"priority":100}]"#,
            "allow",
        );
        let outcome = simulate(&policy, &outbound_tcp("1.1.1.1", 443));
        assert!(!outcome.would_allow);
        assert_eq!(outcome.matched_rule_id.as_deref(), Some("block-dns"));
    }

    #[test]
    fn default_action_applies_when_nothing_matches() {
        let policy = policy(
            r#"[{"id":"r1","action":"allow","direction":"inbound","protocol":"tcp",
                 "remote":{"ports":"22"},"priority":1}]"#,
            "block",
        );
        let outcome = simulate(&policy, &outbound_tcp("8.8.8.8", 53));
        assert!(!outcome.would_allow);
        assert!(outcome.matched_rule_id.is_none());
        assert!(outcome.trace.last().unwrap().contains("default action block"));
    }

    #[test]
    fn both_direction_and_any_protocol_match_everything() {
        let policy = policy(
            r#"[{"id":"wide","action":"block","direction":"both","protocol":"any",
                 "priority":5}]"#,
            "allow",
        );
        let mut query = outbound_tcp("9.9.9.9", 443);
        query.protocol = Protocol::Udp;
        query.direction = Direction::Inbound;
        let outcome = simulate(&policy, &query);
        assert_eq!(outcome.matched_rule_id.as_deref(), Some("wide"));
    }

    #[test]
    fn missing_query_field_fails_the_condition() {
        let policy = policy(
            r#"[{"id":"port-block","action":"block","direction":"outbound","protocol":"tcp",
                 "remote":{"ports":"443"},"priority":5}]"#,
            "allow",
        );
        let query = SimQuery {
            direction: Direction::Outbound,
            protocol: Protocol::Tcp,
            ..SimQuery::default()
        };
        let outcome = simulate(&policy, &query);
        assert!(outcome.would_allow);
        assert!(outcome.trace[0].contains("query has none"));
    }

    #[test]
    fn disabled_rules_are_traced_and_skipped() {
        let policy = policy(
            r#"[{"id":"off","action":"block","direction":"outbound","protocol":"tcp",
                 "enabled":false,"priority":10}]"#,
            "allow",
        );
        let outcome = simulate(&policy, &outbound_tcp("1.2.3.4", 80));
        assert!(outcome.would_allow);
        assert!(outcome.trace[0].contains("disabled"));
    }

    #[test]
    fn process_match_is_case_insensitive() {
        let policy = policy(
            r#"[{"id":"proc","action":"block","direction":"outbound","protocol":"tcp",
                 "process":"C:\\Tools\\Agent.exe","priority":1}]"#,
            "allow",
        );
        let mut query = outbound_tcp("1.2.3.4", 80);
        query.process_path = Some("c:\\tools\\agent.exe".to_string());
        let outcome = simulate(&policy, &query);
        assert_eq!(outcome.matched_rule_id.as_deref(), Some("proc"));
    }
}
