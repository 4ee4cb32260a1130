//! Total policy validation.
//!
//! Every check runs and every finding is reported; the validator never stops
//! at the first issue and never mutates the policy. A [`ValidatedPolicy`] is
//! the proof token the compiler and orchestrator accept.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::OnceLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;

use flowgate_common::{consts, Error, PolicyIssue};

use crate::model::Policy;
use crate::netspec;

/// A policy that passed validation. Obtainable only through this module.
#[derive(Debug, Clone)]
pub struct ValidatedPolicy(Policy);

impl Deref for ValidatedPolicy {
    type Target = Policy;

    fn deref(&self) -> &Policy {
        &self.0
    }
}

impl ValidatedPolicy {
    /// Parses and validates a raw policy buffer. The size limit applies to
    /// the buffer itself, before any parsing.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, Error> {
        Self::from_slice_at(bytes, Utc::now())
    }

    pub fn from_slice_at(bytes: &[u8], now: DateTime<Utc>) -> Result<Self, Error> {
        if bytes.len() > consts::MAX_POLICY_BYTES {
            return Err(Error::InvalidPolicy(vec![PolicyIssue::new(
                "$",
                format!(
                    "policy JSON is {} bytes; the limit is {}",
                    bytes.len(),
                    consts::MAX_POLICY_BYTES
                ),
            )]));
        }
        let policy: Policy = serde_json::from_slice(bytes).map_err(|e| {
            Error::InvalidPolicy(vec![PolicyIssue::new(
                "$",
                format!("policy JSON failed to parse: {e}"),
            )])
        })?;
        Self::from_policy_at(policy, now)
    }

    pub fn from_policy(policy: Policy) -> Result<Self, Error> {
        Self::from_policy_at(policy, Utc::now())
    }

    pub fn from_policy_at(policy: Policy, now: DateTime<Utc>) -> Result<Self, Error> {
        let issues = validate_at(&policy, now);
        if issues.is_empty() {
            Ok(Self(policy))
        } else {
            Err(Error::InvalidPolicy(issues))
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.0
    }

    pub fn into_inner(self) -> Policy {
        self.0
    }
}

/// Runs every check against the already-parsed policy.
pub fn validate(policy: &Policy) -> Vec<PolicyIssue> {
    validate_at(policy, Utc::now())
}

pub fn validate_at(policy: &Policy, now: DateTime<Utc>) -> Vec<PolicyIssue> {
    let mut issues = Vec::new();

    if !semver_re().is_match(&policy.version) {
        issues.push(PolicyIssue::new(
            "$.version",
            format!(
                "'{}' is not a semantic version of the form X.Y.Z[-pre]",
                policy.version
            ),
        ));
    }

    if policy.updated_at > now + Duration::minutes(5) {
        issues.push(PolicyIssue::new(
            "$.updatedAt",
            format!(
                "'{}' is more than 5 minutes in the future",
                policy.updated_at.to_rfc3339()
            ),
        ));
    }

    if policy.rules.len() > consts::MAX_RULES {
        issues.push(PolicyIssue::new(
            "$.rules",
            format!(
                "{} rules exceed the limit of {}",
                policy.rules.len(),
                consts::MAX_RULES
            ),
        ));
    }

    let mut first_seen: HashMap<&str, usize> = HashMap::new();
    for (index, rule) in policy.rules.iter().enumerate() {
        let at = |field: &str| format!("$.rules[{index}].{field}");

        if rule.id.is_empty() || rule.id.len() > consts::MAX_RULE_ID_LEN {
            issues.push(PolicyIssue::new(
                at("id"),
                format!(
                    "rule id must be 1..{} characters",
                    consts::MAX_RULE_ID_LEN
                ),
            ));
        } else if !rule
            .id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            issues.push(PolicyIssue::new(
                at("id"),
                format!(
                    "rule id '{}' contains characters outside [A-Za-z0-9_-]",
                    rule.id
                ),
            ));
        }

        match first_seen.get(rule.id.as_str()) {
            Some(first) => {
                issues.push(PolicyIssue::new(
                    at("id"),
                    format!(
                        "duplicate rule id '{}' (first used at index {first})",
                        rule.id
                    ),
                ));
            }
            None => {
                first_seen.insert(rule.id.as_str(), index);
            }
        }

        if let Some(process) = &rule.process {
            if let Err(message) = check_process_path(process) {
                issues.push(PolicyIssue::new(at("process"), message));
            }
        }

        for (field, endpoint) in [("local", &rule.local), ("remote", &rule.remote)] {
            let Some(endpoint) = endpoint else { continue };
            if endpoint.is_vacuous() {
                issues.push(PolicyIssue::new(
                    at(field),
                    "endpoint filter needs at least one of ip/ports",
                ));
                continue;
            }
            if let Some(ip) = &endpoint.ip {
                if let Err(message) = netspec::parse_ip_spec(ip) {
                    issues.push(PolicyIssue::new(format!("{}.ip", at(field)), message));
                }
            }
            if let Some(ports) = &endpoint.ports {
                if let Err(message) = netspec::parse_port_spec(ports) {
                    issues.push(PolicyIssue::new(format!("{}.ports", at(field)), message));
                }
            }
        }

        if let Some(comment) = &rule.comment {
            if comment.len() > consts::MAX_COMMENT_LEN {
                issues.push(PolicyIssue::new(
                    at("comment"),
                    format!(
                        "comment is {} characters; the limit is {}",
                        comment.len(),
                        consts::MAX_COMMENT_LEN
                    ),
                ));
            }
        }
    }

    issues
}

fn semver_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(0|[1-9]\d*)\.(0|[1-9]\d*)\.(0|[1-9]\d*)(-[0-9A-Za-z-]+(\.[0-9A-Za-z-]+)*)?$",
        )
        .expect("semver pattern")
    })
}

/// Process paths are either absolute (`/usr/bin/curl`, `C:\app\tool.exe`,
/// `\\host\share\tool.exe`) or a bare executable name. Relative paths and
/// parent traversal are refused.
fn check_process_path(path: &str) -> Result<(), String> {
    if path.is_empty() {
        return Err("process path is empty".to_string());
    }
    if path.len() > consts::MAX_PROCESS_PATH_LEN {
        return Err(format!(
            "process path is {} characters; the limit is {}",
            path.len(),
            consts::MAX_PROCESS_PATH_LEN
        ));
    }
    if path.split(['/', '\\']).any(|segment| segment == "..") {
        return Err("process path must not contain '..' segments".to_string());
    }
    let bytes = path.as_bytes();
    let absolute = bytes[0] == b'/'
        || path.starts_with("\\\\")
        || (bytes.len() > 2
            && bytes[0].is_ascii_alphabetic()
            && bytes[1] == b':'
            && (bytes[2] == b'\\' || bytes[2] == b'/'));
    let bare_name = !path.contains('/') && !path.contains('\\');
    if absolute || bare_name {
        Ok(())
    } else {
        Err(format!(
            "process path '{path}' must be absolute or a bare executable name"
        ))
    }
}
