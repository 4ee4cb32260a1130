//! Serde model for the declarative policy document.
//!
//! The model is deliberately tolerant: enum fields accept any casing and
//! unknown object fields are ignored, so policies written for newer service
//! revisions still load. Semantic enforcement lives in [`crate::validate`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Allow,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Any,
}

macro_rules! ci_enum_serde {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                match raw.to_ascii_lowercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(de::Error::custom(format!(
                        concat!("unknown ", stringify!($ty), " '{}'"),
                        other
                    ))),
                }
            }
        }
    };
}

ci_enum_serde!(Action { Allow => "allow", Block => "block" });
ci_enum_serde!(Direction { Inbound => "inbound", Outbound => "outbound", Both => "both" });
ci_enum_serde!(Protocol { Tcp => "tcp", Udp => "udp", Any => "any" });

/// Constrains one side of a connection. At least one of `ip`/`ports` must be
/// present; the strings use the grammars in [`crate::netspec`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<String>,
}

impl EndpointFilter {
    pub fn is_vacuous(&self) -> bool {
        self.ip.is_none() && self.ports.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: String,
    pub action: Action,
    pub direction: Direction,
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<EndpointFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<EndpointFilter>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

fn enabled_default() -> bool {
    true
}

impl Rule {
    /// One-line human rendering used by the `block-rules` projection.
    pub fn summary(&self) -> String {
        let mut out = format!("{} {} {}", self.action, self.direction, self.protocol);
        if let Some(remote) = &self.remote {
            match (&remote.ip, &remote.ports) {
                (Some(ip), Some(ports)) => {
                    out.push_str(&format!(" to {ip} port {ports}"));
                }
                (Some(ip), None) => out.push_str(&format!(" to {ip}")),
                (None, Some(ports)) => out.push_str(&format!(" to port {ports}")),
                (None, None) => {}
            }
        }
        if let Some(process) = &self.process {
            out.push_str(&format!(" for process {process}"));
        }
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub version: String,
    pub default_action: Action,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl Policy {
    /// Enabled block rules with display summaries, highest priority first.
    pub fn enabled_block_rules(&self) -> Vec<BlockRuleSummary> {
        let mut rules: Vec<_> = self
            .rules
            .iter()
            .filter(|r| r.enabled && r.action == Action::Block)
            .map(|r| BlockRuleSummary {
                id: r.id.clone(),
                priority: r.priority,
                summary: r.summary(),
            })
            .collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        rules
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockRuleSummary {
    pub id: String,
    pub priority: i32,
    pub summary: String,
}
