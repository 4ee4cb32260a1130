//! IPC wire envelope.
//!
//! Framing is `u32` little-endian length followed by that many bytes of
//! UTF-8 JSON. A request is an object with a `type` discriminator and an
//! optional `protocolVersion`; responses always carry `ok` and
//! `protocolVersion`. Handler-specific fields ride at the top level of the
//! same object.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::consts;
use crate::error::Error;

/// Where an operation originated. Callers may hint this per connection; the
/// hint is recorded for triage and never participates in authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    Cli,
    HotReload,
    Startup,
    Ui,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::HotReload => "hot-reload",
            Self::Startup => "startup",
            Self::Ui => "ui",
        }
    }

    pub fn parse_hint(hint: &str) -> Option<Self> {
        match hint {
            "cli" => Some(Self::Cli),
            "hot-reload" => Some(Self::HotReload),
            "startup" => Some(Self::Startup),
            "ui" => Some(Self::Ui),
            _ => None,
        }
    }
}

/// Decoded request envelope; `body` keeps the full object so handler
/// parameter structs can be deserialized from it.
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    pub kind: Option<String>,
    pub protocol_version: i64,
    pub source: Option<String>,
    pub body: Value,
}

impl RequestEnvelope {
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        let body: Value = serde_json::from_slice(bytes)
            .map_err(|e| Error::InvalidArgument(format!("malformed request JSON: {e}")))?;
        let kind = body
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let protocol_version = body
            .get("protocolVersion")
            .and_then(Value::as_i64)
            .unwrap_or(consts::PROTOCOL_VERSION_MIN);
        let source = body
            .get("source")
            .and_then(Value::as_str)
            .map(str::to_owned);
        Ok(Self {
            kind,
            protocol_version,
            source,
            body,
        })
    }

    /// Supported range is `[PROTOCOL_VERSION_MIN, PROTOCOL_VERSION]`; the
    /// minimum doubles as the legacy default for requests that omit the field.
    pub fn check_protocol_version(&self) -> Result<(), Error> {
        let v = self.protocol_version;
        if (consts::PROTOCOL_VERSION_MIN..=consts::PROTOCOL_VERSION).contains(&v) {
            Ok(())
        } else {
            Err(Error::ProtocolVersionMismatch {
                requested: v,
                min: consts::PROTOCOL_VERSION_MIN,
                current: consts::PROTOCOL_VERSION,
            })
        }
    }

    pub fn params<T: serde::de::DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_value(self.body.clone())
            .map_err(|e| Error::InvalidArgument(format!("bad request parameters: {e}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyPathParams {
    pub policy_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchSetParams {
    #[serde(default)]
    pub policy_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogsParams {
    #[serde(default)]
    pub tail: Option<usize>,
    #[serde(default)]
    pub since_minutes: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryIdParams {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulateParams {
    pub direction: String,
    pub protocol: String,
    #[serde(default)]
    pub remote_ip: Option<String>,
    #[serde(default)]
    pub remote_port: Option<u16>,
    #[serde(default)]
    pub local_ip: Option<String>,
    #[serde(default)]
    pub local_port: Option<u16>,
    #[serde(default)]
    pub process_path: Option<String>,
}

/// Builds `{"ok":true,"protocolVersion":N,...fields}`.
pub fn ok_response(fields: Value) -> Value {
    let mut map = match fields {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("result".into(), other);
            map
        }
    };
    map.insert("ok".into(), Value::Bool(true));
    map.insert(
        "protocolVersion".into(),
        Value::from(consts::PROTOCOL_VERSION),
    );
    Value::Object(map)
}

/// Builds `{"ok":false,"error":...,"errorCode":...,"protocolVersion":N}`,
/// attaching the issue list for policy failures and the supported range for
/// version mismatches.
pub fn error_response(err: &Error) -> Value {
    let mut map = Map::new();
    map.insert("ok".into(), Value::Bool(false));
    map.insert(
        "protocolVersion".into(),
        Value::from(consts::PROTOCOL_VERSION),
    );
    map.insert("error".into(), Value::from(err.to_string()));
    map.insert("errorCode".into(), Value::from(err.kind().as_str()));
    match err {
        Error::InvalidPolicy(issues) => {
            map.insert(
                "issues".into(),
                serde_json::to_value(issues).unwrap_or(Value::Null),
            );
        }
        Error::ProtocolVersionMismatch { min, current, .. } => {
            map.insert("supportedMin".into(), Value::from(*min));
            map.insert("supportedCurrent".into(), Value::from(*current));
        }
        _ => {}
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PolicyIssue;

    #[test]
    fn envelope_defaults_protocol_version_to_legacy() {
        let env = RequestEnvelope::parse(br#"{"type":"ping"}"#).unwrap();
        assert_eq!(env.kind.as_deref(), Some("ping"));
        assert_eq!(env.protocol_version, consts::PROTOCOL_VERSION_MIN);
        assert!(env.check_protocol_version().is_ok());
    }

    #[test]
    fn envelope_rejects_future_protocol_version() {
        let env =
            RequestEnvelope::parse(br#"{"type":"ping","protocolVersion":99}"#).unwrap();
        let err = env.check_protocol_version().unwrap_err();
        match err {
            Error::ProtocolVersionMismatch { requested, min, current } => {
                assert_eq!(requested, 99);
                assert_eq!(min, consts::PROTOCOL_VERSION_MIN);
                assert_eq!(current, consts::PROTOCOL_VERSION);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn envelope_surfaces_missing_type() {
        let env = RequestEnvelope::parse(br#"{"protocolVersion":1}"#).unwrap();
        assert!(env.kind.is_none());
    }

    #[test]
    fn params_deserialize_from_body() {
        let env = RequestEnvelope::parse(
            br#"{"type":"apply","protocolVersion":1,"policyPath":"/tmp/p.json"}"#,
        )
        .unwrap();
        let params: PolicyPathParams = env.params().unwrap();
        assert_eq!(params.policy_path, "/tmp/p.json");
    }

    #[test]
    fn error_response_carries_code_and_issues() {
        let err = Error::InvalidPolicy(vec![PolicyIssue::new("$.version", "not semver")]);
        let resp = error_response(&err);
        assert_eq!(resp["ok"], Value::Bool(false));
        assert_eq!(resp["errorCode"], Value::from("InvalidPolicy"));
        assert_eq!(resp["issues"][0]["path"], Value::from("$.version"));
    }

    #[test]
    fn ok_response_merges_fields() {
        let resp = ok_response(serde_json::json!({"filtersCreated": 5}));
        assert_eq!(resp["ok"], Value::Bool(true));
        assert_eq!(resp["filtersCreated"], Value::from(5));
        assert_eq!(resp["protocolVersion"], Value::from(consts::PROTOCOL_VERSION));
    }
}
