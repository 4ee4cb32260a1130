//! Last-known-good policy persistence.
//!
//! The record wraps the policy JSON verbatim with a SHA-256 checksum; loads
//! walk the full validation chain (file → record JSON → checksum → inner
//! policy parse → inner policy validation) and any break reports `Corrupt`
//! rather than an error, because a damaged LKG must fail open.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use flowgate_common::{consts, Error, Result};
use flowgate_policy::ValidatedPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LkgRecord {
    /// Hex SHA-256 of `policyJson`.
    pub checksum: String,
    /// The applied policy document, byte-for-byte.
    pub policy_json: String,
    pub saved_at: DateTime<Utc>,
    pub source_path: String,
}

/// Record header without the inner policy parse.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LkgMetadata {
    pub checksum: String,
    pub saved_at: DateTime<Utc>,
    pub source_path: String,
    pub policy_bytes: usize,
}

#[derive(Debug)]
pub enum LkgLoad {
    NotFound,
    Corrupt(String),
    Ok {
        record: LkgRecord,
        policy: ValidatedPolicy,
    },
}

pub struct LkgStore {
    path: PathBuf,
}

impl LkgStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(consts::LKG_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persists the policy as the new LKG. The rename is the atomicity
    /// primitive: readers see either the old record or the new one.
    pub fn save(&self, policy_json: &str, source_path: &str) -> Result<LkgRecord> {
        let record = LkgRecord {
            checksum: checksum(policy_json),
            policy_json: policy_json.to_string(),
            saved_at: Utc::now(),
            source_path: source_path.to_string(),
        };
        let serialized = serde_json::to_string_pretty(&record)
            .map_err(|e| Error::Service(format!("LKG record serialization failed: {e}")))?;

        let tmp = self
            .path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(consts::LKG_TMP_FILE);
        fs::write(&tmp, serialized)
            .map_err(|e| Error::Service(format!("LKG temp write failed: {e}")))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| Error::Service(format!("LKG rename failed: {e}")))?;
        debug!(path = %self.path.display(), checksum = %record.checksum, "LKG saved");
        Ok(record)
    }

    pub fn load(&self) -> LkgLoad {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return LkgLoad::NotFound,
            Err(err) => return LkgLoad::Corrupt(format!("read failed: {err}")),
        };
        let record: LkgRecord = match serde_json::from_slice(&bytes) {
            Ok(record) => record,
            Err(err) => return LkgLoad::Corrupt(format!("record parse failed: {err}")),
        };
        if checksum(&record.policy_json) != record.checksum {
            return LkgLoad::Corrupt("checksum-mismatch".to_string());
        }
        match ValidatedPolicy::from_slice(record.policy_json.as_bytes()) {
            Ok(policy) => LkgLoad::Ok { record, policy },
            Err(err) => LkgLoad::Corrupt(format!("stored policy is invalid: {err}")),
        }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn delete(&self) -> Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(Error::Service(format!("LKG delete failed: {err}"))),
        }
    }

    /// Record header without parsing the stored policy.
    pub fn metadata(&self) -> Result<Option<LkgMetadata>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(Error::Service(format!("LKG read failed: {err}"))),
        };
        let record: LkgRecord = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Service(format!("LKG record parse failed: {e}")))?;
        Ok(Some(LkgMetadata {
            checksum: record.checksum,
            saved_at: record.saved_at,
            source_path: record.source_path,
            policy_bytes: record.policy_json.len(),
        }))
    }
}

fn checksum(policy_json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(policy_json.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn valid_policy_json() -> String {
        let updated = (Utc::now() - chrono::Duration::minutes(1)).to_rfc3339();
        format!(
            r#"{{"version":"1.0.0","defaultAction":"allow","updatedAt":"{updated}",
                "rules":[{{"id":"r1","action":"block","direction":"outbound","protocol":"tcp",
                           "remote":{{"ip":"1.1.1.1","ports":"443"}}}}]}}"#
        )
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = TempDir::new().unwrap();
        let store = LkgStore::new(dir.path());
        let json = valid_policy_json();
        let saved = store.save(&json, "/etc/flowgate/policy.json").unwrap();

        match store.load() {
            LkgLoad::Ok { record, policy } => {
                assert_eq!(record.checksum, saved.checksum);
                assert_eq!(record.policy_json, json);
                assert_eq!(policy.rules.len(), 1);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        // Temp file must not linger after the rename.
        assert!(!dir.path().join(consts::LKG_TMP_FILE).exists());
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(LkgStore::new(dir.path()).load(), LkgLoad::NotFound));
    }

    #[test]
    fn tampered_policy_json_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = LkgStore::new(dir.path());
        store.save(&valid_policy_json(), "p.json").unwrap();

        // Flip one byte inside the stored policyJson.
        let raw = fs::read_to_string(store.path()).unwrap();
        let tampered = raw.replace("1.1.1.1", "1.1.1.2");
        assert_ne!(raw, tampered);
        fs::write(store.path(), tampered).unwrap();

        match store.load() {
            LkgLoad::Corrupt(reason) => assert_eq!(reason, "checksum-mismatch"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn garbage_record_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = LkgStore::new(dir.path());
        fs::write(store.path(), b"not json at all").unwrap();
        assert!(matches!(store.load(), LkgLoad::Corrupt(_)));
    }

    #[test]
    fn checksum_valid_but_inner_policy_invalid_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = LkgStore::new(dir.path());
        // Well-formed record whose payload fails policy validation.
        store.save(r#"{"version":"oops"}"#, "p.json").unwrap();
        match store.load() {
            LkgLoad::Corrupt(reason) => assert!(reason.contains("invalid"), "{reason}"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn metadata_skips_the_inner_parse() {
        let dir = TempDir::new().unwrap();
        let store = LkgStore::new(dir.path());
        assert!(store.metadata().unwrap().is_none());

        // Metadata works even when the payload would not validate.
        store.save("{}", "broken.json").unwrap();
        let meta = store.metadata().unwrap().unwrap();
        assert_eq!(meta.source_path, "broken.json");
        assert_eq!(meta.policy_bytes, 2);
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = LkgStore::new(dir.path());
        store.save(&valid_policy_json(), "p.json").unwrap();
        assert!(store.exists());
        assert!(store.delete().unwrap());
        assert!(!store.delete().unwrap());
        assert!(!store.exists());
    }
}
