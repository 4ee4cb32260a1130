//! Bounded on-disk record of applied policies.
//!
//! The index is a single JSON array rewritten atomically on every append;
//! each entry has a sibling `policy-YYYYMMDD-HHmmss-fff.json` payload. The
//! ring keeps the most recent [`consts::MAX_HISTORY_ENTRIES`]; eviction
//! deletes the sibling payload too.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::warn;

use flowgate_common::consts;
use flowgate_common::proto::Source;
use flowgate_common::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// Also the payload file stem.
    pub id: String,
    pub applied_at: DateTime<Utc>,
    pub policy_version: String,
    pub rule_count: usize,
    pub source: Source,
    pub source_path: String,
    pub filters_created: usize,
    pub filters_removed: usize,
}

pub struct HistoryStore {
    dir: PathBuf,
}

impl HistoryStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join(consts::HISTORY_DIR),
        }
    }

    fn index_path(&self) -> PathBuf {
        self.dir.join(consts::HISTORY_INDEX_FILE)
    }

    fn payload_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Records one applied policy. The caller treats failures as non-fatal;
    /// this method still reports them so they can be logged.
    pub fn append(
        &self,
        policy_json: &str,
        policy_version: &str,
        rule_count: usize,
        source: Source,
        source_path: &str,
        filters_created: usize,
        filters_removed: usize,
    ) -> Result<HistoryEntry> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| Error::Service(format!("history dir create failed: {e}")))?;

        let mut entries = self.list()?;
        // list() is newest-first; keep the index oldest-first on disk.
        entries.reverse();

        let applied_at = Utc::now();
        let base = format!("policy-{}", applied_at.format("%Y%m%d-%H%M%S-%3f"));
        // Same-millisecond appends get a numeric suffix.
        let mut id = base.clone();
        let mut n = 1;
        while entries.iter().any(|e| e.id == id) {
            id = format!("{base}-{n}");
            n += 1;
        }
        let entry = HistoryEntry {
            id,
            applied_at,
            policy_version: policy_version.to_string(),
            rule_count,
            source,
            source_path: source_path.to_string(),
            filters_created,
            filters_removed,
        };

        fs::write(self.payload_path(&entry.id), policy_json)
            .map_err(|e| Error::Service(format!("history payload write failed: {e}")))?;

        entries.push(entry.clone());
        while entries.len() > consts::MAX_HISTORY_ENTRIES {
            let evicted = entries.remove(0);
            if let Err(err) = fs::remove_file(self.payload_path(&evicted.id)) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(?err, id = %evicted.id, "evicted history payload not deleted");
                }
            }
        }
        self.rewrite_index(&entries)?;
        Ok(entry)
    }

    /// Entries newest-first.
    pub fn list(&self) -> Result<Vec<HistoryEntry>> {
        let bytes = match fs::read(self.index_path()) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(Error::Service(format!("history index read failed: {err}"))),
        };
        let mut entries: Vec<HistoryEntry> = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Service(format!("history index parse failed: {e}")))?;
        entries.reverse();
        Ok(entries)
    }

    /// Entry plus its stored policy document.
    pub fn get(&self, id: &str) -> Result<(HistoryEntry, String)> {
        let entry = self
            .list()?
            .into_iter()
            .find(|e| e.id == id)
            .ok_or_else(|| Error::NotFound(format!("history entry '{id}'")))?;
        let policy_json = fs::read_to_string(self.payload_path(id))
            .map_err(|e| Error::Service(format!("history payload read failed: {e}")))?;
        Ok((entry, policy_json))
    }

    fn rewrite_index(&self, entries: &[HistoryEntry]) -> Result<()> {
        let serialized = serde_json::to_string_pretty(entries)
            .map_err(|e| Error::Service(format!("history index serialization failed: {e}")))?;
        let mut tmp = NamedTempFile::new_in(&self.dir)
            .map_err(|e| Error::Service(format!("history index temp failed: {e}")))?;
        tmp.write_all(serialized.as_bytes())
            .map_err(|e| Error::Service(format!("history index write failed: {e}")))?;
        tmp.persist(self.index_path())
            .map_err(|e| Error::Service(format!("history index rename failed: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (HistoryStore, TempDir) {
        let dir = TempDir::new().unwrap();
        (HistoryStore::new(dir.path()), dir)
    }

    fn append_n(store: &HistoryStore, n: usize) -> Vec<HistoryEntry> {
        (0..n)
            .map(|i| {
                store
                    .append(
                        &format!(r#"{{"marker":{i}}}"#),
                        "1.0.0",
                        1,
                        Source::Cli,
                        "/tmp/p.json",
                        1,
                        0,
                    )
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn append_and_get_roundtrip() {
        let (store, _dir) = store();
        let entry = store
            .append(r#"{"v":1}"#, "1.2.3", 4, Source::HotReload, "/watch/p.json", 3, 1)
            .unwrap();
        assert!(entry.id.starts_with("policy-"));

        let (found, payload) = store.get(&entry.id).unwrap();
        assert_eq!(found.policy_version, "1.2.3");
        assert_eq!(found.rule_count, 4);
        assert_eq!(payload, r#"{"v":1}"#);
    }

    #[test]
    fn list_is_newest_first() {
        let (store, _dir) = store();
        let entries = append_n(&store, 3);
        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 3);
        assert_eq!(listed[0].id, entries[2].id);
        assert_eq!(listed[2].id, entries[0].id);
    }

    #[test]
    fn ring_evicts_oldest_and_its_payload() {
        let (store, _dir) = store();
        let entries = append_n(&store, consts::MAX_HISTORY_ENTRIES + 3);

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), consts::MAX_HISTORY_ENTRIES);
        // The three oldest are gone, payload files included.
        for evicted in &entries[..3] {
            assert!(store.get(&evicted.id).is_err());
            assert!(!store.payload_path(&evicted.id).exists());
        }
        assert_eq!(listed[0].id, entries.last().unwrap().id);
    }

    #[test]
    fn unknown_id_is_not_found() {
        let (store, _dir) = store();
        append_n(&store, 1);
        let err = store.get("policy-19700101-000000-000").unwrap_err();
        assert_eq!(err.kind(), flowgate_common::ErrorKind::NotFound);
    }

    #[test]
    fn empty_store_lists_nothing() {
        let (store, _dir) = store();
        assert!(store.list().unwrap().is_empty());
    }
}
