//! Append-only audit trail.
//!
//! One JSON object per line. Appends are serialized behind a mutex and never
//! fail the operation being audited. Path-valued fields are reduced to their
//! basename before serialization so the log cannot leak directory layouts.
//! On first creation the file's permissions are tightened; failure there is
//! logged and tolerated.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use flowgate_common::consts;
use flowgate_common::proto::Source;
use flowgate_common::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditEvent {
    ServiceStart,
    ServiceStop,
    BootstrapStarted,
    BootstrapFinished,
    TeardownStarted,
    TeardownFinished,
    ApplyStarted,
    ApplyFinished,
    RollbackStarted,
    RollbackFinished,
    DemoBlockStarted,
    DemoBlockFinished,
    LkgLoad,
    LkgRevertStarted,
    LkgRevertFinished,
    WatchSet,
    WatchApplyStarted,
    WatchApplyFinished,
    HistoryRevertStarted,
    HistoryRevertFinished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub ts: DateTime<Utc>,
    pub event: AuditEvent,
    pub source: Source,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AuditStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Basename only; see [`redact_path`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters_created: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters_removed: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules_skipped: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_rules: Option<usize>,
}

impl AuditEntry {
    pub fn new(event: AuditEvent, source: Source) -> Self {
        Self {
            ts: Utc::now(),
            event,
            source,
            status: None,
            error_code: None,
            error_message: None,
            policy_file: None,
            policy_version: None,
            filters_created: None,
            filters_removed: None,
            rules_skipped: None,
            total_rules: None,
        }
    }

    pub fn success(mut self) -> Self {
        self.status = Some(AuditStatus::Success);
        self
    }

    pub fn failure(mut self, err: &Error) -> Self {
        self.status = Some(AuditStatus::Failure);
        self.error_code = Some(err.kind().as_str().to_string());
        self.error_message = Some(err.to_string());
        self
    }

    pub fn failure_reason(mut self, code: &str, message: impl Into<String>) -> Self {
        self.status = Some(AuditStatus::Failure);
        self.error_code = Some(code.to_string());
        self.error_message = Some(message.into());
        self
    }

    /// Records the policy file, redacted to its basename.
    pub fn policy_file(mut self, path: &str) -> Self {
        self.policy_file = Some(redact_path(path));
        self
    }

    pub fn policy_version(mut self, version: &str) -> Self {
        self.policy_version = Some(version.to_string());
        self
    }

    pub fn counts(
        mut self,
        created: usize,
        removed: usize,
        skipped: usize,
        total: usize,
    ) -> Self {
        self.filters_created = Some(created);
        self.filters_removed = Some(removed);
        self.rules_skipped = Some(skipped);
        self.total_rules = Some(total);
        self
    }
}

/// Strips everything up to the final path separator.
pub fn redact_path(path: &str) -> String {
    path.rsplit(['/', '\\'])
        .next()
        .unwrap_or(path)
        .to_string()
}

pub struct AuditLog {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl AuditLog {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(consts::AUDIT_FILE),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one entry. Failures are logged to the operational log and
    /// swallowed; auditing must never fail the audited operation.
    pub fn append(&self, entry: &AuditEntry) {
        let line = match serde_json::to_string(entry) {
            Ok(line) => line,
            Err(err) => {
                warn!(?err, "audit entry serialization failed");
                return;
            }
        };
        let mut guard = self.file.lock().unwrap();
        if guard.is_none() {
            match self.open_for_append() {
                Ok(file) => *guard = Some(file),
                Err(err) => {
                    warn!(?err, path = %self.path.display(), "audit log open failed");
                    return;
                }
            }
        }
        if let Some(file) = guard.as_mut() {
            if let Err(err) = writeln!(file, "{line}") {
                warn!(?err, "audit append failed");
                // Force a reopen on the next append.
                *guard = None;
            }
        }
    }

    fn open_for_append(&self) -> std::io::Result<File> {
        let fresh = !self.path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        if fresh {
            restrict_permissions(&self.path);
        }
        Ok(file)
    }

    /// Newest-first view of the whole log. Loads every line; acceptable for
    /// the bounded operational horizon this log covers.
    pub fn read_all(&self) -> Result<Vec<AuditEntry>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(Error::Service(format!("audit read failed: {err}"))),
        };
        let mut entries: Vec<AuditEntry> = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                // A torn final line from a concurrent append is expected.
                Err(err) => warn!(?err, "skipping malformed audit line"),
            }
        }
        entries.reverse();
        Ok(entries)
    }

    pub fn tail(&self, n: usize) -> Result<Vec<AuditEntry>> {
        let mut entries = self.read_all()?;
        entries.truncate(n);
        Ok(entries)
    }

    pub fn since(&self, minutes: i64) -> Result<Vec<AuditEntry>> {
        let cutoff = Utc::now() - Duration::minutes(minutes);
        let mut entries = self.read_all()?;
        entries.retain(|e| e.ts >= cutoff);
        Ok(entries)
    }
}

/// Owner read/write, admin group read, nothing for anyone else. The service
/// principal owns the file; the reference host expresses the same policy as
/// an ACL grant to Administrators.
#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(err) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o640)) {
        warn!(?err, path = %path.display(), "audit log permission tightening failed");
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn entries_roundtrip_newest_first() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path());
        log.append(&AuditEntry::new(AuditEvent::ApplyStarted, Source::Cli));
        log.append(
            &AuditEntry::new(AuditEvent::ApplyFinished, Source::Cli)
                .success()
                .counts(5, 2, 0, 5)
                .policy_version("1.0.0"),
        );

        let entries = log.read_all().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].event, AuditEvent::ApplyFinished);
        assert_eq!(entries[0].filters_created, Some(5));
        assert_eq!(entries[1].event, AuditEvent::ApplyStarted);
    }

    #[test]
    fn path_fields_are_reduced_to_basename() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path());
        log.append(
            &AuditEntry::new(AuditEvent::ApplyFinished, Source::Cli)
                .success()
                .policy_file("C:\\Users\\admin\\policies\\prod.json"),
        );
        log.append(
            &AuditEntry::new(AuditEvent::WatchSet, Source::Ui)
                .policy_file("/home/op/secret-dir/watch.json"),
        );

        let raw = std::fs::read_to_string(log.path()).unwrap();
        assert!(!raw.contains("admin"), "{raw}");
        assert!(!raw.contains("secret-dir"), "{raw}");
        assert!(raw.contains("prod.json"));
        assert!(raw.contains("watch.json"));
    }

    #[test]
    fn tail_limits_and_orders() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path());
        for _ in 0..5 {
            log.append(&AuditEntry::new(AuditEvent::BootstrapStarted, Source::Cli));
        }
        log.append(&AuditEntry::new(AuditEvent::BootstrapFinished, Source::Cli).success());
        let tail = log.tail(2).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].event, AuditEvent::BootstrapFinished);
    }

    #[test]
    fn since_filters_by_timestamp() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path());
        log.append(&AuditEntry::new(AuditEvent::ServiceStart, Source::Startup));
        assert_eq!(log.since(5).unwrap().len(), 1);

        let mut stale = AuditEntry::new(AuditEvent::ServiceStop, Source::Startup);
        stale.ts = Utc::now() - Duration::minutes(90);
        log.append(&stale);
        assert_eq!(log.since(5).unwrap().len(), 1);
        assert_eq!(log.since(120).unwrap().len(), 2);
    }

    #[test]
    fn malformed_lines_are_skipped_not_fatal() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path());
        log.append(&AuditEntry::new(AuditEvent::ServiceStart, Source::Startup));
        std::fs::OpenOptions::new()
            .append(true)
            .open(log.path())
            .unwrap()
            .write_all(b"{torn line\n")
            .unwrap();
        log.append(&AuditEntry::new(AuditEvent::ServiceStop, Source::Startup));

        let entries = log.read_all().unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn missing_log_reads_empty() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path());
        assert!(log.read_all().unwrap().is_empty());
        assert!(log.tail(10).unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn first_write_tightens_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path());
        log.append(&AuditEntry::new(AuditEvent::ServiceStart, Source::Startup));
        let mode = std::fs::metadata(log.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);
    }

    #[test]
    fn event_names_serialize_kebab_case() {
        let entry = AuditEntry::new(AuditEvent::LkgRevertFinished, Source::HotReload);
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains(r#""event":"lkg-revert-finished""#), "{json}");
        assert!(json.contains(r#""source":"hot-reload""#), "{json}");
    }
}
