//! Durable state: the last-known-good policy, the append-only audit trail,
//! and the bounded policy history. All writers go through atomic renames or
//! append-only handles; readers tolerate concurrent writers.

pub mod audit;
pub mod history;
pub mod lkg;

pub use audit::{AuditEntry, AuditEvent, AuditLog, AuditStatus};
pub use history::{HistoryEntry, HistoryStore};
pub use lkg::{LkgLoad, LkgMetadata, LkgRecord, LkgStore};
