//! In-memory engine backing.
//!
//! Behaves like the real engine as far as the orchestrator can observe:
//! shared state across sessions, working-copy transactions (commit swaps the
//! copy in, abort discards it), status-code parity on missing/duplicate
//! objects, and client-side sublayer filtering in enumeration. Fault
//! injection hooks let tests force the failure paths.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use flowgate_common::consts::ENUM_BATCH_SIZE;
use flowgate_policy::ObservedFilter;

use crate::error::codes;
use crate::{EngineBackend, EngineSession, FilterSpec, ProviderSpec, SublayerSpec, WfpError, WfpResult};

#[derive(Debug, Clone, PartialEq, Eq)]
struct ProviderRecord {
    name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SublayerRecord {
    provider_key: Uuid,
    weight: u16,
    name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FilterRecord {
    id: u64,
    sublayer_key: Uuid,
    name: String,
    weight: u64,
    has_app_id: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct EngineState {
    providers: HashMap<Uuid, ProviderRecord>,
    sublayers: HashMap<Uuid, SublayerRecord>,
    filters: HashMap<Uuid, FilterRecord>,
    next_filter_id: u64,
}

#[derive(Debug, Default)]
struct Faults {
    fail_open: bool,
    fail_commit_once: bool,
    fail_add_filter: Option<Uuid>,
    untranslatable: HashSet<String>,
}

/// Shared fake engine; every opened session sees the same kernel-side state.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<EngineState>>,
    faults: Arc<Mutex<Faults>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installed filters in the given sublayer, sorted by runtime id.
    pub fn filters_in(&self, sublayer: Uuid) -> Vec<ObservedFilter> {
        let state = self.state.lock().unwrap();
        let mut filters: Vec<_> = state
            .filters
            .iter()
            .filter(|(_, record)| record.sublayer_key == sublayer)
            .map(|(key, record)| ObservedFilter {
                key: *key,
                id: record.id,
                name: Some(record.name.clone()),
            })
            .collect();
        filters.sort_by_key(|f| f.id);
        filters
    }

    /// Stable fingerprint of the full engine state, for before/after
    /// atomicity assertions.
    pub fn fingerprint(&self) -> Vec<(Uuid, u64)> {
        let state = self.state.lock().unwrap();
        let mut entries: Vec<_> = state
            .filters
            .iter()
            .map(|(key, record)| (*key, record.id))
            .collect();
        entries.sort();
        entries
    }

    pub fn has_provider(&self, key: Uuid) -> bool {
        self.state.lock().unwrap().providers.contains_key(&key)
    }

    pub fn has_sublayer(&self, key: Uuid) -> bool {
        self.state.lock().unwrap().sublayers.contains_key(&key)
    }

    // Fault injection.

    pub fn fail_next_commit(&self) {
        self.faults.lock().unwrap().fail_commit_once = true;
    }

    pub fn fail_open(&self, fail: bool) {
        self.faults.lock().unwrap().fail_open = fail;
    }

    /// Makes `add_filter` fail for the given compiled key until cleared.
    pub fn fail_add_filter(&self, key: Option<Uuid>) {
        self.faults.lock().unwrap().fail_add_filter = key;
    }

    /// Marks a process path as untranslatable to a device-form blob.
    pub fn mark_untranslatable(&self, path: &str) {
        self.faults.lock().unwrap().untranslatable.insert(path.to_string());
    }
}

impl EngineBackend for MemoryBackend {
    fn open(&self) -> WfpResult<Box<dyn EngineSession>> {
        if self.faults.lock().unwrap().fail_open {
            return Err(WfpError::AccessDenied);
        }
        Ok(Box::new(MemoryEngine {
            state: Arc::clone(&self.state),
            faults: Arc::clone(&self.faults),
            work: None,
        }))
    }
}

pub struct MemoryEngine {
    state: Arc<Mutex<EngineState>>,
    faults: Arc<Mutex<Faults>>,
    /// Working copy while a transaction is active.
    work: Option<EngineState>,
}

impl MemoryEngine {
    fn read<T>(&mut self, f: impl FnOnce(&EngineState) -> T) -> T {
        match &self.work {
            Some(work) => f(work),
            None => f(&self.state.lock().unwrap()),
        }
    }

    fn write<T>(&mut self, f: impl FnOnce(&mut EngineState) -> WfpResult<T>) -> WfpResult<T> {
        match &mut self.work {
            Some(work) => f(work),
            None => f(&mut self.state.lock().unwrap()),
        }
    }
}

impl EngineSession for MemoryEngine {
    fn provider_exists(&mut self, key: Uuid) -> WfpResult<bool> {
        Ok(self.read(|s| s.providers.contains_key(&key)))
    }

    fn add_provider(&mut self, spec: &ProviderSpec) -> WfpResult<()> {
        let key = spec.key;
        let name = spec.name.clone();
        self.write(|s| {
            if s.providers.contains_key(&key) {
                return Err(WfpError::AlreadyExists);
            }
            s.providers.insert(key, ProviderRecord { name });
            Ok(())
        })
    }

    fn delete_provider(&mut self, key: Uuid) -> WfpResult<()> {
        self.write(|s| {
            if !s.providers.contains_key(&key) {
                return Err(WfpError::ProviderNotFound);
            }
            if s.sublayers.values().any(|sl| sl.provider_key == key) {
                return Err(WfpError::InUse);
            }
            s.providers.remove(&key);
            Ok(())
        })
    }

    fn sublayer_exists(&mut self, key: Uuid) -> WfpResult<bool> {
        Ok(self.read(|s| s.sublayers.contains_key(&key)))
    }

    fn add_sublayer(&mut self, spec: &SublayerSpec) -> WfpResult<()> {
        let record = SublayerRecord {
            provider_key: spec.provider_key,
            weight: spec.weight,
            name: spec.name.clone(),
        };
        let key = spec.key;
        self.write(|s| {
            if s.sublayers.contains_key(&key) {
                return Err(WfpError::AlreadyExists);
            }
            if !s.providers.contains_key(&record.provider_key) {
                return Err(WfpError::ProviderNotFound);
            }
            s.sublayers.insert(key, record);
            Ok(())
        })
    }

    fn delete_sublayer(&mut self, key: Uuid) -> WfpResult<()> {
        self.write(|s| {
            if !s.sublayers.contains_key(&key) {
                return Err(WfpError::SublayerNotFound);
            }
            if s.filters.values().any(|f| f.sublayer_key == key) {
                return Err(WfpError::InUse);
            }
            s.sublayers.remove(&key);
            Ok(())
        })
    }

    fn filter_exists(&mut self, key: Uuid) -> WfpResult<bool> {
        Ok(self.read(|s| s.filters.contains_key(&key)))
    }

    fn add_filter(&mut self, spec: &FilterSpec<'_>) -> WfpResult<u64> {
        if self.faults.lock().unwrap().fail_add_filter == Some(spec.filter.key) {
            return Err(WfpError::InvalidParameter);
        }
        let key = spec.filter.key;
        let record = FilterRecord {
            id: 0, // assigned below
            sublayer_key: spec.sublayer_key,
            name: spec.filter.display_name.clone(),
            weight: spec.filter.weight,
            has_app_id: spec.app_id.is_some(),
        };
        self.write(|s| {
            if s.filters.contains_key(&key) {
                return Err(WfpError::AlreadyExists);
            }
            if !s.sublayers.contains_key(&record.sublayer_key) {
                return Err(WfpError::SublayerNotFound);
            }
            s.next_filter_id += 1;
            let id = s.next_filter_id;
            s.filters.insert(key, FilterRecord { id, ..record });
            Ok(id)
        })
    }

    fn delete_filter_by_key(&mut self, key: Uuid) -> WfpResult<()> {
        self.write(|s| {
            s.filters
                .remove(&key)
                .map(|_| ())
                .ok_or(WfpError::FilterNotFound)
        })
    }

    fn delete_filter_by_id(&mut self, id: u64) -> WfpResult<()> {
        self.write(|s| {
            let key = s
                .filters
                .iter()
                .find(|(_, record)| record.id == id)
                .map(|(key, _)| *key)
                .ok_or(WfpError::FilterNotFound)?;
            s.filters.remove(&key);
            Ok(())
        })
    }

    fn enumerate_filters(&mut self, sublayer: Uuid) -> WfpResult<Vec<ObservedFilter>> {
        self.read(|s| {
            let mut all: Vec<_> = s.filters.iter().collect();
            all.sort_by_key(|(_, record)| record.id);
            let mut matching = Vec::new();
            // The real template enumerates everything; sublayer selection is
            // ours, batch by batch.
            for batch in all.chunks(ENUM_BATCH_SIZE) {
                for (key, record) in batch {
                    if record.sublayer_key == sublayer {
                        matching.push(ObservedFilter {
                            key: **key,
                            id: record.id,
                            name: Some(record.name.clone()),
                        });
                    }
                }
            }
            Ok(matching)
        })
    }

    fn app_id_from_path(&mut self, path: &str) -> WfpResult<Vec<u8>> {
        if self.faults.lock().unwrap().untranslatable.contains(path) {
            return Err(WfpError::InvalidParameter);
        }
        let device_form = format!("\\device\\flowgate\\{}", path.to_ascii_lowercase());
        Ok(device_form.into_bytes())
    }

    fn begin_transaction(&mut self) -> WfpResult<()> {
        if self.work.is_some() {
            return Err(WfpError::Status(codes::FWP_E_TXN_IN_PROGRESS));
        }
        self.work = Some(self.state.lock().unwrap().clone());
        Ok(())
    }

    fn commit_transaction(&mut self) -> WfpResult<()> {
        let Some(work) = self.work.take() else {
            return Err(WfpError::Status(codes::FWP_E_NO_TXN_IN_PROGRESS));
        };
        if self.faults.lock().unwrap().fail_commit_once {
            self.faults.lock().unwrap().fail_commit_once = false;
            // The engine aborts the transaction itself on a failed commit.
            return Err(WfpError::SessionAborted);
        }
        *self.state.lock().unwrap() = work;
        Ok(())
    }

    fn abort_transaction(&mut self) -> WfpResult<()> {
        if self.work.take().is_none() {
            return Err(WfpError::Status(codes::FWP_E_NO_TXN_IN_PROGRESS));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_policy::compile::{filter_key, CompiledFilter, Layer};
    use flowgate_policy::Action;

    fn provider_spec() -> ProviderSpec {
        ProviderSpec {
            key: Uuid::from_u128(10),
            name: "prov".into(),
            description: String::new(),
        }
    }

    fn sublayer_spec() -> SublayerSpec {
        SublayerSpec {
            key: Uuid::from_u128(20),
            provider_key: Uuid::from_u128(10),
            weight: 0x8000,
            name: "sub".into(),
            description: String::new(),
        }
    }

    fn compiled(rule_id: &str) -> CompiledFilter {
        CompiledFilter {
            key: filter_key(rule_id, 0),
            rule_id: rule_id.into(),
            display_name: rule_id.into(),
            description: None,
            action: Action::Block,
            layer: Layer::AleAuthConnectV4,
            protocol: 6,
            process_path: None,
            remote_ip: None,
            remote_port: None,
            weight: 1000,
        }
    }

    fn scaffold(backend: &MemoryBackend) -> Box<dyn EngineSession> {
        let mut session = backend.open().unwrap();
        session.add_provider(&provider_spec()).unwrap();
        session.add_sublayer(&sublayer_spec()).unwrap();
        session
    }

    #[test]
    fn duplicate_adds_report_already_exists() {
        let backend = MemoryBackend::new();
        let mut session = scaffold(&backend);
        assert_eq!(
            session.add_provider(&provider_spec()).unwrap_err(),
            WfpError::AlreadyExists
        );
        assert_eq!(
            session.add_sublayer(&sublayer_spec()).unwrap_err(),
            WfpError::AlreadyExists
        );
    }

    #[test]
    fn delete_in_use_is_refused_bottom_up() {
        let backend = MemoryBackend::new();
        let mut session = scaffold(&backend);
        let filter = compiled("r1");
        session
            .add_filter(&FilterSpec {
                filter: &filter,
                provider_key: provider_spec().key,
                sublayer_key: sublayer_spec().key,
                app_id: None,
            })
            .unwrap();
        assert_eq!(
            session.delete_sublayer(sublayer_spec().key).unwrap_err(),
            WfpError::InUse
        );
        assert_eq!(
            session.delete_provider(provider_spec().key).unwrap_err(),
            WfpError::InUse
        );
        session.delete_filter_by_key(filter.key).unwrap();
        session.delete_sublayer(sublayer_spec().key).unwrap();
        session.delete_provider(provider_spec().key).unwrap();
    }

    #[test]
    fn enumeration_filters_by_sublayer() {
        let backend = MemoryBackend::new();
        let mut session = scaffold(&backend);
        let other_sublayer = SublayerSpec {
            key: Uuid::from_u128(21),
            ..sublayer_spec()
        };
        session.add_sublayer(&other_sublayer).unwrap();
        for (rule, sublayer) in [("ours", sublayer_spec().key), ("theirs", other_sublayer.key)] {
            let filter = compiled(rule);
            session
                .add_filter(&FilterSpec {
                    filter: &filter,
                    provider_key: provider_spec().key,
                    sublayer_key: sublayer,
                    app_id: None,
                })
                .unwrap();
        }
        let observed = session.enumerate_filters(sublayer_spec().key).unwrap();
        assert_eq!(observed.len(), 1);
        assert_eq!(observed[0].name.as_deref(), Some("ours"));
    }

    #[test]
    fn commit_failure_discards_the_working_copy() {
        let backend = MemoryBackend::new();
        let mut session = scaffold(&backend);
        let before = backend.fingerprint();
        backend.fail_next_commit();

        session.begin_transaction().unwrap();
        let filter = compiled("doomed");
        session
            .add_filter(&FilterSpec {
                filter: &filter,
                provider_key: provider_spec().key,
                sublayer_key: sublayer_spec().key,
                app_id: None,
            })
            .unwrap();
        assert_eq!(
            session.commit_transaction().unwrap_err(),
            WfpError::SessionAborted
        );
        assert_eq!(backend.fingerprint(), before);
    }

    #[test]
    fn sessions_share_engine_state() {
        let backend = MemoryBackend::new();
        let mut first = scaffold(&backend);
        let filter = compiled("shared");
        first
            .add_filter(&FilterSpec {
                filter: &filter,
                provider_key: provider_spec().key,
                sublayer_key: sublayer_spec().key,
                app_id: None,
            })
            .unwrap();
        drop(first);

        let mut second = backend.open().unwrap();
        assert!(second.filter_exists(filter.key).unwrap());
    }

    #[test]
    fn runtime_ids_are_unique_and_deletable() {
        let backend = MemoryBackend::new();
        let mut session = scaffold(&backend);
        let a = compiled("a");
        let b = compiled("b");
        let id_a = session
            .add_filter(&FilterSpec {
                filter: &a,
                provider_key: provider_spec().key,
                sublayer_key: sublayer_spec().key,
                app_id: None,
            })
            .unwrap();
        let id_b = session
            .add_filter(&FilterSpec {
                filter: &b,
                provider_key: provider_spec().key,
                sublayer_key: sublayer_spec().key,
                app_id: None,
            })
            .unwrap();
        assert_ne!(id_a, id_b);
        session.delete_filter_by_id(id_a).unwrap();
        assert_eq!(
            session.delete_filter_by_id(id_a).unwrap_err(),
            WfpError::FilterNotFound
        );
        assert!(session.filter_exists(b.key).unwrap());
    }

    #[test]
    fn app_id_translation_and_fault() {
        let backend = MemoryBackend::new();
        let mut session = backend.open().unwrap();
        let blob = session.app_id_from_path("C:\\Tools\\Agent.exe").unwrap();
        assert!(String::from_utf8(blob).unwrap().contains("agent.exe"));
        backend.mark_untranslatable("/missing/tool");
        assert_eq!(
            session.app_id_from_path("/missing/tool").unwrap_err(),
            WfpError::InvalidParameter
        );
    }
}
