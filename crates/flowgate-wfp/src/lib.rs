//! Thin, testable interop over the platform filtering engine.
//!
//! The orchestrator only ever talks to [`EngineSession`]; backings are the
//! in-memory [`memory::MemoryBackend`] (tests, dry runs) and, on the
//! reference host with the `platform` feature, the real management API.
//! Sessions, enumeration and transactions are scoped acquisitions: every
//! exit path releases them.

pub mod error;
pub mod memory;
pub mod txn;

#[cfg(all(windows, feature = "platform"))]
pub mod platform;

use uuid::Uuid;

pub use error::WfpError;
pub use txn::Transaction;

use flowgate_policy::{CompiledFilter, ObservedFilter};

pub type WfpResult<T> = Result<T, WfpError>;

#[derive(Debug, Clone)]
pub struct ProviderSpec {
    pub key: Uuid,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct SublayerSpec {
    pub key: Uuid,
    pub provider_key: Uuid,
    pub weight: u16,
    pub name: String,
    pub description: String,
}

/// Everything the engine needs to pin one filter.
#[derive(Debug, Clone)]
pub struct FilterSpec<'a> {
    pub filter: &'a CompiledFilter,
    pub provider_key: Uuid,
    pub sublayer_key: Uuid,
    /// Device-form process blob, already translated. `None` installs the
    /// filter without a process condition.
    pub app_id: Option<Vec<u8>>,
}

/// Opens engine sessions. Shared by the worker and by tests.
pub trait EngineBackend: Send + Sync {
    fn open(&self) -> WfpResult<Box<dyn EngineSession>>;
}

/// One open management session. At most one transaction may be active per
/// session; enumeration is independent of transactions.
pub trait EngineSession: Send {
    fn provider_exists(&mut self, key: Uuid) -> WfpResult<bool>;
    fn add_provider(&mut self, spec: &ProviderSpec) -> WfpResult<()>;
    fn delete_provider(&mut self, key: Uuid) -> WfpResult<()>;

    fn sublayer_exists(&mut self, key: Uuid) -> WfpResult<bool>;
    fn add_sublayer(&mut self, spec: &SublayerSpec) -> WfpResult<()>;
    fn delete_sublayer(&mut self, key: Uuid) -> WfpResult<()>;

    fn filter_exists(&mut self, key: Uuid) -> WfpResult<bool>;
    /// Returns the runtime id the engine assigned.
    fn add_filter(&mut self, spec: &FilterSpec<'_>) -> WfpResult<u64>;
    fn delete_filter_by_key(&mut self, key: Uuid) -> WfpResult<()>;
    fn delete_filter_by_id(&mut self, id: u64) -> WfpResult<()>;

    /// All filters pinned in the given sublayer. The platform enumeration
    /// template cannot select by sublayer, so backings filter client-side,
    /// fetching batches of [`flowgate_common::consts::ENUM_BATCH_SIZE`].
    fn enumerate_filters(&mut self, sublayer: Uuid) -> WfpResult<Vec<ObservedFilter>>;

    /// Translates a filesystem path into the engine's canonical device-form
    /// process blob.
    fn app_id_from_path(&mut self, path: &str) -> WfpResult<Vec<u8>>;

    fn begin_transaction(&mut self) -> WfpResult<()>;
    fn commit_transaction(&mut self) -> WfpResult<()>;
    fn abort_transaction(&mut self) -> WfpResult<()>;
}
