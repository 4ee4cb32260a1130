//! The Flowgate service: a serial engine worker fed by the IPC control
//! surface and the hot-reload watcher, with audit/LKG/history persistence
//! around every state change.

pub mod authz;
pub mod config;
pub mod ipc;
pub mod ratelimit;
pub mod state;
pub mod watcher;
pub mod worker;

pub use config::ServiceConfig;
pub use state::ServiceState;
