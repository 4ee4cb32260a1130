//! The IPC control surface: length-prefixed JSON over a local endpoint.

mod handlers;
pub mod server;
