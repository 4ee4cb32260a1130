//! Shared foundations for the Flowgate control plane: the closed error
//! taxonomy, stable identifiers and limits, and the IPC wire envelope.

pub mod consts;
pub mod error;
pub mod framing;
pub mod proto;

pub use error::{Error, ErrorKind, PolicyIssue, Result};
