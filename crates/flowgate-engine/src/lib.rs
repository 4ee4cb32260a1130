//! Engine orchestration: the verbs the control surface exposes, each scoped
//! to one engine session and (where it mutates) one transaction.

mod orchestrator;

pub use orchestrator::{ApplyStats, BootstrapOutcome, Orchestrator};
