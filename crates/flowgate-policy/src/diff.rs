//! Desired-versus-observed filter set comparison.
//!
//! Pure and key-based: a filter is "the same" iff its key matches. Keys are
//! content-derived (see [`crate::compile::filter_key`]), so a changed rule
//! surfaces as remove-old + add-new.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::compile::CompiledFilter;

/// A filter as reported by engine enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservedFilter {
    pub key: Uuid,
    /// Opaque runtime id assigned by the engine at add time.
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FilterDiff {
    pub to_add: Vec<CompiledFilter>,
    pub to_remove: Vec<ObservedFilter>,
    pub unchanged: usize,
}

impl FilterDiff {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

pub fn diff(desired: &[CompiledFilter], observed: &[ObservedFilter]) -> FilterDiff {
    let desired_keys: HashSet<Uuid> = desired.iter().map(|f| f.key).collect();
    let observed_keys: HashSet<Uuid> = observed.iter().map(|f| f.key).collect();

    let to_add = desired
        .iter()
        .filter(|f| !observed_keys.contains(&f.key))
        .cloned()
        .collect();
    let to_remove = observed
        .iter()
        .filter(|f| !desired_keys.contains(&f.key))
        .cloned()
        .collect();
    let unchanged = desired_keys.intersection(&observed_keys).count();

    FilterDiff {
        to_add,
        to_remove,
        unchanged,
    }
}
