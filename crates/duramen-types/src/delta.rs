//! Deterministic state deltas.
//!
//! A `StateDelta` records the transformation from one state's variables to
//! the next as a set of add/replace/remove entries, canonically ordered by
//! key. Applying the sequence of deltas recorded in `step_completed` events
//! to the initial state reconstructs any later state, which is what recovery
//! and replay rely on.

use serde::{Deserialize, Serialize};

use crate::state::Variables;

/// A single entry in a state delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DeltaOp {
    /// Key absent in the old variables, present in the new.
    Add {
        key: String,
        value: serde_json::Value,
    },
    /// Key present in both with a different value.
    Replace {
        key: String,
        value: serde_json::Value,
    },
    /// Key present in the old variables, absent in the new.
    Remove { key: String },
}

impl DeltaOp {
    /// The variable key this entry touches.
    pub fn key(&self) -> &str {
        match self {
            DeltaOp::Add { key, .. } | DeltaOp::Replace { key, .. } | DeltaOp::Remove { key } => {
                key
            }
        }
    }
}

/// An ordered set of delta entries, at most one per key, sorted by key.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateDelta(pub Vec<DeltaOp>);

impl StateDelta {
    /// Compute the delta transforming `old` into `new`.
    ///
    /// Entries come out sorted by key, so two computations over the same
    /// pair of maps produce byte-identical encodings.
    pub fn compute(old: &Variables, new: &Variables) -> Self {
        let mut keys: Vec<&String> = old.keys().chain(new.keys()).collect();
        keys.sort();
        keys.dedup();

        let mut ops = Vec::new();
        for key in keys {
            match (old.get(key), new.get(key)) {
                (None, Some(value)) => ops.push(DeltaOp::Add {
                    key: key.clone(),
                    value: value.clone(),
                }),
                (Some(before), Some(after)) if before != after => ops.push(DeltaOp::Replace {
                    key: key.clone(),
                    value: after.clone(),
                }),
                (Some(_), None) => ops.push(DeltaOp::Remove { key: key.clone() }),
                _ => {}
            }
        }
        Self(ops)
    }

    /// Apply this delta to a variable map in place.
    pub fn apply(&self, vars: &mut Variables) {
        for op in &self.0 {
            match op {
                DeltaOp::Add { key, value } | DeltaOp::Replace { key, value } => {
                    vars.insert(key.clone(), value.clone());
                }
                DeltaOp::Remove { key } => {
                    vars.remove(key);
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}
