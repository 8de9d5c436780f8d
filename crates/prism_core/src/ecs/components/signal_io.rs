// signal_io.rs - Staging-side signal components
//
// Live signals are stored in the Signals arena. Staging entities carry their
// authored signal values and bindings in these components; scene flattening
// converts them into arena writes.

use crate::refs::{EntityScope, ReferenceManager};
use crate::signals::SignalExpression;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Mutable signal values by name. Used for staging entities only.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalOutput {
    pub signals: BTreeMap<String, f64>,
}

/// Expression-bound signals by name. Used for staging entities only.
///
/// If a signal appears in both SignalOutput and SignalBindings, the output
/// value wins.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalBindings {
    pub bindings: BTreeMap<String, SignalExpression>,
}

impl SignalBindings {
    pub(crate) fn set_scope(&mut self, scope: &EntityScope, refs: &ReferenceManager) {
        for expr in self.bindings.values_mut() {
            expr.set_scope(scope, refs);
        }
    }
}
