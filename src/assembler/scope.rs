// This module defines the scopes the assembler keeps while building a function. Every branch
// chain and loop of the flow opens one Scope nested in the scope that was current at its
// start. A scope maps variables to the Results holding their values: `entry` holds the
// anchors bound when the region was entered, `bindings` the values assigned since the last
// merge point. The snapshot records where every active variable lived when the region was
// entered; merges move values back there and region labels restore it.

//! Variable scopes and merge point snapshots.

use crate::assembler::instruction::ScopeId;
use crate::core::results::ResultId;
use crate::core::value::Handle;
use crate::flow::tree::VariableId;
use hashbrown::HashMap;

#[derive(Debug, Clone)]
pub struct Scope {
    pub id: ScopeId,
    pub outer: Option<ScopeId>,
    /// Anchors of the active variables.
    pub entry: HashMap<VariableId, ResultId>,
    pub bindings: HashMap<VariableId, ResultId>,
    /// Variables whose values must agree at every merge point, in a stable order.
    pub actives: Vec<VariableId>,
    pub snapshot: Vec<(VariableId, ResultId, Handle)>,
}

impl Scope {
    pub fn new(id: ScopeId, outer: Option<ScopeId>) -> Self {
        Self {
            id,
            outer,
            entry: HashMap::new(),
            bindings: HashMap::new(),
            actives: Vec::new(),
            snapshot: Vec::new(),
        }
    }

    /// Value of a variable in this scope only.
    pub fn local(&self, variable: VariableId) -> Option<ResultId> {
        self.bindings
            .get(&variable)
            .or_else(|| self.entry.get(&variable))
            .copied()
    }

    /// Snapshot location of an active variable.
    pub fn snapshot_of(&self, variable: VariableId) -> Option<(ResultId, &Handle)> {
        self.snapshot
            .iter()
            .find(|(owner, _, _)| *owner == variable)
            .map(|(_, anchor, handle)| (*anchor, handle))
    }
}
