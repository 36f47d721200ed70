// This module groups the control flow side of the back end: the function tree consumed from
// the front end, its linearization into labels, jumps and nodes together with the region and
// reachability queries built on top of it, and an editable flow whose elements can be
// replaced or inserted without renumbering the rest of the function.

//! Function trees and their linearized control flow.

pub mod graph;
pub mod modifiable;
pub mod tree;

pub use graph::{Flow, FlowElement, Jump, JumpCondition, LabelId, LoopLabels, Region, RegionId, RegionKind};
pub use modifiable::{Index, ModifiableFlow};
pub use tree::{Function, NodeId, NodeKind, Tree, Type, VariableId};
