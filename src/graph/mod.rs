//! The tensor-expression graph IR.
//!
//! - [`op`]: the opcode enumeration and its classification tables.
//! - [`node`]: leaf/functor node storage addressed by [`NodeId`] handles.
//! - [`shaper`]: per-opcode shape/type inference run once at construction.
//! - [`graph`]: the arena itself with validated constructors.
//! - [`traversal`]: orderings, height statistics, and the parent index.

pub mod graph;
pub mod node;
pub mod op;
pub mod shaper;
pub mod traversal;

pub use graph::{graph_eq, ConstructionError, Graph};
pub use node::{attr_keys, Attr, AttrMap, NodeData, NodeId, Usage};
pub use op::{Arity, Opcode};
pub use traversal::{postorder, reachable, GraphStat, ParentIndex};
