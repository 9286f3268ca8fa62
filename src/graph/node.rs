//! Node storage for the expression arena.
//!
//! Nodes are addressed by stable [`NodeId`] handles into a [`Graph`]'s arena;
//! parents store child handles, never pointers. A node is either a leaf
//! (owns raw data) or a functor (opcode + ordered argument handles + typed
//! attribute map). Functor shape and type are frozen at construction.
//!
//! [`Graph`]: crate::graph::Graph

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::dtype::DType;
use crate::graph::op::Opcode;
use crate::shape::Shape;

/// A stable handle for a node within a `Graph` arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// How a leaf's data behaves between evaluations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Usage {
    /// Mutable state; identity-only equality, never content-deduplicated.
    Variable,
    /// Immutable content; eligible for content-based deduplication and
    /// constant folding.
    Constant,
    /// Declared input with no data yet; identity-only equality.
    Placeholder,
}

/// A typed attribute value attached to a functor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Attr {
    /// A single rank position (e.g. concat axis).
    Rank(usize),
    /// An ordered list of rank positions (e.g. permutation order).
    Ranks(Vec<usize>),
    /// An unordered set of rank positions (e.g. reduced dimensions).
    RankSet(BTreeSet<usize>),
    /// Per-dimension sizes or factors (e.g. broadcast factors, strides).
    Dims(Vec<usize>),
    /// Per-dimension pairs (e.g. slice offset/extent, pad before/after).
    DimPairs(Vec<(usize, usize)>),
    /// Rank pairs (e.g. contraction dimension pairs).
    RankPairs(Vec<(usize, usize)>),
}

/// Attribute map keyed by attribute name. `BTreeMap` keeps serialization for
/// structural signatures deterministic.
pub type AttrMap = BTreeMap<&'static str, Attr>;

pub mod attr_keys {
    pub const AXIS: &str = "axis";
    pub const ORDER: &str = "order";
    pub const RDIMS: &str = "rdims";
    pub const FACTORS: &str = "factors";
    pub const SHAPE: &str = "shape";
    pub const EXTENTS: &str = "extents";
    pub const PADDINGS: &str = "paddings";
    pub const INCRS: &str = "incrs";
    pub const PAIRS: &str = "pairs";
}

/// The data stored for a single node in the arena.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeData {
    Leaf {
        shape: Shape,
        dtype: DType,
        usage: Usage,
        /// Raw little-endian element bytes; empty for placeholders.
        data: Vec<u8>,
    },
    Func {
        opcode: Opcode,
        /// Ordered argument handles. Order is semantically significant for
        /// non-commutative opcodes.
        args: Vec<NodeId>,
        attrs: AttrMap,
        shape: Shape,
        dtype: DType,
    },
}

impl NodeData {
    pub fn shape(&self) -> &Shape {
        match self {
            NodeData::Leaf { shape, .. } => shape,
            NodeData::Func { shape, .. } => shape,
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            NodeData::Leaf { dtype, .. } => *dtype,
            NodeData::Func { dtype, .. } => *dtype,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, NodeData::Leaf { .. })
    }

    /// True for leaves whose content never changes between evaluations.
    pub fn is_constant(&self) -> bool {
        matches!(
            self,
            NodeData::Leaf {
                usage: Usage::Constant,
                ..
            }
        )
    }
}
