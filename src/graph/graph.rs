//! The expression arena with validated constructors.
//!
//! A `Graph` owns every node of one or more expression DAGs in a single
//! append-only vector; [`NodeId`] handles index into it and stay valid for
//! the graph's lifetime. Interior mutability (`RefCell`) lets construction
//! and optimization borrow the graph immutably while appending or rewiring
//! nodes. Optimizers never remove slots, they only repoint argument handles,
//! so orphaned nodes remain as unreferenced slots.

use std::cell::{Ref, RefCell};

use crate::dtype::DType;
use crate::graph::node::{AttrMap, NodeData, NodeId, Usage};
use crate::graph::op::Opcode;
use crate::graph::shaper;
use crate::shape::{Shape, ShapeError};
use rustc_hash::FxHashMap;
use thiserror::Error;

/// Why a node could not be built. Every constructor validates eagerly so an
/// invalid functor never enters the arena.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConstructionError {
    #[error("{opcode} does not accept {got} argument(s)")]
    Arity { opcode: Opcode, got: usize },
    #[error("{opcode} argument types disagree: {lhs} vs {rhs}")]
    TypeMismatch {
        opcode: Opcode,
        lhs: DType,
        rhs: DType,
    },
    #[error("{opcode} argument shapes disagree: {lhs} vs {rhs}")]
    ShapeMismatch {
        opcode: Opcode,
        lhs: Shape,
        rhs: Shape,
    },
    #[error("{opcode} requires attribute \"{key}\"")]
    MissingAttr { opcode: Opcode, key: &'static str },
    #[error("{opcode} attribute \"{key}\": {reason}")]
    BadAttr {
        opcode: Opcode,
        key: &'static str,
        reason: String,
    },
    #[error("{opcode} element count mismatch: expected {expected}, got {got}")]
    ElemMismatch {
        opcode: Opcode,
        expected: usize,
        got: usize,
    },
    #[error("leaf data holds {got} element(s), shape requires {expected}")]
    DataLength { expected: usize, got: usize },
    #[error(transparent)]
    Shape(#[from] ShapeError),
}

/// Owns all nodes of an expression DAG.
#[derive(Debug, Default)]
pub struct Graph {
    /// Data for every node, indexed by `NodeId`. Append-only.
    pub nodes: RefCell<Vec<NodeData>>,
}

impl Graph {
    pub fn new() -> Self {
        Graph::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.borrow().is_empty()
    }

    /// Borrows a node's data.
    ///
    /// # Panics
    ///
    /// Panics when `id` was not issued by this graph.
    pub fn node(&self, id: NodeId) -> Ref<'_, NodeData> {
        Ref::map(self.nodes.borrow(), |nodes| &nodes[id.0])
    }

    pub fn shape(&self, id: NodeId) -> Shape {
        self.node(id).shape().clone()
    }

    pub fn dtype(&self, id: NodeId) -> DType {
        self.node(id).dtype()
    }

    pub fn opcode(&self, id: NodeId) -> Option<Opcode> {
        match &*self.node(id) {
            NodeData::Func { opcode, .. } => Some(*opcode),
            NodeData::Leaf { .. } => None,
        }
    }

    pub fn args(&self, id: NodeId) -> Vec<NodeId> {
        match &*self.node(id) {
            NodeData::Func { args, .. } => args.clone(),
            NodeData::Leaf { .. } => vec![],
        }
    }

    pub fn attrs(&self, id: NodeId) -> AttrMap {
        match &*self.node(id) {
            NodeData::Func { attrs, .. } => attrs.clone(),
            NodeData::Leaf { .. } => AttrMap::new(),
        }
    }

    /// Decoded element values of a leaf; `None` for functors and for
    /// placeholders that carry no data yet.
    pub fn leaf_values(&self, id: NodeId) -> Option<Vec<f64>> {
        match &*self.node(id) {
            NodeData::Leaf { dtype, data, .. } if !data.is_empty() => {
                dtype.decode(data).ok()
            }
            _ => None,
        }
    }

    fn push(&self, data: NodeData) -> NodeId {
        let mut nodes = self.nodes.borrow_mut();
        let id = NodeId(nodes.len());
        nodes.push(data);
        id
    }

    fn leaf(
        &self,
        shape: Shape,
        dtype: DType,
        usage: Usage,
        values: &[f64],
    ) -> Result<NodeId, ConstructionError> {
        if values.len() != shape.n_elems() {
            return Err(ConstructionError::DataLength {
                expected: shape.n_elems(),
                got: values.len(),
            });
        }
        let data = dtype.encode(values);
        Ok(self.push(NodeData::Leaf {
            shape,
            dtype,
            usage,
            data,
        }))
    }

    /// A mutable leaf. Variables are never content-deduplicated or folded.
    pub fn variable(
        &self,
        shape: Shape,
        dtype: DType,
        values: &[f64],
    ) -> Result<NodeId, ConstructionError> {
        self.leaf(shape, dtype, Usage::Variable, values)
    }

    /// An immutable leaf, eligible for deduplication and folding.
    pub fn constant(
        &self,
        shape: Shape,
        dtype: DType,
        values: &[f64],
    ) -> Result<NodeId, ConstructionError> {
        self.leaf(shape, dtype, Usage::Constant, values)
    }

    /// A declared input carrying no data until bound at evaluation.
    pub fn placeholder(&self, shape: Shape, dtype: DType) -> NodeId {
        self.push(NodeData::Leaf {
            shape,
            dtype,
            usage: Usage::Placeholder,
            data: vec![],
        })
    }

    /// A rank-0 constant.
    pub fn scalar(&self, dtype: DType, value: f64) -> NodeId {
        // scalar construction cannot fail: one element, rank 0
        self.leaf(Shape::scalar(), dtype, Usage::Constant, &[value])
            .unwrap_or_else(|e| unreachable!("scalar leaf rejected: {e}"))
    }

    /// A constant filled with `value`, matching `like`'s shape and type.
    pub fn constant_like(&self, like: NodeId, value: f64) -> NodeId {
        let (shape, dtype) = {
            let node = self.node(like);
            (node.shape().clone(), node.dtype())
        };
        let values = vec![value; shape.n_elems()];
        self.leaf(shape, dtype, Usage::Constant, &values)
            .unwrap_or_else(|e| unreachable!("filled leaf rejected: {e}"))
    }

    pub fn zeros_like(&self, like: NodeId) -> NodeId {
        self.constant_like(like, 0.0)
    }

    pub fn ones_like(&self, like: NodeId) -> NodeId {
        self.constant_like(like, 1.0)
    }

    /// Builds a functor node. Validates arity against the opcode's class,
    /// then runs shape/type inference; the inferred shape and type are frozen
    /// on the node.
    pub fn func(
        &self,
        opcode: Opcode,
        args: Vec<NodeId>,
        attrs: AttrMap,
    ) -> Result<NodeId, ConstructionError> {
        if !opcode.arity().accepts(args.len()) {
            return Err(ConstructionError::Arity {
                opcode,
                got: args.len(),
            });
        }
        let (shape, dtype) = {
            let nodes = self.nodes.borrow();
            let sig: Vec<(&Shape, DType)> = args
                .iter()
                .map(|id| (nodes[id.0].shape(), nodes[id.0].dtype()))
                .collect();
            shaper::infer(opcode, &sig, &attrs)?
        };
        Ok(self.push(NodeData::Func {
            opcode,
            args,
            attrs,
            shape,
            dtype,
        }))
    }

    /// Unary functor without attributes.
    pub fn unary(&self, opcode: Opcode, arg: NodeId) -> Result<NodeId, ConstructionError> {
        self.func(opcode, vec![arg], AttrMap::new())
    }

    /// Binary functor without attributes.
    pub fn binary(
        &self,
        opcode: Opcode,
        lhs: NodeId,
        rhs: NodeId,
    ) -> Result<NodeId, ConstructionError> {
        self.func(opcode, vec![lhs, rhs], AttrMap::new())
    }

    /// Repoints every functor argument according to `moved`. The rewrite is
    /// global: all parents of a moved node switch to its replacement in one
    /// pass, leaving the old node as an orphaned slot.
    pub fn rewire(&self, moved: &FxHashMap<NodeId, NodeId>) {
        if moved.is_empty() {
            return;
        }
        let mut nodes = self.nodes.borrow_mut();
        for node in nodes.iter_mut() {
            if let NodeData::Func { args, .. } = node {
                for arg in args.iter_mut() {
                    if let Some(&to) = moved.get(arg) {
                        *arg = to;
                    }
                }
            }
        }
    }

    /// Resolves a handle through a replacement map, following chains.
    pub fn resolve(moved: &FxHashMap<NodeId, NodeId>, mut id: NodeId) -> NodeId {
        while let Some(&to) = moved.get(&id) {
            if to == id {
                break;
            }
            id = to;
        }
        id
    }
}

/// Structural equality of two subgraphs within one arena.
///
/// Functors compare by opcode, attributes, and recursively by arguments.
/// Constant leaves compare by shape, type, and content; variables and
/// placeholders compare by identity only.
pub fn graph_eq(graph: &Graph, a: NodeId, b: NodeId) -> bool {
    if a == b {
        return true;
    }
    let nodes = graph.nodes.borrow();
    eq_rec(&nodes, a, b)
}

fn eq_rec(nodes: &[NodeData], a: NodeId, b: NodeId) -> bool {
    if a == b {
        return true;
    }
    match (&nodes[a.0], &nodes[b.0]) {
        (
            NodeData::Leaf {
                shape: sa,
                dtype: da,
                usage: Usage::Constant,
                data: va,
            },
            NodeData::Leaf {
                shape: sb,
                dtype: db,
                usage: Usage::Constant,
                data: vb,
            },
        ) => sa == sb && da == db && va == vb,
        (
            NodeData::Func {
                opcode: oa,
                args: aa,
                attrs: ta,
                ..
            },
            NodeData::Func {
                opcode: ob,
                args: ab,
                attrs: tb,
                ..
            },
        ) => {
            oa == ob
                && ta == tb
                && aa.len() == ab.len()
                && aa.iter().zip(ab).all(|(&x, &y)| eq_rec(nodes, x, y))
        }
        _ => false,
    }
}
