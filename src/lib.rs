//! Tangent: symbolic differentiation and graph rewriting over tensor
//! expression DAGs.
//!
//! Tangent builds immutable tensor expressions in an arena [`graph::Graph`],
//! derives reverse-mode gradients as new subgraphs, and optimizes the result
//! through structural-hash deduplication, pattern rewriting with constant
//! folding, and sparsity-aware matrix-chain reassociation.
//!
//! # Architecture
//!
//! - **shape**: fixed-cap dimension vectors and flat-index math
//! - **dtype**: element-type tags for raw leaf buffers
//! - **graph**: the arena IR, per-opcode shape inference, traversal
//! - **grad**: per-opcode gradient rules and the derive driver
//! - **opt**: CSE, the rewrite engine, and the chain optimizer
//! - **eval**: the evaluator contract plus a reference interpreter
//!
//! # Example
//!
//! ```
//! use tangent::prelude::*;
//!
//! let g = Graph::new();
//! let x = g.variable(Shape::new(vec![3, 2])?, DType::F64, &[1.0; 6])?;
//! let y = g.unary(Opcode::Square, x)?;
//! let r = g.func(Opcode::Add, vec![y, x], AttrMap::new())?;
//!
//! let dx = derive(&g, r, x)?;
//! let mut interp = Interpreter::default();
//! let roots = optimize(&g, &[dx], default_rules(), &mut interp)?;
//! assert_eq!(g.shape(roots[0]).dims(), &[3, 2]);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod context;
pub mod dtype;
pub mod eval;
pub mod grad;
pub mod graph;
pub mod opt;
pub mod shape;

pub use context::Context;
pub use dtype::DType;
pub use eval::{EvalError, Evaluator, Interpreter};
pub use grad::{derive, local_derivative};
pub use graph::{ConstructionError, Graph, NodeId, Opcode};
pub use opt::{default_rules, optimize, OptimizeError};
pub use shape::{Shape, ShapeError, RANK_CAP};

/// Commonly used types and entry points.
pub mod prelude {
    pub use crate::context::Context;
    pub use crate::dtype::DType;
    pub use crate::eval::{Evaluator, Interpreter};
    pub use crate::grad::derive;
    pub use crate::graph::{attr_keys, Attr, AttrMap, Graph, NodeId, Opcode, Usage};
    pub use crate::opt::{default_rules, optimize, Pattern, RewriteRule, Rewriter};
    pub use crate::shape::{coordinate, index, Shape};
}
