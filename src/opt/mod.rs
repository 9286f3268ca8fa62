//! Graph optimization passes.
//!
//! - [`cse`]: structural-signature duplicate merging.
//! - [`pattern`]: rule-driven rewriting and constant folding.
//! - [`matchain`]: sparsity-aware matrix-chain reassociation.
//!
//! [`optimize`] runs them in order: deduplicate, rewrite to a fixed point,
//! reassociate chains, then deduplicate once more to collapse anything the
//! later passes rebuilt identically.

pub mod cse;
pub mod matchain;
pub mod pattern;

use log::info;
use thiserror::Error;

use crate::eval::{EvalError, Evaluator};
use crate::graph::graph::ConstructionError;
use crate::graph::node::NodeId;
use crate::graph::op::Opcode;
use crate::graph::Graph;

pub use cse::{merge_duplicates, Signer};
pub use matchain::reorder_chains;
pub use pattern::{fold_constant, Captures, Pattern, RewriteRule, RewriteRuleError, Rewriter};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum OptimizeError {
    #[error(transparent)]
    Construction(#[from] ConstructionError),
    #[error("constant folding failed: {0}")]
    Eval(#[from] EvalError),
}

/// The stock algebraic identities loaded into every default [`Rewriter`].
pub fn default_rules() -> Vec<RewriteRule> {
    use Opcode::*;
    let rules = [
        RewriteRule::new(
            "add-zero-right",
            Pattern::Op(Add, vec![Pattern::Capture("x"), Pattern::Const(0.0)]),
            |_, caps: &Captures| Ok(caps["x"]),
        ),
        RewriteRule::new(
            "add-zero-left",
            Pattern::Op(Add, vec![Pattern::Const(0.0), Pattern::Capture("x")]),
            |_, caps: &Captures| Ok(caps["x"]),
        ),
        RewriteRule::new(
            "mul-one-right",
            Pattern::Op(Mul, vec![Pattern::Capture("x"), Pattern::Const(1.0)]),
            |_, caps: &Captures| Ok(caps["x"]),
        ),
        RewriteRule::new(
            "mul-one-left",
            Pattern::Op(Mul, vec![Pattern::Const(1.0), Pattern::Capture("x")]),
            |_, caps: &Captures| Ok(caps["x"]),
        ),
        RewriteRule::new(
            "mul-zero-right",
            Pattern::Op(Mul, vec![Pattern::Capture("x"), Pattern::Const(0.0)]),
            |g: &Graph, caps: &Captures| Ok(g.zeros_like(caps["x"])),
        ),
        RewriteRule::new(
            "mul-zero-left",
            Pattern::Op(Mul, vec![Pattern::Const(0.0), Pattern::Capture("x")]),
            |g: &Graph, caps: &Captures| Ok(g.zeros_like(caps["x"])),
        ),
        RewriteRule::new(
            "sub-zero",
            Pattern::Op(Sub, vec![Pattern::Capture("x"), Pattern::Const(0.0)]),
            |_, caps: &Captures| Ok(caps["x"]),
        ),
        RewriteRule::new(
            "sub-self",
            Pattern::Op(Sub, vec![Pattern::Capture("x"), Pattern::Capture("x")]),
            |g: &Graph, caps: &Captures| Ok(g.zeros_like(caps["x"])),
        ),
        RewriteRule::new(
            "div-one",
            Pattern::Op(Div, vec![Pattern::Capture("x"), Pattern::Const(1.0)]),
            |_, caps: &Captures| Ok(caps["x"]),
        ),
        RewriteRule::new(
            "double-neg",
            Pattern::Op(Neg, vec![Pattern::Op(Neg, vec![Pattern::Capture("x")])]),
            |_, caps: &Captures| Ok(caps["x"]),
        ),
        RewriteRule::new(
            "log-exp",
            Pattern::Op(Log, vec![Pattern::Op(Exp, vec![Pattern::Capture("x")])]),
            |_, caps: &Captures| Ok(caps["x"]),
        ),
        RewriteRule::new(
            "pow-one",
            Pattern::Op(Pow, vec![Pattern::Capture("x"), Pattern::Const(1.0)]),
            |_, caps: &Captures| Ok(caps["x"]),
        ),
        RewriteRule::new(
            "pow-zero",
            Pattern::Op(Pow, vec![Pattern::Capture("x"), Pattern::Const(0.0)]),
            |g: &Graph, caps: &Captures| Ok(g.ones_like(caps["x"])),
        ),
        RewriteRule::new(
            "mul-self-square",
            Pattern::Op(Mul, vec![Pattern::Capture("x"), Pattern::Capture("x")]),
            |g: &Graph, caps: &Captures| Ok(g.unary(Square, caps["x"])?),
        ),
    ];
    // the stock patterns are well-formed by construction
    rules
        .into_iter()
        .map(|r| r.unwrap_or_else(|e| unreachable!("stock rule rejected: {e}")))
        .collect()
}

/// Full optimization pipeline over the subgraphs rooted at `roots`.
///
/// Returns the surviving root handles, remapped through every replacement
/// the passes made. The caller must hold exclusive access to the graph for
/// the duration of the call.
pub fn optimize(
    graph: &Graph,
    roots: &[NodeId],
    rules: Vec<RewriteRule>,
    evaluator: &mut dyn Evaluator,
) -> Result<Vec<NodeId>, OptimizeError> {
    let mut roots = roots.to_vec();
    let moved = merge_duplicates(graph, &roots);
    remap(&mut roots, &moved);

    let rewriter = Rewriter::new(rules);
    roots = rewriter.rewrite(graph, &roots, evaluator)?;

    let moved = reorder_chains(graph, &roots, evaluator)?;
    remap(&mut roots, &moved);

    let moved = merge_duplicates(graph, &roots);
    remap(&mut roots, &moved);
    info!("optimized {} root(s)", roots.len());
    Ok(roots)
}

fn remap(roots: &mut [NodeId], moved: &rustc_hash::FxHashMap<NodeId, NodeId>) {
    for root in roots.iter_mut() {
        *root = Graph::resolve(moved, *root);
    }
}
