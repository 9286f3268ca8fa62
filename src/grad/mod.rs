//! Reverse-mode differentiation over the expression arena.
//!
//! [`derive`] builds a brand-new gradient subgraph; nothing in the forward
//! graph is mutated. Propagation walks the forward DAG from the root toward
//! the target, applying the per-opcode rules in [`rules`] and summing
//! multi-path contributions with a single n-ary ADD so the gradient
//! expression stays shallow for later optimization.

pub mod rules;

use log::debug;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::graph::graph::ConstructionError;
use crate::graph::node::NodeId;
use crate::graph::op::Opcode;
use crate::graph::traversal::postorder;
use crate::graph::{AttrMap, Graph};

pub use rules::local_derivative;

/// Gradient of `root`'s output with respect to `target`.
///
/// Returns a ones tensor when `root == target` and a zeros tensor shaped
/// like `target` when `target` is unreachable from `root`.
///
/// # Panics
///
/// Panics when a gradient path runs through a non-differentiable functor
/// (comparisons, argmax, random draws, assignments). Callers must arrange
/// for such opcodes to sit off every root-to-target path.
pub fn derive(g: &Graph, root: NodeId, target: NodeId) -> Result<NodeId, ConstructionError> {
    if root == target {
        return Ok(g.ones_like(root));
    }
    let order = postorder(g, &[root]);

    // nodes from which the target is reachable
    let mut pathed = FxHashSet::default();
    for &id in &order {
        if id == target || g.args(id).iter().any(|a| pathed.contains(a)) {
            pathed.insert(id);
        }
    }
    if !pathed.contains(&root) {
        debug!("{target} unreachable from {root}, gradient is zero");
        return Ok(g.zeros_like(target));
    }

    let mut grads: FxHashMap<NodeId, Vec<NodeId>> = FxHashMap::default();
    grads.insert(root, vec![g.ones_like(root)]);

    // parents before children
    for &id in order.iter().rev() {
        if !pathed.contains(&id) || id == target {
            continue;
        }
        let contributions = match grads.remove(&id) {
            Some(c) => c,
            None => continue,
        };
        let sg = accumulate(g, contributions)?;
        for (i, arg) in g.args(id).into_iter().enumerate() {
            if pathed.contains(&arg) {
                let local = local_derivative(g, id, sg, i)?;
                grads.entry(arg).or_default().push(local);
            }
        }
    }

    let contributions = grads.remove(&target).unwrap_or_default();
    debug!(
        "gradient of {root} wrt {target}: {} contribution(s)",
        contributions.len()
    );
    accumulate(g, contributions)
}

/// Sums multi-path contributions with one flat n-ary ADD.
fn accumulate(g: &Graph, mut contributions: Vec<NodeId>) -> Result<NodeId, ConstructionError> {
    match contributions.len() {
        0 => unreachable!("accumulation reached with no contributions"),
        1 => Ok(contributions.remove(0)),
        _ => g.func(Opcode::Add, contributions, AttrMap::new()),
    }
}
