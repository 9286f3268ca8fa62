//! Sparsity-aware matrix-chain reassociation.
//!
//! Finds maximal chains of contiguous 2-D MATMUL functors, pre-folds
//! adjacent immutable-constant links, then solves the classic interval DP
//! with a cost scaled by exact rational densities. A matmul consumed by more
//! than one parent is a forced chain break: it stays materialized and acts
//! as an opaque link for every consumer.

use log::debug;
use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::{One, Zero};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::eval::Evaluator;
use crate::graph::node::{NodeData, NodeId};
use crate::graph::op::Opcode;
use crate::graph::traversal::{postorder, ParentIndex};
use crate::graph::Graph;
use crate::opt::OptimizeError;

/// Reassociates every eligible matmul chain reachable from `roots` and
/// rewires consumers onto the cheapest association. Chains shorter than 3
/// links are left alone unless constant pre-folding shrank them.
///
/// Returns the replacement map for remapping held handles.
pub fn reorder_chains(
    graph: &Graph,
    roots: &[NodeId],
    evaluator: &mut dyn Evaluator,
) -> Result<FxHashMap<NodeId, NodeId>, OptimizeError> {
    let parents = ParentIndex::new(graph, roots);
    let rootset: FxHashSet<NodeId> = roots.iter().copied().collect();
    let mut moved: FxHashMap<NodeId, NodeId> = FxHashMap::default();

    // children first, so a shared sub-chain is rebuilt before its consumers
    for id in postorder(graph, roots) {
        if !is_chain_matmul(graph, id) {
            continue;
        }
        if absorbable(graph, id, &parents, &rootset) {
            continue;
        }
        let mut links = Vec::new();
        flatten(graph, id, &parents, &rootset, &mut links);
        let links: Vec<NodeId> = links
            .into_iter()
            .map(|l| Graph::resolve(&moved, l))
            .collect();
        let n_before = links.len();
        let links = fold_constant_links(graph, links, evaluator)?;
        if links.len() < 3 {
            // too short to reassociate; rebuild only if folding shrank it
            if links.len() < n_before {
                let replacement = rebuild_left(graph, &links)?;
                moved.insert(id, replacement);
            }
            continue;
        }
        let dims = chain_dims(graph, &links);
        let density: Vec<BigRational> = links.iter().map(|&l| link_density(graph, l)).collect();
        let (splits, cost) = optimal_split(&dims, &density);
        debug!(
            "reordering {}-link chain at {id}, estimated cost {cost}",
            links.len()
        );
        let replacement = rechain(graph, &links, &splits, 0, links.len() - 1)?;
        if replacement != id {
            moved.insert(id, replacement);
        }
    }
    if !moved.is_empty() {
        graph.rewire(&moved);
    }
    Ok(moved)
}

/// A matmul over plain 2-D operands, with no batch block.
fn is_chain_matmul(graph: &Graph, id: NodeId) -> bool {
    if graph.opcode(id) != Some(Opcode::Matmul) {
        return false;
    }
    graph.shape(id).rank() <= 2
        && graph
            .args(id)
            .iter()
            .all(|&a| graph.shape(a).rank() <= 2)
}

/// Whether a matmul disappears into its sole consumer's chain. Multi-parent
/// nodes and held roots must stay materialized.
fn absorbable(
    graph: &Graph,
    id: NodeId,
    parents: &ParentIndex,
    rootset: &FxHashSet<NodeId>,
) -> bool {
    if rootset.contains(&id) || parents.parent_count(id) != 1 {
        return false;
    }
    is_chain_matmul(graph, parents.parents(id)[0])
}

fn flatten(
    graph: &Graph,
    id: NodeId,
    parents: &ParentIndex,
    rootset: &FxHashSet<NodeId>,
    out: &mut Vec<NodeId>,
) {
    for arg in graph.args(id) {
        if is_chain_matmul(graph, arg) && absorbable(graph, arg, parents, rootset) {
            flatten(graph, arg, parents, rootset, out);
        } else {
            out.push(arg);
        }
    }
}

/// Folds runs of adjacent immutable-constant links into single constants.
fn fold_constant_links(
    graph: &Graph,
    links: Vec<NodeId>,
    evaluator: &mut dyn Evaluator,
) -> Result<Vec<NodeId>, OptimizeError> {
    let mut out: Vec<NodeId> = Vec::with_capacity(links.len());
    for link in links {
        let both_const = out
            .last()
            .is_some_and(|&prev| graph.node(prev).is_constant())
            && graph.node(link).is_constant();
        if both_const {
            let prev = out.pop().unwrap_or_else(|| unreachable!());
            let m = graph.binary(Opcode::Matmul, prev, link)?;
            let values = evaluator.evaluate(graph, &[m])?.remove(0);
            let folded = graph.constant(graph.shape(m), graph.dtype(m), &values)?;
            out.push(folded);
        } else {
            out.push(link);
        }
    }
    Ok(out)
}

/// `dims[i]` is the row count of link `i`; `dims[n]` the final column count.
fn chain_dims(graph: &Graph, links: &[NodeId]) -> Vec<usize> {
    let mut dims: Vec<usize> = links.iter().map(|&l| graph.shape(l).at(0)).collect();
    if let Some(&last) = links.last() {
        dims.push(graph.shape(last).at(1));
    }
    dims
}

/// Non-zero fraction of a link's value; 1 when the link cannot be evaluated
/// ahead of time (placeholders, assignments downstream).
fn link_density(graph: &Graph, id: NodeId) -> BigRational {
    let values = match &*graph.node(id) {
        NodeData::Leaf { dtype, data, .. } if !data.is_empty() => match dtype.decode(data) {
            Ok(v) => v,
            Err(_) => return BigRational::one(),
        },
        _ => return BigRational::one(),
    };
    if values.is_empty() {
        return BigRational::one();
    }
    let nonzero = values.iter().filter(|v| **v != 0.0).count();
    BigRational::new(BigInt::from(nonzero), BigInt::from(values.len()))
}

/// Density of a merged interval: an output element is zero only when all
/// `common` partial products are zero, so `density' = 1 - (1 - l*r)^common`
/// with `1 - l*r` the per-term zero probability.
fn merged_density(l: &BigRational, r: &BigRational, common: usize) -> BigRational {
    let term = BigRational::one() - l * r;
    BigRational::one() - ratio_pow(&term, common)
}

fn ratio_pow(base: &BigRational, mut exp: usize) -> BigRational {
    let mut acc = BigRational::one();
    let mut sq = base.clone();
    while exp > 0 {
        if exp & 1 == 1 {
            acc *= &sq;
        }
        sq = &sq * &sq;
        exp >>= 1;
    }
    acc
}

fn step_cost(l: &BigRational, r: &BigRational, common: usize, lrows: usize, rcols: usize) -> BigRational {
    l * r * BigRational::from(BigInt::from(common * lrows * rcols))
}

/// Interval DP over the chain. Returns the split table (`splits[i][j]` is the
/// k where `[i..=k] @ [k+1..=j]` is cheapest) and the total estimated cost.
pub fn optimal_split(
    dims: &[usize],
    density: &[BigRational],
) -> (Vec<Vec<usize>>, BigRational) {
    let n = density.len();
    let mut cost = vec![vec![BigRational::zero(); n]; n];
    let mut dens = vec![vec![BigRational::zero(); n]; n];
    let mut splits = vec![vec![0usize; n]; n];
    for (i, d) in density.iter().enumerate() {
        dens[i][i] = d.clone();
    }
    for len in 2..=n {
        for i in 0..=n - len {
            let j = i + len - 1;
            let mut best: Option<(BigRational, usize, BigRational)> = None;
            for k in i..j {
                let step = step_cost(&dens[i][k], &dens[k + 1][j], dims[k + 1], dims[i], dims[j + 1]);
                let total = &cost[i][k] + &cost[k + 1][j] + step;
                if best.as_ref().map_or(true, |(b, _, _)| total < *b) {
                    let d = merged_density(&dens[i][k], &dens[k + 1][j], dims[k + 1]);
                    best = Some((total, k, d));
                }
            }
            let (total, k, d) = best.unwrap_or_else(|| unreachable!("interval of length >= 2"));
            cost[i][j] = total;
            splits[i][j] = k;
            dens[i][j] = d;
        }
    }
    let total = cost[0][n - 1].clone();
    (splits, total)
}

/// Cost of the plain left-to-right association, for comparison.
pub fn left_to_right_cost(dims: &[usize], density: &[BigRational]) -> BigRational {
    let n = density.len();
    let mut total = BigRational::zero();
    let mut acc = density[0].clone();
    for k in 1..n {
        total += step_cost(&acc, &density[k], dims[k], dims[0], dims[k + 1]);
        acc = merged_density(&acc, &density[k], dims[k]);
    }
    total
}

fn rechain(
    graph: &Graph,
    links: &[NodeId],
    splits: &[Vec<usize>],
    i: usize,
    j: usize,
) -> Result<NodeId, OptimizeError> {
    if i == j {
        return Ok(links[i]);
    }
    let k = splits[i][j];
    let lhs = rechain(graph, links, splits, i, k)?;
    let rhs = rechain(graph, links, splits, k + 1, j)?;
    Ok(graph.binary(Opcode::Matmul, lhs, rhs)?)
}

fn rebuild_left(graph: &Graph, links: &[NodeId]) -> Result<NodeId, OptimizeError> {
    let mut acc = links[0];
    for &link in &links[1..] {
        acc = graph.binary(Opcode::Matmul, acc, link)?;
    }
    Ok(acc)
}
