//! Per-opcode local gradient rules.
//!
//! Every rule builds new nodes in the arena and never mutates the functor or
//! its arguments. Rules reuse the forward output where algebraically cheaper
//! (sigmoid, tanh, exp, sqrt, reduce_prod all refer back to `node`).

use std::collections::BTreeSet;

use crate::graph::graph::ConstructionError;
use crate::graph::node::{attr_keys, Attr, AttrMap, NodeId};
use crate::graph::op::Opcode;
use crate::graph::shaper::clamped_extents;
use crate::graph::Graph;
use crate::shape::Shape;

fn rank_set(attrs: &AttrMap, key: &'static str) -> BTreeSet<usize> {
    match attrs.get(key) {
        Some(Attr::RankSet(r)) => r.clone(),
        _ => unreachable!("validated functor lost attribute {key}"),
    }
}

fn ranks(attrs: &AttrMap, key: &'static str) -> Vec<usize> {
    match attrs.get(key) {
        Some(Attr::Ranks(r)) => r.clone(),
        _ => unreachable!("validated functor lost attribute {key}"),
    }
}

fn dims(attrs: &AttrMap, key: &'static str) -> Vec<usize> {
    match attrs.get(key) {
        Some(Attr::Dims(d)) => d.clone(),
        _ => unreachable!("validated functor lost attribute {key}"),
    }
}

fn dim_pairs(attrs: &AttrMap, key: &'static str) -> Vec<(usize, usize)> {
    match attrs.get(key) {
        Some(Attr::DimPairs(p)) => p.clone(),
        _ => unreachable!("validated functor lost attribute {key}"),
    }
}

fn rank_pairs(attrs: &AttrMap, key: &'static str) -> Vec<(usize, usize)> {
    match attrs.get(key) {
        Some(Attr::RankPairs(p)) => p.clone(),
        _ => unreachable!("validated functor lost attribute {key}"),
    }
}

fn axis(attrs: &AttrMap) -> usize {
    match attrs.get(attr_keys::AXIS) {
        Some(Attr::Rank(a)) => *a,
        _ => unreachable!("validated functor lost attribute axis"),
    }
}

/// Broadcasts a reduced-shape node back out to `full`'s extent along `rdims`.
fn extend_over(
    g: &Graph,
    reduced: NodeId,
    full: &Shape,
    rdims: &BTreeSet<usize>,
) -> Result<NodeId, ConstructionError> {
    let mut factors = vec![1; full.rank()];
    for &r in rdims {
        if r < full.rank() {
            factors[r] = full.at(r);
        }
    }
    if factors.iter().all(|&f| f == 1) {
        return Ok(reduced);
    }
    let mut attrs = AttrMap::new();
    attrs.insert(attr_keys::FACTORS, Attr::Dims(factors));
    g.func(Opcode::Extend, vec![reduced], attrs)
}

/// Transposes the trailing two logical dimensions, keeping batch dims fixed.
fn transpose(g: &Graph, id: NodeId, rank: usize) -> Result<NodeId, ConstructionError> {
    let mut order: Vec<usize> = (0..rank).collect();
    order.swap(rank - 2, rank - 1);
    let mut attrs = AttrMap::new();
    attrs.insert(attr_keys::ORDER, Attr::Ranks(order));
    g.func(Opcode::Permute, vec![id], attrs)
}

/// Builds the gradient of `node`'s output with respect to its `arg_idx`-th
/// argument, given the supergradient flowing into `node`.
///
/// # Panics
///
/// Panics when `node`'s opcode is not differentiable. Such opcodes terminate
/// gradient paths; reaching one here is caller misuse, not a recoverable
/// condition.
pub fn local_derivative(
    g: &Graph,
    node: NodeId,
    supergrad: NodeId,
    arg_idx: usize,
) -> Result<NodeId, ConstructionError> {
    use Opcode::*;
    let (opcode, args, attrs) = {
        let data = g.node(node);
        match &*data {
            crate::graph::NodeData::Func {
                opcode,
                args,
                attrs,
                ..
            } => (*opcode, args.clone(), attrs.clone()),
            crate::graph::NodeData::Leaf { .. } => {
                panic!("cannot take a local derivative of a leaf")
            }
        }
    };
    assert!(
        opcode.is_differentiable(),
        "gradient requested through non-differentiable {opcode}"
    );
    let sg = supergrad;
    let x = args[arg_idx];
    match opcode {
        Identity | Round | Add => Ok(sg),
        Neg => g.unary(Neg, sg),
        Abs => {
            // x / |x| is the sign
            let num = g.binary(Mul, sg, x)?;
            g.binary(Div, num, node)
        }
        Sin => {
            let c = g.unary(Cos, x)?;
            g.binary(Mul, sg, c)
        }
        Cos => {
            let s = g.unary(Sin, x)?;
            let m = g.binary(Mul, sg, s)?;
            g.unary(Neg, m)
        }
        Tan => {
            let c = g.unary(Cos, x)?;
            let c2 = g.unary(Square, c)?;
            g.binary(Div, sg, c2)
        }
        Exp => g.binary(Mul, sg, node),
        Log => g.binary(Div, sg, x),
        Sqrt => {
            let two = g.constant_like(node, 2.0);
            let den = g.binary(Mul, two, node)?;
            g.binary(Div, sg, den)
        }
        Square => {
            let two = g.constant_like(x, 2.0);
            g.func(Mul, vec![sg, two, x], AttrMap::new())
        }
        Cube => {
            let three = g.constant_like(x, 3.0);
            let x2 = g.unary(Square, x)?;
            g.func(Mul, vec![sg, three, x2], AttrMap::new())
        }
        Sigmoid => {
            // s' = s * (1 - s)
            let one = g.ones_like(node);
            let rest = g.binary(Sub, one, node)?;
            g.func(Mul, vec![sg, node, rest], AttrMap::new())
        }
        Tanh => {
            let one = g.ones_like(node);
            let t2 = g.unary(Square, node)?;
            let rest = g.binary(Sub, one, t2)?;
            g.binary(Mul, sg, rest)
        }
        Pow => {
            let (f, e) = (args[0], args[1]);
            if arg_idx == 0 {
                // sg * e * f^(e-1)
                let one = g.ones_like(e);
                let em1 = g.binary(Sub, e, one)?;
                let p = g.binary(Pow, f, em1)?;
                g.func(Mul, vec![sg, e, p], AttrMap::new())
            } else {
                // sg * f^e * log(f)
                let lf = g.unary(Log, f)?;
                g.func(Mul, vec![sg, node, lf], AttrMap::new())
            }
        }
        Sub => {
            if arg_idx == 0 {
                Ok(sg)
            } else {
                g.unary(Neg, sg)
            }
        }
        Mul => {
            let mut factors = vec![sg];
            factors.extend(
                args.iter()
                    .enumerate()
                    .filter(|&(i, _)| i != arg_idx)
                    .map(|(_, &a)| a),
            );
            g.func(Mul, factors, AttrMap::new())
        }
        Div => {
            let (f, den) = (args[0], args[1]);
            if arg_idx == 0 {
                g.binary(Div, sg, den)
            } else {
                // -sg * f / den^2
                let nsg = g.unary(Neg, sg)?;
                let num = g.binary(Mul, nsg, f)?;
                let d2 = g.unary(Square, den)?;
                g.binary(Div, num, d2)
            }
        }
        Min | Max => {
            // ties receive the full supergrad, unnormalized
            let mask = g.binary(Eq, x, node)?;
            g.binary(Mul, sg, mask)
        }
        Select => match arg_idx {
            0 => Ok(g.zeros_like(args[0])),
            1 => {
                let zero = g.zeros_like(sg);
                g.func(Select, vec![args[0], sg, zero], AttrMap::new())
            }
            _ => {
                let zero = g.zeros_like(sg);
                g.func(Select, vec![args[0], zero, sg], AttrMap::new())
            }
        },
        ReduceSum => {
            let rdims = rank_set(&attrs, attr_keys::RDIMS);
            extend_over(g, sg, &g.shape(x), &rdims)
        }
        ReduceProd => {
            let rdims = rank_set(&attrs, attr_keys::RDIMS);
            let shape = g.shape(x);
            let esg = extend_over(g, sg, &shape, &rdims)?;
            let eout = extend_over(g, node, &shape, &rdims)?;
            let quot = g.binary(Div, eout, x)?;
            g.binary(Mul, esg, quot)
        }
        ReduceMax | ReduceMin => {
            let rdims = rank_set(&attrs, attr_keys::RDIMS);
            let shape = g.shape(x);
            let esg = extend_over(g, sg, &shape, &rdims)?;
            let eout = extend_over(g, node, &shape, &rdims)?;
            let mask = g.binary(Eq, x, eout)?;
            g.binary(Mul, esg, mask)
        }
        Extend => {
            let factors = dims(&attrs, attr_keys::FACTORS);
            let rdims: BTreeSet<usize> = factors
                .iter()
                .enumerate()
                .filter(|&(_, &f)| f > 1)
                .map(|(i, _)| i)
                .collect();
            let mut at = AttrMap::new();
            at.insert(attr_keys::RDIMS, Attr::RankSet(rdims));
            g.func(ReduceSum, vec![sg], at)
        }
        Permute => {
            let order = ranks(&attrs, attr_keys::ORDER);
            let mut inverse = vec![0; order.len()];
            for (i, &o) in order.iter().enumerate() {
                inverse[o] = i;
            }
            let mut at = AttrMap::new();
            at.insert(attr_keys::ORDER, Attr::Ranks(inverse));
            g.func(Permute, vec![sg], at)
        }
        Reshape => {
            let mut at = AttrMap::new();
            at.insert(attr_keys::SHAPE, Attr::Dims(g.shape(x).dims().to_vec()));
            g.func(Reshape, vec![sg], at)
        }
        Concat => {
            let ax = axis(&attrs);
            let offset: usize = args[..arg_idx].iter().map(|&a| g.shape(a).at(ax)).sum();
            let shape = g.shape(x);
            let out = g.shape(node);
            let n = out.rank().max(ax + 1);
            let extents: Vec<(usize, usize)> = (0..n)
                .map(|i| {
                    if i == ax {
                        (offset, shape.at(ax))
                    } else {
                        (0, out.at(i))
                    }
                })
                .collect();
            let mut at = AttrMap::new();
            at.insert(attr_keys::EXTENTS, Attr::DimPairs(extents));
            g.func(Slice, vec![sg], at)
        }
        Slice => {
            let shape = g.shape(x);
            let clamped = clamped_extents(&shape, &dim_pairs(&attrs, attr_keys::EXTENTS));
            let paddings: Vec<(usize, usize)> = clamped
                .iter()
                .enumerate()
                .map(|(i, &(off, ext))| (off, shape.at(i) - off - ext))
                .collect();
            let mut at = AttrMap::new();
            at.insert(attr_keys::PADDINGS, Attr::DimPairs(paddings));
            g.func(Pad, vec![sg], at)
        }
        Pad => {
            let paddings = dim_pairs(&attrs, attr_keys::PADDINGS);
            let shape = g.shape(x);
            let n = shape.rank().max(paddings.len());
            let extents: Vec<(usize, usize)> = (0..n)
                .map(|i| {
                    let before = paddings.get(i).map_or(0, |&(b, _)| b);
                    (before, shape.at(i))
                })
                .collect();
            let mut at = AttrMap::new();
            at.insert(attr_keys::EXTENTS, Attr::DimPairs(extents));
            g.func(Slice, vec![sg], at)
        }
        Stride => {
            let incrs = dims(&attrs, attr_keys::INCRS);
            let mut at = AttrMap::new();
            at.insert(attr_keys::SHAPE, Attr::Dims(g.shape(x).dims().to_vec()));
            at.insert(attr_keys::INCRS, Attr::Dims(incrs));
            g.func(Scatter, vec![sg], at)
        }
        Scatter => {
            let incrs = dims(&attrs, attr_keys::INCRS);
            let mut at = AttrMap::new();
            at.insert(attr_keys::INCRS, Attr::Dims(incrs));
            g.func(Stride, vec![sg], at)
        }
        Reverse => {
            let rdims = rank_set(&attrs, attr_keys::RDIMS);
            let mut at = AttrMap::new();
            at.insert(attr_keys::RDIMS, Attr::RankSet(rdims));
            g.func(Reverse, vec![sg], at)
        }
        Matmul => {
            let (a, b) = (args[0], args[1]);
            let rank = g.shape(a).rank().max(g.shape(b).rank()).max(2);
            if arg_idx == 0 {
                let bt = transpose(g, b, rank)?;
                g.binary(Matmul, sg, bt)
            } else {
                let at = transpose(g, a, rank)?;
                g.binary(Matmul, at, sg)
            }
        }
        Contract => contract_grad(g, sg, &args, &attrs, arg_idx),
        Conv => {
            let (input, kernel) = (args[0], args[1]);
            if arg_idx == 0 {
                let in_shape = g.shape(input);
                let k_shape = g.shape(kernel);
                let paddings: Vec<(usize, usize)> = (0..in_shape.rank())
                    .map(|i| (k_shape.at(i) - 1, k_shape.at(i) - 1))
                    .collect();
                let mut pat = AttrMap::new();
                pat.insert(attr_keys::PADDINGS, Attr::DimPairs(paddings));
                let padded = g.func(Pad, vec![sg], pat)?;
                let rdims: BTreeSet<usize> = (0..k_shape.rank())
                    .filter(|&d| k_shape.at(d) > 1)
                    .collect();
                let mut rat = AttrMap::new();
                rat.insert(attr_keys::RDIMS, Attr::RankSet(rdims));
                let rkernel = g.func(Reverse, vec![kernel], rat)?;
                g.binary(Conv, padded, rkernel)
            } else {
                g.binary(Conv, input, sg)
            }
        }
        Eq | Neq | Lt | Gt | RandUnif | ArgMax | Assign | AssignAdd | AssignSub => {
            unreachable!("differentiability checked above")
        }
    }
}

/// CONTRACT gradient: contract the supergrad against the complementary
/// operand over the supergrad's free axes, then permute the result back into
/// the argument's dimension order.
fn contract_grad(
    g: &Graph,
    sg: NodeId,
    args: &[NodeId],
    attrs: &AttrMap,
    arg_idx: usize,
) -> Result<NodeId, ConstructionError> {
    let pairs = rank_pairs(attrs, attr_keys::PAIRS);
    let (a, b) = (args[0], args[1]);
    let (ra, rb) = (g.shape(a).rank(), g.shape(b).rank());
    let lcon: BTreeSet<usize> = pairs.iter().map(|&(l, _)| l).collect();
    let rcon: BTreeSet<usize> = pairs.iter().map(|&(_, r)| r).collect();
    let lfree: Vec<usize> = (0..ra).filter(|i| !lcon.contains(i)).collect();
    let rfree: Vec<usize> = (0..rb).filter(|i| !rcon.contains(i)).collect();

    if arg_idx == 0 {
        // dA = permute(contract(sg, B) over sg's B-free block)
        let cpairs: Vec<(usize, usize)> = rfree
            .iter()
            .enumerate()
            .map(|(j, &r)| (lfree.len() + j, r))
            .collect();
        let mut cat = AttrMap::new();
        cat.insert(attr_keys::PAIRS, Attr::RankPairs(cpairs));
        let raw = g.func(Opcode::Contract, vec![sg, b], cat)?;
        // raw dims: A's free axes in order, then A's contracted axes in
        // ascending order of their B partners
        let rcon_sorted: Vec<usize> = rcon.iter().copied().collect();
        let mut order = vec![0; ra];
        for (p, &l) in lfree.iter().enumerate() {
            order[l] = p;
        }
        for &(l, r) in &pairs {
            let j = rcon_sorted
                .iter()
                .position(|&x| x == r)
                .unwrap_or_else(|| unreachable!("pair partner {r} missing from contracted set"));
            order[l] = lfree.len() + j;
        }
        let mut pat = AttrMap::new();
        pat.insert(attr_keys::ORDER, Attr::Ranks(order));
        g.func(Opcode::Permute, vec![raw], pat)
    } else {
        // dB = permute(contract(sg, A) over sg's A-free block)
        let cpairs: Vec<(usize, usize)> = lfree
            .iter()
            .enumerate()
            .map(|(j, &l)| (j, l))
            .collect();
        let mut cat = AttrMap::new();
        cat.insert(attr_keys::PAIRS, Attr::RankPairs(cpairs));
        let raw = g.func(Opcode::Contract, vec![sg, a], cat)?;
        // raw dims: B's free axes in order, then B's contracted axes in
        // ascending order of their A partners
        let lcon_sorted: Vec<usize> = lcon.iter().copied().collect();
        let mut order = vec![0; rb];
        for (p, &r) in rfree.iter().enumerate() {
            order[r] = p;
        }
        for &(l, r) in &pairs {
            let j = lcon_sorted
                .iter()
                .position(|&x| x == l)
                .unwrap_or_else(|| unreachable!("pair partner {l} missing from contracted set"));
            order[r] = rfree.len() + j;
        }
        let mut pat = AttrMap::new();
        pat.insert(attr_keys::ORDER, Attr::Ranks(order));
        g.func(Opcode::Permute, vec![raw], pat)
    }
}
