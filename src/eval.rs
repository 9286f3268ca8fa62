//! The forward evaluator interface and a reference interpreter.
//!
//! The optimizer only needs the narrow [`Evaluator`] contract to fold
//! constant subgraphs; [`Interpreter`] is a straightforward scalar-loop
//! implementation of every opcode, precise enough to serve as the ground
//! truth in tests. It works on flat `f64` buffers regardless of the stored
//! element type; results are re-encoded at the leaf's type on folding.

use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use crate::context::Context;
use crate::graph::node::{attr_keys, Attr, AttrMap, NodeData, NodeId};
use crate::graph::op::Opcode;
use crate::graph::shaper::clamped_extents;
use crate::graph::traversal::postorder;
use crate::graph::Graph;
use crate::shape::{coordinate, index, Shape};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("{0} cannot be evaluated by this interpreter")]
    Unsupported(Opcode),
    #[error("placeholder {0} has no bound value")]
    UnboundPlaceholder(NodeId),
}

/// Forward evaluation of graph nodes to flat numeric buffers.
///
/// Consumed by constant folding; any device or remote executor can stand in
/// as long as it honors the node's frozen shape (the returned buffer holds
/// exactly `shape.n_elems()` values in row-major order).
pub trait Evaluator {
    fn evaluate(
        &mut self,
        graph: &Graph,
        targets: &[NodeId],
    ) -> Result<Vec<Vec<f64>>, EvalError>;
}

/// Reference single-threaded interpreter.
#[derive(Debug, Default)]
pub struct Interpreter {
    ctx: Context,
    /// Leaf overrides, keyed by handle. Required for placeholders, optional
    /// for variables and constants.
    bindings: FxHashMap<NodeId, Vec<f64>>,
}

impl Interpreter {
    pub fn new(ctx: Context) -> Self {
        Interpreter {
            ctx,
            bindings: FxHashMap::default(),
        }
    }

    /// Binds a leaf to explicit values for subsequent evaluations.
    pub fn bind(&mut self, id: NodeId, values: Vec<f64>) {
        self.bindings.insert(id, values);
    }

    pub fn evaluate_one(&mut self, graph: &Graph, target: NodeId) -> Result<Vec<f64>, EvalError> {
        let mut out = self.evaluate(graph, &[target])?;
        Ok(out.remove(0))
    }

    fn eval_node(
        &mut self,
        graph: &Graph,
        id: NodeId,
        cache: &FxHashMap<NodeId, Vec<f64>>,
    ) -> Result<Vec<f64>, EvalError> {
        if let Some(values) = self.bindings.get(&id) {
            return Ok(values.clone());
        }
        let (opcode, args, attrs, out_shape) = {
            let data = graph.node(id);
            match &*data {
                NodeData::Leaf { dtype, data, .. } => {
                    if data.is_empty() {
                        return Err(EvalError::UnboundPlaceholder(id));
                    }
                    // leaf bytes were validated at construction
                    return Ok(dtype
                        .decode(data)
                        .unwrap_or_else(|e| unreachable!("corrupt leaf {id}: {e}")));
                }
                NodeData::Func {
                    opcode,
                    args,
                    attrs,
                    shape,
                    ..
                } => (*opcode, args.clone(), attrs.clone(), shape.clone()),
            }
        };
        let bufs: Vec<&Vec<f64>> = args.iter().map(|a| &cache[a]).collect();
        let shapes: Vec<Shape> = args.iter().map(|&a| graph.shape(a)).collect();
        self.apply(opcode, &attrs, &bufs, &shapes, &out_shape)
    }

    fn apply(
        &mut self,
        opcode: Opcode,
        attrs: &AttrMap,
        bufs: &[&Vec<f64>],
        shapes: &[Shape],
        out_shape: &Shape,
    ) -> Result<Vec<f64>, EvalError> {
        use Opcode::*;
        let a = bufs[0];
        let out = match opcode {
            Identity => a.clone(),
            Round => a.iter().map(|v| v.round()).collect(),
            Neg => a.iter().map(|v| -v).collect(),
            Abs => a.iter().map(|v| v.abs()).collect(),
            Sin => a.iter().map(|v| v.sin()).collect(),
            Cos => a.iter().map(|v| v.cos()).collect(),
            Tan => a.iter().map(|v| v.tan()).collect(),
            Exp => a.iter().map(|v| v.exp()).collect(),
            Log => a.iter().map(|v| v.ln()).collect(),
            Sqrt => a.iter().map(|v| v.sqrt()).collect(),
            Square => a.iter().map(|v| v * v).collect(),
            Cube => a.iter().map(|v| v * v * v).collect(),
            Sigmoid => a.iter().map(|v| 1.0 / (1.0 + (-v).exp())).collect(),
            Tanh => a.iter().map(|v| v.tanh()).collect(),
            Pow => zip2(a, bufs[1], |x, y| x.powf(y)),
            Sub => zip2(a, bufs[1], |x, y| x - y),
            Div => zip2(a, bufs[1], |x, y| x / y),
            Min => zip2(a, bufs[1], f64::min),
            Max => zip2(a, bufs[1], f64::max),
            Eq => zip2(a, bufs[1], |x, y| (x == y) as u8 as f64),
            Neq => zip2(a, bufs[1], |x, y| (x != y) as u8 as f64),
            Lt => zip2(a, bufs[1], |x, y| (x < y) as u8 as f64),
            Gt => zip2(a, bufs[1], |x, y| (x > y) as u8 as f64),
            Add => {
                let mut acc = a.clone();
                for b in &bufs[1..] {
                    for (x, y) in acc.iter_mut().zip(b.iter()) {
                        *x += y;
                    }
                }
                acc
            }
            Mul => {
                let mut acc = a.clone();
                for b in &bufs[1..] {
                    for (x, y) in acc.iter_mut().zip(b.iter()) {
                        *x *= y;
                    }
                }
                acc
            }
            Select => {
                let (c, t, f) = (bufs[0], bufs[1], bufs[2]);
                (0..c.len())
                    .map(|i| if c[i] != 0.0 { t[i] } else { f[i] })
                    .collect()
            }
            RandUnif => {
                let (lo, hi) = (bufs[0], bufs[1]);
                (0..lo.len())
                    .map(|i| lo[i] + (hi[i] - lo[i]) * self.ctx.uniform())
                    .collect()
            }
            ReduceSum => reduce(a, &shapes[0], out_shape, 0.0, |acc, v| acc + v),
            ReduceProd => reduce(a, &shapes[0], out_shape, 1.0, |acc, v| acc * v),
            ReduceMax => reduce(a, &shapes[0], out_shape, f64::NEG_INFINITY, f64::max),
            ReduceMin => reduce(a, &shapes[0], out_shape, f64::INFINITY, f64::min),
            ArgMax => {
                let rdims = match attrs.get(attr_keys::RDIMS) {
                    Some(Attr::RankSet(r)) => r.clone(),
                    _ => unreachable!("validated functor lost attribute rdims"),
                };
                let rdim = *rdims
                    .iter()
                    .next()
                    .unwrap_or_else(|| unreachable!("argmax with empty rdims"));
                let in_shape = &shapes[0];
                let mut best = vec![f64::NEG_INFINITY; out_shape.n_elems()];
                let mut out = vec![0.0; out_shape.n_elems()];
                for (flat, &v) in a.iter().enumerate() {
                    let coord = coordinate(in_shape, flat);
                    let o = index(out_shape, &coord);
                    if v > best[o] {
                        best[o] = v;
                        out[o] = coord.get(rdim).copied().unwrap_or(0) as f64;
                    }
                }
                out
            }
            Extend | Reshape => {
                if opcode == Reshape {
                    // row-major reshape keeps the flat order
                    a.clone()
                } else {
                    let in_shape = &shapes[0];
                    (0..out_shape.n_elems())
                        .map(|o| a[index(in_shape, &coordinate(out_shape, o))])
                        .collect()
                }
            }
            Permute => {
                let order = match attrs.get(attr_keys::ORDER) {
                    Some(Attr::Ranks(o)) => o.clone(),
                    _ => unreachable!("validated functor lost attribute order"),
                };
                let in_shape = &shapes[0];
                (0..out_shape.n_elems())
                    .map(|o| {
                        let c = coordinate(out_shape, o);
                        let mut in_coord = vec![0; order.len()];
                        for (t, &src) in order.iter().enumerate() {
                            in_coord[src] = c.get(t).copied().unwrap_or(0);
                        }
                        a[index(in_shape, &in_coord)]
                    })
                    .collect()
            }
            Concat => {
                let ax = match attrs.get(attr_keys::AXIS) {
                    Some(Attr::Rank(ax)) => *ax,
                    _ => unreachable!("validated functor lost attribute axis"),
                };
                let mut out = vec![0.0; out_shape.n_elems()];
                let mut offset = 0;
                for (buf, shape) in bufs.iter().zip(shapes) {
                    for (flat, &v) in buf.iter().enumerate() {
                        let mut c = coordinate(shape, flat);
                        if c.len() <= ax {
                            c.resize(ax + 1, 0);
                        }
                        c[ax] += offset;
                        out[index(out_shape, &c)] = v;
                    }
                    offset += shape.at(ax);
                }
                out
            }
            Slice => {
                let extents = match attrs.get(attr_keys::EXTENTS) {
                    Some(Attr::DimPairs(e)) => e.clone(),
                    _ => unreachable!("validated functor lost attribute extents"),
                };
                let in_shape = &shapes[0];
                let clamped = clamped_extents(in_shape, &extents);
                (0..out_shape.n_elems())
                    .map(|o| {
                        let c = coordinate(out_shape, o);
                        let in_coord: Vec<usize> = (0..in_shape.rank())
                            .map(|i| c.get(i).copied().unwrap_or(0) + clamped[i].0)
                            .collect();
                        a[index(in_shape, &in_coord)]
                    })
                    .collect()
            }
            Pad => {
                let paddings = match attrs.get(attr_keys::PADDINGS) {
                    Some(Attr::DimPairs(p)) => p.clone(),
                    _ => unreachable!("validated functor lost attribute paddings"),
                };
                let in_shape = &shapes[0];
                let mut out = vec![0.0; out_shape.n_elems()];
                for (flat, &v) in a.iter().enumerate() {
                    let c = coordinate(in_shape, flat);
                    let out_coord: Vec<usize> = (0..out_shape.rank())
                        .map(|i| {
                            c.get(i).copied().unwrap_or(0)
                                + paddings.get(i).map_or(0, |&(b, _)| b)
                        })
                        .collect();
                    out[index(out_shape, &out_coord)] = v;
                }
                out
            }
            Stride => {
                let incrs = match attrs.get(attr_keys::INCRS) {
                    Some(Attr::Dims(s)) => s.clone(),
                    _ => unreachable!("validated functor lost attribute incrs"),
                };
                let in_shape = &shapes[0];
                (0..out_shape.n_elems())
                    .map(|o| {
                        let c = coordinate(out_shape, o);
                        let in_coord: Vec<usize> = (0..in_shape.rank())
                            .map(|i| {
                                c.get(i).copied().unwrap_or(0)
                                    * incrs.get(i).copied().unwrap_or(1)
                            })
                            .collect();
                        a[index(in_shape, &in_coord)]
                    })
                    .collect()
            }
            Scatter => {
                let incrs = match attrs.get(attr_keys::INCRS) {
                    Some(Attr::Dims(s)) => s.clone(),
                    _ => unreachable!("validated functor lost attribute incrs"),
                };
                let in_shape = &shapes[0];
                let mut out = vec![0.0; out_shape.n_elems()];
                for (flat, &v) in a.iter().enumerate() {
                    let c = coordinate(in_shape, flat);
                    let out_coord: Vec<usize> = (0..out_shape.rank())
                        .map(|i| {
                            c.get(i).copied().unwrap_or(0) * incrs.get(i).copied().unwrap_or(1)
                        })
                        .collect();
                    out[index(out_shape, &out_coord)] = v;
                }
                out
            }
            Reverse => {
                let rdims = match attrs.get(attr_keys::RDIMS) {
                    Some(Attr::RankSet(r)) => r.clone(),
                    _ => unreachable!("validated functor lost attribute rdims"),
                };
                let in_shape = &shapes[0];
                (0..out_shape.n_elems())
                    .map(|o| {
                        let mut c = coordinate(out_shape, o);
                        for &r in &rdims {
                            if r < c.len() {
                                c[r] = in_shape.at(r) - 1 - c[r];
                            }
                        }
                        a[index(in_shape, &c)]
                    })
                    .collect()
            }
            Matmul => {
                let (sa, sb) = (&shapes[0], &shapes[1]);
                let n = sa.rank().max(sb.rank()).max(2);
                let batch: usize = (0..n - 2).map(|i| sa.at(i)).product();
                let (m, k, c) = (sa.at(n - 2), sa.at(n - 1), sb.at(n - 1));
                let b = bufs[1];
                let mut out = vec![0.0; batch * m * c];
                for bi in 0..batch {
                    let (ab, bb, ob) = (bi * m * k, bi * k * c, bi * m * c);
                    for i in 0..m {
                        for j in 0..c {
                            let mut acc = 0.0;
                            for t in 0..k {
                                acc += a[ab + i * k + t] * b[bb + t * c + j];
                            }
                            out[ob + i * c + j] = acc;
                        }
                    }
                }
                out
            }
            Contract => {
                let pairs = match attrs.get(attr_keys::PAIRS) {
                    Some(Attr::RankPairs(p)) => p.clone(),
                    _ => unreachable!("validated functor lost attribute pairs"),
                };
                contract(a, bufs[1], &shapes[0], &shapes[1], &pairs, out_shape)
            }
            Conv => {
                let (sx, sk) = (&shapes[0], &shapes[1]);
                let kernel = bufs[1];
                (0..out_shape.n_elems())
                    .map(|o| {
                        let c = coordinate(out_shape, o);
                        let mut acc = 0.0;
                        for (kflat, &kv) in kernel.iter().enumerate() {
                            let kc = coordinate(sk, kflat);
                            let x_coord: Vec<usize> = (0..sx.rank())
                                .map(|i| {
                                    c.get(i).copied().unwrap_or(0)
                                        + kc.get(i).copied().unwrap_or(0)
                                })
                                .collect();
                            acc += a[index(sx, &x_coord)] * kv;
                        }
                        acc
                    })
                    .collect()
            }
            Assign | AssignAdd | AssignSub => return Err(EvalError::Unsupported(opcode)),
        };
        Ok(out)
    }
}

impl Evaluator for Interpreter {
    fn evaluate(
        &mut self,
        graph: &Graph,
        targets: &[NodeId],
    ) -> Result<Vec<Vec<f64>>, EvalError> {
        let order = postorder(graph, targets);
        let mut cache: FxHashMap<NodeId, Vec<f64>> = FxHashMap::default();
        for id in order {
            let values = self.eval_node(graph, id, &cache)?;
            cache.insert(id, values);
        }
        let wanted: FxHashSet<NodeId> = targets.iter().copied().collect();
        debug_assert!(wanted.iter().all(|t| cache.contains_key(t)));
        Ok(targets.iter().map(|t| cache[t].clone()).collect())
    }
}

fn zip2(a: &[f64], b: &[f64], f: impl Fn(f64, f64) -> f64) -> Vec<f64> {
    a.iter().zip(b).map(|(&x, &y)| f(x, y)).collect()
}

fn reduce(
    a: &[f64],
    in_shape: &Shape,
    out_shape: &Shape,
    init: f64,
    f: impl Fn(f64, f64) -> f64,
) -> Vec<f64> {
    let mut out = vec![init; out_shape.n_elems()];
    for (flat, &v) in a.iter().enumerate() {
        let coord = coordinate(in_shape, flat);
        // reduced positions are size-1 in the output, so indexing wraps them
        let o = index(out_shape, &coord);
        out[o] = f(out[o], v);
    }
    out
}

fn contract(
    a: &[f64],
    b: &[f64],
    sa: &Shape,
    sb: &Shape,
    pairs: &[(usize, usize)],
    out_shape: &Shape,
) -> Vec<f64> {
    let lcon: Vec<usize> = pairs.iter().map(|&(l, _)| l).collect();
    let lfree: Vec<usize> = (0..sa.rank()).filter(|i| !lcon.contains(i)).collect();
    let rcon: Vec<usize> = pairs.iter().map(|&(_, r)| r).collect();
    let rfree: Vec<usize> = (0..sb.rank()).filter(|i| !rcon.contains(i)).collect();
    let inner: usize = pairs.iter().map(|&(l, _)| sa.at(l)).product();
    (0..out_shape.n_elems())
        .map(|o| {
            let c = coordinate(out_shape, o);
            let mut a_coord = vec![0; sa.rank()];
            let mut b_coord = vec![0; sb.rank()];
            for (p, &l) in lfree.iter().enumerate() {
                a_coord[l] = c.get(p).copied().unwrap_or(0);
            }
            for (p, &r) in rfree.iter().enumerate() {
                b_coord[r] = c.get(lfree.len() + p).copied().unwrap_or(0);
            }
            let mut acc = 0.0;
            for mut t in 0..inner {
                for &(l, r) in pairs.iter().rev() {
                    let d = sa.at(l);
                    a_coord[l] = t % d;
                    b_coord[r] = t % d;
                    t /= d;
                }
                acc += a[index(sa, &a_coord)] * b[index(sb, &b_coord)];
            }
            acc
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;

    fn shape(dims: &[usize]) -> Shape {
        Shape::new(dims.to_vec()).unwrap()
    }

    #[test]
    fn matmul_small() {
        let g = Graph::new();
        let a = g
            .constant(shape(&[2, 2]), DType::F64, &[1.0, 2.0, 3.0, 4.0])
            .unwrap();
        let b = g
            .constant(shape(&[2, 2]), DType::F64, &[5.0, 6.0, 7.0, 8.0])
            .unwrap();
        let c = g.binary(Opcode::Matmul, a, b).unwrap();
        let mut interp = Interpreter::default();
        let out = interp.evaluate_one(&g, c).unwrap();
        assert_eq!(out, vec![19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn reduce_sum_middle_axis() {
        let g = Graph::new();
        let a = g
            .constant(shape(&[2, 3]), DType::F64, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
            .unwrap();
        let mut at = AttrMap::new();
        at.insert(attr_keys::RDIMS, Attr::RankSet([0].into()));
        let r = g.func(Opcode::ReduceSum, vec![a], at).unwrap();
        assert_eq!(g.shape(r).dims(), &[1, 3]);
        let mut interp = Interpreter::default();
        assert_eq!(interp.evaluate_one(&g, r).unwrap(), vec![5.0, 7.0, 9.0]);
    }

    #[test]
    fn slice_then_pad_round_trip_zeroes_margin() {
        let g = Graph::new();
        let a = g
            .constant(shape(&[4]), DType::F64, &[1.0, 2.0, 3.0, 4.0])
            .unwrap();
        let mut at = AttrMap::new();
        at.insert(attr_keys::EXTENTS, Attr::DimPairs(vec![(1, 2)]));
        let s = g.func(Opcode::Slice, vec![a], at).unwrap();
        let mut pt = AttrMap::new();
        pt.insert(attr_keys::PADDINGS, Attr::DimPairs(vec![(1, 1)]));
        let p = g.func(Opcode::Pad, vec![s], pt).unwrap();
        let mut interp = Interpreter::default();
        assert_eq!(
            interp.evaluate_one(&g, p).unwrap(),
            vec![0.0, 2.0, 3.0, 0.0]
        );
    }

    #[test]
    fn stride_scatter_inverse_positions() {
        let g = Graph::new();
        let a = g
            .constant(shape(&[5]), DType::F64, &[1.0, 2.0, 3.0, 4.0, 5.0])
            .unwrap();
        let mut at = AttrMap::new();
        at.insert(attr_keys::INCRS, Attr::Dims(vec![2]));
        let s = g.func(Opcode::Stride, vec![a], at).unwrap();
        assert_eq!(g.shape(s).dims(), &[3]);
        let mut st = AttrMap::new();
        st.insert(attr_keys::SHAPE, Attr::Dims(vec![5]));
        st.insert(attr_keys::INCRS, Attr::Dims(vec![2]));
        let sc = g.func(Opcode::Scatter, vec![s], st).unwrap();
        let mut interp = Interpreter::default();
        assert_eq!(
            interp.evaluate_one(&g, sc).unwrap(),
            vec![1.0, 0.0, 3.0, 0.0, 5.0]
        );
    }

    #[test]
    fn conv_valid_correlation() {
        let g = Graph::new();
        let x = g
            .constant(shape(&[4]), DType::F64, &[1.0, 2.0, 3.0, 4.0])
            .unwrap();
        let k = g.constant(shape(&[2]), DType::F64, &[1.0, 0.5]).unwrap();
        let c = g.binary(Opcode::Conv, x, k).unwrap();
        let mut interp = Interpreter::default();
        assert_eq!(interp.evaluate_one(&g, c).unwrap(), vec![2.0, 3.5, 5.0]);
    }

    #[test]
    fn placeholder_requires_binding() {
        let g = Graph::new();
        let p = g.placeholder(shape(&[2]), DType::F64);
        let n = g.unary(Opcode::Neg, p).unwrap();
        let mut interp = Interpreter::default();
        assert_eq!(
            interp.evaluate(&g, &[n]),
            Err(EvalError::UnboundPlaceholder(p))
        );
        interp.bind(p, vec![1.0, -2.0]);
        assert_eq!(interp.evaluate_one(&g, n).unwrap(), vec![-1.0, 2.0]);
    }
}
