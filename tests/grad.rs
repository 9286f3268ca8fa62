//! Numeric gradient checks: every differentiable opcode's analytic gradient
//! must agree with a central finite difference on randomized inputs.

use std::collections::BTreeSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rstest::rstest;

use tangent::graph::{attr_keys, Attr, AttrMap, Graph, NodeId, Opcode};
use tangent::prelude::*;
use tangent::Shape;

const FD_STEP: f64 = 1e-5;
const TOLERANCE: f64 = 1e-4;

fn shape(dims: &[usize]) -> Shape {
    Shape::new(dims.to_vec()).unwrap()
}

fn rand_values(rng: &mut StdRng, n: usize, lo: f64, hi: f64) -> Vec<f64> {
    (0..n).map(|_| lo + (hi - lo) * rng.gen::<f64>()).collect()
}

/// Sums `y` down to a scalar so the supergradient seed is well defined.
fn scalar_loss(g: &Graph, y: NodeId) -> NodeId {
    let rank = g.shape(y).rank();
    let rdims: BTreeSet<usize> = (0..rank).collect();
    let mut attrs = AttrMap::new();
    attrs.insert(attr_keys::RDIMS, Attr::RankSet(rdims));
    g.func(Opcode::ReduceSum, vec![y], attrs).unwrap()
}

/// Compares `derive(loss, x)` against a central finite difference of the
/// loss with respect to every element of `x`.
fn check_gradient(g: &Graph, y: NodeId, x: NodeId, base: &[f64]) {
    let loss = scalar_loss(g, y);
    let dx = derive(g, loss, x).unwrap();
    let mut interp = Interpreter::default();
    let analytic = interp.evaluate_one(g, dx).unwrap();
    assert_eq!(analytic.len(), base.len());

    for i in 0..base.len() {
        let mut plus = base.to_vec();
        plus[i] += FD_STEP;
        interp.bind(x, plus);
        let up = interp.evaluate_one(g, loss).unwrap()[0];

        let mut minus = base.to_vec();
        minus[i] -= FD_STEP;
        interp.bind(x, minus);
        let down = interp.evaluate_one(g, loss).unwrap()[0];

        let numeric = (up - down) / (2.0 * FD_STEP);
        let scale = numeric.abs().max(1.0);
        assert!(
            (analytic[i] - numeric).abs() / scale < TOLERANCE,
            "element {i}: analytic {} vs numeric {numeric}",
            analytic[i]
        );
    }
}

#[rstest]
#[case::identity(Opcode::Identity)]
#[case::neg(Opcode::Neg)]
#[case::abs(Opcode::Abs)]
#[case::sin(Opcode::Sin)]
#[case::cos(Opcode::Cos)]
#[case::tan(Opcode::Tan)]
#[case::exp(Opcode::Exp)]
#[case::log(Opcode::Log)]
#[case::sqrt(Opcode::Sqrt)]
#[case::square(Opcode::Square)]
#[case::cube(Opcode::Cube)]
#[case::sigmoid(Opcode::Sigmoid)]
#[case::tanh(Opcode::Tanh)]
fn unary_elementwise(#[case] opcode: Opcode) {
    let mut rng = StdRng::seed_from_u64(7);
    let g = Graph::new();
    // positive inputs keep log/sqrt in-domain and abs away from the kink
    let base = rand_values(&mut rng, 6, 0.2, 1.4);
    let x = g.variable(shape(&[3, 2]), DType::F64, &base).unwrap();
    let y = g.unary(opcode, x).unwrap();
    check_gradient(&g, y, x, &base);
}

#[rstest]
#[case::pow(Opcode::Pow)]
#[case::sub(Opcode::Sub)]
#[case::div(Opcode::Div)]
#[case::min(Opcode::Min)]
#[case::max(Opcode::Max)]
fn binary_elementwise_both_arguments(#[case] opcode: Opcode) {
    let mut rng = StdRng::seed_from_u64(11);
    let g = Graph::new();
    let lhs = rand_values(&mut rng, 4, 0.3, 1.2);
    let rhs = rand_values(&mut rng, 4, 1.3, 2.2);
    let a = g.variable(shape(&[2, 2]), DType::F64, &lhs).unwrap();
    let b = g.variable(shape(&[2, 2]), DType::F64, &rhs).unwrap();
    let y = g.binary(opcode, a, b).unwrap();
    check_gradient(&g, y, a, &lhs);
    check_gradient(&g, y, b, &rhs);
}

#[test]
fn nary_mul_each_argument() {
    let mut rng = StdRng::seed_from_u64(13);
    let g = Graph::new();
    let vals: Vec<Vec<f64>> = (0..3).map(|_| rand_values(&mut rng, 4, 0.5, 1.5)).collect();
    let args: Vec<NodeId> = vals
        .iter()
        .map(|v| g.variable(shape(&[4]), DType::F64, v).unwrap())
        .collect();
    let y = g.func(Opcode::Mul, args.clone(), AttrMap::new()).unwrap();
    for (arg, base) in args.iter().zip(&vals) {
        check_gradient(&g, y, *arg, base);
    }
}

#[test]
fn select_routes_gradient_by_condition() {
    let g = Graph::new();
    let cond = g
        .constant(shape(&[4]), DType::F64, &[1.0, 0.0, 1.0, 0.0])
        .unwrap();
    let av = vec![1.0, 2.0, 3.0, 4.0];
    let bv = vec![5.0, 6.0, 7.0, 8.0];
    let a = g.variable(shape(&[4]), DType::F64, &av).unwrap();
    let b = g.variable(shape(&[4]), DType::F64, &bv).unwrap();
    let y = g
        .func(Opcode::Select, vec![cond, a, b], AttrMap::new())
        .unwrap();
    check_gradient(&g, y, a, &av);
    check_gradient(&g, y, b, &bv);
}

#[rstest]
#[case::sum(Opcode::ReduceSum)]
#[case::prod(Opcode::ReduceProd)]
#[case::max(Opcode::ReduceMax)]
#[case::min(Opcode::ReduceMin)]
fn reductions(#[case] opcode: Opcode) {
    let mut rng = StdRng::seed_from_u64(17);
    let g = Graph::new();
    // distinct values keep max/min ties out of the finite difference
    let mut base = rand_values(&mut rng, 6, 0.4, 1.6);
    base.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let x = g.variable(shape(&[3, 2]), DType::F64, &base).unwrap();
    let mut attrs = AttrMap::new();
    attrs.insert(attr_keys::RDIMS, Attr::RankSet([1].into()));
    let y = g.func(opcode, vec![x], attrs).unwrap();
    check_gradient(&g, y, x, &base);
}

#[test]
fn extend_adjoint_reduces() {
    let mut rng = StdRng::seed_from_u64(19);
    let g = Graph::new();
    let base = rand_values(&mut rng, 3, 0.2, 1.0);
    let x = g.variable(shape(&[3]), DType::F64, &base).unwrap();
    let mut attrs = AttrMap::new();
    attrs.insert(attr_keys::FACTORS, Attr::Dims(vec![1, 4]));
    let y = g.func(Opcode::Extend, vec![x], attrs).unwrap();
    assert_eq!(g.shape(y).dims(), &[3, 4]);
    check_gradient(&g, y, x, &base);
}

#[test]
fn permute_inverse_order() {
    let mut rng = StdRng::seed_from_u64(23);
    let g = Graph::new();
    let base = rand_values(&mut rng, 24, 0.1, 1.0);
    let x = g.variable(shape(&[2, 3, 4]), DType::F64, &base).unwrap();
    let mut attrs = AttrMap::new();
    attrs.insert(attr_keys::ORDER, Attr::Ranks(vec![2, 0, 1]));
    let y = g.func(Opcode::Permute, vec![x], attrs).unwrap();
    assert_eq!(g.shape(y).dims(), &[4, 2, 3]);
    check_gradient(&g, y, x, &base);
}

#[test]
fn reshape_round_trips() {
    let mut rng = StdRng::seed_from_u64(29);
    let g = Graph::new();
    let base = rand_values(&mut rng, 6, 0.1, 1.0);
    let x = g.variable(shape(&[3, 2]), DType::F64, &base).unwrap();
    let mut attrs = AttrMap::new();
    attrs.insert(attr_keys::SHAPE, Attr::Dims(vec![6]));
    let y = g.func(Opcode::Reshape, vec![x], attrs).unwrap();
    check_gradient(&g, y, x, &base);
}

#[test]
fn concat_each_argument() {
    let mut rng = StdRng::seed_from_u64(31);
    let g = Graph::new();
    let av = rand_values(&mut rng, 6, 0.1, 1.0);
    let bv = rand_values(&mut rng, 9, 0.1, 1.0);
    let a = g.variable(shape(&[3, 2]), DType::F64, &av).unwrap();
    let b = g.variable(shape(&[3, 3]), DType::F64, &bv).unwrap();
    let mut attrs = AttrMap::new();
    attrs.insert(attr_keys::AXIS, Attr::Rank(1));
    let y = g.func(Opcode::Concat, vec![a, b], attrs).unwrap();
    assert_eq!(g.shape(y).dims(), &[3, 5]);
    check_gradient(&g, y, a, &av);
    check_gradient(&g, y, b, &bv);
}

#[test]
fn slice_and_pad() {
    let mut rng = StdRng::seed_from_u64(37);
    let g = Graph::new();
    let base = rand_values(&mut rng, 12, 0.1, 1.0);
    let x = g.variable(shape(&[4, 3]), DType::F64, &base).unwrap();

    let mut sat = AttrMap::new();
    sat.insert(attr_keys::EXTENTS, Attr::DimPairs(vec![(1, 2), (0, 2)]));
    let sliced = g.func(Opcode::Slice, vec![x], sat).unwrap();
    assert_eq!(g.shape(sliced).dims(), &[2, 2]);
    check_gradient(&g, sliced, x, &base);

    let mut pat = AttrMap::new();
    pat.insert(attr_keys::PADDINGS, Attr::DimPairs(vec![(1, 1), (2, 0)]));
    let padded = g.func(Opcode::Pad, vec![x], pat).unwrap();
    assert_eq!(g.shape(padded).dims(), &[6, 5]);
    check_gradient(&g, padded, x, &base);
}

#[test]
fn stride_and_scatter() {
    let mut rng = StdRng::seed_from_u64(41);
    let g = Graph::new();
    let base = rand_values(&mut rng, 10, 0.1, 1.0);
    let x = g.variable(shape(&[5, 2]), DType::F64, &base).unwrap();

    let mut sat = AttrMap::new();
    sat.insert(attr_keys::INCRS, Attr::Dims(vec![2, 1]));
    let strided = g.func(Opcode::Stride, vec![x], sat).unwrap();
    assert_eq!(g.shape(strided).dims(), &[3, 2]);
    check_gradient(&g, strided, x, &base);

    let mut tat = AttrMap::new();
    tat.insert(attr_keys::SHAPE, Attr::Dims(vec![9, 2]));
    tat.insert(attr_keys::INCRS, Attr::Dims(vec![2, 1]));
    let scattered = g.func(Opcode::Scatter, vec![x], tat).unwrap();
    assert_eq!(g.shape(scattered).dims(), &[9, 2]);
    check_gradient(&g, scattered, x, &base);
}

#[test]
fn reverse_is_self_adjoint() {
    let mut rng = StdRng::seed_from_u64(43);
    let g = Graph::new();
    let base = rand_values(&mut rng, 6, 0.1, 1.0);
    let x = g.variable(shape(&[3, 2]), DType::F64, &base).unwrap();
    let mut attrs = AttrMap::new();
    attrs.insert(attr_keys::RDIMS, Attr::RankSet([0].into()));
    let y = g.func(Opcode::Reverse, vec![x], attrs).unwrap();
    check_gradient(&g, y, x, &base);
}

#[test]
fn matmul_both_arguments() {
    let mut rng = StdRng::seed_from_u64(47);
    let g = Graph::new();
    let av = rand_values(&mut rng, 6, 0.1, 1.0);
    let bv = rand_values(&mut rng, 12, 0.1, 1.0);
    let a = g.variable(shape(&[2, 3]), DType::F64, &av).unwrap();
    let b = g.variable(shape(&[3, 4]), DType::F64, &bv).unwrap();
    let y = g.binary(Opcode::Matmul, a, b).unwrap();
    check_gradient(&g, y, a, &av);
    check_gradient(&g, y, b, &bv);
}

#[test]
fn contract_both_arguments() {
    let mut rng = StdRng::seed_from_u64(53);
    let g = Graph::new();
    let av = rand_values(&mut rng, 6, 0.1, 1.0);
    let bv = rand_values(&mut rng, 24, 0.1, 1.0);
    let a = g.variable(shape(&[2, 3]), DType::F64, &av).unwrap();
    let b = g.variable(shape(&[3, 4, 2]), DType::F64, &bv).unwrap();
    let mut attrs = AttrMap::new();
    attrs.insert(attr_keys::PAIRS, Attr::RankPairs(vec![(1, 0), (0, 2)]));
    let y = g.func(Opcode::Contract, vec![a, b], attrs).unwrap();
    assert_eq!(g.shape(y).dims(), &[4]);
    check_gradient(&g, y, a, &av);
    check_gradient(&g, y, b, &bv);
}

#[test]
fn conv_input_and_kernel() {
    let mut rng = StdRng::seed_from_u64(59);
    let g = Graph::new();
    let xv = rand_values(&mut rng, 20, 0.1, 1.0);
    let kv = rand_values(&mut rng, 6, 0.1, 1.0);
    let x = g.variable(shape(&[5, 4]), DType::F64, &xv).unwrap();
    let k = g.variable(shape(&[2, 3]), DType::F64, &kv).unwrap();
    let y = g.binary(Opcode::Conv, x, k).unwrap();
    assert_eq!(g.shape(y).dims(), &[4, 2]);
    check_gradient(&g, y, x, &xv);
    check_gradient(&g, y, k, &kv);
}

#[test]
fn add_gradient_is_ones_of_the_operand_shape() {
    let g = Graph::new();
    let a = g.variable(shape(&[3, 2]), DType::F64, &[0.5; 6]).unwrap();
    let b = g.variable(shape(&[3, 2]), DType::F64, &[1.5; 6]).unwrap();
    let s = g.binary(Opcode::Add, a, b).unwrap();
    let da = derive(&g, s, a).unwrap();
    assert_eq!(g.shape(da).dims(), &[3, 2]);
    let mut interp = Interpreter::default();
    assert_eq!(interp.evaluate_one(&g, da).unwrap(), vec![1.0; 6]);
}

#[test]
fn reduce_sum_gradient_is_extend_over_the_reduced_axis() {
    let g = Graph::new();
    let a = g.variable(shape(&[3, 2]), DType::F64, &[2.0; 6]).unwrap();
    let mut attrs = AttrMap::new();
    attrs.insert(attr_keys::RDIMS, Attr::RankSet([1].into()));
    let c = g.func(Opcode::ReduceSum, vec![a], attrs).unwrap();
    assert_eq!(g.shape(c).dims(), &[3]);
    let da = derive(&g, c, a).unwrap();
    assert_eq!(g.opcode(da), Some(Opcode::Extend));
    assert_eq!(g.shape(da).dims(), &[3, 2]);
    match g.attrs(da).get(attr_keys::FACTORS) {
        Some(Attr::Dims(factors)) => assert_eq!(factors, &vec![1, 2]),
        other => panic!("unexpected factors attribute: {other:?}"),
    }
}

#[test]
fn matmul_gradient_shape_and_freivald_identity() {
    let mut rng = StdRng::seed_from_u64(61);
    let g = Graph::new();
    let av = rand_values(&mut rng, 6, -1.0, 1.0);
    let bv = rand_values(&mut rng, 12, -1.0, 1.0);
    let a = g.variable(shape(&[2, 3]), DType::F64, &av).unwrap();
    let b = g.variable(shape(&[3, 4]), DType::F64, &bv).unwrap();
    let c = g.binary(Opcode::Matmul, a, b).unwrap();

    let loss = scalar_loss(&g, c);
    let da = derive(&g, loss, a).unwrap();
    assert_eq!(g.shape(da).dims(), g.shape(a).dims());

    // Freivald check on the forward product: A(Br) == Cr for random r
    let rv = rand_values(&mut rng, 4, -1.0, 1.0);
    let r = g.variable(shape(&[4, 1]), DType::F64, &rv).unwrap();
    let br = g.binary(Opcode::Matmul, b, r).unwrap();
    let abr = g.binary(Opcode::Matmul, a, br).unwrap();
    let cr = g.binary(Opcode::Matmul, c, r).unwrap();
    let mut interp = Interpreter::default();
    let lhs = interp.evaluate_one(&g, abr).unwrap();
    let rhs = interp.evaluate_one(&g, cr).unwrap();
    for (l, r) in lhs.iter().zip(&rhs) {
        assert!((l - r).abs() < 1e-9, "{l} vs {r}");
    }
}

#[test]
fn gradient_through_a_composite_expression() {
    // loss = sum(sigmoid(W @ x + c)); checks rule composition end to end
    let mut rng = StdRng::seed_from_u64(67);
    let g = Graph::new();
    let wv = rand_values(&mut rng, 6, -0.5, 0.5);
    let xv = rand_values(&mut rng, 3, -0.5, 0.5);
    let cv = rand_values(&mut rng, 2, -0.5, 0.5);
    let w = g.variable(shape(&[2, 3]), DType::F64, &wv).unwrap();
    let x = g.variable(shape(&[3, 1]), DType::F64, &xv).unwrap();
    let c = g.variable(shape(&[2, 1]), DType::F64, &cv).unwrap();
    let wx = g.binary(Opcode::Matmul, w, x).unwrap();
    let z = g.binary(Opcode::Add, wx, c).unwrap();
    let y = g.unary(Opcode::Sigmoid, z).unwrap();
    check_gradient(&g, y, w, &wv);
    check_gradient(&g, y, x, &xv);
    check_gradient(&g, y, c, &cv);
}
