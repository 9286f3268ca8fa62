//! Rewrite-engine behavior: constant folding, algebraic rules, fixed-point
//! idempotence.

use tangent::graph::{graph_eq, postorder, AttrMap, Graph, NodeData, Opcode};
use tangent::opt::{fold_constant, Pattern, RewriteRule, Rewriter};
use tangent::prelude::*;
use tangent::Shape;

fn shape(dims: &[usize]) -> Shape {
    Shape::new(dims.to_vec()).unwrap()
}

#[test]
fn all_constant_functor_folds_to_its_value() {
    let g = Graph::new();
    let a = g
        .constant(shape(&[2, 2]), DType::F64, &[1.0, 2.0, 3.0, 4.0])
        .unwrap();
    let b = g
        .constant(shape(&[2, 2]), DType::F64, &[5.0, 6.0, 7.0, 8.0])
        .unwrap();
    let m = g.binary(Opcode::Matmul, a, b).unwrap();
    let mut interp = Interpreter::default();
    let direct = interp.evaluate_one(&g, m).unwrap();

    let folded = fold_constant(&g, m, &mut interp).unwrap().unwrap();
    match &*g.node(folded) {
        NodeData::Leaf { dtype, data, .. } => {
            assert_eq!(dtype.decode(data).unwrap(), direct);
        }
        NodeData::Func { .. } => panic!("folding must produce a leaf"),
    };
}

#[test]
fn folding_cascades_through_constant_subtrees() {
    let g = Graph::new();
    let a = g.constant(shape(&[3]), DType::F64, &[1.0, 2.0, 3.0]).unwrap();
    let b = g.constant(shape(&[3]), DType::F64, &[4.0, 5.0, 6.0]).unwrap();
    let v = g.variable(shape(&[3]), DType::F64, &[1.0; 3]).unwrap();
    let sum = g.binary(Opcode::Add, a, b).unwrap();
    let sq = g.unary(Opcode::Square, sum).unwrap();
    let root = g.binary(Opcode::Mul, sq, v).unwrap();

    let rewriter = Rewriter::new(vec![]);
    let mut interp = Interpreter::default();
    let roots = rewriter.rewrite(&g, &[root], &mut interp).unwrap();
    // Mul(constant, variable): the whole constant subtree is one leaf now
    let args = g.args(roots[0]);
    assert!(g.node(args[0]).is_constant());
    assert_eq!(g.leaf_values(args[0]).unwrap(), vec![25.0, 49.0, 81.0]);
    assert_eq!(args[1], v);
}

#[test]
fn variables_are_never_folded() {
    let g = Graph::new();
    let v = g.variable(shape(&[2]), DType::F64, &[1.0, 2.0]).unwrap();
    let n = g.unary(Opcode::Neg, v).unwrap();
    let mut interp = Interpreter::default();
    assert_eq!(fold_constant(&g, n, &mut interp).unwrap(), None);
}

#[test]
fn mul_by_one_collapses_to_the_operand() {
    // the shape a derivative takes: derive(MUL(a,b), a) == b structurally
    // once the seed supergradient of ones is rewritten away
    let g = Graph::new();
    let a = g.variable(shape(&[3, 2]), DType::F64, &[2.0; 6]).unwrap();
    let b = g.variable(shape(&[3, 2]), DType::F64, &[3.0; 6]).unwrap();
    let m = g.binary(Opcode::Mul, a, b).unwrap();
    let da = derive(&g, m, a).unwrap();

    let mut interp = Interpreter::default();
    let roots = optimize(&g, &[da], default_rules(), &mut interp).unwrap();
    assert_eq!(roots[0], b);
    assert!(graph_eq(&g, roots[0], b));
}

#[test]
fn rewriting_twice_changes_nothing_more() {
    let g = Graph::new();
    let x = g.variable(shape(&[4]), DType::F64, &[1.0; 4]).unwrap();
    let one = g.constant_like(x, 1.0);
    let zero = g.constant_like(x, 0.0);
    let m = g.binary(Opcode::Mul, x, one).unwrap();
    let s = g.binary(Opcode::Add, m, zero).unwrap();
    let n = g.unary(Opcode::Neg, s).unwrap();
    let nn = g.unary(Opcode::Neg, n).unwrap();

    let rewriter = Rewriter::new(default_rules());
    let mut interp = Interpreter::default();
    let first = rewriter.rewrite(&g, &[nn], &mut interp).unwrap();
    let size_after_first = postorder(&g, &first).len();
    let second = rewriter.rewrite(&g, &first, &mut interp).unwrap();
    assert_eq!(first, second);
    assert_eq!(postorder(&g, &second).len(), size_after_first);
    assert_eq!(second[0], x);
}

#[test]
fn no_match_is_a_no_op() {
    let g = Graph::new();
    let x = g.variable(shape(&[2]), DType::F64, &[1.0, 2.0]).unwrap();
    let y = g.unary(Opcode::Sin, x).unwrap();
    let rule = RewriteRule::new(
        "never",
        Pattern::Op(Opcode::Cos, vec![Pattern::Wildcard]),
        |_, _| unreachable!("pattern cannot match this graph"),
    )
    .unwrap();
    let rewriter = Rewriter::new(vec![rule]);
    let mut interp = Interpreter::default();
    let roots = rewriter.rewrite(&g, &[y], &mut interp).unwrap();
    assert_eq!(roots, vec![y]);
}

#[test]
fn round_budget_bounds_oscillating_rules() {
    // two rules that undo each other never reach a fixed point; the budget
    // must still terminate the loop
    let g = Graph::new();
    let x = g.variable(shape(&[2]), DType::F64, &[1.0, 2.0]).unwrap();
    let root = g.unary(Opcode::Neg, x).unwrap();
    let flip = RewriteRule::new(
        "neg-to-double-neg",
        Pattern::Op(Opcode::Neg, vec![Pattern::Capture("x")]),
        |g: &Graph, caps| {
            let inner = g.unary(Opcode::Neg, caps["x"])?;
            let outer = g.unary(Opcode::Neg, inner)?;
            Ok(g.unary(Opcode::Neg, outer)?)
        },
    )
    .unwrap();
    let rewriter = Rewriter::new(vec![flip]).with_budget(5);
    let mut interp = Interpreter::default();
    let roots = rewriter.rewrite(&g, &[root], &mut interp).unwrap();
    assert_eq!(g.opcode(roots[0]), Some(Opcode::Neg));
}

#[test]
fn sub_of_equal_subgraphs_becomes_zero() {
    let g = Graph::new();
    let x = g.variable(shape(&[3]), DType::F64, &[1.0, 2.0, 3.0]).unwrap();
    let s1 = g.unary(Opcode::Sqrt, x).unwrap();
    let s2 = g.unary(Opcode::Sqrt, x).unwrap();
    let d = g.binary(Opcode::Sub, s1, s2).unwrap();
    let root = g.func(Opcode::Add, vec![d, x], AttrMap::new()).unwrap();

    let mut interp = Interpreter::default();
    let roots = optimize(&g, &[root], default_rules(), &mut interp).unwrap();
    // sqrt(x) - sqrt(x) -> 0, then x + 0 -> x
    assert_eq!(roots[0], x);
}
