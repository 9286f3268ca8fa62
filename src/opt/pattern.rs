//! Rule-driven subgraph rewriting with built-in constant folding.
//!
//! A [`RewriteRule`] pairs a source [`Pattern`] with a target builder
//! closure. Rules are validated when loaded, before any graph is touched.
//! [`Rewriter`] applies every rule plus constant folding in rounds until a
//! round changes nothing or the round budget runs out; replacement is always
//! graph-wide, every parent edge of a matched root is redirected.

use log::{debug, trace};
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::eval::Evaluator;
use crate::graph::graph::{graph_eq, Graph};
use crate::graph::node::{NodeData, NodeId, Usage};
use crate::graph::op::Opcode;
use crate::graph::traversal::postorder;
use crate::opt::OptimizeError;

/// Rounds applied before the fixed-point loop gives up. Bounds runtime for
/// non-confluent rule sets.
pub const ROUND_BUDGET: usize = 50;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RewriteRuleError {
    #[error("rule {name:?}: pattern root must be an opcode node")]
    RootNotOp { name: String },
    #[error("rule {name:?}: {opcode} cannot take {got} pattern argument(s)")]
    Arity {
        name: String,
        opcode: Opcode,
        got: usize,
    },
}

/// A source pattern tree.
#[derive(Debug, Clone)]
pub enum Pattern {
    /// Matches a functor with this opcode and exactly these argument
    /// patterns, in order.
    Op(Opcode, Vec<Pattern>),
    /// Matches any node.
    Wildcard,
    /// Matches any node and binds it. A name bound twice must match
    /// structurally equal subgraphs.
    Capture(&'static str),
    /// Matches an immutable leaf whose every element equals the value.
    Const(f64),
}

/// Bindings produced by a successful match.
pub type Captures = FxHashMap<&'static str, NodeId>;

type Builder = Box<dyn Fn(&Graph, &Captures) -> Result<NodeId, OptimizeError>>;

/// A named (pattern, target builder) pair.
pub struct RewriteRule {
    pub name: String,
    pattern: Pattern,
    builder: Builder,
}

impl RewriteRule {
    /// Validates the pattern eagerly; a malformed rule never reaches a graph.
    pub fn new(
        name: impl Into<String>,
        pattern: Pattern,
        builder: impl Fn(&Graph, &Captures) -> Result<NodeId, OptimizeError> + 'static,
    ) -> Result<Self, RewriteRuleError> {
        let name = name.into();
        if !matches!(pattern, Pattern::Op(..)) {
            return Err(RewriteRuleError::RootNotOp { name });
        }
        validate(&name, &pattern)?;
        Ok(RewriteRule {
            name,
            pattern,
            builder: Box::new(builder),
        })
    }

    /// Tries this rule at `id`, building the replacement on a match.
    pub fn apply(&self, graph: &Graph, id: NodeId) -> Result<Option<NodeId>, OptimizeError> {
        let mut captures = Captures::default();
        if !matches(graph, id, &self.pattern, &mut captures) {
            return Ok(None);
        }
        trace!("rule {:?} matched at {id}", self.name);
        (self.builder)(graph, &captures).map(Some)
    }
}

fn validate(name: &str, pattern: &Pattern) -> Result<(), RewriteRuleError> {
    if let Pattern::Op(opcode, args) = pattern {
        if !opcode.arity().accepts(args.len()) {
            return Err(RewriteRuleError::Arity {
                name: name.to_string(),
                opcode: *opcode,
                got: args.len(),
            });
        }
        for arg in args {
            validate(name, arg)?;
        }
    }
    Ok(())
}

fn matches(graph: &Graph, id: NodeId, pattern: &Pattern, captures: &mut Captures) -> bool {
    match pattern {
        Pattern::Wildcard => true,
        Pattern::Capture(name) => match captures.get(name) {
            Some(&bound) => graph_eq(graph, bound, id),
            None => {
                captures.insert(*name, id);
                true
            }
        },
        Pattern::Const(value) => match &*graph.node(id) {
            NodeData::Leaf {
                dtype,
                usage: Usage::Constant,
                data,
                ..
            } => dtype
                .decode(data)
                .map(|vals| vals.iter().all(|v| v == value))
                .unwrap_or(false),
            _ => false,
        },
        Pattern::Op(opcode, pargs) => {
            let (op, args) = match &*graph.node(id) {
                NodeData::Func { opcode, args, .. } => (*opcode, args.clone()),
                NodeData::Leaf { .. } => return false,
            };
            op == *opcode
                && args.len() == pargs.len()
                && args
                    .iter()
                    .zip(pargs)
                    .all(|(&a, p)| matches(graph, a, p, captures))
        }
    }
}

/// The fixed-point rewrite driver.
pub struct Rewriter {
    rules: Vec<RewriteRule>,
    budget: usize,
}

impl Rewriter {
    pub fn new(rules: Vec<RewriteRule>) -> Self {
        Rewriter {
            rules,
            budget: ROUND_BUDGET,
        }
    }

    pub fn with_budget(mut self, budget: usize) -> Self {
        self.budget = budget;
        self
    }

    /// Rewrites to a fixed point (or until the round budget runs out) and
    /// returns the surviving handles for `roots`.
    ///
    /// Each round applies, at every reachable node, constant folding first
    /// and then the loaded rules in order; all replacements found in a round
    /// are rewired together at its end. A round with no replacement stops the
    /// loop; absence of a match is never an error.
    pub fn rewrite(
        &self,
        graph: &Graph,
        roots: &[NodeId],
        evaluator: &mut dyn Evaluator,
    ) -> Result<Vec<NodeId>, OptimizeError> {
        let mut roots = roots.to_vec();
        for round in 0..self.budget {
            let moved = self.round(graph, &roots, evaluator)?;
            if moved.is_empty() {
                debug!("rewrite reached a fixed point after {round} round(s)");
                return Ok(roots);
            }
            graph.rewire(&moved);
            for root in roots.iter_mut() {
                *root = Graph::resolve(&moved, *root);
            }
        }
        debug!("rewrite stopped at the {}-round budget", self.budget);
        Ok(roots)
    }

    fn round(
        &self,
        graph: &Graph,
        roots: &[NodeId],
        evaluator: &mut dyn Evaluator,
    ) -> Result<FxHashMap<NodeId, NodeId>, OptimizeError> {
        let mut moved: FxHashMap<NodeId, NodeId> = FxHashMap::default();
        for id in postorder(graph, roots) {
            if moved.contains_key(&id) {
                continue;
            }
            if let Some(folded) = fold_constant(graph, id, evaluator)? {
                moved.insert(id, folded);
                continue;
            }
            for rule in &self.rules {
                if let Some(replacement) = rule.apply(graph, id)? {
                    if replacement != id {
                        debug!("rule {:?} replaced {id} with {replacement}", rule.name);
                        moved.insert(id, replacement);
                    }
                    break;
                }
            }
        }
        Ok(moved)
    }
}

/// Folds a functor whose arguments are all immutable leaves into a single
/// constant leaf holding the evaluated result.
///
/// Random draws and assignments never fold; their value is not a pure
/// function of their arguments.
pub fn fold_constant(
    graph: &Graph,
    id: NodeId,
    evaluator: &mut dyn Evaluator,
) -> Result<Option<NodeId>, OptimizeError> {
    let foldable = {
        let data = graph.node(id);
        match &*data {
            NodeData::Func { opcode, args, .. } => {
                !matches!(
                    opcode,
                    Opcode::RandUnif | Opcode::Assign | Opcode::AssignAdd | Opcode::AssignSub
                ) && args.iter().all(|&a| graph.node(a).is_constant())
            }
            NodeData::Leaf { .. } => false,
        }
    };
    if !foldable {
        return Ok(None);
    }
    let values = evaluator.evaluate(graph, &[id])?.remove(0);
    let (shape, dtype) = (graph.shape(id), graph.dtype(id));
    let folded = graph.constant(shape, dtype, &values)?;
    trace!("folded {id} into constant {folded}");
    Ok(Some(folded))
}
