//! Structural-signature common-subexpression elimination.
//!
//! Two passes over the reachable subgraph. Pass 1 computes node heights;
//! pass 2 assigns interned content signatures in non-decreasing height order,
//! so every child's signature exists before any parent's is formed. Nodes
//! sharing a signature are merged by rewiring every incoming edge to the
//! first node seen with that signature. Equal signatures imply value
//! equality; mutable leaves sign with a fresh token, so a variable only ever
//! matches itself.

use log::debug;
use rustc_hash::FxHashMap;

use crate::graph::node::{NodeData, NodeId, Usage};
use crate::graph::traversal::GraphStat;
use crate::graph::Graph;

/// An interned signature token.
pub type Signature = u64;

/// Computes content signatures for every node reachable from `roots`.
/// Exposed separately so callers can test two handles for value-equivalence
/// without committing to a merge.
pub struct Signer {
    interned: FxHashMap<Vec<u8>, Signature>,
    next: Signature,
    sigs: FxHashMap<NodeId, Signature>,
}

impl Signer {
    pub fn new(graph: &Graph, roots: &[NodeId]) -> Self {
        let mut signer = Signer {
            interned: FxHashMap::default(),
            next: 0,
            sigs: FxHashMap::default(),
        };
        let stat = GraphStat::new(graph, roots);
        let nodes = graph.nodes.borrow();
        for id in stat.ordered() {
            let sig = match &nodes[id.0] {
                NodeData::Leaf {
                    shape,
                    dtype,
                    usage,
                    data,
                } => match usage {
                    Usage::Constant => {
                        let mut key = vec![0u8];
                        key.extend(format!("{shape}:{dtype}:").into_bytes());
                        key.extend(data);
                        signer.intern(key)
                    }
                    // mutable leaves match only themselves
                    Usage::Variable | Usage::Placeholder => signer.mint(),
                },
                NodeData::Func {
                    opcode,
                    args,
                    attrs,
                    shape,
                    ..
                } => {
                    let mut child_sigs: Vec<Signature> =
                        args.iter().map(|a| signer.sigs[a]).collect();
                    if opcode.is_commutative() {
                        child_sigs.sort_unstable();
                    }
                    let mut key = vec![1u8, *opcode as u8];
                    key.extend(format!("{shape}:{attrs:?}:").into_bytes());
                    for s in child_sigs {
                        key.extend(s.to_le_bytes());
                    }
                    signer.intern(key)
                }
            };
            signer.sigs.insert(id, sig);
        }
        signer
    }

    fn mint(&mut self) -> Signature {
        let s = self.next;
        self.next += 1;
        s
    }

    fn intern(&mut self, key: Vec<u8>) -> Signature {
        if let Some(&s) = self.interned.get(&key) {
            return s;
        }
        let s = self.mint();
        self.interned.insert(key, s);
        s
    }

    pub fn signature(&self, id: NodeId) -> Option<Signature> {
        self.sigs.get(&id).copied()
    }
}

/// Merges every signature-duplicate node into its canonical representative
/// via a single graph-wide rewiring pass.
///
/// Returns the replacement map (duplicate to representative); callers holding
/// handles to merged nodes remap them through it with [`Graph::resolve`].
pub fn merge_duplicates(graph: &Graph, roots: &[NodeId]) -> FxHashMap<NodeId, NodeId> {
    let signer = Signer::new(graph, roots);
    let stat = GraphStat::new(graph, roots);
    let mut canonical: FxHashMap<Signature, NodeId> = FxHashMap::default();
    let mut moved: FxHashMap<NodeId, NodeId> = FxHashMap::default();
    for id in stat.ordered() {
        let sig = signer.sigs[&id];
        match canonical.get(&sig) {
            Some(&rep) => {
                moved.insert(id, rep);
            }
            None => {
                canonical.insert(sig, id);
            }
        }
    }
    if !moved.is_empty() {
        debug!("cse merged {} duplicate node(s)", moved.len());
        graph.rewire(&moved);
    }
    moved
}
