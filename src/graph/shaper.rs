//! Per-opcode shape and type inference.
//!
//! One shape function per opcode, selected by a single exhaustive match.
//! Each runs exactly once, at functor construction; the resulting shape is
//! frozen on the node and never recomputed.

use std::collections::BTreeSet;

use crate::dtype::DType;
use crate::graph::graph::ConstructionError;
use crate::graph::node::{attr_keys, Attr, AttrMap};
use crate::graph::op::Opcode;
use crate::shape::{Shape, RANK_CAP};

fn get_attr<'a>(
    opcode: Opcode,
    attrs: &'a AttrMap,
    key: &'static str,
) -> Result<&'a Attr, ConstructionError> {
    attrs
        .get(key)
        .ok_or(ConstructionError::MissingAttr { opcode, key })
}

fn ranks_attr(
    opcode: Opcode,
    attrs: &AttrMap,
    key: &'static str,
) -> Result<Vec<usize>, ConstructionError> {
    match get_attr(opcode, attrs, key)? {
        Attr::Ranks(r) => Ok(r.clone()),
        _ => Err(ConstructionError::BadAttr {
            opcode,
            key,
            reason: "expected rank list".into(),
        }),
    }
}

fn rank_set_attr(
    opcode: Opcode,
    attrs: &AttrMap,
    key: &'static str,
) -> Result<BTreeSet<usize>, ConstructionError> {
    match get_attr(opcode, attrs, key)? {
        Attr::RankSet(r) => Ok(r.clone()),
        _ => Err(ConstructionError::BadAttr {
            opcode,
            key,
            reason: "expected rank set".into(),
        }),
    }
}

fn dims_attr(
    opcode: Opcode,
    attrs: &AttrMap,
    key: &'static str,
) -> Result<Vec<usize>, ConstructionError> {
    match get_attr(opcode, attrs, key)? {
        Attr::Dims(d) => Ok(d.clone()),
        _ => Err(ConstructionError::BadAttr {
            opcode,
            key,
            reason: "expected dimension list".into(),
        }),
    }
}

fn dim_pairs_attr(
    opcode: Opcode,
    attrs: &AttrMap,
    key: &'static str,
) -> Result<Vec<(usize, usize)>, ConstructionError> {
    match get_attr(opcode, attrs, key)? {
        Attr::DimPairs(p) => Ok(p.clone()),
        _ => Err(ConstructionError::BadAttr {
            opcode,
            key,
            reason: "expected dimension pairs".into(),
        }),
    }
}

fn rank_pairs_attr(
    opcode: Opcode,
    attrs: &AttrMap,
    key: &'static str,
) -> Result<Vec<(usize, usize)>, ConstructionError> {
    match get_attr(opcode, attrs, key)? {
        Attr::RankPairs(p) => Ok(p.clone()),
        _ => Err(ConstructionError::BadAttr {
            opcode,
            key,
            reason: "expected rank pairs".into(),
        }),
    }
}

fn shape_from_trimmed(mut dims: Vec<usize>) -> Result<Shape, ConstructionError> {
    while dims.last() == Some(&1) {
        dims.pop();
    }
    Ok(Shape::new(dims)?)
}

fn require_same_shapes(
    opcode: Opcode,
    args: &[(&Shape, DType)],
) -> Result<(), ConstructionError> {
    let first = args[0].0;
    for (shape, _) in &args[1..] {
        if !first.compatible_after(shape, 0) {
            return Err(ConstructionError::ShapeMismatch {
                opcode,
                lhs: first.clone(),
                rhs: (*shape).clone(),
            });
        }
    }
    Ok(())
}

/// The clamped `(offset, extent)` list a SLICE functor actually applies,
/// mirroring the clamping the evaluator and gradient rules rely on.
pub fn clamped_extents(shape: &Shape, extents: &[(usize, usize)]) -> Vec<(usize, usize)> {
    let rank = shape.rank();
    let mut out = Vec::with_capacity(rank);
    for i in 0..rank {
        let d = shape.at(i);
        let (offset, extent) = extents.get(i).copied().unwrap_or((0, d));
        let offset = offset.min(d - 1);
        let extent = extent.min(d - offset);
        out.push((offset, extent));
    }
    out
}

/// Computes the frozen output shape and type for a functor under
/// construction. Fails fast on any attribute, shape, or type inconsistency.
pub fn infer(
    opcode: Opcode,
    args: &[(&Shape, DType)],
    attrs: &AttrMap,
) -> Result<(Shape, DType), ConstructionError> {
    use Opcode::*;
    let dtype = args[0].1;
    // every opcode in the enumeration requires type-uniform arguments
    for (_, dt) in &args[1..] {
        if *dt != dtype {
            return Err(ConstructionError::TypeMismatch {
                opcode,
                lhs: dtype,
                rhs: *dt,
            });
        }
    }
    let arg0 = args[0].0;
    let shape = match opcode {
        Identity | Round | Neg | Abs | Sin | Cos | Tan | Exp | Log | Sqrt | Square | Cube
        | Sigmoid | Tanh => arg0.clone(),
        Pow | Sub | Div | Min | Max | Eq | Neq | Lt | Gt | RandUnif | Add | Mul | Select
        | Assign | AssignAdd | AssignSub => {
            require_same_shapes(opcode, args)?;
            arg0.clone()
        }
        ReduceSum | ReduceProd | ReduceMax | ReduceMin | ArgMax => {
            let rdims = rank_set_attr(opcode, attrs, attr_keys::RDIMS)?;
            if let Some(&r) = rdims.iter().find(|&&r| r >= RANK_CAP) {
                return Err(ConstructionError::BadAttr {
                    opcode,
                    key: attr_keys::RDIMS,
                    reason: format!("rank {r} out of range"),
                });
            }
            if opcode == ArgMax && rdims.len() != 1 {
                return Err(ConstructionError::BadAttr {
                    opcode,
                    key: attr_keys::RDIMS,
                    reason: "argmax reduces exactly one dimension".into(),
                });
            }
            let mut dims = arg0.dims().to_vec();
            for &r in &rdims {
                if r < dims.len() {
                    dims[r] = 1;
                }
            }
            shape_from_trimmed(dims)?
        }
        Extend => {
            let factors = dims_attr(opcode, attrs, attr_keys::FACTORS)?;
            if factors.iter().any(|&f| f == 0) || factors.len() > RANK_CAP {
                return Err(ConstructionError::BadAttr {
                    opcode,
                    key: attr_keys::FACTORS,
                    reason: "factors must be positive and within rank cap".into(),
                });
            }
            let n = factors.len().max(arg0.rank());
            let mut dims = Vec::with_capacity(n);
            for i in 0..n {
                let factor = factors.get(i).copied().unwrap_or(1);
                let d = arg0.at(i);
                if factor > 1 && d != 1 {
                    return Err(ConstructionError::BadAttr {
                        opcode,
                        key: attr_keys::FACTORS,
                        reason: format!("dimension {i} of size {d} cannot be broadcast"),
                    });
                }
                dims.push(d * factor);
            }
            shape_from_trimmed(dims)?
        }
        Permute => {
            let order = ranks_attr(opcode, attrs, attr_keys::ORDER)?;
            let n = order.len();
            if n < arg0.rank() || n > RANK_CAP {
                return Err(ConstructionError::BadAttr {
                    opcode,
                    key: attr_keys::ORDER,
                    reason: format!("order of length {n} does not cover rank {}", arg0.rank()),
                });
            }
            let mut seen = vec![false; n];
            for &o in &order {
                if o >= n || seen[o] {
                    return Err(ConstructionError::BadAttr {
                        opcode,
                        key: attr_keys::ORDER,
                        reason: format!("{order:?} is not a permutation"),
                    });
                }
                seen[o] = true;
            }
            shape_from_trimmed(order.iter().map(|&o| arg0.at(o)).collect())?
        }
        Reshape => {
            let dims = dims_attr(opcode, attrs, attr_keys::SHAPE)?;
            let out = Shape::new(dims)?;
            if out.n_elems() != arg0.n_elems() {
                return Err(ConstructionError::ElemMismatch {
                    opcode,
                    expected: arg0.n_elems(),
                    got: out.n_elems(),
                });
            }
            out
        }
        Concat => {
            let axis = match get_attr(opcode, attrs, attr_keys::AXIS)? {
                Attr::Rank(a) => *a,
                _ => {
                    return Err(ConstructionError::BadAttr {
                        opcode,
                        key: attr_keys::AXIS,
                        reason: "expected a single rank".into(),
                    })
                }
            };
            if axis >= RANK_CAP {
                return Err(ConstructionError::BadAttr {
                    opcode,
                    key: attr_keys::AXIS,
                    reason: format!("axis {axis} out of range"),
                });
            }
            let mut total = 0;
            for (shape, _) in args {
                for i in 0..RANK_CAP {
                    if i != axis && shape.at(i) != arg0.at(i) {
                        return Err(ConstructionError::ShapeMismatch {
                            opcode,
                            lhs: arg0.clone(),
                            rhs: (*shape).clone(),
                        });
                    }
                }
                total += shape.at(axis);
            }
            let rank = args
                .iter()
                .map(|(s, _)| s.rank())
                .max()
                .unwrap_or(0)
                .max(axis + 1);
            let mut dims: Vec<usize> = (0..rank).map(|i| arg0.at(i)).collect();
            dims[axis] = total;
            shape_from_trimmed(dims)?
        }
        Slice => {
            let extents = dim_pairs_attr(opcode, attrs, attr_keys::EXTENTS)?;
            if extents.len() > RANK_CAP {
                return Err(ConstructionError::BadAttr {
                    opcode,
                    key: attr_keys::EXTENTS,
                    reason: "extent list exceeds rank cap".into(),
                });
            }
            let clamped = clamped_extents(arg0, &extents);
            shape_from_trimmed(clamped.iter().map(|&(_, e)| e).collect())?
        }
        Pad => {
            let paddings = dim_pairs_attr(opcode, attrs, attr_keys::PADDINGS)?;
            if paddings.len() > RANK_CAP {
                return Err(ConstructionError::BadAttr {
                    opcode,
                    key: attr_keys::PADDINGS,
                    reason: "padding list exceeds rank cap".into(),
                });
            }
            let n = paddings.len().max(arg0.rank());
            let mut dims = Vec::with_capacity(n);
            for i in 0..n {
                let (before, after) = paddings.get(i).copied().unwrap_or((0, 0));
                dims.push(arg0.at(i) + before + after);
            }
            shape_from_trimmed(dims)?
        }
        Stride => {
            let incrs = dims_attr(opcode, attrs, attr_keys::INCRS)?;
            if incrs.iter().any(|&s| s == 0) || incrs.len() > RANK_CAP {
                return Err(ConstructionError::BadAttr {
                    opcode,
                    key: attr_keys::INCRS,
                    reason: "increments must be positive and within rank cap".into(),
                });
            }
            let mut dims = arg0.dims().to_vec();
            for (i, d) in dims.iter_mut().enumerate() {
                let s = incrs.get(i).copied().unwrap_or(1);
                *d = d.div_ceil(s);
            }
            shape_from_trimmed(dims)?
        }
        Scatter => {
            let target = dims_attr(opcode, attrs, attr_keys::SHAPE)?;
            let incrs = dims_attr(opcode, attrs, attr_keys::INCRS)?;
            if incrs.iter().any(|&s| s == 0) {
                return Err(ConstructionError::BadAttr {
                    opcode,
                    key: attr_keys::INCRS,
                    reason: "increments must be positive".into(),
                });
            }
            let out = Shape::new(target)?;
            for i in 0..RANK_CAP {
                let s = incrs.get(i).copied().unwrap_or(1);
                if out.at(i).div_ceil(s) != arg0.at(i) {
                    return Err(ConstructionError::BadAttr {
                        opcode,
                        key: attr_keys::SHAPE,
                        reason: format!(
                            "target dimension {i} ({}) does not stride back to {}",
                            out.at(i),
                            arg0.at(i)
                        ),
                    });
                }
            }
            out
        }
        Reverse => {
            let rdims = rank_set_attr(opcode, attrs, attr_keys::RDIMS)?;
            if let Some(&r) = rdims.iter().find(|&&r| r >= RANK_CAP) {
                return Err(ConstructionError::BadAttr {
                    opcode,
                    key: attr_keys::RDIMS,
                    reason: format!("rank {r} out of range"),
                });
            }
            arg0.clone()
        }
        Matmul => {
            let a = arg0;
            let b = args[1].0;
            let n = a.rank().max(b.rank()).max(2);
            // leading dims are batch; the trailing 2-D block is algebraic
            let batch_ok = (0..n - 2).all(|i| a.at(i) == b.at(i));
            if !batch_ok || a.at(n - 1) != b.at(n - 2) {
                return Err(ConstructionError::ShapeMismatch {
                    opcode,
                    lhs: a.clone(),
                    rhs: b.clone(),
                });
            }
            let mut dims: Vec<usize> = (0..n - 2).map(|i| a.at(i)).collect();
            dims.push(a.at(n - 2));
            dims.push(b.at(n - 1));
            let shape = Shape::new(dims)?;
            if n > 2 {
                shape.with_groups(1 << (n - 2))
            } else {
                shape
            }
        }
        Contract => {
            let pairs = rank_pairs_attr(opcode, attrs, attr_keys::PAIRS)?;
            let a = arg0;
            let b = args[1].0;
            let mut lseen = vec![false; a.rank()];
            let mut rseen = vec![false; b.rank()];
            for &(l, r) in &pairs {
                if l >= a.rank() || r >= b.rank() || lseen[l] || rseen[r] {
                    return Err(ConstructionError::BadAttr {
                        opcode,
                        key: attr_keys::PAIRS,
                        reason: format!("invalid contraction pairs {pairs:?}"),
                    });
                }
                if a.at(l) != b.at(r) {
                    return Err(ConstructionError::ShapeMismatch {
                        opcode,
                        lhs: a.clone(),
                        rhs: b.clone(),
                    });
                }
                lseen[l] = true;
                rseen[r] = true;
            }
            let mut dims = Vec::new();
            for (i, seen) in lseen.iter().enumerate() {
                if !seen {
                    dims.push(a.at(i));
                }
            }
            for (i, seen) in rseen.iter().enumerate() {
                if !seen {
                    dims.push(b.at(i));
                }
            }
            if dims.len() > RANK_CAP {
                return Err(ConstructionError::BadAttr {
                    opcode,
                    key: attr_keys::PAIRS,
                    reason: "contraction result exceeds rank cap".into(),
                });
            }
            Shape::new(dims)?
        }
        Conv => {
            let kern = args[1].0;
            if kern.narrow().len() > arg0.rank() {
                return Err(ConstructionError::ShapeMismatch {
                    opcode,
                    lhs: arg0.clone(),
                    rhs: kern.clone(),
                });
            }
            let mut dims = Vec::with_capacity(arg0.rank());
            for i in 0..arg0.rank() {
                let k = kern.at(i);
                if k > arg0.at(i) {
                    return Err(ConstructionError::ShapeMismatch {
                        opcode,
                        lhs: arg0.clone(),
                        rhs: kern.clone(),
                    });
                }
                dims.push(arg0.at(i) - k + 1);
            }
            shape_from_trimmed(dims)?
        }
    };
    Ok((shape, dtype))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(dims: &[usize]) -> Shape {
        Shape::new(dims.to_vec()).unwrap()
    }

    #[test]
    fn reduce_collapses_and_trims() {
        let mut attrs = AttrMap::new();
        attrs.insert(
            attr_keys::RDIMS,
            Attr::RankSet(std::iter::once(1).collect()),
        );
        let (s, _) = infer(
            Opcode::ReduceSum,
            &[(&shape(&[3, 2]), DType::F32)],
            &attrs,
        )
        .unwrap();
        assert_eq!(s.dims(), &[3]);
    }

    #[test]
    fn extend_multiplies_unit_dims() {
        let mut attrs = AttrMap::new();
        attrs.insert(attr_keys::FACTORS, Attr::Dims(vec![1, 2]));
        let (s, _) = infer(Opcode::Extend, &[(&shape(&[3]), DType::F32)], &attrs).unwrap();
        assert_eq!(s.dims(), &[3, 2]);

        // broadcasting a non-unit dim is rejected
        attrs.insert(attr_keys::FACTORS, Attr::Dims(vec![2]));
        assert!(infer(Opcode::Extend, &[(&shape(&[3]), DType::F32)], &attrs).is_err());
    }

    #[test]
    fn extend_rejects_zero_factor() {
        let mut attrs = AttrMap::new();
        attrs.insert(attr_keys::FACTORS, Attr::Dims(vec![1, 0]));
        assert!(matches!(
            infer(Opcode::Extend, &[(&shape(&[3]), DType::F32)], &attrs),
            Err(ConstructionError::BadAttr {
                key: attr_keys::FACTORS,
                ..
            })
        ));
    }

    #[test]
    fn matmul_batched() {
        let (s, _) = infer(
            Opcode::Matmul,
            &[(&shape(&[5, 2, 3]), DType::F64), (&shape(&[5, 3, 4]), DType::F64)],
            &AttrMap::new(),
        )
        .unwrap();
        assert_eq!(s.dims(), &[5, 2, 4]);
        assert_eq!(s.groups(), vec![0..1, 1..3]);
    }

    #[test]
    fn matmul_inner_mismatch() {
        assert!(infer(
            Opcode::Matmul,
            &[(&shape(&[2, 3]), DType::F32), (&shape(&[4, 5]), DType::F32)],
            &AttrMap::new(),
        )
        .is_err());
    }

    #[test]
    fn contract_concatenates_free_dims() {
        let mut attrs = AttrMap::new();
        attrs.insert(attr_keys::PAIRS, Attr::RankPairs(vec![(1, 0)]));
        let (s, _) = infer(
            Opcode::Contract,
            &[(&shape(&[2, 3]), DType::F32), (&shape(&[3, 4, 5]), DType::F32)],
            &attrs,
        )
        .unwrap();
        assert_eq!(s.dims(), &[2, 4, 5]);
    }

    #[test]
    fn conv_valid_window() {
        let (s, _) = infer(
            Opcode::Conv,
            &[(&shape(&[5, 6]), DType::F32), (&shape(&[2, 3]), DType::F32)],
            &AttrMap::new(),
        )
        .unwrap();
        assert_eq!(s.dims(), &[4, 4]);
    }

    #[test]
    fn type_mismatch_rejected() {
        assert!(infer(
            Opcode::Add,
            &[(&shape(&[2]), DType::F32), (&shape(&[2]), DType::F64)],
            &AttrMap::new(),
        )
        .is_err());
    }
}
