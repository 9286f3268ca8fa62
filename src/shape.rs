//! Aligned shape model and flat-index/coordinate mapping.
//!
//! A `Shape` is an ordered sequence of up to [`RANK_CAP`] positive dimension
//! sizes; every slot beyond the declared rank is an implicit 1. Shapes are
//! immutable after construction, and construction rejects zero dimensions.
//!
//! Row-major layout: the last declared dimension varies fastest in the flat
//! index produced by [`index`] and inverted by [`coordinate`].

use thiserror::Error;

/// Maximum number of dimensions in a shape or coordinate.
pub const RANK_CAP: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
    #[error("cannot create shape with zero dimension: {dims:?}")]
    ZeroDim { dims: Vec<usize> },
    #[error("shape rank {rank} exceeds cap {RANK_CAP}")]
    RankOverflow { rank: usize },
    #[error("dimension index {idx} out of range (cap {RANK_CAP})")]
    RankOutOfRange { idx: usize },
    #[error("byte buffer length {len} is not a multiple of element width {width}")]
    ByteLength { len: usize, width: usize },
}

/// An aligned shape: `dims[i]` is the number of elements along dimension `i`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape {
    dims: Vec<usize>,
    /// Bitmask over rank positions marking group starts. Bit `i` set means a
    /// new contiguous group begins at dimension `i`; matrix and contraction
    /// ops treat each group as one logical axis (batch vs algebraic dims).
    group_mask: u8,
}

impl Shape {
    /// Builds a shape from explicit dimensions. Fails on any zero dimension
    /// or on more than [`RANK_CAP`] dimensions.
    pub fn new(dims: Vec<usize>) -> Result<Self, ShapeError> {
        if dims.len() > RANK_CAP {
            return Err(ShapeError::RankOverflow { rank: dims.len() });
        }
        if dims.iter().any(|&d| d == 0) {
            return Err(ShapeError::ZeroDim { dims });
        }
        Ok(Shape {
            dims,
            group_mask: 0,
        })
    }

    /// A rank-0 (scalar) shape.
    pub fn scalar() -> Self {
        Shape::default()
    }

    /// Attaches a group partition bitmask. Bit `i` marks a group boundary
    /// starting at dimension `i`.
    pub fn with_groups(mut self, group_mask: u8) -> Self {
        self.group_mask = group_mask;
        self
    }

    pub fn group_mask(&self) -> u8 {
        self.group_mask
    }

    /// Contiguous group ranges implied by the group mask. With a zero mask
    /// the whole shape is one group.
    pub fn groups(&self) -> Vec<std::ops::Range<usize>> {
        let rank = self.rank();
        if rank == 0 {
            return vec![];
        }
        let mut starts = vec![0];
        for i in 1..rank {
            if self.group_mask & (1 << i) != 0 {
                starts.push(i);
            }
        }
        starts.push(rank);
        starts.windows(2).map(|w| w[0]..w[1]).collect()
    }

    /// Count of explicitly declared dimensions.
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Dimension size at `idx`; implicit 1 beyond the declared rank.
    ///
    /// # Panics
    ///
    /// Panics when `idx >= RANK_CAP`; indexing past the cap is caller misuse.
    pub fn at(&self, idx: usize) -> usize {
        assert!(idx < RANK_CAP, "dimension index {idx} out of range");
        self.dims.get(idx).copied().unwrap_or(1)
    }

    /// Total number of elements (product of declared dims).
    pub fn n_elems(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Dimension list with trailing 1s trimmed.
    pub fn narrow(&self) -> Vec<usize> {
        let mut out = self.dims.clone();
        while out.last() == Some(&1) {
            out.pop();
        }
        out
    }

    /// True when the first `idx` dimensions match `other`'s.
    pub fn compatible_before(&self, other: &Shape, idx: usize) -> bool {
        (0..idx.min(RANK_CAP)).all(|i| self.at(i) == other.at(i))
    }

    /// True when dimensions `[idx, RANK_CAP)` match `other`'s. Pass 0 to
    /// compare entire shapes (up to implicit 1 padding).
    pub fn compatible_after(&self, other: &Shape, idx: usize) -> bool {
        (idx..RANK_CAP).all(|i| self.at(i) == other.at(i))
    }
}

impl std::fmt::Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

/// Converts a flat index into a per-dimension coordinate (row-major, last
/// declared dimension fastest). Recomputed on every call; nothing is cached.
pub fn coordinate(shape: &Shape, mut flat: usize) -> Vec<usize> {
    let rank = shape.rank();
    let mut coord = vec![0usize; rank];
    for i in (0..rank).rev() {
        let d = shape.at(i);
        coord[i] = flat % d;
        flat /= d;
    }
    coord
}

/// Exact inverse of [`coordinate`]. Coordinates beyond the declared rank are
/// ignored; coordinates are taken modulo the dimension so broadcast callers
/// may pass oversized indices along size-1 dims.
pub fn index(shape: &Shape, coord: &[usize]) -> usize {
    let rank = shape.rank();
    let mut flat = 0usize;
    for i in 0..rank {
        let d = shape.at(i);
        let c = coord.get(i).copied().unwrap_or(0) % d;
        flat = flat * d + c;
    }
    flat
}
