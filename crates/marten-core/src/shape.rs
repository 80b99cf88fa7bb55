use std::fmt;

use crate::error::{Error, Result};

// Shape — N-dimensional shape representation
//
//   Scalar: Shape([])          — 0 dimensions, 1 element
//   Vector: Shape([5])         — 1 dimension, 5 elements
//   Batch:  Shape([2, 3, 4])   — 3 dimensions, 24 elements
//
// The broadcast resolver lives here too. It answers three questions about a
// pair of shapes before any binary op touches memory: are they compatible,
// what is the output shape, and which output dimensions each operand has to
// be virtually replicated along.

/// N-dimensional shape of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape(Vec<usize>);

impl Shape {
    /// Create a new shape from a vector of dimension sizes.
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// The dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of dimensions (0 for scalar, 1 for vector, 2 for matrix, etc.).
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements (product of all dimensions).
    /// A scalar shape [] has 1 element.
    pub fn elem_count(&self) -> usize {
        self.0.iter().product::<usize>()
    }

    /// Row-major strides: for [2, 3, 4] this is [12, 4, 1].
    pub fn stride_contiguous(&self) -> Vec<usize> {
        let mut strides = vec![0usize; self.rank()];
        if self.rank() > 0 {
            strides[self.rank() - 1] = 1;
            for i in (0..self.rank() - 1).rev() {
                strides[i] = strides[i + 1] * self.0[i + 1];
            }
        }
        strides
    }

    /// Size of a specific dimension.
    pub fn dim(&self, d: usize) -> Result<usize> {
        self.0.get(d).copied().ok_or(Error::DimOutOfRange {
            dim: d,
            rank: self.rank(),
        })
    }

    /// Same shape with the listed dimensions set to 1 (keep-dim reduction shape).
    pub fn reduced(&self, dims: &[usize]) -> Result<Shape> {
        let mut out = self.0.clone();
        for &d in dims {
            if d >= out.len() {
                return Err(Error::DimOutOfRange {
                    dim: d,
                    rank: self.rank(),
                });
            }
            out[d] = 1;
        }
        Ok(Shape(out))
    }

    /// Output shape of broadcasting `lhs` against `rhs`.
    pub fn broadcast_shape(lhs: &Shape, rhs: &Shape) -> Result<Shape> {
        Broadcast::resolve(lhs, rhs).map(|b| b.shape)
    }
}

/// Result of resolving two shapes under trailing-aligned broadcasting.
///
/// `lhs_replicated` / `rhs_replicated` list output dimensions (indices into
/// [`Broadcast::shape`]) along which that operand is virtually repeated,
/// either because its size there is 1 or because it has fewer dimensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broadcast {
    pub shape: Shape,
    pub lhs_replicated: Vec<usize>,
    pub rhs_replicated: Vec<usize>,
}

impl Broadcast {
    /// Resolve `lhs` and `rhs`.
    ///
    /// ```text
    ///   [4, 1, 3] and [1, 5, 3] → [4, 5, 3]   lhs repeats dim 1, rhs dim 0
    ///   [3, 4]    and [4]       → [3, 4]      rhs repeats dim 0
    ///   [4, 2]    and [3]       → ShapeMismatch
    /// ```
    pub fn resolve(lhs: &Shape, rhs: &Shape) -> Result<Broadcast> {
        let l = lhs.dims();
        let r = rhs.dims();
        let rank = l.len().max(r.len());
        let mut out = vec![0usize; rank];
        let mut lhs_replicated = Vec::new();
        let mut rhs_replicated = Vec::new();

        for i in 0..rank {
            // i counts from the right; missing leading dims behave as 1
            let ld = if i < l.len() { l[l.len() - 1 - i] } else { 1 };
            let rd = if i < r.len() { r[r.len() - 1 - i] } else { 1 };
            let pos = rank - 1 - i;
            out[pos] = if ld == rd {
                ld
            } else if ld == 1 {
                lhs_replicated.push(pos);
                rd
            } else if rd == 1 {
                rhs_replicated.push(pos);
                ld
            } else {
                return Err(Error::ShapeMismatch {
                    op: "broadcast",
                    lhs: lhs.clone(),
                    rhs: rhs.clone(),
                });
            };
        }

        lhs_replicated.reverse();
        rhs_replicated.reverse();
        Ok(Broadcast {
            shape: Shape(out),
            lhs_replicated,
            rhs_replicated,
        })
    }

    /// Whether the two shapes can be broadcast together.
    pub fn compatible(lhs: &Shape, rhs: &Shape) -> bool {
        Self::resolve(lhs, rhs).is_ok()
    }

    /// Whether `src` broadcasts to exactly `target` without growing `target`.
    pub fn expands_to(src: &Shape, target: &Shape) -> bool {
        matches!(Self::resolve(src, target), Ok(b) if &b.shape == target)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

impl From<()> for Shape {
    fn from(_: ()) -> Self {
        Shape(vec![])
    }
}

impl From<usize> for Shape {
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

impl From<(usize,)> for Shape {
    fn from((d0,): (usize,)) -> Self {
        Shape(vec![d0])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape(vec![d0, d1])
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((d0, d1, d2): (usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2])
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((d0, d1, d2, d3): (usize, usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2, d3])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(a: [usize; N]) -> Self {
        Shape(a.to_vec())
    }
}

impl From<&Shape> for Shape {
    fn from(s: &Shape) -> Self {
        s.clone()
    }
}
