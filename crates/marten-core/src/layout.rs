use crate::error::{Error, Result};
use crate::shape::{Broadcast, Shape};

// Layout — how a logical shape maps onto flat storage
//
//   offset(index) = offset + Σ index[d] * strides[d]
//
// Views (transpose, permute, narrow, broadcast) only rewrite the layout, so
// they never copy. A stride of 0 repeats one element along that dimension,
// which is how a broadcast operand is read without materialising it.
//
// Destinations are held to stricter rules than sources: they may not contain
// zero-stride dimensions (two logical positions would write one slot), and
// matmul/reduction/spatial kernels additionally want them dense.

/// Layout describes how a tensor's logical shape maps to flat storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    shape: Shape,
    strides: Vec<usize>,
    offset: usize,
}

impl Layout {
    /// Row-major layout starting at offset 0.
    pub fn contiguous(shape: Shape) -> Self {
        let strides = shape.stride_contiguous();
        Layout {
            shape,
            strides,
            offset: 0,
        }
    }

    /// Layout with explicit strides and offset (for views).
    pub fn new(shape: Shape, strides: Vec<usize>, offset: usize) -> Self {
        Layout {
            shape,
            strides,
            offset,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    /// Row-major with no gaps, starting at offset 0.
    pub fn is_contiguous(&self) -> bool {
        self.offset == 0 && self.is_dense()
    }

    /// Row-major with no gaps, starting at any offset.
    ///
    /// Size-1 dimensions are ignored since their stride is never used.
    pub fn is_dense(&self) -> bool {
        let mut expected = 1usize;
        for (&d, &s) in self.dims().iter().zip(self.strides.iter()).rev() {
            if d != 1 && s != expected {
                return false;
            }
            expected *= d;
        }
        true
    }

    /// The storage range `[start, end)` covered by a dense layout.
    pub fn dense_range(&self) -> Option<(usize, usize)> {
        if self.is_dense() {
            Some((self.offset, self.offset + self.elem_count()))
        } else {
            None
        }
    }

    /// Whether some dimension of size > 1 has stride 0.
    pub fn has_broadcast_dims(&self) -> bool {
        self.dims()
            .iter()
            .zip(self.strides.iter())
            .any(|(&d, &s)| d > 1 && s == 0)
    }

    /// Storage offset of the `i`-th element in logical (row-major) order.
    #[inline]
    pub fn offset_of(&self, mut i: usize) -> usize {
        let mut off = self.offset;
        for (&d, &s) in self.dims().iter().zip(self.strides.iter()).rev() {
            off += (i % d) * s;
            i /= d;
        }
        off
    }

    /// Storage offsets of every element in logical order.
    pub fn offsets(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.elem_count()).map(move |i| self.offset_of(i))
    }

    /// Storage offset for a multi-dimensional index.
    pub fn flat_index(&self, index: &[usize]) -> usize {
        index
            .iter()
            .zip(self.strides.iter())
            .fold(self.offset, |acc, (&i, &s)| acc + i * s)
    }

    /// Swap two dimensions.
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Layout> {
        let rank = self.rank();
        if dim0 >= rank || dim1 >= rank {
            return Err(Error::DimOutOfRange {
                dim: dim0.max(dim1),
                rank,
            });
        }
        let mut dims = self.dims().to_vec();
        let mut strides = self.strides.clone();
        dims.swap(dim0, dim1);
        strides.swap(dim0, dim1);
        Ok(Layout::new(Shape::new(dims), strides, self.offset))
    }

    /// Reorder dimensions: output dim `i` is input dim `order[i]`.
    pub fn permute(&self, order: &[usize]) -> Result<Layout> {
        let rank = self.rank();
        if order.len() != rank {
            return Err(Error::RankMismatch {
                op: "permute",
                expected: rank,
                got: order.len(),
            });
        }
        let mut seen = vec![false; rank];
        for &d in order {
            if d >= rank || seen[d] {
                return Err(Error::DimOutOfRange { dim: d, rank });
            }
            seen[d] = true;
        }
        let dims = order.iter().map(|&d| self.dims()[d]).collect();
        let strides = order.iter().map(|&d| self.strides[d]).collect();
        Ok(Layout::new(Shape::new(dims), strides, self.offset))
    }

    /// Restrict `dim` to `[start, start + len)`.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Layout> {
        let rank = self.rank();
        if dim >= rank {
            return Err(Error::DimOutOfRange { dim, rank });
        }
        let dim_size = self.dims()[dim];
        if start + len > dim_size {
            return Err(Error::NarrowOutOfBounds {
                dim,
                start,
                len,
                dim_size,
            });
        }
        let mut dims = self.dims().to_vec();
        dims[dim] = len;
        Ok(Layout::new(
            Shape::new(dims),
            self.strides.clone(),
            self.offset + start * self.strides[dim],
        ))
    }

    /// Reinterpret a dense layout with a new shape of the same element count.
    pub fn reshape(&self, shape: Shape) -> Result<Layout> {
        if shape.elem_count() != self.elem_count() {
            return Err(Error::ReshapeElementMismatch {
                src_shape: self.shape.clone(),
                dst_shape: shape,
                reason: "element counts differ",
            });
        }
        if !self.is_dense() {
            return Err(Error::ReshapeElementMismatch {
                src_shape: self.shape.clone(),
                dst_shape: shape,
                reason: "source is not dense",
            });
        }
        let strides = shape.stride_contiguous();
        Ok(Layout::new(shape, strides, self.offset))
    }

    /// View this layout as `target` by repeating size-1 (or missing leading)
    /// dimensions with stride 0.
    pub fn broadcast_as(&self, target: &Shape) -> Result<Layout> {
        if !Broadcast::expands_to(&self.shape, target) {
            return Err(Error::ShapeMismatch {
                op: "broadcast_as",
                lhs: self.shape.clone(),
                rhs: target.clone(),
            });
        }
        let lead = target.rank() - self.rank();
        let mut strides = vec![0usize; target.rank()];
        for (i, (&d, &s)) in self.dims().iter().zip(self.strides.iter()).enumerate() {
            strides[lead + i] = if d == target.dims()[lead + i] { s } else { 0 };
        }
        Ok(Layout::new(target.clone(), strides, self.offset))
    }
}
