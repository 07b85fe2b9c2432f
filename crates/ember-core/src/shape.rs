use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// Shape — N-dimensional extents and the validation rules built on them
//
// A Shape lists the size of every axis, outermost first:
//   - Vector: Shape([5])         — 1 axis, 5 elements
//   - Matrix: Shape([3, 4])      — 2 axes, 12 elements
//   - Batch:  Shape([2, 3, 4])   — 3 axes, 24 elements
//
// Ember never broadcasts implicitly. Elementwise kernels demand identical
// shapes (same rank AND the same extent on every axis: [2, 3] and [3, 2]
// have the same size but are still a mismatch). The only way to grow a
// tensor is an explicit expand, which is validated by `expand_strides`.

/// N-dimensional shape of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
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

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements (product of all dimensions).
    pub fn elem_count(&self) -> usize {
        self.0.iter().product::<usize>()
    }

    /// Size of a specific dimension.
    pub fn dim(&self, d: usize) -> Result<usize> {
        self.0.get(d).copied().ok_or(Error::DimOutOfRange {
            dim: d,
            rank: self.rank(),
        })
    }

    /// Total number of elements, or `None` when the product overflows `usize`.
    pub fn checked_elem_count(&self) -> Option<usize> {
        self.0.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }

    /// Reject shapes with no axes, with a zero-length axis, or whose element
    /// count does not fit in `usize`.
    pub fn validate(&self) -> Result<()> {
        if self.0.is_empty() || self.0.contains(&0) || self.checked_elem_count().is_none() {
            return Err(Error::InvalidShape(self.clone()));
        }
        Ok(())
    }

    /// Row-major strides: the last axis has stride 1, every preceding axis
    /// strides over the product of the extents that follow it.
    ///
    /// For shape [2, 3, 4] the strides are [12, 4, 1].
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

    /// Split the shape around `dim` into (outer, extent, inner) element counts.
    ///
    /// Any reduction along one axis walks `outer * inner` lanes of `extent`
    /// elements each, consecutive lane elements being `inner` apart.
    pub fn lanes(&self, dim: usize) -> Result<(usize, usize, usize)> {
        let extent = self.dim(dim)?;
        let outer = self.0[..dim].iter().product::<usize>();
        let inner = self.0[dim + 1..].iter().product::<usize>();
        Ok((outer, extent, inner))
    }

    /// The shape left after summing away `dim`. A rank-1 shape reduces to `[1]`.
    pub fn reduce_dim(&self, dim: usize) -> Result<Shape> {
        self.dim(dim)?;
        let mut dims = self.0.clone();
        dims.remove(dim);
        if dims.is_empty() {
            dims.push(1);
        }
        Ok(Shape(dims))
    }

    /// Strides that read `self` as if it had shape `target`.
    ///
    /// Axes are aligned from the right. An axis of extent 1 stretched to a
    /// larger extent, and every missing leading axis, gets stride 0 so the
    /// single element repeats. Any other disagreement is a `ShapeMismatch`.
    pub fn expand_strides(&self, target: &Shape) -> Result<Vec<usize>> {
        let src = self.dims();
        let dst = target.dims();
        if src.len() > dst.len() {
            return Err(Error::ShapeMismatch {
                expected: target.clone(),
                got: self.clone(),
            });
        }
        let src_strides = self.stride_contiguous();
        let offset = dst.len() - src.len();
        let mut strides = vec![0usize; dst.len()];
        for i in 0..src.len() {
            if src[i] == dst[i + offset] {
                strides[i + offset] = src_strides[i];
            } else if src[i] != 1 {
                return Err(Error::ShapeMismatch {
                    expected: target.clone(),
                    got: self.clone(),
                });
            }
        }
        Ok(strides)
    }
}

/// Elementwise operands must agree in rank and in every axis extent.
pub fn validate_elementwise(lhs: &Shape, rhs: &Shape) -> Result<()> {
    if lhs != rhs {
        return Err(Error::ShapeMismatch {
            expected: lhs.clone(),
            got: rhs.clone(),
        });
    }
    Ok(())
}

/// Matrix product operands must both be 2-D with `lhs[1] == rhs[0]`.
/// Returns `(m, k, n)` for an `[m, k] @ [k, n]` product.
pub fn validate_matmul(lhs: &Shape, rhs: &Shape) -> Result<(usize, usize, usize)> {
    for s in [lhs, rhs] {
        if s.rank() != 2 {
            return Err(Error::UnsupportedOperation {
                op: "matmul",
                rank: s.rank(),
            });
        }
    }
    let (m, k1) = (lhs.dims()[0], lhs.dims()[1]);
    let (k2, n) = (rhs.dims()[0], rhs.dims()[1]);
    if k1 != k2 {
        return Err(Error::DimensionMismatch {
            op: "matmul",
            lhs: lhs.clone(),
            rhs: rhs.clone(),
        });
    }
    Ok((m, k1, n))
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

// These let you write: Shape::from((3, 4)) instead of Shape::new(vec![3, 4])

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
