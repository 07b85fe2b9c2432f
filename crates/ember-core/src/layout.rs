use crate::error::{Error, Result};
use crate::shape::Shape;

// Layout — shape + strides
//
// Every tensor held by the registry is stored row-major and contiguous:
// its strides are always `shape.stride_contiguous()` and are recomputed
// whenever an operation produces a new shape.
//
// Non-contiguous layouts exist only transiently, as *read patterns* over
// an existing store:
//
//   transpose: swap shape and strides of a [r, c] matrix, then walk the
//              result in logical order to gather a fresh contiguous copy.
//   expand:    give stretched axes stride 0 so one source element is
//              read many times.
//
// Both kernels (host and device) materialize through `strided_indices`,
// which is why it must visit elements in exactly row-major logical order.

/// Layout describes how a tensor's logical shape maps to flat storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    shape: Shape,
    strides: Vec<usize>,
}

impl Layout {
    /// Contiguous row-major layout for the given shape.
    pub fn contiguous(shape: Shape) -> Self {
        let strides = shape.stride_contiguous();
        Layout { shape, strides }
    }

    /// A read pattern with explicit strides.
    pub fn strided(shape: Shape, strides: Vec<usize>) -> Self {
        debug_assert_eq!(shape.rank(), strides.len());
        Layout { shape, strides }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
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

    /// Whether the strides match the default row-major layout.
    pub fn is_contiguous(&self) -> bool {
        self.strides == self.shape.stride_contiguous()
    }

    /// Swap two axes. No data moves; only the read pattern changes.
    ///
    /// [2, 3] with strides [3, 1] → [3, 2] with strides [1, 3]
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Layout> {
        let rank = self.rank();
        if dim0 >= rank || dim1 >= rank {
            return Err(Error::DimOutOfRange {
                dim: dim0.max(dim1),
                rank,
            });
        }
        let mut dims = self.shape.dims().to_vec();
        let mut strides = self.strides.clone();
        dims.swap(dim0, dim1);
        strides.swap(dim0, dim1);
        Ok(Layout::strided(Shape::new(dims), strides))
    }

    /// Read this (contiguous) layout as if it had the larger shape `target`.
    pub fn expand(&self, target: &Shape) -> Result<Layout> {
        let strides = self.shape.expand_strides(target)?;
        Ok(Layout::strided(target.clone(), strides))
    }

    /// flat_index = sum(index[i] * stride[i])
    pub fn flat_index(&self, index: &[usize]) -> usize {
        index
            .iter()
            .zip(self.strides.iter())
            .map(|(i, s)| i * s)
            .sum()
    }

    /// Iterator over all flat indices of this layout, in logical order.
    pub fn strided_indices(&self) -> StridedIter {
        StridedIter::new(self)
    }
}

/// Yields the storage index of each logical element of a Layout.
///
/// For a contiguous layout this counts 0, 1, 2, ...; for a transposed or
/// expanded one it jumps around (or repeats) following the strides.
pub struct StridedIter {
    current: Vec<usize>,
    dims: Vec<usize>,
    strides: Vec<usize>,
    remaining: usize,
    started: bool,
}

impl StridedIter {
    fn new(layout: &Layout) -> Self {
        StridedIter {
            current: vec![0; layout.rank()],
            dims: layout.dims().to_vec(),
            strides: layout.strides().to_vec(),
            remaining: layout.elem_count(),
            started: false,
        }
    }

    fn flat_index(&self) -> usize {
        self.current
            .iter()
            .zip(self.strides.iter())
            .map(|(i, s)| i * s)
            .sum()
    }

    /// Advance the multi-dimensional index by one (rightmost dimension first).
    fn advance(&mut self) {
        for i in (0..self.dims.len()).rev() {
            self.current[i] += 1;
            if self.current[i] < self.dims[i] {
                return;
            }
            self.current[i] = 0;
        }
    }
}

impl Iterator for StridedIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        if self.started {
            self.advance();
        }
        self.started = true;
        self.remaining -= 1;
        Some(self.flat_index())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for StridedIter {}
