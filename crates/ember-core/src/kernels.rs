// Host kernels — the reference math for every Ember operation
//
// Each function works on plain f32 slices plus the already-validated shape
// information. The registry calls the whole-array functions for host
// stores; compute devices call the per-cell / per-lane helpers
// (`matmul_cell`, `sum_lane`, `softmax_lane`, ...) from their own dispatch
// loops so both backends accumulate in the same order and agree exactly.
//
// LANES:
//
// A reduction along axis `dim` of a shape [outer.., extent, inner..] visits
// `outer * inner` independent lanes. Lane `l` starts at
//
//     (l / inner) * extent * inner + (l % inner)
//
// and its consecutive elements are `inner` apart. Lanes are numbered in the
// row-major order of the reduced shape, so lane `l` of a sum is exactly
// element `l` of its output.

use crate::backend::{BinaryOp, ScalarOp, UnaryOp};
use crate::error::Result;
use crate::layout::Layout;
use crate::shape::Shape;

//  Element-wise

pub fn unary(op: UnaryOp, x: &[f32]) -> Vec<f32> {
    x.iter().map(|&v| op.apply(v)).collect()
}

pub fn unary_inplace(op: UnaryOp, x: &mut [f32]) {
    for v in x.iter_mut() {
        *v = op.apply(*v);
    }
}

pub fn binary(op: BinaryOp, a: &[f32], b: &[f32]) -> Vec<f32> {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(&x, &y)| op.apply(x, y)).collect()
}

pub fn binary_inplace(op: BinaryOp, a: &mut [f32], b: &[f32]) {
    debug_assert_eq!(a.len(), b.len());
    for (x, &y) in a.iter_mut().zip(b.iter()) {
        *x = op.apply(*x, y);
    }
}

pub fn scalar(op: ScalarOp, x: &[f32], s: f32) -> Vec<f32> {
    x.iter().map(|&v| op.apply(v, s)).collect()
}

pub fn scalar_inplace(op: ScalarOp, x: &mut [f32], s: f32) {
    for v in x.iter_mut() {
        *v = op.apply(*v, s);
    }
}

pub fn fill(x: &mut [f32], value: f32) {
    x.iter_mut().for_each(|v| *v = value);
}

//  Lanes

/// Storage offset of the first element of lane `lane`.
#[inline]
pub fn lane_start(lane: usize, extent: usize, inner: usize) -> usize {
    (lane / inner) * extent * inner + lane % inner
}

#[inline]
pub fn sum_lane(x: &[f32], start: usize, extent: usize, step: usize) -> f32 {
    let mut acc = 0.0f32;
    for j in 0..extent {
        acc += x[start + j * step];
    }
    acc
}

/// Stable softmax of one lane, written contiguously into `dst[..extent]`.
pub fn softmax_lane(x: &[f32], start: usize, extent: usize, step: usize, dst: &mut [f32]) {
    let mut max = f32::NEG_INFINITY;
    for j in 0..extent {
        max = max.max(x[start + j * step]);
    }
    let mut total = 0.0f32;
    for j in 0..extent {
        let e = (x[start + j * step] - max).exp();
        dst[j] = e;
        total += e;
    }
    for v in dst[..extent].iter_mut() {
        *v /= total;
    }
}

/// `dst[j] = out[j] * (grad[j] - sum_k grad[k] * out[k])` for one lane.
pub fn softmax_grad_lane(
    out: &[f32],
    grad: &[f32],
    start: usize,
    extent: usize,
    step: usize,
    dst: &mut [f32],
) {
    let mut dot = 0.0f32;
    for j in 0..extent {
        let idx = start + j * step;
        dot += grad[idx] * out[idx];
    }
    for j in 0..extent {
        let idx = start + j * step;
        dst[j] = out[idx] * (grad[idx] - dot);
    }
}

pub fn sum_dim(x: &[f32], shape: &Shape, dim: usize) -> Result<Vec<f32>> {
    let (outer, extent, inner) = shape.lanes(dim)?;
    Ok((0..outer * inner)
        .map(|lane| sum_lane(x, lane_start(lane, extent, inner), extent, inner))
        .collect())
}

pub fn softmax_dim(x: &[f32], shape: &Shape, dim: usize) -> Result<Vec<f32>> {
    let (outer, extent, inner) = shape.lanes(dim)?;
    let mut out = vec![0.0f32; x.len()];
    let mut lane_buf = vec![0.0f32; extent];
    for lane in 0..outer * inner {
        let start = lane_start(lane, extent, inner);
        softmax_lane(x, start, extent, inner, &mut lane_buf);
        for (j, v) in lane_buf.iter().enumerate() {
            out[start + j * inner] = *v;
        }
    }
    Ok(out)
}

pub fn softmax_grad(out: &[f32], grad: &[f32], shape: &Shape, dim: usize) -> Result<Vec<f32>> {
    let (outer, extent, inner) = shape.lanes(dim)?;
    let mut result = vec![0.0f32; out.len()];
    let mut lane_buf = vec![0.0f32; extent];
    for lane in 0..outer * inner {
        let start = lane_start(lane, extent, inner);
        softmax_grad_lane(out, grad, start, extent, inner, &mut lane_buf);
        for (j, v) in lane_buf.iter().enumerate() {
            result[start + j * inner] = *v;
        }
    }
    Ok(result)
}

/// Replicate a gradient of the reduced shape back across `dim`.
///
/// `grad` has the shape of `input_shape` with `dim` removed; every slice of
/// the result along `dim` is a copy of it.
pub fn expand_sum_grad(grad: &[f32], input_shape: &Shape, dim: usize) -> Result<Vec<f32>> {
    let (outer, extent, inner) = input_shape.lanes(dim)?;
    let mut out = Vec::with_capacity(outer * extent * inner);
    for o in 0..outer {
        let slice = &grad[o * inner..(o + 1) * inner];
        for _ in 0..extent {
            out.extend_from_slice(slice);
        }
    }
    Ok(out)
}

//  Matrix kernels

/// One output cell of `[m, k] @ [k, n]`, accumulated onto `init` in `p` order.
#[inline]
pub fn matmul_cell(init: f32, a: &[f32], b: &[f32], i: usize, j: usize, k: usize, n: usize) -> f32 {
    let mut acc = init;
    for p in 0..k {
        acc += a[i * k + p] * b[p * n + j];
    }
    acc
}

pub fn matmul(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; m * n];
    for i in 0..m {
        for j in 0..n {
            out[i * n + j] = matmul_cell(0.0, a, b, i, j, k, n);
        }
    }
    out
}

/// `base += a @ b`.
pub fn add_matmul(base: &mut [f32], a: &[f32], b: &[f32], m: usize, k: usize, n: usize) {
    for i in 0..m {
        for j in 0..n {
            let idx = i * n + j;
            base[idx] = matmul_cell(base[idx], a, b, i, j, k, n);
        }
    }
}

#[inline]
pub fn matvec_cell(init: f32, matrix: &[f32], vector: &[f32], row: usize, cols: usize) -> f32 {
    let mut acc = init;
    for c in 0..cols {
        acc += matrix[row * cols + c] * vector[c];
    }
    acc
}

/// `base += matrix @ vector`.
pub fn add_matvec(base: &mut [f32], matrix: &[f32], vector: &[f32], rows: usize, cols: usize) {
    for r in 0..rows {
        base[r] = matvec_cell(base[r], matrix, vector, r, cols);
    }
}

/// Whether `(row, col)` survives an upper-triangular mask with offset `k`.
#[inline]
pub fn triu_keeps(row: usize, col: usize, k: i64) -> bool {
    col as i64 - row as i64 >= k
}

pub fn triu_inplace(x: &mut [f32], rows: usize, cols: usize, k: i64) {
    for r in 0..rows {
        for c in 0..cols {
            if !triu_keeps(r, c, k) {
                x[r * cols + c] = 0.0;
            }
        }
    }
}

//  Data movement

/// Materialize `x` read through `layout` into a contiguous vector.
pub fn gather(x: &[f32], layout: &Layout) -> Vec<f32> {
    layout.strided_indices().map(|idx| x[idx]).collect()
}

/// Sum a `from`-shaped gradient down to `to`, the shape it was expanded from.
///
/// Contributions are added in row-major order of `from`.
pub fn sum_to(grad: &[f32], from: &Shape, to: &Shape) -> Result<Vec<f32>> {
    let read = Layout::contiguous(to.clone()).expand(from)?;
    let mut out = vec![0.0f32; to.elem_count()];
    for (g, idx) in grad.iter().zip(read.strided_indices()) {
        out[idx] += *g;
    }
    Ok(out)
}
