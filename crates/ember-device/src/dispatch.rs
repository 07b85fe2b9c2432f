// Workgroup dispatch — the device side of every kernel
//
// Outputs are split into workgroups of `wg` consecutive elements (or one
// row / one lane where that is the natural unit) and the workgroups run in
// parallel on the rayon pool. Inside a workgroup each element is computed
// by the same per-element helper the host path uses, in the same order, so
// results match the host bit for bit.
//
// Reductions whose contributions would race on one output element
// (`sum_to`) run as a single workgroup.

use rayon::prelude::*;

use ember_core::backend::{BinaryOp, ScalarOp, UnaryOp};
use ember_core::kernels;
use ember_core::{Layout, Result, Shape};

//  Element-wise

pub(crate) fn unary(op: UnaryOp, x: &[f32], out: &mut [f32], wg: usize) {
    out.par_chunks_mut(wg).enumerate().for_each(|(g, chunk)| {
        let base = g * wg;
        for (i, o) in chunk.iter_mut().enumerate() {
            *o = op.apply(x[base + i]);
        }
    });
}

pub(crate) fn unary_inplace(op: UnaryOp, x: &mut [f32], wg: usize) {
    x.par_chunks_mut(wg)
        .for_each(|chunk| kernels::unary_inplace(op, chunk));
}

pub(crate) fn binary(op: BinaryOp, a: &[f32], b: &[f32], out: &mut [f32], wg: usize) {
    out.par_chunks_mut(wg).enumerate().for_each(|(g, chunk)| {
        let base = g * wg;
        for (i, o) in chunk.iter_mut().enumerate() {
            *o = op.apply(a[base + i], b[base + i]);
        }
    });
}

pub(crate) fn binary_inplace(op: BinaryOp, a: &mut [f32], b: &[f32], wg: usize) {
    a.par_chunks_mut(wg)
        .zip(b.par_chunks(wg))
        .for_each(|(x, y)| kernels::binary_inplace(op, x, y));
}

pub(crate) fn scalar(op: ScalarOp, x: &[f32], s: f32, out: &mut [f32], wg: usize) {
    out.par_chunks_mut(wg).enumerate().for_each(|(g, chunk)| {
        let base = g * wg;
        for (i, o) in chunk.iter_mut().enumerate() {
            *o = op.apply(x[base + i], s);
        }
    });
}

pub(crate) fn scalar_inplace(op: ScalarOp, x: &mut [f32], s: f32, wg: usize) {
    x.par_chunks_mut(wg)
        .for_each(|chunk| kernels::scalar_inplace(op, chunk, s));
}

pub(crate) fn fill(x: &mut [f32], value: f32, wg: usize) {
    x.par_chunks_mut(wg)
        .for_each(|chunk| kernels::fill(chunk, value));
}

//  Lanes

/// One output element per lane.
pub(crate) fn sum_dim(x: &[f32], shape: &Shape, dim: usize, out: &mut [f32], wg: usize) -> Result<()> {
    let (_, extent, inner) = shape.lanes(dim)?;
    out.par_chunks_mut(wg).enumerate().for_each(|(g, chunk)| {
        let base = g * wg;
        for (i, o) in chunk.iter_mut().enumerate() {
            let lane = base + i;
            *o = kernels::sum_lane(x, kernels::lane_start(lane, extent, inner), extent, inner);
        }
    });
    Ok(())
}

/// Scatter a lane-major scratch buffer back to strided positions.
fn scatter_lanes(scratch: &[f32], extent: usize, inner: usize, out: &mut [f32]) {
    for (lane, values) in scratch.chunks(extent).enumerate() {
        let start = kernels::lane_start(lane, extent, inner);
        for (j, v) in values.iter().enumerate() {
            out[start + j * inner] = *v;
        }
    }
}

/// One workgroup per lane.
pub(crate) fn softmax(x: &[f32], shape: &Shape, dim: usize, out: &mut [f32]) -> Result<()> {
    let (outer, extent, inner) = shape.lanes(dim)?;
    let mut scratch = vec![0.0f32; outer * extent * inner];
    scratch
        .par_chunks_mut(extent)
        .enumerate()
        .for_each(|(lane, dst)| {
            let start = kernels::lane_start(lane, extent, inner);
            kernels::softmax_lane(x, start, extent, inner, dst);
        });
    scatter_lanes(&scratch, extent, inner, out);
    Ok(())
}

pub(crate) fn softmax_grad(
    y: &[f32],
    grad: &[f32],
    shape: &Shape,
    dim: usize,
    out: &mut [f32],
) -> Result<()> {
    let (outer, extent, inner) = shape.lanes(dim)?;
    let mut scratch = vec![0.0f32; outer * extent * inner];
    scratch
        .par_chunks_mut(extent)
        .enumerate()
        .for_each(|(lane, dst)| {
            let start = kernels::lane_start(lane, extent, inner);
            kernels::softmax_grad_lane(y, grad, start, extent, inner, dst);
        });
    scatter_lanes(&scratch, extent, inner, out);
    Ok(())
}

/// Each `inner`-sized slice of the output copies one slice of `grad`.
pub(crate) fn expand_sum_grad(grad: &[f32], input_shape: &Shape, dim: usize, out: &mut [f32]) -> Result<()> {
    let (_, extent, inner) = input_shape.lanes(dim)?;
    out.par_chunks_mut(inner).enumerate().for_each(|(c, dst)| {
        let o = c / extent;
        dst.copy_from_slice(&grad[o * inner..(o + 1) * inner]);
    });
    Ok(())
}

//  Matrix kernels (one workgroup per output row)

pub(crate) fn matmul(a: &[f32], b: &[f32], m: usize, k: usize, n: usize, out: &mut [f32]) {
    debug_assert_eq!(out.len(), m * n);
    out.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
        for (j, o) in row.iter_mut().enumerate() {
            *o = kernels::matmul_cell(0.0, a, b, i, j, k, n);
        }
    });
}

pub(crate) fn add_matmul(base: &mut [f32], a: &[f32], b: &[f32], k: usize, n: usize) {
    base.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
        for (j, o) in row.iter_mut().enumerate() {
            *o = kernels::matmul_cell(*o, a, b, i, j, k, n);
        }
    });
}

pub(crate) fn add_matvec(base: &mut [f32], matrix: &[f32], vector: &[f32], cols: usize, wg: usize) {
    base.par_chunks_mut(wg).enumerate().for_each(|(g, chunk)| {
        let first = g * wg;
        for (i, o) in chunk.iter_mut().enumerate() {
            *o = kernels::matvec_cell(*o, matrix, vector, first + i, cols);
        }
    });
}

pub(crate) fn triu(x: &mut [f32], cols: usize, k: i64) {
    x.par_chunks_mut(cols).enumerate().for_each(|(row, values)| {
        for (col, v) in values.iter_mut().enumerate() {
            if !kernels::triu_keeps(row, col, k) {
                *v = 0.0;
            }
        }
    });
}

//  Data movement

pub(crate) fn gather(x: &[f32], layout: &Layout, out: &mut [f32], wg: usize) {
    let indices: Vec<usize> = layout.strided_indices().collect();
    out.par_chunks_mut(wg).enumerate().for_each(|(g, chunk)| {
        let base = g * wg;
        for (i, o) in chunk.iter_mut().enumerate() {
            *o = x[indices[base + i]];
        }
    });
}

/// Single workgroup: contributions land on shared outputs in row-major order.
pub(crate) fn sum_to(grad: &[f32], from: &Shape, to: &Shape) -> Result<Vec<f32>> {
    kernels::sum_to(grad, from, to)
}
