// Integration tests for the backward pass
//
// These tests build small graphs through the public API and compare the
// accumulated gradients with hand-derived values, a naive reference
// reduction, and central finite differences.

use ember::prelude::*;
use ember::Error;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn approx_eq(a: f32, b: f32, tol: f32) -> bool {
    (a - b).abs() < tol
}

fn assert_vec_approx(got: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(
        got.len(),
        expected.len(),
        "length mismatch: {} vs {}",
        got.len(),
        expected.len()
    );
    for (i, (g, e)) in got.iter().zip(expected.iter()).enumerate() {
        assert!(
            approx_eq(*g, *e, tol),
            "index {}: got {} expected {} (tol {})",
            i,
            g,
            e,
            tol
        );
    }
}

fn grad_of(ctx: &Context, id: TensorId) -> ember::Result<Vec<f32>> {
    ctx.grad_data(id)?
        .ok_or_else(|| Error::msg(format!("tensor {id} has no grad")))
}

fn random_data(rng: &mut StdRng, len: usize) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(-2.0f32..2.0)).collect()
}

// Chain rule

#[test]
fn test_chain_matches_manual_derivative() -> ember::Result<()> {
    // y = (x1 + x2) * x3
    let mut ctx = Context::new();
    let x1 = ctx.create((2, 2), Some(&[1.0, 2.0, 3.0, 4.0]), true, false)?;
    let x2 = ctx.create((2, 2), Some(&[0.5, 0.5, 0.5, 0.5]), true, false)?;
    let x3 = ctx.create((2, 2), Some(&[-1.0, 2.0, -3.0, 4.0]), true, false)?;
    let s = ctx.add(x1, x2)?;
    let y = ctx.mul(s, x3)?;
    ctx.backward(y, None)?;

    assert_eq!(grad_of(&ctx, x1)?, vec![-1.0, 2.0, -3.0, 4.0]);
    assert_eq!(grad_of(&ctx, x2)?, vec![-1.0, 2.0, -3.0, 4.0]);
    assert_eq!(grad_of(&ctx, x3)?, vec![1.5, 2.5, 3.5, 4.5]);

    let err = ctx.backward(y, None).unwrap_err();
    assert!(matches!(err, Error::DoubleBackward { .. }));
    // the failed call changed nothing
    assert_eq!(grad_of(&ctx, x3)?, vec![1.5, 2.5, 3.5, 4.5]);
    Ok(())
}

#[test]
fn test_intermediate_waits_for_every_child() -> ember::Result<()> {
    // h feeds two children; its creators only hear from it once both
    // children have delivered.
    let mut ctx = Context::new();
    let x = ctx.create(2, Some(&[1.0, 2.0]), true, false)?;
    let h = ctx.add(x, x)?;
    let a = ctx.sigmoid(h)?;
    let b = ctx.tanh(h)?;
    ctx.backward(a, None)?;
    assert_eq!(ctx.grad(x)?, None);
    assert!(ctx.grad(h)?.is_some());

    ctx.backward(b, None)?;
    let hv = ctx.data(h)?;
    let expected: Vec<f32> = hv
        .iter()
        .map(|&v| {
            let s = 1.0 / (1.0 + (-v).exp());
            let t = v.tanh();
            2.0 * (s * (1.0 - s) + (1.0 - t * t))
        })
        .collect();
    assert_vec_approx(&grad_of(&ctx, x)?, &expected, 1e-5);
    Ok(())
}

#[test]
fn test_separate_roots_accumulate_on_leaves() -> ember::Result<()> {
    let mut ctx = Context::new();
    let x = ctx.create(3, Some(&[1.0, 2.0, 3.0]), true, false)?;
    let a = ctx.from_slice(&[2.0, 2.0, 2.0], 3)?;
    let b = ctx.from_slice(&[0.5, 1.0, 1.5], 3)?;
    let y1 = ctx.mul(x, a)?;
    let y2 = ctx.mul(x, b)?;
    ctx.backward(y1, None)?;
    assert_eq!(grad_of(&ctx, x)?, vec![2.0, 2.0, 2.0]);
    ctx.backward(y2, None)?;
    assert_eq!(grad_of(&ctx, x)?, vec![2.5, 3.0, 3.5]);
    Ok(())
}

#[test]
fn test_zero_grad_starts_fresh() -> ember::Result<()> {
    let mut ctx = Context::new();
    let x = ctx.create(2, Some(&[1.0, 2.0]), true, false)?;
    ctx.backward(x, None)?;
    ctx.backward(x, None)?;
    assert_eq!(grad_of(&ctx, x)?, vec![2.0, 2.0]);
    let grad = ctx.grad(x)?.ok_or_else(|| Error::msg("missing grad"))?;
    ctx.zero_grad(x)?;
    assert!(!ctx.contains(grad));
    ctx.backward(x, None)?;
    assert_eq!(grad_of(&ctx, x)?, vec![1.0, 1.0]);
    Ok(())
}

// Gradient tensors

#[test]
fn test_grads_are_untracked_leaves() -> ember::Result<()> {
    let mut ctx = Context::new();
    let a = ctx.create((2, 2), Some(&[1.0, 2.0, 3.0, 4.0]), true, true)?;
    let b = ctx.create((2, 2), Some(&[1.0, 0.0, 0.0, 1.0]), true, true)?;
    let c = ctx.mm(a, b)?;
    let y = ctx.sigmoid(c)?;
    ctx.backward(y, None)?;

    for id in [a, b] {
        let grad = ctx.grad(id)?.ok_or_else(|| Error::msg("missing grad"))?;
        let g = ctx.get(grad)?;
        assert!(!g.autograd());
        assert!(g.is_leaf());
        assert!(g.children().is_empty());
        assert_eq!(g.grad_of(), Some(id));
        assert!(matches!(
            ctx.set_autograd(grad, true),
            Err(Error::GradHasGrad(_))
        ));
    }
    Ok(())
}

#[test]
fn test_explicit_grad_is_validated() -> ember::Result<()> {
    let mut ctx = Context::new();
    let x = ctx.create((2, 3), None, true, false)?;
    let y = ctx.exp(x)?;
    assert!(ctx.get(y)?.is_leaf());

    let tracked = ctx.create((2, 3), None, true, false)?;
    assert!(matches!(
        ctx.backward(x, Some(tracked)),
        Err(Error::GradHasGrad(_))
    ));
    let wrong = ctx.ones((3, 2))?;
    assert!(matches!(
        ctx.backward(x, Some(wrong)),
        Err(Error::ShapeMismatch { .. })
    ));
    assert_eq!(ctx.grad(x)?, None);
    Ok(())
}

// Sum gradient vs. a naive reference

/// Row-major multi-index of a flat offset.
fn unravel(mut flat: usize, dims: &[usize]) -> Vec<usize> {
    let mut index = vec![0; dims.len()];
    for d in (0..dims.len()).rev() {
        index[d] = flat % dims[d];
        flat /= dims[d];
    }
    index
}

fn ravel(index: &[usize], dims: &[usize]) -> usize {
    index.iter().zip(dims).fold(0, |acc, (i, d)| acc * d + i)
}

#[test]
fn test_sum_gradient_matches_reference() -> ember::Result<()> {
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..40 {
        let rank = rng.gen_range(1..=4);
        let dims: Vec<usize> = (0..rank).map(|_| rng.gen_range(1..=4)).collect();
        let dim = rng.gen_range(0..rank);
        let len: usize = dims.iter().product();

        let mut ctx = Context::new();
        let data = random_data(&mut rng, len);
        let x = ctx.create(dims.clone(), Some(&data), true, false)?;
        let s = ctx.sum(x, dim)?;

        let reduced = ctx.get(s)?.dims().to_vec();
        let upstream = random_data(&mut rng, reduced.iter().product());
        let g = ctx.from_slice(&upstream, reduced.clone())?;
        ctx.backward(s, Some(g))?;

        let expected: Vec<f32> = (0..len)
            .map(|flat| {
                let mut index = unravel(flat, &dims);
                index.remove(dim);
                if index.is_empty() {
                    index.push(0);
                }
                upstream[ravel(&index, &reduced)]
            })
            .collect();
        assert_eq!(grad_of(&ctx, x)?, expected, "dims {dims:?} dim {dim}");

        // the forward reduction against the same reference
        let mut sums = vec![0.0f32; reduced.iter().product()];
        for (flat, v) in data.iter().enumerate() {
            let mut index = unravel(flat, &dims);
            index.remove(dim);
            if index.is_empty() {
                index.push(0);
            }
            sums[ravel(&index, &reduced)] += v;
        }
        assert_vec_approx(&ctx.data(s)?, &sums, 1e-4);
    }
    Ok(())
}

#[test]
fn test_sum_gradient_shape_is_checked() -> ember::Result<()> {
    let mut ctx = Context::new();
    let x = ctx.create((2, 3), None, true, false)?;
    let s = ctx.sum(x, 0)?;
    let g = ctx.ones(2)?;
    assert!(matches!(
        ctx.backward(s, Some(g)),
        Err(Error::InvalidOperation(_))
    ));
    assert!(ctx.get(x)?.grad().is_none());

    // other ops keep reporting a plain shape mismatch
    let e = ctx.exp(x)?;
    let g = ctx.ones(6)?;
    assert!(matches!(
        ctx.backward(e, Some(g)),
        Err(Error::ShapeMismatch { .. })
    ));

    let g = ctx.ones(3)?;
    ctx.backward(s, Some(g))?;
    assert!(ctx.grad(x)?.is_some());
    Ok(())
}

// Finite differences

fn mlp_loss(x: &[f32], w: &[f32]) -> ember::Result<f32> {
    let mut ctx = Context::new();
    let x = ctx.from_slice(x, (2, 3))?;
    let w = ctx.from_slice(w, (3, 2))?;
    let h = ctx.mm(x, w)?;
    let a = ctx.sigmoid(h)?;
    let p = ctx.softmax(a, 1)?;
    let sq = ctx.mul(p, p)?;
    let rows = ctx.sum(sq, 1)?;
    let total = ctx.sum(rows, 0)?;
    Ok(ctx.data(total)?[0])
}

#[test]
fn test_gradients_match_finite_differences() -> ember::Result<()> {
    let mut rng = StdRng::seed_from_u64(7);
    let x_data = random_data(&mut rng, 6);
    let w_data = random_data(&mut rng, 6);

    let mut ctx = Context::new();
    let x = ctx.from_slice(&x_data, (2, 3))?;
    let w = ctx.create((3, 2), Some(&w_data), true, false)?;
    let h = ctx.mm(x, w)?;
    let a = ctx.sigmoid(h)?;
    let p = ctx.softmax(a, 1)?;
    let sq = ctx.mul(p, p)?;
    let rows = ctx.sum(sq, 1)?;
    let total = ctx.sum(rows, 0)?;
    ctx.backward(total, None)?;
    let analytic = grad_of(&ctx, w)?;

    let eps = 1e-2;
    for i in 0..w_data.len() {
        let mut plus = w_data.clone();
        plus[i] += eps;
        let mut minus = w_data.clone();
        minus[i] -= eps;
        let numeric = (mlp_loss(&x_data, &plus)? - mlp_loss(&x_data, &minus)?) / (2.0 * eps);
        assert!(
            approx_eq(analytic[i], numeric, 2e-3),
            "w[{i}]: analytic {} numeric {numeric}",
            analytic[i]
        );
    }
    Ok(())
}

// Registry hygiene

#[test]
fn test_backward_leaves_no_temporaries() -> ember::Result<()> {
    let mut ctx = Context::new();
    let x = ctx.create((2, 2), Some(&[1.0, 2.0, 3.0, 4.0]), true, false)?;
    let w = ctx.create((2, 2), Some(&[0.5, -0.5, 0.25, 1.0]), true, false)?;
    let h = ctx.mm(x, w)?;
    let t = ctx.tanh(h)?;
    let s = ctx.sum(t, 1)?;
    let before = ctx.len();
    ctx.backward(s, None)?;
    // one grad per leaf; intermediates release theirs
    assert_eq!(ctx.len(), before + 2);
    assert_eq!(ctx.grad(h)?, None);
    assert_eq!(ctx.grad(t)?, None);
    Ok(())
}

#[test]
fn test_removing_a_tensor_removes_its_grad() -> ember::Result<()> {
    let mut ctx = Context::new();
    let x = ctx.create(2, None, true, false)?;
    ctx.backward(x, None)?;
    let grad = ctx.grad(x)?.ok_or_else(|| Error::msg("missing grad"))?;
    ctx.remove(x)?;
    assert!(!ctx.contains(x));
    assert!(!ctx.contains(grad));
    assert!(ctx.is_empty());
    Ok(())
}
