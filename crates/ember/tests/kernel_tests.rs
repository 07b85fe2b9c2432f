// Integration tests for the kernel library
//
// These tests drive the public Context API end to end on the host backend:
// element-wise families, reductions, matrix kernels, triu and the shape
// validation every kernel performs before touching its operands.

use ember::prelude::*;
use ember::Error;

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

fn one_to_nine(ctx: &mut Context) -> ember::Result<TensorId> {
    let data: Vec<f32> = (1..=9).map(|v| v as f32).collect();
    ctx.from_slice(&data, (3, 3))
}

// Triu

#[test]
fn test_triu_main_diagonal() -> ember::Result<()> {
    let mut ctx = Context::new();
    let x = one_to_nine(&mut ctx)?;
    ctx.triu_(x, 0)?;
    assert_eq!(
        ctx.data(x)?,
        vec![1.0, 2.0, 3.0, 0.0, 5.0, 6.0, 0.0, 0.0, 9.0]
    );
    Ok(())
}

#[test]
fn test_triu_above_diagonal() -> ember::Result<()> {
    let mut ctx = Context::new();
    let x = one_to_nine(&mut ctx)?;
    ctx.triu_(x, 2)?;
    assert_eq!(
        ctx.data(x)?,
        vec![0.0, 0.0, 3.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]
    );
    Ok(())
}

#[test]
fn test_triu_below_diagonal() -> ember::Result<()> {
    let mut ctx = Context::new();
    let x = one_to_nine(&mut ctx)?;
    ctx.triu_(x, -1)?;
    assert_eq!(
        ctx.data(x)?,
        vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 0.0, 8.0, 9.0]
    );
    Ok(())
}

#[test]
fn test_triu_extreme_offsets() -> ember::Result<()> {
    let mut ctx = Context::new();
    let x = one_to_nine(&mut ctx)?;
    ctx.triu_(x, 100)?;
    assert_eq!(ctx.data(x)?, vec![0.0; 9]);

    let y = one_to_nine(&mut ctx)?;
    ctx.triu_(y, -100)?;
    assert_eq!(
        ctx.data(y)?,
        (1..=9).map(|v| v as f32).collect::<Vec<_>>()
    );
    Ok(())
}

#[test]
fn test_triu_out_of_place_leaves_source() -> ember::Result<()> {
    let mut ctx = Context::new();
    let x = one_to_nine(&mut ctx)?;
    let y = ctx.triu(x, 1)?;
    assert_ne!(x, y);
    assert_eq!(ctx.data(y)?, vec![0.0, 2.0, 3.0, 0.0, 0.0, 6.0, 0.0, 0.0, 0.0]);
    assert_eq!(ctx.data(x)?[3], 4.0);
    Ok(())
}

#[test]
fn test_triu_rejects_other_ranks() -> ember::Result<()> {
    let mut ctx = Context::new();
    let v = ctx.ones(4)?;
    assert!(matches!(
        ctx.triu_(v, 0),
        Err(Error::UnsupportedOperation { .. })
    ));
    let t = ctx.ones((2, 2, 2))?;
    assert!(matches!(
        ctx.triu_(t, 0),
        Err(Error::UnsupportedOperation { .. })
    ));
    assert_eq!(ctx.data(t)?, vec![1.0; 8]);
    Ok(())
}

// In-place vs out-of-place

#[test]
fn test_binary_inplace_matches_out_of_place() -> ember::Result<()> {
    let a_data = [1.5, -2.0, 3.0, 0.25, 8.0, -0.5];
    let b_data = [2.0, 4.0, -1.0, 0.5, 0.125, 3.0];
    let ops: [(BinaryOp, &str); 4] = [
        (BinaryOp::Add, "add"),
        (BinaryOp::Sub, "sub"),
        (BinaryOp::Mul, "mul"),
        (BinaryOp::Div, "div"),
    ];
    for (op, name) in ops {
        let mut ctx = Context::new();
        let a = ctx.from_slice(&a_data, (2, 3))?;
        let b = ctx.from_slice(&b_data, (2, 3))?;
        let out = ctx.binary(op, a, b)?;
        let same = ctx.binary_(op, a, b)?;
        assert_eq!(same, a);
        assert_eq!(ctx.data(out)?, ctx.data(a)?, "{name}");
    }
    Ok(())
}

#[test]
fn test_scalar_and_unary_inplace_match_out_of_place() -> ember::Result<()> {
    let data = [0.5, 1.0, 2.0, 4.0];
    let mut ctx = Context::new();

    let x = ctx.from_slice(&data, 4)?;
    let y = ctx.mul_scalar(x, 3.0)?;
    ctx.mul_scalar_(x, 3.0)?;
    assert_eq!(ctx.data(x)?, ctx.data(y)?);

    let x = ctx.from_slice(&data, 4)?;
    let y = ctx.sqrt(x)?;
    ctx.sqrt_(x)?;
    assert_eq!(ctx.data(x)?, ctx.data(y)?);

    let x = ctx.from_slice(&data, 4)?;
    let y = ctx.pow_scalar(x, 3.0)?;
    ctx.pow_scalar_(x, 3.0)?;
    assert_eq!(ctx.data(x)?, vec![0.125, 1.0, 8.0, 64.0]);
    assert_eq!(ctx.data(y)?, ctx.data(x)?);
    Ok(())
}

#[test]
fn test_inplace_never_records_graph() -> ember::Result<()> {
    let mut ctx = Context::new();
    let a = ctx.create((2,), Some(&[1.0, 2.0]), true, false)?;
    let b = ctx.create((2,), Some(&[3.0, 4.0]), true, false)?;
    ctx.add_(a, b)?;
    ctx.sigmoid_(a)?;
    assert!(ctx.get(a)?.is_leaf());
    assert!(ctx.get(b)?.children().is_empty());
    Ok(())
}

// Shape validation

#[test]
fn test_mismatched_shapes_fail_for_every_binary_op() -> ember::Result<()> {
    let mut ctx = Context::new();
    let base = ctx.ones((2, 3))?;
    let other_rank = ctx.ones(6)?;
    let other_size = ctx.ones((2, 2))?;
    let permuted = ctx.ones((3, 2))?;

    for other in [other_rank, other_size, permuted] {
        for op in [BinaryOp::Add, BinaryOp::Sub, BinaryOp::Mul, BinaryOp::Div] {
            assert!(matches!(
                ctx.binary(op, base, other),
                Err(Error::ShapeMismatch { .. })
            ));
            assert!(matches!(
                ctx.binary_(op, base, other),
                Err(Error::ShapeMismatch { .. })
            ));
        }
    }
    assert_eq!(ctx.data(base)?, vec![1.0; 6]);
    Ok(())
}

#[test]
fn test_unknown_id_is_not_found() {
    let mut ctx = Context::new();
    let ghost = TensorId(999);
    assert!(matches!(ctx.get(ghost), Err(Error::NotFound(_))));
    assert!(matches!(ctx.exp(ghost), Err(Error::NotFound(_))));
}

#[test]
fn test_invalid_creation() {
    let mut ctx = Context::new();
    assert!(matches!(
        ctx.create((2, 2), Some(&[1.0, 2.0, 3.0]), false, false),
        Err(Error::ElementCountMismatch { .. })
    ));
    assert!(matches!(
        ctx.zeros((2, 0)),
        Err(Error::InvalidShape(_))
    ));
    assert!(ctx.is_empty());
}

// Matrix kernels

#[test]
fn test_add_matrix_multiply_triple_loop() -> ember::Result<()> {
    let mut ctx = Context::new();
    let base_data = [1.0, -1.0, 0.5, 2.0];
    let a_data = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
    let b_data = [7.0, 8.0, 9.0, 10.0, 11.0, 12.0];
    let base = ctx.from_slice(&base_data, (2, 2))?;
    let a = ctx.from_slice(&a_data, (2, 3))?;
    let b = ctx.from_slice(&b_data, (3, 2))?;

    let mut expected = base_data.to_vec();
    for i in 0..2 {
        for j in 0..2 {
            for p in 0..3 {
                expected[i * 2 + j] += a_data[i * 3 + p] * b_data[p * 2 + j];
            }
        }
    }

    let out = ctx.add_matrix_multiply(base, a, b)?;
    assert_eq!(out, base);
    assert_eq!(ctx.data(base)?, expected);
    Ok(())
}

#[test]
fn test_add_matrix_multiply_inner_dimension() -> ember::Result<()> {
    let mut ctx = Context::new();
    let base = ctx.zeros((2, 2))?;
    let a = ctx.ones((2, 3))?;
    let b = ctx.ones((2, 2))?;
    assert!(matches!(
        ctx.add_matrix_multiply(base, a, b),
        Err(Error::DimensionMismatch { .. })
    ));
    assert_eq!(ctx.data(base)?, vec![0.0; 4]);
    Ok(())
}

#[test]
fn test_add_matrix_vector_product() -> ember::Result<()> {
    let mut ctx = Context::new();
    let base = ctx.from_slice(&[1.0, 1.0], 2)?;
    let m = ctx.from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3))?;
    let v = ctx.from_slice(&[1.0, 0.0, -1.0], 3)?;
    ctx.add_matrix_vector_product(base, m, v)?;
    assert_eq!(ctx.data(base)?, vec![-1.0, -1.0]);
    Ok(())
}

#[test]
fn test_mm_and_transpose() -> ember::Result<()> {
    let mut ctx = Context::new();
    let a = ctx.from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3))?;
    let at = ctx.transpose(a)?;
    assert_eq!(ctx.get(at)?.dims(), &[3, 2]);
    assert_eq!(ctx.data(at)?, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    let gram = ctx.mm(a, at)?;
    assert_eq!(ctx.data(gram)?, vec![14.0, 32.0, 32.0, 77.0]);
    Ok(())
}

// Reductions

#[test]
fn test_sum_each_axis() -> ember::Result<()> {
    let mut ctx = Context::new();
    let x = ctx.from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3))?;
    let rows = ctx.sum(x, 1)?;
    assert_eq!(ctx.get(rows)?.dims(), &[2]);
    assert_eq!(ctx.data(rows)?, vec![6.0, 15.0]);
    let cols = ctx.sum(x, 0)?;
    assert_eq!(ctx.get(cols)?.dims(), &[3]);
    assert_eq!(ctx.data(cols)?, vec![5.0, 7.0, 9.0]);
    assert!(matches!(ctx.sum(x, 2), Err(Error::DimOutOfRange { .. })));
    Ok(())
}

#[test]
fn test_softmax_is_stable_for_large_inputs() -> ember::Result<()> {
    let mut ctx = Context::new();
    let x = ctx.from_slice(&[1000.0, 1000.0, 1001.0, 999.0], (2, 2))?;
    let y = ctx.softmax(x, 1)?;
    let e = 1.0f32.exp();
    assert_vec_approx(
        &ctx.data(y)?,
        &[0.5, 0.5, e * e / (e * e + 1.0), 1.0 / (e * e + 1.0)],
        1e-6,
    );
    Ok(())
}

// Floating-point specials

#[test]
fn test_ieee_specials_propagate() -> ember::Result<()> {
    let mut ctx = Context::new();
    let x = ctx.from_slice(&[1.0, -1.0, 0.0, -0.0], 4)?;
    let zeros = ctx.zeros(4)?;
    let q = ctx.div(x, zeros)?;
    let q = ctx.data(q)?;
    assert_eq!(q[0], f32::INFINITY);
    assert_eq!(q[1], f32::NEG_INFINITY);
    assert!(q[2].is_nan());
    assert!(q[3].is_nan());

    let l = ctx.from_slice(&[0.0, -1.0], 2)?;
    let l = ctx.log(l)?;
    let l = ctx.data(l)?;
    assert_eq!(l[0], f32::NEG_INFINITY);
    assert!(l[1].is_nan());

    let m = ctx.from_slice(&[f32::MIN, -0.0], 2)?;
    let m = ctx.abs(m)?;
    let m = ctx.data(m)?;
    assert_eq!(m[0], f32::MAX);
    assert!(m[1].is_sign_positive());
    Ok(())
}

// Copies and expand

#[test]
fn test_copy_is_independent() -> ember::Result<()> {
    let mut ctx = Context::new();
    let x = ctx.create((2, 2), Some(&[1.0, 2.0, 3.0, 4.0]), true, true)?;
    let y = ctx.copy(x)?;
    assert_ne!(x, y);
    assert_eq!(ctx.get(y)?.shape(), ctx.get(x)?.shape());
    assert!(ctx.get(y)?.autograd() && ctx.get(y)?.keepgrads());
    ctx.fill_(y, 7.0)?;
    assert_eq!(ctx.data(x)?, vec![1.0, 2.0, 3.0, 4.0]);
    assert_eq!(ctx.data(y)?, vec![7.0; 4]);
    Ok(())
}

#[test]
fn test_expand_rejects_non_broadcast_shapes() -> ember::Result<()> {
    let mut ctx = Context::new();
    let row = ctx.from_slice(&[1.0, 2.0, 3.0], (1, 3))?;
    let grid = ctx.expand(row, (2, 3))?;
    assert_eq!(ctx.data(grid)?, vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);
    assert!(matches!(
        ctx.expand(row, (2, 4)),
        Err(Error::ShapeMismatch { .. })
    ));
    Ok(())
}
