use tracing::trace;

use crate::backend::{BinaryOp, ScalarOp, Store, UnaryOp};
use crate::error::{Error, Result};
use crate::kernels;
use crate::layout::Layout;
use crate::op::{CreationOp, TensorId};
use crate::registry::Context;
use crate::shape::{validate_elementwise, validate_matmul, Shape};
use crate::tensor::Tensor;

// Kernel library
//
// Every operation is written once against `Store`: a host store runs the
// reference loops in `kernels`, a device store is handed to the attached
// `ComputeDevice`. Operands of one kernel must share a backend.
//
// OUT-OF-PLACE vs IN-PLACE:
//
//   ctx.add(a, b)   → registers a new tensor; records graph edges when the
//                     op is differentiable and an operand tracks gradients
//   ctx.add_(a, b)  → overwrites `a` and returns `a`; never records edges
//
// Every kernel validates shapes, ranks and backends before it allocates or
// writes anything, so an error leaves all tensors untouched.
//
// Differentiable ops: add/sub/mul/div, mm, sigmoid, tanh, pow_scalar, sum,
// softmax, expand, contiguous. Everything else produces a plain leaf.

fn check_backend(a: &Tensor, b: &Tensor) -> Result<()> {
    if a.is_on_device() != b.is_on_device() {
        return Err(Error::BackendMismatch {
            lhs: a.id(),
            rhs: b.id(),
        });
    }
    Ok(())
}

fn require_rank2(t: &Tensor, op: &'static str) -> Result<(usize, usize)> {
    match t.dims() {
        &[rows, cols] => Ok((rows, cols)),
        _ => Err(Error::UnsupportedOperation {
            op,
            rank: t.rank(),
        }),
    }
}

impl Context {
    //  Store dispatch

    fn unary_store(&self, op: UnaryOp, x: &Store) -> Result<Store> {
        match x {
            Store::Host(v) => Ok(Store::Host(kernels::unary(op, v))),
            Store::Device(buf) => Ok(Store::Device(self.require_device()?.unary(op, buf)?)),
        }
    }

    fn scalar_store(&self, op: ScalarOp, x: &Store, s: f32) -> Result<Store> {
        match x {
            Store::Host(v) => Ok(Store::Host(kernels::scalar(op, v, s))),
            Store::Device(buf) => Ok(Store::Device(self.require_device()?.scalar(op, buf, s)?)),
        }
    }

    fn binary_store(&self, op: BinaryOp, a: &Tensor, b: &Tensor) -> Result<Store> {
        match (&a.store, &b.store) {
            (Store::Host(x), Store::Host(y)) => Ok(Store::Host(kernels::binary(op, x, y))),
            (Store::Device(x), Store::Device(y)) => {
                Ok(Store::Device(self.require_device()?.binary(op, x, y)?))
            }
            _ => Err(Error::BackendMismatch {
                lhs: a.id(),
                rhs: b.id(),
            }),
        }
    }

    fn gather_store(&self, x: &Store, layout: &Layout) -> Result<Store> {
        match x {
            Store::Host(v) => Ok(Store::Host(kernels::gather(v, layout))),
            Store::Device(buf) => Ok(Store::Device(self.require_device()?.gather(buf, layout)?)),
        }
    }

    //  Element-wise

    /// Apply a unary op into a new tensor. `Sigmoid` and `Tanh` are
    /// differentiable; every other unary op yields a plain leaf.
    pub fn unary(&mut self, op: UnaryOp, x: TensorId) -> Result<TensorId> {
        trace!(op = op.name(), x = %x, "unary");
        let t = self.get(x)?;
        let shape = t.shape().clone();
        let store = self.unary_store(op, &t.store)?;
        let id = match op {
            UnaryOp::Sigmoid => self.register_derived(shape, store, CreationOp::Sigmoid, &[x]),
            UnaryOp::Tanh => self.register_derived(shape, store, CreationOp::Tanh, &[x]),
            _ => self.register(shape, store),
        };
        Ok(id)
    }

    /// Apply a unary op to `x` in place.
    pub fn unary_(&mut self, op: UnaryOp, x: TensorId) -> Result<TensorId> {
        trace!(op = op.name(), x = %x, "unary_");
        let device = self.device().cloned();
        let t = self.get_mut(x)?;
        match &mut t.store {
            Store::Host(v) => kernels::unary_inplace(op, v),
            Store::Device(buf) => device.ok_or(Error::NoDevice)?.unary_inplace(op, buf)?,
        }
        Ok(x)
    }

    /// `op(x, s)` for every element. `ScalarOp::Pow` is differentiable.
    pub fn scalar(&mut self, op: ScalarOp, x: TensorId, s: f32) -> Result<TensorId> {
        trace!(op = op.name(), x = %x, s, "scalar");
        let t = self.get(x)?;
        let shape = t.shape().clone();
        let store = self.scalar_store(op, &t.store, s)?;
        let id = match op {
            ScalarOp::Pow => {
                self.register_derived(shape, store, CreationOp::PowScalar { exponent: s }, &[x])
            }
            _ => self.register(shape, store),
        };
        Ok(id)
    }

    pub fn scalar_(&mut self, op: ScalarOp, x: TensorId, s: f32) -> Result<TensorId> {
        trace!(op = op.name(), x = %x, s, "scalar_");
        let device = self.device().cloned();
        let t = self.get_mut(x)?;
        match &mut t.store {
            Store::Host(v) => kernels::scalar_inplace(op, v, s),
            Store::Device(buf) => device.ok_or(Error::NoDevice)?.scalar_inplace(op, buf, s)?,
        }
        Ok(x)
    }

    /// Element-wise `op(a, b)` into a new tensor. Shapes must be identical.
    pub fn binary(&mut self, op: BinaryOp, a: TensorId, b: TensorId) -> Result<TensorId> {
        trace!(op = op.name(), a = %a, b = %b, "binary");
        let (lhs, rhs) = (self.get(a)?, self.get(b)?);
        validate_elementwise(lhs.shape(), rhs.shape())?;
        let shape = lhs.shape().clone();
        let store = self.binary_store(op, lhs, rhs)?;
        let creation = match op {
            BinaryOp::Add => CreationOp::AddElem,
            BinaryOp::Sub => CreationOp::SubElem,
            BinaryOp::Mul => CreationOp::MulElem,
            BinaryOp::Div => CreationOp::DivElem,
        };
        Ok(self.register_derived(shape, store, creation, &[a, b]))
    }

    /// `a = op(a, b)` element-wise. `a` and `b` may be the same tensor.
    pub fn binary_(&mut self, op: BinaryOp, a: TensorId, b: TensorId) -> Result<TensorId> {
        trace!(op = op.name(), a = %a, b = %b, "binary_");
        let (lhs, rhs) = (self.get(a)?, self.get(b)?);
        validate_elementwise(lhs.shape(), rhs.shape())?;
        check_backend(lhs, rhs)?;
        if a == b {
            let store = self.binary_store(op, lhs, rhs)?;
            self.replace_store(a, store)?;
            return Ok(a);
        }
        self.with_detached(a, |ctx, lhs| {
            let rhs = ctx.get(b)?;
            match (&mut lhs.store, &rhs.store) {
                (Store::Host(x), Store::Host(y)) => kernels::binary_inplace(op, x, y),
                (Store::Device(x), Store::Device(y)) => {
                    ctx.require_device()?.binary_inplace(op, x, y)?
                }
                _ => return Err(Error::BackendMismatch { lhs: a, rhs: b }),
            }
            Ok(())
        })?;
        Ok(a)
    }

    /// Overwrite every element of `x` with `value`.
    pub fn fill_(&mut self, x: TensorId, value: f32) -> Result<TensorId> {
        let device = self.device().cloned();
        let t = self.get_mut(x)?;
        match &mut t.store {
            Store::Host(v) => kernels::fill(v, value),
            Store::Device(buf) => device.ok_or(Error::NoDevice)?.fill(buf, value)?,
        }
        Ok(x)
    }

    pub fn zero_(&mut self, x: TensorId) -> Result<TensorId> {
        self.fill_(x, 0.0)
    }

    //  Reductions

    /// Sum along `dim`, removing that axis. Summing a rank-1 tensor yields
    /// shape `[1]`.
    pub fn sum(&mut self, x: TensorId, dim: usize) -> Result<TensorId> {
        trace!(x = %x, dim, "sum");
        let t = self.get(x)?;
        let out_shape = t.shape().reduce_dim(dim)?;
        let store = match &t.store {
            Store::Host(v) => Store::Host(kernels::sum_dim(v, t.shape(), dim)?),
            Store::Device(buf) => {
                Store::Device(self.require_device()?.sum_dim(buf, t.shape(), dim)?)
            }
        };
        Ok(self.register_derived(out_shape, store, CreationOp::Sum { dim }, &[x]))
    }

    /// Numerically stable softmax along `dim`.
    pub fn softmax(&mut self, x: TensorId, dim: usize) -> Result<TensorId> {
        trace!(x = %x, dim, "softmax");
        let t = self.get(x)?;
        let shape = t.shape().clone();
        shape.dim(dim)?;
        let store = match &t.store {
            Store::Host(v) => Store::Host(kernels::softmax_dim(v, &shape, dim)?),
            Store::Device(buf) => Store::Device(self.require_device()?.softmax(buf, &shape, dim)?),
        };
        Ok(self.register_derived(shape, store, CreationOp::Softmax { dim }, &[x]))
    }

    //  Matrix kernels

    /// `[m, k] @ [k, n]` into a new `[m, n]` tensor.
    pub fn mm(&mut self, a: TensorId, b: TensorId) -> Result<TensorId> {
        trace!(a = %a, b = %b, "mm");
        let (lhs, rhs) = (self.get(a)?, self.get(b)?);
        let (m, k, n) = validate_matmul(lhs.shape(), rhs.shape())?;
        let store = match (&lhs.store, &rhs.store) {
            (Store::Host(x), Store::Host(y)) => Store::Host(kernels::matmul(x, y, m, k, n)),
            (Store::Device(x), Store::Device(y)) => {
                Store::Device(self.require_device()?.matmul(x, y, m, k, n)?)
            }
            _ => return Err(Error::BackendMismatch { lhs: a, rhs: b }),
        };
        Ok(self.register_derived(Shape::from((m, n)), store, CreationOp::MatMul, &[a, b]))
    }

    /// Transpose of a 2-D tensor, materialized contiguously.
    pub fn transpose(&mut self, x: TensorId) -> Result<TensorId> {
        let t = self.get(x)?;
        require_rank2(t, "transpose")?;
        let layout = t.layout().transpose(0, 1)?;
        let store = self.gather_store(&t.store, &layout)?;
        Ok(self.register(layout.shape().clone(), store))
    }

    /// `base += a @ b`, in place on `base`.
    pub fn add_matrix_multiply(
        &mut self,
        base: TensorId,
        a: TensorId,
        b: TensorId,
    ) -> Result<TensorId> {
        trace!(base = %base, a = %a, b = %b, "add_matrix_multiply");
        let (lhs, rhs, acc) = (self.get(a)?, self.get(b)?, self.get(base)?);
        let (m, k, n) = validate_matmul(lhs.shape(), rhs.shape())?;
        let expected = Shape::from((m, n));
        if acc.shape() != &expected {
            return Err(Error::ShapeMismatch {
                expected,
                got: acc.shape().clone(),
            });
        }
        check_backend(acc, lhs)?;
        check_backend(acc, rhs)?;

        let (a_src, b_src) = (self.unaliased(a, base)?, self.unaliased(b, base)?);
        let result = self.with_detached(base, |ctx, acc| {
            let (lhs, rhs) = (ctx.get(a_src)?, ctx.get(b_src)?);
            match (&mut acc.store, &lhs.store, &rhs.store) {
                (Store::Host(o), Store::Host(x), Store::Host(y)) => {
                    kernels::add_matmul(o, x, y, m, k, n)
                }
                (Store::Device(o), Store::Device(x), Store::Device(y)) => {
                    ctx.require_device()?.add_matmul(o, x, y, m, k, n)?
                }
                _ => return Err(Error::BackendMismatch { lhs: a, rhs: b }),
            }
            Ok(base)
        });
        self.drop_alias(a_src, a)?;
        self.drop_alias(b_src, b)?;
        result
    }

    /// `base += matrix @ vector`, in place on `base`. `vector` must be a
    /// rank-1 tensor of length `cols` and `base` one of length `rows`.
    pub fn add_matrix_vector_product(
        &mut self,
        base: TensorId,
        matrix: TensorId,
        vector: TensorId,
    ) -> Result<TensorId> {
        trace!(base = %base, matrix = %matrix, vector = %vector, "add_matrix_vector_product");
        let (mat, vec, acc) = (self.get(matrix)?, self.get(vector)?, self.get(base)?);
        let (rows, cols) = require_rank2(mat, "matvec")?;
        if vec.dims() != [cols] {
            return Err(Error::DimensionMismatch {
                op: "matvec",
                lhs: mat.shape().clone(),
                rhs: vec.shape().clone(),
            });
        }
        if acc.dims() != [rows] {
            return Err(Error::DimensionMismatch {
                op: "matvec",
                lhs: mat.shape().clone(),
                rhs: acc.shape().clone(),
            });
        }
        check_backend(acc, mat)?;
        check_backend(acc, vec)?;

        let (m_src, v_src) = (self.unaliased(matrix, base)?, self.unaliased(vector, base)?);
        let result = self.with_detached(base, |ctx, acc| {
            let (mat, vec) = (ctx.get(m_src)?, ctx.get(v_src)?);
            match (&mut acc.store, &mat.store, &vec.store) {
                (Store::Host(o), Store::Host(x), Store::Host(y)) => {
                    kernels::add_matvec(o, x, y, rows, cols)
                }
                (Store::Device(o), Store::Device(x), Store::Device(y)) => {
                    ctx.require_device()?.add_matvec(o, x, y, rows, cols)?
                }
                _ => {
                    return Err(Error::BackendMismatch {
                        lhs: matrix,
                        rhs: vector,
                    })
                }
            }
            Ok(base)
        });
        self.drop_alias(m_src, matrix)?;
        self.drop_alias(v_src, vector)?;
        result
    }

    /// An operand that is also the accumulation target is read from a
    /// snapshot so the kernel sees its values from before the call.
    fn unaliased(&mut self, operand: TensorId, base: TensorId) -> Result<TensorId> {
        if operand == base {
            self.duplicate(operand)
        } else {
            Ok(operand)
        }
    }

    fn drop_alias(&mut self, src: TensorId, operand: TensorId) -> Result<()> {
        if src != operand {
            self.remove(src)?;
        }
        Ok(())
    }

    /// Zero every element of a 2-D tensor where `column - row < k`.
    pub fn triu_(&mut self, x: TensorId, k: i64) -> Result<TensorId> {
        let device = self.device().cloned();
        let t = self.get_mut(x)?;
        let (rows, cols) = require_rank2(t, "triu")?;
        match &mut t.store {
            Store::Host(v) => kernels::triu_inplace(v, rows, cols, k),
            Store::Device(buf) => {
                device
                    .ok_or(Error::NoDevice)?
                    .triu_inplace(buf, rows, cols, k)?
            }
        }
        Ok(x)
    }

    /// Upper-triangular copy of a 2-D tensor.
    pub fn triu(&mut self, x: TensorId, k: i64) -> Result<TensorId> {
        require_rank2(self.get(x)?, "triu")?;
        let out = self.duplicate(x)?;
        self.triu_(out, k)
    }

    //  Shape and copies

    /// Broadcast `x` to `shape`. Only axes of extent 1 (or missing leading
    /// axes) can grow; the result is materialized contiguously.
    pub fn expand(&mut self, x: TensorId, shape: impl Into<Shape>) -> Result<TensorId> {
        let target = shape.into();
        target.validate()?;
        let t = self.get(x)?;
        let layout = t.layout().expand(&target)?;
        let store = self.gather_store(&t.store, &layout)?;
        Ok(self.register_derived(target, store, CreationOp::Expand, &[x]))
    }

    /// A row-major copy of `x` that stays linked to `x` in the graph.
    pub fn contiguous(&mut self, x: TensorId) -> Result<TensorId> {
        let t = self.get(x)?;
        let layout = t.layout().clone();
        let store = if layout.is_contiguous() {
            self.copy_store(&t.store)?
        } else {
            self.gather_store(&t.store, &layout)?
        };
        Ok(self.register_derived(layout.shape().clone(), store, CreationOp::Contiguous, &[x]))
    }

    /// A new leaf with its own store on the same backend, carrying the
    /// source's `autograd` and `keepgrads` flags.
    pub fn copy(&mut self, x: TensorId) -> Result<TensorId> {
        let (autograd, keepgrads) = {
            let t = self.get(x)?;
            (t.autograd(), t.keepgrads())
        };
        let id = self.duplicate(x)?;
        let t = self.get_mut(id)?;
        t.autograd = autograd;
        t.keepgrads = keepgrads;
        Ok(id)
    }

    //  Gradient helpers used by the backward pass

    /// Replicate a gradient of the reduced shape back across `dim`.
    pub(crate) fn expand_sum_grad(
        &mut self,
        grad: TensorId,
        input_shape: &Shape,
        dim: usize,
    ) -> Result<TensorId> {
        let g = self.get(grad)?;
        let store = match &g.store {
            Store::Host(v) => Store::Host(kernels::expand_sum_grad(v, input_shape, dim)?),
            Store::Device(buf) => Store::Device(
                self.require_device()?
                    .expand_sum_grad(buf, input_shape, dim)?,
            ),
        };
        Ok(self.register(input_shape.clone(), store))
    }

    pub(crate) fn softmax_grad(
        &mut self,
        out: TensorId,
        grad: TensorId,
        dim: usize,
    ) -> Result<TensorId> {
        let (o, g) = (self.get(out)?, self.get(grad)?);
        validate_elementwise(o.shape(), g.shape())?;
        let shape = o.shape().clone();
        let store = match (&o.store, &g.store) {
            (Store::Host(x), Store::Host(y)) => {
                Store::Host(kernels::softmax_grad(x, y, &shape, dim)?)
            }
            (Store::Device(x), Store::Device(y)) => {
                Store::Device(self.require_device()?.softmax_grad(x, y, &shape, dim)?)
            }
            _ => return Err(Error::BackendMismatch { lhs: out, rhs: grad }),
        };
        Ok(self.register(shape, store))
    }

    /// Sum a gradient over its broadcast axes back down to `to`.
    pub(crate) fn sum_to(&mut self, grad: TensorId, to: &Shape) -> Result<TensorId> {
        let g = self.get(grad)?;
        let from = g.shape().clone();
        let store = match &g.store {
            Store::Host(v) => Store::Host(kernels::sum_to(v, &from, to)?),
            Store::Device(buf) => Store::Device(self.require_device()?.sum_to(buf, &from, to)?),
        };
        Ok(self.register(to.clone(), store))
    }
}

// Named wrappers: ctx.exp(x), ctx.exp_(x), ctx.add(a, b), ctx.mul_scalar_(x, 2.0), ...

macro_rules! unary_methods {
    ($($name:ident, $inplace:ident => $op:ident;)*) => {
        impl Context {
            $(
                #[doc = concat!("Element-wise `", stringify!($name), "` into a new tensor.")]
                pub fn $name(&mut self, x: TensorId) -> Result<TensorId> {
                    self.unary(UnaryOp::$op, x)
                }

                #[doc = concat!("Element-wise `", stringify!($name), "` in place.")]
                pub fn $inplace(&mut self, x: TensorId) -> Result<TensorId> {
                    self.unary_(UnaryOp::$op, x)
                }
            )*
        }
    };
}

macro_rules! binary_methods {
    ($($name:ident, $inplace:ident => $op:ident;)*) => {
        impl Context {
            $(
                pub fn $name(&mut self, a: TensorId, b: TensorId) -> Result<TensorId> {
                    self.binary(BinaryOp::$op, a, b)
                }

                pub fn $inplace(&mut self, a: TensorId, b: TensorId) -> Result<TensorId> {
                    self.binary_(BinaryOp::$op, a, b)
                }
            )*
        }
    };
}

macro_rules! scalar_methods {
    ($($name:ident, $inplace:ident => $op:ident;)*) => {
        impl Context {
            $(
                pub fn $name(&mut self, x: TensorId, s: f32) -> Result<TensorId> {
                    self.scalar(ScalarOp::$op, x, s)
                }

                pub fn $inplace(&mut self, x: TensorId, s: f32) -> Result<TensorId> {
                    self.scalar_(ScalarOp::$op, x, s)
                }
            )*
        }
    };
}

unary_methods! {
    abs, abs_ => Abs;
    neg, neg_ => Neg;
    sign, sign_ => Sign;
    ceil, ceil_ => Ceil;
    floor, floor_ => Floor;
    round, round_ => Round;
    trunc, trunc_ => Trunc;
    sqrt, sqrt_ => Sqrt;
    exp, exp_ => Exp;
    log, log_ => Log;
    sin, sin_ => Sin;
    cos, cos_ => Cos;
    tan, tan_ => Tan;
    sinh, sinh_ => Sinh;
    cosh, cosh_ => Cosh;
    tanh, tanh_ => Tanh;
    sigmoid, sigmoid_ => Sigmoid;
    reciprocal, reciprocal_ => Reciprocal;
}

binary_methods! {
    add, add_ => Add;
    sub, sub_ => Sub;
    mul, mul_ => Mul;
    div, div_ => Div;
}

scalar_methods! {
    add_scalar, add_scalar_ => Add;
    sub_scalar, sub_scalar_ => Sub;
    mul_scalar, mul_scalar_ => Mul;
    div_scalar, div_scalar_ => Div;
    pow_scalar, pow_scalar_ => Pow;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f32, b: f32, tol: f32) -> bool {
        (a - b).abs() < tol
    }

    fn assert_vec_approx(got: &[f32], expected: &[f32], tol: f32) {
        assert_eq!(got.len(), expected.len());
        for (i, (g, e)) in got.iter().zip(expected.iter()).enumerate() {
            assert!(approx_eq(*g, *e, tol), "index {i}: {g} != {e}");
        }
    }

    #[test]
    fn test_add_and_add_inplace_agree() -> Result<()> {
        let mut ctx = Context::new();
        let a = ctx.from_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2))?;
        let b = ctx.from_slice(&[10.0, 20.0, 30.0, 40.0], (2, 2))?;
        let c = ctx.add(a, b)?;
        ctx.add_(a, b)?;
        assert_eq!(ctx.data(c)?, ctx.data(a)?);
        assert_eq!(ctx.data(c)?, vec![11.0, 22.0, 33.0, 44.0]);
        Ok(())
    }

    #[test]
    fn test_binary_shape_mismatch_leaves_receiver_untouched() -> Result<()> {
        let mut ctx = Context::new();
        let a = ctx.from_slice(&[1.0; 6], (2, 3))?;
        let b = ctx.from_slice(&[2.0; 6], (3, 2))?;
        assert!(matches!(ctx.mul(a, b), Err(Error::ShapeMismatch { .. })));
        assert!(matches!(ctx.mul_(a, b), Err(Error::ShapeMismatch { .. })));
        assert_eq!(ctx.data(a)?, vec![1.0; 6]);
        Ok(())
    }

    #[test]
    fn test_inplace_with_itself() -> Result<()> {
        let mut ctx = Context::new();
        let a = ctx.from_slice(&[1.0, 2.0, 3.0], 3)?;
        ctx.mul_(a, a)?;
        assert_eq!(ctx.data(a)?, vec![1.0, 4.0, 9.0]);
        Ok(())
    }

    #[test]
    fn test_sum_removes_axis() -> Result<()> {
        let mut ctx = Context::new();
        let x = ctx.from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3))?;
        let s0 = ctx.sum(x, 0)?;
        let s1 = ctx.sum(x, 1)?;
        assert_eq!(ctx.get(s0)?.dims(), &[3]);
        assert_eq!(ctx.data(s0)?, vec![5.0, 7.0, 9.0]);
        assert_eq!(ctx.data(s1)?, vec![6.0, 15.0]);
        assert!(matches!(ctx.sum(x, 2), Err(Error::DimOutOfRange { dim: 2, rank: 2 })));
        let v = ctx.from_slice(&[1.0, 2.0], 2)?;
        let total = ctx.sum(v, 0)?;
        assert_eq!(ctx.get(total)?.dims(), &[1]);
        Ok(())
    }

    #[test]
    fn test_transpose_and_mm() -> Result<()> {
        let mut ctx = Context::new();
        let a = ctx.from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3))?;
        let t = ctx.transpose(a)?;
        assert_eq!(ctx.get(t)?.dims(), &[3, 2]);
        assert_eq!(ctx.data(t)?, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        let p = ctx.mm(a, t)?;
        assert_eq!(ctx.data(p)?, vec![14.0, 32.0, 32.0, 77.0]);
        assert!(matches!(ctx.mm(a, a), Err(Error::DimensionMismatch { .. })));
        Ok(())
    }

    #[test]
    fn test_add_matrix_multiply_accumulates() -> Result<()> {
        let mut ctx = Context::new();
        let base = ctx.from_slice(&[1.0, 1.0, 1.0, 1.0], (2, 2))?;
        let a = ctx.from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3))?;
        let b = ctx.from_slice(&[7.0, 8.0, 9.0, 10.0, 11.0, 12.0], (3, 2))?;
        let out = ctx.add_matrix_multiply(base, a, b)?;
        assert_eq!(out, base);
        assert_eq!(ctx.data(base)?, vec![59.0, 65.0, 140.0, 155.0]);
        Ok(())
    }

    #[test]
    fn test_add_matrix_multiply_with_base_as_operand() -> Result<()> {
        let mut ctx = Context::new();
        let base = ctx.from_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2))?;
        let id = ctx.from_slice(&[1.0, 0.0, 0.0, 1.0], (2, 2))?;
        let before = ctx.len();
        ctx.add_matrix_multiply(base, base, id)?;
        assert_eq!(ctx.data(base)?, vec![2.0, 4.0, 6.0, 8.0]);
        assert_eq!(ctx.len(), before);
        Ok(())
    }

    #[test]
    fn test_add_matrix_vector_product() -> Result<()> {
        let mut ctx = Context::new();
        let base = ctx.from_slice(&[1.0, 2.0], 2)?;
        let m = ctx.from_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2))?;
        let v = ctx.from_slice(&[5.0, 6.0], 2)?;
        ctx.add_matrix_vector_product(base, m, v)?;
        assert_eq!(ctx.data(base)?, vec![18.0, 41.0]);
        let short = ctx.from_slice(&[1.0, 2.0, 3.0], 3)?;
        assert!(matches!(
            ctx.add_matrix_vector_product(base, m, short),
            Err(Error::DimensionMismatch { .. })
        ));
        // same element counts, but not vectors
        let row = ctx.from_slice(&[1.0, 2.0], (1, 2))?;
        let col = ctx.from_slice(&[5.0, 6.0], (2, 1))?;
        assert!(matches!(
            ctx.add_matrix_vector_product(row, m, v),
            Err(Error::DimensionMismatch { .. })
        ));
        assert!(matches!(
            ctx.add_matrix_vector_product(base, m, col),
            Err(Error::DimensionMismatch { .. })
        ));
        assert_eq!(ctx.data(base)?, vec![18.0, 41.0]);
        Ok(())
    }

    #[test]
    fn test_triu_rank_must_be_two() -> Result<()> {
        let mut ctx = Context::new();
        let v = ctx.ones(4)?;
        assert!(matches!(
            ctx.triu_(v, 0),
            Err(Error::UnsupportedOperation { op: "triu", rank: 1 })
        ));
        let cube = ctx.ones((2, 2, 2))?;
        assert!(matches!(
            ctx.triu_(cube, 0),
            Err(Error::UnsupportedOperation { rank: 3, .. })
        ));
        Ok(())
    }

    #[test]
    fn test_expand_and_contiguous() -> Result<()> {
        let mut ctx = Context::new();
        let bias = ctx.from_slice(&[1.0, 2.0, 3.0], (1, 3))?;
        let wide = ctx.expand(bias, (2, 3))?;
        assert_eq!(ctx.data(wide)?, vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);
        assert_eq!(ctx.get(wide)?.strides(), &[3, 1]);
        assert!(matches!(ctx.expand(wide, (4, 3)), Err(Error::ShapeMismatch { .. })));
        let c = ctx.contiguous(wide)?;
        assert_ne!(c, wide);
        assert_eq!(ctx.data(c)?, ctx.data(wide)?);
        Ok(())
    }

    #[test]
    fn test_copy_is_independent() -> Result<()> {
        let mut ctx = Context::new();
        let a = ctx.create(3, Some(&[1.0, 2.0, 3.0]), true, false)?;
        let b = ctx.copy(a)?;
        assert_ne!(a, b);
        assert!(ctx.get(b)?.autograd());
        assert!(ctx.get(b)?.is_leaf());
        ctx.fill_(b, 9.0)?;
        assert_eq!(ctx.data(a)?, vec![1.0, 2.0, 3.0]);
        assert_eq!(ctx.data(b)?, vec![9.0; 3]);
        Ok(())
    }

    #[test]
    fn test_graph_recorded_only_when_tracking() -> Result<()> {
        let mut ctx = Context::new();
        let a = ctx.create(2, Some(&[1.0, 2.0]), true, false)?;
        let b = ctx.from_slice(&[3.0, 4.0], 2)?;
        let c = ctx.mul(a, b)?;
        let t = ctx.get(c)?;
        assert!(t.autograd());
        assert_eq!(t.creators(), &[a, b]);
        assert_eq!(t.creation_op(), Some(CreationOp::MulElem));
        assert_eq!(ctx.get(a)?.children().len(), 1);
        // constants never collect child edges, however often they are reused
        for _ in 0..3 {
            ctx.mul(a, b)?;
        }
        assert!(ctx.get(b)?.children().is_empty());
        assert_eq!(ctx.get(a)?.children().len(), 4);

        let plain = ctx.add(b, b)?;
        assert!(ctx.get(plain)?.is_leaf());
        assert!(!ctx.get(plain)?.autograd());

        let untracked = ctx.no_grad(|ctx| ctx.mul(a, b))?;
        assert!(ctx.get(untracked)?.is_leaf());
        Ok(())
    }

    #[test]
    fn test_unary_edge_values() -> Result<()> {
        let mut ctx = Context::new();
        let x = ctx.from_slice(&[-0.0, 0.0, -0.0001, f32::MAX, f32::MIN], 5)?;
        let s = ctx.sign(x)?;
        assert_eq!(ctx.data(s)?, vec![0.0, 0.0, -1.0, 1.0, -1.0]);
        let a = ctx.abs(x)?;
        assert_eq!(ctx.data(a)?[4], f32::MAX);
        let y = ctx.from_slice(&[1.5, -1.5, -0.3], 3)?;
        let c = ctx.ceil(y)?;
        let f = ctx.floor(y)?;
        assert_eq!(ctx.data(c)?, vec![2.0, -1.0, -0.0]);
        assert_eq!(ctx.data(f)?, vec![1.0, -2.0, -1.0]);
        Ok(())
    }

    #[test]
    fn test_sigmoid_and_softmax_values() -> Result<()> {
        let mut ctx = Context::new();
        let x = ctx.from_slice(&[0.0, 1.0, 2.0], 3)?;
        let s = ctx.sigmoid(x)?;
        assert_vec_approx(&ctx.data(s)?, &[0.5, 0.7310586, 0.8807971], 1e-6);
        let p = ctx.softmax(x, 0)?;
        assert_vec_approx(&ctx.data(p)?, &[0.09003057, 0.24472847, 0.66524096], 1e-6);
        Ok(())
    }

    #[test]
    fn test_pow_scalar_records_exponent() -> Result<()> {
        let mut ctx = Context::new();
        let x = ctx.create(2, Some(&[2.0, 3.0]), true, false)?;
        let y = ctx.pow_scalar(x, 3.0)?;
        assert_eq!(ctx.data(y)?, vec![8.0, 27.0]);
        assert_eq!(
            ctx.get(y)?.creation_op(),
            Some(CreationOp::PowScalar { exponent: 3.0 })
        );
        assert_eq!(ctx.get(y)?.creators(), &[x]);
        Ok(())
    }
}
