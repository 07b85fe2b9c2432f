use std::fmt;

use crate::error::Result;
use crate::layout::Layout;
use crate::shape::Shape;

// Backend — where a tensor's numbers live and who computes on them
//
// A tensor's payload is exactly one of:
//
//   Store::Host(Vec<f32>)        — an ordered sequence of floats in RAM
//   Store::Device(DeviceBuffer)  — an opaque handle to a buffer owned by a
//                                  compute device
//
// WHY AN ENUM FOR THE STORE BUT A TRAIT FOR THE DEVICE?
//
// The registry must be able to hold host and device tensors side by side
// and move them back and forth at runtime (`to_device` / `to_host`), so the
// store is a tagged variant that every kernel matches on. The device
// itself is a capability injected into the `Context` as
// `Arc<dyn ComputeDevice>`: the core defines the kernel interface once, and
// device crates (e.g. `ember-device`) implement it without the core knowing
// anything about how they execute.
//
// PARITY:
//
// Host and device paths must agree bit-for-bit. Both sides therefore share
// the scalar math below (`UnaryOp::apply`, `BinaryOp::apply`, ...) and the
// per-element helpers in `kernels`, and accumulate in the same order.

/// Element-wise binary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    #[inline]
    pub fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
        }
    }
}

/// Tensor-with-scalar operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl ScalarOp {
    #[inline]
    pub fn apply(self, x: f32, s: f32) -> f32 {
        match self {
            ScalarOp::Add => x + s,
            ScalarOp::Sub => x - s,
            ScalarOp::Mul => x * s,
            ScalarOp::Div => x / s,
            ScalarOp::Pow => x.powf(s),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ScalarOp::Add => "add_scalar",
            ScalarOp::Sub => "sub_scalar",
            ScalarOp::Mul => "mul_scalar",
            ScalarOp::Div => "div_scalar",
            ScalarOp::Pow => "pow_scalar",
        }
    }
}

/// Element-wise unary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Abs,
    Neg,
    Sign,
    Ceil,
    Floor,
    Round,
    Trunc,
    Sqrt,
    Exp,
    Log,
    Sin,
    Cos,
    Tan,
    Sinh,
    Cosh,
    Tanh,
    Sigmoid,
    Reciprocal,
}

impl UnaryOp {
    #[inline]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            UnaryOp::Abs => x.abs(),
            UnaryOp::Neg => -x,
            // -0.0 and +0.0 both compare equal to zero and map to 0.
            UnaryOp::Sign => {
                if x > 0.0 {
                    1.0
                } else if x < 0.0 {
                    -1.0
                } else if x.is_nan() {
                    x
                } else {
                    0.0
                }
            }
            UnaryOp::Ceil => x.ceil(),
            UnaryOp::Floor => x.floor(),
            UnaryOp::Round => x.round(),
            UnaryOp::Trunc => x.trunc(),
            UnaryOp::Sqrt => x.sqrt(),
            UnaryOp::Exp => x.exp(),
            UnaryOp::Log => x.ln(),
            UnaryOp::Sin => x.sin(),
            UnaryOp::Cos => x.cos(),
            UnaryOp::Tan => x.tan(),
            UnaryOp::Sinh => x.sinh(),
            UnaryOp::Cosh => x.cosh(),
            UnaryOp::Tanh => x.tanh(),
            UnaryOp::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            UnaryOp::Reciprocal => 1.0 / x,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Abs => "abs",
            UnaryOp::Neg => "neg",
            UnaryOp::Sign => "sign",
            UnaryOp::Ceil => "ceil",
            UnaryOp::Floor => "floor",
            UnaryOp::Round => "round",
            UnaryOp::Trunc => "trunc",
            UnaryOp::Sqrt => "sqrt",
            UnaryOp::Exp => "exp",
            UnaryOp::Log => "log",
            UnaryOp::Sin => "sin",
            UnaryOp::Cos => "cos",
            UnaryOp::Tan => "tan",
            UnaryOp::Sinh => "sinh",
            UnaryOp::Cosh => "cosh",
            UnaryOp::Tanh => "tanh",
            UnaryOp::Sigmoid => "sigmoid",
            UnaryOp::Reciprocal => "reciprocal",
        }
    }
}

/// Opaque handle to a buffer of `len` f32 values owned by a compute device.
///
/// The handle does not free anything when dropped; the registry releases
/// device buffers explicitly when a tensor is evicted or migrated back.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceBuffer {
    handle: u64,
    len: usize,
}

impl DeviceBuffer {
    /// Only device implementations mint handles.
    pub fn new(handle: u64, len: usize) -> Self {
        DeviceBuffer { handle, len }
    }

    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// The authoritative numeric payload of a tensor.
#[derive(Debug, PartialEq)]
pub enum Store {
    Host(Vec<f32>),
    Device(DeviceBuffer),
}

impl Store {
    pub fn len(&self) -> usize {
        match self {
            Store::Host(v) => v.len(),
            Store::Device(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_device(&self) -> bool {
        matches!(self, Store::Device(_))
    }
}

/// A compute device able to hold f32 buffers and run every Ember kernel on them.
///
/// Out-of-place methods allocate and return a new buffer; `*_inplace`
/// methods overwrite their first buffer argument. Every call is synchronous
/// from the caller's point of view: when it returns, the result is visible
/// to the next dispatch and to `download`.
///
/// Shapes passed alongside buffers are already validated by the caller.
pub trait ComputeDevice: Send + Sync + fmt::Debug {
    /// A human-readable device name (e.g. "emulated:0").
    fn name(&self) -> String;

    //  Buffer management

    /// Copy host data into a freshly allocated buffer.
    fn upload(&self, data: &[f32]) -> Result<DeviceBuffer>;

    /// Read a buffer back to the host.
    fn download(&self, buf: &DeviceBuffer) -> Result<Vec<f32>>;

    /// Return a buffer to the device. The handle is invalid afterwards.
    fn release(&self, buf: &DeviceBuffer) -> Result<()>;

    /// Allocate a new buffer holding a copy of `buf`.
    fn duplicate(&self, buf: &DeviceBuffer) -> Result<DeviceBuffer>;

    /// Overwrite every element with `value`.
    fn fill(&self, buf: &DeviceBuffer, value: f32) -> Result<()>;

    //  Element-wise

    fn unary(&self, op: UnaryOp, x: &DeviceBuffer) -> Result<DeviceBuffer>;

    fn unary_inplace(&self, op: UnaryOp, x: &DeviceBuffer) -> Result<()>;

    fn binary(&self, op: BinaryOp, a: &DeviceBuffer, b: &DeviceBuffer) -> Result<DeviceBuffer>;

    /// `a = op(a, b)`. `a` and `b` are distinct buffers.
    fn binary_inplace(&self, op: BinaryOp, a: &DeviceBuffer, b: &DeviceBuffer) -> Result<()>;

    fn scalar(&self, op: ScalarOp, x: &DeviceBuffer, s: f32) -> Result<DeviceBuffer>;

    fn scalar_inplace(&self, op: ScalarOp, x: &DeviceBuffer, s: f32) -> Result<()>;

    //  Reductions along one axis

    /// Sum `x` (shape `shape`) along `dim`, removing that axis.
    fn sum_dim(&self, x: &DeviceBuffer, shape: &Shape, dim: usize) -> Result<DeviceBuffer>;

    fn softmax(&self, x: &DeviceBuffer, shape: &Shape, dim: usize) -> Result<DeviceBuffer>;

    /// Gradient of softmax: `out * (grad - sum(grad * out, dim))`.
    fn softmax_grad(
        &self,
        out: &DeviceBuffer,
        grad: &DeviceBuffer,
        shape: &Shape,
        dim: usize,
    ) -> Result<DeviceBuffer>;

    //  Matrix kernels

    /// `[m, k] @ [k, n]`.
    fn matmul(
        &self,
        a: &DeviceBuffer,
        b: &DeviceBuffer,
        m: usize,
        k: usize,
        n: usize,
    ) -> Result<DeviceBuffer>;

    /// `base += a @ b` with `base: [m, n]`.
    fn add_matmul(
        &self,
        base: &DeviceBuffer,
        a: &DeviceBuffer,
        b: &DeviceBuffer,
        m: usize,
        k: usize,
        n: usize,
    ) -> Result<()>;

    /// `base += matrix @ vector` with `matrix: [rows, cols]`.
    fn add_matvec(
        &self,
        base: &DeviceBuffer,
        matrix: &DeviceBuffer,
        vector: &DeviceBuffer,
        rows: usize,
        cols: usize,
    ) -> Result<()>;

    /// Zero every element of a `[rows, cols]` matrix where `col - row < k`.
    fn triu_inplace(&self, x: &DeviceBuffer, rows: usize, cols: usize, k: i64) -> Result<()>;

    //  Data movement

    /// Materialize `x` read through `layout` into a contiguous buffer
    /// (transpose and expand are both expressed this way).
    fn gather(&self, x: &DeviceBuffer, layout: &Layout) -> Result<DeviceBuffer>;

    /// Sum a `from`-shaped gradient over broadcast axes down to `to`.
    fn sum_to(&self, grad: &DeviceBuffer, from: &Shape, to: &Shape) -> Result<DeviceBuffer>;

    /// Replicate a reduced gradient back across `dim` of `input_shape`.
    fn expand_sum_grad(
        &self,
        grad: &DeviceBuffer,
        input_shape: &Shape,
        dim: usize,
    ) -> Result<DeviceBuffer>;
}
