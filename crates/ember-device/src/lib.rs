// Emulated device — a software ComputeDevice with opaque buffer handles
//
// This crate provides a compute device that behaves like an accelerator as
// far as the registry can tell: tensors migrated to it hold nothing but a
// `DeviceBuffer` handle, every kernel is a dispatch on handles, and values
// only become visible to the host through `download`.
//
// ARCHITECTURE:
// - The buffer arena maps handles to f32 storage owned by the device. It
//   sits behind one Mutex; a dispatch holds it for the whole kernel, so each
//   call is atomic and synchronous from the caller's point of view.
// - Released buffers go to a size-bucketed `BufferPool` and are reused by
//   later allocations of the same length.
// - Kernels run as parallel workgroups on rayon (see `dispatch`), computing
//   each element with the same helpers as the host path.
//
// USAGE:
//   let device = Arc::new(EmulatedDevice::new(DeviceConfig::default()));
//   let mut ctx = Context::with_device(EngineConfig::default(), device);
//   let x = ctx.from_slice(&[1.0, 2.0], 2)?;
//   ctx.to_device(x)?;

mod dispatch;
pub mod pool;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::debug;

use ember_core::backend::{BinaryOp, ComputeDevice, DeviceBuffer, ScalarOp, UnaryOp};
use ember_core::error::{Error, Result};
use ember_core::layout::Layout;
use ember_core::shape::Shape;

use pool::{BufferPool, PoolStats};

/// Settings for an [`EmulatedDevice`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Elements per dispatched workgroup (default: 256).
    pub workgroup_size: usize,
    /// Cached buffers kept per size bucket (default: 64).
    pub max_cached_buffers: usize,
    /// Reported device name (default: "emulated:0").
    pub name: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            workgroup_size: 256,
            max_cached_buffers: 64,
            name: "emulated:0".to_string(),
        }
    }
}

impl DeviceConfig {
    pub fn from_json(src: &str) -> Result<Self> {
        Ok(serde_json::from_str(src)?)
    }

    pub fn with_workgroup_size(mut self, size: usize) -> Self {
        self.workgroup_size = size;
        self
    }

    pub fn with_max_cached_buffers(mut self, n: usize) -> Self {
        self.max_cached_buffers = n;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

// Arena — handle → storage

struct Arena {
    buffers: HashMap<u64, Vec<f32>>,
    next_handle: u64,
}

impl Arena {
    fn get(&self, buf: &DeviceBuffer) -> Result<&[f32]> {
        let data = self
            .buffers
            .get(&buf.handle())
            .ok_or_else(|| Error::device(format!("unknown buffer handle {}", buf.handle())))?;
        if data.len() != buf.len() {
            return Err(Error::device(format!(
                "buffer {} holds {} elements, handle claims {}",
                buf.handle(),
                data.len(),
                buf.len()
            )));
        }
        Ok(data.as_slice())
    }

    /// Take a buffer out for in-place mutation; `put` must follow.
    fn take(&mut self, buf: &DeviceBuffer) -> Result<Vec<f32>> {
        self.get(buf)?;
        self.buffers
            .remove(&buf.handle())
            .ok_or_else(|| Error::device(format!("unknown buffer handle {}", buf.handle())))
    }

    fn put(&mut self, buf: &DeviceBuffer, data: Vec<f32>) {
        self.buffers.insert(buf.handle(), data);
    }

    fn insert(&mut self, data: Vec<f32>) -> DeviceBuffer {
        let handle = self.next_handle;
        self.next_handle += 1;
        let buf = DeviceBuffer::new(handle, data.len());
        self.buffers.insert(handle, data);
        buf
    }
}

// EmulatedDevice

/// A software compute device. Share it between contexts through an `Arc`.
pub struct EmulatedDevice {
    config: DeviceConfig,
    arena: Mutex<Arena>,
    pool: BufferPool,
}

impl fmt::Debug for EmulatedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EmulatedDevice({})", self.config.name)
    }
}

impl Default for EmulatedDevice {
    fn default() -> Self {
        Self::new(DeviceConfig::default())
    }
}

impl EmulatedDevice {
    pub fn new(config: DeviceConfig) -> Self {
        let pool = BufferPool::new(config.max_cached_buffers);
        EmulatedDevice {
            config,
            arena: Mutex::new(Arena {
                buffers: HashMap::new(),
                next_handle: 1,
            }),
            pool,
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Number of live buffers.
    pub fn buffer_count(&self) -> Result<usize> {
        Ok(self.lock()?.buffers.len())
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Drop every cached (released) buffer.
    pub fn empty_cache(&self) {
        self.pool.empty_cache();
    }

    fn lock(&self) -> Result<MutexGuard<'_, Arena>> {
        self.arena
            .lock()
            .map_err(|_| Error::device("device arena lock poisoned"))
    }

    fn wg(&self) -> usize {
        self.config.workgroup_size.max(1)
    }

    /// Allocate an output of `len` elements, let `f` fill it, register it.
    fn produce(
        &self,
        len: usize,
        f: impl FnOnce(&Arena, &mut [f32]) -> Result<()>,
    ) -> Result<DeviceBuffer> {
        let mut arena = self.lock()?;
        let mut out = self.pool.alloc(len);
        if let Err(e) = f(&*arena, out.as_mut_slice()) {
            self.pool.reclaim(out);
            return Err(e);
        }
        let buf = arena.insert(out);
        debug!(device = %self.config.name, handle = buf.handle(), len, "alloc");
        Ok(buf)
    }

    /// Mutate `target` in place while reading other buffers.
    fn mutate(
        &self,
        target: &DeviceBuffer,
        f: impl FnOnce(&Arena, &mut [f32]) -> Result<()>,
    ) -> Result<()> {
        let mut arena = self.lock()?;
        let mut data = arena.take(target)?;
        let out = f(&*arena, data.as_mut_slice());
        arena.put(target, data);
        out
    }
}

impl ComputeDevice for EmulatedDevice {
    fn name(&self) -> String {
        self.config.name.clone()
    }

    fn upload(&self, data: &[f32]) -> Result<DeviceBuffer> {
        self.produce(data.len(), |_, out| {
            out.copy_from_slice(data);
            Ok(())
        })
    }

    fn download(&self, buf: &DeviceBuffer) -> Result<Vec<f32>> {
        Ok(self.lock()?.get(buf)?.to_vec())
    }

    fn release(&self, buf: &DeviceBuffer) -> Result<()> {
        let data = self.lock()?.take(buf)?;
        debug!(device = %self.config.name, handle = buf.handle(), "release");
        self.pool.reclaim(data);
        Ok(())
    }

    fn duplicate(&self, buf: &DeviceBuffer) -> Result<DeviceBuffer> {
        self.produce(buf.len(), |arena, out| {
            out.copy_from_slice(arena.get(buf)?);
            Ok(())
        })
    }

    fn fill(&self, buf: &DeviceBuffer, value: f32) -> Result<()> {
        let wg = self.wg();
        self.mutate(buf, |_, x| {
            dispatch::fill(x, value, wg);
            Ok(())
        })
    }

    fn unary(&self, op: UnaryOp, x: &DeviceBuffer) -> Result<DeviceBuffer> {
        debug!(op = op.name(), handle = x.handle(), "dispatch");
        let wg = self.wg();
        self.produce(x.len(), |arena, out| {
            dispatch::unary(op, arena.get(x)?, out, wg);
            Ok(())
        })
    }

    fn unary_inplace(&self, op: UnaryOp, x: &DeviceBuffer) -> Result<()> {
        debug!(op = op.name(), handle = x.handle(), "dispatch inplace");
        let wg = self.wg();
        self.mutate(x, |_, data| {
            dispatch::unary_inplace(op, data, wg);
            Ok(())
        })
    }

    fn binary(&self, op: BinaryOp, a: &DeviceBuffer, b: &DeviceBuffer) -> Result<DeviceBuffer> {
        debug!(op = op.name(), lhs = a.handle(), rhs = b.handle(), "dispatch");
        if a.len() != b.len() {
            return Err(Error::device(format!(
                "{}: buffer lengths {} and {} differ",
                op.name(),
                a.len(),
                b.len()
            )));
        }
        let wg = self.wg();
        self.produce(a.len(), |arena, out| {
            dispatch::binary(op, arena.get(a)?, arena.get(b)?, out, wg);
            Ok(())
        })
    }

    fn binary_inplace(&self, op: BinaryOp, a: &DeviceBuffer, b: &DeviceBuffer) -> Result<()> {
        debug!(op = op.name(), lhs = a.handle(), rhs = b.handle(), "dispatch inplace");
        if a.handle() == b.handle() || a.len() != b.len() {
            return Err(Error::device(format!(
                "{}: in-place operands must be distinct buffers of equal length",
                op.name()
            )));
        }
        let wg = self.wg();
        self.mutate(a, |arena, data| {
            dispatch::binary_inplace(op, data, arena.get(b)?, wg);
            Ok(())
        })
    }

    fn scalar(&self, op: ScalarOp, x: &DeviceBuffer, s: f32) -> Result<DeviceBuffer> {
        debug!(op = op.name(), handle = x.handle(), "dispatch");
        let wg = self.wg();
        self.produce(x.len(), |arena, out| {
            dispatch::scalar(op, arena.get(x)?, s, out, wg);
            Ok(())
        })
    }

    fn scalar_inplace(&self, op: ScalarOp, x: &DeviceBuffer, s: f32) -> Result<()> {
        debug!(op = op.name(), handle = x.handle(), "dispatch inplace");
        let wg = self.wg();
        self.mutate(x, |_, data| {
            dispatch::scalar_inplace(op, data, s, wg);
            Ok(())
        })
    }

    fn sum_dim(&self, x: &DeviceBuffer, shape: &Shape, dim: usize) -> Result<DeviceBuffer> {
        debug!(handle = x.handle(), dim, "dispatch sum");
        let out_len = shape.reduce_dim(dim)?.elem_count();
        let wg = self.wg();
        self.produce(out_len, |arena, out| {
            dispatch::sum_dim(arena.get(x)?, shape, dim, out, wg)
        })
    }

    fn softmax(&self, x: &DeviceBuffer, shape: &Shape, dim: usize) -> Result<DeviceBuffer> {
        debug!(handle = x.handle(), dim, "dispatch softmax");
        self.produce(x.len(), |arena, out| {
            dispatch::softmax(arena.get(x)?, shape, dim, out)
        })
    }

    fn softmax_grad(
        &self,
        out: &DeviceBuffer,
        grad: &DeviceBuffer,
        shape: &Shape,
        dim: usize,
    ) -> Result<DeviceBuffer> {
        debug!(out = out.handle(), grad = grad.handle(), dim, "dispatch softmax_grad");
        self.produce(out.len(), |arena, dst| {
            dispatch::softmax_grad(arena.get(out)?, arena.get(grad)?, shape, dim, dst)
        })
    }

    fn matmul(
        &self,
        a: &DeviceBuffer,
        b: &DeviceBuffer,
        m: usize,
        k: usize,
        n: usize,
    ) -> Result<DeviceBuffer> {
        debug!(lhs = a.handle(), rhs = b.handle(), m, k, n, "dispatch matmul");
        self.produce(m * n, |arena, out| {
            dispatch::matmul(arena.get(a)?, arena.get(b)?, m, k, n, out);
            Ok(())
        })
    }

    fn add_matmul(
        &self,
        base: &DeviceBuffer,
        a: &DeviceBuffer,
        b: &DeviceBuffer,
        m: usize,
        k: usize,
        n: usize,
    ) -> Result<()> {
        debug!(base = base.handle(), m, k, n, "dispatch add_matmul");
        if base.len() != m * n {
            return Err(Error::device("add_matmul: base length differs from m * n"));
        }
        self.mutate(base, |arena, acc| {
            dispatch::add_matmul(acc, arena.get(a)?, arena.get(b)?, k, n);
            Ok(())
        })
    }

    fn add_matvec(
        &self,
        base: &DeviceBuffer,
        matrix: &DeviceBuffer,
        vector: &DeviceBuffer,
        rows: usize,
        cols: usize,
    ) -> Result<()> {
        debug!(base = base.handle(), rows, cols, "dispatch add_matvec");
        if base.len() != rows {
            return Err(Error::device("add_matvec: base length differs from rows"));
        }
        let wg = self.wg();
        self.mutate(base, |arena, acc| {
            dispatch::add_matvec(acc, arena.get(matrix)?, arena.get(vector)?, cols, wg);
            Ok(())
        })
    }

    fn triu_inplace(&self, x: &DeviceBuffer, rows: usize, cols: usize, k: i64) -> Result<()> {
        debug!(handle = x.handle(), rows, cols, k, "dispatch triu");
        self.mutate(x, |_, data| {
            dispatch::triu(data, cols, k);
            Ok(())
        })
    }

    fn gather(&self, x: &DeviceBuffer, layout: &Layout) -> Result<DeviceBuffer> {
        debug!(handle = x.handle(), "dispatch gather");
        let wg = self.wg();
        self.produce(layout.elem_count(), |arena, out| {
            dispatch::gather(arena.get(x)?, layout, out, wg);
            Ok(())
        })
    }

    fn sum_to(&self, grad: &DeviceBuffer, from: &Shape, to: &Shape) -> Result<DeviceBuffer> {
        debug!(handle = grad.handle(), from = %from, to = %to, "dispatch sum_to");
        self.produce(to.elem_count(), |arena, out| {
            out.copy_from_slice(&dispatch::sum_to(arena.get(grad)?, from, to)?);
            Ok(())
        })
    }

    fn expand_sum_grad(
        &self,
        grad: &DeviceBuffer,
        input_shape: &Shape,
        dim: usize,
    ) -> Result<DeviceBuffer> {
        debug!(handle = grad.handle(), dim, "dispatch expand_sum_grad");
        self.produce(input_shape.elem_count(), |arena, out| {
            dispatch::expand_sum_grad(arena.get(grad)?, input_shape, dim, out)
        })
    }
}
