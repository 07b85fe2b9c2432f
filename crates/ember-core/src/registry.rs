use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::backend::{ComputeDevice, Store};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::op::{ChildEdge, CreationOp, TensorId};
use crate::shape::Shape;
use crate::tensor::Tensor;

// Context — the tensor registry
//
// The Context is the single owner of every tensor. Everything else (the
// computation graph, gradients, external callers) refers to tensors by
// `TensorId` and resolves them through `get` / `get_mut`. Because ownership
// lives in exactly one map, a creator and its children can point at each
// other without reference cycles.
//
// A Context also carries:
//   - the engine configuration (first id, gradient release policy),
//   - an optional compute device (`Arc<dyn ComputeDevice>`) used by every
//     kernel whose operands live in device buffers,
//   - the recording flag: while it is off (`no_grad`), kernels produce plain
//     leaves and never record graph edges. The backward pass runs with
//     recording off so gradients are always leaves.
//
// Several contexts can coexist; nothing here is global.

/// Owner of all tensors, the attached compute device and the engine settings.
#[derive(Debug)]
pub struct Context {
    tensors: HashMap<TensorId, Tensor>,
    next_id: u64,
    config: EngineConfig,
    device: Option<Arc<dyn ComputeDevice>>,
    recording: bool,
}

impl Default for Context {
    fn default() -> Self {
        Self::with_config(EngineConfig::default())
    }
}

impl Context {
    /// A host-only context with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Context {
            tensors: HashMap::new(),
            next_id: config.first_id,
            config,
            device: None,
            recording: true,
        }
    }

    /// A context that can migrate tensors to `device`.
    pub fn with_device(config: EngineConfig, device: Arc<dyn ComputeDevice>) -> Self {
        let mut ctx = Self::with_config(config);
        ctx.attach_device(device);
        ctx
    }

    pub fn attach_device(&mut self, device: Arc<dyn ComputeDevice>) {
        debug!(device = %device.name(), "attach device");
        self.device = Some(device);
    }

    pub fn device(&self) -> Option<&Arc<dyn ComputeDevice>> {
        self.device.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // Creation

    /// Register a new leaf tensor.
    ///
    /// Without `data` the tensor is zero-filled. The data length must equal
    /// the product of the shape.
    pub fn create(
        &mut self,
        shape: impl Into<Shape>,
        data: Option<&[f32]>,
        autograd: bool,
        keepgrads: bool,
    ) -> Result<TensorId> {
        let shape = shape.into();
        shape.validate()?;
        let size = shape.elem_count();
        let values = match data {
            Some(d) if d.len() != size => {
                return Err(Error::ElementCountMismatch {
                    shape,
                    expected: size,
                    got: d.len(),
                })
            }
            Some(d) => d.to_vec(),
            None => vec![0.0; size],
        };
        let id = self.register(shape, Store::Host(values));
        let tensor = self.get_mut(id)?;
        tensor.autograd = autograd;
        tensor.keepgrads = keepgrads;
        Ok(id)
    }

    pub fn from_slice(&mut self, data: &[f32], shape: impl Into<Shape>) -> Result<TensorId> {
        self.create(shape, Some(data), false, false)
    }

    pub fn zeros(&mut self, shape: impl Into<Shape>) -> Result<TensorId> {
        self.create(shape, None, false, false)
    }

    pub fn ones(&mut self, shape: impl Into<Shape>) -> Result<TensorId> {
        self.full(shape, 1.0)
    }

    pub fn full(&mut self, shape: impl Into<Shape>, value: f32) -> Result<TensorId> {
        let shape = shape.into();
        shape.validate()?;
        let data = vec![value; shape.elem_count()];
        self.create(shape, Some(&data), false, false)
    }

    /// A ones tensor with the shape and backend of `id`.
    pub fn ones_like(&mut self, id: TensorId) -> Result<TensorId> {
        let t = self.get(id)?;
        let shape = t.shape().clone();
        let store = self.filled_store(shape.elem_count(), 1.0, t.is_on_device())?;
        Ok(self.register(shape, store))
    }

    // Lookup

    pub fn get(&self, id: TensorId) -> Result<&Tensor> {
        self.tensors.get(&id).ok_or(Error::NotFound(id))
    }

    pub fn get_mut(&mut self, id: TensorId) -> Result<&mut Tensor> {
        self.tensors.get_mut(&id).ok_or(Error::NotFound(id))
    }

    pub fn contains(&self, id: TensorId) -> bool {
        self.tensors.contains_key(&id)
    }

    /// Number of registered tensors, gradients included.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// All registered ids in creation order.
    pub fn ids(&self) -> Vec<TensorId> {
        let mut ids: Vec<TensorId> = self.tensors.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Evict a tensor from the registry.
    ///
    /// A device buffer is released back to the device, and the tensor's
    /// gradient is evicted with it. The returned tensor keeps its metadata;
    /// if it lived on the device its buffer handle is no longer valid.
    pub fn remove(&mut self, id: TensorId) -> Result<Tensor> {
        if let Store::Device(buf) = &self.get(id)?.store {
            self.require_device()?.release(buf)?;
        }
        let tensor = self.tensors.remove(&id).ok_or(Error::NotFound(id))?;
        debug!(tensor = %id, "remove");
        if let Some(grad) = tensor.grad {
            if self.contains(grad) {
                self.remove(grad)?;
            }
        }
        if let Some(owner) = tensor.grad_of {
            if let Some(owner) = self.tensors.get_mut(&owner) {
                if owner.grad == Some(id) {
                    owner.grad = None;
                }
            }
        }
        Ok(tensor)
    }

    // Flags and values

    /// Turn gradient tracking on or off. A gradient tensor may never track
    /// gradients itself.
    pub fn set_autograd(&mut self, id: TensorId, autograd: bool) -> Result<()> {
        let tensor = self.get_mut(id)?;
        if autograd && tensor.grad_of.is_some() {
            return Err(Error::GradHasGrad(id));
        }
        tensor.autograd = autograd;
        Ok(())
    }

    pub fn set_keepgrads(&mut self, id: TensorId, keepgrads: bool) -> Result<()> {
        self.get_mut(id)?.keepgrads = keepgrads;
        Ok(())
    }

    /// The tensor's values in row-major order, read back from the device
    /// when necessary.
    pub fn data(&self, id: TensorId) -> Result<Vec<f32>> {
        match &self.get(id)?.store {
            Store::Host(v) => Ok(v.clone()),
            Store::Device(buf) => self.require_device()?.download(buf),
        }
    }

    pub fn grad(&self, id: TensorId) -> Result<Option<TensorId>> {
        Ok(self.get(id)?.grad)
    }

    /// Values of the accumulated gradient, if any.
    pub fn grad_data(&self, id: TensorId) -> Result<Option<Vec<f32>>> {
        match self.get(id)?.grad {
            Some(g) => self.data(g).map(Some),
            None => Ok(None),
        }
    }

    /// Drop the accumulated gradient.
    pub fn zero_grad(&mut self, id: TensorId) -> Result<()> {
        if let Some(grad) = self.get_mut(id)?.grad.take() {
            self.remove(grad)?;
        }
        Ok(())
    }

    // Device migration

    /// Move a tensor (and its gradient) into a device buffer. No-op if it is
    /// already there.
    pub fn to_device(&mut self, id: TensorId) -> Result<TensorId> {
        let device = self.require_device()?;
        let grad = self.get(id)?.grad;
        self.upload_store(&device, id)?;
        if let Some(g) = grad {
            self.upload_store(&device, g)?;
        }
        Ok(id)
    }

    /// Move a tensor (and its gradient) back to host memory. No-op if it is
    /// already there.
    pub fn to_host(&mut self, id: TensorId) -> Result<TensorId> {
        let grad = self.get(id)?.grad;
        self.download_store(id)?;
        if let Some(g) = grad {
            self.download_store(g)?;
        }
        Ok(id)
    }

    fn upload_store(&mut self, device: &Arc<dyn ComputeDevice>, id: TensorId) -> Result<()> {
        let tensor = self.get_mut(id)?;
        if let Store::Host(values) = &tensor.store {
            let buf = device.upload(values)?;
            debug!(tensor = %id, handle = buf.handle(), "to_device");
            tensor.store = Store::Device(buf);
        }
        Ok(())
    }

    fn download_store(&mut self, id: TensorId) -> Result<()> {
        let buf = match &self.get(id)?.store {
            Store::Host(_) => return Ok(()),
            Store::Device(buf) => buf.clone(),
        };
        let device = self.require_device()?;
        let values = device.download(&buf)?;
        self.get_mut(id)?.store = Store::Host(values);
        device.release(&buf)?;
        debug!(tensor = %id, "to_host");
        Ok(())
    }

    // Recording

    /// Run `f` with graph recording disabled.
    pub fn no_grad<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        let prev = std::mem::replace(&mut self.recording, false);
        let out = f(self);
        self.recording = prev;
        out
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    // Crate-internal helpers shared by the kernels and the backward pass

    pub(crate) fn require_device(&self) -> Result<Arc<dyn ComputeDevice>> {
        self.device.clone().ok_or(Error::NoDevice)
    }

    /// Insert a plain leaf (no autograd, no graph links) and return its id.
    pub(crate) fn register(&mut self, shape: Shape, store: Store) -> TensorId {
        let id = TensorId(self.next_id);
        self.next_id += 1;
        debug!(tensor = %id, shape = %shape, device = store.is_device(), "create");
        self.tensors.insert(id, Tensor::new(id, shape, store));
        id
    }

    /// Insert a kernel output. When recording is on and any creator tracks
    /// gradients, the output records its creators and creation op and
    /// becomes a pending child of every creator that tracks gradients.
    pub(crate) fn register_derived(
        &mut self,
        shape: Shape,
        store: Store,
        op: CreationOp,
        creators: &[TensorId],
    ) -> TensorId {
        let id = self.register(shape, store);
        let tracks = self.recording
            && creators
                .iter()
                .any(|c| self.tensors.get(c).is_some_and(|t| t.autograd));
        if !tracks {
            return id;
        }
        for creator in creators {
            if let Some(t) = self.tensors.get_mut(creator).filter(|t| t.autograd) {
                t.children.push(ChildEdge::pending(id));
            }
        }
        if let Some(out) = self.tensors.get_mut(&id) {
            out.autograd = true;
            out.creators = creators.to_vec();
            out.creation_op = Some(op);
        }
        id
    }

    /// Temporarily take `id` out of the registry so it can be mutated while
    /// other tensors are read. It is put back whatever `f` returns.
    pub(crate) fn with_detached<R>(
        &mut self,
        id: TensorId,
        f: impl FnOnce(&Self, &mut Tensor) -> Result<R>,
    ) -> Result<R> {
        let mut tensor = self.tensors.remove(&id).ok_or(Error::NotFound(id))?;
        let out = f(self, &mut tensor);
        self.tensors.insert(id, tensor);
        out
    }

    /// Swap in a new store, releasing the old device buffer if there was one.
    pub(crate) fn replace_store(&mut self, id: TensorId, store: Store) -> Result<()> {
        let old = std::mem::replace(&mut self.get_mut(id)?.store, store);
        if let Store::Device(buf) = old {
            self.require_device()?.release(&buf)?;
        }
        Ok(())
    }

    pub(crate) fn filled_store(&self, len: usize, value: f32, on_device: bool) -> Result<Store> {
        let values = vec![value; len];
        if on_device {
            Ok(Store::Device(self.require_device()?.upload(&values)?))
        } else {
            Ok(Store::Host(values))
        }
    }

    /// An independent copy of a store on the same backend.
    pub(crate) fn copy_store(&self, store: &Store) -> Result<Store> {
        match store {
            Store::Host(v) => Ok(Store::Host(v.clone())),
            Store::Device(buf) => Ok(Store::Device(self.require_device()?.duplicate(buf)?)),
        }
    }

    /// A plain leaf holding a copy of `id`'s values.
    pub(crate) fn duplicate(&mut self, id: TensorId) -> Result<TensorId> {
        let src = self.get(id)?;
        let shape = src.shape().clone();
        let store = self.copy_store(&src.store)?;
        Ok(self.register(shape, store))
    }
}
