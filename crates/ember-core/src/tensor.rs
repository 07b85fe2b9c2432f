use crate::backend::Store;
use crate::layout::Layout;
use crate::op::{ChildEdge, CreationOp, TensorId};
use crate::shape::Shape;

// Tensor — one entry of the registry
//
// A Tensor is plain data: shape/strides, the numeric store, the autograd
// flags and the graph bookkeeping. It holds no references to other tensors,
// only their ids:
//
//   grad       — id of the accumulated gradient tensor (a leaf, never
//                tracking gradients itself)
//   grad_of    — set on gradient tensors: the tensor whose gradient this is
//   creators   — operands of the kernel that produced this tensor
//   children   — one slot per downstream consumer, flipped to `received`
//                when that consumer has delivered its gradient
//
// All mutation goes through `Context`, which owns every Tensor. That keeps
// the invariants (strides follow shape, grads are leaves, each child edge
// delivers at most once) in one place.

/// An N-dimensional f32 tensor owned by a [`Context`](crate::Context).
#[derive(Debug)]
pub struct Tensor {
    pub(crate) id: TensorId,
    pub(crate) layout: Layout,
    pub(crate) store: Store,
    pub(crate) autograd: bool,
    pub(crate) keepgrads: bool,
    pub(crate) grad: Option<TensorId>,
    pub(crate) grad_of: Option<TensorId>,
    pub(crate) creators: Vec<TensorId>,
    pub(crate) creation_op: Option<CreationOp>,
    pub(crate) children: Vec<ChildEdge>,
}

impl Tensor {
    pub(crate) fn new(id: TensorId, shape: Shape, store: Store) -> Self {
        Tensor {
            id,
            layout: Layout::contiguous(shape),
            store,
            autograd: false,
            keepgrads: false,
            grad: None,
            grad_of: None,
            creators: Vec::new(),
            creation_op: None,
            children: Vec::new(),
        }
    }

    /// Registry id of this tensor.
    pub fn id(&self) -> TensorId {
        self.id
    }

    pub fn shape(&self) -> &Shape {
        self.layout.shape()
    }

    pub fn dims(&self) -> &[usize] {
        self.layout.dims()
    }

    pub fn strides(&self) -> &[usize] {
        self.layout.strides()
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn rank(&self) -> usize {
        self.layout.rank()
    }

    /// Total number of elements.
    pub fn size(&self) -> usize {
        self.layout.elem_count()
    }

    /// Whether operations on this tensor record graph edges.
    pub fn autograd(&self) -> bool {
        self.autograd
    }

    pub fn keepgrads(&self) -> bool {
        self.keepgrads
    }

    /// Id of the accumulated gradient, if any has been received.
    pub fn grad(&self) -> Option<TensorId> {
        self.grad
    }

    /// Set when this tensor is the gradient of another tensor.
    pub fn grad_of(&self) -> Option<TensorId> {
        self.grad_of
    }

    pub fn creators(&self) -> &[TensorId] {
        &self.creators
    }

    pub fn creation_op(&self) -> Option<CreationOp> {
        self.creation_op
    }

    pub fn children(&self) -> &[ChildEdge] {
        &self.children
    }

    /// A leaf has no creators (user inputs, parameters, gradients).
    pub fn is_leaf(&self) -> bool {
        self.creators.is_empty()
    }

    /// Whether every downstream consumer has delivered its gradient.
    pub fn all_children_received(&self) -> bool {
        self.children.iter().all(|edge| edge.received)
    }

    pub fn is_on_device(&self) -> bool {
        self.store.is_device()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Host-resident values, or `None` while the tensor lives on a device.
    pub fn host_data(&self) -> Option<&[f32]> {
        match &self.store {
            Store::Host(v) => Some(v),
            Store::Device(_) => None,
        }
    }
}
