//! # ember-core
//!
//! Tensor registry, kernels, device abstraction and autograd for Ember.
//!
//! This crate provides:
//! - [`Context`] — the registry that owns every tensor, addressed by [`TensorId`]
//! - [`Tensor`] — shape, strides, store and graph bookkeeping of one tensor
//! - [`Shape`] / [`Layout`] — extents, row-major strides and read patterns
//! - [`Store`] / [`ComputeDevice`] — host array or device buffer, and the
//!   device capability every kernel dispatches to
//! - [`TensorRecord`] — the flat `{ id, shape, data }` exchange record
// - Shape/Layout: shape validation and stride arithmetic
// - Backend: host/device store and the ComputeDevice trait
// - Kernels: reference host math shared with device implementations
// - Registry: Context, creation, lookup, eviction, device migration
// - Ops: the kernel library (out-of-place and in-place)
// - Backprop: reverse-mode gradients with child-completion tracking

pub mod backend;
pub mod backprop;
pub mod config;
pub mod error;
pub mod kernels;
pub mod layout;
pub mod op;
pub mod ops;
pub mod registry;
pub mod serialize;
pub mod shape;
pub mod tensor;

pub use backend::{BinaryOp, ComputeDevice, DeviceBuffer, ScalarOp, Store, UnaryOp};
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use layout::Layout;
pub use op::{ChildEdge, CreationOp, TensorId};
pub use registry::Context;
pub use serialize::TensorRecord;
pub use shape::Shape;
pub use tensor::Tensor;
