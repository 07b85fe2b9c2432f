//! # Ember
//!
//! A small tensor computation engine with reverse-mode automatic
//! differentiation and interchangeable host/device execution.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust
//! use ember::prelude::*;
//!
//! # fn main() -> ember::Result<()> {
//! let mut ctx = Context::new();
//! let a = ctx.create((2,), Some(&[1.0, 2.0]), true, false)?;
//! let b = ctx.create((2,), Some(&[3.0, 4.0]), true, false)?;
//! let c = ctx.mul(a, b)?;
//! ctx.backward(c, None)?;
//! assert_eq!(ctx.grad_data(a)?, Some(vec![3.0, 4.0]));
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `ember-core` | Context registry, Shape, Layout, kernels, ComputeDevice trait, autograd, serialization |
//! | `ember-device` | Emulated compute device: buffer arena, pool, rayon workgroup dispatch |
//! | `ember-nn` | Layers (Linear) and weight initialization |

/// Re-export core types.
pub use ember_core::{
    backend::{BinaryOp, ComputeDevice, DeviceBuffer, ScalarOp, Store, UnaryOp},
    op::{ChildEdge, CreationOp, TensorId},
    Context, EngineConfig, Error, Layout, Result, Shape, Tensor, TensorRecord,
};

/// Reference host kernels.
pub use ember_core::kernels;

/// Re-export the emulated device.
pub use ember_device::{pool::PoolStats, DeviceConfig, EmulatedDevice};

/// Re-export neural network layers.
pub mod nn {
    pub use ember_nn::*;
}

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::nn::{Init, Linear, LinearDefinition, Module};
    pub use crate::{
        BinaryOp, ComputeDevice, Context, DeviceConfig, EmulatedDevice, EngineConfig, ScalarOp,
        Shape, TensorId, TensorRecord, UnaryOp,
    };
}
