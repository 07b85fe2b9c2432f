//! # ember-nn
//!
//! Neural network layers for Ember.
//!
//! Layers keep the ids of their parameters; the tensors themselves live in
//! the [`Context`](ember_core::Context) the layer was created in.
//!
//! - [`Module`] — the layer trait (`forward`, `parameters`)
//! - [`Linear`] — fully-connected layer, `y = x @ W + b`, exportable as a
//!   [`LinearDefinition`]
//! - [`init`] — weight initializers

pub mod init;
pub mod linear;
pub mod module;

pub use init::{random_weights, Init};
pub use linear::{Linear, LinearDefinition};
pub use module::Module;
