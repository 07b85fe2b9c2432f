// Module trait — the interface every layer implements
//
// A layer owns no tensors itself: its parameters live in the `Context` like
// every other tensor and the layer keeps their ids. `forward` therefore
// takes the context it should compute in, and records the graph there
// whenever the input or the parameters track gradients.

use ember_core::error::Result;
use ember_core::op::TensorId;
use ember_core::registry::Context;

/// A differentiable layer.
///
/// # Example
/// ```ignore
/// struct TwoLayer {
///     a: Linear,
///     b: Linear,
/// }
///
/// impl Module for TwoLayer {
///     fn forward(&self, ctx: &mut Context, x: TensorId) -> Result<TensorId> {
///         let h = self.a.forward(ctx, x)?;
///         let h = ctx.sigmoid(h)?;
///         self.b.forward(ctx, h)
///     }
///     fn parameters(&self) -> Vec<TensorId> {
///         let mut p = self.a.parameters();
///         p.extend(self.b.parameters());
///         p
///     }
/// }
/// ```
pub trait Module {
    /// Compute the output tensor from `input`.
    fn forward(&self, ctx: &mut Context, input: TensorId) -> Result<TensorId>;

    /// Ids of all trainable tensors of this module.
    fn parameters(&self) -> Vec<TensorId>;

    /// Total number of scalar parameters.
    fn parameter_count(&self, ctx: &Context) -> Result<usize> {
        let mut total = 0;
        for id in self.parameters() {
            total += ctx.get(id)?.size();
        }
        Ok(total)
    }
}
