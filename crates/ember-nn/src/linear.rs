// Linear — fully-connected (dense) layer
//
//   y = x @ W + b
//
// PARAMETER SHAPES:
//
//   weight: [input, output]  — autograd + keepgrads
//   bias:   [1, output]      — autograd, zero-initialized
//
// The bias is added with an explicit broadcast: it is expanded to
// [batch, output] and made contiguous before the element-wise add, since
// the kernels never broadcast implicitly. The gradient of that expand sums
// the per-row bias gradients back into [1, output].
//
//   Input:  [batch, input]
//   Output: [batch, output]
//
// A layer exports itself as a LinearDefinition: its name, its dimensions
// and a TensorRecord for each parameter. Importing a definition registers
// fresh parameter tensors in the target context.

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use ember_core::bail;
use ember_core::error::{Error, Result};
use ember_core::op::TensorId;
use ember_core::registry::Context;
use ember_core::serialize::TensorRecord;
use ember_core::shape::Shape;

use crate::init::Init;
use crate::module::Module;

/// A fully-connected layer: `y = x @ W + b`.
///
/// # Examples
/// ```ignore
/// let mut ctx = Context::new();
/// let layer = Linear::new(&mut ctx, 784, 128, Init::Xavier)?;
/// let x = ctx.zeros((32, 784))?;
/// let y = layer.forward(&mut ctx, x)?; // shape: [32, 128]
/// ```
/// Layer name written into every exported definition.
pub const LINEAR_LAYER_NAME: &str = "linear";

/// Exported form of a [`Linear`] layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearDefinition {
    pub name: String,
    pub input: usize,
    pub output: usize,
    pub weight: TensorRecord,
    pub bias: TensorRecord,
}

impl LinearDefinition {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(src: &str) -> Result<Self> {
        Ok(serde_json::from_str(src)?)
    }
}

#[derive(Debug, Clone)]
pub struct Linear {
    weight: TensorId,
    bias: TensorId,
    input: usize,
    output: usize,
}

impl Linear {
    /// Create a layer with weights drawn from the thread-local RNG.
    pub fn new(ctx: &mut Context, input: usize, output: usize, init: Init) -> Result<Self> {
        Self::with_rng(ctx, input, output, init, &mut rand::thread_rng())
    }

    /// Create a layer with weights drawn from `rng`.
    pub fn with_rng<R: Rng + ?Sized>(
        ctx: &mut Context,
        input: usize,
        output: usize,
        init: Init,
        rng: &mut R,
    ) -> Result<Self> {
        let weights = init.weights(input, output, rng);
        let weight = ctx.create((input, output), Some(&weights), true, true)?;
        let bias = ctx.create((1, output), None, true, false)?;
        debug!(input, output, ?init, weight = %weight, bias = %bias, "linear");
        Ok(Linear {
            weight,
            bias,
            input,
            output,
        })
    }

    /// Build a layer around existing registry tensors (e.g. deserialized
    /// weights). Both start tracking gradients.
    pub fn from_tensors(ctx: &mut Context, weight: TensorId, bias: TensorId) -> Result<Self> {
        let (input, output) = match ctx.get(weight)?.dims() {
            &[i, o] => (i, o),
            dims => bail!("Linear weight must be 2D, got shape {}", Shape::from(dims)),
        };
        let bias_shape = ctx.get(bias)?.shape().clone();
        if bias_shape != Shape::from((1, output)) {
            return Err(Error::ShapeMismatch {
                expected: Shape::from((1, output)),
                got: bias_shape,
            });
        }
        ctx.set_autograd(weight, true)?;
        ctx.set_keepgrads(weight, true)?;
        ctx.set_autograd(bias, true)?;
        Ok(Linear {
            weight,
            bias,
            input,
            output,
        })
    }

    /// Snapshot the layer's parameters as a definition.
    pub fn definition(&self, ctx: &Context) -> Result<LinearDefinition> {
        Ok(LinearDefinition {
            name: LINEAR_LAYER_NAME.to_string(),
            input: self.input,
            output: self.output,
            weight: ctx.serialize(self.weight)?,
            bias: ctx.serialize(self.bias)?,
        })
    }

    /// Rebuild a layer from a definition. The parameters become new tensors
    /// in `ctx`; nothing is registered when the definition is rejected.
    pub fn from_definition(ctx: &mut Context, def: &LinearDefinition) -> Result<Self> {
        if def.name != LINEAR_LAYER_NAME {
            bail!("expected a {LINEAR_LAYER_NAME} layer definition, got {:?}", def.name);
        }
        for (record, expected) in [
            (&def.weight, Shape::from((def.input, def.output))),
            (&def.bias, Shape::from((1, def.output))),
        ] {
            let got = Shape::from(record.shape.as_slice());
            if got != expected {
                return Err(Error::ShapeMismatch { expected, got });
            }
        }
        let weight = ctx.deserialize(&def.weight)?;
        let bias = match ctx.deserialize(&def.bias) {
            Ok(bias) => bias,
            Err(e) => {
                ctx.remove(weight)?;
                return Err(e);
            }
        };
        debug!(input = def.input, output = def.output, weight = %weight, bias = %bias, "linear from definition");
        Self::from_tensors(ctx, weight, bias)
    }

    pub fn weight(&self) -> TensorId {
        self.weight
    }

    pub fn bias(&self) -> TensorId {
        self.bias
    }

    /// The input feature dimension.
    pub fn input(&self) -> usize {
        self.input
    }

    /// The output feature dimension.
    pub fn output(&self) -> usize {
        self.output
    }
}

impl Module for Linear {
    fn forward(&self, ctx: &mut Context, input: TensorId) -> Result<TensorId> {
        let unbiased = ctx.mm(input, self.weight)?;
        let shape = ctx.get(unbiased)?.shape().clone();
        let expanded = ctx.expand(self.bias, shape)?;
        let bias = ctx.contiguous(expanded)?;
        ctx.add(unbiased, bias)
    }

    fn parameters(&self) -> Vec<TensorId> {
        vec![self.weight, self.bias]
    }
}
