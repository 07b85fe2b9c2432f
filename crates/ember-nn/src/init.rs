// nn::init — parameter initialization
//
// Weights start as uniform samples in [-1, 1). With a fan-in, the samples
// are scaled by sqrt(1 / fan_in) (Xavier-style) so the variance of a
// layer's output does not grow with its input width.

use rand::Rng;

/// How a layer's weights are drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Init {
    /// Uniform [-1, 1) scaled by sqrt(1 / fan_in).
    #[default]
    Xavier,
    /// Plain uniform [-1, 1).
    Uniform,
}

/// `len` uniform samples in [-1, 1), scaled by `sqrt(1 / fan_in)` when a
/// fan-in is given.
pub fn random_weights<R: Rng + ?Sized>(len: usize, fan_in: Option<usize>, rng: &mut R) -> Vec<f32> {
    let scale = match fan_in {
        Some(n) if n > 0 => (1.0 / n as f32).sqrt(),
        _ => 1.0,
    };
    (0..len)
        .map(|_| rng.gen_range(-1.0f32..1.0) * scale)
        .collect()
}

impl Init {
    /// Weights for an `[input, output]` matrix.
    pub fn weights<R: Rng + ?Sized>(self, input: usize, output: usize, rng: &mut R) -> Vec<f32> {
        match self {
            Init::Xavier => random_weights(input * output, Some(input), rng),
            Init::Uniform => random_weights(input * output, None, rng),
        }
    }
}
