// Op — creation tags for the lazily recorded computation graph
//
// Every tensor produced by a differentiable kernel whose operands track
// gradients records two things:
//
//   creators:    the ids of its operand tensors, in operand order
//   creation_op: which kernel produced it (and that kernel's parameters)
//
// Example: c = a * b
//   a.creation_op = None          (leaf)
//   b.creation_op = None          (leaf)
//   c.creators    = [a, b]
//   c.creation_op = Some(MulElem)
//
// WHY IDS AND NOT REFERENCES?
//
// The graph is cyclic from an ownership point of view: a creator lists its
// children (to know when every consumer has delivered its gradient) and a
// child lists its creators. Holding owned handles both ways would leak or
// need weak pointers. Instead the registry (`Context`) owns every tensor and
// the graph only stores `TensorId`s, resolved through the registry when the
// backward pass needs them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Registry handle for a tensor. Ids are handed out in increasing order and
/// never reused within a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TensorId(pub u64);

impl TensorId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for TensorId {
    fn from(v: u64) -> Self {
        TensorId(v)
    }
}

/// The kernel that produced a derived tensor. Selects the backward formula.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CreationOp {
    AddElem,
    SubElem,
    MulElem,
    DivElem,
    /// Matrix multiply of two 2-D creators.
    MatMul,
    Sigmoid,
    Tanh,
    /// `x ^ exponent` with a scalar exponent.
    PowScalar { exponent: f32 },
    /// Sum along one axis; the axis is removed from the output shape.
    Sum { dim: usize },
    Softmax { dim: usize },
    /// Explicit broadcast of the creator to a larger shape.
    Expand,
    Contiguous,
}

impl CreationOp {
    /// Short tag used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            CreationOp::AddElem => "add_elem",
            CreationOp::SubElem => "sub_elem",
            CreationOp::MulElem => "mul_elem",
            CreationOp::DivElem => "div_elem",
            CreationOp::MatMul => "mm",
            CreationOp::Sigmoid => "sigmoid",
            CreationOp::Tanh => "tanh",
            CreationOp::PowScalar { .. } => "pow_scalar",
            CreationOp::Sum { .. } => "sum",
            CreationOp::Softmax { .. } => "softmax",
            CreationOp::Expand => "expand",
            CreationOp::Contiguous => "contiguous",
        }
    }
}

impl fmt::Display for CreationOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreationOp::PowScalar { exponent } => write!(f, "pow_scalar({exponent})"),
            CreationOp::Sum { dim } => write!(f, "sum-{dim}"),
            CreationOp::Softmax { dim } => write!(f, "softmax-{dim}"),
            other => f.write_str(other.name()),
        }
    }
}

/// One downstream consumer of a tensor, and whether it has already sent its
/// gradient contribution back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildEdge {
    pub child: TensorId,
    pub received: bool,
}

impl ChildEdge {
    pub fn pending(child: TensorId) -> Self {
        ChildEdge {
            child,
            received: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_parameters() {
        assert_eq!(CreationOp::Softmax { dim: 1 }.to_string(), "softmax-1");
        assert_eq!(CreationOp::Sum { dim: 0 }.to_string(), "sum-0");
        assert_eq!(CreationOp::MatMul.to_string(), "mm");
        assert_eq!(TensorId(7).to_string(), "#7");
    }
}
