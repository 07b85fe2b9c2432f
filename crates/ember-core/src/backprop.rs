// Backpropagation — reverse-mode gradients with child-completion tracking
//
// Every derived tensor knows its creators, and every creator keeps one
// `ChildEdge` per consumer. A backward call walks the graph from a tensor
// towards the leaves:
//
//   1. The incoming gradient (ones when none is given) is accumulated into
//      the tensor's `grad`: adopted when it is the first contribution,
//      added in place otherwise.
//   2. When the call came through a child edge, that edge is marked
//      `received`. Each edge delivers exactly once; a second delivery is a
//      `DoubleBackward` error.
//   3. The tensor propagates into its creators only when it was called
//      directly, or when every child has now delivered. Until then the
//      gradient is incomplete and propagating would double count.
//   4. Propagation computes one gradient per creator from the accumulated
//      gradient and the creation op, then recurses with this tensor as the
//      origin edge.
//
// Example: y = (x1 + x2) * x3
//
//   backward(y)           grad_y = 1
//     └─ MulBackward       s  gets grad_y * x3,   x3 gets grad_y * s
//          └─ AddBackward  x1 gets grad_s,        x2 gets grad_s
//
// Gradients are computed with recording off, so they never grow graph edges
// of their own and are always leaves. Each creator receives a tensor made
// for it alone, so no two tensors share a gradient.
//
// Validation happens before anything is marked or accumulated: a propagating
// call first checks that every creator still has an open slot for this
// child, so a repeated backward fails without touching any state.

use tracing::{debug, debug_span, trace};

use crate::error::{Error, Result};
use crate::op::{CreationOp, TensorId};
use crate::registry::Context;

impl Context {
    /// Run the backward pass from `id`.
    ///
    /// `grad` must have the same shape and backend as `id` and must not track
    /// gradients itself; when omitted a ones tensor is used. A mismatched
    /// gradient for a sum output is an `InvalidOperation`, any other mismatch
    /// a `ShapeMismatch`. The given gradient is copied, never adopted. A
    /// tensor with `autograd == false` makes this a no-op.
    pub fn backward(&mut self, id: TensorId, grad: Option<TensorId>) -> Result<()> {
        let target = self.get(id)?;
        if !target.autograd {
            return Ok(());
        }
        debug!(tensor = %id, "backward");
        let owned = match grad {
            Some(g) => {
                let incoming = self.get(g)?;
                if incoming.autograd {
                    return Err(Error::GradHasGrad(g));
                }
                if let Some(CreationOp::Sum { .. }) = target.creation_op() {
                    if incoming.shape() != target.shape() || incoming.strides() != target.strides() {
                        return Err(Error::InvalidOperation(format!(
                            "sum gradient {} does not match output {} of tensor {id}",
                            incoming.shape(),
                            target.shape()
                        )));
                    }
                } else if incoming.shape() != target.shape() {
                    return Err(Error::ShapeMismatch {
                        expected: target.shape().clone(),
                        got: incoming.shape().clone(),
                    });
                }
                if incoming.is_on_device() != target.is_on_device() {
                    return Err(Error::BackendMismatch { lhs: id, rhs: g });
                }
                self.duplicate(g)?
            }
            None => self.ones_like(id)?,
        };
        self.backward_from(id, owned, None)
    }

    /// Deliver `grad` (owned by this call) to `id`, arriving through the
    /// child edge `origin` when there is one.
    fn backward_from(
        &mut self,
        id: TensorId,
        grad: TensorId,
        origin: Option<TensorId>,
    ) -> Result<()> {
        match self.receive(id, grad, origin) {
            Ok(true) => self.propagate(id),
            Ok(false) => Ok(()),
            Err(e) => {
                if self.contains(grad) {
                    self.remove(grad)?;
                }
                Err(e)
            }
        }
    }

    /// Validate, mark the child edge and accumulate. Returns whether `id`
    /// is now ready to propagate into its creators.
    fn receive(&mut self, id: TensorId, grad: TensorId, origin: Option<TensorId>) -> Result<bool> {
        let tensor = self.get(id)?;
        if !tensor.autograd {
            self.remove(grad)?;
            return Ok(false);
        }

        let slot = match origin {
            Some(child) => Some(
                tensor
                    .children
                    .iter()
                    .position(|edge| edge.child == child && !edge.received)
                    .ok_or(Error::DoubleBackward { tensor: id, child })?,
            ),
            None => None,
        };
        let ready = !tensor.is_leaf()
            && match slot {
                None => true,
                Some(s) => tensor
                    .children
                    .iter()
                    .enumerate()
                    .all(|(i, edge)| edge.received || i == s),
            };
        if ready {
            self.check_creator_slots(id)?;
        }

        if let Some(s) = slot {
            self.get_mut(id)?.children[s].received = true;
        }
        match self.get(id)?.grad {
            None => {
                trace!(tensor = %id, grad = %grad, "adopt grad");
                self.get_mut(grad)?.grad_of = Some(id);
                self.get_mut(id)?.grad = Some(grad);
            }
            Some(acc) => {
                trace!(tensor = %id, grad = %grad, "accumulate grad");
                self.no_grad(|ctx| ctx.add_(acc, grad))?;
                self.remove(grad)?;
            }
        }
        Ok(ready)
    }

    /// Every tracking creator must still have an open edge for `id`, one per
    /// operand position it occupies (`x * x` needs two).
    fn check_creator_slots(&self, id: TensorId) -> Result<()> {
        let creators = &self.get(id)?.creators;
        for (pos, creator) in creators.iter().enumerate() {
            if creators[..pos].contains(creator) {
                continue;
            }
            let c = self.get(*creator)?;
            if !c.autograd {
                continue;
            }
            let needed = creators.iter().filter(|other| *other == creator).count();
            let open = c
                .children
                .iter()
                .filter(|edge| edge.child == id && !edge.received)
                .count();
            if open < needed {
                return Err(Error::DoubleBackward {
                    tensor: *creator,
                    child: id,
                });
            }
        }
        Ok(())
    }

    fn propagate(&mut self, id: TensorId) -> Result<()> {
        let tensor = self.get(id)?;
        let op = tensor.creation_op.ok_or_else(|| {
            Error::InvalidOperation(format!("derived tensor {id} has no creation op"))
        })?;
        let grad = tensor.grad.ok_or_else(|| {
            Error::InvalidOperation(format!("tensor {id} has no gradient to propagate"))
        })?;
        let creators = tensor.creators.clone();
        let keep = tensor.keepgrads || !self.config().release_intermediate_grads;

        let contributions = self.no_grad(|ctx| ctx.creator_grads(id, op, &creators, grad))?;

        let mut pending = creators.iter().zip(contributions);
        while let Some((creator, contribution)) = pending.next() {
            let Some(g) = contribution else { continue };
            if let Err(e) = self.backward_from(*creator, g, Some(id)) {
                for (_, rest) in pending.by_ref() {
                    if let Some(r) = rest {
                        self.remove(r)?;
                    }
                }
                return Err(e);
            }
        }

        if !keep {
            self.zero_grad(id)?;
        }
        Ok(())
    }

    /// One fresh gradient tensor per creator that tracks gradients, `None`
    /// for creators that do not.
    fn creator_grads(
        &mut self,
        id: TensorId,
        op: CreationOp,
        creators: &[TensorId],
        grad: TensorId,
    ) -> Result<Vec<Option<TensorId>>> {
        let mut wants = Vec::with_capacity(creators.len());
        for c in creators {
            wants.push(self.get(*c)?.autograd);
        }
        let want = |i: usize| wants.get(i).copied().unwrap_or(false);

        match op {
            CreationOp::AddElem => {
                let _span = debug_span!("AddBackward", tensor = %id).entered();
                Ok(vec![
                    self.grad_if(want(0), |ctx| ctx.duplicate(grad))?,
                    self.grad_if(want(1), |ctx| ctx.duplicate(grad))?,
                ])
            }
            CreationOp::SubElem => {
                let _span = debug_span!("SubBackward", tensor = %id).entered();
                Ok(vec![
                    self.grad_if(want(0), |ctx| ctx.duplicate(grad))?,
                    self.grad_if(want(1), |ctx| ctx.neg(grad))?,
                ])
            }
            CreationOp::MulElem => {
                let _span = debug_span!("MulBackward", tensor = %id).entered();
                let (a, b) = (creators[0], creators[1]);
                Ok(vec![
                    self.grad_if(want(0), |ctx| ctx.mul(grad, b))?,
                    self.grad_if(want(1), |ctx| ctx.mul(grad, a))?,
                ])
            }
            CreationOp::DivElem => {
                // Each side is divided by the other operand.
                let _span = debug_span!("DivBackward", tensor = %id).entered();
                let (a, b) = (creators[0], creators[1]);
                Ok(vec![
                    self.grad_if(want(0), |ctx| ctx.div(grad, b))?,
                    self.grad_if(want(1), |ctx| ctx.div(grad, a))?,
                ])
            }
            CreationOp::MatMul => {
                let _span = debug_span!("MatMulBackward", tensor = %id).entered();
                let (a, b) = (creators[0], creators[1]);
                Ok(vec![
                    self.grad_if(want(0), |ctx| {
                        let bt = ctx.transpose(b)?;
                        let out = ctx.mm(grad, bt);
                        ctx.remove(bt)?;
                        out
                    })?,
                    self.grad_if(want(1), |ctx| {
                        let at = ctx.transpose(a)?;
                        let out = ctx.mm(at, grad);
                        ctx.remove(at)?;
                        out
                    })?,
                ])
            }
            CreationOp::Sigmoid => {
                let _span = debug_span!("SigmoidBackward", tensor = %id).entered();
                // grad * out * (1 - out)
                Ok(vec![self.grad_if(want(0), |ctx| {
                    let t = ctx.neg(id)?;
                    ctx.add_scalar_(t, 1.0)?;
                    ctx.mul_(t, id)?;
                    ctx.mul_(t, grad)
                })?])
            }
            CreationOp::Tanh => {
                let _span = debug_span!("TanhBackward", tensor = %id).entered();
                // grad * (1 - out^2)
                Ok(vec![self.grad_if(want(0), |ctx| {
                    let t = ctx.mul(id, id)?;
                    ctx.neg_(t)?;
                    ctx.add_scalar_(t, 1.0)?;
                    ctx.mul_(t, grad)
                })?])
            }
            CreationOp::PowScalar { exponent } => {
                let _span = debug_span!("PowBackward", tensor = %id, exponent).entered();
                let x = creators[0];
                Ok(vec![self.grad_if(want(0), |ctx| {
                    let t = ctx.duplicate(x)?;
                    ctx.mul_(t, grad)?;
                    ctx.mul_scalar_(t, exponent)
                })?])
            }
            CreationOp::Sum { dim } => {
                let _span = debug_span!("SumBackward", tensor = %id, dim).entered();
                let input_shape = self.get(creators[0])?.shape().clone();
                Ok(vec![self.grad_if(want(0), |ctx| {
                    ctx.expand_sum_grad(grad, &input_shape, dim)
                })?])
            }
            CreationOp::Softmax { dim } => {
                let _span = debug_span!("SoftmaxBackward", tensor = %id, dim).entered();
                Ok(vec![self.grad_if(want(0), |ctx| ctx.softmax_grad(id, grad, dim))?])
            }
            CreationOp::Expand => {
                let _span = debug_span!("ExpandBackward", tensor = %id).entered();
                let source = self.get(creators[0])?.shape().clone();
                Ok(vec![self.grad_if(want(0), |ctx| ctx.sum_to(grad, &source))?])
            }
            CreationOp::Contiguous => {
                let _span = debug_span!("ContiguousBackward", tensor = %id).entered();
                Ok(vec![self.grad_if(want(0), |ctx| ctx.duplicate(grad))?])
            }
        }
    }

    fn grad_if(
        &mut self,
        wanted: bool,
        f: impl FnOnce(&mut Self) -> Result<TensorId>,
    ) -> Result<Option<TensorId>> {
        if wanted {
            f(self).map(Some)
        } else {
            Ok(None)
        }
    }
}
