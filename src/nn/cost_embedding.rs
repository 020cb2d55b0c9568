//! Cost embedding: the token-to-vector table the EMO term measures distances in.

use crate::error::{Error, Result};
use numr::autograd::Var;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Per-token cost embedding.
///
/// weight: `[vocab_size, hidden_size]`. Only used to score predicted distributions,
/// never to produce logits.
pub struct CostEmbedding<R: Runtime> {
    weight: Var<R>,
}

impl<R: Runtime> CostEmbedding<R> {
    /// Wrap a `[vocab, hidden]` tensor; `trainable` decides whether it receives gradient.
    pub fn new(weight: Tensor<R>, trainable: bool) -> Result<Self> {
        if weight.shape().len() != 2 {
            return Err(Error::InvalidArgument {
                arg: "weight",
                reason: format!("expected [vocab, hidden], got {:?}", weight.shape()),
            });
        }
        Ok(Self {
            weight: Var::new(weight, trainable),
        })
    }

    /// Frozen copy of an output projection's weight (`lm_head`, `[vocab, hidden]`).
    ///
    /// The copy shares no gradient with the projection; later updates to the
    /// projection's parameters do not move the cost embedding.
    pub fn from_lm_head(lm_head_weight: &Var<R>) -> Result<Self> {
        Self::new(lm_head_weight.tensor().clone(), false)
    }

    pub fn vocab_size(&self) -> usize {
        self.weight.shape()[0]
    }

    pub fn hidden_size(&self) -> usize {
        self.weight.shape()[1]
    }

    pub fn weight(&self) -> &Var<R> {
        &self.weight
    }
}
