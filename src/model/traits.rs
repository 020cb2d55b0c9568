//! Backbone trait

use crate::error::Result;
use crate::nn::loss::LossClient;
use numr::autograd::Var;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Trait alias for the client bounds a backbone forward pass may rely on.
///
/// The adapter hands the same client to the loss, so this is exactly [`LossClient`].
pub trait ModelClient<R: Runtime>: LossClient<R> {}

impl<R: Runtime, C: LossClient<R>> ModelClient<R> for C {}

/// Output of a backbone forward pass.
pub struct BackboneOutput<R: Runtime> {
    /// `[B, S, vocab_size]`, unshifted
    pub logits: Var<R>,
    /// Everything else the backbone produced (hidden states, cache entries, ...),
    /// passed through untouched.
    pub aux: Vec<Var<R>>,
}

impl<R: Runtime> BackboneOutput<R> {
    pub fn new(logits: Var<R>) -> Self {
        Self {
            logits,
            aux: Vec::new(),
        }
    }

    pub fn with_aux(mut self, aux: Vec<Var<R>>) -> Self {
        self.aux = aux;
        self
    }
}

/// A causal language model without its loss.
///
/// Maps token ids (and an optional attention mask) to per-position logits over a
/// fixed vocabulary. Attention, position encoding and weight loading are the
/// implementor's business; the EMO adapter only consumes the logits.
pub trait CausalLmBackbone<R: Runtime> {
    /// Forward pass: input_ids `[B, S]` -> logits `[B, S, vocab_size]`
    fn forward<C>(
        &self,
        client: &C,
        input_ids: &Tensor<R>,
        attention_mask: Option<&Tensor<R>>,
    ) -> Result<BackboneOutput<R>>
    where
        C: ModelClient<R>,
        R::Client: ModelClient<R>;

    /// Size of the output vocabulary (last logits dimension)
    fn vocab_size(&self) -> usize;
}
