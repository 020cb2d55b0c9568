//! Loss functions for causal language model fine-tuning.
//!
//! | Function | Use case |
//! |---|---|
//! | [`emo_causal_lm_loss`] | MLE + embedding-space (EMO) objective, the training loss |
//! | [`mle_loss`] | Plain masked next-token cross-entropy (baseline / evaluation) |
//! | [`cross_entropy_per_position`] | Unreduced cross-entropy, one value per row |
//! | [`emo_per_position`] | Unreduced EMO divergence, one value per row |
//!
//! All of them follow the causal LM convention: logits `[B, S, V]` and labels `[B, S]`
//! are shifted by one ([`CausalTargets`]) and labels equal to the ignore index are
//! excluded through a mask rather than by branching on data.

pub mod causal;
pub mod compose;
pub mod cross_entropy;
pub mod emo;

pub use causal::{CausalTargets, IGNORE_INDEX, causal_shift};
pub use compose::{
    EmoLossOutput, EmoLossStats, EmoVariant, MASK_EPS, PerPositionLoss, RATIO_EPS,
    emo_causal_lm_loss, masked_mean,
};
pub use cross_entropy::{cross_entropy_per_position, mle_loss};
pub use emo::{
    ONE_HOT_EPS, emo_per_position, normalize_rows, one_hot, stable_one_hot,
    target_representation,
};

use crate::error::{Error, Result};
use numr::autograd::Var;
use numr::dtype::DType;
use numr::ops::{
    ActivationOps, BinaryOps, CompareOps, IndexingOps, MatmulOps, ReduceOps, ScalarOps, TensorOps,
    TypeConversionOps, UnaryOps, UtilityOps,
};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;

/// Trait alias for the client bounds required by the loss functions in this module.
pub trait LossClient<R: Runtime>:
    RuntimeClient<R>
    + TensorOps<R>
    + ActivationOps<R>
    + BinaryOps<R>
    + UnaryOps<R>
    + ReduceOps<R>
    + ScalarOps<R>
    + IndexingOps<R>
    + MatmulOps<R>
    + CompareOps<R>
    + TypeConversionOps<R>
    + UtilityOps<R>
{
}

impl<R, C> LossClient<R> for C
where
    R: Runtime,
    C: RuntimeClient<R>
        + TensorOps<R>
        + ActivationOps<R>
        + BinaryOps<R>
        + UnaryOps<R>
        + ReduceOps<R>
        + ScalarOps<R>
        + IndexingOps<R>
        + MatmulOps<R>
        + CompareOps<R>
        + TypeConversionOps<R>
        + UtilityOps<R>,
{
}

/// Expand flat targets `[N]` to `[N, 1]` for gather operations.
fn prepare_targets<R: Runtime<DType = DType>>(targets: &Tensor<R>, n: usize) -> Result<Tensor<R>> {
    targets
        .reshape(&[n])
        .and_then(|t| t.unsqueeze(1))
        .and_then(|t| t.broadcast_to(&[n, 1]))
        .map_err(Error::Numr)
}

/// Wrap a raw tensor as a constant: gradients never flow into it.
fn constant<R: Runtime>(tensor: Tensor<R>) -> Var<R> {
    Var::new(tensor, false)
}

/// Stop-gradient: same values, no connection to the autograd graph.
fn detach<R: Runtime>(var: &Var<R>) -> Var<R> {
    constant(var.tensor().clone())
}
