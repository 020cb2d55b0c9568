//! Cross-entropy (MLE) loss functions.

use super::causal::causal_shift;
use super::compose::masked_mean;
use super::{LossClient, prepare_targets};
use crate::error::{Error, Result};
use numr::autograd::{Var, var_gather, var_log_softmax, var_mul_scalar, var_reshape};
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Unreduced cross-entropy: `-log_softmax(logits, -1)[i, targets[i]]`
///
/// - `logits`: `[N, C]` raw model output (pre-softmax)
/// - `targets`: `[N]` integer class indices, all in `[0, C)`
///
/// Returns `[N]`, one loss per row. Masking is left to the caller, so rows that
/// should be ignored must already hold a valid placeholder index.
pub fn cross_entropy_per_position<R, C>(
    client: &C,
    logits: &Var<R>,
    targets: &Tensor<R>,
) -> Result<Var<R>>
where
    R: Runtime<DType = DType>,
    C: LossClient<R>,
    R::Client: LossClient<R>,
{
    if logits.shape().len() != 2 {
        return Err(Error::InvalidArgument {
            arg: "logits",
            reason: format!("expected [N, C], got {:?}", logits.shape()),
        });
    }
    let n = logits.shape()[0];

    let log_probs = var_log_softmax(logits, -1, client).map_err(Error::Numr)?;
    per_position_nll(client, &log_probs, targets, n)
}

/// Gather `-log_probs[i, targets[i]]` into an `[N]` loss vector.
pub(super) fn per_position_nll<R, C>(
    client: &C,
    log_probs: &Var<R>,
    targets: &Tensor<R>,
    n: usize,
) -> Result<Var<R>>
where
    R: Runtime<DType = DType>,
    C: LossClient<R>,
    R::Client: LossClient<R>,
{
    let targets_expanded = prepare_targets(targets, n)?;
    let selected = var_gather(log_probs, 1, &targets_expanded, client).map_err(Error::Numr)?;
    let nll = var_mul_scalar(&selected, -1.0, client).map_err(Error::Numr)?;
    var_reshape(&nll, &[n]).map_err(Error::Numr)
}

/// Causal LM cross-entropy averaged over non-ignored positions.
///
/// Same shift and masking conventions as
/// [`emo_causal_lm_loss`](super::emo_causal_lm_loss), without the EMO term.
///
/// - `logits`: `[B, S, V]`
/// - `labels`: `[B, S]` I64, `ignore_index` marks excluded positions
///
/// Returns scalar loss; 0.0 when every position is ignored.
pub fn mle_loss<R, C>(
    client: &C,
    logits: &Var<R>,
    labels: &Tensor<R>,
    ignore_index: i64,
) -> Result<Var<R>>
where
    R: Runtime<DType = DType>,
    C: LossClient<R>,
    R::Client: LossClient<R>,
{
    let shifted = causal_shift(client, logits, labels, ignore_index)?;
    let per_position = cross_entropy_per_position(client, &shifted.logits, &shifted.sanitized)?;
    masked_mean(client, &per_position, &shifted.mask)
}
