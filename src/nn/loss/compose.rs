//! Composition of the MLE and EMO terms into one training loss.

use super::causal::causal_shift;
use super::cross_entropy::per_position_nll;
use super::emo::{check_embedding_rows, emo_from_logits, normalize_rows, one_hot};
use super::{LossClient, constant, detach};
use crate::config::EmoConfig;
use crate::error::{Error, Result};
use numr::autograd::{Var, var_add, var_div, var_log_softmax, var_mul, var_mul_scalar, var_sum};
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;
use serde::{Deserialize, Serialize};

/// Guard added to the denominator of the detached MLE/EMO ratio.
pub const RATIO_EPS: f64 = 1e-10;

/// Guard added to the valid-token count so an all-ignored batch reduces to 0.
pub const MASK_EPS: f64 = 1e-15;

/// How the EMO term is weighted against the MLE term.
///
/// Both variants scale one term by a detached ratio of the two, so the ratio
/// acts as a per-position constant during backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmoVariant {
    /// `w = min(mle / (emo + eps), cap)`, `loss = (w * emo + mle) / 2`.
    ///
    /// Gradient reaches the logits and, when trainable, the cost embedding.
    #[default]
    CappedRatio,
    /// `w = emo / (mle + eps)`, `loss = w * mle + emo`.
    ///
    /// The cost embedding is detached: only the logits receive gradient.
    InverseRatio,
}

/// Detached per-position terms, each `[N]` over the shifted positions.
pub struct PerPositionLoss<R: Runtime> {
    /// Cross-entropy per position.
    pub mle: Tensor<R>,
    /// EMO divergence per position.
    pub emo: Tensor<R>,
    /// The detached ratio weight used in composition.
    pub weight: Tensor<R>,
    /// Composed loss per position, before masking.
    pub composed: Tensor<R>,
    /// 1.0 for positions that count, 0.0 for ignored ones.
    pub mask: Tensor<R>,
}

/// Result of [`emo_causal_lm_loss`].
pub struct EmoLossOutput<R: Runtime> {
    /// Scalar training loss, attached to the autograd graph.
    pub loss: Var<R>,
    /// Detached per-position values for logging and inspection.
    pub per_position: PerPositionLoss<R>,
}

/// MLE + EMO loss for a causal language model.
///
/// - `logits`: `[B, S, V]` backbone output (pre-softmax), unshifted
/// - `labels`: `[B, S]` I64, `config.ignore_index` marks excluded positions
/// - `cost_embedding`: `[V, H]` cost embedding, normalized internally on a copy
///
/// Returns a scalar loss equal to `sum(composed * mask) / (sum(mask) + 1e-15)`.
/// The composition follows `config.variant`; see [`EmoVariant`].
pub fn emo_causal_lm_loss<R, C>(
    client: &C,
    logits: &Var<R>,
    labels: &Tensor<R>,
    cost_embedding: &Var<R>,
    config: &EmoConfig,
) -> Result<EmoLossOutput<R>>
where
    R: Runtime<DType = DType>,
    C: LossClient<R>,
    R::Client: LossClient<R>,
{
    let shifted = causal_shift(client, logits, labels, config.ignore_index)?;
    let n = shifted.num_rows();
    let vocab_size = shifted.vocab_size();
    check_embedding_rows(cost_embedding, vocab_size)?;

    let log_probs = var_log_softmax(&shifted.logits, -1, client).map_err(Error::Numr)?;
    let mle = per_position_nll(client, &log_probs, &shifted.sanitized, n)?;

    let one_hot = one_hot(
        client,
        &shifted.sanitized,
        vocab_size,
        shifted.logits.tensor().dtype(),
    )?;
    let embedding = match config.variant {
        EmoVariant::CappedRatio => normalize_rows(client, cost_embedding)?,
        EmoVariant::InverseRatio => normalize_rows(client, &detach(cost_embedding))?,
    };
    let emo = emo_from_logits(client, &shifted.logits, &one_hot, &embedding)?;

    let (weight, composed) = compose(client, config, &mle, &emo)?;
    let loss = masked_mean(client, &composed, &shifted.mask)?;

    Ok(EmoLossOutput {
        loss,
        per_position: PerPositionLoss {
            mle: mle.tensor().clone(),
            emo: emo.tensor().clone(),
            weight,
            composed: composed.tensor().clone(),
            mask: shifted.mask,
        },
    })
}

/// Combine per-position MLE and EMO values. Returns `(weight, composed)`.
fn compose<R, C>(
    client: &C,
    config: &EmoConfig,
    mle: &Var<R>,
    emo: &Var<R>,
) -> Result<(Tensor<R>, Var<R>)>
where
    R: Runtime<DType = DType>,
    C: LossClient<R>,
    R::Client: LossClient<R>,
{
    match config.variant {
        EmoVariant::CappedRatio => {
            let denom = client
                .add_scalar(emo.tensor(), RATIO_EPS)
                .map_err(Error::Numr)?;
            let ratio = client.div(mle.tensor(), &denom).map_err(Error::Numr)?;
            let cap = Tensor::<R>::full_scalar(
                ratio.shape(),
                ratio.dtype(),
                config.ratio_cap,
                ratio.device(),
            );
            let weight = client.minimum(&ratio, &cap).map_err(Error::Numr)?;

            let weighted =
                var_mul(&constant(weight.clone()), emo, client).map_err(Error::Numr)?;
            let sum = var_add(&weighted, mle, client).map_err(Error::Numr)?;
            let composed = var_mul_scalar(&sum, 0.5, client).map_err(Error::Numr)?;
            Ok((weight, composed))
        }
        EmoVariant::InverseRatio => {
            let denom = client
                .add_scalar(mle.tensor(), RATIO_EPS)
                .map_err(Error::Numr)?;
            let weight = client.div(emo.tensor(), &denom).map_err(Error::Numr)?;

            let weighted =
                var_mul(&constant(weight.clone()), mle, client).map_err(Error::Numr)?;
            let composed = var_add(&weighted, emo, client).map_err(Error::Numr)?;
            Ok((weight, composed))
        }
    }
}

/// `sum(values * mask) / (sum(mask) + 1e-15)` over a 1-D `[N]` input.
///
/// The mask is a constant; ignored rows contribute neither value nor gradient.
pub fn masked_mean<R, C>(client: &C, values: &Var<R>, mask: &Tensor<R>) -> Result<Var<R>>
where
    R: Runtime<DType = DType>,
    C: LossClient<R>,
    R::Client: LossClient<R>,
{
    if values.shape() != mask.shape() || values.shape().len() != 1 {
        return Err(Error::InvalidArgument {
            arg: "mask",
            reason: format!(
                "expected matching [N] shapes, got values {:?} and mask {:?}",
                values.shape(),
                mask.shape()
            ),
        });
    }

    let masked = var_mul(values, &constant(mask.clone()), client).map_err(Error::Numr)?;
    let total = var_sum(&masked, &[0], false, client).map_err(Error::Numr)?;

    let count = client.sum(mask, &[0], false).map_err(Error::Numr)?;
    let denom = client.add_scalar(&count, MASK_EPS).map_err(Error::Numr)?;
    var_div(&total, &constant(denom), client).map_err(Error::Numr)
}

/// Host-side summary of one loss evaluation, averaged over valid positions.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EmoLossStats {
    /// Positions whose shifted label is not the ignore index
    pub num_valid_tokens: usize,
    /// Mean cross-entropy
    pub mle: f64,
    /// Mean EMO divergence
    pub emo: f64,
    /// Mean detached composition weight
    pub weight: f64,
    /// Mean composed loss; matches the scalar training loss
    pub loss: f64,
}

impl EmoLossStats {
    /// Copy the per-position terms to the host and reduce them.
    ///
    /// Forces a device synchronization; meant for logging, not the hot path.
    pub fn collect<R, C>(client: &C, per_position: &PerPositionLoss<R>) -> Result<Self>
    where
        R: Runtime<DType = DType>,
        C: LossClient<R>,
    {
        let host = |t: &Tensor<R>| -> Result<Vec<f32>> {
            Ok(client.cast(t, DType::F32).map_err(Error::Numr)?.to_vec())
        };
        let mask = host(&per_position.mask)?;
        let mle = host(&per_position.mle)?;
        let emo = host(&per_position.emo)?;
        let weight = host(&per_position.weight)?;
        let composed = host(&per_position.composed)?;

        let num_valid_tokens = mask.iter().filter(|m| **m != 0.0).count();
        let mean = |values: &[f32]| -> f64 {
            if num_valid_tokens == 0 {
                return 0.0;
            }
            let total: f64 = values
                .iter()
                .zip(&mask)
                .filter(|(_, m)| **m != 0.0)
                .map(|(v, _)| *v as f64)
                .sum();
            total / num_valid_tokens as f64
        };

        Ok(Self {
            num_valid_tokens,
            mle: mean(&mle),
            emo: mean(&emo),
            weight: mean(&weight),
            loss: mean(&composed),
        })
    }
}
