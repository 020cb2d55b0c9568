//! EMO loss: embedding-space divergence between target and predicted distributions.
//!
//! Both distributions are mapped into a cost-embedding space by multiplying with an
//! L2-row-normalized `[V, H]` embedding matrix, giving one "contextual representation"
//! per position. The loss is `1 - <target_repr, predicted_repr>`, where the predicted
//! distribution has the true label's probability mass removed as a constant, so only
//! the off-target mass carries gradient.

use super::{LossClient, constant};
use crate::error::{Error, Result};
use numr::autograd::{
    Var, var_add_scalar, var_div, var_matmul, var_mul, var_mul_scalar, var_softmax, var_sqrt,
    var_sub, var_sum,
};
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Added to every one-hot entry before L1 normalization so no row is exactly sparse.
pub const ONE_HOT_EPS: f64 = 1e-15;

/// L2-normalize each row of a `[V, H]` matrix.
///
/// Returns a new `Var` attached to `weight`'s graph; `weight` itself is untouched.
pub fn normalize_rows<R, C>(client: &C, weight: &Var<R>) -> Result<Var<R>>
where
    R: Runtime<DType = DType>,
    C: LossClient<R>,
    R::Client: LossClient<R>,
{
    if weight.shape().len() != 2 {
        return Err(Error::InvalidArgument {
            arg: "weight",
            reason: format!("expected [vocab, hidden], got {:?}", weight.shape()),
        });
    }

    let sq = var_mul(weight, weight, client).map_err(Error::Numr)?;
    let sum_sq = var_sum(&sq, &[1], true, client).map_err(Error::Numr)?;
    let norm = var_sqrt(&sum_sq, client).map_err(Error::Numr)?;
    var_div(weight, &norm, client).map_err(Error::Numr)
}

/// One-hot encode `indices` (`[N]`, I64, all in `[0, vocab_size)`) as `[N, vocab_size]`
/// in `dtype`.
pub fn one_hot<R, C>(
    client: &C,
    indices: &Tensor<R>,
    vocab_size: usize,
    dtype: DType,
) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: LossClient<R>,
{
    let hits = client.one_hot(indices, vocab_size).map_err(Error::Numr)?;
    if hits.dtype() == dtype {
        return Ok(hits);
    }
    client.cast(&hits, dtype).map_err(Error::Numr)
}

/// `(one_hot + eps) / ||one_hot + eps||_1` per row.
///
/// Every entry is positive, so the L1 norm is the plain row sum.
pub fn stable_one_hot<R, C>(client: &C, one_hot: &Tensor<R>) -> Result<Tensor<R>>
where
    R: Runtime<DType = DType>,
    C: LossClient<R>,
{
    let shape = one_hot.shape().to_vec();
    let shifted = client
        .add_scalar(one_hot, ONE_HOT_EPS)
        .map_err(Error::Numr)?;
    let l1 = client.sum(&shifted, &[1], true).map_err(Error::Numr)?;
    let l1 = l1.broadcast_to(&shape).map_err(Error::Numr)?.contiguous();
    client.div(&shifted, &l1).map_err(Error::Numr)
}

/// Target contextual representation: `stable_one_hot @ embedding`, `[N, H]`.
///
/// `embedding` is expected to be row-normalized already (see [`normalize_rows`]).
pub fn target_representation<R, C>(
    client: &C,
    stable_one_hot: &Tensor<R>,
    embedding: &Var<R>,
) -> Result<Var<R>>
where
    R: Runtime<DType = DType>,
    C: LossClient<R>,
    R::Client: LossClient<R>,
{
    let target = constant(stable_one_hot.clone());
    var_matmul(&target, embedding, client).map_err(Error::Numr)
}

/// EMO loss per row from precomputed pieces.
///
/// - `logits`: `[N, V]` shifted logits
/// - `one_hot`: `[N, V]` plain one-hot of the sanitized labels
/// - `embedding`: `[V, H]` row-normalized cost embedding (detached or not, caller decides)
pub(super) fn emo_from_logits<R, C>(
    client: &C,
    logits: &Var<R>,
    one_hot: &Tensor<R>,
    embedding: &Var<R>,
) -> Result<Var<R>>
where
    R: Runtime<DType = DType>,
    C: LossClient<R>,
    R::Client: LossClient<R>,
{
    let stable = stable_one_hot(client, one_hot)?;
    let target_repr = target_representation(client, &stable, embedding)?;

    let probs = var_softmax(logits, -1, client).map_err(Error::Numr)?;

    // Remove the true-label mass as a constant: it gets no gradient credit.
    let on_target = client.mul(probs.tensor(), one_hot).map_err(Error::Numr)?;
    let off_target = var_sub(&probs, &constant(on_target), client).map_err(Error::Numr)?;
    let predicted_repr = var_matmul(&off_target, embedding, client).map_err(Error::Numr)?;

    let prod = var_mul(&target_repr, &predicted_repr, client).map_err(Error::Numr)?;
    let dot = var_sum(&prod, &[1], false, client).map_err(Error::Numr)?;
    let neg_dot = var_mul_scalar(&dot, -1.0, client).map_err(Error::Numr)?;
    var_add_scalar(&neg_dot, 1.0, client).map_err(Error::Numr)
}

/// Unreduced EMO loss: `1 - <target_repr, predicted_repr>` per row.
///
/// - `logits`: `[N, V]` raw model output (pre-softmax)
/// - `targets`: `[N]` I64 class indices, all in `[0, V)`
/// - `cost_embedding`: `[V, H]` raw (unnormalized) cost embedding
///
/// Returns `[N]`. Each value lies in `[0, 2]`.
pub fn emo_per_position<R, C>(
    client: &C,
    logits: &Var<R>,
    targets: &Tensor<R>,
    cost_embedding: &Var<R>,
) -> Result<Var<R>>
where
    R: Runtime<DType = DType>,
    C: LossClient<R>,
    R::Client: LossClient<R>,
{
    if logits.shape().len() != 2 {
        return Err(Error::InvalidArgument {
            arg: "logits",
            reason: format!("expected [N, V], got {:?}", logits.shape()),
        });
    }
    let vocab_size = logits.shape()[1];
    check_embedding_rows(cost_embedding, vocab_size)?;

    let one_hot = one_hot(client, targets, vocab_size, logits.tensor().dtype())?;
    let embedding = normalize_rows(client, cost_embedding)?;
    emo_from_logits(client, logits, &one_hot, &embedding)
}

/// The cost embedding must have one row per vocabulary entry.
pub(super) fn check_embedding_rows<R: Runtime>(
    cost_embedding: &Var<R>,
    vocab_size: usize,
) -> Result<()> {
    let shape = cost_embedding.shape();
    if shape.len() != 2 || shape[0] != vocab_size {
        return Err(Error::InvalidArgument {
            arg: "cost_embedding",
            reason: format!("expected [{vocab_size}, hidden], got {shape:?}"),
        });
    }
    Ok(())
}
