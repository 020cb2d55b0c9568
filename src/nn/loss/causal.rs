//! Causal shift and ignore-index masking.

use super::LossClient;
use crate::error::{Error, Result};
use numr::autograd::{Var, var_gather, var_reshape};
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Conventional label value for "exclude this position from the loss".
pub const IGNORE_INDEX: i64 = -100;

/// Logits and labels aligned for next-token prediction.
///
/// Row `i` of `logits` predicts `labels[i]`. All tensors are flattened over
/// `(batch, seq_len - 1)`, so `N = batch * (seq_len - 1)`.
pub struct CausalTargets<R: Runtime> {
    /// Shifted logits, `[N, V]`. Still attached to the caller's graph.
    pub logits: Var<R>,
    /// Shifted labels, `[N]`, ignore index preserved.
    pub labels: Tensor<R>,
    /// Shifted labels with ignored positions replaced by index 0, `[N]`.
    pub sanitized: Tensor<R>,
    /// 1.0 where the shifted label is kept, 0.0 where ignored. `[N]`, logits dtype.
    pub mask: Tensor<R>,
}

impl<R: Runtime> CausalTargets<R> {
    /// Number of shifted positions `N`.
    pub fn num_rows(&self) -> usize {
        self.labels.shape()[0]
    }

    /// Vocabulary size `V`.
    pub fn vocab_size(&self) -> usize {
        self.logits.shape()[1]
    }
}

/// Shift logits `[B, S, V]` and labels `[B, S]` by one position and build the mask.
///
/// Drops the last logit position and the first label, then flattens both. The
/// caller's tensors are never modified; the sanitized labels are a fresh tensor
/// computed as `labels * (labels != ignore_index)`, which maps every ignored
/// position to index 0 so it stays in range for gathers and one-hot encoding.
pub fn causal_shift<R, C>(
    client: &C,
    logits: &Var<R>,
    labels: &Tensor<R>,
    ignore_index: i64,
) -> Result<CausalTargets<R>>
where
    R: Runtime<DType = DType>,
    C: LossClient<R>,
    R::Client: LossClient<R>,
{
    let logits_shape = logits.shape();
    if logits_shape.len() != 3 {
        return Err(Error::InvalidArgument {
            arg: "logits",
            reason: format!("expected [batch, seq_len, vocab], got {logits_shape:?}"),
        });
    }
    let labels_shape = labels.shape();
    if labels_shape.len() != 2 {
        return Err(Error::InvalidArgument {
            arg: "labels",
            reason: format!("expected [batch, seq_len], got {labels_shape:?}"),
        });
    }
    let (batch, seq_len, vocab_size) = (logits_shape[0], logits_shape[1], logits_shape[2]);
    if labels_shape[0] != batch || labels_shape[1] != seq_len {
        return Err(Error::InvalidArgument {
            arg: "labels",
            reason: format!(
                "shape mismatch: logits {logits_shape:?} vs labels {labels_shape:?}"
            ),
        });
    }
    if seq_len < 2 {
        return Err(Error::InvalidArgument {
            arg: "labels",
            reason: format!("need seq_len >= 2 for next-token prediction, got {seq_len}"),
        });
    }
    if labels.dtype() != DType::I64 {
        return Err(Error::InvalidArgument {
            arg: "labels",
            reason: format!("expected I64 labels, got {:?}", labels.dtype()),
        });
    }

    let n = batch * (seq_len - 1);

    // logits[:, :-1, :] -> [N, V], gathered as rows of the flat [B * S, V] view so the
    // result is contiguous and stays on the graph
    let flat = var_reshape(logits, &[batch * seq_len, vocab_size]).map_err(Error::Numr)?;
    let rows: Vec<i64> = (0..batch)
        .flat_map(|b| (0..seq_len - 1).map(move |t| (b * seq_len + t) as i64))
        .collect();
    let rows = Tensor::<R>::from_slice(&rows, &[n, 1], labels.device())
        .broadcast_to(&[n, vocab_size])
        .map_err(Error::Numr)?;
    let shifted = var_gather(&flat, 0, &rows, client).map_err(Error::Numr)?;

    // labels[:, 1:] -> [N]
    let shifted_labels = labels
        .narrow(1, 1, seq_len - 1)
        .map_err(Error::Numr)?
        .contiguous()
        .reshape(&[n])
        .map_err(Error::Numr)?;

    // CompareOps yield 1/0 in the input dtype
    let sentinel =
        Tensor::<R>::full_scalar(&[n], DType::I64, ignore_index as f64, labels.device());
    let keep = client.ne(&shifted_labels, &sentinel).map_err(Error::Numr)?;
    let sanitized = client.mul(&shifted_labels, &keep).map_err(Error::Numr)?;
    let mask = client
        .cast(&keep, logits.tensor().dtype())
        .map_err(Error::Numr)?;

    Ok(CausalTargets {
        logits: shifted,
        labels: shifted_labels,
        sanitized,
        mask,
    })
}
