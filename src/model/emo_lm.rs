//! EMO causal LM adapter: any backbone plus the MLE + EMO objective.

use crate::config::EmoConfig;
use crate::error::{Error, Result};
use crate::model::traits::{BackboneOutput, CausalLmBackbone, ModelClient};
use crate::nn::CostEmbedding;
use crate::nn::loss::{EmoLossStats, PerPositionLoss, emo_causal_lm_loss};
use numr::autograd::Var;
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::Tensor;
use tracing::{Level, debug};

/// Output of [`EmoCausalLm::forward`].
pub struct CausalLmOutput<R: Runtime> {
    /// Scalar training loss; `None` when no labels were given
    pub loss: Option<Var<R>>,
    /// Detached per-position terms behind `loss`
    pub per_position: Option<PerPositionLoss<R>>,
    /// Unshifted logits `[B, S, V]`
    pub logits: Var<R>,
    /// Backbone auxiliary outputs, passed through
    pub aux: Vec<Var<R>>,
}

/// Wraps a backbone and computes the EMO objective after its forward pass.
///
/// The backbone never sees labels; the loss is a separate step over its logits.
pub struct EmoCausalLm<R: Runtime, B> {
    backbone: B,
    cost_embedding: CostEmbedding<R>,
    config: EmoConfig,
}

impl<R, B> EmoCausalLm<R, B>
where
    R: Runtime<DType = DType>,
    B: CausalLmBackbone<R>,
{
    /// Fails when the config is invalid or the embedding rows don't match the vocabulary.
    pub fn new(backbone: B, cost_embedding: CostEmbedding<R>, config: EmoConfig) -> Result<Self> {
        config.validate()?;
        if cost_embedding.vocab_size() != backbone.vocab_size() {
            return Err(Error::ModelError {
                reason: format!(
                    "cost embedding has {} rows but backbone vocab_size is {}",
                    cost_embedding.vocab_size(),
                    backbone.vocab_size()
                ),
            });
        }
        Ok(Self {
            backbone,
            cost_embedding,
            config,
        })
    }

    /// Run the backbone, then the loss when `labels` (`[B, S]`, I64) are given.
    pub fn forward<C>(
        &self,
        client: &C,
        input_ids: &Tensor<R>,
        attention_mask: Option<&Tensor<R>>,
        labels: Option<&Tensor<R>>,
    ) -> Result<CausalLmOutput<R>>
    where
        C: ModelClient<R>,
        R::Client: ModelClient<R>,
    {
        let BackboneOutput { logits, aux } =
            self.backbone.forward(client, input_ids, attention_mask)?;

        let Some(labels) = labels else {
            return Ok(CausalLmOutput {
                loss: None,
                per_position: None,
                logits,
                aux,
            });
        };

        let out = emo_causal_lm_loss(
            client,
            &logits,
            labels,
            self.cost_embedding.weight(),
            &self.config,
        )?;

        if tracing::enabled!(Level::DEBUG) {
            let stats = EmoLossStats::collect(client, &out.per_position)?;
            debug!(
                variant = ?self.config.variant,
                valid_tokens = stats.num_valid_tokens,
                loss = stats.loss,
                mle = stats.mle,
                emo = stats.emo,
                weight = stats.weight,
                "emo loss"
            );
        }

        Ok(CausalLmOutput {
            loss: Some(out.loss),
            per_position: Some(out.per_position),
            logits,
            aux,
        })
    }

    pub fn backbone(&self) -> &B {
        &self.backbone
    }

    pub fn backbone_mut(&mut self) -> &mut B {
        &mut self.backbone
    }

    pub fn cost_embedding(&self) -> &CostEmbedding<R> {
        &self.cost_embedding
    }

    pub fn config(&self) -> &EmoConfig {
        &self.config
    }
}
