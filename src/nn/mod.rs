pub mod cost_embedding;
pub mod loss;

pub use cost_embedding::CostEmbedding;
pub use loss::{
    EmoLossOutput, EmoLossStats, EmoVariant, LossClient, PerPositionLoss, emo_causal_lm_loss,
    mle_loss,
};
