//! # emo-finetune
//!
//! **Embedding-space (EMO) training objective for causal language models, built on numr.**
//!
//! Standard next-token cross-entropy only rewards probability mass on the exact
//! target token. The EMO term additionally scores *where* the remaining mass goes:
//! both the target and the predicted distribution are projected through a
//! row-normalized cost embedding, and the loss is one minus their dot product.
//! Mistakes onto tokens that sit close to the target in embedding space cost less
//! than mistakes onto distant ones, which reduces exposure bias during continual
//! fine-tuning.
//!
//! ```text
//! ┌────────────────────────────┐
//! │  backbone (external)       │  input_ids [B, S] -> logits [B, S, V]
//! └─────────────┬──────────────┘
//!               │ logits, labels, cost embedding [V, H]
//! ┌─────────────▼──────────────┐
//! │  emo_causal_lm_loss        │  shift -> mask -> MLE + EMO -> compose -> reduce
//! └─────────────┬──────────────┘
//!               │ scalar Var
//!        numr::autograd::backward
//! ```
//!
//! ## Design
//!
//! - **Free function**: [`nn::loss::emo_causal_lm_loss`] takes plain logits, labels and
//!   an embedding `Var`; [`model::EmoCausalLm`] is a thin adapter over any
//!   [`model::CausalLmBackbone`]
//! - **Variants as data**: [`nn::loss::EmoVariant`] selects the composition, chosen in
//!   [`config::EmoConfig`]
//! - **Stop-gradient as constants**: detached terms are computed on raw tensors and
//!   re-enter the graph as `Var::new(tensor, false)`
//! - **No data-dependent branches**: ignored labels and empty batches are handled by
//!   masks and epsilon guards

pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod nn;

pub use config::EmoConfig;
pub use error::{Error, Result};
pub use model::{BackboneOutput, CausalLmBackbone, CausalLmOutput, EmoCausalLm};
pub use nn::CostEmbedding;
pub use nn::loss::{EmoLossOutput, EmoLossStats, EmoVariant, emo_causal_lm_loss, mle_loss};

// Re-export numr types that users will commonly need
pub use numr::autograd::Var;
pub use numr::dtype::DType;
pub use numr::runtime::{Runtime, RuntimeClient};
pub use numr::tensor::Tensor;
