pub mod emo_lm;
pub mod traits;

pub use emo_lm::{CausalLmOutput, EmoCausalLm};
pub use traits::{BackboneOutput, CausalLmBackbone, ModelClient};
