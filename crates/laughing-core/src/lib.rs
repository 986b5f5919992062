//! laughing-core - GPT-2 causal LM on Candle
//!
//! Pretrained checkpoint loading, tokenizer loading, device selection and the
//! text-generation pipeline.

pub mod attention;
pub mod checkpoint;
pub mod config;
pub mod device;
pub mod generation;
pub mod model;
pub mod tokenizer;

pub use checkpoint::{load_pretrained, save_pretrained, LoadedModel, ModelFiles};
pub use config::Gpt2Config;
pub use device::{select_device, system_accelerators, Accelerator};
pub use generation::{GeneratedText, GenerationParams, TextGenerationPipeline, TextGenerator};
pub use model::Gpt2LmHeadModel;
pub use tokenizer::{load_tokenizer, CausalTokenizer};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
