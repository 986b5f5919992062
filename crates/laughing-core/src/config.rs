//! GPT-2 configuration
//!
//! Field names follow the HuggingFace `config.json` so pretrained checkpoints
//! deserialize directly and saved artifacts stay loadable by other tools.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gpt2Config {
    // Model architecture
    pub vocab_size: usize,
    pub n_positions: usize,
    pub n_embd: usize,
    pub n_layer: usize,
    pub n_head: usize,
    /// Feed-forward width, `4 * n_embd` when absent
    #[serde(default)]
    pub n_inner: Option<usize>,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,

    // Dropout (only active while training)
    #[serde(default = "default_pdrop")]
    pub resid_pdrop: f32,
    #[serde(default = "default_pdrop")]
    pub embd_pdrop: f32,
    #[serde(default = "default_pdrop")]
    pub attn_pdrop: f32,

    // Special tokens
    #[serde(default)]
    pub bos_token_id: Option<u32>,
    #[serde(default)]
    pub eos_token_id: Option<u32>,
}

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

fn default_pdrop() -> f32 {
    0.1
}

impl Default for Gpt2Config {
    fn default() -> Self {
        // gpt2 (124M)
        Self {
            vocab_size: 50257,
            n_positions: 1024,
            n_embd: 768,
            n_layer: 12,
            n_head: 12,
            n_inner: None,
            layer_norm_epsilon: 1e-5,
            resid_pdrop: 0.1,
            embd_pdrop: 0.1,
            attn_pdrop: 0.1,
            bos_token_id: Some(50256),
            eos_token_id: Some(50256),
        }
    }
}

impl Gpt2Config {
    /// Tiny model for tests and smoke runs
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            n_positions: 64,
            n_embd: 32,
            n_layer: 2,
            n_head: 4,
            bos_token_id: None,
            eos_token_id: None,
            ..Default::default()
        }
    }

    pub fn inner_dim(&self) -> usize {
        self.n_inner.unwrap_or(4 * self.n_embd)
    }

    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }

    /// Approximate parameter count (lm head is tied, not counted twice)
    pub fn total_params(&self) -> usize {
        let embeddings = self.vocab_size * self.n_embd + self.n_positions * self.n_embd;
        let attention = 3 * self.n_embd * self.n_embd + 3 * self.n_embd
            + self.n_embd * self.n_embd + self.n_embd;
        let mlp = 2 * self.n_embd * self.inner_dim() + self.inner_dim() + self.n_embd;
        let norms = 4 * self.n_embd;
        embeddings + self.n_layer * (attention + mlp + norms) + 2 * self.n_embd
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.n_head == 0 || self.n_embd % self.n_head != 0 {
            anyhow::bail!(
                "n_embd ({}) must be divisible by n_head ({})",
                self.n_embd,
                self.n_head
            );
        }
        if self.vocab_size == 0 || self.n_positions == 0 {
            anyhow::bail!("vocab_size and n_positions must be non-zero");
        }
        for (name, p) in [
            ("resid_pdrop", self.resid_pdrop),
            ("embd_pdrop", self.embd_pdrop),
            ("attn_pdrop", self.attn_pdrop),
        ] {
            if !(0.0..1.0).contains(&p) {
                anyhow::bail!("{} must be in [0, 1), got {}", name, p);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hf_config() {
        // Trimmed config.json of sberbank-ai/rugpt3small_based_on_gpt2
        let json = r#"{
            "activation_function": "gelu_new",
            "architectures": ["GPT2LMHeadModel"],
            "bos_token_id": 1,
            "eos_token_id": 2,
            "n_ctx": 2048,
            "n_embd": 768,
            "n_head": 12,
            "n_inner": null,
            "n_layer": 12,
            "n_positions": 2048,
            "vocab_size": 50264
        }"#;
        let config: Gpt2Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.n_positions, 2048);
        assert_eq!(config.inner_dim(), 3072);
        assert_eq!(config.eos_token_id, Some(2));
        assert_eq!(config.layer_norm_epsilon, 1e-5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        assert!(Gpt2Config::default().validate().is_ok());

        let mut invalid = Gpt2Config::tiny(100);
        invalid.n_embd = 30; // Not divisible by n_head
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_param_count_gpt2_small() {
        // 124M for the reference gpt2 checkpoint
        let n = Gpt2Config::default().total_params();
        assert!(n > 120_000_000 && n < 130_000_000, "got {}", n);
    }
}
