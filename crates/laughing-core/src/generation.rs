//! Text-generation pipeline: prompt text in, generated continuations out
//!
//! Wraps tokenization, autoregressive decoding and detokenization. Sampling is
//! delegated to `candle_transformers::generation::LogitsProcessor`.

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use serde::{Deserialize, Serialize};

use crate::model::Gpt2LmHeadModel;
use crate::tokenizer::CausalTokenizer;

/// Keyword options of the generation stage, HuggingFace names and defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GenerationParams {
    /// Total length (prompt included) when `max_new_tokens` is unset
    pub max_length: usize,
    pub max_new_tokens: Option<usize>,
    pub num_return_sequences: usize,
    pub do_sample: bool,
    pub temperature: f64,
    /// 0 disables top-k filtering
    pub top_k: usize,
    /// 1.0 disables nucleus filtering
    pub top_p: f64,
    pub repetition_penalty: f32,
    pub seed: Option<u64>,
    pub return_full_text: bool,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_length: 20,
            max_new_tokens: None,
            num_return_sequences: 1,
            do_sample: false,
            temperature: 1.0,
            top_k: 50,
            top_p: 1.0,
            repetition_penalty: 1.0,
            seed: None,
            return_full_text: true,
        }
    }
}

const DEFAULT_SEED: u64 = 299792458;

impl GenerationParams {
    /// Parse opaque stage options, rejecting keys this pipeline does not know.
    pub fn from_options(options: &serde_json::Map<String, serde_json::Value>) -> Result<Self> {
        let params: Self = serde_json::from_value(serde_json::Value::Object(options.clone()))
            .context("Invalid generation parameters")?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_return_sequences == 0 {
            anyhow::bail!("num_return_sequences must be at least 1");
        }
        if self.num_return_sequences > 1 && !self.do_sample {
            anyhow::bail!(
                "num_return_sequences ({}) > 1 requires do_sample: true",
                self.num_return_sequences
            );
        }
        if self.do_sample && self.temperature <= 0.0 {
            anyhow::bail!("temperature must be > 0 when sampling, got {}", self.temperature);
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            anyhow::bail!("top_p must be in (0, 1], got {}", self.top_p);
        }
        if self.repetition_penalty <= 0.0 {
            anyhow::bail!("repetition_penalty must be > 0, got {}", self.repetition_penalty);
        }
        Ok(())
    }

    pub fn sampling(&self) -> Sampling {
        if !self.do_sample {
            return Sampling::ArgMax;
        }
        let temperature = self.temperature;
        let k = (self.top_k > 0).then_some(self.top_k);
        let p = (self.top_p < 1.0).then_some(self.top_p);
        match (k, p) {
            (None, None) => Sampling::All { temperature },
            (Some(k), None) => Sampling::TopK { k, temperature },
            (None, Some(p)) => Sampling::TopP { p, temperature },
            (Some(k), Some(p)) => Sampling::TopKThenTopP { k, p, temperature },
        }
    }

    /// Number of tokens to generate after a prompt of `prompt_len` tokens
    pub fn new_token_budget(&self, prompt_len: usize) -> usize {
        match self.max_new_tokens {
            Some(n) => n,
            None => self.max_length.saturating_sub(prompt_len),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedText {
    pub generated_text: String,
}

/// Anything that turns a prompt into continuations
pub trait TextGenerator {
    fn generate(&mut self, prompt: &str, params: &GenerationParams) -> Result<Vec<GeneratedText>>;
}

pub struct TextGenerationPipeline {
    model: Gpt2LmHeadModel,
    tokenizer: CausalTokenizer,
    device: Device,
    /// Sampler kept across calls so repeated prompts draw fresh samples,
    /// rebuilt when the parameters change
    processor: Option<(GenerationParams, LogitsProcessor)>,
}

impl TextGenerationPipeline {
    pub fn new(model: Gpt2LmHeadModel, tokenizer: CausalTokenizer, device: Device) -> Self {
        Self {
            model,
            tokenizer,
            device,
            processor: None,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn complete(
        &self,
        prompt_ids: &[u32],
        budget: usize,
        params: &GenerationParams,
        processor: &mut LogitsProcessor,
    ) -> Result<Vec<u32>> {
        let config = self.model.config();
        let mut tokens = prompt_ids.to_vec();

        for _ in 0..budget {
            // Clip to the context window, keeping the most recent tokens
            let start = tokens.len().saturating_sub(config.n_positions);
            let context = &tokens[start..];

            let input = Tensor::new(context, &self.device)?.unsqueeze(0)?;
            let logits = self.model.forward(&input, None, false)?;
            let last_logits = logits.squeeze(0)?.get(context.len() - 1)?;

            let last_logits = if params.repetition_penalty != 1.0 {
                candle_transformers::utils::apply_repeat_penalty(
                    &last_logits,
                    params.repetition_penalty,
                    &tokens,
                )?
            } else {
                last_logits
            };

            let next_token = processor.sample(&last_logits)?;
            tokens.push(next_token);

            if config.eos_token_id == Some(next_token) {
                break;
            }
        }

        Ok(tokens.split_off(prompt_ids.len()))
    }

    fn sample_sequences(
        &self,
        prompt: &str,
        prompt_ids: &[u32],
        budget: usize,
        params: &GenerationParams,
        processor: &mut LogitsProcessor,
    ) -> Result<Vec<GeneratedText>> {
        let mut results = Vec::with_capacity(params.num_return_sequences);
        for _ in 0..params.num_return_sequences {
            let new_tokens = self.complete(prompt_ids, budget, params, processor)?;
            let continuation = self.tokenizer.decode(&new_tokens)?;
            let generated_text = if params.return_full_text {
                format!("{}{}", prompt, continuation)
            } else {
                continuation
            };
            results.push(GeneratedText { generated_text });
        }
        Ok(results)
    }
}

impl TextGenerator for TextGenerationPipeline {
    fn generate(&mut self, prompt: &str, params: &GenerationParams) -> Result<Vec<GeneratedText>> {
        params.validate()?;

        let mut prompt_ids = self.tokenizer.encode(prompt)?;
        if prompt_ids.is_empty() {
            let bos = self
                .model
                .config()
                .bos_token_id
                .context("Empty prompt and the model has no bos_token_id")?;
            prompt_ids.push(bos);
        }

        let budget = params.new_token_budget(prompt_ids.len());
        if budget == 0 {
            tracing::warn!(
                "prompt is {} tokens, max_length {} leaves nothing to generate",
                prompt_ids.len(),
                params.max_length
            );
        }

        let mut processor = match self.processor.take() {
            Some((previous, processor)) if previous == *params => processor,
            _ => LogitsProcessor::from_sampling(
                params.seed.unwrap_or(DEFAULT_SEED),
                params.sampling(),
            ),
        };

        let results = self.sample_sequences(prompt, &prompt_ids, budget, params, &mut processor);
        self.processor = Some((params.clone(), processor));
        results
    }
}
