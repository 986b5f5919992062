//! Training-loop configuration
//!
//! Built from an output directory plus opaque keyword options. The options are
//! kept exactly as given and also parsed into typed hyperparameters using the
//! HuggingFace `TrainingArguments` names and defaults.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// HuggingFace `TrainingArguments` keys accepted and ignored with a warning
pub const IGNORED_HF_OPTIONS: &[&str] = &[
    "fp16",
    "bf16",
    "report_to",
    "overwrite_output_dir",
    "logging_dir",
    "logging_first_step",
    "run_name",
    "push_to_hub",
    "disable_tqdm",
    "dataloader_num_workers",
    "load_best_model_at_end",
    "metric_for_best_model",
    "greater_is_better",
    "prediction_loss_only",
    "remove_unused_columns",
    "do_train",
    "do_eval",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerType {
    Linear,
    Cosine,
    Constant,
    ConstantWithWarmup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalStrategy {
    No,
    Steps,
    Epoch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TrainingHyperparams {
    pub num_train_epochs: f64,
    /// Positive values override `num_train_epochs`
    pub max_steps: i64,
    pub per_device_train_batch_size: usize,
    pub per_device_eval_batch_size: usize,
    pub gradient_accumulation_steps: usize,

    // AdamW
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub adam_beta1: f64,
    pub adam_beta2: f64,
    pub adam_epsilon: f64,
    pub max_grad_norm: f64,

    pub lr_scheduler_type: SchedulerType,
    pub warmup_steps: usize,

    pub logging_steps: usize,
    pub save_steps: usize,
    pub save_total_limit: Option<usize>,
    #[serde(alias = "eval_strategy")]
    pub evaluation_strategy: IntervalStrategy,
    /// Defaults to `logging_steps`
    pub eval_steps: Option<usize>,

    pub seed: u64,
}

impl Default for TrainingHyperparams {
    fn default() -> Self {
        Self {
            num_train_epochs: 3.0,
            max_steps: -1,
            per_device_train_batch_size: 8,
            per_device_eval_batch_size: 8,
            gradient_accumulation_steps: 1,
            learning_rate: 5e-5,
            weight_decay: 0.0,
            adam_beta1: 0.9,
            adam_beta2: 0.999,
            adam_epsilon: 1e-8,
            max_grad_norm: 1.0,
            lr_scheduler_type: SchedulerType::Linear,
            warmup_steps: 0,
            logging_steps: 500,
            save_steps: 500,
            save_total_limit: None,
            evaluation_strategy: IntervalStrategy::No,
            eval_steps: None,
            seed: 42,
        }
    }
}

impl TrainingHyperparams {
    pub fn validate(&self) -> Result<()> {
        if self.per_device_train_batch_size == 0 || self.per_device_eval_batch_size == 0 {
            anyhow::bail!("batch sizes must be at least 1");
        }
        if self.gradient_accumulation_steps == 0 {
            anyhow::bail!("gradient_accumulation_steps must be at least 1");
        }
        if self.max_steps <= 0 && self.num_train_epochs <= 0.0 {
            anyhow::bail!("either num_train_epochs or max_steps must be positive");
        }
        if self.learning_rate < 0.0 {
            anyhow::bail!("learning_rate must be non-negative, got {}", self.learning_rate);
        }
        Ok(())
    }

    pub fn eval_interval(&self) -> usize {
        self.eval_steps.unwrap_or(self.logging_steps)
    }
}

#[derive(Debug, Clone)]
pub struct TrainingArguments {
    pub output_dir: PathBuf,
    /// Keyword options exactly as configured
    pub options: Map<String, Value>,
    pub params: TrainingHyperparams,
}

impl TrainingArguments {
    pub fn new(output_dir: impl Into<PathBuf>, options: Map<String, Value>) -> Result<Self> {
        if options.contains_key("output_dir") {
            anyhow::bail!("output_dir is computed and must not be set in the train stage options");
        }
        let mut typed = options.clone();
        for key in IGNORED_HF_OPTIONS {
            if typed.remove(*key).is_some() {
                tracing::warn!("training option {} is not supported, ignoring it", key);
            }
        }
        let params: TrainingHyperparams = serde_json::from_value(Value::Object(typed))
            .context("Invalid training arguments")?;
        params.validate()?;

        Ok(Self {
            output_dir: output_dir.into(),
            options,
            params,
        })
    }

    /// Resolved arguments as written next to saved models
    pub fn to_json(&self) -> Result<Value> {
        let mut resolved = match serde_json::to_value(&self.params)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        resolved.insert(
            "output_dir".to_string(),
            Value::String(self.output_dir.display().to_string()),
        );
        Ok(Value::Object(resolved))
    }
}
