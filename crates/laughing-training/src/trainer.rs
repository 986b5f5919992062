//! Fine-tuning loop
//!
//! AdamW with a warmup schedule, gradient accumulation, global-norm clipping,
//! periodic logging, evaluation and rotating checkpoints.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, D};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use laughing_core::{save_pretrained, LoadedModel};

use crate::args::{IntervalStrategy, SchedulerType, TrainingArguments};
use crate::collator::{Batch, CausalLmCollator};
use crate::dataset::{TokenizedDataset, TokenizedExample};

pub const TRAINER_STATE_FILE: &str = "trainer_state.json";
pub const TRAINING_ARGS_FILE: &str = "training_args.json";
const CHECKPOINT_PREFIX: &str = "checkpoint-";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogEntry {
    pub step: usize,
    pub epoch: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loss: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub learning_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eval_loss: Option<f32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainerState {
    pub global_step: usize,
    pub max_steps: usize,
    pub epoch: f64,
    pub log_history: Vec<LogEntry>,
}

#[derive(Debug, Clone)]
pub struct TrainOutput {
    pub global_step: usize,
    /// Mean loss over all optimizer steps
    pub training_loss: f32,
    pub elapsed_secs: f64,
}

pub struct Trainer {
    model: LoadedModel,
    args: TrainingArguments,
    collator: CausalLmCollator,
    train_dataset: TokenizedDataset,
    eval_dataset: Option<TokenizedDataset>,
    device: Device,
    state: TrainerState,
}

impl Trainer {
    pub fn new(
        model: LoadedModel,
        args: TrainingArguments,
        collator: CausalLmCollator,
        train_dataset: TokenizedDataset,
        eval_dataset: Option<TokenizedDataset>,
        device: Device,
    ) -> Self {
        Self {
            model,
            args,
            collator,
            train_dataset,
            eval_dataset,
            device,
            state: TrainerState::default(),
        }
    }

    pub fn args(&self) -> &TrainingArguments {
        &self.args
    }

    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    pub fn model(&self) -> &LoadedModel {
        &self.model
    }

    /// Number of optimizer steps in one pass over the training set
    pub fn steps_per_epoch(&self) -> usize {
        let p = &self.args.params;
        let batches = self.train_dataset.len().div_ceil(p.per_device_train_batch_size);
        batches.div_ceil(p.gradient_accumulation_steps).max(1)
    }

    pub fn total_steps(&self) -> usize {
        let p = &self.args.params;
        if p.max_steps > 0 {
            p.max_steps as usize
        } else {
            (p.num_train_epochs * self.steps_per_epoch() as f64).ceil() as usize
        }
    }

    /// Run the training loop to completion.
    pub fn train(&mut self) -> Result<TrainOutput> {
        if self.train_dataset.is_empty() {
            anyhow::bail!("Training dataset is empty");
        }
        let p = self.args.params.clone();

        let steps_per_epoch = self.steps_per_epoch();
        let total_steps = self.total_steps();
        let num_epochs = total_steps.div_ceil(steps_per_epoch);

        println!("\n  Starting training...");
        println!("   Examples: {}", self.train_dataset.len());
        println!("   Epochs: {}", num_epochs);
        println!("   Batch size: {}", p.per_device_train_batch_size);
        println!("   Gradient accumulation: {}", p.gradient_accumulation_steps);
        println!("   Learning rate: {:.1e} ({:?})", p.learning_rate, p.lr_scheduler_type);
        println!("   Total optimization steps: {}", total_steps);

        std::fs::create_dir_all(&self.args.output_dir).with_context(|| {
            format!("Failed to create output dir {}", self.args.output_dir.display())
        })?;

        let vars = self.model.varmap.all_vars();
        let mut optimizer = AdamW::new(
            vars.clone(),
            ParamsAdamW {
                lr: p.learning_rate,
                beta1: p.adam_beta1,
                beta2: p.adam_beta2,
                eps: p.adam_epsilon,
                weight_decay: p.weight_decay,
            },
        )?;

        let mut rng = StdRng::seed_from_u64(p.seed);
        let start = Instant::now();

        self.state = TrainerState {
            max_steps: total_steps,
            ..Default::default()
        };
        let mut global_step = 0usize;
        let mut loss_sum = 0f64;
        let mut logged_loss_sum = 0f64;
        let mut logged_steps = 0usize;

        for epoch in 0..num_epochs {
            println!("\n[Epoch {}/{}]", epoch + 1, num_epochs);

            let order = self.train_dataset.shuffled_indices(&mut rng);
            let batches: Vec<&[usize]> = order.chunks(p.per_device_train_batch_size).collect();

            let pb = ProgressBar::new(steps_per_epoch as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("  {bar:40.cyan/blue} {pos}/{len} [{elapsed_precise}] {msg}")?,
            );

            let mut accumulated: Option<GradStore> = None;
            let mut step_loss = 0f64;
            let mut micro_steps = 0usize;
            let mut epoch_end = (epoch + 1) as f64;
            let mut finished = false;

            for (batch_idx, indices) in batches.iter().enumerate() {
                let batch = self.prepare_batch(indices)?;
                let logits = self.model.model.forward(
                    &batch.input_ids,
                    Some(&batch.attention_mask),
                    true,
                )?;
                let (loss, _) = causal_lm_loss(&logits, &batch.targets, &batch.loss_mask)?;
                step_loss += loss.to_scalar::<f32>()? as f64;

                let scaled = (loss / p.gradient_accumulation_steps as f64)?;
                let grads = scaled.backward()?;
                accumulated = Some(match accumulated.take() {
                    Some(acc) => accumulate_grads(acc, grads, &vars)?,
                    None => grads,
                });
                micro_steps += 1;

                let is_last_batch = batch_idx + 1 == batches.len();
                if micro_steps < p.gradient_accumulation_steps && !is_last_batch {
                    continue;
                }

                let mut grads = match accumulated.take() {
                    Some(grads) => grads,
                    None => continue,
                };
                if p.max_grad_norm > 0.0 {
                    clip_grad_norm(&mut grads, &vars, p.max_grad_norm)?;
                }

                let lr = learning_rate_at(
                    p.lr_scheduler_type,
                    p.learning_rate,
                    p.warmup_steps,
                    total_steps,
                    global_step,
                );
                optimizer.set_learning_rate(lr);
                optimizer.step(&grads)?;

                let mean_loss = step_loss / micro_steps as f64;
                step_loss = 0.0;
                micro_steps = 0;
                global_step += 1;
                loss_sum += mean_loss;
                logged_loss_sum += mean_loss;
                logged_steps += 1;

                let epoch_progress = epoch as f64 + (batch_idx + 1) as f64 / batches.len() as f64;
                pb.set_message(format!("loss: {:.4} | step: {}", mean_loss, global_step));
                pb.inc(1);

                if p.logging_steps > 0 && global_step % p.logging_steps == 0 {
                    let avg = (logged_loss_sum / logged_steps as f64) as f32;
                    tracing::info!(step = global_step, loss = avg, lr, "train");
                    self.state.log_history.push(LogEntry {
                        step: global_step,
                        epoch: epoch_progress,
                        loss: Some(avg),
                        learning_rate: Some(lr),
                        ..Default::default()
                    });
                    logged_loss_sum = 0.0;
                    logged_steps = 0;
                }

                if p.evaluation_strategy == IntervalStrategy::Steps
                    && p.eval_interval() > 0
                    && global_step % p.eval_interval() == 0
                {
                    self.log_evaluation(global_step, epoch_progress, &pb)?;
                }

                if p.save_steps > 0 && global_step % p.save_steps == 0 {
                    self.state.global_step = global_step;
                    self.state.epoch = epoch_progress;
                    let path = self.save_checkpoint(global_step)?;
                    pb.println(format!("  Checkpoint saved: {}", path.display()));
                }

                if global_step >= total_steps {
                    // max_steps can stop partway through the epoch
                    epoch_end = epoch_progress;
                    finished = true;
                    break;
                }
            }

            pb.finish_and_clear();
            self.state.epoch = epoch_end;
            println!("  Epoch {}/{} complete (step {})", epoch + 1, num_epochs, global_step);

            if p.evaluation_strategy == IntervalStrategy::Epoch {
                let pb = ProgressBar::hidden();
                self.log_evaluation(global_step, epoch_end, &pb)?;
            }
            if finished {
                break;
            }
        }

        self.state.global_step = global_step;
        self.save_state(&self.args.output_dir)?;

        let output = TrainOutput {
            global_step,
            training_loss: (loss_sum / global_step.max(1) as f64) as f32,
            elapsed_secs: start.elapsed().as_secs_f64(),
        };

        println!("\n=== Training Complete ===");
        println!("  Total steps: {}", output.global_step);
        println!("  Training loss: {:.4}", output.training_loss);
        println!("  Total time: {:.1}s", output.elapsed_secs);

        Ok(output)
    }

    /// Mean per-token loss over the evaluation set.
    pub fn evaluate(&self) -> Result<f32> {
        let eval_dataset = self
            .eval_dataset
            .as_ref()
            .context("Trainer has no evaluation dataset")?;
        if eval_dataset.is_empty() {
            anyhow::bail!("Evaluation dataset is empty");
        }

        let batch_size = self.args.params.per_device_eval_batch_size;
        let indices: Vec<usize> = (0..eval_dataset.len()).collect();

        let mut weighted_loss = 0f64;
        let mut total_tokens = 0usize;
        for chunk in indices.chunks(batch_size) {
            let examples: Vec<&TokenizedExample> =
                chunk.iter().filter_map(|&i| eval_dataset.get(i)).collect();
            let batch = self.collator.collate(&examples)?.to_tensors(&self.device)?;
            let logits =
                self.model
                    .model
                    .forward(&batch.input_ids, Some(&batch.attention_mask), false)?;
            let (loss, n_tokens) = causal_lm_loss(&logits, &batch.targets, &batch.loss_mask)?;
            weighted_loss += loss.to_scalar::<f32>()? as f64 * n_tokens as f64;
            total_tokens += n_tokens;
        }

        Ok((weighted_loss / total_tokens.max(1) as f64) as f32)
    }

    /// Persist the model weights, config and resolved training arguments.
    pub fn save_model(&self, dir: &Path) -> Result<()> {
        save_pretrained(dir, self.model.model.config(), &self.model.varmap)?;
        let args_json = serde_json::to_string_pretty(&self.args.to_json()?)?;
        std::fs::write(dir.join(TRAINING_ARGS_FILE), args_json)?;
        tracing::info!("Model saved to {}", dir.display());
        Ok(())
    }

    fn prepare_batch(&self, indices: &[usize]) -> Result<Batch> {
        let examples: Vec<&TokenizedExample> = indices
            .iter()
            .filter_map(|&i| self.train_dataset.get(i))
            .collect();
        self.collator.collate(&examples)?.to_tensors(&self.device)
    }

    fn log_evaluation(&mut self, step: usize, epoch: f64, pb: &ProgressBar) -> Result<()> {
        if self.eval_dataset.as_ref().map_or(true, |d| d.is_empty()) {
            return Ok(());
        }
        let eval_loss = self.evaluate()?;
        tracing::info!(step, eval_loss, "eval");
        pb.println(format!("  Eval loss: {:.4} (step {})", eval_loss, step));
        self.state.log_history.push(LogEntry {
            step,
            epoch,
            eval_loss: Some(eval_loss),
            ..Default::default()
        });
        Ok(())
    }

    fn save_checkpoint(&self, step: usize) -> Result<PathBuf> {
        let dir = self
            .args
            .output_dir
            .join(format!("{}{}", CHECKPOINT_PREFIX, step));
        save_pretrained(&dir, self.model.model.config(), &self.model.varmap)?;
        self.save_state(&dir)?;

        if let Some(limit) = self.args.params.save_total_limit {
            rotate_checkpoints(&self.args.output_dir, limit)?;
        }
        Ok(dir)
    }

    fn save_state(&self, dir: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.state)?;
        std::fs::write(dir.join(TRAINER_STATE_FILE), json)?;
        Ok(())
    }
}

/// Shifted next-token cross-entropy. Returns the mean loss over counted
/// positions and how many positions were counted.
pub fn causal_lm_loss(
    logits: &Tensor,
    targets: &Tensor,
    loss_mask: &Tensor,
) -> Result<(Tensor, usize)> {
    let (_batch_size, seq_len, _vocab_size) = logits.dims3()?;
    if seq_len < 2 {
        anyhow::bail!("Need at least 2 tokens per sequence to compute a causal LM loss");
    }

    // Position t predicts token t + 1
    let logits = logits.narrow(1, 0, seq_len - 1)?.to_dtype(DType::F32)?;
    let targets = targets.narrow(1, 1, seq_len - 1)?.contiguous()?;
    let mask = loss_mask.narrow(1, 1, seq_len - 1)?.contiguous()?;

    let n_tokens = mask.sum_all()?.to_scalar::<f32>()? as usize;
    if n_tokens == 0 {
        anyhow::bail!("Batch has no label positions to train on");
    }

    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let picked = log_probs
        .gather(&targets.unsqueeze(D::Minus1)?, D::Minus1)?
        .squeeze(D::Minus1)?;
    let loss = (picked.mul(&mask)?.sum_all()?.neg()? / n_tokens as f64)?;

    Ok((loss, n_tokens))
}

fn accumulate_grads(
    mut acc: GradStore,
    grads: GradStore,
    vars: &[candle_core::Var],
) -> Result<GradStore> {
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            let sum = match acc.get(var.as_tensor()) {
                Some(prev) => prev.add(grad)?,
                None => grad.clone(),
            };
            acc.insert(var.as_tensor(), sum);
        }
    }
    Ok(acc)
}

/// Scale gradients so their global L2 norm is at most `max_norm`.
/// Returns the norm before clipping.
fn clip_grad_norm(grads: &mut GradStore, vars: &[candle_core::Var], max_norm: f64) -> Result<f64> {
    let mut sq_sum = 0f64;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            sq_sum += grad.sqr()?.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        }
    }
    let total_norm = sq_sum.sqrt();

    if total_norm > max_norm {
        let scale = max_norm / (total_norm + 1e-6);
        for var in vars {
            if let Some(grad) = grads.get(var.as_tensor()) {
                let clipped = (grad * scale)?;
                grads.insert(var.as_tensor(), clipped);
            }
        }
    }
    Ok(total_norm)
}

/// Learning rate for the optimizer step about to be taken (0-based).
pub fn learning_rate_at(
    scheduler: SchedulerType,
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
    step: usize,
) -> f64 {
    if step < warmup_steps && scheduler != SchedulerType::Constant {
        return base_lr * step as f64 / warmup_steps.max(1) as f64;
    }
    let decay_steps = total_steps.saturating_sub(warmup_steps).max(1) as f64;
    let progress = (step.saturating_sub(warmup_steps) as f64 / decay_steps).min(1.0);
    match scheduler {
        SchedulerType::Linear => base_lr * (1.0 - progress),
        SchedulerType::Cosine => base_lr * 0.5 * (1.0 + (std::f64::consts::PI * progress).cos()),
        SchedulerType::Constant | SchedulerType::ConstantWithWarmup => base_lr,
    }
}

/// Keep only the `limit` most recent `checkpoint-<step>` directories.
fn rotate_checkpoints(output_dir: &Path, limit: usize) -> Result<()> {
    let mut checkpoints: Vec<(usize, PathBuf)> = std::fs::read_dir(output_dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            let step = name.strip_prefix(CHECKPOINT_PREFIX)?.parse::<usize>().ok()?;
            Some((step, entry.path()))
        })
        .collect();
    checkpoints.sort_by_key(|(step, _)| *step);

    let excess = checkpoints.len().saturating_sub(limit);
    for (_, path) in checkpoints.into_iter().take(excess) {
        tracing::debug!("Deleting older checkpoint {}", path.display());
        std::fs::remove_dir_all(&path)
            .with_context(|| format!("Failed to delete {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::{VarBuilder, VarMap};
    use laughing_core::{Gpt2Config, Gpt2LmHeadModel};
    use serde_json::json;

    fn tiny_model(vocab_size: usize) -> LoadedModel {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = Gpt2LmHeadModel::new(Gpt2Config::tiny(vocab_size), vb).unwrap();
        LoadedModel { model, varmap }
    }

    fn tiny_dataset(n: usize) -> TokenizedDataset {
        TokenizedDataset::new(
            (0..n)
                .map(|i| TokenizedExample {
                    input_ids: (0..(3 + i % 4)).map(|t| ((i + t) % 15) as u32 + 1).collect(),
                })
                .collect(),
        )
    }

    fn trainer(dir: &Path, options: serde_json::Value) -> Trainer {
        trainer_with_examples(dir, options, 10)
    }

    fn trainer_with_examples(dir: &Path, options: serde_json::Value, n_train: usize) -> Trainer {
        let args = TrainingArguments::new(dir, options.as_object().cloned().unwrap()).unwrap();
        Trainer::new(
            tiny_model(16),
            args,
            CausalLmCollator::new(0),
            tiny_dataset(n_train),
            Some(tiny_dataset(4)),
            Device::Cpu,
        )
    }

    fn eval_steps(state: &TrainerState) -> Vec<(usize, f64)> {
        state
            .log_history
            .iter()
            .filter(|e| e.eval_loss.is_some())
            .map(|e| (e.step, e.epoch))
            .collect()
    }

    #[test]
    fn test_loss_ignores_masked_positions() -> Result<()> {
        let device = Device::Cpu;
        // Uniform logits: loss is ln(vocab) wherever it is counted
        let logits = Tensor::zeros((1, 3, 4), DType::F32, &device)?;
        let targets = Tensor::new(&[[1u32, 2, 0]], &device)?;
        let mask = Tensor::new(&[[1f32, 1.0, 0.0]], &device)?;

        let (loss, n_tokens) = causal_lm_loss(&logits, &targets, &mask)?;
        assert_eq!(n_tokens, 1);
        assert!((loss.to_scalar::<f32>()? - 4f32.ln()).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_loss_rejects_unlabelled_batch() -> Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::zeros((1, 2, 4), DType::F32, &device)?;
        let targets = Tensor::new(&[[1u32, 0]], &device)?;
        let mask = Tensor::new(&[[1f32, 0.0]], &device)?;
        assert!(causal_lm_loss(&logits, &targets, &mask).is_err());
        Ok(())
    }

    #[test]
    fn test_linear_schedule_with_warmup() {
        let lr = |step| learning_rate_at(SchedulerType::Linear, 1.0, 2, 10, step);
        assert_eq!(lr(0), 0.0);
        assert_eq!(lr(1), 0.5);
        assert_eq!(lr(2), 1.0);
        assert!((lr(6) - 0.5).abs() < 1e-12);
        assert_eq!(lr(10), 0.0);

        assert_eq!(learning_rate_at(SchedulerType::Constant, 1.0, 2, 10, 0), 1.0);
    }

    #[test]
    fn test_cosine_schedule_with_warmup() {
        let lr = |step| learning_rate_at(SchedulerType::Cosine, 2.0, 2, 10, step);
        assert_eq!(lr(0), 0.0);
        assert_eq!(lr(1), 1.0);
        assert_eq!(lr(2), 2.0);
        // Halfway through the decay
        assert!((lr(6) - 1.0).abs() < 1e-12);
        assert!(lr(4) > 1.0 && lr(8) < 1.0);
        assert!(lr(10).abs() < 1e-12);
    }

    #[test]
    fn test_constant_with_warmup_schedule() {
        let lr = |step| learning_rate_at(SchedulerType::ConstantWithWarmup, 1.0, 4, 10, step);
        assert_eq!(lr(0), 0.0);
        assert_eq!(lr(2), 0.5);
        assert_eq!(lr(4), 1.0);
        assert_eq!(lr(9), 1.0);
        assert_eq!(lr(10), 1.0);
    }

    #[test]
    fn test_step_accounting() {
        let dir = tempfile::tempdir().unwrap();
        let t = trainer(
            dir.path(),
            json!({"per_device_train_batch_size": 3, "gradient_accumulation_steps": 2, "num_train_epochs": 1.5}),
        );
        // 10 examples -> 4 batches -> 2 optimizer steps per epoch
        assert_eq!(t.steps_per_epoch(), 2);
        assert_eq!(t.total_steps(), 3);

        let t = trainer(dir.path(), json!({"max_steps": 7}));
        assert_eq!(t.total_steps(), 7);
    }

    #[test]
    fn test_train_runs_and_reduces_loss() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut t = trainer(
            dir.path(),
            json!({
                "num_train_epochs": 8,
                "per_device_train_batch_size": 5,
                "learning_rate": 1e-2,
                "logging_steps": 1,
                "save_steps": 0,
                "evaluation_strategy": "epoch",
            }),
        );

        let before = t.evaluate()?;
        let output = t.train()?;
        let after = t.evaluate()?;

        assert_eq!(output.global_step, 16);
        assert!(after < before, "eval loss {} -> {}", before, after);
        assert!(dir.path().join(TRAINER_STATE_FILE).is_file());

        let state: TrainerState =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join(TRAINER_STATE_FILE))?)?;
        assert_eq!(state.global_step, 16);
        let evals = eval_steps(&state);
        assert_eq!(evals.len(), 8);
        assert_eq!(evals.last(), Some(&(16, 8.0)));
        Ok(())
    }

    #[test]
    fn test_every_epoch_is_evaluated() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut t = trainer_with_examples(
            dir.path(),
            json!({
                "num_train_epochs": 2,
                "per_device_train_batch_size": 2,
                "save_steps": 0,
                "evaluation_strategy": "epoch",
            }),
            4,
        );
        t.train()?;

        assert_eq!(eval_steps(t.state()), vec![(2, 1.0), (4, 2.0)]);
        assert_eq!(t.state().epoch, 2.0);
        Ok(())
    }

    #[test]
    fn test_max_steps_mid_epoch_still_evaluates() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut t = trainer_with_examples(
            dir.path(),
            json!({
                "max_steps": 3,
                "per_device_train_batch_size": 2,
                "save_steps": 0,
                "evaluation_strategy": "epoch",
            }),
            4,
        );
        let output = t.train()?;

        assert_eq!(output.global_step, 3);
        // Stopped after the first of two batches in the second epoch
        assert_eq!(eval_steps(t.state()), vec![(2, 1.0), (3, 1.5)]);
        assert_eq!(t.state().epoch, 1.5);
        Ok(())
    }

    #[test]
    fn test_step_evaluation_interval() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut t = trainer(
            dir.path(),
            json!({
                "num_train_epochs": 2,
                "per_device_train_batch_size": 2,
                "save_steps": 0,
                "evaluation_strategy": "steps",
                "eval_steps": 3,
            }),
        );
        let output = t.train()?;

        assert_eq!(output.global_step, 10);
        let steps: Vec<usize> = eval_steps(t.state()).into_iter().map(|(s, _)| s).collect();
        assert_eq!(steps, vec![3, 6, 9]);
        Ok(())
    }

    #[test]
    fn test_gradient_accumulation_step_count() -> Result<()> {
        let dir = tempfile::tempdir()?;
        // 10 examples / batch 2 = 5 micro-batches per epoch -> steps of 2, 2, 1
        let mut t = trainer(
            dir.path(),
            json!({
                "num_train_epochs": 2,
                "per_device_train_batch_size": 2,
                "gradient_accumulation_steps": 2,
                "logging_steps": 1,
                "save_steps": 0,
            }),
        );
        assert_eq!(t.steps_per_epoch(), 3);

        let output = t.train()?;

        assert_eq!(output.global_step, 6);
        let logged: Vec<usize> = t.state().log_history.iter().map(|e| e.step).collect();
        assert_eq!(logged, (1..=6).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn test_checkpoints_are_rotated() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut t = trainer(
            dir.path(),
            json!({
                "max_steps": 4,
                "per_device_train_batch_size": 2,
                "save_steps": 1,
                "save_total_limit": 2,
            }),
        );
        t.train()?;

        assert!(!dir.path().join("checkpoint-1").exists());
        assert!(!dir.path().join("checkpoint-2").exists());
        assert!(dir.path().join("checkpoint-3").join("model.safetensors").is_file());
        assert!(dir.path().join("checkpoint-4").join(TRAINER_STATE_FILE).is_file());
        Ok(())
    }

    #[test]
    fn test_save_model_writes_artifact() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let t = trainer(&dir.path().join("checkpoints"), json!({}));
        let artifact = dir.path().join("artifacts").join("rugpt");

        t.save_model(&artifact)?;

        for file in ["config.json", "model.safetensors", TRAINING_ARGS_FILE] {
            assert!(artifact.join(file).is_file(), "missing {}", file);
        }
        let reloaded = laughing_core::load_pretrained(artifact.to_str().unwrap(), &Device::Cpu)?;
        assert_eq!(reloaded.model.config(), t.model().model.config());
        Ok(())
    }
}
