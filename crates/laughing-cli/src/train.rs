//! Train subcommand - fine-tune the pretrained model on a processed split pair

use std::path::PathBuf;

use anyhow::Result;

use laughing_core::checkpoint::format_params;
use laughing_core::{load_pretrained, load_tokenizer, select_device, system_accelerators};
use laughing_training::{
    load_dataset, CausalLmCollator, DataFile, DataFiles, DatasetFormat, Trainer,
    TrainingArguments, DEFAULT_MAP_BATCH_SIZE,
};

use crate::context::Context;
use crate::params::{ModelParams, Params};
use crate::MODEL_KEY;

/// Padding symbol registered on the tokenizer before tokenization
pub const PAD_TOKEN: &str = "<pad>";

#[derive(Debug, Clone)]
pub struct TrainOptions {
    pub train_name: String,
    pub test_name: String,
    pub train_type: String,
    pub test_type: String,
}

/// Run the train subcommand
pub fn run(ctx: &Context, params: &Params, opts: TrainOptions) -> Result<()> {
    println!("\n=== laughing: fine-tuning ===\n");

    let model_params = params.model(MODEL_KEY)?;
    // Validate options and data paths before any download
    let args = build_training_arguments(ctx, &model_params)?;
    let files = data_files(ctx, &opts)?;

    let device = select_device(&system_accelerators());
    println!("  Device: {:?}", device);

    let mut tokenizer = load_tokenizer(&model_params.name)?;
    let loaded = load_pretrained(&model_params.name, &device)?;
    let config = loaded.model.config().clone();
    let pad_id = tokenizer.set_pad_token(PAD_TOKEN, config.eos_token_id)?;
    println!(
        "  Model: {} ({} params)",
        model_params.name,
        format_params(config.total_params())
    );
    println!("  Vocab size: {} (pad id {})", tokenizer.vocab_size(), pad_id);

    let dataset = load_dataset(&files)?;
    let train = dataset
        .train
        .map_tokenize(&tokenizer, config.n_positions, DEFAULT_MAP_BATCH_SIZE)?;
    let test = dataset
        .test
        .map_tokenize(&tokenizer, config.n_positions, DEFAULT_MAP_BATCH_SIZE)?;
    println!(
        "  Tokenized: {} train ({} tokens) / {} test",
        train.len(),
        train.total_tokens(),
        test.len()
    );
    println!("  Checkpoints: {}", args.output_dir.display());

    let collator = CausalLmCollator::new(pad_id);
    let mut trainer = Trainer::new(loaded, args, collator, train, Some(test), device);
    trainer.train()?;

    let artifact = artifact_dir(ctx, &model_params);
    trainer.save_model(&artifact)?;
    println!("  Model saved: {}", artifact.display());

    Ok(())
}

/// Output under `checkpoints/<checkpoint_name>`, options from `stages.train`
pub fn build_training_arguments(
    ctx: &Context,
    model_params: &ModelParams,
) -> Result<TrainingArguments> {
    TrainingArguments::new(
        ctx.checkpoints(&model_params.checkpoint_name),
        model_params.stages.train.clone(),
    )
}

pub fn artifact_dir(ctx: &Context, model_params: &ModelParams) -> PathBuf {
    ctx.artifacts(&model_params.output_name)
}

fn data_files(ctx: &Context, opts: &TrainOptions) -> Result<DataFiles> {
    Ok(DataFiles {
        train: DataFile {
            path: ctx.processed(&opts.train_name),
            format: opts.train_type.parse::<DatasetFormat>()?,
        },
        test: DataFile {
            path: ctx.processed(&opts.test_name),
            format: opts.test_type.parse::<DatasetFormat>()?,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};
    use laughing_core::{Gpt2Config, Gpt2LmHeadModel, LoadedModel};
    use laughing_training::{TokenizedDataset, TokenizedExample};
    use serde_json::json;

    fn model_params(train: serde_json::Value) -> ModelParams {
        let yaml = format!(
            "models:\n  rugpt:\n    name: gpt2\n    checkpoint_name: ckpt\n    output_name: out\n    stages:\n      train: {}\n      generation: {{}}\n",
            train
        );
        Params::from_yaml(&yaml).unwrap().model(MODEL_KEY).unwrap()
    }

    #[test]
    fn test_training_arguments_keep_stage_options() {
        let ctx = Context::new("/proj", None);
        let train = json!({
            "num_train_epochs": 2,
            "per_device_train_batch_size": 4,
            "warmup_steps": 10,
            "lr_scheduler_type": "cosine",
        });
        let params = model_params(train.clone());

        let args = build_training_arguments(&ctx, &params).unwrap();

        assert_eq!(args.output_dir, PathBuf::from("/proj/checkpoints/ckpt"));
        assert_eq!(serde_json::Value::Object(args.options.clone()), train);
        assert_eq!(args.params.per_device_train_batch_size, 4);
    }

    #[test]
    fn test_data_files_from_processed_dir() {
        let ctx = Context::new("/proj", None);
        let opts = TrainOptions {
            train_name: "train.jsonl".into(),
            test_name: "test.txt".into(),
            train_type: "json".into(),
            test_type: "text".into(),
        };
        let files = data_files(&ctx, &opts).unwrap();
        assert_eq!(files.train.path, PathBuf::from("/proj/data/processed/train.jsonl"));
        assert_eq!(files.train.format, DatasetFormat::Json);
        assert_eq!(files.test.format, DatasetFormat::Text);

        let bad = TrainOptions { test_type: "csv".into(), ..opts };
        assert!(data_files(&ctx, &bad).is_err());
    }

    #[test]
    fn test_saved_model_lands_in_artifacts() {
        let root = tempfile::tempdir().unwrap();
        let ctx = Context::new(root.path(), None);
        let params = model_params(json!({"max_steps": 1, "save_steps": 0}));

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = Gpt2LmHeadModel::new(Gpt2Config::tiny(8), vb).unwrap();
        let data = TokenizedDataset::new(vec![
            TokenizedExample { input_ids: vec![1, 2, 3] },
            TokenizedExample { input_ids: vec![4, 5] },
        ]);

        let args = build_training_arguments(&ctx, &params).unwrap();
        let mut trainer = Trainer::new(
            LoadedModel { model, varmap },
            args,
            CausalLmCollator::new(0),
            data.clone(),
            Some(data),
            Device::Cpu,
        );
        trainer.train().unwrap();
        trainer.save_model(&artifact_dir(&ctx, &params)).unwrap();

        let artifact = root.path().join("artifacts").join("out");
        assert!(artifact.join("config.json").is_file());
        assert!(artifact.join("model.safetensors").is_file());
        assert!(root.path().join("checkpoints").join("ckpt").join("trainer_state.json").is_file());
    }
}
