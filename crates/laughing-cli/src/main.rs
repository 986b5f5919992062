//! laughing CLI - fine-tune a pretrained GPT-2 checkpoint and chat with it
//!
//! Usage:
//!   laughing train --train-name train.txt --test-name test.txt
//!   laughing train --train-name train.jsonl --train-type json --test-name test.txt
//!   laughing generate
//!   laughing --root-dir /srv/jokes generate --ckpt checkpoints/rugpt3small/checkpoint-500

mod context;
mod generate;
mod params;
mod train;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use context::Context;
use params::Params;

/// Entry of `params.yaml` both commands operate on
pub(crate) const MODEL_KEY: &str = "rugpt";

#[derive(Parser)]
#[command(
    name = "laughing",
    about = "Fine-tune a pretrained GPT-2 checkpoint and generate text with it",
    version
)]
struct Cli {
    /// Project root holding checkpoints/ and artifacts/
    #[arg(long, global = true, default_value = ".")]
    root_dir: PathBuf,

    /// Data directory (default: <root-dir>/data)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Configuration file (default: <root-dir>/params.yaml)
    #[arg(long, global = true)]
    params: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fine-tune the configured model on a train/test split pair
    Train {
        /// Training split file under <data-dir>/processed
        #[arg(long)]
        train_name: String,

        /// Evaluation split file under <data-dir>/processed
        #[arg(long)]
        test_name: String,

        /// Training split format: text, json
        #[arg(long, default_value = "text")]
        train_type: String,

        /// Evaluation split format: text, json
        #[arg(long, default_value = "text")]
        test_type: String,
    },

    /// Interactive text generation from the fine-tuned model
    Generate {
        /// Checkpoint directory (default: <root-dir>/artifacts/<output_name>)
        #[arg(long, value_parser = existing_dir)]
        ckpt: Option<PathBuf>,

        /// HuggingFace tokenizer name or local path
        #[arg(long, default_value = generate::GENERATE_TOKENIZER)]
        tokenizer: String,
    },
}

/// Accept only an existing directory, resolved to an absolute path
fn existing_dir(value: &str) -> Result<PathBuf, String> {
    let path = PathBuf::from(value);
    if !path.exists() {
        return Err(format!("{} does not exist", value));
    }
    if !path.is_dir() {
        return Err(format!("{} is not a directory", value));
    }
    path.canonicalize()
        .map_err(|e| format!("cannot resolve {}: {}", value, e))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let params_path = cli
        .params
        .clone()
        .unwrap_or_else(|| cli.root_dir.join("params.yaml"));
    let params = Params::load(&params_path)?;
    let ctx = Context::new(cli.root_dir, cli.data_dir);

    match cli.command {
        Commands::Train {
            train_name,
            test_name,
            train_type,
            test_type,
        } => {
            train::run(
                &ctx,
                &params,
                train::TrainOptions {
                    train_name,
                    test_name,
                    train_type,
                    test_type,
                },
            )?;
        }

        Commands::Generate { ckpt, tokenizer } => {
            generate::run(&ctx, &params, ckpt, &tokenizer)?;
        }
    }

    Ok(())
}
