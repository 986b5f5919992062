//! Generate subcommand - interactive prompt loop over a fine-tuned model

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;

use laughing_core::checkpoint::load_from_files;
use laughing_core::{
    load_tokenizer, select_device, system_accelerators, GenerationParams, ModelFiles,
    TextGenerationPipeline, TextGenerator,
};

use crate::context::Context;
use crate::params::{ModelParams, Params};
use crate::MODEL_KEY;

/// Tokenizer used for generation regardless of the configured model name
pub const GENERATE_TOKENIZER: &str = "sberbank-ai/rugpt3small_based_on_gpt2";

const SEPARATOR: &str = "====================";
const PROMPT: &str = "> ";
const QUIT_COMMANDS: &[&str] = &[":quit", ":exit"];

/// Run the generate subcommand
pub fn run(
    ctx: &Context,
    params: &Params,
    ckpt: Option<PathBuf>,
    tokenizer_name: &str,
) -> Result<()> {
    println!("\n=== laughing: text generation ===\n");

    let model_params = params.model(MODEL_KEY)?;
    let generation = GenerationParams::from_options(&model_params.stages.generation)?;

    let tokenizer = load_tokenizer(tokenizer_name)?;
    let source = resolve_model_source(ckpt.as_deref(), ctx, &model_params);
    let device = select_device(&system_accelerators());
    let loaded = load_from_files(&ModelFiles::from_dir(&source)?, &device)?;
    println!("  Model loaded from: {}", source.display());
    println!("  Device: {:?}", device);
    println!("  Type a prompt, {} or Ctrl-D to quit\n", QUIT_COMMANDS.join(" / "));

    let mut pipeline = TextGenerationPipeline::new(loaded.model, tokenizer, device);
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    run_repl(stdin.lock(), stdout.lock(), &mut pipeline, &generation)
}

/// `ckpt` when given, otherwise `artifacts/<output_name>`
pub fn resolve_model_source(ckpt: Option<&Path>, ctx: &Context, model_params: &ModelParams) -> PathBuf {
    match ckpt {
        Some(dir) => dir.to_path_buf(),
        None => ctx.artifacts(&model_params.output_name),
    }
}

/// Read prompts until end of input or a quit command, printing every
/// continuation between two separator lines.
pub fn run_repl<R, W, G>(
    mut input: R,
    mut output: W,
    generator: &mut G,
    params: &GenerationParams,
) -> Result<()>
where
    R: BufRead,
    W: Write,
    G: TextGenerator,
{
    let mut line = String::new();
    loop {
        write!(output, "{}", PROMPT)?;
        output.flush()?;

        line.clear();
        if input.read_line(&mut line)? == 0 {
            writeln!(output)?;
            break;
        }
        let prompt = line.trim_end_matches(['\r', '\n']);
        if prompt.trim().is_empty() {
            continue;
        }
        if QUIT_COMMANDS.contains(&prompt.trim()) {
            break;
        }

        for result in generator.generate(prompt, params)? {
            writeln!(output, "{}", SEPARATOR)?;
            writeln!(output, "{}", result.generated_text)?;
            writeln!(output, "{}", SEPARATOR)?;
        }
    }
    Ok(())
}
