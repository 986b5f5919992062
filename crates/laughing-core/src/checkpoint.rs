//! Pretrained checkpoint loading and saving
//!
//! A checkpoint is a directory (or Hub repo) with `config.json` and
//! `model.safetensors` (or a PyTorch `pytorch_model.bin` for older repos).
//! Weights are loaded into a `VarMap` so the same model can be fine-tuned and
//! saved back. Saving always writes safetensors.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use hf_hub::{api::sync::Api, Repo, RepoType};

use crate::config::Gpt2Config;
use crate::model::Gpt2LmHeadModel;

pub const CONFIG_FILE: &str = "config.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const PYTORCH_WEIGHTS_FILE: &str = "pytorch_model.bin";

/// HF GPT2LMHeadModel checkpoints prefix the body with this
const BODY_PREFIX: &str = "transformer.";

/// Resolved on-disk locations of a checkpoint's files
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub weights: PathBuf,
}

impl ModelFiles {
    /// Resolve a local directory or a HuggingFace model id.
    pub fn resolve(name_or_dir: &str) -> Result<Self> {
        let dir = Path::new(name_or_dir);
        if dir.is_dir() {
            return Self::from_dir(dir);
        }

        tracing::info!("Downloading model: {} ...", name_or_dir);
        let api = Api::new().context("Failed to initialize HuggingFace Hub API")?;
        let repo = api.repo(Repo::new(name_or_dir.to_string(), RepoType::Model));
        let config = repo
            .get(CONFIG_FILE)
            .with_context(|| format!("Failed to download {} from {}", CONFIG_FILE, name_or_dir))?;
        let weights = match repo.get(WEIGHTS_FILE) {
            Ok(path) => path,
            Err(e) => {
                tracing::debug!("no {} in {} ({}), trying {}", WEIGHTS_FILE, name_or_dir, e, PYTORCH_WEIGHTS_FILE);
                repo.get(PYTORCH_WEIGHTS_FILE).with_context(|| {
                    format!("Failed to download weights from {}", name_or_dir)
                })?
            }
        };
        Ok(Self { config, weights })
    }

    pub fn from_dir(dir: &Path) -> Result<Self> {
        let safetensors = dir.join(WEIGHTS_FILE);
        let pytorch = dir.join(PYTORCH_WEIGHTS_FILE);
        let files = Self {
            config: dir.join(CONFIG_FILE),
            weights: if !safetensors.is_file() && pytorch.is_file() {
                pytorch
            } else {
                safetensors
            },
        };
        for file in [&files.config, &files.weights] {
            if !file.is_file() {
                anyhow::bail!("Checkpoint file not found: {}", file.display());
            }
        }
        Ok(files)
    }
}

/// A model together with the variables backing its parameters
pub struct LoadedModel {
    pub model: Gpt2LmHeadModel,
    pub varmap: VarMap,
}

pub fn load_config(path: &Path) -> Result<Gpt2Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config: Gpt2Config = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid model config {}", path.display()))?;
    Ok(config)
}

/// Load a causal LM by Hub id or checkpoint directory onto `device`.
pub fn load_pretrained(name_or_dir: &str, device: &Device) -> Result<LoadedModel> {
    let files = ModelFiles::resolve(name_or_dir)?;
    load_from_files(&files, device)
}

pub fn load_from_files(files: &ModelFiles, device: &Device) -> Result<LoadedModel> {
    let config = load_config(&files.config)?;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = Gpt2LmHeadModel::new(config, vb)?;

    let tensors = read_weights(&files.weights, device)
        .with_context(|| format!("Failed to load checkpoint: {}", files.weights.display()))?;
    assign_weights(&varmap, tensors)?;

    tracing::info!(
        "Model loaded from {} ({} params)",
        files.weights.display(),
        format_params(model.config().total_params())
    );
    Ok(LoadedModel { model, varmap })
}

fn read_weights(path: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
    if path.extension().is_some_and(|ext| ext == "bin") {
        let mut tensors = HashMap::new();
        for (name, tensor) in candle_core::pickle::read_all(path)? {
            tensors.insert(name, tensor.to_device(device)?);
        }
        return Ok(tensors);
    }
    Ok(candle_core::safetensors::load(path, device)?)
}

/// Copy checkpoint tensors into the model variables, by HF parameter name.
fn assign_weights(varmap: &VarMap, tensors: HashMap<String, Tensor>) -> Result<()> {
    let tensors: HashMap<String, Tensor> = tensors
        .into_iter()
        .map(|(name, t)| match name.strip_prefix(BODY_PREFIX) {
            Some(stripped) => (stripped.to_string(), t),
            None => (name, t),
        })
        .collect();

    let data = varmap
        .data()
        .lock()
        .map_err(|_| anyhow::anyhow!("VarMap lock poisoned"))?;

    let mut missing = Vec::new();
    for (name, var) in data.iter() {
        match tensors.get(name) {
            Some(tensor) => {
                let tensor = tensor.to_dtype(var.dtype())?;
                var.set(&tensor)
                    .with_context(|| format!("Shape mismatch for parameter {}", name))?;
            }
            None => missing.push(name.clone()),
        }
    }

    if !missing.is_empty() {
        missing.sort();
        anyhow::bail!("Checkpoint is missing parameters: {}", missing.join(", "));
    }
    Ok(())
}

/// Write `config.json` and `model.safetensors` into `dir`.
pub fn save_pretrained(dir: &Path, config: &Gpt2Config, varmap: &VarMap) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let config_json = serde_json::to_string_pretty(config)?;
    std::fs::write(dir.join(CONFIG_FILE), config_json)?;
    varmap
        .save(dir.join(WEIGHTS_FILE))
        .with_context(|| format!("Failed to save weights to {}", dir.display()))?;
    Ok(())
}

pub fn format_params(n: usize) -> String {
    if n >= 1_000_000_000 {
        format!("{:.1}B", n as f64 / 1_000_000_000.0)
    } else if n >= 1_000_000 {
        format!("{:.0}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.0}K", n as f64 / 1_000.0)
    } else {
        format!("{}", n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_checkpoint(dir: &Path) -> Result<(Gpt2Config, VarMap)> {
        let config = Gpt2Config::tiny(40);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let _model = Gpt2LmHeadModel::new(config.clone(), vb)?;
        save_pretrained(dir, &config, &varmap)?;
        Ok((config, varmap))
    }

    #[test]
    fn test_save_then_load_restores_weights() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (config, varmap) = tiny_checkpoint(dir.path())?;

        let loaded = load_pretrained(dir.path().to_str().unwrap(), &Device::Cpu)?;
        assert_eq!(loaded.model.config(), &config);

        let original = varmap.data().lock().unwrap()["wte.weight"].as_tensor().clone();
        let restored = loaded.varmap.data().lock().unwrap()["wte.weight"].as_tensor().clone();
        let diff = (original - restored)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn test_transformer_prefix_is_stripped() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (config, varmap) = tiny_checkpoint(dir.path())?;

        // Re-save with the HF `transformer.` prefix on every body tensor
        let prefixed: HashMap<String, Tensor> = varmap
            .data()
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (format!("{}{}", BODY_PREFIX, k), v.as_tensor().clone()))
            .collect();
        candle_core::safetensors::save(&prefixed, dir.path().join(WEIGHTS_FILE))?;

        let loaded = load_pretrained(dir.path().to_str().unwrap(), &Device::Cpu)?;
        assert_eq!(loaded.model.config(), &config);
        Ok(())
    }

    #[test]
    fn test_missing_parameter_is_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (_, varmap) = tiny_checkpoint(dir.path())?;

        let partial: HashMap<String, Tensor> = varmap
            .data()
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k.as_str() != "ln_f.weight")
            .map(|(k, v)| (k.clone(), v.as_tensor().clone()))
            .collect();
        candle_core::safetensors::save(&partial, dir.path().join(WEIGHTS_FILE))?;

        let err = load_pretrained(dir.path().to_str().unwrap(), &Device::Cpu)
            .err()
            .expect("load should fail");
        assert!(err.to_string().contains("ln_f.weight"));
        Ok(())
    }

    #[test]
    fn test_from_dir_requires_both_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{}").unwrap();
        assert!(ModelFiles::from_dir(dir.path()).is_err());
    }
}
