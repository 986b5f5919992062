//! Tokenizer loading from HuggingFace Hub or local files
//!
//! GPT-2 family repos do not always ship a `tokenizer.json`; in that case the
//! byte-level BPE is assembled from `vocab.json` + `merges.txt`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use hf_hub::{api::sync::Api, Repo, RepoType};
use serde_json::json;
use tokenizers::{PaddingParams, Tokenizer};

/// Special tokens registered as added tokens when present in `vocab.json`
const KNOWN_SPECIAL_TOKENS: &[&str] = &["<pad>", "<s>", "</s>", "<unk>", "<mask>", "<|endoftext|>"];

/// A causal-LM tokenizer with an explicit padding token.
pub struct CausalTokenizer {
    inner: Tokenizer,
    pad_token: Option<(String, u32)>,
}

impl CausalTokenizer {
    pub fn new(inner: Tokenizer) -> Self {
        Self {
            inner,
            pad_token: None,
        }
    }

    /// Set the padding symbol. Falls back to `fallback_id` (normally EOS)
    /// when the symbol is not in the vocabulary.
    pub fn set_pad_token(&mut self, symbol: &str, fallback_id: Option<u32>) -> Result<u32> {
        let pad_id = match self.inner.token_to_id(symbol) {
            Some(id) => id,
            None => {
                let id = fallback_id.with_context(|| {
                    format!("pad token {:?} not in vocabulary and no fallback id", symbol)
                })?;
                tracing::warn!(
                    "pad token {:?} not in vocabulary, padding with id {} instead",
                    symbol,
                    id
                );
                id
            }
        };

        self.inner.with_padding(Some(PaddingParams {
            pad_id,
            pad_token: symbol.to_string(),
            ..Default::default()
        }));
        self.pad_token = Some((symbol.to_string(), pad_id));
        Ok(pad_id)
    }

    pub fn pad_token(&self) -> Option<&str> {
        self.pad_token.as_ref().map(|(s, _)| s.as_str())
    }

    pub fn pad_token_id(&self) -> Option<u32> {
        self.pad_token.as_ref().map(|(_, id)| *id)
    }

    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    /// Encode without special tokens (GPT-2 adds none)
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("Failed to tokenize: {}", e))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Encode a batch, truncating every sequence to `max_length` tokens.
    /// Sequences are returned unpadded; padding is the collator's job.
    pub fn encode_batch(&self, texts: &[&str], max_length: usize) -> Result<Vec<Vec<u32>>> {
        texts
            .iter()
            .map(|text| {
                let mut ids = self.encode(text)?;
                ids.truncate(max_length);
                Ok(ids)
            })
            .collect()
    }

    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| anyhow::anyhow!("Failed to decode: {}", e))
    }
}

/// Load a tokenizer by HuggingFace model name or local path.
///
/// - `load_tokenizer("sberbank-ai/rugpt3small_based_on_gpt2")` -> downloads from the Hub
/// - `load_tokenizer("./artifacts/rugpt")` -> local directory
/// - `load_tokenizer("./tokenizer.json")` -> local file
pub fn load_tokenizer(name: &str) -> Result<CausalTokenizer> {
    let path = Path::new(name);
    if path.is_file() {
        tracing::info!("Loading tokenizer from local file: {}", name);
        return from_tokenizer_json(path).map(CausalTokenizer::new);
    }
    if path.is_dir() {
        tracing::info!("Loading tokenizer from local directory: {}", name);
        return from_directory(path).map(CausalTokenizer::new);
    }

    tracing::info!("Downloading tokenizer: {} ...", name);
    let api = Api::new().context("Failed to initialize HuggingFace Hub API")?;
    let repo = api.repo(Repo::new(name.to_string(), RepoType::Model));

    let tokenizer = match repo.get("tokenizer.json") {
        Ok(tokenizer_path) => from_tokenizer_json(&tokenizer_path)?,
        Err(e) => {
            tracing::debug!("no tokenizer.json in {} ({}), using vocab.json + merges.txt", name, e);
            let vocab = repo
                .get("vocab.json")
                .with_context(|| format!("Failed to download vocab.json from {}", name))?;
            let merges = repo
                .get("merges.txt")
                .with_context(|| format!("Failed to download merges.txt from {}", name))?;
            from_vocab_and_merges(&vocab, &merges)?
        }
    };

    tracing::info!(
        "Tokenizer loaded: {} (vocab size: {})",
        name,
        tokenizer.get_vocab_size(true)
    );
    Ok(CausalTokenizer::new(tokenizer))
}

fn from_tokenizer_json(path: &Path) -> Result<Tokenizer> {
    Tokenizer::from_file(path)
        .map_err(|e| anyhow::anyhow!("Failed to load tokenizer {}: {}", path.display(), e))
}

fn from_directory(dir: &Path) -> Result<Tokenizer> {
    let tokenizer_json = dir.join("tokenizer.json");
    if tokenizer_json.is_file() {
        return from_tokenizer_json(&tokenizer_json);
    }
    let vocab: PathBuf = dir.join("vocab.json");
    let merges: PathBuf = dir.join("merges.txt");
    if !vocab.is_file() || !merges.is_file() {
        anyhow::bail!(
            "{} has neither tokenizer.json nor vocab.json + merges.txt",
            dir.display()
        );
    }
    from_vocab_and_merges(&vocab, &merges)
}

/// Build a GPT-2 style byte-level BPE tokenizer from its two source files.
pub fn from_vocab_and_merges(vocab_path: &Path, merges_path: &Path) -> Result<Tokenizer> {
    let vocab_raw = std::fs::read_to_string(vocab_path)
        .with_context(|| format!("Failed to read {}", vocab_path.display()))?;
    let vocab: HashMap<String, u32> = serde_json::from_str(&vocab_raw)
        .with_context(|| format!("Invalid vocab file {}", vocab_path.display()))?;

    let merges_raw = std::fs::read_to_string(merges_path)
        .with_context(|| format!("Failed to read {}", merges_path.display()))?;
    let merges: Vec<&str> = merges_raw
        .lines()
        .filter(|line| !line.is_empty() && !line.starts_with("#version"))
        .collect();

    let added_tokens: Vec<serde_json::Value> = KNOWN_SPECIAL_TOKENS
        .iter()
        .filter_map(|token| vocab.get(*token).map(|id| (*token, *id)))
        .map(|(token, id)| {
            json!({
                "id": id,
                "content": token,
                "single_word": false,
                "lstrip": false,
                "rstrip": false,
                "normalized": false,
                "special": true,
            })
        })
        .collect();

    let byte_level = json!({
        "type": "ByteLevel",
        "add_prefix_space": false,
        "trim_offsets": true,
        "use_regex": true,
    });

    let tokenizer_json = json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": added_tokens,
        "normalizer": null,
        "pre_tokenizer": byte_level,
        "post_processor": byte_level,
        "decoder": byte_level,
        "model": {
            "type": "BPE",
            "dropout": null,
            "unk_token": null,
            "continuing_subword_prefix": null,
            "end_of_word_suffix": null,
            "fuse_unk": false,
            "byte_fallback": false,
            "vocab": vocab,
            "merges": merges,
        },
    });

    tokenizer_json.to_string()
        .parse::<Tokenizer>()
        .map_err(|e| anyhow::anyhow!("Failed to assemble BPE tokenizer: {}", e))
}
