//! Dataset loading and tokenization

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use rand::Rng;

use laughing_core::CausalTokenizer;

/// Field holding the raw text of each example
pub const TEXT_FIELD: &str = "text";

/// Examples per tokenizer call during `map_tokenize`
pub const DEFAULT_MAP_BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetFormat {
    /// One example per line
    Text,
    /// JSON Lines, one object with a `text` field per line
    Json,
}

impl FromStr for DatasetFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "text" | "txt" => Ok(Self::Text),
            "json" | "jsonl" => Ok(Self::Json),
            _ => anyhow::bail!("Unknown dataset format: {}. Use: text, json", s),
        }
    }
}

/// One split's source file and its format
#[derive(Debug, Clone)]
pub struct DataFile {
    pub path: PathBuf,
    pub format: DatasetFormat,
}

#[derive(Debug, Clone)]
pub struct DataFiles {
    pub train: DataFile,
    pub test: DataFile,
}

pub struct DatasetDict {
    pub train: TextDataset,
    pub test: TextDataset,
}

/// Load a labeled train/test split pair.
pub fn load_dataset(files: &DataFiles) -> Result<DatasetDict> {
    let train = TextDataset::load(&files.train.path, files.train.format)
        .context("Failed to load train split")?;
    let test = TextDataset::load(&files.test.path, files.test.format)
        .context("Failed to load test split")?;

    tracing::info!("Dataset loaded: {} train / {} test examples", train.len(), test.len());
    Ok(DatasetDict { train, test })
}

/// Raw text examples
#[derive(Debug, Clone, Default)]
pub struct TextDataset {
    texts: Vec<String>,
}

impl TextDataset {
    pub fn new(texts: Vec<String>) -> Self {
        Self { texts }
    }

    pub fn load(path: &Path, format: DatasetFormat) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to open dataset file {}", path.display()))?;

        let texts = match format {
            DatasetFormat::Text => raw.lines().map(str::to_string).collect(),
            DatasetFormat::Json => {
                let mut texts = Vec::new();
                for (line_no, line) in raw.lines().enumerate() {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let entry: serde_json::Value = serde_json::from_str(line).with_context(|| {
                        format!("{}:{}: invalid JSON", path.display(), line_no + 1)
                    })?;
                    let text = entry[TEXT_FIELD].as_str().with_context(|| {
                        format!("{}:{}: missing '{}' field", path.display(), line_no + 1, TEXT_FIELD)
                    })?;
                    texts.push(text.to_string());
                }
                texts
            }
        };

        Ok(Self { texts })
    }

    pub fn len(&self) -> usize {
        self.texts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.texts.iter().map(String::as_str)
    }

    /// Tokenize the text field of every example, `batch_size` examples per
    /// tokenizer call. Sequences are truncated to `max_length`; examples with
    /// fewer than two tokens have nothing to predict and are dropped.
    pub fn map_tokenize(
        &self,
        tokenizer: &CausalTokenizer,
        max_length: usize,
        batch_size: usize,
    ) -> Result<TokenizedDataset> {
        let mut examples = Vec::with_capacity(self.texts.len());
        let mut dropped = 0usize;

        for chunk in self.texts.chunks(batch_size.max(1)) {
            let texts: Vec<&str> = chunk.iter().map(String::as_str).collect();
            for input_ids in tokenizer.encode_batch(&texts, max_length)? {
                if input_ids.len() < 2 {
                    dropped += 1;
                    continue;
                }
                examples.push(TokenizedExample { input_ids });
            }
        }

        if dropped > 0 {
            tracing::debug!("dropped {} examples shorter than 2 tokens", dropped);
        }
        Ok(TokenizedDataset::new(examples))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedExample {
    pub input_ids: Vec<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct TokenizedDataset {
    examples: Vec<TokenizedExample>,
}

impl TokenizedDataset {
    pub fn new(examples: Vec<TokenizedExample>) -> Self {
        Self { examples }
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&TokenizedExample> {
        self.examples.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TokenizedExample> {
        self.examples.iter()
    }

    /// A shuffled visiting order for one epoch
    pub fn shuffled_indices<R: Rng>(&self, rng: &mut R) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.examples.len()).collect();
        order.shuffle(rng);
        order
    }

    pub fn total_tokens(&self) -> usize {
        self.examples.iter().map(|e| e.input_ids.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_format_parsing() {
        assert_eq!("text".parse::<DatasetFormat>().unwrap(), DatasetFormat::Text);
        assert_eq!("JSON".parse::<DatasetFormat>().unwrap(), DatasetFormat::Json);
        assert!("parquet".parse::<DatasetFormat>().is_err());
    }

    #[test]
    fn test_load_text_one_example_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.txt");
        std::fs::write(&path, "first line\nsecond line\r\n\nfourth\n").unwrap();

        let ds = TextDataset::load(&path, DatasetFormat::Text).unwrap();
        let texts: Vec<&str> = ds.iter().collect();
        assert_eq!(texts, vec!["first line", "second line", "", "fourth"]);
    }

    #[test]
    fn test_load_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.jsonl");
        std::fs::write(&path, "{\"text\": \"a joke\"}\n\n{\"text\": \"another\", \"id\": 2}\n").unwrap();

        let ds = TextDataset::load(&path, DatasetFormat::Json).unwrap();
        assert_eq!(ds.len(), 2);

        std::fs::write(&path, "{\"body\": \"no text\"}\n").unwrap();
        let err = TextDataset::load(&path, DatasetFormat::Json).unwrap_err();
        assert!(format!("{:#}", err).contains("missing 'text' field"));
    }

    #[test]
    fn test_load_dataset_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("train.txt");
        std::fs::write(&present, "hello\n").unwrap();

        let files = DataFiles {
            train: DataFile { path: present, format: DatasetFormat::Text },
            test: DataFile { path: dir.path().join("missing.txt"), format: DatasetFormat::Text },
        };
        let err = load_dataset(&files).err().unwrap();
        assert!(format!("{:#}", err).contains("test split"));
    }

    #[test]
    fn test_shuffled_indices_is_a_permutation() {
        let ds = TokenizedDataset::new(
            (0..10).map(|i| TokenizedExample { input_ids: vec![i, i + 1] }).collect(),
        );
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let mut order = ds.shuffled_indices(&mut rng);
        order.sort();
        assert_eq!(order, (0..10).collect::<Vec<_>>());
        assert_eq!(ds.total_tokens(), 20);
    }
}
