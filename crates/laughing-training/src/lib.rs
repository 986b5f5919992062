//! laughing-training - causal LM fine-tuning
//!
//! Dataset loading, tokenization, padding collation and the training loop

pub mod args;
pub mod collator;
pub mod dataset;
pub mod trainer;

pub use args::{IntervalStrategy, SchedulerType, TrainingArguments, TrainingHyperparams};
pub use collator::{Batch, CausalLmCollator, CollatedBatch, IGNORE_INDEX};
pub use dataset::{
    load_dataset, DataFile, DataFiles, DatasetDict, DatasetFormat, TextDataset, TokenizedDataset,
    TokenizedExample, DEFAULT_MAP_BATCH_SIZE,
};
pub use trainer::{causal_lm_loss, TrainOutput, Trainer, TrainerState};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;
    use laughing_core::load_tokenizer;
    use serde_json::json;

    #[test]
    fn test_tokenize_then_collate() {
        let dir = tempfile::tempdir().unwrap();
        let vocab = json!({
            "<pad>": 0, "<s>": 1, "</s>": 2,
            "a": 3, "b": 4, "c": 5, "ab": 6, "abc": 7, "Ġ": 8,
        });
        std::fs::write(dir.path().join("vocab.json"), vocab.to_string()).unwrap();
        std::fs::write(dir.path().join("merges.txt"), "a b\nab c\n").unwrap();

        let mut tokenizer = load_tokenizer(dir.path().to_str().unwrap()).unwrap();
        let pad_id = tokenizer.set_pad_token("<pad>", Some(2)).unwrap();

        let texts = TextDataset::new(vec![
            "abc ab".to_string(),
            "abc".to_string(), // single token, dropped
            "a b c a b c".to_string(),
        ]);
        let tokenized = texts.map_tokenize(&tokenizer, 4, 2).unwrap();

        assert_eq!(tokenized.len(), 2);
        assert_eq!(tokenized.get(0).unwrap().input_ids, vec![7, 8, 6]);
        assert_eq!(tokenized.get(1).unwrap().input_ids.len(), 4);

        let examples: Vec<&TokenizedExample> = tokenized.iter().collect();
        let batch = CausalLmCollator::new(pad_id).collate(&examples).unwrap();
        assert_eq!(batch.input_ids[0], vec![7, 8, 6, 0]);
        assert_eq!(batch.labels[0][3], IGNORE_INDEX);
    }
}
