//! Batch collation for causal language modeling
//!
//! No token masking: labels are the inputs themselves (the model shifts them),
//! with padding positions excluded from the loss.

use anyhow::Result;
use candle_core::{Device, Tensor};

use crate::dataset::TokenizedExample;

/// Label value ignored by the loss
pub const IGNORE_INDEX: i64 = -100;

#[derive(Debug, Clone, Copy)]
pub struct CausalLmCollator {
    pad_token_id: u32,
}

/// Host-side padded batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollatedBatch {
    pub input_ids: Vec<Vec<u32>>,
    pub attention_mask: Vec<Vec<u32>>,
    pub labels: Vec<Vec<i64>>,
}

/// Device tensors ready for a forward pass
pub struct Batch {
    pub input_ids: Tensor,
    pub attention_mask: Tensor,
    /// Labels with ignored positions replaced by 0
    pub targets: Tensor,
    /// 1.0 where the label counts toward the loss
    pub loss_mask: Tensor,
}

impl CausalLmCollator {
    pub fn new(pad_token_id: u32) -> Self {
        Self { pad_token_id }
    }

    pub fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }

    /// Right-pad every example to the longest one in the batch.
    pub fn collate(&self, examples: &[&TokenizedExample]) -> Result<CollatedBatch> {
        if examples.is_empty() {
            anyhow::bail!("Cannot collate an empty batch");
        }
        let max_len = examples.iter().map(|e| e.input_ids.len()).max().unwrap_or(0);

        let mut batch = CollatedBatch {
            input_ids: Vec::with_capacity(examples.len()),
            attention_mask: Vec::with_capacity(examples.len()),
            labels: Vec::with_capacity(examples.len()),
        };

        for example in examples {
            let len = example.input_ids.len();
            let pad = max_len - len;

            let mut input_ids = example.input_ids.clone();
            input_ids.resize(max_len, self.pad_token_id);

            let mut attention_mask = vec![1u32; len];
            attention_mask.resize(max_len, 0);

            let mut labels: Vec<i64> = example.input_ids.iter().map(|&id| id as i64).collect();
            labels.extend(std::iter::repeat(IGNORE_INDEX).take(pad));

            batch.input_ids.push(input_ids);
            batch.attention_mask.push(attention_mask);
            batch.labels.push(labels);
        }

        Ok(batch)
    }
}

impl CollatedBatch {
    pub fn to_tensors(&self, device: &Device) -> Result<Batch> {
        let targets: Vec<Vec<u32>> = self
            .labels
            .iter()
            .map(|row| row.iter().map(|&l| l.max(0) as u32).collect())
            .collect();
        let loss_mask: Vec<Vec<f32>> = self
            .labels
            .iter()
            .map(|row| row.iter().map(|&l| if l == IGNORE_INDEX { 0.0 } else { 1.0 }).collect())
            .collect();

        Ok(Batch {
            input_ids: Tensor::new(self.input_ids.clone(), device)?,
            attention_mask: Tensor::new(self.attention_mask.clone(), device)?,
            targets: Tensor::new(targets, device)?,
            loss_mask: Tensor::new(loss_mask, device)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example(ids: &[u32]) -> TokenizedExample {
        TokenizedExample { input_ids: ids.to_vec() }
    }

    #[test]
    fn test_pads_to_longest_and_ignores_padding_in_labels() {
        let collator = CausalLmCollator::new(0);
        let a = example(&[5, 6, 7]);
        let b = example(&[8, 9]);

        let batch = collator.collate(&[&a, &b]).unwrap();

        assert_eq!(batch.input_ids, vec![vec![5, 6, 7], vec![8, 9, 0]]);
        assert_eq!(batch.attention_mask, vec![vec![1, 1, 1], vec![1, 1, 0]]);
        assert_eq!(batch.labels, vec![vec![5, 6, 7], vec![8, 9, IGNORE_INDEX]]);
    }

    #[test]
    fn test_tensors_carry_loss_mask() {
        let collator = CausalLmCollator::new(3);
        let a = example(&[1, 2]);
        let b = example(&[4]);

        let batch = collator.collate(&[&a, &b]).unwrap().to_tensors(&Device::Cpu).unwrap();

        assert_eq!(batch.input_ids.to_vec2::<u32>().unwrap(), vec![vec![1, 2], vec![4, 3]]);
        assert_eq!(batch.targets.to_vec2::<u32>().unwrap(), vec![vec![1, 2], vec![4, 0]]);
        assert_eq!(
            batch.loss_mask.to_vec2::<f32>().unwrap(),
            vec![vec![1.0, 1.0], vec![1.0, 0.0]]
        );
    }

    #[test]
    fn test_empty_batch_is_an_error() {
        assert!(CausalLmCollator::new(0).collate(&[]).is_err());
    }
}
