//! Causal multi-head self-attention (GPT-2 layout)
//!
//! `c_attn` projects to fused QKV, `c_proj` back to the residual stream.
//! Both are `Conv1D`, i.e. weights stored `[in, out]` as in the pretrained
//! checkpoints.

use candle_core::{Result, Tensor, D};
use candle_nn::VarBuilder;

use crate::model::Conv1D;

pub struct CausalSelfAttention {
    num_heads: usize,
    head_dim: usize,
    hidden_size: usize,

    c_attn: Conv1D,
    c_proj: Conv1D,

    attn_pdrop: f32,
    resid_pdrop: f32,
}

impl CausalSelfAttention {
    pub fn new(
        hidden_size: usize,
        num_heads: usize,
        attn_pdrop: f32,
        resid_pdrop: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        if hidden_size % num_heads != 0 {
            candle_core::bail!(
                "hidden_size ({}) must be divisible by num_heads ({})",
                hidden_size,
                num_heads
            );
        }

        let c_attn = Conv1D::new(hidden_size, 3 * hidden_size, vb.pp("c_attn"))?;
        let c_proj = Conv1D::new(hidden_size, hidden_size, vb.pp("c_proj"))?;

        Ok(Self {
            num_heads,
            head_dim: hidden_size / num_heads,
            hidden_size,
            c_attn,
            c_proj,
            attn_pdrop,
            resid_pdrop,
        })
    }

    /// `mask` is additive and broadcastable to `[batch, heads, seq, seq]`.
    pub fn forward(&self, hidden_states: &Tensor, mask: &Tensor, train: bool) -> Result<Tensor> {
        let qkv = self.c_attn.forward(hidden_states)?;

        let q = qkv.narrow(D::Minus1, 0, self.hidden_size)?;
        let k = qkv.narrow(D::Minus1, self.hidden_size, self.hidden_size)?;
        let v = qkv.narrow(D::Minus1, 2 * self.hidden_size, self.hidden_size)?;

        // (batch, seq, hidden) -> (batch, num_heads, seq, head_dim)
        let q = self.reshape_for_heads(&q)?;
        let k = self.reshape_for_heads(&k)?;
        let v = self.reshape_for_heads(&v)?;

        let scale = (self.head_dim as f64).sqrt();
        let k_t = k.transpose(2, 3)?.contiguous()?;
        let attn_weights = (q.matmul(&k_t)? / scale)?;
        let attn_weights = attn_weights.broadcast_add(mask)?;

        let attn_probs = candle_nn::ops::softmax(&attn_weights, D::Minus1)?;
        let attn_probs = if train && self.attn_pdrop > 0.0 {
            candle_nn::ops::dropout(&attn_probs, self.attn_pdrop)?
        } else {
            attn_probs
        };

        let context = attn_probs.matmul(&v)?;
        let context = self.reshape_from_heads(&context)?;

        let out = self.c_proj.forward(&context)?;
        if train && self.resid_pdrop > 0.0 {
            candle_nn::ops::dropout(&out, self.resid_pdrop)
        } else {
            Ok(out)
        }
    }

    fn reshape_for_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_len, _) = x.dims3()?;
        x.reshape((batch_size, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn reshape_from_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (batch_size, _, seq_len, _) = x.dims4()?;
        x.transpose(1, 2)?
            .contiguous()?
            .reshape((batch_size, seq_len, self.hidden_size))
    }
}

/// Additive causal mask `[1, 1, seq, seq]`: 0 on and below the diagonal.
pub fn causal_mask(seq_len: usize, device: &candle_core::Device) -> Result<Tensor> {
    let mut mask_data = vec![0.0f32; seq_len * seq_len];

    for i in 0..seq_len {
        for j in (i + 1)..seq_len {
            mask_data[i * seq_len + j] = -1e9;
        }
    }

    Tensor::from_vec(mask_data, (1, 1, seq_len, seq_len), device)
}
