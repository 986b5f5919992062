//! GPT-2 causal language model
//!
//! Pre-norm transformer blocks with learned positions and an lm head tied to
//! the token embedding. Parameter names match HuggingFace `GPT2LMHeadModel`
//! without the `transformer.` prefix (`wte`, `wpe`, `h.{i}.*`, `ln_f`).

use candle_core::{DType, Module, Result, Tensor, D};
use candle_nn::{embedding, init::Init, Embedding, VarBuilder};

use crate::attention::{causal_mask, CausalSelfAttention};
use crate::config::Gpt2Config;

pub struct Gpt2LmHeadModel {
    config: Gpt2Config,
    wte: Embedding,
    wpe: Embedding,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
}

impl Gpt2LmHeadModel {
    pub fn new(config: Gpt2Config, vb: VarBuilder) -> Result<Self> {
        config.validate().map_err(|e| candle_core::Error::Msg(e.to_string()))?;

        let wte = embedding(config.vocab_size, config.n_embd, vb.pp("wte"))?;
        let wpe = embedding(config.n_positions, config.n_embd, vb.pp("wpe"))?;

        let mut blocks = Vec::with_capacity(config.n_layer);
        for layer_idx in 0..config.n_layer {
            blocks.push(Block::new(&config, vb.pp(format!("h.{}", layer_idx)))?);
        }

        let ln_f = LayerNorm::new(config.n_embd, config.layer_norm_epsilon, vb.pp("ln_f"))?;

        Ok(Self {
            config,
            wte,
            wpe,
            blocks,
            ln_f,
        })
    }

    /// `input_ids`: `[batch, seq]` u32. `attention_mask`: `[batch, seq]`, 1 for
    /// real tokens and 0 for padding. Returns logits `[batch, seq, vocab]`.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let (batch_size, seq_len) = input_ids.dims2()?;
        if seq_len > self.config.n_positions {
            candle_core::bail!(
                "sequence length {} exceeds n_positions {}",
                seq_len,
                self.config.n_positions
            );
        }
        let device = input_ids.device();

        let positions = Tensor::arange(0u32, seq_len as u32, device)?;
        let token_embeds = self.wte.forward(input_ids)?;
        let position_embeds = self.wpe.forward(&positions)?;
        let mut hidden_states = token_embeds.broadcast_add(&position_embeds)?;
        if train && self.config.embd_pdrop > 0.0 {
            hidden_states = candle_nn::ops::dropout(&hidden_states, self.config.embd_pdrop)?;
        }

        let mut mask = causal_mask(seq_len, device)?;
        if let Some(attention_mask) = attention_mask {
            // 1 -> 0.0, 0 -> -1e9, shaped [batch, 1, 1, seq]
            let padding = attention_mask
                .to_dtype(DType::F32)?
                .affine(1e9, -1e9)?
                .reshape((batch_size, 1, 1, seq_len))?;
            mask = mask.broadcast_add(&padding)?;
        }

        for block in &self.blocks {
            hidden_states = block.forward(&hidden_states, &mask, train)?;
        }

        let hidden_states = self.ln_f.forward(&hidden_states)?;

        // Tied lm head
        hidden_states.broadcast_matmul(&self.wte.embeddings().t()?)
    }

    pub fn config(&self) -> &Gpt2Config {
        &self.config
    }
}

struct Block {
    ln_1: LayerNorm,
    attn: CausalSelfAttention,
    ln_2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    fn new(config: &Gpt2Config, vb: VarBuilder) -> Result<Self> {
        let ln_1 = LayerNorm::new(config.n_embd, config.layer_norm_epsilon, vb.pp("ln_1"))?;
        let attn = CausalSelfAttention::new(
            config.n_embd,
            config.n_head,
            config.attn_pdrop,
            config.resid_pdrop,
            vb.pp("attn"),
        )?;
        let ln_2 = LayerNorm::new(config.n_embd, config.layer_norm_epsilon, vb.pp("ln_2"))?;
        let mlp = Mlp::new(config, vb.pp("mlp"))?;

        Ok(Self {
            ln_1,
            attn,
            ln_2,
            mlp,
        })
    }

    fn forward(&self, hidden_states: &Tensor, mask: &Tensor, train: bool) -> Result<Tensor> {
        let normed = self.ln_1.forward(hidden_states)?;
        let attn_out = self.attn.forward(&normed, mask, train)?;
        let hidden_states = hidden_states.add(&attn_out)?;

        let normed = self.ln_2.forward(&hidden_states)?;
        let mlp_out = self.mlp.forward(&normed, train)?;
        hidden_states.add(&mlp_out)
    }
}

struct Mlp {
    c_fc: Conv1D,
    c_proj: Conv1D,
    resid_pdrop: f32,
}

impl Mlp {
    fn new(config: &Gpt2Config, vb: VarBuilder) -> Result<Self> {
        let c_fc = Conv1D::new(config.n_embd, config.inner_dim(), vb.pp("c_fc"))?;
        let c_proj = Conv1D::new(config.inner_dim(), config.n_embd, vb.pp("c_proj"))?;
        Ok(Self {
            c_fc,
            c_proj,
            resid_pdrop: config.resid_pdrop,
        })
    }

    fn forward(&self, hidden_states: &Tensor, train: bool) -> Result<Tensor> {
        // gelu_new (tanh approximation)
        let hidden = self.c_fc.forward(hidden_states)?.gelu()?;
        let out = self.c_proj.forward(&hidden)?;
        if train && self.resid_pdrop > 0.0 {
            candle_nn::ops::dropout(&out, self.resid_pdrop)
        } else {
            Ok(out)
        }
    }
}

/// Layer norm built from primitive ops so gradients flow through it
/// (the fused `candle_nn` kernel has no backward pass).
struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    fn new(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(size, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(size, "bias", Init::Const(0.0))?;
        Ok(Self { weight, bias, eps })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mean = xs.mean_keepdim(D::Minus1)?;
        let centered = xs.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        normed.broadcast_mul(&self.weight)?.broadcast_add(&self.bias)
    }
}

/// Linear layer with the weight stored transposed (`[in, out]`).
pub struct Conv1D {
    weight: Tensor,
    bias: Tensor,
}

impl Conv1D {
    pub fn new(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(
            (in_dim, out_dim),
            "weight",
            Init::Randn { mean: 0.0, stdev: 0.02 },
        )?;
        let bias = vb.get_with_hints(out_dim, "bias", Init::Const(0.0))?;
        Ok(Self { weight, bias })
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.broadcast_matmul(&self.weight)?.broadcast_add(&self.bias)
    }
}
