//! Trainable virtual tokens prepended to every input.

use candle_core::{Device, Result, Tensor};
use candle_nn::{embedding, linear, Embedding, Linear, Module, VarBuilder};

use crate::config::PrefixTuningConfig;

/// Reparameterised prefix: `embedding -> Linear(h, mid) -> tanh -> Linear(mid, h)`.
#[derive(Debug, Clone)]
pub struct PrefixEncoder {
    embedding: Embedding,
    down: Linear,
    up: Linear,
    num_virtual_tokens: usize,
    device: Device,
}

impl PrefixEncoder {
    /// `vb` points at the `prefix_encoder` weights.
    pub fn new(cfg: &PrefixTuningConfig, hidden_size: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            embedding: embedding(cfg.num_virtual_tokens, hidden_size, vb.pp("embedding"))?,
            down: linear(hidden_size, cfg.mid_dim, vb.pp("transform.0"))?,
            up: linear(cfg.mid_dim, hidden_size, vb.pp("transform.2"))?,
            num_virtual_tokens: cfg.num_virtual_tokens,
            device: vb.device().clone(),
        })
    }

    pub fn num_virtual_tokens(&self) -> usize {
        self.num_virtual_tokens
    }

    /// Virtual token embeddings `[num_virtual_tokens, hidden]`.
    pub fn virtual_embeddings(&self) -> Result<Tensor> {
        let ids = Tensor::arange(0u32, self.num_virtual_tokens as u32, &self.device)?;
        let x = self.embedding.forward(&ids)?;
        let x = self.down.forward(&x)?.tanh()?;
        self.up.forward(&x)
    }

    /// Prepend the virtual tokens to `[batch, seq, hidden]` embeddings and
    /// extend the mask rows with ones.
    pub fn prepend(&self, embeds: &Tensor, mask: &[Vec<u8>]) -> Result<(Tensor, Vec<Vec<u8>>)> {
        let (b, _, h) = embeds.dims3()?;
        let prefix = self
            .virtual_embeddings()?
            .to_dtype(embeds.dtype())?
            .unsqueeze(0)?
            .broadcast_as((b, self.num_virtual_tokens, h))?
            .contiguous()?;
        let embeds = Tensor::cat(&[&prefix, embeds], 1)?;
        let mask = mask
            .iter()
            .map(|row| {
                let mut r = vec![1u8; self.num_virtual_tokens];
                r.extend_from_slice(row);
                r
            })
            .collect();
        Ok((embeds, mask))
    }
}
