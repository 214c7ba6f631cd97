//! Backbones: decoder-only and encoder-decoder transformers over embeddings.

use candle_core::{DType, Device, Tensor};
use candle_nn::{Embedding, Module, VarBuilder};

use slm_core::{SlmError, SlmResult};

use crate::config::LmConfig;
use crate::layers::{
    cross_attention_mask, positions_from_mask, self_attention_mask, LayerContext, RmsNorm,
    RotaryEmbedding, TransformerLayer,
};

#[derive(Debug, Clone)]
struct LmHead {
    weight: Tensor, // [vocab, hidden]
}

impl LmHead {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let (b, s, h) = x.dims3()?;
        let x2 = x.reshape((b * s, h))?;
        let w_t = self.weight.transpose(0, 1)?; // [hidden, vocab]
        let y = x2.matmul(&w_t)?;
        y.reshape((b, s, self.weight.dim(0)?))
    }
}

fn load_head(config: &LmConfig, embed_weight: &Tensor, vb: &VarBuilder) -> candle_core::Result<LmHead> {
    let weight = if config.tie_word_embeddings {
        embed_weight.clone()
    } else {
        vb.pp("lm_head")
            .get((config.vocab_size, config.hidden_size), "weight")?
    };
    Ok(LmHead { weight })
}

/// Validity mask rows from a `[batch, seq]` tensor of any integer dtype.
pub fn mask_rows(mask: &Tensor) -> SlmResult<Vec<Vec<u8>>> {
    Ok(mask.to_dtype(DType::U8)?.to_vec2::<u8>()?)
}

fn check_input(
    embeds: &Tensor,
    mask: &[Vec<u8>],
    hidden: usize,
    rope: &RotaryEmbedding,
) -> SlmResult<()> {
    let (b, t, h) = embeds.dims3()?;
    let capacity = rope.max_positions()?;
    if t > capacity {
        return Err(SlmError::batch_alignment(format!(
            "sequence of {t} positions exceeds model capacity {capacity}"
        )));
    }
    if h != hidden {
        return Err(SlmError::batch_alignment(format!(
            "input width {h} does not match model hidden size {hidden}"
        )));
    }
    if mask.len() != b || mask.iter().any(|r| r.len() != t) {
        return Err(SlmError::batch_alignment(format!(
            "mask shape does not match embeddings [{b}, {t}, _]"
        )));
    }
    Ok(())
}

/// Decoder-only language model.
#[derive(Debug, Clone)]
pub struct CausalLm {
    config: LmConfig,
    embed_tokens: Embedding,
    layers: Vec<TransformerLayer>,
    norm: RmsNorm,
    lm_head: LmHead,
    rope: RotaryEmbedding,
    device: Device,
}

impl CausalLm {
    /// Build from weights rooted at the HF `model.` prefix level
    /// (`vb` must point at the checkpoint root).
    pub fn new(config: LmConfig, vb: VarBuilder) -> SlmResult<Self> {
        config.validate()?;
        let device = vb.device().clone();
        let m = vb.pp("model");
        let embed_weight = m
            .pp("embed_tokens")
            .get((config.vocab_size, config.hidden_size), "weight")?;
        let embed_tokens = Embedding::new(embed_weight.clone(), config.hidden_size);

        // one rotary table shared by all layers
        let rope = RotaryEmbedding::new(
            config.head_dim,
            config.max_position_embeddings,
            config.rope_theta,
            &device,
        )?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            layers.push(TransformerLayer::new(&config, m.pp(format!("layers.{i}")), false)?);
        }
        let norm = RmsNorm::new(config.hidden_size, config.rms_norm_eps, m.pp("norm"))?;
        let lm_head = load_head(&config, &embed_weight, &vb)?;

        Ok(Self {
            config,
            embed_tokens,
            layers,
            norm,
            lm_head,
            rope,
            device,
        })
    }

    pub fn config(&self) -> &LmConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.embed_tokens.embeddings().dtype()
    }

    /// Token embeddings `[n, hidden]`.
    pub fn embed(&self, ids: &[u32]) -> SlmResult<Tensor> {
        let ids = Tensor::new(ids, &self.device)?;
        Ok(self.embed_tokens.forward(&ids)?)
    }

    /// Logits `[batch, seq, vocab]` for pre-computed embeddings.
    ///
    /// Padding positions (mask 0) are never attended to; rotary positions
    /// count valid positions only.
    pub fn forward_embeds(&self, embeds: &Tensor, mask: &[Vec<u8>]) -> SlmResult<Tensor> {
        check_input(embeds, mask, self.config.hidden_size, &self.rope)?;
        let positions = positions_from_mask(mask, &self.device)?;
        let self_mask = self_attention_mask(mask, true, &self.device)?;
        let ctx = LayerContext {
            rope: &self.rope,
            positions: &positions,
            self_mask: &self_mask,
            memory: None,
        };

        let mut hidden = embeds.to_dtype(self.dtype())?;
        for layer in &self.layers {
            hidden = layer.forward(&hidden, &ctx)?;
        }
        let hidden = self.norm.forward(&hidden)?;
        if slm_core::debug::enabled() {
            let mean = hidden.to_dtype(DType::F32)?.abs()?.mean_all()?.to_scalar::<f32>()?;
            eprintln!("DEBUG causal forward: dims={:?} mean|h|={mean:.4}", hidden.dims());
        }
        Ok(self.lm_head.forward(&hidden)?)
    }
}

/// Encoder-decoder language model.
///
/// The encoder reads the conditioning embeddings bidirectionally; the decoder
/// reads target ids causally and cross-attends to the encoder output.
#[derive(Debug, Clone)]
pub struct Seq2SeqLm {
    config: LmConfig,
    embed_tokens: Embedding,
    encoder: Vec<TransformerLayer>,
    encoder_norm: RmsNorm,
    decoder: Vec<TransformerLayer>,
    decoder_norm: RmsNorm,
    lm_head: LmHead,
    rope: RotaryEmbedding,
    device: Device,
}

impl Seq2SeqLm {
    pub fn new(config: LmConfig, vb: VarBuilder) -> SlmResult<Self> {
        config.validate()?;
        let device = vb.device().clone();
        let embed_weight = vb
            .pp("shared")
            .get((config.vocab_size, config.hidden_size), "weight")?;
        let embed_tokens = Embedding::new(embed_weight.clone(), config.hidden_size);
        let rope = RotaryEmbedding::new(
            config.head_dim,
            config.max_position_embeddings,
            config.rope_theta,
            &device,
        )?;

        let enc = vb.pp("encoder");
        let mut encoder = Vec::with_capacity(config.encoder_layers());
        for i in 0..config.encoder_layers() {
            encoder.push(TransformerLayer::new(&config, enc.pp(format!("layers.{i}")), false)?);
        }
        let encoder_norm = RmsNorm::new(config.hidden_size, config.rms_norm_eps, enc.pp("norm"))?;

        let dec = vb.pp("decoder");
        let mut decoder = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            decoder.push(TransformerLayer::new(&config, dec.pp(format!("layers.{i}")), true)?);
        }
        let decoder_norm = RmsNorm::new(config.hidden_size, config.rms_norm_eps, dec.pp("norm"))?;
        let lm_head = load_head(&config, &embed_weight, &vb)?;

        Ok(Self {
            config,
            embed_tokens,
            encoder,
            encoder_norm,
            decoder,
            decoder_norm,
            lm_head,
            rope,
            device,
        })
    }

    pub fn config(&self) -> &LmConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.embed_tokens.embeddings().dtype()
    }

    pub fn embed(&self, ids: &[u32]) -> SlmResult<Tensor> {
        let ids = Tensor::new(ids, &self.device)?;
        Ok(self.embed_tokens.forward(&ids)?)
    }

    /// Encoder output `[batch, m, hidden]`.
    pub fn encode(&self, embeds: &Tensor, mask: &[Vec<u8>]) -> SlmResult<Tensor> {
        check_input(embeds, mask, self.config.hidden_size, &self.rope)?;
        let positions = positions_from_mask(mask, &self.device)?;
        let self_mask = self_attention_mask(mask, false, &self.device)?;
        let ctx = LayerContext {
            rope: &self.rope,
            positions: &positions,
            self_mask: &self_mask,
            memory: None,
        };
        let mut hidden = embeds.to_dtype(self.dtype())?;
        for layer in &self.encoder {
            hidden = layer.forward(&hidden, &ctx)?;
        }
        Ok(self.encoder_norm.forward(&hidden)?)
    }

    /// Decoder logits `[batch, tgt, vocab]`.
    pub fn decode(
        &self,
        memory: &Tensor,
        memory_mask: &[Vec<u8>],
        decoder_ids: &Tensor,
        decoder_mask: &[Vec<u8>],
    ) -> SlmResult<Tensor> {
        let embeds = self.embed_tokens.forward(decoder_ids)?;
        check_input(&embeds, decoder_mask, self.config.hidden_size, &self.rope)?;
        let (b, tq, _) = embeds.dims3()?;
        if memory.dim(0)? != b || memory_mask.len() != b {
            return Err(SlmError::batch_alignment(format!(
                "decoder batch {b} does not match memory batch {}",
                memory.dim(0)?
            )));
        }

        let positions = positions_from_mask(decoder_mask, &self.device)?;
        let self_mask = self_attention_mask(decoder_mask, true, &self.device)?;
        let cross_mask = cross_attention_mask(memory_mask, tq, &self.device)?;
        let ctx = LayerContext {
            rope: &self.rope,
            positions: &positions,
            self_mask: &self_mask,
            memory: Some((memory, &cross_mask)),
        };
        let mut hidden = embeds;
        for layer in &self.decoder {
            hidden = layer.forward(&hidden, &ctx)?;
        }
        let hidden = self.decoder_norm.forward(&hidden)?;
        Ok(self.lm_head.forward(&hidden)?)
    }

    pub fn forward(
        &self,
        embeds: &Tensor,
        mask: &[Vec<u8>],
        decoder_ids: &Tensor,
        decoder_mask: &[Vec<u8>],
    ) -> SlmResult<Tensor> {
        let memory = self.encode(embeds, mask)?;
        self.decode(&memory, mask, decoder_ids, decoder_mask)
    }
}
