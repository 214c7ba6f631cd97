//! Transformer layers shared by the causal and seq2seq backbones.

use candle_core::{DType, Device, IndexOp, Result, Tensor, D};
use candle_nn::{linear_no_bias, Linear, Module, VarBuilder};

use crate::config::LmConfig;

/// Additive value for masked attention scores. Finite so that fully masked
/// rows (padding queries) stay NaN-free.
const MASK_VALUE: f32 = -1e9;

/// RMS Normalization layer.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    pub fn new(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints((size,), "weight", candle_nn::Init::Const(1.0))?;
        Ok(Self { weight, eps })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // statistics in f32, result in the input dtype
        let input_dtype = x.dtype();
        let x_f32 = x.to_dtype(DType::F32)?;
        let variance = x_f32.sqr()?.mean_keepdim(D::Minus1)?;
        let x_normed = x_f32.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        let x_normed = x_normed.to_dtype(input_dtype)?;
        x_normed.broadcast_mul(&self.weight.to_dtype(input_dtype)?)
    }
}

/// Rotary Position Embedding with per-row positions.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
}

impl RotaryEmbedding {
    pub fn new(head_dim: usize, max_seq_len: usize, theta: f64, device: &Device) -> Result<Self> {
        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| 1.0 / (theta.powf(i as f64 / head_dim as f64) as f32))
            .collect();
        let inv_freq = Tensor::new(inv_freq, device)?;
        let positions: Vec<f32> = (0..max_seq_len).map(|i| i as f32).collect();
        let positions = Tensor::new(positions, device)?.unsqueeze(1)?;

        let freqs = positions.matmul(&inv_freq.unsqueeze(0)?)?; // [seq, head_dim/2]
        // rotate_half layout: cos/sin cover the full head
        let emb = Tensor::cat(&[&freqs, &freqs], D::Minus1)?;
        Ok(Self {
            cos: emb.cos()?,
            sin: emb.sin()?,
        })
    }

    pub fn max_positions(&self) -> Result<usize> {
        self.cos.dim(0)
    }

    /// `x`: `[batch, heads, seq, head_dim]`, `positions`: `[batch, seq]` (u32).
    pub fn apply(&self, x: &Tensor, positions: &Tensor) -> Result<Tensor> {
        let (b, _, t, head_dim) = x.dims4()?;
        let x_dtype = x.dtype();
        let flat = positions.flatten_all()?;
        let gather = |table: &Tensor| -> Result<Tensor> {
            table
                .index_select(&flat, 0)?
                .reshape((b, 1, t, head_dim))?
                .to_dtype(x_dtype)
        };
        let cos = gather(&self.cos)?;
        let sin = gather(&self.sin)?;

        // rotate_half: cat(-x2, x1)
        let half = head_dim / 2;
        let x1 = x.i((.., .., .., 0..half))?;
        let x2 = x.i((.., .., .., half..head_dim))?;
        let rotated = Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)?;

        x.broadcast_mul(&cos)? + rotated.broadcast_mul(&sin)?
    }
}

/// Rotary positions from a validity mask: `cumsum(mask) - 1`, clamped at 0.
///
/// Left-padded rows therefore start counting at their first real position,
/// which makes the output independent of the padding side.
pub fn positions_from_mask(mask: &[Vec<u8>], device: &Device) -> Result<Tensor> {
    let b = mask.len();
    let t = mask.first().map(Vec::len).unwrap_or(0);
    let mut data = Vec::with_capacity(b * t);
    for row in mask {
        let mut seen = 0u32;
        for &m in row {
            seen += u32::from(m != 0);
            data.push(seen.saturating_sub(1));
        }
    }
    Tensor::from_vec(data, (b, t), device)
}

/// Additive self-attention mask `[batch, 1, t, t]`: position `i` may attend
/// to `j` iff `j` is valid and, when `causal`, `j <= i`.
pub fn self_attention_mask(mask: &[Vec<u8>], causal: bool, device: &Device) -> Result<Tensor> {
    let b = mask.len();
    let t = mask.first().map(Vec::len).unwrap_or(0);
    let mut data = Vec::with_capacity(b * t * t);
    for row in mask {
        for i in 0..t {
            for (j, &valid) in row.iter().enumerate() {
                let allowed = valid != 0 && (!causal || j <= i);
                data.push(if allowed { 0.0 } else { MASK_VALUE });
            }
        }
    }
    Tensor::from_vec(data, (b, 1, t, t), device)
}

/// Additive cross-attention mask `[batch, 1, tq, tm]` from the memory mask.
pub fn cross_attention_mask(memory_mask: &[Vec<u8>], tq: usize, device: &Device) -> Result<Tensor> {
    let b = memory_mask.len();
    let tm = memory_mask.first().map(Vec::len).unwrap_or(0);
    let row_values: Vec<f32> = memory_mask
        .iter()
        .flat_map(|row| row.iter().map(|&m| if m != 0 { 0.0 } else { MASK_VALUE }))
        .collect();
    Tensor::from_vec(row_values, (b, 1, 1, tm), device)?.broadcast_as((b, 1, tq, tm))?.contiguous()
}

/// Grouped Query Attention layer.
///
/// Self-attention applies rotary positions; cross-attention (queries from the
/// decoder, keys/values from the encoder memory) does not.
#[derive(Debug, Clone)]
pub struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    q_norm: Option<RmsNorm>,
    k_norm: Option<RmsNorm>,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl Attention {
    pub fn new(config: &LmConfig, vb: VarBuilder) -> Result<Self> {
        let hidden_size = config.hidden_size;
        let num_heads = config.num_attention_heads;
        let num_kv_heads = config.num_key_value_heads;
        let head_dim = config.head_dim;

        let q_proj = linear_no_bias(hidden_size, num_heads * head_dim, vb.pp("q_proj"))?;
        let k_proj = linear_no_bias(hidden_size, num_kv_heads * head_dim, vb.pp("k_proj"))?;
        let v_proj = linear_no_bias(hidden_size, num_kv_heads * head_dim, vb.pp("v_proj"))?;
        let o_proj = linear_no_bias(num_heads * head_dim, hidden_size, vb.pp("o_proj"))?;

        let (q_norm, k_norm) = if config.qk_norm {
            (
                Some(RmsNorm::new(head_dim, config.rms_norm_eps, vb.pp("q_norm"))?),
                Some(RmsNorm::new(head_dim, config.rms_norm_eps, vb.pp("k_norm"))?),
            )
        } else {
            (None, None)
        };

        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            q_norm,
            k_norm,
            num_heads,
            num_kv_heads,
            head_dim,
        })
    }

    fn heads(&self, x: &Tensor, n: usize, norm: Option<&RmsNorm>) -> Result<Tensor> {
        let (b, t, _) = x.dims3()?;
        let x = x.reshape((b, t, n, self.head_dim))?;
        let x = match norm {
            Some(norm) => norm.forward(&x)?,
            None => x,
        };
        // [batch, heads, seq, head_dim]
        x.transpose(1, 2)?.contiguous()
    }

    /// * `x`: queries source `[batch, tq, hidden]`.
    /// * `kv`: keys/values source; `None` for self-attention.
    /// * `rope`: rotary table and `[batch, tq]` positions (self-attention only).
    /// * `mask`: additive `[batch, 1, tq, tk]`.
    pub fn forward(
        &self,
        x: &Tensor,
        kv: Option<&Tensor>,
        rope: Option<(&RotaryEmbedding, &Tensor)>,
        mask: &Tensor,
    ) -> Result<Tensor> {
        let (b, tq, _) = x.dims3()?;
        let source = kv.unwrap_or(x);

        let q = self.heads(&self.q_proj.forward(x)?, self.num_heads, self.q_norm.as_ref())?;
        let k = self.heads(
            &self.k_proj.forward(source)?,
            self.num_kv_heads,
            self.k_norm.as_ref(),
        )?;
        let v = self.heads(&self.v_proj.forward(source)?, self.num_kv_heads, None)?;

        let (q, k) = match rope {
            Some((rope, positions)) => (rope.apply(&q, positions)?, rope.apply(&k, positions)?),
            None => (q, k),
        };

        // GQA: [kv0, kv0, kv1, kv1, ...]
        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(&k, n_rep)?;
        let v = repeat_kv(&v, n_rep)?;

        let scale = (self.head_dim as f64).sqrt();
        let attn = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? / scale)?;
        // softmax in f32
        let attn_f32 = attn.to_dtype(DType::F32)?.broadcast_add(mask)?;
        let attn = candle_nn::ops::softmax_last_dim(&attn_f32)?.to_dtype(v.dtype())?;
        let out = attn.matmul(&v)?;

        let out = out.transpose(1, 2)?.contiguous()?;
        let out = out.reshape((b, tq, self.num_heads * self.head_dim))?;
        self.o_proj.forward(&out)
    }
}

fn repeat_kv(x: &Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x.clone());
    }
    let (b, kv, s, d) = x.dims4()?;
    x.unsqueeze(2)?
        .broadcast_as((b, kv, n_rep, s, d))?
        .reshape((b, kv * n_rep, s, d))
}

/// SwiGLU MLP layer.
#[derive(Debug, Clone)]
pub struct Mlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl Mlp {
    pub fn new(config: &LmConfig, vb: VarBuilder) -> Result<Self> {
        let (h, i) = (config.hidden_size, config.intermediate_size);
        Ok(Self {
            gate_proj: linear_no_bias(h, i, vb.pp("gate_proj"))?,
            up_proj: linear_no_bias(h, i, vb.pp("up_proj"))?,
            down_proj: linear_no_bias(i, h, vb.pp("down_proj"))?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate = self.gate_proj.forward(x)?.silu()?;
        let up = self.up_proj.forward(x)?;
        self.down_proj.forward(&(gate * up)?)
    }
}

/// Pre-norm transformer block, optionally with cross-attention.
#[derive(Debug, Clone)]
pub struct TransformerLayer {
    self_attn: Attention,
    cross_attn: Option<(RmsNorm, Attention)>,
    mlp: Mlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

/// Per-call attention inputs shared by every layer.
pub struct LayerContext<'a> {
    pub rope: &'a RotaryEmbedding,
    pub positions: &'a Tensor,
    pub self_mask: &'a Tensor,
    /// Encoder memory and its additive mask.
    pub memory: Option<(&'a Tensor, &'a Tensor)>,
}

impl TransformerLayer {
    pub fn new(config: &LmConfig, vb: VarBuilder, with_cross_attention: bool) -> Result<Self> {
        let cross_attn = if with_cross_attention {
            Some((
                RmsNorm::new(
                    config.hidden_size,
                    config.rms_norm_eps,
                    vb.pp("cross_attention_layernorm"),
                )?,
                Attention::new(config, vb.pp("cross_attn"))?,
            ))
        } else {
            None
        };
        Ok(Self {
            self_attn: Attention::new(config, vb.pp("self_attn"))?,
            cross_attn,
            mlp: Mlp::new(config, vb.pp("mlp"))?,
            input_layernorm: RmsNorm::new(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("input_layernorm"),
            )?,
            post_attention_layernorm: RmsNorm::new(
                config.hidden_size,
                config.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
        })
    }

    pub fn forward(&self, x: &Tensor, ctx: &LayerContext<'_>) -> Result<Tensor> {
        let residual = x;
        let h = self.input_layernorm.forward(x)?;
        let h = self
            .self_attn
            .forward(&h, None, Some((ctx.rope, ctx.positions)), ctx.self_mask)?;
        let mut x = (residual + h)?;

        if let (Some((norm, attn)), Some((memory, memory_mask))) = (&self.cross_attn, ctx.memory) {
            let h = attn.forward(&norm.forward(&x)?, Some(memory), None, memory_mask)?;
            x = (x + h)?;
        }

        let residual = &x;
        let h = self.mlp.forward(&self.post_attention_layernorm.forward(&x)?)?;
        residual + h
    }
}
