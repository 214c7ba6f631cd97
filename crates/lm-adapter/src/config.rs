//! Configuration for the language model backbone and its adapter.

use std::path::{Path, PathBuf};

use candle_core::DType;
use serde::{Deserialize, Serialize};

use slm_core::{DecoderKind, PaddingSide, SlmError, SlmResult};

/// Backbone hyper-parameters (HF `config.json` names).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LmConfig {
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    /// Number of key-value heads (for GQA).
    pub num_key_value_heads: usize,
    pub intermediate_size: usize,
    pub vocab_size: usize,
    pub max_position_embeddings: usize,
    pub rms_norm_eps: f64,
    pub rope_theta: f64,
    pub head_dim: usize,
    /// Per-head RMS norm on queries and keys.
    pub qk_norm: bool,
    /// LM head shares the input embedding matrix.
    pub tie_word_embeddings: bool,
    /// Encoder depth for seq2seq backbones; defaults to `num_hidden_layers`.
    pub num_encoder_layers: Option<usize>,
    pub pad_token_id: Option<u32>,
    pub bos_token_id: Option<u32>,
    pub eos_token_id: Option<u32>,
    /// First decoder input of seq2seq backbones.
    pub decoder_start_token_id: Option<u32>,
}

impl Default for LmConfig {
    fn default() -> Self {
        Self::qwen3_0_6b()
    }
}

fn get_usize(v: &serde_json::Value, key: &str, default: usize) -> usize {
    v.get(key).and_then(|x| x.as_u64()).map(|x| x as usize).unwrap_or(default)
}

fn get_f64(v: &serde_json::Value, key: &str, default: f64) -> f64 {
    v.get(key).and_then(|x| x.as_f64()).unwrap_or(default)
}

/// Token ids may be a number or a list (first entry wins).
fn get_token(v: &serde_json::Value, key: &str) -> Option<u32> {
    let x = v.get(key)?;
    x.as_u64()
        .or_else(|| x.as_array()?.first()?.as_u64())
        .map(|id| id as u32)
}

impl LmConfig {
    /// Qwen3-0.6B sized backbone.
    pub fn qwen3_0_6b() -> Self {
        Self {
            hidden_size: 1024,
            num_hidden_layers: 28,
            num_attention_heads: 16,
            num_key_value_heads: 8,
            intermediate_size: 3072,
            vocab_size: 151936,
            max_position_embeddings: 40960,
            rms_norm_eps: 1e-6,
            rope_theta: 1_000_000.0,
            head_dim: 128,
            qk_norm: true,
            tie_word_embeddings: true,
            num_encoder_layers: None,
            pad_token_id: None,
            bos_token_id: None,
            eos_token_id: Some(151645),
            decoder_start_token_id: None,
        }
    }

    /// Load from a HuggingFace `config.json`.
    ///
    /// Multimodal checkpoints nest the language model under `text_config`;
    /// that section is used when present. Missing keys fall back to
    /// [`LmConfig::qwen3_0_6b`].
    pub fn from_hf_config(path: impl AsRef<Path>) -> SlmResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            SlmError::Config(format!("failed to read {}: {e}", path.as_ref().display()))
        })?;
        let value: serde_json::Value = serde_json::from_str(&content)?;
        Ok(Self::from_hf_value(&value))
    }

    pub fn from_hf_value(value: &serde_json::Value) -> Self {
        let v = value.get("text_config").unwrap_or(value);
        let d = Self::qwen3_0_6b();

        let hidden_size = get_usize(v, "hidden_size", d.hidden_size);
        let num_attention_heads = get_usize(v, "num_attention_heads", d.num_attention_heads);
        let head_dim = v
            .get("head_dim")
            .and_then(|x| x.as_u64())
            .map(|x| x as usize)
            .unwrap_or(hidden_size / num_attention_heads.max(1));

        Self {
            hidden_size,
            num_hidden_layers: get_usize(v, "num_hidden_layers", d.num_hidden_layers),
            num_attention_heads,
            num_key_value_heads: get_usize(v, "num_key_value_heads", num_attention_heads),
            intermediate_size: get_usize(v, "intermediate_size", d.intermediate_size),
            vocab_size: get_usize(v, "vocab_size", d.vocab_size),
            max_position_embeddings: get_usize(
                v,
                "max_position_embeddings",
                d.max_position_embeddings,
            ),
            rms_norm_eps: get_f64(v, "rms_norm_eps", d.rms_norm_eps),
            rope_theta: get_f64(v, "rope_theta", d.rope_theta),
            head_dim,
            qk_norm: v
                .get("model_type")
                .and_then(|x| x.as_str())
                .map(|t| t.starts_with("qwen3"))
                .unwrap_or(d.qk_norm),
            tie_word_embeddings: v
                .get("tie_word_embeddings")
                .or_else(|| value.get("tie_word_embeddings"))
                .and_then(|x| x.as_bool())
                .unwrap_or(d.tie_word_embeddings),
            num_encoder_layers: v
                .get("num_encoder_layers")
                .and_then(|x| x.as_u64())
                .map(|x| x as usize),
            pad_token_id: get_token(v, "pad_token_id").or_else(|| get_token(value, "pad_token_id")),
            bos_token_id: get_token(v, "bos_token_id").or_else(|| get_token(value, "bos_token_id")),
            eos_token_id: get_token(v, "eos_token_id").or_else(|| get_token(value, "eos_token_id")),
            decoder_start_token_id: get_token(value, "decoder_start_token_id"),
        }
    }

    pub fn encoder_layers(&self) -> usize {
        self.num_encoder_layers.unwrap_or(self.num_hidden_layers)
    }

    pub fn validate(&self) -> SlmResult<()> {
        if self.num_attention_heads == 0 || self.num_key_value_heads == 0 {
            return Err(SlmError::Config("attention head count must be positive".into()));
        }
        if self.num_attention_heads % self.num_key_value_heads != 0 {
            return Err(SlmError::Config(format!(
                "num_attention_heads ({}) must be a multiple of num_key_value_heads ({})",
                self.num_attention_heads, self.num_key_value_heads
            )));
        }
        if self.head_dim % 2 != 0 {
            return Err(SlmError::Config(format!(
                "head_dim must be even for rotary embeddings, got {}",
                self.head_dim
            )));
        }
        Ok(())
    }
}

/// Weight precision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightDType {
    #[default]
    F32,
    F16,
    Bf16,
}

impl WeightDType {
    pub fn as_dtype(&self) -> DType {
        match self {
            Self::F32 => DType::F32,
            Self::F16 => DType::F16,
            Self::Bf16 => DType::BF16,
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "f32" | "float32" | "fp32" => Some(Self::F32),
            "f16" | "float16" | "fp16" | "half" => Some(Self::F16),
            "bf16" | "bfloat16" => Some(Self::Bf16),
            _ => None,
        }
    }
}

/// Prefix-tuning parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefixTuningConfig {
    pub num_virtual_tokens: usize,
    /// Hidden width of the reparameterisation MLP.
    pub mid_dim: usize,
    /// Trained prefix weights; when absent they are read from the model files.
    pub weights: Option<PathBuf>,
}

impl Default for PrefixTuningConfig {
    fn default() -> Self {
        Self {
            num_virtual_tokens: 10,
            mid_dim: 2048,
            weights: None,
        }
    }
}

/// Everything [`crate::ModelAdapter::configure`] records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Directory with `config.json`, safetensors weights and `tokenizer.json`.
    pub model_dir: PathBuf,
    #[serde(default)]
    pub decoder_kind: DecoderKind,
    /// Default prompt text placed before the features.
    #[serde(default)]
    pub prefix: String,
    /// Default prompt text placed after the features.
    #[serde(default)]
    pub postfix: String,
    /// Overrides the tokenizer's padding side. Ignored by prefix tuning,
    /// which always pads on the right.
    #[serde(default)]
    pub padding_side: Option<PaddingSide>,
    #[serde(default)]
    pub dtype: WeightDType,
    #[serde(default)]
    pub prefix_tuning: Option<PrefixTuningConfig>,
    /// Width of the external feature encoder; a linear projector is added
    /// when it differs from the model hidden size.
    #[serde(default)]
    pub encoder_output_size: Option<usize>,
}

impl AdapterConfig {
    pub fn new(model_dir: impl Into<PathBuf>, decoder_kind: DecoderKind) -> Self {
        Self {
            model_dir: model_dir.into(),
            decoder_kind,
            prefix: String::new(),
            postfix: String::new(),
            padding_side: None,
            dtype: WeightDType::default(),
            prefix_tuning: None,
            encoder_output_size: None,
        }
    }

    pub fn with_prompt(mut self, prefix: impl Into<String>, postfix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self.postfix = postfix.into();
        self
    }

    pub fn with_padding_side(mut self, side: PaddingSide) -> Self {
        self.padding_side = Some(side);
        self
    }

    pub fn with_dtype(mut self, dtype: WeightDType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn with_prefix_tuning(mut self, cfg: PrefixTuningConfig) -> Self {
        self.prefix_tuning = Some(cfg);
        self
    }

    pub fn with_encoder_output_size(mut self, size: usize) -> Self {
        self.encoder_output_size = Some(size);
        self
    }

    pub fn from_json_str(json: &str) -> SlmResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> SlmResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&content)
    }

    /// Prefix-tuning parameters, defaulted for the prefix-tuned kind.
    pub fn prefix_tuning_or_default(&self) -> PrefixTuningConfig {
        self.prefix_tuning.clone().unwrap_or_default()
    }

    /// Reject combinations that cannot load.
    pub fn validate(&self) -> SlmResult<()> {
        if self.prefix_tuning.is_some() && self.decoder_kind != DecoderKind::PrefixTuned {
            return Err(SlmError::Config(format!(
                "prefix_tuning is set but decoder_kind is {}",
                self.decoder_kind
            )));
        }
        if self.decoder_kind == DecoderKind::PrefixTuned {
            let p = self.prefix_tuning_or_default();
            if p.num_virtual_tokens == 0 || p.mid_dim == 0 {
                return Err(SlmError::Config(
                    "prefix tuning needs num_virtual_tokens > 0 and mid_dim > 0".into(),
                ));
            }
        }
        if self.encoder_output_size == Some(0) {
            return Err(SlmError::Config("encoder_output_size must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hf_config_with_text_section() {
        let v = json!({
            "decoder_start_token_id": 0,
            "text_config": {
                "model_type": "qwen3",
                "hidden_size": 64,
                "num_hidden_layers": 2,
                "num_attention_heads": 4,
                "num_key_value_heads": 2,
                "vocab_size": 100,
                "eos_token_id": [7, 8]
            }
        });
        let cfg = LmConfig::from_hf_value(&v);
        assert_eq!(cfg.hidden_size, 64);
        assert_eq!(cfg.head_dim, 16);
        assert_eq!(cfg.num_key_value_heads, 2);
        assert_eq!(cfg.eos_token_id, Some(7));
        assert_eq!(cfg.decoder_start_token_id, Some(0));
        assert!(cfg.qk_norm);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_gqa_divisibility() {
        let mut cfg = LmConfig::qwen3_0_6b();
        cfg.num_key_value_heads = 5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_adapter_config_json() {
        let cfg = AdapterConfig::from_json_str(
            r#"{"model_dir": "/m", "decoder_kind": "prefix-tuned", "dtype": "bf16",
                "prefix_tuning": {"num_virtual_tokens": 4}}"#,
        )
        .unwrap();
        assert_eq!(cfg.decoder_kind, DecoderKind::PrefixTuned);
        assert_eq!(cfg.dtype, WeightDType::Bf16);
        assert_eq!(cfg.prefix_tuning_or_default().mid_dim, 2048);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_prefix_tuning_needs_kind() {
        let cfg = AdapterConfig::new("/m", DecoderKind::Causal)
            .with_prefix_tuning(PrefixTuningConfig::default());
        assert!(cfg.validate().is_err());
    }
}
