//! Адаптер генеративной модели: явная двухфазная инициализация и диспетчеризация
//! по стратегии декодирования.
//!
//! `configure()` только запоминает параметры, `load()` один раз строит веса.
//! Любой вызов модели до `load()` возвращает [`SlmError::NotReady`].

use std::path::Path;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use tracing::{debug, info};

use constrained_decoder::{constrained_beam_search, AnswerTrie};
use slm_core::model_files::resolve_safetensors_files;
use slm_core::{
    DecoderKind, GenerativeModel, ModelInput, PaddingSide, SlmError, SlmResult, TokenEmbedder,
};

use crate::config::{AdapterConfig, LmConfig};
use crate::model::{mask_rows, CausalLm, Seq2SeqLm};
use crate::prefix_tuning::PrefixEncoder;
use crate::projector::FeatureProjector;
use crate::tokenizer::HfTokenizer;

/// Состояние адаптера.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    /// Параметры записаны, веса не загружены.
    Configured,
    /// Модель готова к вызовам.
    Ready,
}

enum Backend {
    Causal(CausalLm),
    PrefixTuned { lm: CausalLm, prefix: PrefixEncoder },
    Seq2Seq(Seq2SeqLm),
}

struct Loaded {
    backend: Backend,
    lm_config: LmConfig,
    tokenizer: Option<HfTokenizer>,
    projector: FeatureProjector,
    padding_side: PaddingSide,
    pad_token_id: u32,
    eos_token_id: Option<u32>,
    decoder_start_token_id: u32,
    device: Device,
}

/// Генеративная модель за контрактом [`GenerativeModel`].
///
/// Экземпляр принадлежит одному воркеру; внутренних блокировок нет.
pub struct ModelAdapter {
    config: AdapterConfig,
    loaded: Option<Loaded>,
}

impl ModelAdapter {
    /// Фаза 1: проверить и запомнить параметры. Файлы не читаются.
    pub fn configure(config: AdapterConfig) -> SlmResult<Self> {
        config.validate()?;
        debug!(
            "ModelAdapter: сконфигурирован {} ({:?})",
            config.decoder_kind, config.model_dir
        );
        Ok(Self {
            config,
            loaded: None,
        })
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub fn state(&self) -> AdapterState {
        if self.loaded.is_some() {
            AdapterState::Ready
        } else {
            AdapterState::Configured
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state() == AdapterState::Ready
    }

    fn ready(&self) -> SlmResult<&Loaded> {
        self.loaded.as_ref().ok_or(SlmError::NotReady)
    }

    /// Фаза 2: загрузить веса и токенайзер из `model_dir`.
    ///
    /// Ожидаемые файлы: `config.json`, `model.safetensors` (или шарды с
    /// `model.safetensors.index.json`), `tokenizer.json`.
    pub fn load(&mut self, device: &Device) -> SlmResult<()> {
        self.ensure_not_loaded()?;
        let model_dir = self.config.model_dir.clone();
        info!(
            "ModelAdapter: загрузка {} из {:?} (dtype={:?})",
            self.config.decoder_kind, model_dir, self.config.dtype
        );

        let lm_config = LmConfig::from_hf_config(model_dir.join("config.json"))?;
        let files = resolve_safetensors_files(&model_dir)?;
        let dtype = self.config.dtype.as_dtype();
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(files.as_slice(), dtype, device)? };

        let tokenizer_path = model_dir.join("tokenizer.json");
        if !tokenizer_path.exists() {
            return Err(SlmError::Config(format!(
                "не найден tokenizer.json в {}",
                model_dir.display()
            )));
        }
        let tokenizer = HfTokenizer::from_file(&tokenizer_path)?;

        let prefix_vb = match self.config.prefix_tuning.as_ref().and_then(|p| p.weights.clone()) {
            Some(path) => Some(Self::prefix_weights(&path, dtype, device)?),
            None => None,
        };

        self.build(lm_config, vb, prefix_vb, Some(tokenizer))
    }

    /// Фаза 2 из уже собранных весов (например, `VarMap` в тестах).
    pub fn load_with(
        &mut self,
        lm_config: LmConfig,
        vb: VarBuilder,
        tokenizer: Option<HfTokenizer>,
    ) -> SlmResult<()> {
        self.ensure_not_loaded()?;
        self.build(lm_config, vb, None, tokenizer)
    }

    fn ensure_not_loaded(&self) -> SlmResult<()> {
        if self.loaded.is_some() {
            return Err(SlmError::Config("модель уже загружена".into()));
        }
        Ok(())
    }

    fn prefix_weights(path: &Path, dtype: DType, device: &Device) -> SlmResult<VarBuilder<'static>> {
        if !path.exists() {
            return Err(SlmError::Config(format!(
                "файл весов префикса не найден: {}",
                path.display()
            )));
        }
        Ok(unsafe { VarBuilder::from_mmaped_safetensors(&[path], dtype, device)? })
    }

    fn build(
        &mut self,
        lm_config: LmConfig,
        vb: VarBuilder,
        prefix_vb: Option<VarBuilder>,
        tokenizer: Option<HfTokenizer>,
    ) -> SlmResult<()> {
        if let Some(tok) = tokenizer.as_ref() {
            if tok.vocab_size() > lm_config.vocab_size {
                return Err(SlmError::Config(format!(
                    "словарь токенайзера ({}) больше таблицы эмбеддингов модели ({})",
                    tok.vocab_size(),
                    lm_config.vocab_size
                )));
            }
        }

        let device = vb.device().clone();
        let hidden = lm_config.hidden_size;

        let backend = match self.config.decoder_kind {
            DecoderKind::Causal => Backend::Causal(CausalLm::new(lm_config.clone(), vb.clone())?),
            DecoderKind::PrefixTuned => {
                let cfg = self.config.prefix_tuning_or_default();
                let pvb = prefix_vb.unwrap_or_else(|| vb.clone());
                let prefix = PrefixEncoder::new(&cfg, hidden, pvb.pp("prefix_encoder"))?;
                Backend::PrefixTuned {
                    lm: CausalLm::new(lm_config.clone(), vb.clone())?,
                    prefix,
                }
            }
            DecoderKind::Seq2Seq => Backend::Seq2Seq(Seq2SeqLm::new(lm_config.clone(), vb.clone())?),
        };

        let projector = match self.config.encoder_output_size {
            Some(dim) => FeatureProjector::new(dim, hidden, vb.pp("projector"))?,
            None => FeatureProjector::identity(hidden),
        };

        let padding_side = self.resolve_padding_side(tokenizer.as_ref());
        let eos_token_id = lm_config
            .eos_token_id
            .or_else(|| tokenizer.as_ref().and_then(HfTokenizer::eos_token_id));
        let pad_token_id = lm_config
            .pad_token_id
            .or_else(|| tokenizer.as_ref().and_then(HfTokenizer::pad_token_id))
            .or(eos_token_id)
            .unwrap_or(0);
        let decoder_start_token_id = lm_config.decoder_start_token_id.unwrap_or(pad_token_id);

        info!(
            "ModelAdapter: готово, {} слоев, hidden={}, vocab={}, padding={}, pad_id={}",
            lm_config.num_hidden_layers,
            hidden,
            lm_config.vocab_size,
            padding_side,
            pad_token_id
        );

        self.loaded = Some(Loaded {
            backend,
            lm_config,
            tokenizer,
            projector,
            padding_side,
            pad_token_id,
            eos_token_id,
            decoder_start_token_id,
            device,
        });
        Ok(())
    }

    /// Prefix-tuning всегда паддит справа; иначе явная настройка, затем токенайзер.
    fn resolve_padding_side(&self, tokenizer: Option<&HfTokenizer>) -> PaddingSide {
        if self.config.decoder_kind == DecoderKind::PrefixTuned {
            return PaddingSide::Right;
        }
        self.config
            .padding_side
            .or_else(|| tokenizer.and_then(HfTokenizer::padding_side))
            .unwrap_or_default()
    }

    pub fn lm_config(&self) -> SlmResult<&LmConfig> {
        Ok(&self.ready()?.lm_config)
    }

    pub fn device(&self) -> SlmResult<&Device> {
        Ok(&self.ready()?.device)
    }

    /// Токенайзер модели (тот же словарь, что и таблица эмбеддингов).
    pub fn tokenizer(&self) -> SlmResult<&HfTokenizer> {
        self.ready()?
            .tokenizer
            .as_ref()
            .ok_or_else(|| SlmError::Config("адаптер загружен без токенайзера".into()))
    }

    /// Проектор признаков внешнего энкодера.
    pub fn feature_encoder(&self) -> SlmResult<&FeatureProjector> {
        Ok(&self.ready()?.projector)
    }

    /// Первый вход декодера seq2seq-модели.
    pub fn decoder_start_token_id(&self) -> SlmResult<u32> {
        Ok(self.ready()?.decoder_start_token_id)
    }

    /// Логиты decoder-only ветки; для prefix-tuning позиции виртуальных
    /// токенов срезаются с выхода.
    fn causal_logits(loaded: &Loaded, embeds: &Tensor, mask: &[Vec<u8>]) -> SlmResult<Tensor> {
        match &loaded.backend {
            Backend::Causal(lm) => lm.forward_embeds(embeds, mask),
            Backend::PrefixTuned { lm, prefix } => {
                let t = embeds.dim(1)?;
                let (x, m) = prefix.prepend(embeds, mask)?;
                let logits = lm.forward_embeds(&x, &m)?;
                Ok(logits.narrow(1, prefix.num_virtual_tokens(), t)?)
            }
            Backend::Seq2Seq(_) => Err(SlmError::Config(
                "seq2seq модель не принимает склеенную последовательность".into(),
            )),
        }
    }

    fn step_rows(logits: &Tensor, position: usize) -> SlmResult<Vec<Vec<f32>>> {
        Ok(logits
            .narrow(1, position, 1)?
            .squeeze(1)?
            .to_dtype(DType::F32)?
            .to_vec2::<f32>()?)
    }
}

impl TokenEmbedder for ModelAdapter {
    /// 0 до `load()`.
    fn hidden_size(&self) -> usize {
        self.loaded.as_ref().map(|l| l.lm_config.hidden_size).unwrap_or(0)
    }

    fn embed_ids(&self, ids: &[u32]) -> SlmResult<Tensor> {
        match &self.ready()?.backend {
            Backend::Causal(lm) | Backend::PrefixTuned { lm, .. } => lm.embed(ids),
            Backend::Seq2Seq(lm) => lm.embed(ids),
        }
    }
}

impl GenerativeModel for ModelAdapter {
    fn decoder_kind(&self) -> DecoderKind {
        self.config.decoder_kind
    }

    fn padding_side(&self) -> PaddingSide {
        match &self.loaded {
            Some(l) => l.padding_side,
            None => self.resolve_padding_side(None),
        }
    }

    fn pad_token_id(&self) -> u32 {
        self.loaded.as_ref().map(|l| l.pad_token_id).unwrap_or(0)
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.loaded.as_ref().and_then(|l| l.eos_token_id)
    }

    fn forward(&self, input: &ModelInput) -> SlmResult<Tensor> {
        let loaded = self.ready()?;
        let mask = mask_rows(&input.mask)?;
        match &loaded.backend {
            Backend::Seq2Seq(lm) => {
                let ids = input.decoder_input_ids.as_ref().ok_or_else(|| {
                    SlmError::Config("seq2seq forward требует decoder_input_ids".into())
                })?;
                let dec_mask = match &input.decoder_mask {
                    Some(m) => mask_rows(m)?,
                    None => {
                        let (b, t) = ids.dims2()?;
                        vec![vec![1u8; t]; b]
                    }
                };
                lm.forward(&input.embeds, &mask, ids, &dec_mask)
            }
            _ => Self::causal_logits(loaded, &input.embeds, &mask),
        }
    }

    fn constrained_generate(
        &self,
        embeds: &Tensor,
        mask: &Tensor,
        allowed: &[Vec<u32>],
        max_new_tokens: usize,
    ) -> SlmResult<Vec<u32>> {
        let loaded = self.ready()?;
        let (b, seq, _) = embeds.dims3()?;
        if b != 1 {
            return Err(SlmError::batch_alignment(format!(
                "constrained generation takes one example, got a batch of {b}"
            )));
        }
        let cond_mask = mask_rows(mask)?.into_iter().next().unwrap_or_default();
        if cond_mask.len() != seq {
            return Err(SlmError::batch_alignment(format!(
                "mask has {} positions, conditioning has {seq}",
                cond_mask.len()
            )));
        }
        let last_valid = cond_mask
            .iter()
            .rposition(|&m| m != 0)
            .ok_or_else(|| SlmError::batch_alignment("conditioning has no valid positions"))?;

        let trie = AnswerTrie::from_sequences(allowed);
        let device = &loaded.device;

        let outcome = match &loaded.backend {
            Backend::Seq2Seq(lm) => {
                let memory = lm.encode(embeds, std::slice::from_ref(&cond_mask))?;
                let start = loaded.decoder_start_token_id;
                constrained_beam_search(&trie, allowed.len(), max_new_tokens, |prefixes| {
                    let n = prefixes.len();
                    let k = prefixes.first().map(Vec::len).unwrap_or(0);
                    let ids: Vec<u32> = prefixes
                        .iter()
                        .flat_map(|p| std::iter::once(start).chain(p.iter().copied()))
                        .collect();
                    let ids = Tensor::from_vec(ids, (n, k + 1), device)?;
                    let memory = memory.repeat((n, 1, 1))?;
                    let memory_mask = vec![cond_mask.clone(); n];
                    let logits = lm.decode(&memory, &memory_mask, &ids, &vec![vec![1u8; k + 1]; n])?;
                    Self::step_rows(&logits, k)
                })?
            }
            _ => {
                let cond = embeds.clone();
                constrained_beam_search(&trie, allowed.len(), max_new_tokens, |prefixes| {
                    let n = prefixes.len();
                    let k = prefixes.first().map(Vec::len).unwrap_or(0);
                    let base = cond.repeat((n, 1, 1))?;
                    let x = if k == 0 {
                        base
                    } else {
                        let rows = prefixes
                            .iter()
                            .map(|p| self.embed_ids(p))
                            .collect::<SlmResult<Vec<_>>>()?;
                        let generated = Tensor::stack(&rows, 0)?.to_dtype(base.dtype())?;
                        Tensor::cat(&[&base, &generated], 1)?
                    };
                    let rows: Vec<Vec<u8>> = (0..n)
                        .map(|_| {
                            let mut r = cond_mask.clone();
                            r.extend(std::iter::repeat(1u8).take(k));
                            r
                        })
                        .collect();
                    let logits = Self::causal_logits(loaded, &x, &rows)?;
                    let position = if k == 0 { last_valid } else { seq + k - 1 };
                    Self::step_rows(&logits, position)
                })?
            }
        };

        debug!(
            "constrained_generate: {:?} (score {:.4})",
            outcome.tokens, outcome.score
        );
        Ok(outcome.tokens)
    }
}
