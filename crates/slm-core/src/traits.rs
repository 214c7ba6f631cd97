//! Контракты внешних компонентов.
//!
//! Ядро не владеет ни токенайзером, ни энкодером речи, ни самой языковой
//! моделью: оно описывает только форму входа, которую модель должна получить,
//! и политику декодирования ее выхода. Конкретные реализации живут в
//! `lm-adapter` (или в тестовых фикстурах).

use candle_core::Tensor;

use crate::decoder_kind::DecoderKind;
use crate::error::SlmResult;
use crate::types::{EncodedFeatures, PaddingSide};

/// Текст ↔ id токенов. Специальные токены не добавляются.
pub trait TextTokenizer: Send + Sync {
    fn encode(&self, text: &str) -> SlmResult<Vec<u32>>;

    /// Декодирование без специальных токенов.
    fn decode(&self, ids: &[u32]) -> SlmResult<String>;
}

/// Таблица эмбеддингов токенов модели.
///
/// Детерминирована при фиксированном словаре и весах.
pub trait TokenEmbedder: Send + Sync {
    /// Ширина эмбеддинга.
    fn hidden_size(&self) -> usize;

    /// Эмбеддинги `[ids.len(), hidden_size]`.
    fn embed_ids(&self, ids: &[u32]) -> SlmResult<Tensor>;
}

/// Энкодер признаков: переводит сырой выход речевого энкодера
/// (`[frames, encoder_dim]`) в пространство эмбеддингов модели.
pub trait FeatureEncoder {
    fn encode(&self, frames: &Tensor, valid_len: usize) -> SlmResult<EncodedFeatures>;
}

/// Вход прямого прохода модели.
///
/// Для causal/prefix-tuned моделей используются только `embeds` и `mask`
/// (`[batch, seq, hidden]` и `[batch, seq]`, `u8`). Seq2seq модель трактует
/// `embeds` как память энкодера, а `decoder_input_ids` (`[batch, tgt]`, `u32`)
/// как вход декодера.
#[derive(Debug, Clone)]
pub struct ModelInput {
    pub embeds: Tensor,
    pub mask: Tensor,
    pub decoder_input_ids: Option<Tensor>,
    pub decoder_mask: Option<Tensor>,
}

impl ModelInput {
    pub fn new(embeds: Tensor, mask: Tensor) -> Self {
        Self {
            embeds,
            mask,
            decoder_input_ids: None,
            decoder_mask: None,
        }
    }

    pub fn with_decoder_inputs(mut self, ids: Tensor, mask: Tensor) -> Self {
        self.decoder_input_ids = Some(ids);
        self.decoder_mask = Some(mask);
        self
    }
}

/// Генеративная модель, к которой подключается собранная последовательность.
///
/// Экземпляр принадлежит одному воркеру: вызовы на одном экземпляре
/// сериализует вызывающий код, внутренних блокировок нет.
pub trait GenerativeModel: TokenEmbedder {
    /// Стратегия декодирования этой модели.
    fn decoder_kind(&self) -> DecoderKind;

    /// Сторона паддинга, с которой модель обучалась.
    fn padding_side(&self) -> PaddingSide;

    /// Id токена-заполнителя.
    fn pad_token_id(&self) -> u32;

    /// Id конца последовательности, если модель его знает.
    fn eos_token_id(&self) -> Option<u32> {
        None
    }

    /// Логиты `[batch, seq, vocab]` для каждой позиции входа.
    fn forward(&self, input: &ModelInput) -> SlmResult<Tensor>;

    /// Поиск, который может завершить только одну из `allowed` последовательностей.
    ///
    /// * `embeds`: условие `[1, seq, hidden]`, `mask`: `[1, seq]`.
    /// * Ширина луча равна `allowed.len()`.
    /// * Генерируется не более `max_new_tokens` токенов.
    ///
    /// Возвращает id сгенерированных токенов (без условия).
    fn constrained_generate(
        &self,
        embeds: &Tensor,
        mask: &Tensor,
        allowed: &[Vec<u32>],
        max_new_tokens: usize,
    ) -> SlmResult<Vec<u32>>;
}
