//! Токенайзер HuggingFace (`tokenizer.json`).
//!
//! Кандидаты ответов, литералы шаблонов и цели токенизируются одним и тем же
//! экземпляром, без специальных токенов: начало/конец последовательности
//! добавляет вызывающий код.

use std::path::Path;

use tokenizers::{PaddingDirection, Tokenizer};

use slm_core::{PaddingSide, SlmError, SlmResult, TextTokenizer};

#[derive(Clone)]
pub struct HfTokenizer {
    inner: Tokenizer,
    padding_side: Option<PaddingSide>,
}

impl HfTokenizer {
    /// Загрузить `tokenizer.json`.
    ///
    /// Сторона паддинга берется из `tokenizer_config.json` рядом с файлом
    /// (ключ `padding_side`), иначе из секции `padding` самого `tokenizer.json`.
    pub fn from_file(path: impl AsRef<Path>) -> SlmResult<Self> {
        let path = path.as_ref();
        let inner = Tokenizer::from_file(path).map_err(|e| {
            SlmError::Tokenizer(format!("не удалось загрузить {}: {e}", path.display()))
        })?;

        let from_config = path
            .parent()
            .map(|dir| dir.join("tokenizer_config.json"))
            .and_then(|p| std::fs::read_to_string(p).ok())
            .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok())
            .and_then(|v| {
                v.get("padding_side")
                    .and_then(|x| x.as_str())
                    .and_then(PaddingSide::from_str_loose)
            });

        let mut tok = Self::from_tokenizer(inner);
        if from_config.is_some() {
            tok.padding_side = from_config;
        }
        Ok(tok)
    }

    pub fn from_tokenizer(inner: Tokenizer) -> Self {
        let padding_side = inner.get_padding().map(|p| match p.direction {
            PaddingDirection::Left => PaddingSide::Left,
            PaddingDirection::Right => PaddingSide::Right,
        });
        Self {
            inner,
            padding_side,
        }
    }

    /// Сторона паддинга, с которой обучалась модель, если токенайзер ее знает.
    pub fn padding_side(&self) -> Option<PaddingSide> {
        self.padding_side
    }

    pub fn token_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    /// Id токена-заполнителя: из настроек паддинга или по распространенным именам.
    pub fn pad_token_id(&self) -> Option<u32> {
        self.inner
            .get_padding()
            .map(|p| p.pad_id)
            .or_else(|| self.token_id("<pad>"))
            .or_else(|| self.token_id("[PAD]"))
            .or_else(|| self.token_id("<|endoftext|>"))
    }

    pub fn eos_token_id(&self) -> Option<u32> {
        self.token_id("</s>")
            .or_else(|| self.token_id("<|endoftext|>"))
            .or_else(|| self.token_id("<|im_end|>"))
    }
}

impl TextTokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> SlmResult<Vec<u32>> {
        let enc = self
            .inner
            .encode(text, false)
            .map_err(|e| SlmError::Tokenizer(format!("ошибка токенизации {text:?}: {e}")))?;
        Ok(enc.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> SlmResult<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| SlmError::Tokenizer(format!("ошибка декодирования: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word_level(words: &[&str]) -> Tokenizer {
        let vocab: serde_json::Map<String, serde_json::Value> = words
            .iter()
            .enumerate()
            .map(|(i, w)| (w.to_string(), serde_json::Value::from(i as u32)))
            .collect();
        let json = serde_json::json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": { "type": "Whitespace" },
            "post_processor": null,
            "decoder": null,
            "model": { "type": "WordLevel", "vocab": vocab, "unk_token": "[UNK]" }
        });
        Tokenizer::from_bytes(json.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn test_special_tokens_and_vocab() {
        let tok = HfTokenizer::from_tokenizer(word_level(&["[UNK]", "<pad>", "</s>", "yes", "no"]));
        assert_eq!(tok.vocab_size(), 5);
        assert_eq!(tok.pad_token_id(), Some(1));
        assert_eq!(tok.eos_token_id(), Some(2));
        assert_eq!(tok.padding_side(), None);
        assert_eq!(tok.encode("yes no").unwrap(), vec![3, 4]);
    }
}
