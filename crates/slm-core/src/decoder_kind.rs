//! Реестр стратегий декодирования.
//!
//! Выбор поведения декодера делается явным тегом, а не по имени класса
//! загруженной модели.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Стратегия декодирования генеративной модели.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DecoderKind {
    /// Encoder-decoder: условие подается как память для cross-attention.
    #[serde(rename = "seq2seq")]
    Seq2Seq,
    /// Decoder-only: условие склеивается с целевыми эмбеддингами.
    #[default]
    Causal,
    /// Decoder-only с обучаемыми виртуальными токенами перед условием.
    PrefixTuned,
}

impl DecoderKind {
    /// Все стратегии.
    pub fn all() -> &'static [DecoderKind] {
        &[
            DecoderKind::Seq2Seq,
            DecoderKind::Causal,
            DecoderKind::PrefixTuned,
        ]
    }

    /// Строковый идентификатор для CLI и конфигов.
    pub fn as_str(&self) -> &'static str {
        match self {
            DecoderKind::Seq2Seq => "seq2seq",
            DecoderKind::Causal => "causal",
            DecoderKind::PrefixTuned => "prefix-tuned",
        }
    }

    /// Использует ли стратегия склейку эмбеддингов в одну последовательность.
    pub fn concatenates_conditioning(&self) -> bool {
        !matches!(self, DecoderKind::Seq2Seq)
    }

    /// Парсинг из строки (CLI-совместимо).
    pub fn from_str_loose(s: &str) -> Option<DecoderKind> {
        match s.to_lowercase().as_str() {
            "seq2seq" | "encoder-decoder" | "s2s" => Some(DecoderKind::Seq2Seq),
            "causal" | "causal-lm" | "decoder-only" => Some(DecoderKind::Causal),
            "prefix-tuned" | "prefix-tuning" | "prefix" => Some(DecoderKind::PrefixTuned),
            _ => None,
        }
    }
}

impl fmt::Display for DecoderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_names() {
        for kind in DecoderKind::all() {
            assert_eq!(DecoderKind::from_str_loose(kind.as_str()), Some(*kind));
        }
        assert_eq!(DecoderKind::from_str_loose("Prefix-Tuning"), Some(DecoderKind::PrefixTuned));
        assert_eq!(DecoderKind::from_str_loose("bloom"), None);
    }

    #[test]
    fn test_serde_kebab() {
        let k: DecoderKind = serde_json::from_str("\"prefix-tuned\"").unwrap();
        assert_eq!(k, DecoderKind::PrefixTuned);
        assert_eq!(serde_json::to_string(&DecoderKind::Seq2Seq).unwrap(), "\"seq2seq\"");
        assert!(!DecoderKind::Seq2Seq.concatenates_conditioning());
    }
}
