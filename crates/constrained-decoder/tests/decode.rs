//! Constrained decoding against a fake model that would rather say something else.

use std::sync::atomic::{AtomicUsize, Ordering};

use candle_core::{DType, Device, Tensor};
use constrained_decoder::{constrained_beam_search, AnswerTrie, ConstrainedDecoder};
use slm_core::{
    DecoderKind, GenerativeModel, ModelInput, PaddingSide, SlmError, SlmResult, TextTokenizer,
    TokenEmbedder,
};

const VOCAB: usize = 32;
const MAYBE: u32 = 31;

/// Byte-level toy tokenizer: 'a' = 1 ... 'z' = 26, everything else dropped.
struct LetterTokenizer;

impl TextTokenizer for LetterTokenizer {
    fn encode(&self, text: &str) -> SlmResult<Vec<u32>> {
        Ok(text
            .bytes()
            .filter(u8::is_ascii_lowercase)
            .map(|b| (b - b'a' + 1) as u32)
            .collect())
    }

    fn decode(&self, ids: &[u32]) -> SlmResult<String> {
        Ok(ids
            .iter()
            .filter(|&&i| (1..=26).contains(&i))
            .map(|&i| (b'a' + i as u8 - 1) as char)
            .collect())
    }
}

/// Prefers `MAYBE` everywhere, then the letters of `favourite`.
struct StubbornModel {
    favourite: Vec<u32>,
    calls: AtomicUsize,
}

impl StubbornModel {
    fn new(favourite: &str) -> Self {
        Self {
            favourite: LetterTokenizer.encode(favourite).unwrap(),
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TokenEmbedder for StubbornModel {
    fn hidden_size(&self) -> usize {
        2
    }

    fn embed_ids(&self, ids: &[u32]) -> SlmResult<Tensor> {
        Ok(Tensor::zeros((ids.len(), 2), DType::F32, &Device::Cpu)?)
    }
}

impl GenerativeModel for StubbornModel {
    fn decoder_kind(&self) -> DecoderKind {
        DecoderKind::Causal
    }

    fn padding_side(&self) -> PaddingSide {
        PaddingSide::Right
    }

    fn pad_token_id(&self) -> u32 {
        0
    }

    fn forward(&self, _input: &ModelInput) -> SlmResult<Tensor> {
        Err(SlmError::Inference("not used".into()))
    }

    fn constrained_generate(
        &self,
        _embeds: &Tensor,
        _mask: &Tensor,
        allowed: &[Vec<u32>],
        max_new_tokens: usize,
    ) -> SlmResult<Vec<u32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let trie = AnswerTrie::from_sequences(allowed);
        let out = constrained_beam_search(&trie, allowed.len(), max_new_tokens, |prefixes| {
            Ok(prefixes
                .iter()
                .map(|p| {
                    let mut row = vec![0f32; VOCAB];
                    row[MAYBE as usize] = 100.0;
                    if let Some(&t) = self.favourite.get(p.len()) {
                        row[t as usize] = 5.0;
                    }
                    row
                })
                .collect())
        })?;
        Ok(out.tokens)
    }
}

fn conditioning() -> (Tensor, Tensor) {
    (
        Tensor::zeros((1, 3, 2), DType::F32, &Device::Cpu).unwrap(),
        Tensor::ones((1, 3), DType::U8, &Device::Cpu).unwrap(),
    )
}

#[test]
fn test_answer_stays_in_set() {
    let model = StubbornModel::new("no");
    let (emb, mask) = conditioning();
    let decoder = ConstrainedDecoder::new(&LetterTokenizer);

    let answer = decoder.decode(&model, &emb, &mask, &["yes", "no"]).unwrap();
    assert_eq!(answer, "no");
    assert_eq!(model.calls(), 1);
}

#[test]
fn test_scored_result_carries_path() {
    let model = StubbornModel::new("neutral");
    let (emb, mask) = conditioning();
    let decoder = ConstrainedDecoder::new(&LetterTokenizer);

    let res = decoder
        .decode_scored(&model, &emb, &mask, &["entailment", "neutral", "contradiction"])
        .unwrap();
    assert_eq!(res.answer, "neutral");
    assert_eq!(res.index, 1);
    assert_eq!(res.tokens, LetterTokenizer.encode("neutral").unwrap());
}

#[test]
fn test_empty_answer_set_never_calls_model() {
    let model = StubbornModel::new("yes");
    let (emb, mask) = conditioning();
    let decoder = ConstrainedDecoder::new(&LetterTokenizer);

    let err = decoder.decode::<&str>(&model, &emb, &mask, &[]).unwrap_err();
    assert!(matches!(err, SlmError::EmptyAnswerSet));
    assert_eq!(model.calls(), 0);
}

#[test]
fn test_untokenizable_candidate() {
    let model = StubbornModel::new("yes");
    let (emb, mask) = conditioning();
    let decoder = ConstrainedDecoder::new(&LetterTokenizer);

    let err = decoder.decode(&model, &emb, &mask, &["yes", "42"]).unwrap_err();
    assert!(matches!(err, SlmError::UntokenizableAnswer(ref a) if a == "42"));
    assert_eq!(model.calls(), 0);
}

#[test]
fn test_identical_tokenisations_collapse() {
    let model = StubbornModel::new("yes");
    let (emb, mask) = conditioning();
    let decoder = ConstrainedDecoder::new(&LetterTokenizer);

    // punctuation is dropped, so "yes" and "y-e-s" share one path
    let res = decoder
        .decode_scored(&model, &emb, &mask, &["yes", "y-e-s", "no"])
        .unwrap();
    assert_eq!(res.answer, "yes");
    assert_eq!(res.index, 0);
}

#[test]
fn test_answer_is_trimmed() {
    let model = StubbornModel::new("no");
    let (emb, mask) = conditioning();
    let decoder = ConstrainedDecoder::new(&LetterTokenizer);

    let res = decoder
        .decode_scored(&model, &emb, &mask, &[" yes", " no\n"])
        .unwrap();
    assert_eq!(res.answer, "no");
    assert_eq!(res.index, 1);
}
