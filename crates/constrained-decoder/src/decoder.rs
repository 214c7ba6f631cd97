//! Constrained decoding: classification over a finite answer set.

use candle_core::Tensor;
use tracing::{debug, info, warn};

use slm_core::{AnswerSet, GenerativeModel, SlmError, SlmResult, TextTokenizer};

use crate::trie::AnswerTrie;

/// Chosen answer with the token path that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationResult {
    /// The winning candidate, trimmed of surrounding whitespace.
    pub answer: String,
    /// Position of `answer` in the deduplicated candidate list.
    pub index: usize,
    pub tokens: Vec<u32>,
}

/// Closed-set classifier on top of a generative model.
///
/// Candidates must be tokenised with the tokenizer whose vocabulary the
/// model's embedding table was trained with; the decoder borrows it for
/// that reason instead of owning its own.
pub struct ConstrainedDecoder<'a> {
    tokenizer: &'a dyn TextTokenizer,
}

impl<'a> ConstrainedDecoder<'a> {
    pub fn new(tokenizer: &'a dyn TextTokenizer) -> Self {
        Self { tokenizer }
    }

    /// Tokenise every candidate into a trie.
    ///
    /// Candidates that tokenise identically to an earlier one are dropped
    /// (the first keeps the path). A candidate with no tokens is an error.
    pub fn build_trie(&self, answers: &AnswerSet) -> SlmResult<AnswerTrie> {
        let mut trie = AnswerTrie::new();
        for (i, answer) in answers.iter().enumerate() {
            let ids = self.tokenizer.encode(answer)?;
            if ids.is_empty() {
                return Err(SlmError::UntokenizableAnswer(answer.to_string()));
            }
            if let Some(first) = trie.insert(&ids, i) {
                debug!(
                    "answer {:?} tokenises like {:?}, dropped",
                    answer,
                    answers.as_slice()[first]
                );
            }
        }
        Ok(trie)
    }

    /// Pick one answer for the conditioning `[1, seq, hidden]` / mask `[1, seq]`.
    pub fn decode<S: AsRef<str>>(
        &self,
        model: &dyn GenerativeModel,
        conditioning: &Tensor,
        mask: &Tensor,
        answers: &[S],
    ) -> SlmResult<String> {
        Ok(self.decode_scored(model, conditioning, mask, answers)?.answer)
    }

    /// Like [`decode`](Self::decode), also returning the winning token path.
    pub fn decode_scored<S: AsRef<str>>(
        &self,
        model: &dyn GenerativeModel,
        conditioning: &Tensor,
        mask: &Tensor,
        answers: &[S],
    ) -> SlmResult<ClassificationResult> {
        let answers = AnswerSet::new(answers.iter().map(|a| a.as_ref().to_string()))?;
        let trie = self.build_trie(&answers)?;
        let max_answer_length = trie.max_depth();

        debug!(
            "constrained decode: {} candidates, {} distinct paths, budget {}",
            answers.len(),
            trie.len(),
            max_answer_length
        );

        let tokens =
            model.constrained_generate(conditioning, mask, trie.sequences(), max_answer_length)?;

        let index = trie.lookup(&tokens).ok_or_else(|| {
            SlmError::Inference(format!(
                "constrained generation returned {tokens:?}, which is not an answer path"
            ))
        })?;
        let answer = answers.as_slice()[index].trim().to_string();

        let text = self.tokenizer.decode(&tokens)?;
        if text.trim() != answer {
            warn!(
                "answer path decodes to {:?}, reporting candidate {:?}",
                text.trim(),
                answer
            );
        }
        info!("classified: {}", answer);

        Ok(ClassificationResult {
            answer,
            index,
            tokens,
        })
    }
}
