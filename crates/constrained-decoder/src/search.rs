//! Beam search restricted to the paths of an [`AnswerTrie`].

use std::cmp::Ordering;

use tracing::debug;

use slm_core::{SlmError, SlmResult};

use crate::trie::AnswerTrie;

/// Winning completion.
#[derive(Debug, Clone, PartialEq)]
pub struct BeamOutcome {
    /// Generated token ids (exactly one stored trie sequence).
    pub tokens: Vec<u32>,
    /// Answer index stored at the terminal node.
    pub answer: usize,
    /// Length-normalised log-probability.
    pub score: f32,
}

#[derive(Debug, Clone)]
struct Hypothesis {
    tokens: Vec<u32>,
    node: usize,
    logprob: f32,
}

/// Log-probabilities of `allowed` renormalised over the allowed set only.
fn allowed_logprobs(logits: &[f32], allowed: &[u32]) -> SlmResult<Vec<f32>> {
    let mut picked = Vec::with_capacity(allowed.len());
    for &tok in allowed {
        let v = logits.get(tok as usize).copied().ok_or_else(|| {
            SlmError::Inference(format!(
                "allowed token {tok} outside vocabulary of {}",
                logits.len()
            ))
        })?;
        picked.push(v);
    }
    let max = picked.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        // every allowed logit masked: fall back to uniform
        let lp = -(allowed.len() as f32).ln();
        return Ok(vec![lp; allowed.len()]);
    }
    let lse = max + picked.iter().map(|v| (v - max).exp()).sum::<f32>().ln();
    Ok(picked.into_iter().map(|v| v - lse).collect())
}

/// Run beam search over `trie`.
///
/// * `beam_width`: live hypotheses kept per step (clamped to at least 1).
/// * `max_steps`: generation budget in tokens.
/// * `step`: given the generated prefixes of the live hypotheses, returns
///   next-token logits (`vocab` entries) for each of them, in order.
///
/// A hypothesis finishes when it reaches a terminal node; if that node also
/// has children it stays live too. Finished hypotheses are ranked by
/// log-probability divided by their length.
pub fn constrained_beam_search<F>(
    trie: &AnswerTrie,
    beam_width: usize,
    max_steps: usize,
    mut step: F,
) -> SlmResult<BeamOutcome>
where
    F: FnMut(&[Vec<u32>]) -> SlmResult<Vec<Vec<f32>>>,
{
    if trie.is_empty() {
        return Err(SlmError::EmptyAnswerSet);
    }
    let beam_width = beam_width.max(1);

    let mut live = vec![Hypothesis {
        tokens: Vec::new(),
        node: AnswerTrie::ROOT,
        logprob: 0.0,
    }];
    let mut finished: Vec<BeamOutcome> = Vec::new();

    for step_idx in 0..max_steps {
        if live.is_empty() {
            break;
        }
        let prefixes: Vec<Vec<u32>> = live.iter().map(|h| h.tokens.clone()).collect();
        let rows = step(&prefixes)?;
        if rows.len() != live.len() {
            return Err(SlmError::Inference(format!(
                "scoring step returned {} rows for {} hypotheses",
                rows.len(),
                live.len()
            )));
        }

        let mut expanded: Vec<Hypothesis> = Vec::new();
        for (hyp, logits) in live.iter().zip(&rows) {
            let (allowed, nodes): (Vec<u32>, Vec<usize>) = trie.children(hyp.node).unzip();
            let lps = allowed_logprobs(logits, &allowed)?;
            for ((tok, node), lp) in allowed.into_iter().zip(nodes).zip(lps) {
                let mut tokens = hyp.tokens.clone();
                tokens.push(tok);
                expanded.push(Hypothesis {
                    tokens,
                    node,
                    logprob: hyp.logprob + lp,
                });
            }
        }

        expanded.sort_by(|a, b| {
            b.logprob
                .partial_cmp(&a.logprob)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.tokens.cmp(&b.tokens))
        });
        expanded.truncate(beam_width);

        live = Vec::with_capacity(expanded.len());
        for hyp in expanded {
            if let Some(answer) = trie.terminal(hyp.node) {
                finished.push(BeamOutcome {
                    tokens: hyp.tokens.clone(),
                    answer,
                    score: hyp.logprob / hyp.tokens.len() as f32,
                });
            }
            if trie.has_children(hyp.node) {
                live.push(hyp);
            }
        }
        debug!(
            "beam step {}: live={} finished={}",
            step_idx,
            live.len(),
            finished.len()
        );
    }

    finished
        .into_iter()
        .min_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.answer.cmp(&b.answer))
        })
        .ok_or_else(|| {
            SlmError::Inference(format!(
                "no answer completed within {max_steps} generated tokens"
            ))
        })
}
