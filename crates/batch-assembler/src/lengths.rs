//! Length bookkeeping for one example.

use prompt_template::ResolvedSegmentList;
use slm_core::{SlmError, SlmResult};

/// Segment lengths of one example, computed before any padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LengthPlan {
    pub prefix: usize,
    pub encoder: usize,
    pub postfix: usize,
    /// Including the leading start marker.
    pub target: usize,
}

impl LengthPlan {
    pub fn new(prefix: usize, encoder: usize, postfix: usize, target: usize) -> Self {
        Self {
            prefix,
            encoder,
            postfix,
            target,
        }
    }

    pub fn from_segments(segments: &ResolvedSegmentList, target_len: usize) -> Self {
        Self::new(
            segments.prefix_len(),
            segments.encoder_len(),
            segments.postfix_len(),
            target_len,
        )
    }

    pub fn conditioning(&self) -> usize {
        self.prefix + self.encoder + self.postfix
    }

    /// `prefix + encoder + postfix - 1`.
    ///
    /// The last conditioning position predicts the first real target token,
    /// so it is not excluded. Independent of the padding side.
    pub fn no_loss_length(&self, example: usize) -> SlmResult<usize> {
        self.conditioning().checked_sub(1).ok_or_else(|| {
            SlmError::alignment(
                example,
                format!(
                    "no_loss_length negative for example {example}: prefix, encoder and postfix are all empty"
                ),
            )
        })
    }

    /// `no_loss_length + target`.
    pub fn total_length(&self, example: usize) -> SlmResult<usize> {
        if self.target == 0 {
            return Err(SlmError::alignment(
                example,
                format!("target of example {example} is empty; it must start with a start marker"),
            ));
        }
        Ok(self.no_loss_length(example)? + self.target)
    }
}
