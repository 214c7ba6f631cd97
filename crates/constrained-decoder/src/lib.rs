//! Constrained Decoder.
//!
//! Turns open-ended generation into a closed-set classifier: the model may
//! only ever complete one of the tokenised answer candidates.
//!
//! * [`AnswerTrie`]: prefix tree over candidate token sequences.
//! * [`constrained_beam_search`]: beam search over the trie, driven by a
//!   caller-supplied scoring step (any backend can plug in).
//! * [`ConstrainedDecoder`]: tokenises candidates, calls the model's
//!   `constrained_generate` and maps the winning path back to its string.

mod decoder;
mod search;
mod trie;

pub use decoder::{ClassificationResult, ConstrainedDecoder};
pub use search::{constrained_beam_search, BeamOutcome};
pub use trie::AnswerTrie;
