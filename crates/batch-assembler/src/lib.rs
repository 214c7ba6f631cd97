//! Batch Assembler.
//!
//! Interleaves per-example segments of different lengths
//! (prefix, encoder frames, postfix, target tokens) into one padded
//! embedding tensor, builds the matching validity mask and records, for each
//! example, how many leading positions are conditioning and must be kept out
//! of the loss.
//!
//! Per-example layout with right padding:
//!
//! ```text
//! [ prefix | encoder | postfix | target[1..] | pad ... ]
//! ```
//!
//! With left padding the pad run comes first. The first target token is a
//! start marker and is never fed as input: the last conditioning position
//! predicts `target[1]`.

mod assembler;
mod lengths;
mod loss;
mod output;
mod seq2seq;

pub use assembler::{AssembledBatch, AssemblyItem, BatchAssembler};
pub use lengths::LengthPlan;
pub use loss::{masked_cross_entropy, target_labels};
pub use output::extract_target_logits;
pub use seq2seq::{assemble_decoder_inputs, assemble_memory, PaddedIds, PaddedMemory};
