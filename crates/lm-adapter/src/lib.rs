//! Generative Model Adapter.
//!
//! One [`ModelAdapter`] wraps one of three decoding strategies
//! ([`slm_core::DecoderKind`]) behind the [`slm_core::GenerativeModel`]
//! contract. Construction is two-phase: [`ModelAdapter::configure`] records
//! parameters, [`ModelAdapter::load`] builds the weights once.

mod adapter;
pub mod config;
pub mod layers;
pub mod model;
pub mod prefix_tuning;
pub mod projector;
pub mod tokenizer;

pub use adapter::{AdapterState, ModelAdapter};
pub use config::{AdapterConfig, LmConfig, PrefixTuningConfig, WeightDType};
pub use model::{CausalLm, Seq2SeqLm};
pub use prefix_tuning::PrefixEncoder;
pub use projector::FeatureProjector;
pub use tokenizer::HfTokenizer;
