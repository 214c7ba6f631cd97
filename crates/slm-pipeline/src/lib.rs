//! Speech LM Pipeline.
//!
//! Связывает хранилище шаблонов, резолвер сегментов, сборщик батча и
//! ограниченный декодер поверх одной генеративной модели:
//!
//! - обучение: [`SpeechLmPipeline::assemble_batch`], [`SpeechLmPipeline::training_logits`],
//!   [`SpeechLmPipeline::training_loss`];
//! - инференс: [`SpeechLmPipeline::classify`];
//! - оценка: [`evaluation`] (accuracy, MCC).

pub mod evaluation;
mod pipeline;

pub use evaluation::{accuracy, answer_index, matthews_correlation, EvalReport, Metric};
pub use pipeline::{PipelineBatch, ResolutionPolicy, SpeechLmPipeline, TrainingOutput};
