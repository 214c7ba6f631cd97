//! Error types for speech-conditioned prompting.

use thiserror::Error;

/// Coarse error class, used by callers to pick a handling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad task/template/answer configuration. Fatal, never retried.
    Configuration,
    /// A field required by a template is absent on one example.
    /// The caller decides whether to drop the example or fail the batch.
    Resolution,
    /// Length bookkeeping does not fit the tensors. Indicates a logic defect.
    Alignment,
    /// Failures of external collaborators (tensor ops, I/O, tokenizer).
    Runtime,
}

/// Main error type.
#[derive(Error, Debug)]
pub enum SlmError {
    /// No template registered under this task id.
    #[error("unknown task '{0}'")]
    UnknownTask(String),

    /// Constrained decoding was asked to choose from nothing.
    #[error("empty answer set")]
    EmptyAnswerSet,

    /// An answer candidate produced no tokens.
    #[error("answer candidate {0:?} produced no tokens")]
    UntokenizableAnswer(String),

    /// Generative model adapter used before `load()`.
    #[error("model adapter is not loaded (state: configured)")]
    NotReady,

    /// Other configuration errors.
    #[error("Config error: {0}")]
    Config(String),

    /// Template references a field the example does not carry.
    #[error("example {example}: missing field '{field}'")]
    MissingField { example: usize, field: String },

    /// Field exists, but its value cannot be used where it is referenced.
    #[error("example {example}: field '{field}' {message}")]
    FieldKind {
        example: usize,
        field: String,
        message: String,
    },

    /// Length/offset bookkeeping violated.
    #[error("Alignment error{}: {message}", example_suffix(.example))]
    Alignment {
        example: Option<usize>,
        message: String,
    },

    /// Model loading errors.
    #[error("Model error: {0}")]
    Model(String),

    /// Inference errors.
    #[error("Inference error: {0}")]
    Inference(String),

    /// Tokenizer errors.
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Candle tensor errors.
    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    /// JSON parsing errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SlmError {
    /// Alignment error bound to one example.
    pub fn alignment(example: usize, message: impl Into<String>) -> Self {
        Self::Alignment {
            example: Some(example),
            message: message.into(),
        }
    }

    /// Alignment error for the batch as a whole.
    pub fn batch_alignment(message: impl Into<String>) -> Self {
        Self::Alignment {
            example: None,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownTask(_)
            | Self::EmptyAnswerSet
            | Self::UntokenizableAnswer(_)
            | Self::NotReady
            | Self::Config(_) => ErrorKind::Configuration,
            Self::MissingField { .. } | Self::FieldKind { .. } => ErrorKind::Resolution,
            Self::Alignment { .. } => ErrorKind::Alignment,
            Self::Model(_)
            | Self::Inference(_)
            | Self::Tokenizer(_)
            | Self::Io(_)
            | Self::Candle(_)
            | Self::Json(_) => ErrorKind::Runtime,
        }
    }

    /// Only resolution failures may be skipped by dropping the example.
    pub fn is_recoverable(&self) -> bool {
        self.kind() == ErrorKind::Resolution
    }

    /// Index of the offending example, when the error is bound to one.
    pub fn example_index(&self) -> Option<usize> {
        match self {
            Self::MissingField { example, .. } | Self::FieldKind { example, .. } => Some(*example),
            Self::Alignment { example, .. } => *example,
            _ => None,
        }
    }
}

fn example_suffix(example: &Option<usize>) -> String {
    example.map(|i| format!(" (example {i})")).unwrap_or_default()
}

/// Result type alias.
pub type SlmResult<T> = Result<T, SlmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_message_names_example() {
        let err = SlmError::alignment(7, "no_loss_length negative");
        assert_eq!(
            err.to_string(),
            "Alignment error (example 7): no_loss_length negative"
        );
        assert_eq!(err.example_index(), Some(7));
        assert_eq!(err.kind(), ErrorKind::Alignment);
    }

    #[test]
    fn test_batch_alignment_message() {
        let err = SlmError::batch_alignment("width 10 exceeds capacity 8");
        assert_eq!(err.to_string(), "Alignment error: width 10 exceeds capacity 8");
        assert_eq!(err.example_index(), None);
    }

    #[test]
    fn test_only_resolution_is_recoverable() {
        let missing = SlmError::MissingField {
            example: 3,
            field: "audio".into(),
        };
        assert!(missing.is_recoverable());
        assert_eq!(missing.to_string(), "example 3: missing field 'audio'");
        assert!(!SlmError::EmptyAnswerSet.is_recoverable());
        assert!(!SlmError::UnknownTask("sst2".into()).is_recoverable());
        assert_eq!(SlmError::NotReady.kind(), ErrorKind::Configuration);
    }
}
