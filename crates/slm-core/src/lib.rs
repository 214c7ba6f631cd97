//! # slm-core
//!
//! Базовые типы, трейты и ошибки для подачи закодированной речи в
//! предобученную генеративную языковую модель.
//!
//! Этот крейт предоставляет фундаментальные абстракции для всех остальных
//! крейтов в workspace:
//!
//! - Модель данных примера (`Example`, `FieldValue`, `AnswerSet`, `PaddingSide`)
//! - Унифицированная обработка ошибок через [`SlmError`]
//! - Контракты внешних компонентов: токенайзер, таблица эмбеддингов,
//!   энкодер признаков и генеративная модель ([`GenerativeModel`])
//! - Реестр стратегий декодирования [`DecoderKind`]

pub mod debug;
pub mod decoder_kind;
pub mod error;
pub mod model_files;
pub mod traits;
pub mod types;

pub use decoder_kind::DecoderKind;
pub use error::{ErrorKind, SlmError, SlmResult};
pub use traits::{FeatureEncoder, GenerativeModel, ModelInput, TextTokenizer, TokenEmbedder};
pub use types::{AnswerSet, EncodedFeatures, Example, FieldValue, PaddingSide};
