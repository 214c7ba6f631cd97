//! Общие типы: примеры, поля, наборы ответов.
//!
//! Содержит модель данных одного входного элемента (речевое высказывание и
//! связанные с ним текстовые поля), соглашение о стороне паддинга и конечный
//! набор ответов для классификации через генерацию.

use std::collections::BTreeMap;
use std::fmt;

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::error::{SlmError, SlmResult};

// ---------------------------------------------------------------------------
// Сторона паддинга
// ---------------------------------------------------------------------------

/// С какой стороны добавляются заполняющие позиции в батче.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PaddingSide {
    /// Паддинг перед реальными позициями.
    Left,
    /// Паддинг после реальных позиций (по умолчанию).
    #[default]
    Right,
}

impl PaddingSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaddingSide::Left => "left",
            PaddingSide::Right => "right",
        }
    }

    /// Парсинг из строки (регистр не важен).
    pub fn from_str_loose(s: &str) -> Option<PaddingSide> {
        match s.trim().to_lowercase().as_str() {
            "left" | "l" => Some(PaddingSide::Left),
            "right" | "r" => Some(PaddingSide::Right),
            _ => None,
        }
    }
}

impl fmt::Display for PaddingSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Закодированные признаки
// ---------------------------------------------------------------------------

/// Выход внешнего энкодера признаков для одного поля.
///
/// `data` имеет форму `[frames, dim]`; валидны только первые `valid_len` строк.
/// Векторы уже находятся в пространстве эмбеддингов модели (после проектора).
#[derive(Debug, Clone)]
pub struct EncodedFeatures {
    pub data: Tensor,
    pub valid_len: usize,
}

impl EncodedFeatures {
    pub fn new(data: Tensor, valid_len: usize) -> Self {
        Self { data, valid_len }
    }

    /// Все строки тензора считаются валидными.
    pub fn full(data: Tensor) -> SlmResult<Self> {
        let (frames, _) = data.dims2()?;
        Ok(Self {
            data,
            valid_len: frames,
        })
    }

    /// Количество сохраненных строк (включая невалидный хвост).
    pub fn frames(&self) -> SlmResult<usize> {
        Ok(self.data.dims2()?.0)
    }

    /// Ширина вектора признаков.
    pub fn dim(&self) -> SlmResult<usize> {
        Ok(self.data.dims2()?.1)
    }
}

// ---------------------------------------------------------------------------
// Поле примера
// ---------------------------------------------------------------------------

/// Значение именованного поля примера.
#[derive(Debug, Clone)]
pub enum FieldValue {
    /// Текст, который нужно токенизировать и превратить в эмбеддинги.
    Text(String),
    /// Уже токенизированная последовательность.
    Tokens(Vec<u32>),
    /// Закодированные признаки (например, речь после энкодера).
    Features(EncodedFeatures),
}

// ---------------------------------------------------------------------------
// Пример
// ---------------------------------------------------------------------------

/// Один входной элемент: высказывание + связанные текстовые поля.
///
/// Неизменяем после построения. `target` начинается с маркера начала
/// последовательности (`<sos>`), его эмбеддинг никогда не подается на вход.
#[derive(Debug, Clone, Default)]
pub struct Example {
    /// Идентификатор (для сообщений об ошибках и логов).
    pub id: Option<String>,
    fields: BTreeMap<String, FieldValue>,
    target: Vec<u32>,
    prefix_ids: Option<Vec<u32>>,
    postfix_ids: Option<Vec<u32>>,
}

impl Example {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn with_text(self, name: impl Into<String>, text: impl Into<String>) -> Self {
        self.with_field(name, FieldValue::Text(text.into()))
    }

    pub fn with_tokens(self, name: impl Into<String>, ids: Vec<u32>) -> Self {
        self.with_field(name, FieldValue::Tokens(ids))
    }

    pub fn with_features(self, name: impl Into<String>, features: EncodedFeatures) -> Self {
        self.with_field(name, FieldValue::Features(features))
    }

    /// Целевые токены `[<sos>, y1, ..., yn]`.
    pub fn with_target(mut self, ids: Vec<u32>) -> Self {
        self.target = ids;
        self
    }

    /// Переопределить текстовый префикс готовыми id токенов.
    pub fn with_prefix_ids(mut self, ids: Vec<u32>) -> Self {
        self.prefix_ids = Some(ids);
        self
    }

    /// Переопределить текстовый постфикс готовыми id токенов.
    pub fn with_postfix_ids(mut self, ids: Vec<u32>) -> Self {
        self.postfix_ids = Some(ids);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn target(&self) -> &[u32] {
        &self.target
    }

    pub fn prefix_ids(&self) -> Option<&[u32]> {
        self.prefix_ids.as_deref()
    }

    pub fn postfix_ids(&self) -> Option<&[u32]> {
        self.postfix_ids.as_deref()
    }

    /// Метка для сообщений: id, если задан, иначе индекс в батче.
    pub fn label(&self, index: usize) -> String {
        match &self.id {
            Some(id) => format!("{index} ({id})"),
            None => index.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Набор ответов
// ---------------------------------------------------------------------------

/// Конечный непустой набор строк-кандидатов для одной задачи классификации.
///
/// Порядок первого появления сохраняется, дубликаты отбрасываются.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerSet {
    answers: Vec<String>,
}

impl AnswerSet {
    pub fn new<I, S>(answers: I) -> SlmResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out: Vec<String> = Vec::new();
        for a in answers {
            let a = a.into();
            if !out.contains(&a) {
                out.push(a);
            }
        }
        if out.is_empty() {
            return Err(SlmError::EmptyAnswerSet);
        }
        Ok(Self { answers: out })
    }

    pub fn len(&self) -> usize {
        self.answers.len()
    }

    /// Всегда `false`: пустой набор не конструируется.
    pub fn is_empty(&self) -> bool {
        self.answers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.answers.iter().map(String::as_str)
    }

    pub fn contains(&self, answer: &str) -> bool {
        self.answers.iter().any(|a| a == answer)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.answers
    }
}
