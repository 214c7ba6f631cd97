//! Segment Resolver: шаблон + пример → упорядоченные сегменты эмбеддингов.
//!
//! Сегменты идут в порядке шаблона; именно он определяет, что считается
//! префиксом, блоком энкодера и постфиксом. Сборщик батча их не переставляет.

use candle_core::Tensor;
use tracing::debug;

use slm_core::{Example, FieldValue, SlmError, SlmResult, TextTokenizer, TokenEmbedder};

use crate::template::{Segment, Template};

/// Роль сегмента в собранной последовательности.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentRole {
    /// Литералы до первой ссылки на поле.
    Prefix,
    /// От первой до последней ссылки на поле включительно.
    Encoder,
    /// Литералы после последней ссылки на поле.
    Postfix,
}

/// Откуда взят сегмент.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentSource {
    Literal,
    Field(String),
    /// Id префикса/постфикса, переопределенные в самом примере.
    Override,
}

/// Один сегмент с известной длиной.
#[derive(Debug, Clone)]
pub struct ResolvedSegment {
    pub role: SegmentRole,
    pub source: SegmentSource,
    /// `[len, hidden]`; `None` для сегмента нулевой длины.
    pub embeddings: Option<Tensor>,
    pub len: usize,
}

/// Результат применения шаблона к одному примеру.
#[derive(Debug, Clone)]
pub struct ResolvedSegmentList {
    segments: Vec<ResolvedSegment>,
    hidden_size: usize,
}

impl ResolvedSegmentList {
    pub fn new(segments: Vec<ResolvedSegment>, hidden_size: usize) -> Self {
        Self {
            segments,
            hidden_size,
        }
    }

    pub fn segments(&self) -> &[ResolvedSegment] {
        &self.segments
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    fn role_len(&self, role: SegmentRole) -> usize {
        self.segments
            .iter()
            .filter(|s| s.role == role)
            .map(|s| s.len)
            .sum()
    }

    pub fn prefix_len(&self) -> usize {
        self.role_len(SegmentRole::Prefix)
    }

    pub fn encoder_len(&self) -> usize {
        self.role_len(SegmentRole::Encoder)
    }

    pub fn postfix_len(&self) -> usize {
        self.role_len(SegmentRole::Postfix)
    }

    /// Длина всего условия (prefix + encoder + postfix).
    pub fn conditioning_len(&self) -> usize {
        self.segments.iter().map(|s| s.len).sum()
    }

    /// Непустые тензоры сегментов в порядке шаблона.
    pub fn embedding_parts(&self) -> Vec<&Tensor> {
        self.segments
            .iter()
            .filter_map(|s| s.embeddings.as_ref())
            .collect()
    }

    /// Склеить условие в `[conditioning_len, hidden]`.
    pub fn concat(&self) -> SlmResult<Tensor> {
        let parts = self.embedding_parts();
        if parts.is_empty() {
            return Err(SlmError::Config(
                "conditioning is empty: every example needs a non-empty prefix, encoder or postfix segment"
                    .into(),
            ));
        }
        Ok(Tensor::cat(&parts, 0)?)
    }
}

/// Применяет шаблоны к примерам.
///
/// Чистая операция: результат зависит только от входа и (неизменяемой)
/// таблицы эмбеддингов.
pub struct SegmentResolver<'a> {
    tokenizer: &'a dyn TextTokenizer,
    embedder: &'a dyn TokenEmbedder,
}

impl<'a> SegmentResolver<'a> {
    pub fn new(tokenizer: &'a dyn TextTokenizer, embedder: &'a dyn TokenEmbedder) -> Self {
        Self {
            tokenizer,
            embedder,
        }
    }

    /// Разрешить шаблон для одиночного примера (индекс 0 в сообщениях).
    pub fn resolve(&self, template: &Template, example: &Example) -> SlmResult<ResolvedSegmentList> {
        self.resolve_at(template, example, 0)
    }

    /// Разрешить шаблон для каждого примера батча.
    ///
    /// Ошибка одного примера не прерывает остальные: политику (выбросить
    /// пример или провалить батч) выбирает вызывающий код.
    pub fn resolve_batch(
        &self,
        template: &Template,
        examples: &[Example],
    ) -> Vec<SlmResult<ResolvedSegmentList>> {
        examples
            .iter()
            .enumerate()
            .map(|(i, ex)| self.resolve_at(template, ex, i))
            .collect()
    }

    /// Разрешить шаблон; `index` попадает в сообщения об ошибках.
    pub fn resolve_at(
        &self,
        template: &Template,
        example: &Example,
        index: usize,
    ) -> SlmResult<ResolvedSegmentList> {
        let span = template.field_span();
        let role_of = |pos: usize| match span {
            Some((first, _)) if pos < first => SegmentRole::Prefix,
            Some((_, last)) if pos > last => SegmentRole::Postfix,
            Some(_) => SegmentRole::Encoder,
            None => SegmentRole::Prefix,
        };

        let mut segments = Vec::with_capacity(template.segments.len() + 2);

        if let Some(ids) = example.prefix_ids() {
            segments.push(self.embed_override(ids, SegmentRole::Prefix)?);
        }

        for (pos, seg) in template.segments.iter().enumerate() {
            let role = role_of(pos);
            let overridden = match role {
                SegmentRole::Prefix => example.prefix_ids().is_some(),
                SegmentRole::Postfix => example.postfix_ids().is_some(),
                SegmentRole::Encoder => false,
            };
            if overridden && !seg.is_field() {
                continue;
            }

            let resolved = match seg {
                Segment::Literal(text) => {
                    let ids = self.tokenizer.encode(text)?;
                    self.embed_tokens(&ids, role, SegmentSource::Literal)?
                }
                Segment::FieldRef(name) => self.resolve_field(example, index, name, role)?,
            };
            segments.push(resolved);
        }

        if let Some(ids) = example.postfix_ids() {
            segments.push(self.embed_override(ids, SegmentRole::Postfix)?);
        }

        let list = ResolvedSegmentList::new(segments, self.embedder.hidden_size());
        debug!(
            "resolve: task={} example={} prefix={} encoder={} postfix={}",
            template.task_id,
            example.label(index),
            list.prefix_len(),
            list.encoder_len(),
            list.postfix_len()
        );
        Ok(list)
    }

    fn resolve_field(
        &self,
        example: &Example,
        index: usize,
        name: &str,
        role: SegmentRole,
    ) -> SlmResult<ResolvedSegment> {
        let source = SegmentSource::Field(name.to_string());
        let value = example.field(name).ok_or_else(|| SlmError::MissingField {
            example: index,
            field: name.to_string(),
        })?;

        match value {
            FieldValue::Text(text) => {
                let ids = self.tokenizer.encode(text)?;
                self.embed_tokens(&ids, role, source)
            }
            FieldValue::Tokens(ids) => self.embed_tokens(ids, role, source),
            FieldValue::Features(features) => {
                let (frames, dim) = features.data.dims2().map_err(|_| SlmError::FieldKind {
                    example: index,
                    field: name.to_string(),
                    message: format!(
                        "must be a [frames, dim] tensor, got shape {:?}",
                        features.data.dims()
                    ),
                })?;
                if features.valid_len > frames {
                    return Err(SlmError::alignment(
                        index,
                        format!(
                            "field '{name}' reports valid length {} but holds only {frames} frames",
                            features.valid_len
                        ),
                    ));
                }
                if dim != self.embedder.hidden_size() {
                    return Err(SlmError::alignment(
                        index,
                        format!(
                            "field '{name}' has width {dim}, model embeddings have width {}",
                            self.embedder.hidden_size()
                        ),
                    ));
                }
                let embeddings = if features.valid_len == 0 {
                    None
                } else {
                    Some(features.data.narrow(0, 0, features.valid_len)?)
                };
                Ok(ResolvedSegment {
                    role,
                    source,
                    embeddings,
                    len: features.valid_len,
                })
            }
        }
    }

    fn embed_override(&self, ids: &[u32], role: SegmentRole) -> SlmResult<ResolvedSegment> {
        self.embed_tokens(ids, role, SegmentSource::Override)
    }

    fn embed_tokens(
        &self,
        ids: &[u32],
        role: SegmentRole,
        source: SegmentSource,
    ) -> SlmResult<ResolvedSegment> {
        let embeddings = if ids.is_empty() {
            None
        } else {
            Some(self.embedder.embed_ids(ids)?)
        };
        Ok(ResolvedSegment {
            role,
            source,
            embeddings,
            len: ids.len(),
        })
    }
}
