//! Шаблон промпта: упорядоченный список литералов и ссылок на поля.
//!
//! В конфигурации сегмент записывается строкой: обычная строка означает литерал,
//! строка с ведущим `%` означает ссылку на поле (`"%audio"`), `%%` экранирует
//! литеральный `%`. Допустима и явная форма `{"literal": ".."}` /
//! `{"field": ".."}`.

use serde::{Deserialize, Serialize};

use slm_core::{SlmError, SlmResult};

/// Сегмент шаблона.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawSegment", into = "RawSegment")]
pub enum Segment {
    /// Литеральный текст, превращается в эмбеддинги через токенайзер.
    Literal(String),
    /// Ссылка на именованное поле примера.
    FieldRef(String),
}

impl Segment {
    pub fn literal(text: impl Into<String>) -> Self {
        Segment::Literal(text.into())
    }

    pub fn field(name: impl Into<String>) -> Self {
        Segment::FieldRef(name.into())
    }

    /// Разбор компактной строковой записи.
    pub fn parse(s: &str) -> Self {
        if let Some(rest) = s.strip_prefix("%%") {
            Segment::Literal(format!("%{rest}"))
        } else if let Some(name) = s.strip_prefix('%') {
            Segment::FieldRef(name.to_string())
        } else {
            Segment::Literal(s.to_string())
        }
    }

    pub fn is_field(&self) -> bool {
        matches!(self, Segment::FieldRef(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawSegment {
    Compact(String),
    Literal { literal: String },
    Field { field: String },
}

impl From<RawSegment> for Segment {
    fn from(raw: RawSegment) -> Self {
        match raw {
            RawSegment::Compact(s) => Segment::parse(&s),
            RawSegment::Literal { literal } => Segment::Literal(literal),
            RawSegment::Field { field } => Segment::FieldRef(field),
        }
    }
}

impl From<Segment> for RawSegment {
    fn from(seg: Segment) -> Self {
        match seg {
            Segment::Literal(literal) => RawSegment::Literal { literal },
            Segment::FieldRef(field) => RawSegment::Field { field },
        }
    }
}

/// Шаблон одной задачи.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub task_id: String,
    pub segments: Vec<Segment>,
    /// Фиксированный список ответов задачи (если это классификация).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_choices: Option<Vec<String>>,
}

impl Template {
    pub fn new(task_id: impl Into<String>, segments: Vec<Segment>) -> Self {
        Self {
            task_id: task_id.into(),
            segments,
            answer_choices: None,
        }
    }

    pub fn with_answer_choices<I, S>(mut self, choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.answer_choices = Some(choices.into_iter().map(Into::into).collect());
        self
    }

    /// Фиксированный промпт `[prefix, %field, postfix]` для обучения.
    pub fn from_prefix_postfix(
        task_id: impl Into<String>,
        prefix: impl Into<String>,
        field: impl Into<String>,
        postfix: impl Into<String>,
    ) -> Self {
        Self::new(
            task_id,
            vec![
                Segment::Literal(prefix.into()),
                Segment::FieldRef(field.into()),
                Segment::Literal(postfix.into()),
            ],
        )
    }

    /// Имена полей, на которые ссылается шаблон (в порядке появления).
    pub fn field_names(&self) -> Vec<&str> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::FieldRef(name) => Some(name.as_str()),
                Segment::Literal(_) => None,
            })
            .collect()
    }

    /// Индексы первой и последней ссылки на поле.
    pub fn field_span(&self) -> Option<(usize, usize)> {
        let first = self.segments.iter().position(Segment::is_field)?;
        let last = self.segments.iter().rposition(Segment::is_field)?;
        Some((first, last))
    }

    pub fn validate(&self) -> SlmResult<()> {
        if self.task_id.trim().is_empty() {
            return Err(SlmError::Config("template with empty task id".into()));
        }
        if self.segments.is_empty() {
            return Err(SlmError::Config(format!(
                "template '{}' has no segments",
                self.task_id
            )));
        }
        if let Some(pos) = self
            .segments
            .iter()
            .position(|s| matches!(s, Segment::FieldRef(name) if name.trim().is_empty()))
        {
            return Err(SlmError::Config(format!(
                "template '{}': segment {pos} references a field with an empty name",
                self.task_id
            )));
        }
        if let Some(choices) = &self.answer_choices {
            if choices.is_empty() {
                return Err(SlmError::Config(format!(
                    "template '{}': answer_choices is present but empty",
                    self.task_id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_compact() {
        assert_eq!(Segment::parse("%audio"), Segment::field("audio"));
        assert_eq!(Segment::parse("Answer: "), Segment::literal("Answer: "));
        assert_eq!(Segment::parse("%%d done"), Segment::literal("%d done"));
    }

    #[test]
    fn test_deserialize_mixed_forms() {
        let segs: Vec<Segment> =
            serde_json::from_str(r#"["Describe: ", "%audio", {"literal": "%raw"}, {"field": "q"}]"#)
                .unwrap();
        assert_eq!(
            segs,
            vec![
                Segment::literal("Describe: "),
                Segment::field("audio"),
                Segment::literal("%raw"),
                Segment::field("q"),
            ]
        );
    }

    #[test]
    fn test_serialize_explicit() {
        let json = serde_json::to_string(&Segment::field("audio")).unwrap();
        assert_eq!(json, r#"{"field":"audio"}"#);
    }

    #[test]
    fn test_field_span() {
        let t = Template::new(
            "mnli",
            vec![
                Segment::literal("Premise: "),
                Segment::field("premise"),
                Segment::literal(" Hypothesis: "),
                Segment::field("hypothesis"),
                Segment::literal(" Answer: "),
            ],
        );
        assert_eq!(t.field_span(), Some((1, 3)));
        assert_eq!(t.field_names(), vec!["premise", "hypothesis"]);

        let literal_only = Template::new("lm", vec![Segment::literal("hello")]);
        assert_eq!(literal_only.field_span(), None);
    }

    #[test]
    fn test_validate() {
        assert!(Template::new("t", vec![]).validate().is_err());
        assert!(Template::new("t", vec![Segment::field(" ")]).validate().is_err());
        let empty_choices = Template::new("t", vec![Segment::literal("x")])
            .with_answer_choices(Vec::<String>::new());
        assert!(empty_choices.validate().is_err());
        assert!(Template::from_prefix_postfix("asr", "Transcribe: ", "speech", ". Text: ")
            .validate()
            .is_ok());
    }
}
