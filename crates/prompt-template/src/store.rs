//! Хранилище шаблонов: по одному шаблону на задачу.
//!
//! Заполняется один раз при старте процесса и дальше только читается.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tracing::info;

use slm_core::{SlmError, SlmResult};

use crate::template::{Segment, Template};

#[derive(Debug, Deserialize)]
struct StoreFile {
    tasks: HashMap<String, RawTask>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawTask {
    Segments(Vec<Segment>),
    Full {
        segments: Vec<Segment>,
        #[serde(default)]
        answer_choices: Option<Vec<String>>,
    },
}

/// Неизменяемое хранилище шаблонов промптов.
#[derive(Debug, Clone, Default)]
pub struct TemplateStore {
    templates: HashMap<String, Template>,
}

impl TemplateStore {
    /// Построить хранилище из готовых шаблонов.
    ///
    /// Каждый шаблон валидируется; повтор `task_id` дает ошибку конфигурации.
    pub fn from_templates(templates: impl IntoIterator<Item = Template>) -> SlmResult<Self> {
        let mut map = HashMap::new();
        for t in templates {
            t.validate()?;
            if map.contains_key(&t.task_id) {
                return Err(SlmError::Config(format!(
                    "duplicate template for task '{}'",
                    t.task_id
                )));
            }
            map.insert(t.task_id.clone(), t);
        }
        Ok(Self { templates: map })
    }

    /// Загрузить из JSON вида `{"tasks": {"<id>": [..] | {"segments": [..], "answer_choices": [..]}}}`.
    pub fn from_json_str(json: &str) -> SlmResult<Self> {
        let file: StoreFile = serde_json::from_str(json)?;
        let templates = file.tasks.into_iter().map(|(task_id, raw)| match raw {
            RawTask::Segments(segments) => Template::new(task_id, segments),
            RawTask::Full {
                segments,
                answer_choices,
            } => Template {
                task_id,
                segments,
                answer_choices,
            },
        });
        Self::from_templates(templates)
    }

    pub fn from_file(path: impl AsRef<Path>) -> SlmResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let store = Self::from_json_str(&json)?;
        info!(
            "TemplateStore: загружено {} шаблонов из {:?}",
            store.len(),
            path
        );
        Ok(store)
    }

    pub fn get_template(&self, task_id: &str) -> SlmResult<&Template> {
        self.templates
            .get(task_id)
            .ok_or_else(|| SlmError::UnknownTask(task_id.to_string()))
    }

    /// Идентификаторы задач в алфавитном порядке.
    pub fn task_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.templates.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STORE_JSON: &str = r#"{
        "tasks": {
            "sst2": {
                "segments": ["Review: ", "%sentence", " Is this review positive or negative? "],
                "answer_choices": ["negative", "positive"]
            },
            "asr": ["Transcribe: ", "%speech", ". Text: "]
        }
    }"#;

    #[test]
    fn test_load_and_get() {
        let store = TemplateStore::from_json_str(STORE_JSON).unwrap();
        assert_eq!(store.task_ids(), vec!["asr", "sst2"]);

        let sst2 = store.get_template("sst2").unwrap();
        assert_eq!(sst2.field_names(), vec!["sentence"]);
        assert_eq!(
            sst2.answer_choices.as_deref(),
            Some(&["negative".to_string(), "positive".to_string()][..])
        );

        let asr = store.get_template("asr").unwrap();
        assert!(asr.answer_choices.is_none());
        assert_eq!(asr.segments[1], Segment::field("speech"));
    }

    #[test]
    fn test_unknown_task() {
        let store = TemplateStore::from_json_str(STORE_JSON).unwrap();
        let err = store.get_template("qqp").unwrap_err();
        assert!(matches!(err, SlmError::UnknownTask(ref t) if t == "qqp"));
    }

    #[test]
    fn test_duplicate_task_rejected() {
        let t = Template::new("a", vec![Segment::literal("x")]);
        let err = TemplateStore::from_templates([t.clone(), t]).unwrap_err();
        assert!(matches!(err, SlmError::Config(_)));
    }

    #[test]
    fn test_invalid_template_rejected() {
        let err = TemplateStore::from_json_str(r#"{"tasks": {"empty": []}}"#).unwrap_err();
        assert!(matches!(err, SlmError::Config(_)));
    }
}
