//! Файл шаблонов с диска и разрешение многопольных шаблонов.

use std::path::PathBuf;

use candle_core::{Device, Tensor};
use prompt_template::{SegmentResolver, SegmentRole, TemplateStore};
use slm_core::{EncodedFeatures, Example, SlmError, SlmResult, TextTokenizer, TokenEmbedder};

const HIDDEN: usize = 2;

/// Один токен на символ (код байта).
struct ByteTokenizer;

impl TextTokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> SlmResult<Vec<u32>> {
        Ok(text.bytes().map(u32::from).collect())
    }

    fn decode(&self, ids: &[u32]) -> SlmResult<String> {
        Ok(ids.iter().map(|&i| i as u8 as char).collect())
    }
}

struct ConstEmbedder;

impl TokenEmbedder for ConstEmbedder {
    fn hidden_size(&self) -> usize {
        HIDDEN
    }

    fn embed_ids(&self, ids: &[u32]) -> SlmResult<Tensor> {
        Ok(Tensor::ones((ids.len(), HIDDEN), candle_core::DType::F32, &Device::Cpu)?)
    }
}

fn write_templates(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("prompt-template-{}-{name}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("templates.json");
    std::fs::write(
        &path,
        r#"{
          "tasks": {
            "asr": ["", "%audio", ""],
            "xnli": {
              "segments": ["P: ", "%audio", " H: ", "%hypothesis", "?"],
              "answer_choices": ["Yes", "Also", "No"]
            }
          }
        }"#,
    )
    .unwrap();
    path
}

fn audio(frames: usize) -> EncodedFeatures {
    let data = Tensor::zeros((frames, HIDDEN), candle_core::DType::F32, &Device::Cpu).unwrap();
    EncodedFeatures::new(data, frames)
}

#[test]
fn test_load_from_file() {
    let store = TemplateStore::from_file(write_templates("load")).unwrap();
    assert_eq!(store.task_ids(), vec!["asr", "xnli"]);
    let xnli = store.get_template("xnli").unwrap();
    assert_eq!(xnli.field_names(), vec!["audio", "hypothesis"]);
    assert_eq!(
        xnli.answer_choices.as_deref(),
        Some(&["Yes".to_string(), "Also".to_string(), "No".to_string()][..])
    );
    assert!(matches!(
        store.get_template("glue"),
        Err(SlmError::UnknownTask(_))
    ));
}

#[test]
fn test_multi_field_roles() {
    let store = TemplateStore::from_file(write_templates("roles")).unwrap();
    let template = store.get_template("xnli").unwrap();
    let resolver = SegmentResolver::new(&ByteTokenizer, &ConstEmbedder);

    let example = Example::new()
        .with_features("audio", audio(6))
        .with_text("hypothesis", "ok");
    let list = resolver.resolve(template, &example).unwrap();

    // "P: " | audio(6) " H: " "ok" | "?"
    assert_eq!(list.prefix_len(), 3);
    assert_eq!(list.encoder_len(), 6 + 4 + 2);
    assert_eq!(list.postfix_len(), 1);
    let roles: Vec<SegmentRole> = list.segments().iter().map(|s| s.role).collect();
    assert_eq!(
        roles,
        vec![
            SegmentRole::Prefix,
            SegmentRole::Encoder,
            SegmentRole::Encoder,
            SegmentRole::Encoder,
            SegmentRole::Postfix,
        ]
    );
    assert_eq!(list.concat().unwrap().dims(), &[16, HIDDEN]);
}

#[test]
fn test_empty_literals_leave_only_features() {
    let store = TemplateStore::from_file(write_templates("asr")).unwrap();
    let resolver = SegmentResolver::new(&ByteTokenizer, &ConstEmbedder);
    let examples = vec![
        Example::new().with_features("audio", audio(4)),
        Example::new().with_text("transcript", "no audio"),
    ];
    let results = resolver.resolve_batch(store.get_template("asr").unwrap(), &examples);

    let first = results[0].as_ref().unwrap();
    assert_eq!((first.prefix_len(), first.encoder_len(), first.postfix_len()), (0, 4, 0));
    assert!(matches!(
        results[1],
        Err(SlmError::MissingField { example: 1, .. })
    ));
}
