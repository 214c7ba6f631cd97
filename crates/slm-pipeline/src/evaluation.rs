//! Оценка классификации: выход декодера против эталонов.
//!
//! Формат результатов: `{"refs": [...], "hyps": [...]}`, где метки либо
//! строки ответов, либо их индексы в списке вариантов.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use slm_core::{SlmError, SlmResult};

/// Метрика задачи.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Metric {
    #[default]
    Accuracy,
    /// Коэффициент корреляции Мэтьюса (CoLA).
    MatthewsCorrelation,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Accuracy => "accuracy",
            Metric::MatthewsCorrelation => "matthews_correlation",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Индекс гипотезы среди вариантов (без учета регистра).
///
/// Гипотеза вне списка засчитывается как вариант 0.
pub fn answer_index(hyp: &str, choices: &[String]) -> usize {
    let hyp = normalize(hyp);
    choices.iter().position(|c| normalize(c) == hyp).unwrap_or(0)
}

fn check_pair(refs: &[usize], hyps: &[usize]) -> SlmResult<()> {
    if refs.len() != hyps.len() {
        return Err(SlmError::Config(format!(
            "{} references but {} hypotheses",
            refs.len(),
            hyps.len()
        )));
    }
    if refs.is_empty() {
        return Err(SlmError::Config("nothing to evaluate".into()));
    }
    Ok(())
}

pub fn accuracy(refs: &[usize], hyps: &[usize]) -> SlmResult<f64> {
    check_pair(refs, hyps)?;
    let correct = refs.iter().zip(hyps).filter(|(r, h)| r == h).count();
    Ok(correct as f64 / refs.len() as f64)
}

/// Многоклассовый MCC. Вырожденный знаменатель дает 0.
pub fn matthews_correlation(refs: &[usize], hyps: &[usize]) -> SlmResult<f64> {
    check_pair(refs, hyps)?;
    let k = refs.iter().chain(hyps).copied().max().unwrap_or(0) + 1;
    let mut t = vec![0f64; k];
    let mut p = vec![0f64; k];
    let mut correct = 0f64;
    for (&r, &h) in refs.iter().zip(hyps) {
        t[r] += 1.0;
        p[h] += 1.0;
        if r == h {
            correct += 1.0;
        }
    }
    let s = refs.len() as f64;
    let pt: f64 = p.iter().zip(&t).map(|(a, b)| a * b).sum();
    let pp: f64 = p.iter().map(|a| a * a).sum();
    let tt: f64 = t.iter().map(|a| a * a).sum();

    let denom = ((s * s - pp) * (s * s - tt)).sqrt();
    if denom == 0.0 {
        return Ok(0.0);
    }
    Ok((correct * s - pt) / denom)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Label {
    Index(usize),
    Text(String),
}

#[derive(Debug, Clone, Deserialize)]
struct ResultsFile {
    refs: Vec<Label>,
    hyps: Vec<Label>,
}

/// Сводка по одному файлу результатов.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvalReport {
    pub count: usize,
    pub accuracy: f64,
    pub matthews_correlation: f64,
}

impl EvalReport {
    pub fn compute(refs: &[usize], hyps: &[usize]) -> SlmResult<Self> {
        Ok(Self {
            count: refs.len(),
            accuracy: accuracy(refs, hyps)?,
            matthews_correlation: matthews_correlation(refs, hyps)?,
        })
    }

    /// Эталон обязан быть одним из вариантов; гипотеза вне списка считается вариантом 0.
    pub fn from_json_str(json: &str, choices: &[String]) -> SlmResult<Self> {
        if choices.is_empty() {
            return Err(SlmError::Config("answer choices are empty".into()));
        }
        let file: ResultsFile = serde_json::from_str(json)?;

        let refs = file
            .refs
            .iter()
            .enumerate()
            .map(|(i, label)| match label {
                Label::Index(idx) if *idx < choices.len() => Ok(*idx),
                Label::Index(idx) => Err(SlmError::Config(format!(
                    "reference {i}: index {idx} is out of {} choices",
                    choices.len()
                ))),
                Label::Text(text) => choices
                    .iter()
                    .position(|c| normalize(c) == normalize(text))
                    .ok_or_else(|| {
                        SlmError::Config(format!("reference {i}: {text:?} is not an answer choice"))
                    }),
            })
            .collect::<SlmResult<Vec<_>>>()?;

        let hyps: Vec<usize> = file
            .hyps
            .iter()
            .map(|label| match label {
                Label::Index(idx) if *idx < choices.len() => *idx,
                Label::Index(_) => 0,
                Label::Text(text) => answer_index(text, choices),
            })
            .collect();

        Self::compute(&refs, &hyps)
    }

    pub fn from_file(path: impl AsRef<Path>, choices: &[String]) -> SlmResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&content, choices)
    }

    pub fn metric(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Accuracy => self.accuracy,
            Metric::MatthewsCorrelation => self.matthews_correlation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn choices() -> Vec<String> {
        vec!["yes".into(), "no".into(), "maybe".into()]
    }

    #[test]
    fn test_answer_index_case_and_fallback() {
        assert_eq!(answer_index("No", &choices()), 1);
        assert_eq!(answer_index(" MAYBE ", &choices()), 2);
        assert_eq!(answer_index("perhaps", &choices()), 0);
    }

    #[test]
    fn test_accuracy() {
        assert_eq!(accuracy(&[0, 1, 1, 2], &[0, 1, 0, 2]).unwrap(), 0.75);
        assert!(accuracy(&[0, 1], &[0]).is_err());
        assert!(accuracy(&[], &[]).is_err());
    }

    #[test]
    fn test_mcc_binary() {
        // tp=2 tn=1 fp=1 fn=0: (2*1 - 1*0) / sqrt(3*2*1*2)
        let refs = [1, 1, 0, 0];
        let hyps = [1, 1, 1, 0];
        let mcc = matthews_correlation(&refs, &hyps).unwrap();
        let expected = 2.0 / 12f64.sqrt();
        assert!((mcc - expected).abs() < 1e-12, "{mcc}");
    }

    #[test]
    fn test_mcc_perfect_and_constant() {
        assert!((matthews_correlation(&[0, 1, 2], &[0, 1, 2]).unwrap() - 1.0).abs() < 1e-12);
        // одна и та же гипотеза для всех примеров
        assert_eq!(matthews_correlation(&[0, 1, 1], &[1, 1, 1]).unwrap(), 0.0);
    }

    #[test]
    fn test_report_from_json() {
        let json = r#"{"refs": ["Yes", "no", "maybe", 1], "hyps": ["yes", "No", "what", 1]}"#;
        let report = EvalReport::from_json_str(json, &choices()).unwrap();
        assert_eq!(report.count, 4);
        assert_eq!(report.accuracy, 0.75);
        assert_eq!(report.metric(Metric::Accuracy), 0.75);
    }

    #[test]
    fn test_report_rejects_unknown_reference() {
        let json = r#"{"refs": ["nope"], "hyps": ["yes"]}"#;
        let err = EvalReport::from_json_str(json, &choices()).unwrap_err();
        assert!(err.to_string().contains("reference 0"));
    }

    #[test]
    fn test_metric_names() {
        assert_eq!(Metric::MatthewsCorrelation.to_string(), "matthews_correlation");
        assert_eq!(Metric::Accuracy.as_str(), "accuracy");
    }
}
