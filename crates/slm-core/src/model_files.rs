//! Утилиты для поиска файлов модели на диске.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use crate::{SlmError, SlmResult};

#[derive(serde::Deserialize)]
struct SafetensorsIndex {
    weight_map: HashMap<String, String>,
}

/// Разрешить список safetensors-файлов в директории модели.
///
/// Поддерживает:
/// - `model.safetensors` (один файл)
/// - `model.safetensors.index.json` + шарды из `weight_map`
pub fn resolve_safetensors_files(model_dir: impl AsRef<Path>) -> SlmResult<Vec<PathBuf>> {
    let model_dir = model_dir.as_ref();

    let single = model_dir.join("model.safetensors");
    if single.exists() {
        return Ok(vec![single]);
    }

    let index_path = model_dir.join("model.safetensors.index.json");
    if !index_path.exists() {
        return Err(SlmError::Model(format!(
            "не найден ни model.safetensors, ни model.safetensors.index.json в {}",
            model_dir.display()
        )));
    }

    let data = std::fs::read(&index_path)?;
    let idx: SafetensorsIndex = serde_json::from_slice(&data)?;

    // шарды в порядке имен
    let uniq: BTreeSet<&String> = idx.weight_map.values().collect();
    let mut out = Vec::with_capacity(uniq.len());
    for shard in uniq {
        let p = model_dir.join(shard);
        if !p.exists() {
            return Err(SlmError::Model(format!(
                "в index.json указан шард, но файл не найден: {}",
                p.display()
            )));
        }
        out.push(p);
    }

    if out.is_empty() {
        return Err(SlmError::Model(format!(
            "пустой weight_map в {}",
            index_path.display()
        )));
    }
    Ok(out)
}
