//! Token-level loss over the target region.

use candle_core::{DType, Tensor};

use slm_core::{SlmError, SlmResult};

/// Labels for each target input position: `target[1..] + [eos]`.
///
/// Position `j` of the target region predicts `labels[j]`, so labels have the
/// same length as the target (start marker included).
pub fn target_labels(targets: &[Vec<u32>], eos_id: u32) -> Vec<Vec<u32>> {
    targets
        .iter()
        .map(|t| {
            let mut labels: Vec<u32> = t.iter().skip(1).copied().collect();
            if !t.is_empty() {
                labels.push(eos_id);
            }
            labels
        })
        .collect()
}

/// Mean cross-entropy over valid target positions.
///
/// `logits` is `[batch, max_target_len, vocab]` (see
/// [`extract_target_logits`](crate::extract_target_logits)); only the first
/// `labels[i].len()` rows of example `i` contribute.
pub fn masked_cross_entropy(logits: &Tensor, labels: &[Vec<u32>]) -> SlmResult<Tensor> {
    let (b, max_t, _) = logits.dims3()?;
    if b != labels.len() {
        return Err(SlmError::batch_alignment(format!(
            "{} label rows for a batch of {b}",
            labels.len()
        )));
    }

    let mut rows = Vec::with_capacity(b);
    let mut flat: Vec<u32> = Vec::new();
    for (i, l) in labels.iter().enumerate() {
        if l.len() > max_t {
            return Err(SlmError::alignment(
                i,
                format!("{} labels but only {max_t} output positions", l.len()),
            ));
        }
        if l.is_empty() {
            continue;
        }
        rows.push(logits.get(i)?.narrow(0, 0, l.len())?);
        flat.extend_from_slice(l);
    }
    if rows.is_empty() {
        return Err(SlmError::batch_alignment("no target positions to score"));
    }

    let inputs = Tensor::cat(&rows, 0)?.to_dtype(DType::F32)?;
    let targets = Tensor::new(flat.as_slice(), logits.device())?;
    Ok(candle_nn::loss::cross_entropy(&inputs, &targets)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_labels_shift() {
        let labels = target_labels(&[vec![1, 5, 6], vec![1]], 2);
        assert_eq!(labels, vec![vec![5, 6, 2], vec![2]]);
    }

    #[test]
    fn test_loss_ignores_padding_rows() {
        // Example 0 has two valid rows with a confident correct prediction,
        // its third row is padding filled with garbage favouring a wrong class.
        let v = 3;
        let mut data = vec![0f32; 2 * 3 * v];
        let set = |d: &mut Vec<f32>, i: usize, t: usize, k: usize, x: f32| d[(i * 3 + t) * v + k] = x;
        set(&mut data, 0, 0, 1, 50.0);
        set(&mut data, 0, 1, 2, 50.0);
        set(&mut data, 0, 2, 0, 50.0);
        set(&mut data, 1, 0, 0, 50.0);
        let logits = Tensor::from_vec(data, (2, 3, v), &Device::Cpu).unwrap();

        let loss = masked_cross_entropy(&logits, &[vec![1, 2], vec![0]])
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(loss < 1e-3, "loss = {loss}");
    }

    #[test]
    fn test_too_many_labels() {
        let logits = Tensor::zeros((1, 2, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(masked_cross_entropy(&logits, &[vec![1, 2, 3]]).is_err());
    }
}
