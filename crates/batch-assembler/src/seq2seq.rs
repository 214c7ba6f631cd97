//! Separate encoder memory and decoder inputs for encoder-decoder models.
//!
//! Seq2seq backbones never see the conditioning and the target in one
//! sequence, so there is no no-loss region: the conditioning becomes the
//! cross-attention memory and the target is fed to the decoder as ids.

use candle_core::{Device, Tensor};

use prompt_template::ResolvedSegmentList;
use slm_core::{SlmError, SlmResult};

/// Right-padded cross-attention memory.
#[derive(Debug, Clone)]
pub struct PaddedMemory {
    /// `[batch, max_len, hidden]`, zero-filled past each length.
    pub embeds: Tensor,
    /// `[batch, max_len]`, `u8`.
    pub mask: Tensor,
    pub lengths: Vec<usize>,
}

/// Right-padded decoder id sequences.
#[derive(Debug, Clone)]
pub struct PaddedIds {
    /// `[batch, max_len]`, `u32`.
    pub ids: Tensor,
    /// `[batch, max_len]`, `u8`.
    pub mask: Tensor,
    pub lengths: Vec<usize>,
}

fn right_mask(lengths: &[usize], width: usize, device: &Device) -> SlmResult<Tensor> {
    let data: Vec<u8> = lengths
        .iter()
        .flat_map(|&n| std::iter::repeat(1u8).take(n).chain(std::iter::repeat(0u8).take(width - n)))
        .collect();
    Ok(Tensor::from_vec(data, (lengths.len(), width), device)?)
}

/// Concatenate every example's conditioning and right-pad the batch.
pub fn assemble_memory(lists: &[ResolvedSegmentList]) -> SlmResult<PaddedMemory> {
    let first = lists
        .first()
        .ok_or_else(|| SlmError::Config("cannot assemble an empty batch".into()))?;
    let hidden = first.hidden_size();

    let mut rows = Vec::with_capacity(lists.len());
    let mut lengths = Vec::with_capacity(lists.len());
    for (i, list) in lists.iter().enumerate() {
        if list.hidden_size() != hidden {
            return Err(SlmError::alignment(
                i,
                format!("segments have width {}, batch has width {hidden}", list.hidden_size()),
            ));
        }
        let row = list.concat().map_err(|e| match e {
            SlmError::Config(msg) => SlmError::alignment(i, msg),
            other => other,
        })?;
        lengths.push(row.dims2()?.0);
        rows.push(row);
    }

    let width = lengths.iter().copied().max().unwrap_or(0);
    let device = rows[0].device().clone();
    let mut padded = Vec::with_capacity(rows.len());
    for (row, &len) in rows.iter().zip(&lengths) {
        if len < width {
            let fill = Tensor::zeros((width - len, hidden), row.dtype(), &device)?;
            padded.push(Tensor::cat(&[row, &fill], 0)?);
        } else {
            padded.push(row.clone());
        }
    }

    Ok(PaddedMemory {
        embeds: Tensor::stack(&padded, 0)?,
        mask: right_mask(&lengths, width, &device)?,
        lengths,
    })
}

/// Right-pad decoder id sequences with `pad_id`.
pub fn assemble_decoder_inputs(
    sequences: &[Vec<u32>],
    pad_id: u32,
    device: &Device,
) -> SlmResult<PaddedIds> {
    if sequences.is_empty() {
        return Err(SlmError::Config("cannot assemble an empty batch".into()));
    }
    if let Some(i) = sequences.iter().position(|s| s.is_empty()) {
        return Err(SlmError::alignment(i, "decoder input is empty; it must start with a start marker"));
    }
    let lengths: Vec<usize> = sequences.iter().map(Vec::len).collect();
    let width = lengths.iter().copied().max().unwrap_or(0);

    let mut ids = Vec::with_capacity(sequences.len() * width);
    for s in sequences {
        ids.extend_from_slice(s);
        ids.extend(std::iter::repeat(pad_id).take(width - s.len()));
    }

    Ok(PaddedIds {
        ids: Tensor::from_vec(ids, (sequences.len(), width), device)?,
        mask: right_mask(&lengths, width, device)?,
        lengths,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use prompt_template::{ResolvedSegment, SegmentRole, SegmentSource};

    fn list(lens: &[usize]) -> ResolvedSegmentList {
        let roles = [SegmentRole::Prefix, SegmentRole::Encoder, SegmentRole::Postfix];
        let segs = lens
            .iter()
            .zip(roles)
            .map(|(&len, role)| ResolvedSegment {
                role,
                source: SegmentSource::Literal,
                embeddings: (len > 0)
                    .then(|| Tensor::ones((len, 2), candle_core::DType::F32, &Device::Cpu).unwrap()),
                len,
            })
            .collect();
        ResolvedSegmentList::new(segs, 2)
    }

    #[test]
    fn test_memory_is_right_padded() {
        let mem = assemble_memory(&[list(&[1, 3, 1]), list(&[1, 1, 0])]).unwrap();
        assert_eq!(mem.lengths, vec![5, 2]);
        assert_eq!(mem.embeds.dims(), &[2, 5, 2]);
        let mask: Vec<Vec<u8>> = mem.mask.to_vec2().unwrap();
        assert_eq!(mask[1], vec![1, 1, 0, 0, 0]);
        let row: Vec<Vec<f32>> = mem.embeds.get(1).unwrap().to_vec2().unwrap();
        assert_eq!(row[2], vec![0.0, 0.0]);
    }

    #[test]
    fn test_memory_rejects_empty_conditioning() {
        let err = assemble_memory(&[list(&[1, 1, 1]), list(&[0, 0, 0])]).unwrap_err();
        assert_eq!(err.example_index(), Some(1));
    }

    #[test]
    fn test_decoder_inputs() {
        let p = assemble_decoder_inputs(&[vec![1, 4, 5], vec![1]], 0, &Device::Cpu).unwrap();
        let ids: Vec<Vec<u32>> = p.ids.to_vec2().unwrap();
        assert_eq!(ids, vec![vec![1, 4, 5], vec![1, 0, 0]]);
        assert_eq!(p.lengths, vec![3, 1]);
    }
}
