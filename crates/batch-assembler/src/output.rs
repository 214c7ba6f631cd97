//! Slicing the target region out of per-position model output.

use candle_core::Tensor;

use slm_core::{SlmError, SlmResult};

use crate::assembler::AssembledBatch;

/// Keep only the positions that predict target tokens.
///
/// `logits` is `[batch, width, vocab]` as returned for `batch`. For example
/// `i` the region is `[target_offset(i), target_offset(i) + target_len(i))`;
/// with left padding this is exactly the last `target_len(i)` positions.
/// Regions are right-padded with zeros to `[batch, max_target_len, vocab]`.
pub fn extract_target_logits(logits: &Tensor, batch: &AssembledBatch) -> SlmResult<Tensor> {
    let (b, width, vocab) = logits.dims3()?;
    if b != batch.batch_size() || width != batch.width() {
        return Err(SlmError::batch_alignment(format!(
            "model output [{b}, {width}, _] does not match batch [{}, {}]",
            batch.batch_size(),
            batch.width()
        )));
    }

    let max_t = batch.max_target_len();
    let mut rows = Vec::with_capacity(b);
    for i in 0..b {
        let offset = batch.target_offset(i);
        let len = batch.target_lengths[i];
        if offset + len > width {
            return Err(SlmError::alignment(
                i,
                format!("target region {offset}..{} exceeds width {width}", offset + len),
            ));
        }
        let region = logits.get(i)?.narrow(0, offset, len)?;
        let region = if len < max_t {
            let fill = Tensor::zeros((max_t - len, vocab), region.dtype(), region.device())?;
            Tensor::cat(&[&region, &fill], 0)?
        } else {
            region
        };
        rows.push(region);
    }
    Ok(Tensor::stack(&rows, 0)?)
}
