//! Assembly of the padded embedding batch and its validity mask.

use candle_core::Tensor;
use tracing::debug;

use prompt_template::ResolvedSegmentList;
use slm_core::{ModelInput, PaddingSide, SlmError, SlmResult, TokenEmbedder};

use crate::lengths::LengthPlan;

/// One example handed to the assembler: resolved conditioning segments plus
/// target ids `[<sos>, y1, ..., yn]`.
///
/// Consumed by [`BatchAssembler::assemble`]; nothing keeps it afterwards.
#[derive(Debug, Clone)]
pub struct AssemblyItem {
    pub segments: ResolvedSegmentList,
    pub target: Vec<u32>,
}

impl AssemblyItem {
    pub fn new(segments: ResolvedSegmentList, target: Vec<u32>) -> Self {
        Self { segments, target }
    }
}

/// Padded batch ready for a forward call.
#[derive(Debug, Clone)]
pub struct AssembledBatch {
    /// `[batch, width, hidden]`.
    pub embeds: Tensor,
    /// `[batch, width]`, `u8`: 1 for real positions, 0 for padding.
    pub mask: Tensor,
    pub no_loss_lengths: Vec<usize>,
    pub total_lengths: Vec<usize>,
    /// Including the start marker.
    pub target_lengths: Vec<usize>,
    pub padding_side: PaddingSide,
}

impl AssembledBatch {
    pub fn batch_size(&self) -> usize {
        self.total_lengths.len()
    }

    /// `max_i total_length[i]`.
    pub fn width(&self) -> usize {
        self.total_lengths.iter().copied().max().unwrap_or(0)
    }

    pub fn max_target_len(&self) -> usize {
        self.target_lengths.iter().copied().max().unwrap_or(0)
    }

    /// Number of pad positions before the first real position of example `i`.
    pub fn pad_before(&self, i: usize) -> usize {
        match self.padding_side {
            PaddingSide::Left => self.width() - self.total_lengths[i],
            PaddingSide::Right => 0,
        }
    }

    /// Absolute position whose output predicts `target[1]` of example `i`.
    pub fn target_offset(&self, i: usize) -> usize {
        self.pad_before(i) + self.no_loss_lengths[i]
    }

    /// Mask as host rows.
    pub fn mask_rows(&self) -> SlmResult<Vec<Vec<u8>>> {
        Ok(self.mask.to_vec2::<u8>()?)
    }

    pub fn to_model_input(&self) -> ModelInput {
        ModelInput::new(self.embeds.clone(), self.mask.clone())
    }
}

/// Builds [`AssembledBatch`]es for one padding convention.
#[derive(Debug, Clone)]
pub struct BatchAssembler {
    padding_side: PaddingSide,
    pad_token_id: u32,
    max_length: Option<usize>,
}

impl BatchAssembler {
    pub fn new(padding_side: PaddingSide, pad_token_id: u32) -> Self {
        Self {
            padding_side,
            pad_token_id,
            max_length: None,
        }
    }

    /// Reject batches wider than `max_length` instead of truncating them.
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }

    pub fn padding_side(&self) -> PaddingSide {
        self.padding_side
    }

    pub fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }

    /// Build the padded batch.
    ///
    /// `embedder` supplies the target token embeddings and the pad embedding;
    /// it must be the same table that embedded the literal segments.
    pub fn assemble(
        &self,
        items: Vec<AssemblyItem>,
        embedder: &dyn TokenEmbedder,
    ) -> SlmResult<AssembledBatch> {
        if items.is_empty() {
            return Err(SlmError::Config("cannot assemble an empty batch".into()));
        }
        let hidden = embedder.hidden_size();

        // Lengths first: they do not depend on the padding side.
        let mut no_loss_lengths = Vec::with_capacity(items.len());
        let mut total_lengths = Vec::with_capacity(items.len());
        let mut target_lengths = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            if item.segments.hidden_size() != hidden {
                return Err(SlmError::alignment(
                    i,
                    format!(
                        "segments have width {}, embedder has width {hidden}",
                        item.segments.hidden_size()
                    ),
                ));
            }
            let plan = LengthPlan::from_segments(&item.segments, item.target.len());
            no_loss_lengths.push(plan.no_loss_length(i)?);
            total_lengths.push(plan.total_length(i)?);
            target_lengths.push(plan.target);
        }

        let width = total_lengths.iter().copied().max().unwrap_or(0);
        if let Some(cap) = self.max_length {
            if width > cap {
                let (worst, _) = total_lengths
                    .iter()
                    .enumerate()
                    .max_by_key(|(_, len)| **len)
                    .unwrap_or((0, &0));
                return Err(SlmError::alignment(
                    worst,
                    format!("total_length {width} exceeds model capacity {cap}"),
                ));
            }
        }

        let pad_row = embedder.embed_ids(&[self.pad_token_id])?;
        let dtype = pad_row.dtype();
        let device = pad_row.device().clone();

        let mut rows: Vec<Tensor> = Vec::with_capacity(items.len());
        let mut mask: Vec<u8> = Vec::with_capacity(items.len() * width);

        for (i, item) in items.iter().enumerate() {
            let total = total_lengths[i];
            let n_pad = width - total;

            let mut parts: Vec<Tensor> = Vec::with_capacity(item.segments.segments().len() + 2);
            for part in item.segments.embedding_parts() {
                parts.push(part.to_dtype(dtype)?);
            }
            if item.target.len() > 1 {
                parts.push(embedder.embed_ids(&item.target[1..])?.to_dtype(dtype)?);
            }

            let real: usize = parts
                .iter()
                .map(|p| p.dims2().map(|(n, _)| n))
                .sum::<candle_core::Result<usize>>()?;
            if real != total {
                return Err(SlmError::alignment(
                    i,
                    format!("assembled {real} real positions, bookkeeping expects {total}"),
                ));
            }

            if n_pad > 0 {
                let pad = pad_row.repeat((n_pad, 1))?;
                match self.padding_side {
                    PaddingSide::Left => parts.insert(0, pad),
                    PaddingSide::Right => parts.push(pad),
                }
            }

            let row = Tensor::cat(&parts, 0)?;
            if row.dims() != [width, hidden] {
                return Err(SlmError::alignment(
                    i,
                    format!(
                        "row shape {:?} does not match batch shape [{width}, {hidden}]",
                        row.dims()
                    ),
                ));
            }
            rows.push(row);

            let (valid, pad) = (std::iter::repeat(1u8).take(total), std::iter::repeat(0u8).take(n_pad));
            match self.padding_side {
                PaddingSide::Left => mask.extend(pad.chain(valid)),
                PaddingSide::Right => mask.extend(valid.chain(pad)),
            }
        }

        let embeds = Tensor::stack(&rows, 0)?;
        let mask = Tensor::from_vec(mask, (items.len(), width), &device)?;

        debug!(
            "assemble: batch={} width={} padding={} no_loss={:?}",
            items.len(),
            width,
            self.padding_side,
            no_loss_lengths
        );

        Ok(AssembledBatch {
            embeds,
            mask,
            no_loss_lengths,
            total_lengths,
            target_lengths,
            padding_side: self.padding_side,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use prompt_template::{ResolvedSegment, SegmentRole, SegmentSource};

    const HIDDEN: usize = 3;
    const PAD: u32 = 0;

    struct ConstEmbedder;

    impl TokenEmbedder for ConstEmbedder {
        fn hidden_size(&self) -> usize {
            HIDDEN
        }

        fn embed_ids(&self, ids: &[u32]) -> SlmResult<Tensor> {
            let data: Vec<f32> = ids
                .iter()
                .flat_map(|&id| std::iter::repeat(id as f32).take(HIDDEN))
                .collect();
            Ok(Tensor::from_vec(data, (ids.len(), HIDDEN), &Device::Cpu)?)
        }
    }

    fn segment(role: SegmentRole, value: f32, len: usize) -> ResolvedSegment {
        let embeddings = (len > 0).then(|| {
            Tensor::from_vec(vec![value; len * HIDDEN], (len, HIDDEN), &Device::Cpu).unwrap()
        });
        ResolvedSegment {
            role,
            source: SegmentSource::Literal,
            embeddings,
            len,
        }
    }

    fn item(prefix: usize, encoder: usize, postfix: usize, target: Vec<u32>) -> AssemblyItem {
        let segs = vec![
            segment(SegmentRole::Prefix, 10.0, prefix),
            segment(SegmentRole::Encoder, 20.0, encoder),
            segment(SegmentRole::Postfix, 30.0, postfix),
        ];
        AssemblyItem::new(ResolvedSegmentList::new(segs, HIDDEN), target)
    }

    fn first_column(batch: &AssembledBatch, i: usize) -> Vec<f32> {
        let rows: Vec<Vec<f32>> = batch.embeds.get(i).unwrap().to_vec2().unwrap();
        rows.into_iter().map(|r| r[0]).collect()
    }

    #[test]
    fn test_right_padding_layout() {
        let assembler = BatchAssembler::new(PaddingSide::Right, PAD);
        let batch = assembler
            .assemble(
                vec![item(1, 2, 1, vec![1, 5, 6]), item(1, 1, 1, vec![1, 7])],
                &ConstEmbedder,
            )
            .unwrap();

        assert_eq!(batch.no_loss_lengths, vec![3, 2]);
        assert_eq!(batch.total_lengths, vec![6, 4]);
        assert_eq!(batch.embeds.dims(), &[2, 6, HIDDEN]);

        assert_eq!(first_column(&batch, 0), vec![10.0, 20.0, 20.0, 30.0, 5.0, 6.0]);
        assert_eq!(first_column(&batch, 1), vec![10.0, 20.0, 30.0, 7.0, 0.0, 0.0]);
        assert_eq!(
            batch.mask_rows().unwrap(),
            vec![vec![1, 1, 1, 1, 1, 1], vec![1, 1, 1, 1, 0, 0]]
        );
        assert_eq!(batch.target_offset(1), 2);
    }

    #[test]
    fn test_left_padding_layout() {
        let assembler = BatchAssembler::new(PaddingSide::Left, PAD);
        let batch = assembler
            .assemble(
                vec![item(1, 2, 1, vec![1, 5, 6]), item(1, 1, 1, vec![1, 7])],
                &ConstEmbedder,
            )
            .unwrap();

        assert_eq!(first_column(&batch, 1), vec![0.0, 0.0, 10.0, 20.0, 30.0, 7.0]);
        assert_eq!(
            batch.mask_rows().unwrap(),
            vec![vec![1, 1, 1, 1, 1, 1], vec![0, 0, 1, 1, 1, 1]]
        );
        assert_eq!(batch.pad_before(1), 2);
        assert_eq!(batch.target_offset(1), 4);
    }

    #[test]
    fn test_capacity_exceeded() {
        let assembler = BatchAssembler::new(PaddingSide::Right, PAD).with_max_length(3);
        let err = assembler
            .assemble(vec![item(1, 1, 1, vec![1]), item(2, 2, 2, vec![1, 2])], &ConstEmbedder)
            .unwrap_err();
        assert!(matches!(err, SlmError::Alignment { example: Some(1), .. }));
    }

    #[test]
    fn test_empty_conditioning_fails_fast() {
        let assembler = BatchAssembler::new(PaddingSide::Right, PAD);
        let err = assembler
            .assemble(vec![item(1, 1, 1, vec![1]), item(0, 0, 0, vec![1, 2])], &ConstEmbedder)
            .unwrap_err();
        assert!(err.to_string().contains("no_loss_length negative for example 1"));
    }

    #[test]
    fn test_width_mismatch_is_alignment_error() {
        let assembler = BatchAssembler::new(PaddingSide::Right, PAD);
        let bad = AssemblyItem::new(
            ResolvedSegmentList::new(vec![segment(SegmentRole::Prefix, 1.0, 1)], HIDDEN + 1),
            vec![1],
        );
        let err = assembler.assemble(vec![bad], &ConstEmbedder).unwrap_err();
        assert!(matches!(err, SlmError::Alignment { example: Some(0), .. }));
    }

    #[test]
    fn test_empty_batch_rejected() {
        let assembler = BatchAssembler::new(PaddingSide::Right, PAD);
        assert!(assembler.assemble(Vec::new(), &ConstEmbedder).is_err());
    }
}
