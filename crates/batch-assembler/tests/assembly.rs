//! Resolver + assembler end to end, on fake tokenizer/embedding fixtures.

use batch_assembler::{extract_target_logits, AssemblyItem, BatchAssembler};
use candle_core::{DType, Device, Tensor};
use prompt_template::{Segment, SegmentResolver, Template};
use slm_core::{EncodedFeatures, Example, PaddingSide, SlmResult, TextTokenizer, TokenEmbedder};

const HIDDEN: usize = 4;
const PAD: u32 = 0;

/// One token per whitespace-separated word, id = word length.
struct WordTokenizer;

impl TextTokenizer for WordTokenizer {
    fn encode(&self, text: &str) -> SlmResult<Vec<u32>> {
        Ok(text.split_whitespace().map(|w| w.len() as u32).collect())
    }

    fn decode(&self, ids: &[u32]) -> SlmResult<String> {
        Ok(ids.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(" "))
    }
}

/// Row for id `k` is `[k, k, k, k]`.
struct IdEmbedder;

impl TokenEmbedder for IdEmbedder {
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

fn audio(frames: usize) -> EncodedFeatures {
    let data = Tensor::full(-1f32, (frames, HIDDEN), &Device::Cpu).unwrap();
    EncodedFeatures::new(data, frames)
}

fn template() -> Template {
    Template::new(
        "describe",
        vec![
            Segment::literal("Describe: "),
            Segment::field("audio"),
            Segment::literal(". Answer: "),
        ],
    )
}

fn items(examples: &[Example]) -> Vec<AssemblyItem> {
    let resolver = SegmentResolver::new(&WordTokenizer, &IdEmbedder);
    resolver
        .resolve_batch(&template(), examples)
        .into_iter()
        .zip(examples)
        .map(|(r, ex)| AssemblyItem::new(r.unwrap(), ex.target().to_vec()))
        .collect()
}

fn examples() -> Vec<Example> {
    vec![
        Example::new().with_features("audio", audio(5)).with_target(vec![1, 3]),
        Example::new().with_features("audio", audio(2)).with_target(vec![1, 3, 2, 9]),
        Example::new().with_features("audio", audio(7)).with_target(vec![1]),
    ]
}

#[test]
fn test_describe_scenario_lengths() {
    let (k1, k2) = (
        WordTokenizer.encode("Describe: ").unwrap().len(),
        WordTokenizer.encode(". Answer: ").unwrap().len(),
    );
    let batch = BatchAssembler::new(PaddingSide::Right, PAD)
        .assemble(items(&examples()[..1]), &IdEmbedder)
        .unwrap();

    assert_eq!(batch.no_loss_lengths, vec![k1 + 5 + k2 - 1]);
    assert_eq!(batch.total_lengths, vec![k1 + 5 + k2 + 1]);

    // [prefix(k1) | audio(5) | postfix(k2) | target[1..]]
    let rows: Vec<Vec<f32>> = batch.embeds.get(0).unwrap().to_vec2().unwrap();
    let col: Vec<f32> = rows.iter().map(|r| r[0]).collect();
    assert_eq!(col[..k1], vec![9.0]);
    assert!(col[k1..k1 + 5].iter().all(|&v| v == -1.0));
    assert_eq!(col[k1 + 5..], vec![1.0, 7.0, 3.0]);
}

#[test]
fn test_padding_sides_share_lengths_and_mirror_masks() {
    let right = BatchAssembler::new(PaddingSide::Right, PAD)
        .assemble(items(&examples()), &IdEmbedder)
        .unwrap();
    let left = BatchAssembler::new(PaddingSide::Left, PAD)
        .assemble(items(&examples()), &IdEmbedder)
        .unwrap();

    assert_eq!(right.no_loss_lengths, left.no_loss_lengths);
    assert_eq!(right.total_lengths, left.total_lengths);
    assert_eq!(right.width(), left.width());

    let r = right.mask_rows().unwrap();
    let l = left.mask_rows().unwrap();
    assert_ne!(r, l);
    for (row_r, row_l) in r.iter().zip(&l) {
        let mut reversed = row_l.clone();
        reversed.reverse();
        assert_eq!(row_r, &reversed);
    }
}

#[test]
fn test_mask_is_one_contiguous_run_of_total_length() {
    for side in [PaddingSide::Left, PaddingSide::Right] {
        let batch = BatchAssembler::new(side, PAD)
            .assemble(items(&examples()), &IdEmbedder)
            .unwrap();
        for (i, row) in batch.mask_rows().unwrap().iter().enumerate() {
            let ones: Vec<usize> = (0..row.len()).filter(|&p| row[p] == 1).collect();
            assert_eq!(ones.len(), batch.total_lengths[i]);
            assert_eq!(ones.last().unwrap() - ones[0] + 1, ones.len(), "gap in mask row {i}");
            assert_eq!(ones[0], batch.pad_before(i));
        }
    }
}

#[test]
fn test_assembly_is_idempotent() {
    let assembler = BatchAssembler::new(PaddingSide::Left, PAD);
    let a = assembler.assemble(items(&examples()), &IdEmbedder).unwrap();
    let b = assembler.assemble(items(&examples()), &IdEmbedder).unwrap();

    let ea: Vec<Vec<Vec<f32>>> = a.embeds.to_vec3().unwrap();
    let eb: Vec<Vec<Vec<f32>>> = b.embeds.to_vec3().unwrap();
    assert_eq!(ea, eb);
    assert_eq!(a.mask_rows().unwrap(), b.mask_rows().unwrap());
}

#[test]
fn test_target_region_matches_across_padding_sides() {
    // Logits that echo the input embedding: the target region must then hold
    // the same positions whichever side was padded.
    let extract = |side| {
        let batch = BatchAssembler::new(side, PAD)
            .assemble(items(&examples()), &IdEmbedder)
            .unwrap();
        let logits = batch.embeds.clone();
        let region = extract_target_logits(&logits, &batch).unwrap();
        region.to_dtype(DType::F32).unwrap().to_vec3::<f32>().unwrap()
    };
    assert_eq!(extract(PaddingSide::Left), extract(PaddingSide::Right));
}

#[test]
fn test_zero_length_encoder_single_example() {
    // one-word prefix and postfix, audio field with no valid frames
    let template = Template::new(
        "bare",
        vec![Segment::literal("P"), Segment::field("audio"), Segment::literal("Q")],
    );
    let example = Example::new()
        .with_features("audio", EncodedFeatures::new(audio(3).data, 0))
        .with_target(vec![1, 3, 2]);
    let resolved = SegmentResolver::new(&WordTokenizer, &IdEmbedder)
        .resolve(&template, &example)
        .unwrap();
    assert_eq!(
        (resolved.prefix_len(), resolved.encoder_len(), resolved.postfix_len()),
        (1, 0, 1)
    );

    for side in [PaddingSide::Left, PaddingSide::Right] {
        let item = AssemblyItem::new(resolved.clone(), example.target().to_vec());
        let batch = BatchAssembler::new(side, PAD)
            .assemble(vec![item], &IdEmbedder)
            .unwrap();

        assert_eq!(batch.no_loss_lengths, vec![1]);
        assert_eq!(batch.total_lengths, vec![4]);
        assert_eq!(batch.width(), 4);
        assert_eq!(batch.pad_before(0), 0);

        let row = batch.embeds.get(0).unwrap();
        assert_eq!(row.dims(), &[4, HIDDEN]);
        let col: Vec<f32> = row.to_vec2::<f32>().unwrap().iter().map(|r| r[0]).collect();
        assert_eq!(col, vec![1.0, 1.0, 3.0, 2.0]);
        assert_eq!(batch.mask_rows().unwrap(), vec![vec![1, 1, 1, 1]]);
    }
}
