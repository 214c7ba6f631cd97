//! Конвейер: шаблон -> сегменты -> батч -> генеративная модель.

use candle_core::{DType, Tensor};
use tracing::{debug, info, warn};

use batch_assembler::{
    assemble_decoder_inputs, assemble_memory, extract_target_logits, masked_cross_entropy,
    target_labels, AssembledBatch, AssemblyItem, BatchAssembler,
};
use constrained_decoder::{ClassificationResult, ConstrainedDecoder};
use prompt_template::{ResolvedSegmentList, SegmentResolver, Template, TemplateStore};
use slm_core::{
    DecoderKind, Example, GenerativeModel, ModelInput, SlmError, SlmResult, TextTokenizer,
};

/// Что делать с примером, у которого не разрешилось поле шаблона.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolutionPolicy {
    /// Выбросить пример и собрать батч из остальных.
    DropExample,
    /// Провалить весь батч.
    #[default]
    FailBatch,
}

/// Собранный батч и индексы исходных примеров, которые в него попали.
#[derive(Debug, Clone)]
pub struct PipelineBatch {
    pub batch: AssembledBatch,
    pub kept: Vec<usize>,
}

/// Логиты целевой области для функции потерь.
#[derive(Debug, Clone)]
pub struct TrainingOutput {
    /// `[batch, max_target_len, vocab]`; строки за пределами `labels[i]`
    /// в потерю не входят.
    pub logits: Tensor,
    /// `target[1..] + [eos]` для каждого оставшегося примера.
    pub labels: Vec<Vec<u32>>,
    pub kept: Vec<usize>,
}

/// Задача для шаблона фиксированного промпта.
const FIXED_PROMPT_TASK: &str = "fixed-prompt";

/// Speech LM pipeline поверх одной генеративной модели.
///
/// `tokenizer` обязан быть тем же словарем, что и таблица эмбеддингов модели:
/// им токенизируются литералы шаблонов и кандидаты ответов.
pub struct SpeechLmPipeline<M, T> {
    templates: TemplateStore,
    fallback: Option<Template>,
    model: M,
    tokenizer: T,
    max_length: Option<usize>,
}

impl<M: GenerativeModel, T: TextTokenizer> SpeechLmPipeline<M, T> {
    pub fn new(templates: TemplateStore, model: M, tokenizer: T) -> Self {
        Self {
            templates,
            fallback: None,
            model,
            tokenizer,
            max_length: None,
        }
    }

    /// Шаблон `[prefix, %field, postfix]` для задач, которых нет в хранилище.
    pub fn with_fixed_prompt(
        mut self,
        prefix: impl Into<String>,
        field: impl Into<String>,
        postfix: impl Into<String>,
    ) -> SlmResult<Self> {
        let template = Template::from_prefix_postfix(FIXED_PROMPT_TASK, prefix, field, postfix);
        template.validate()?;
        self.fallback = Some(template);
        Ok(self)
    }

    /// Максимальная ширина батча (емкость модели).
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = Some(max_length);
        self
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn tokenizer(&self) -> &T {
        &self.tokenizer
    }

    pub fn templates(&self) -> &TemplateStore {
        &self.templates
    }

    /// Шаблон задачи; неизвестная задача уходит в фиксированный промпт, если он задан.
    pub fn template(&self, task_id: &str) -> SlmResult<&Template> {
        match (self.templates.get_template(task_id), &self.fallback) {
            (Err(SlmError::UnknownTask(_)), Some(fallback)) => {
                debug!("задача '{task_id}' не найдена, используется фиксированный промпт");
                Ok(fallback)
            }
            (result, _) => result,
        }
    }

    fn resolve(
        &self,
        template: &Template,
        examples: &[Example],
        policy: ResolutionPolicy,
    ) -> SlmResult<(Vec<ResolvedSegmentList>, Vec<usize>)> {
        if examples.is_empty() {
            return Err(SlmError::Config("cannot assemble an empty batch".into()));
        }
        let resolver = SegmentResolver::new(&self.tokenizer, &self.model);
        let mut lists = Vec::with_capacity(examples.len());
        let mut kept = Vec::with_capacity(examples.len());
        for (i, result) in resolver.resolve_batch(template, examples).into_iter().enumerate() {
            match result {
                Ok(list) => {
                    lists.push(list);
                    kept.push(i);
                }
                Err(e) if e.is_recoverable() && policy == ResolutionPolicy::DropExample => {
                    warn!(
                        "пример {i} ({}) выброшен из батча: {e}",
                        examples[i].id.as_deref().unwrap_or("-")
                    );
                }
                Err(e) => return Err(e),
            }
        }
        if lists.is_empty() {
            return Err(SlmError::Config(format!(
                "all {} examples of the batch were dropped",
                examples.len()
            )));
        }
        Ok((lists, kept))
    }

    fn targets(examples: &[Example], kept: &[usize]) -> Vec<Vec<u32>> {
        kept.iter().map(|&i| examples[i].target().to_vec()).collect()
    }

    /// Собрать батч для decoder-only модели.
    ///
    /// Seq2seq модели не склеивают условие с целью, для них используется
    /// [`training_logits`](Self::training_logits).
    pub fn assemble_batch(
        &self,
        task_id: &str,
        examples: &[Example],
        policy: ResolutionPolicy,
    ) -> SlmResult<PipelineBatch> {
        let kind = self.model.decoder_kind();
        if !kind.concatenates_conditioning() {
            return Err(SlmError::Config(format!(
                "{kind} model takes the conditioning as encoder memory, not as one assembled sequence"
            )));
        }
        let template = self.template(task_id)?;
        let (lists, kept) = self.resolve(template, examples, policy)?;
        let items = lists
            .into_iter()
            .zip(Self::targets(examples, &kept))
            .map(|(segments, target)| AssemblyItem::new(segments, target))
            .collect();

        let mut assembler = BatchAssembler::new(self.model.padding_side(), self.model.pad_token_id());
        if let Some(max_length) = self.max_length {
            assembler = assembler.with_max_length(max_length);
        }
        let batch = assembler.assemble(items, &self.model)?;
        info!(
            "батч '{task_id}': {} из {} примеров, ширина {}, паддинг {}",
            batch.batch_size(),
            examples.len(),
            batch.width(),
            batch.padding_side
        );
        Ok(PipelineBatch { batch, kept })
    }

    /// Прямой проход и логиты целевой области каждого примера.
    pub fn training_logits(
        &self,
        task_id: &str,
        examples: &[Example],
        policy: ResolutionPolicy,
    ) -> SlmResult<TrainingOutput> {
        let eos = self.model.eos_token_id().ok_or_else(|| {
            SlmError::Config("model has no eos_token_id, target labels cannot be built".into())
        })?;

        if self.model.decoder_kind() == DecoderKind::Seq2Seq {
            return self.seq2seq_logits(task_id, examples, policy, eos);
        }

        let PipelineBatch { batch, kept } = self.assemble_batch(task_id, examples, policy)?;
        let logits = self.model.forward(&batch.to_model_input())?;
        let logits = extract_target_logits(&logits, &batch)?;
        let targets = Self::targets(examples, &kept);
        Ok(TrainingOutput {
            logits,
            labels: target_labels(&targets, eos),
            kept,
        })
    }

    fn seq2seq_logits(
        &self,
        task_id: &str,
        examples: &[Example],
        policy: ResolutionPolicy,
        eos: u32,
    ) -> SlmResult<TrainingOutput> {
        let template = self.template(task_id)?;
        let (lists, kept) = self.resolve(template, examples, policy)?;
        let memory = assemble_memory(&lists)?;
        let targets = Self::targets(examples, &kept);
        let decoder = assemble_decoder_inputs(
            &targets,
            self.model.pad_token_id(),
            memory.embeds.device(),
        )?;
        debug!(
            "seq2seq батч '{task_id}': память {:?}, вход декодера {:?}",
            memory.embeds.dims(),
            decoder.ids.dims()
        );

        let input = ModelInput::new(memory.embeds, memory.mask)
            .with_decoder_inputs(decoder.ids, decoder.mask);
        let logits = self.model.forward(&input)?;
        Ok(TrainingOutput {
            logits,
            labels: target_labels(&targets, eos),
            kept,
        })
    }

    /// Средняя кросс-энтропия по целевым позициям батча.
    pub fn training_loss(
        &self,
        task_id: &str,
        examples: &[Example],
        policy: ResolutionPolicy,
    ) -> SlmResult<Tensor> {
        let out = self.training_logits(task_id, examples, policy)?;
        masked_cross_entropy(&out.logits, &out.labels)
    }

    /// Выбрать ответ для одного примера.
    ///
    /// Без явного `answers` берутся `answer_choices` шаблона задачи.
    pub fn classify(
        &self,
        task_id: &str,
        example: &Example,
        answers: Option<&[String]>,
    ) -> SlmResult<ClassificationResult> {
        let template = self.template(task_id)?;
        let answers = match answers {
            Some(answers) => answers,
            None => template.answer_choices.as_deref().ok_or_else(|| {
                SlmError::Config(format!(
                    "task '{task_id}' has no answer choices, pass the answers explicitly"
                ))
            })?,
        };
        if answers.is_empty() {
            return Err(SlmError::EmptyAnswerSet);
        }

        let resolver = SegmentResolver::new(&self.tokenizer, &self.model);
        let conditioning = resolver.resolve(template, example)?.concat()?.unsqueeze(0)?;
        let mask = Tensor::ones((1, conditioning.dim(1)?), DType::U8, conditioning.device())?;

        ConstrainedDecoder::new(&self.tokenizer).decode_scored(
            &self.model,
            &conditioning,
            &mask,
            answers,
        )
    }
}
