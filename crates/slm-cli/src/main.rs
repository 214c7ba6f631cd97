//! speechlm
//!
//! CLI для классификации речи генеративной языковой моделью: шаблоны промптов,
//! ограниченный выбор ответа и оценка результатов.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::{Device, Tensor};
use lm_adapter::{AdapterConfig, ModelAdapter, WeightDType};
use prompt_template::{Segment, TemplateStore};
use slm_core::{DecoderKind, Example, FeatureEncoder, PaddingSide};
use slm_pipeline::{EvalReport, Metric, SpeechLmPipeline};

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderKindArg {
    /// Decoder-only модель (по умолчанию)
    Causal,
    /// Encoder-decoder модель
    Seq2seq,
    /// Decoder-only модель с обученным префиксом
    PrefixTuned,
}

impl From<DecoderKindArg> for DecoderKind {
    fn from(v: DecoderKindArg) -> Self {
        match v {
            DecoderKindArg::Causal => DecoderKind::Causal,
            DecoderKindArg::Seq2seq => DecoderKind::Seq2Seq,
            DecoderKindArg::PrefixTuned => DecoderKind::PrefixTuned,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum PaddingSideArg {
    Left,
    Right,
}

impl From<PaddingSideArg> for PaddingSide {
    fn from(v: PaddingSideArg) -> Self {
        match v {
            PaddingSideArg::Left => PaddingSide::Left,
            PaddingSideArg::Right => PaddingSide::Right,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum DTypeArg {
    F32,
    F16,
    Bf16,
}

impl From<DTypeArg> for WeightDType {
    fn from(v: DTypeArg) -> Self {
        match v {
            DTypeArg::F32 => WeightDType::F32,
            DTypeArg::F16 => WeightDType::F16,
            DTypeArg::Bf16 => WeightDType::Bf16,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum MetricArg {
    Accuracy,
    Mcc,
}

impl From<MetricArg> for Metric {
    fn from(v: MetricArg) -> Self {
        match v {
            MetricArg::Accuracy => Metric::Accuracy,
            MetricArg::Mcc => Metric::MatthewsCorrelation,
        }
    }
}

#[derive(Parser)]
#[command(name = "speechlm")]
#[command(author, version, about = "Speech-conditioned LM prompting and closed-set classification", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Показать задачи и сегменты файла шаблонов
    Templates {
        /// JSON-файл шаблонов (`{"tasks": {...}}`)
        #[arg(long)]
        templates: PathBuf,
    },

    /// Выбрать ответ для одного высказывания
    Classify {
        /// Директория модели (config.json, *.safetensors, tokenizer.json)
        #[arg(long)]
        model: PathBuf,

        /// JSON-конфиг адаптера; флаги ниже переопределяют его поля
        #[arg(long)]
        config: Option<PathBuf>,

        /// Стратегия декодирования
        #[arg(long, value_enum)]
        decoder_kind: Option<DecoderKindArg>,

        /// Сторона паддинга (по умолчанию из токенайзера)
        #[arg(long, value_enum)]
        padding_side: Option<PaddingSideArg>,

        /// Точность весов
        #[arg(long, value_enum)]
        dtype: Option<DTypeArg>,

        /// JSON-файл шаблонов; без него используется prefix/postfix из конфига
        #[arg(long)]
        templates: Option<PathBuf>,

        /// Идентификатор задачи
        #[arg(long)]
        task: String,

        /// Признаки энкодера в safetensors (`[frames, dim]`)
        #[arg(long)]
        features: PathBuf,

        /// Имя тензора в файле признаков (если в файле их несколько)
        #[arg(long)]
        feature_name: Option<String>,

        /// Поле примера, в которое кладутся признаки
        #[arg(long, default_value = "audio")]
        field: String,

        /// Текстовые поля примера: NAME=VALUE (можно повторять)
        #[arg(long = "text")]
        texts: Vec<String>,

        /// Варианты ответа через запятую (по умолчанию из шаблона)
        #[arg(long)]
        answers: Option<String>,

        /// Device to use (cpu, metal, cuda)
        #[arg(long, default_value = "cpu")]
        device: String,
    },

    /// Посчитать метрики по файлу `{"refs": [...], "hyps": [...]}`
    Evaluate {
        /// Файл результатов
        #[arg(long)]
        results: PathBuf,

        /// Варианты ответа через запятую, в порядке индексов
        #[arg(long)]
        choices: String,

        /// Печатать только одну метрику
        #[arg(long, value_enum)]
        metric: Option<MetricArg>,

        /// Вывод в JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Templates { templates } => run_templates(&templates),
        Commands::Classify {
            model,
            config,
            decoder_kind,
            padding_side,
            dtype,
            templates,
            task,
            features,
            feature_name,
            field,
            texts,
            answers,
            device,
        } => {
            let mut cfg = match config {
                Some(path) => AdapterConfig::from_file(&path)
                    .with_context(|| format!("не удалось прочитать конфиг {}", path.display()))?,
                None => AdapterConfig::new(&model, DecoderKind::Causal),
            };
            cfg.model_dir = model;
            if let Some(kind) = decoder_kind {
                cfg.decoder_kind = kind.into();
            }
            if let Some(side) = padding_side {
                cfg = cfg.with_padding_side(side.into());
            }
            if let Some(dtype) = dtype {
                cfg = cfg.with_dtype(dtype.into());
            }

            run_classify(ClassifyArgs {
                config: cfg,
                templates,
                task,
                features,
                feature_name,
                field,
                texts,
                answers: answers.map(|a| split_list(&a)),
                device,
            })
        }
        Commands::Evaluate {
            results,
            choices,
            metric,
            json,
        } => run_evaluate(&results, &split_list(&choices), metric.map(Into::into), json),
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|x| !x.is_empty())
        .map(str::to_string)
        .collect()
}

fn run_templates(path: &Path) -> Result<()> {
    let store = TemplateStore::from_file(path)?;
    for task_id in store.task_ids() {
        let template = store.get_template(task_id)?;
        let segments: Vec<String> = template
            .segments
            .iter()
            .map(|s| match s {
                Segment::Literal(text) => format!("{text:?}"),
                Segment::FieldRef(name) => format!("%{name}"),
            })
            .collect();
        println!("{task_id}: {}", segments.join(" "));
        if let Some(choices) = &template.answer_choices {
            println!("    answers: {}", choices.join(" | "));
        }
    }
    Ok(())
}

struct ClassifyArgs {
    config: AdapterConfig,
    templates: Option<PathBuf>,
    task: String,
    features: PathBuf,
    feature_name: Option<String>,
    field: String,
    texts: Vec<String>,
    answers: Option<Vec<String>>,
    device: String,
}

fn run_classify(args: ClassifyArgs) -> Result<()> {
    let device = create_device(&args.device)?;
    let dtype = args.config.dtype.as_dtype();
    let prompt = (args.config.prefix.clone(), args.config.postfix.clone());

    let start = Instant::now();
    let mut adapter = ModelAdapter::configure(args.config)?;
    adapter.load(&device)?;
    eprintln!("Модель загружена за {:.2}s", start.elapsed().as_secs_f32());

    let frames = load_features(&args.features, args.feature_name.as_deref(), &device)?
        .to_dtype(dtype)?;
    let valid_len = frames.dims2()?.0;
    let encoded = adapter.feature_encoder()?.encode(&frames, valid_len)?;

    let mut example = Example::new()
        .with_id(args.features.display().to_string())
        .with_features(args.field.clone(), encoded);
    for kv in &args.texts {
        let (name, value) = kv
            .split_once('=')
            .with_context(|| format!("--text ожидает NAME=VALUE, получено {kv:?}"))?;
        example = example.with_text(name, value);
    }

    let store = match &args.templates {
        Some(path) => TemplateStore::from_file(path)?,
        None => TemplateStore::default(),
    };
    let tokenizer = adapter.tokenizer()?.clone();
    let mut pipeline = SpeechLmPipeline::new(store, adapter, tokenizer);
    if !prompt.0.is_empty() || !prompt.1.is_empty() {
        pipeline = pipeline.with_fixed_prompt(prompt.0, args.field, prompt.1)?;
    } else if args.templates.is_none() {
        bail!("нужен --templates или prefix/postfix в конфиге адаптера");
    }

    let start = Instant::now();
    let result = pipeline.classify(&args.task, &example, args.answers.as_deref())?;
    eprintln!("Классификация за {:.2}s", start.elapsed().as_secs_f32());
    println!("{}", result.answer);
    Ok(())
}

/// Тензор признаков `[frames, dim]` из safetensors.
fn load_features(path: &Path, name: Option<&str>, device: &Device) -> Result<Tensor> {
    let mut tensors = candle_core::safetensors::load(path, device)
        .with_context(|| format!("не удалось прочитать признаки {}", path.display()))?;
    let tensor = match name {
        Some(name) => tensors
            .remove(name)
            .with_context(|| format!("в {} нет тензора '{name}'", path.display()))?,
        None if tensors.len() == 1 => tensors
            .into_values()
            .next()
            .context("файл признаков пуст")?,
        None => {
            let mut names: Vec<_> = tensors.keys().cloned().collect();
            names.sort();
            bail!(
                "в {} несколько тензоров ({}), укажите --feature-name",
                path.display(),
                names.join(", ")
            );
        }
    };
    // [1, frames, dim] -> [frames, dim]
    let tensor = if tensor.rank() == 3 && tensor.dim(0)? == 1 {
        tensor.squeeze(0)?
    } else {
        tensor
    };
    if tensor.rank() != 2 {
        bail!("признаки должны иметь форму [frames, dim], получено {:?}", tensor.dims());
    }
    Ok(tensor)
}

fn run_evaluate(
    results: &Path,
    choices: &[String],
    metric: Option<Metric>,
    json: bool,
) -> Result<()> {
    let report = EvalReport::from_file(results, choices)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    match metric {
        Some(m) => println!("{m}={:.1}", report.metric(m) * 100.0),
        None => {
            println!("n={}", report.count);
            println!("{}={:.1}", Metric::Accuracy, report.accuracy * 100.0);
            println!(
                "{}={:.1}",
                Metric::MatthewsCorrelation,
                report.matthews_correlation * 100.0
            );
        }
    }
    Ok(())
}

fn create_device(device: &str) -> Result<Device> {
    match device {
        "metal" => {
            // candle может panic при инициализации Metal, если устройство недоступно.
            let prev_hook = std::panic::take_hook();
            std::panic::set_hook(Box::new(|_| {}));
            let res = std::panic::catch_unwind(|| Device::new_metal(0));
            std::panic::set_hook(prev_hook);

            match res {
                Ok(Ok(dev)) => Ok(dev),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(anyhow::anyhow!(
                    "Инициализация Metal недоступна в этом окружении. Попробуйте --device cpu."
                )),
            }
        }
        "cuda" => Ok(Device::new_cuda(0)?),
        _ => Ok(Device::Cpu),
    }
}
