use std::io;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use captionify_contracts::caption::{CaptionResult, ImagePayload, RawDescription, Tone, DEFAULT_TONE};
use captionify_contracts::events::EventWriter;
use captionify_engine::{
    build_caption_prompt, CaptionEngine, EngineConfig, ErrorKind, PipelineError, Precondition,
    Readiness,
};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use tracing::debug;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Tone vocabulary offered to users. The engine accepts any tone string.
const TONES: [&str; 20] = [
    "fun",
    "formal",
    "casual",
    "friendly",
    "creative",
    "sarcastic",
    "motivational",
    "romantic",
    "mysterious",
    "dramatic",
    "inspirational",
    "humble",
    "poetic",
    "witty",
    "sad",
    "excited",
    "bold",
    "aesthetic",
    "nostalgic",
    "techy",
];

const EXIT_OK: i32 = 0;
const EXIT_FAILURE: i32 = 1;
const EXIT_PRECONDITION: i32 = 2;

#[derive(Debug, Parser)]
#[command(
    name = "captionify",
    version,
    about = "Turn an image into a short, tone-styled social media caption"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Caption an image file.
    Caption(CaptionArgs),
    /// Connect to the captioning backend and report readiness.
    Check(CheckArgs),
    /// Print the stage-2 prompt for a description.
    Prompt(PromptArgs),
    /// List the suggested tones.
    Tones,
}

#[derive(Debug, Args)]
struct ModelArgs {
    #[arg(long)]
    caption_model: Option<String>,
    #[arg(long)]
    text_model: Option<String>,
}

#[derive(Debug, Parser)]
struct CaptionArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long, default_value = DEFAULT_TONE)]
    tone: String,
    #[arg(long)]
    language: Option<String>,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    json: bool,
    #[command(flatten)]
    models: ModelArgs,
}

#[derive(Debug, Parser)]
struct CheckArgs {
    #[arg(long)]
    events: Option<PathBuf>,
    #[command(flatten)]
    models: ModelArgs,
}

#[derive(Debug, Parser)]
struct PromptArgs {
    #[arg(long)]
    description: String,
    #[arg(long, default_value = DEFAULT_TONE)]
    tone: String,
    #[arg(long)]
    language: Option<String>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("captionify error: {err:#}");
            std::process::exit(EXIT_FAILURE);
        }
    }
}

fn run() -> Result<i32> {
    let dotenv = dotenvy::dotenv();
    init_tracing();
    if let Ok(path) = dotenv {
        debug!(path = %path.display(), "loaded environment file");
    }

    let cli = Cli::parse();
    match cli.command {
        Command::Caption(args) => run_caption(args),
        Command::Check(args) => run_check(args),
        Command::Prompt(args) => run_prompt(args),
        Command::Tones => {
            for tone in TONES {
                if tone == DEFAULT_TONE {
                    println!("{tone} (default)");
                } else {
                    println!("{tone}");
                }
            }
            Ok(EXIT_OK)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

fn load_config(models: &ModelArgs, language: Option<&str>) -> EngineConfig {
    let mut config = EngineConfig::from_env();
    if models.caption_model.is_some() || models.text_model.is_some() {
        let caption = models
            .caption_model
            .clone()
            .unwrap_or_else(|| config.caption_model.clone());
        let text = models
            .text_model
            .clone()
            .unwrap_or_else(|| config.text_model.clone());
        config.select_models(Some(&caption), Some(&text));
    }
    if let Some(language) = language.map(str::trim).filter(|value| !value.is_empty()) {
        config.language = Some(language.to_string());
    }
    config
}

fn event_writer(path: Option<PathBuf>) -> Result<Option<EventWriter>> {
    path.map(|path| EventWriter::open(path, Uuid::new_v4().to_string()))
        .transpose()
}

fn run_caption(args: CaptionArgs) -> Result<i32> {
    let image = ImagePayload::from_path(&args.image)?;
    let config = load_config(&args.models, args.language.as_deref());
    let engine = CaptionEngine::from_config(&config, event_writer(args.events)?)?;
    let tone = Tone::new(Some(&args.tone));

    // Reject unusable files before the session touches the network.
    let outcome = match validate_image(&image) {
        Ok(()) => runtime()?.block_on(async {
            engine.initialize_session().await?;
            engine.generate_caption(Some(image), Some(tone.as_str())).await
        }),
        Err(err) => Err(err),
    };
    engine.shutdown();

    match outcome {
        Ok(result) => {
            if args.json {
                println!("{}", serde_json::to_string_pretty(&caption_json(&result, &tone))?);
            } else {
                println!("{}", result.text);
            }
            Ok(EXIT_OK)
        }
        Err(err) => {
            eprintln!("captionify: {err}");
            Ok(exit_code_for(&err))
        }
    }
}

fn validate_image(image: &ImagePayload) -> Result<(), PipelineError> {
    image
        .validate()
        .map_err(|reason| PipelineError::PreconditionFailed(Precondition::InvalidImage(reason)))
}

fn run_check(args: CheckArgs) -> Result<i32> {
    let config = load_config(&args.models, None);
    let engine = CaptionEngine::from_config(&config, event_writer(args.events)?)?;
    let readiness = runtime()?.block_on(async {
        // the outcome is reported through readiness below
        let _ = engine.initialize_session().await;
        engine.current_readiness()
    });
    engine.shutdown();

    println!("backend: {}", config.backend_name());
    println!("caption model: {}", config.caption_model);
    println!("text model: {}", config.text_model);
    println!("session: {readiness}");
    Ok(if readiness == Readiness::Ready {
        EXIT_OK
    } else {
        EXIT_FAILURE
    })
}

fn run_prompt(args: PromptArgs) -> Result<i32> {
    let Some(description) = RawDescription::new(&args.description) else {
        bail!("--description must not be empty");
    };
    let config = load_config(
        &ModelArgs {
            caption_model: None,
            text_model: None,
        },
        args.language.as_deref(),
    );
    let prompt = build_caption_prompt(
        &description,
        &Tone::new(Some(&args.tone)),
        config.max_caption_chars,
        config.language.as_deref(),
    );
    println!("{prompt}");
    Ok(EXIT_OK)
}

fn caption_json(result: &CaptionResult, tone: &Tone) -> Value {
    json!({
        "caption": result.text,
        "description": result.description.as_str(),
        "tone": tone.as_str(),
        "chars": result.char_count(),
    })
}

fn exit_code_for(err: &PipelineError) -> i32 {
    match err.kind() {
        ErrorKind::PreconditionFailed => EXIT_PRECONDITION,
        _ => EXIT_FAILURE,
    }
}
