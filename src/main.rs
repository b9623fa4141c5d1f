//! Legal-GPT command line
//!
//! Answers legal questions with a local GGUF model, optionally with LoRA
//! weights on top, streaming the answer to stdout as it is generated.
//!
//! Usage:
//!   legalgpt --base-model models/legal-7b.gguf "What is adverse possession?"
//!   legalgpt --lora-weights models/legal-lora.gguf   # interactive, reads stdin
//!   RUST_LOG=legalgpt=debug legalgpt --no-stream "Define estoppel"

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use legalgpt::inference::{InferenceService, LlamaEngine};
use legalgpt::prompt::Prompter;
use legalgpt::storage::settings::{get_settings_path, load_settings, save_settings, AppSettings};
use legalgpt::types::{Device, GenerationRequest};

/// Command line arguments; anything left unset falls back to the saved settings
#[derive(Parser, Debug)]
#[command(name = "legalgpt")]
#[command(about = "Ask an instruction-tuned legal model, streaming the answer")]
#[command(version)]
struct Args {
    /// Path to the base GGUF model
    #[arg(long)]
    base_model: Option<String>,

    /// Path to LoRA adapter weights (GGUF)
    #[arg(long)]
    lora_weights: Option<PathBuf>,

    /// Prompt template name or JSON file
    #[arg(long)]
    prompt_template: Option<String>,

    #[arg(long)]
    temperature: Option<f32>,

    #[arg(long)]
    top_p: Option<f32>,

    #[arg(long)]
    top_k: Option<u32>,

    /// Accepted for compatibility; sampling is not beam search
    #[arg(long)]
    num_beams: Option<u32>,

    #[arg(long)]
    max_new_tokens: Option<u32>,

    /// Print only the final answer
    #[arg(long)]
    no_stream: bool,

    /// Layers to offload when a GPU backend is compiled in
    #[arg(long)]
    gpu_layers: Option<u32>,

    /// Fixed sampling seed for reproducible answers
    #[arg(long)]
    seed: Option<u32>,

    /// Write the effective settings (saved settings plus these flags) back to disk
    #[arg(long)]
    save_settings: bool,

    /// Instruction to answer; reads one instruction per line from stdin when omitted
    instruction: Option<String>,
}

impl Args {
    fn apply(&self, settings: &mut AppSettings) {
        if let Some(model) = &self.base_model {
            settings.base_model = model.clone();
        }
        if let Some(lora) = &self.lora_weights {
            settings.lora_weights = Some(lora.clone());
        }
        if let Some(template) = &self.prompt_template {
            settings.prompt_template = template.clone();
        }
        if let Some(layers) = self.gpu_layers {
            settings.gpu_layers = layers;
        }

        let d = &mut settings.defaults;
        if let Some(v) = self.temperature {
            d.temperature = v;
        }
        if let Some(v) = self.top_p {
            d.top_p = v;
        }
        if let Some(v) = self.top_k {
            d.top_k = v;
        }
        if let Some(v) = self.num_beams {
            d.num_beams = v;
        }
        if let Some(v) = self.max_new_tokens {
            d.max_new_tokens = v;
        }
        if self.no_stream {
            d.stream_output = false;
        }
        if self.seed.is_some() {
            d.seed = self.seed;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the answer, logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "legalgpt=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut settings = load_settings();
    args.apply(&mut settings);

    if args.save_settings {
        settings.validate();
        save_settings(&settings).context("Failed to save settings")?;
        tracing::info!("Saved settings to {}", get_settings_path()?.display());
    }
    settings.apply_env();

    if settings.base_model.trim().is_empty() {
        bail!("No base model configured: pass --base-model or set BASE_MODEL");
    }

    let device = Device::resolve(settings.device, settings.gpu_layers);
    tracing::info!("Using device {}", device);

    let mut engine = LlamaEngine::new();
    engine.init().context("Failed to start the llama.cpp backend")?;
    let info = engine
        .load_model(&settings.base_model, &device, settings.context_size)
        .with_context(|| format!("Failed to load base model {}", settings.base_model))?;
    tracing::info!(
        "Loaded {} ({} params, context {})",
        info.path,
        info.param_count,
        info.context_length
    );

    if let Some(lora) = &settings.lora_weights {
        if let Some(adapter) = engine
            .load_adapter(lora, settings.lora_scale)
            .with_context(|| format!("Failed to load LoRA weights {}", lora.display()))?
        {
            tracing::info!("Applied LoRA adapter {} (scale {})", adapter.path, adapter.scale);
        }
    }

    let prompter = Prompter::load(&settings.prompt_template, &settings.templates_dir)
        .context("Failed to load prompt template")?;
    let service = InferenceService::new(Arc::new(engine), prompter);

    match &args.instruction {
        Some(instruction) => {
            answer(&service, &settings, instruction).await?;
        }
        None => {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                eprint!("> ");
                // Ctrl-C at the prompt exits; during an answer it only cancels
                let line = tokio::select! {
                    line = lines.next_line() => line?,
                    _ = tokio::signal::ctrl_c() => {
                        drop(service);
                        // A pending stdin read would keep the runtime from shutting down
                        std::process::exit(130);
                    }
                };
                let Some(line) = line else { break };

                let instruction = line.trim();
                if !instruction.is_empty() {
                    if let Err(e) = answer(&service, &settings, instruction).await {
                        tracing::error!("{:#}", e);
                    }
                }
            }
        }
    }

    Ok(())
}

/// Answer one instruction, printing to stdout
///
/// Ctrl-C abandons the answer; dropping the receiver cancels the generation.
async fn answer(
    service: &InferenceService<LlamaEngine>,
    settings: &AppSettings,
    instruction: &str,
) -> Result<()> {
    let request: GenerationRequest = settings.defaults.request(instruction).build()?;
    let mut answers = service.evaluate(request)?.into_channel(1);

    let mut stdout = std::io::stdout();
    let mut printed = String::new();

    loop {
        tokio::select! {
            item = answers.recv() => {
                let Some(item) = item else { break };
                let text = item?;
                // Answers are cumulative; print only what is new
                match text.strip_prefix(printed.as_str()) {
                    Some(delta) => write!(stdout, "{}", delta)?,
                    None => write!(stdout, "\n{}", text)?,
                }
                stdout.flush()?;
                printed = text;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, cancelling generation");
                break;
            }
        }
    }

    writeln!(stdout)?;
    Ok(())
}
