//! CLI binary for edgequake-img2md.
//!
//! A thin shim over the library crate that maps CLI flags to a
//! `TranscriptionRequest` + `TranscriptionConfig`, renders progress and
//! writes the documents.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_img2md::pipeline::input::collect_images;
use edgequake_img2md::stream::ProgressStream;
use edgequake_img2md::{
    output::write_documents, transcribe_stream, Img2MdError, ProgressStatus, ProviderConfig,
    ProviderKind, TranscriptionConfig, TranscriptionRequest,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

const AFTER_HELP: &str = r#"EXAMPLES:
  # One Markdown file per page
  img2md scans/ -o out/

  # One file per detected chapter, in German
  img2md --chapters --language German scans/*.jpg -o book/

  # Everything in one document.md, with figure descriptions
  img2md --combine --describe-images page1.png page2.png

  # Local OpenAI-compatible server (LM Studio, vLLM, Ollama)
  LOCAL_LLM_URL=http://localhost:1234/v1 img2md --provider local scans/

  # Clean up OCR artefacts with a second, text-only pass
  img2md --text-model gemini-2.0-flash-lite scans/

PROVIDERS:
  gemini       GEMINI_API_KEY                          batches of up to 20 images
  enterprise   ANTHROPIC_API_KEY [ANTHROPIC_BASE_URL]  batches of up to 20 images
  local        LOCAL_LLM_URL [LOCAL_LLM_API_KEY]       one downscaled image per request

  Without --provider the first configured one in the order above is used.

INPUTS:
  Files and directories; directories contribute their png/jpg/jpeg/webp/gif
  files in natural order (page2 before page10). Page numbers follow the
  order of the resulting list.
"#;

/// Transcribe page images into Markdown using Vision LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "img2md",
    version,
    about = "Transcribe page images into Markdown using Vision LLMs",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Image files or directories of images, in reading order.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Output directory.
    #[arg(short, long, env = "IMG2MD_OUTPUT", default_value = "output")]
    output: PathBuf,

    /// Provider: gemini, enterprise, local. Auto-detected when omitted.
    #[arg(long, env = "IMG2MD_PROVIDER")]
    provider: Option<String>,

    /// Vision model ID. Default: the provider's default model.
    #[arg(long, env = "IMG2MD_MODEL")]
    model: Option<String>,

    /// Provider base URL override.
    #[arg(long, env = "IMG2MD_BASE_URL")]
    base_url: Option<String>,

    /// Text model for the refinement pass. Refinement is off when unset.
    #[arg(long, env = "IMG2MD_TEXT_MODEL")]
    text_model: Option<String>,

    /// Output language, e.g. "English". Default: keep the source language.
    #[arg(long, env = "IMG2MD_LANGUAGE")]
    language: Option<String>,

    /// Write one file per detected chapter.
    #[arg(long)]
    chapters: bool,

    /// Write a single document.md.
    #[arg(long, conflicts_with = "chapters")]
    combine: bool,

    /// Keep emphasis, list numbering and line structure.
    #[arg(long)]
    preserve_formatting: bool,

    /// Append a description of each figure or photo.
    #[arg(long)]
    describe_images: bool,

    /// Maximum concurrent provider requests.
    #[arg(short, long, env = "IMG2MD_CONCURRENCY", default_value_t = 3)]
    concurrency: usize,

    /// Retries per batch on transient provider failures.
    #[arg(long, env = "IMG2MD_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Sampling temperature (0.0–2.0).
    #[arg(long, env = "IMG2MD_TEMPERATURE")]
    temperature: Option<f32>,

    /// Max output tokens per request.
    #[arg(long, env = "IMG2MD_MAX_TOKENS", default_value_t = 8192)]
    max_tokens: u32,

    /// Per-request timeout in seconds.
    #[arg(long, env = "IMG2MD_TIMEOUT", default_value_t = 120)]
    timeout: u64,

    /// Print a JSON summary (documents without content) to stdout.
    #[arg(long)]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "IMG2MD_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "IMG2MD_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "IMG2MD_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs unless -v is given.
    let show_progress = !cli.quiet && !cli.no_progress;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Build request + config ───────────────────────────────────────────
    let images = collect_images(&cli.inputs).context("Failed to collect input images")?;
    let request = TranscriptionRequest {
        images,
        output_dir: cli.output.clone(),
        model: cli.model.clone(),
        language: cli.language.clone(),
        detect_chapters: cli.chapters,
        combine_pages: cli.combine,
        preserve_formatting: cli.preserve_formatting,
        include_image_descriptions: cli.describe_images,
        temperature: cli.temperature,
    };
    let config = build_config(&cli)?;

    // ── Run ──────────────────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let mut handle = transcribe_stream(request, config, cancel);
    let updates = std::mem::replace(&mut handle.updates, Box::pin(tokio_stream::empty()));
    render_progress(updates, show_progress, cli.quiet).await;

    let output = match handle.join().await {
        Ok(output) => output,
        Err(Img2MdError::Cancelled) => anyhow::bail!("Cancelled"),
        Err(e) => return Err(e).context("Transcription failed"),
    };

    let paths = write_documents(&output.documents, &cli.output)
        .await
        .context("Failed to write documents")?;

    if cli.json {
        let summary = serde_json::json!({
            "total_pages": output.total_pages,
            "tokens_used": output.tokens_used,
            "processing_ms": output.processing_time.as_millis() as u64,
            "documents": output.documents.iter().zip(&paths).map(|(d, p)| serde_json::json!({
                "path": p,
                "title": d.title,
                "page_range": [d.page_range.0, d.page_range.1],
                "sections": d.sections,
            })).collect::<Vec<_>>(),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("Failed to serialise summary")?
        );
    }

    if !cli.quiet {
        eprintln!(
            "{}  {} pages  →  {} file(s) in {}  {}",
            green("✔"),
            output.total_pages,
            paths.len(),
            bold(&cli.output.display().to_string()),
            dim(&format!(
                "{} tokens, {:.1}s",
                output.tokens_used,
                output.processing_time.as_secs_f64()
            )),
        );
    }

    Ok(())
}

/// Map CLI args to `TranscriptionConfig`.
fn build_config(cli: &Cli) -> Result<TranscriptionConfig> {
    let mut builder = TranscriptionConfig::builder()
        .provider_config(provider_config(cli)?)
        .concurrency(cli.concurrency)
        .max_retries(cli.max_retries)
        .max_tokens(cli.max_tokens);
    if let Some(t) = cli.temperature {
        builder = builder.temperature(t);
    }
    if let Some(m) = &cli.text_model {
        builder = builder.text_model(m.clone());
    }
    builder.build().context("Invalid configuration")
}

fn provider_config(cli: &Cli) -> Result<ProviderConfig> {
    let mut cfg = match &cli.provider {
        Some(name) => {
            let kind: ProviderKind = name.parse().context("Invalid --provider")?;
            let (key_var, url_var) = match kind {
                ProviderKind::Gemini => ("GEMINI_API_KEY", None),
                ProviderKind::Enterprise => ("ANTHROPIC_API_KEY", Some("ANTHROPIC_BASE_URL")),
                ProviderKind::Local => ("LOCAL_LLM_API_KEY", Some("LOCAL_LLM_URL")),
            };
            let mut cfg = ProviderConfig::new(kind);
            if let Some(key) = env_non_empty(key_var) {
                cfg = cfg.api_key(key);
            }
            if let Some(url) = url_var.and_then(env_non_empty) {
                cfg = cfg.base_url(url);
            }
            cfg
        }
        None => ProviderConfig::from_env().context("No provider configured")?,
    };
    if let Some(model) = &cli.model {
        cfg = cfg.model(model.clone());
    }
    if let Some(url) = &cli.base_url {
        cfg = cfg.base_url(url.clone());
    }
    Ok(cfg.timeout_secs(cli.timeout))
}

fn env_non_empty(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

/// Drain the job's progress stream, rendering a bar over batches.
async fn render_progress(mut updates: ProgressStream, show_progress: bool, quiet: bool) {
    let bar = show_progress.then(|| {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        bar.set_prefix("Preparing");
        bar.enable_steady_tick(Duration::from_millis(80));
        bar
    });

    while let Some(update) = updates.next().await {
        let Some(bar) = &bar else {
            if !quiet && update.status == ProgressStatus::Error {
                eprintln!("{} {}", red("✘"), update.message);
            }
            continue;
        };
        match update.status {
            ProgressStatus::Validating => bar.set_message(update.message),
            ProgressStatus::Planning => {
                bar.set_style(
                    ProgressStyle::with_template(
                        "{spinner:.cyan} {prefix:.bold}  \
                         [{bar:42.green/238}] {pos:>3}/{len} batches  \
                         ⏱ {elapsed_precise}  {msg}",
                    )
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("█▉▊▋▌▍▎▏  ")
                    .tick_strings(TICKS),
                );
                bar.set_length(update.total_batches as u64);
                bar.set_prefix("Transcribing");
                bar.println(format!("{} {}", bold("◆"), update.message));
            }
            ProgressStatus::Sending => bar.set_message(dim(&update.message)),
            ProgressStatus::Received => {
                if let Some(err) = update.response_info.and_then(|r| r.error) {
                    bar.println(format!("  {} {}", red("✗"), err));
                }
            }
            ProgressStatus::Retrying => bar.println(format!(
                "  {} batch {}: {}",
                yellow("↻"),
                update.current_batch,
                update.message
            )),
            ProgressStatus::Processing => {
                bar.set_position(update.current_batch as u64);
                bar.set_message(dim(&format!("{} tokens", update.tokens_used)));
            }
            ProgressStatus::Refining | ProgressStatus::Assembling | ProgressStatus::Writing => {
                bar.set_prefix(format!("{:?}", update.status));
                bar.set_message(update.detail.unwrap_or(update.message));
            }
            ProgressStatus::Complete => bar.finish_and_clear(),
            ProgressStatus::Error => {
                bar.abandon_with_message(red(&update.message));
            }
        }
    }
}
