//! CLI binary for pdfshelf.
//!
//! A thin shim over the library crate: resolves the settings file, applies
//! flag overrides to `PipelineConfig`, runs the pipeline once and prints the
//! summary.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use pdfshelf::settings::host_name;
use pdfshelf::state::AuditReport;
use pdfshelf::{
    FailureKind, FileStateStore, Pipeline, PipelineConfig, PipelineProgress, ProgressCallback,
    RunOptions, RunSummary, Settings, Stage,
};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

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

// ── CLI progress callback using indicatif ────────────────────────────────────

/// One bar over the corpus, one log line per finished stage.
struct CliProgress {
    bar: ProgressBar,
    failed_files: AtomicUsize,
}

impl CliProgress {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>4}/{len} books  \
             ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Scanning");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            failed_files: AtomicUsize::new(0),
        })
    }
}

impl PipelineProgress for CliProgress {
    fn on_run_start(&self, total_files: usize) {
        self.bar.set_length(total_files as u64);
        self.bar.set_prefix("Cataloguing");
        self.bar.reset_eta();
    }

    fn on_file_start(&self, _index: usize, _total: usize, file: &str) {
        self.bar.set_message(truncate(file, 48));
    }

    fn on_stage_complete(&self, file: &str, stage: Stage, elapsed_ms: u64) {
        self.bar.println(format!(
            "  {} {:<15} {}  {}",
            green("✓"),
            stage.as_str(),
            truncate(file, 60),
            dim(&format!("{:.1}s", elapsed_ms as f64 / 1000.0)),
        ));
    }

    fn on_stage_error(&self, file: &str, stage: Stage, kind: FailureKind, message: &str) {
        self.failed_files.fetch_add(1, Ordering::SeqCst);
        let mark = match kind {
            FailureKind::DataInsufficiency => yellow("?"),
            _ => red("✗"),
        };
        self.bar.println(format!(
            "  {} {:<15} {}  {}",
            mark,
            stage.as_str(),
            truncate(file, 60),
            red(&truncate(message, 80)),
        ));
    }

    fn on_file_complete(&self, _index: usize, _total: usize, _complete: bool) {
        self.bar.inc(1);
    }

    fn on_run_complete(&self, total_files: usize, complete_files: usize) {
        self.bar.finish_and_clear();
        let failed = self.failed_files.load(Ordering::SeqCst);
        eprintln!(
            "{} {}/{} books complete{}",
            if failed == 0 { green("✔") } else { yellow("⚠") },
            bold(&complete_files.to_string()),
            total_files,
            if failed == 0 {
                String::new()
            } else {
                format!("  ({} failed)", red(&failed.to_string()))
            },
        );
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars - 1).collect();
        format!("{cut}\u{2026}")
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Process every pending book of the configured corpus
  pdfshelf

  # Pick a settings section explicitly instead of matching the host name
  pdfshelf --env nas

  # One-off run without a settings file
  pdfshelf --corpus ~/Books --library ~/wiki/books

  # Redo the outline and the card of one book
  pdfshelf --only "Example (2020)" --force toc

  # Compute names but leave the files where they are
  pdfshelf --no-rename

  # Retry books parked on the review list after fixing them by hand
  pdfshelf --retry-review

  # Machine-readable summary
  pdfshelf --json --no-progress > summary.json

  # Report duplicate ISBNs and inconsistent records, change nothing
  pdfshelf --audit

STAGES:
  parse    copyright page → metadata (LLM + Google Books) → meta/<id>.json
  rename   "Title (Year), NE - 译名.pdf", siblings follow
  toc      PDF bookmarks → translated outline → toc/<id>.json
  build    Markdown card + cover → <slug>.md

SETTINGS FILE (config.json):
  {
    "default": { "EBOOKS_PATH": "/data/ebooks", "WIKI_BASE_PATH": "/data/wiki" },
    "studio":  { "hostname": "mac-studio", "EBOOKS_PATH": "/Volumes/Books" }
  }
  The section is chosen by --env, else by host name, else "default".

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key (or ANTHROPIC_API_KEY, GEMINI_API_KEY, …)
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_DIR          Directory holding libpdfium; system library otherwise
  RUST_LOG                Log filter, overrides -v / -q
"#;

/// Catalogue a directory of PDF ebooks.
#[derive(Parser, Debug)]
#[command(
    name = "pdfshelf",
    version,
    about = "Catalogue a directory of PDF ebooks: metadata, file names, translated outlines, Markdown cards",
    long_about = "Walks a directory of PDF ebooks and runs four resumable stages per book: \
metadata from the copyright page and Google Books, a normalised file name, a translated table of \
contents, and a Markdown card. Finished stages are never repeated; interrupted runs pick up where \
they stopped.",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Settings file with one section per environment.
    #[arg(short, long, env = "PDFSHELF_CONFIG", default_value = "config.json")]
    config: PathBuf,

    /// Settings section to use instead of matching the host name.
    #[arg(short, long = "env", env = "PDFSHELF_ENV")]
    environment: Option<String>,

    /// Directory of PDFs (overrides EBOOKS_PATH).
    #[arg(long, env = "PDFSHELF_CORPUS")]
    corpus: Option<PathBuf>,

    /// Output directory for metadata, outlines and cards (overrides WIKI_BASE_PATH).
    #[arg(long, env = "PDFSHELF_LIBRARY")]
    library: Option<PathBuf>,

    /// Re-run this stage and all later ones: parse, rename, toc or build.
    #[arg(long, value_name = "STAGE")]
    force: Option<Stage>,

    /// Only process files whose name contains this text.
    #[arg(long, value_name = "TEXT")]
    only: Option<String>,

    /// Record normalised names without renaming files.
    #[arg(long)]
    no_rename: bool,

    /// Also process files on the manual review list.
    #[arg(long)]
    retry_review: bool,

    /// Print the run summary as JSON on stdout.
    #[arg(long)]
    json: bool,

    /// Report inconsistencies across stored records and exit.
    #[arg(long)]
    audit: bool,

    /// Disable progress bar.
    #[arg(long, env = "PDFSHELF_NO_PROGRESS")]
    no_progress: bool,

    /// Append logs to this file (overrides LOG_FILE).
    #[arg(long, env = "PDFSHELF_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PDFSHELF_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PDFSHELF_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = load_settings(&cli)?;
    let config = build_config(&cli, &settings)?;

    // ── Logging setup ────────────────────────────────────────────────────
    // The terminal only gets errors while the progress bar is active; the
    // log file always records the full run.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json && !cli.audit;
    let log_file = cli
        .log_file
        .clone()
        .or_else(|| settings.get("LOG_FILE").map(PathBuf::from))
        .unwrap_or_else(|| {
            let host = host_name().unwrap_or_else(|| "local".into());
            config.data_dir().join(format!("pdfshelf_{host}.log"))
        });
    init_logging(&cli, show_progress, &log_file)?;
    tracing::info!("settings environment '{}'", settings.env_name());

    // ── Audit mode ───────────────────────────────────────────────────────
    if cli.audit {
        let store = FileStateStore::open(config.records_dir())
            .await
            .context("Failed to open state records")?;
        let report = pdfshelf::state::audit(&store).await;
        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("Failed to serialise audit")?
            );
        } else {
            print_audit(&report);
        }
        return Ok(());
    }

    // ── Run ──────────────────────────────────────────────────────────────
    let mut pipeline = Pipeline::open(config)
        .await
        .context("Failed to initialise pipeline")?;
    if show_progress {
        let cb: ProgressCallback = CliProgress::new();
        pipeline = pipeline.with_progress(cb);
    }

    let opts = RunOptions {
        force_from: cli.force,
        only: cli.only.clone(),
        retry_review: cli.retry_review,
    };
    let summary = pipeline.run(&opts).await.context("Run failed")?;

    if cli.json {
        let out = serde_json::json!({
            "summary": &summary,
            "failures": summary.failures_by_kind(),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&out).context("Failed to serialise summary")?
        );
    } else if !cli.quiet {
        print_summary(&summary);
    }
    Ok(())
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    if cli.config.is_file() {
        Settings::load(&cli.config, cli.environment.as_deref())
            .with_context(|| format!("Failed to load settings from {}", cli.config.display()))
    } else if cli.environment.is_some() {
        anyhow::bail!(
            "--env given but settings file {} does not exist",
            cli.config.display()
        )
    } else {
        Ok(Settings::from_map("default", BTreeMap::new()))
    }
}

/// Settings first, then flag overrides.
fn build_config(cli: &Cli, settings: &Settings) -> Result<PipelineConfig> {
    let mut builder = PipelineConfig::from_settings(settings).context("Invalid settings")?;
    if let Some(ref dir) = cli.corpus {
        builder = builder.corpus_dir(dir);
    }
    if let Some(ref dir) = cli.library {
        builder = builder.library_dir(dir);
    }
    if cli.no_rename {
        builder = builder.rename_files(false);
    }
    builder.build().context("Invalid configuration")
}

fn init_logging(cli: &Cli, show_progress: bool, log_file: &Path) -> Result<()> {
    let level = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    let stderr_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let stderr_layer = fmt::layer()
        .with_target(false)
        .with_writer(io::stderr)
        .with_filter(stderr_filter);

    // A log file that cannot be opened is not worth failing the run over.
    let file_layer = match open_log_file(log_file) {
        Ok(file) => {
            let file_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new(if cli.verbose { "debug" } else { "info" })
            });
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(file_filter),
            )
        }
        Err(e) => {
            eprintln!(
                "{} cannot open log file {}: {e}",
                yellow("⚠"),
                log_file.display()
            );
            None
        }
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("initialize tracing subscriber: {e}"))
}

fn open_log_file(path: &Path) -> io::Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new().create(true).append(true).open(path)
}

fn print_summary(summary: &RunSummary) {
    let head = format!(
        "{} book(s): {} complete, {} failed, {} awaiting review  ({:.1}s)",
        summary.total(),
        summary.complete(),
        summary.failed(),
        summary.awaiting_review(),
        summary.elapsed_ms as f64 / 1000.0
    );
    if summary.failed() == 0 {
        eprintln!("{} {}", green("✔"), bold(&head));
    } else {
        eprintln!("{} {}", yellow("⚠"), bold(&head));
    }

    for (kind, entries) in summary.failures_by_kind() {
        eprintln!("  {} {}", red(&kind.to_string()), dim(&format!("({})", entries.len())));
        for e in entries {
            match e.stage {
                Some(stage) => eprintln!("    {} {}: {}", e.file, dim(&format!("[{stage}]")), e.message),
                None => eprintln!("    {}: {}", e.file, e.message),
            }
        }
    }

    for f in summary.files.iter().filter(|f| f.final_name != f.file) {
        eprintln!("  {} {} → {}", dim("renamed"), f.file, f.final_name);
    }
}

fn print_audit(report: &AuditReport) {
    println!("Records:          {}", report.total);
    println!("Complete:         {}", report.complete);
    for (stage, n) in &report.pending_by_stage {
        println!("Pending {:<9} {}", format!("{stage}:"), n);
    }
    if report.is_clean() {
        println!("{} no inconsistencies found", green("✔"));
        return;
    }
    for (isbn, ids) in &report.duplicate_isbns {
        println!("{} duplicate ISBN {}: {}", yellow("⚠"), isbn, ids.join(", "));
    }
    for id in &report.missing_safe_title {
        println!("{} {} is renamed but has no normalised name", yellow("⚠"), id);
    }
    for path in &report.corrupt_files {
        println!("{} unreadable record {}", red("✗"), path.display());
    }
}
