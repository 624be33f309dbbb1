//! # pdfshelf
//!
//! Catalogue a directory of PDF ebooks, one resumable stage at a time.
//!
//! Every book passes through four stages. Each stage records its completion
//! in a small per-book JSON record, so an interrupted or partially failed run
//! picks up exactly where it stopped, and a run over a finished corpus does
//! nothing at all.
//!
//! ## Pipeline Overview
//!
//! ```text
//! corpus/*.pdf
//!  │
//!  ├─ 1. parse_metadata  copyright page → LLM draft → Google Books → meta/<id>.json
//!  ├─ 2. rename_done     "Title (Year), NE - 译名.pdf" plus sibling variants
//!  ├─ 3. trans_toc       PDF bookmarks → translated outline → toc/<id>.json
//!  └─ 4. build_md        Markdown card + cover → library/<slug>.md
//! ```
//!
//! Stages run strictly in that order. A failure stops the file at that
//! stage, is reported in the [`RunSummary`], and is retried on the next run;
//! files that lack the data to continue go on a manual review list instead.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pdfshelf::{Pipeline, PipelineConfig, RunOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // LLM provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / …
//!     let config = PipelineConfig::builder()
//!         .corpus_dir("/books")
//!         .library_dir("/library")
//!         .build()?;
//!     let pipeline = Pipeline::open(config).await?;
//!     let summary = pipeline.run(&RunOptions::default()).await?;
//!     print!("{summary}");
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdfshelf` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! pdfshelf = { version = "0.1", default-features = false }
//! ```
//!
//! ## Testing without network or PDFium
//!
//! Every external service sits behind a trait in [`backends`]. Build a
//! [`Collaborators`] from fakes, pair it with a [`MemoryStateStore`] and the
//! driver runs entirely in-process.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod backends;
pub mod book;
pub mod config;
pub mod driver;
pub mod error;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod retry;
pub mod settings;
pub mod state;
pub mod summary;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use backends::{
    BookLookup, Collaborators, CoverFetcher, CoverQuery, MetadataExtractor, OcrEngine, PdfSource,
    Translator,
};
pub use book::{MetadataRecord, OutlineEntry, OutlineNode, TocDocument};
pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use driver::{Pipeline, RunOptions};
pub use error::{CollaboratorError, FailureKind, ShelfError, StageError, StateError};
pub use progress::{NoopProgress, PipelineProgress, ProgressCallback};
pub use retry::RetryPolicy;
pub use settings::Settings;
pub use state::{
    FileStateStore, MemoryStateStore, ProcessingRecord, ReviewList, Stage, StageFlags, StateStore,
};
pub use summary::{FileReport, RunSummary, StageOutcome};
