//! Progress-callback trait for per-file, per-stage pipeline events.
//!
//! Inject an [`Arc<dyn PipelineProgress>`] via
//! [`crate::Pipeline::with_progress`] to receive events as the driver walks
//! the corpus. The binary forwards them to an `indicatif` bar; a service
//! could forward them to a channel or a database row instead.
//!
//! # Example
//!
//! ```rust
//! use pdfshelf::{PipelineProgress, Stage};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct CountStages(AtomicUsize);
//!
//! impl PipelineProgress for CountStages {
//!     fn on_stage_complete(&self, _file: &str, stage: Stage, _elapsed_ms: u64) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{stage} done");
//!     }
//! }
//! ```

use crate::error::FailureKind;
use crate::state::Stage;
use std::sync::Arc;

/// Called by the driver as it processes the corpus.
///
/// Every method has a no-op default so implementations override only what
/// they need. Files are processed one at a time, so calls never overlap.
pub trait PipelineProgress: Send + Sync {
    /// Called once with the number of primary PDFs found.
    fn on_run_start(&self, total_files: usize) {
        let _ = total_files;
    }

    /// Called before the first stage of a file is considered.
    ///
    /// # Arguments
    /// * `index`: 1-based position in the corpus
    /// * `file` : file name as found on disk
    fn on_file_start(&self, index: usize, total_files: usize, file: &str) {
        let _ = (index, total_files, file);
    }

    fn on_stage_complete(&self, file: &str, stage: Stage, elapsed_ms: u64) {
        let _ = (file, stage, elapsed_ms);
    }

    /// Called when a stage fails; later stages of the file are not run.
    fn on_stage_error(&self, file: &str, stage: Stage, kind: FailureKind, message: &str) {
        let _ = (file, stage, kind, message);
    }

    /// Called after the last stage of a file was attempted or skipped.
    ///
    /// # Arguments
    /// * `complete`: whether all four stages are now done
    fn on_file_complete(&self, index: usize, total_files: usize, complete: bool) {
        let _ = (index, total_files, complete);
    }

    /// Called once when every file has been visited.
    fn on_run_complete(&self, total_files: usize, complete_files: usize) {
        let _ = (total_files, complete_files);
    }
}

/// Used when no callback is configured.
pub struct NoopProgress;

impl PipelineProgress for NoopProgress {}

pub type ProgressCallback = Arc<dyn PipelineProgress>;
