//! The pipeline driver: corpus walk, per-file state machine, summary.
//!
//! For every primary PDF, in path order, the driver finds the file's record
//! (or starts a new one) and runs the stages whose flag is still false, in
//! their fixed order. A stage works on a copy of the record; only when it
//! succeeds are its results absorbed, the flag set and the record saved.
//! The first failure stops the file: its later stages are reported as not
//! attempted and the driver moves on. Nothing a single file does can abort
//! the run.

use crate::backends::Collaborators;
use crate::config::PipelineConfig;
use crate::error::{FailureKind, ShelfError, StageError, StateError};
use crate::pipeline::{file_name_of, run_stage, FileContext, StageEnv};
use crate::progress::{NoopProgress, ProgressCallback};
use crate::state::{
    audit, location_key, relative_dir, scan_corpus, AuditReport, FileStateStore,
    ProcessingRecord, ReviewList, Stage, StateStore,
};
use crate::summary::{FileReport, RunSummary, StageOutcome};
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Per-run switches that are not part of the configuration.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Clear this stage and every later one before processing.
    pub force_from: Option<Stage>,
    /// Only process files whose name contains this text.
    pub only: Option<String>,
    /// Process files on the review list too.
    pub retry_review: bool,
}

pub struct Pipeline {
    config: PipelineConfig,
    collab: Collaborators,
    store: Arc<dyn StateStore>,
    review: Arc<ReviewList>,
    progress: ProgressCallback,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        collab: Collaborators,
        store: Arc<dyn StateStore>,
        review: ReviewList,
    ) -> Self {
        Self {
            config,
            collab,
            store,
            review: Arc::new(review),
            progress: Arc::new(NoopProgress),
        }
    }

    /// Production wiring: default collaborators and the file-backed store
    /// under the data directory.
    pub async fn open(config: PipelineConfig) -> Result<Self, ShelfError> {
        let collab = Collaborators::from_config(&config)?;
        Self::open_with(config, collab).await
    }

    /// File-backed state with caller-supplied collaborators.
    pub async fn open_with(config: PipelineConfig, collab: Collaborators) -> Result<Self, ShelfError> {
        let store = FileStateStore::open(config.records_dir()).await?;
        let review_path = config.review_list_path();
        let review = ReviewList::open(&review_path)
            .await
            .map_err(|source| StateError::Io {
                path: review_path,
                source,
            })?;
        Ok(Self::new(config, collab, Arc::new(store), review))
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn review_list(&self) -> &ReviewList {
        &self.review
    }

    /// Consistency report over every stored record.
    pub async fn audit(&self) -> AuditReport {
        audit(self.store.as_ref()).await
    }

    /// Process the whole corpus once.
    ///
    /// Fails only when the run cannot start (corpus missing, library
    /// directory unusable); per-file problems end up in the summary.
    pub async fn run(&self, opts: &RunOptions) -> Result<RunSummary, ShelfError> {
        let started_at = Utc::now();
        let started = Instant::now();

        let corpus = &self.config.corpus_dir;
        if !corpus.is_dir() {
            return Err(ShelfError::CorpusNotFound {
                path: corpus.clone(),
            });
        }
        tokio::fs::create_dir_all(&self.config.library_dir)
            .await
            .map_err(|e| {
                ShelfError::InvalidConfig(format!(
                    "library directory '{}' is unusable: {e}",
                    self.config.library_dir.display()
                ))
            })?;

        let mut files = scan_corpus(corpus, &self.config.sibling_suffixes)?;
        if let Some(only) = opts.only.as_deref() {
            files.retain(|p| file_name_of(p).contains(only));
        }
        let total = files.len();
        info!("{} PDF(s) under {}", total, corpus.display());
        self.progress.on_run_start(total);

        let mut reports = Vec::with_capacity(total);
        for (i, path) in files.iter().enumerate() {
            let report = self.process_file(path, i + 1, total, opts).await;
            reports.push(report);
        }

        let summary = RunSummary {
            started_at,
            elapsed_ms: started.elapsed().as_millis() as u64,
            files: reports,
            corrupt_records: self.store.corrupt_entries(),
        };
        self.progress.on_run_complete(summary.total(), summary.complete());
        info!(
            "run finished: {} complete, {} failed, {} awaiting review",
            summary.complete(),
            summary.failed(),
            summary.awaiting_review()
        );
        Ok(summary)
    }

    /// Run the pending stages of one file.
    ///
    /// Files are identified by their location relative to the corpus root,
    /// so same-named books in different directories keep separate records.
    pub async fn process_file(
        &self,
        path: &Path,
        index: usize,
        total: usize,
        opts: &RunOptions,
    ) -> FileReport {
        let rel_dir = relative_dir(&self.config.corpus_dir, path);
        let location = location_key(&rel_dir, &file_name_of(path));
        self.progress.on_file_start(index, total, &location);

        let mut record = match self.store.find_by_location(&location).await {
            Some(r) => r,
            None => {
                debug!("new file: {}", location);
                ProcessingRecord::new(file_name_of(path)).in_dir(rel_dir.as_str())
            }
        };
        let mut report = FileReport::new(&location, &record.book_id);

        if !opts.retry_review && !record.status.all_done() {
            if let Some(reason) = self.review.reason(&location) {
                debug!("{}: on the review list ({}); skipping", location, reason);
                self.mark_skipped(&mut report, &record);
                report.review_reason = Some(reason);
                self.progress.on_file_complete(index, total, false);
                return report;
            }
        }

        if let Some(stage) = opts.force_from {
            if record.invalidate_from(stage) {
                info!(book_id = %record.book_id, "{}: forced re-run from {}", location, stage);
                if let Err(e) = self.store.save(&record).await {
                    self.fail(&mut report, &location, stage, &StageError::from(e)).await;
                    self.progress.on_file_complete(index, total, false);
                    return report;
                }
            }
        }

        let env = StageEnv {
            config: &self.config,
            collab: &self.collab,
            retry: self.config.retry_policy(),
        };
        let mut ctx = FileContext::new(path, record.clone());
        let mut blocked = false;
        for stage in Stage::ALL {
            if blocked {
                continue;
            }
            if record.is_done(stage) {
                report.set(stage, StageOutcome::Skipped);
                continue;
            }

            ctx.record = record.clone();
            let stage_started = Instant::now();
            match self.run_and_commit(stage, &env, &mut ctx, &mut record).await {
                Ok(()) => {
                    let elapsed_ms = stage_started.elapsed().as_millis() as u64;
                    debug!(book_id = %record.book_id, "{}: {} took {}ms", location, stage, elapsed_ms);
                    self.progress.on_stage_complete(&location, stage, elapsed_ms);
                    report.set(stage, StageOutcome::Completed { elapsed_ms });
                }
                Err(e) => {
                    // The rename stage may already have moved the file.
                    let current = location_key(&rel_dir, &ctx.file_name());
                    self.fail(&mut report, &current, stage, &e).await;
                    blocked = true;
                }
            }
        }
        report.final_name = location_key(&rel_dir, &ctx.file_name());

        let complete = report.is_complete();
        if report.failure().is_none() && self.review.contains(&location) {
            if let Err(e) = self.review.release(&location).await {
                warn!("cannot update review list: {}", e);
            }
        }
        self.progress.on_file_complete(index, total, complete);
        report
    }

    /// Run one stage and persist its result. The in-memory record only
    /// changes once the save succeeded.
    async fn run_and_commit(
        &self,
        stage: Stage,
        env: &StageEnv<'_>,
        ctx: &mut FileContext,
        record: &mut ProcessingRecord,
    ) -> Result<(), StageError> {
        run_stage(stage, env, ctx).await?;
        let mut next = record.clone();
        next.absorb(stage, &ctx.record);
        next.mark_done(stage)?;
        self.store.save(&next).await?;
        *record = next;
        Ok(())
    }

    /// Record a stage failure. `file_name` is the file's location now, which
    /// is where the next run will find it.
    async fn fail(&self, report: &mut FileReport, file_name: &str, stage: Stage, e: &StageError) {
        let kind = e.kind();
        let message = e.to_string();
        match kind {
            FailureKind::Transient | FailureKind::DataInsufficiency => {
                warn!(book_id = %report.book_id, "{}: {} failed [{}]: {}", file_name, stage, kind, message)
            }
            _ => error!(book_id = %report.book_id, "{}: {} failed [{}]: {}", file_name, stage, kind, message),
        }
        if kind == FailureKind::DataInsufficiency {
            if let Err(io) = self.review.flag(file_name, &message).await {
                warn!("cannot update review list: {}", io);
            }
        }
        self.progress.on_stage_error(file_name, stage, kind, &message);
        report.set(stage, StageOutcome::Failed { kind, message });
    }

    fn mark_skipped(&self, report: &mut FileReport, record: &ProcessingRecord) {
        for stage in Stage::ALL {
            if record.is_done(stage) {
                report.set(stage, StageOutcome::Skipped);
            }
        }
    }
}

