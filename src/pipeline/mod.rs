//! The four per-book stages.
//!
//! Each submodule implements exactly one stage. A stage reads what earlier
//! stages persisted, does its work, writes its artefact, and records the
//! artefact's name on the working copy of the [`ProcessingRecord`] it was
//! handed. It never touches the state store: the driver decides what gets
//! persisted.
//!
//! ## Data Flow
//!
//! ```text
//! metadata ──▶ rename ──▶ toc ──▶ document
//! (meta/<id>.json) (PDF + siblings) (toc/<id>.json) (<slug>.md, covers/<id>.jpg)
//! ```
//!
//! 1. [`metadata`]: copyright page → LLM draft → ISBN lookup → merged,
//!    translated [`MetadataRecord`]
//! 2. [`rename`]  : deterministic, byte-bounded file name; renames the PDF
//!    and its sibling variants all-or-nothing
//! 3. [`toc`]     : bookmark forest → translated forest of identical shape
//! 4. [`document`]: Markdown card from metadata, cover and outline

pub mod document;
pub mod metadata;
pub mod rename;
pub mod toc;

use crate::backends::Collaborators;
use crate::book::MetadataRecord;
use crate::config::PipelineConfig;
use crate::error::StageError;
use crate::retry::RetryPolicy;
use crate::state::store::{write_json_atomic, AtomicWriteError};
use crate::state::{ProcessingRecord, Stage};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Everything a stage may consult that is shared across files.
pub struct StageEnv<'a> {
    pub config: &'a PipelineConfig,
    pub collab: &'a Collaborators,
    pub retry: RetryPolicy,
}

/// Per-file scratch state carried from stage to stage within one run.
pub struct FileContext {
    /// Where the PDF is right now; moves when the rename stage succeeds.
    pub path: PathBuf,
    /// Working copy of the record. Only what the driver absorbs is kept.
    pub record: ProcessingRecord,
    metadata: Option<MetadataRecord>,
}

impl FileContext {
    pub fn new(path: impl Into<PathBuf>, record: ProcessingRecord) -> Self {
        Self {
            path: path.into(),
            record,
            metadata: None,
        }
    }

    pub fn file_name(&self) -> String {
        file_name_of(&self.path)
    }

    /// The merged metadata, from this run's cache or `meta/<meta_json>`.
    pub async fn metadata(&mut self, env: &StageEnv<'_>) -> Result<&MetadataRecord, StageError> {
        let metadata = match self.metadata.take() {
            Some(m) => m,
            None => {
                if self.record.meta_json.is_empty() {
                    return Err(StageError::DataInsufficiency(
                        "no metadata record; re-run with --force parse".into(),
                    ));
                }
                let path = env.config.meta_dir().join(&self.record.meta_json);
                read_json(&path).await?.ok_or_else(|| {
                    StageError::DataInsufficiency(format!(
                        "metadata record '{}' is missing; re-run with --force parse",
                        path.display()
                    ))
                })?
            }
        };
        Ok(self.metadata.insert(metadata))
    }

    pub fn set_metadata(&mut self, metadata: MetadataRecord) {
        self.metadata = Some(metadata);
    }
}

/// Run one stage against `ctx`.
pub async fn run_stage(
    stage: Stage,
    env: &StageEnv<'_>,
    ctx: &mut FileContext,
) -> Result<(), StageError> {
    match stage {
        Stage::ParseMetadata => metadata::run(env, ctx).await,
        Stage::RenameDone => rename::run(env, ctx).await,
        Stage::TransToc => toc::run(env, ctx).await,
        Stage::BuildMd => document::run(env, ctx).await,
    }
}

// ── Artefact I/O ─────────────────────────────────────────────────────────

pub(crate) fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Read a JSON artefact. `Ok(None)` when the file does not exist.
pub(crate) async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StageError> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StageError::io(path, e)),
    };
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|e| StageError::Malformed {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
}

/// Atomically write a JSON artefact.
pub(crate) async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StageError> {
    write_json_atomic(path, value).await.map_err(|e| match e {
        AtomicWriteError::Io(source) => StageError::io(path, source),
        AtomicWriteError::Serialise(detail) => StageError::Malformed {
            path: path.to_path_buf(),
            detail,
        },
    })
}
