//! Error types for the pdfshelf library.
//!
//! Three layers of failure, from widest to narrowest blast radius:
//!
//! * [`ShelfError`] (fatal): the run cannot start at all (bad
//!   configuration, corpus directory missing, pdfium cannot be bound).
//!   Returned as `Err(ShelfError)` from [`crate::Pipeline::run`].
//!
//! * [`StageError`] (per file, per stage): one stage of one book failed.
//!   The driver catches it at the stage boundary, records it in the
//!   [`crate::summary::RunSummary`] and moves on to the next file. Every
//!   variant maps onto one [`FailureKind`] so the end-of-run report can group
//!   failures the way an operator fixes them.
//!
//! * [`CollaboratorError`]: a single call to an external capability (LLM,
//!   Google Books, pdfium, cover download) failed. Transient errors are
//!   retried by [`crate::retry::RetryPolicy`]; whatever survives the retries
//!   becomes a [`StageError`].
//!
//! [`StateError`] sits beside them: problems reading or writing the
//! per-book state records.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the pdfshelf library.
#[derive(Debug, Error)]
pub enum ShelfError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// The corpus directory does not exist or is not a directory.
    #[error("Corpus directory not found: '{}'\nSet EBOOKS_PATH in the config file or pass --corpus.", path.display())]
    CorpusNotFound { path: PathBuf },

    /// Walking the corpus failed part-way (permission denied on a subtree, ...).
    #[error("Failed to scan corpus '{}': {detail}", path.display())]
    ScanFailed { path: PathBuf, detail: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The settings file could not be read or parsed.
    #[error("Failed to load settings from '{}': {detail}", path.display())]
    SettingsUnreadable { path: PathBuf, detail: String },

    /// `--env` named a section that the settings file does not contain.
    #[error("Environment '{name}' not found in settings.\nAvailable: {available}")]
    UnknownEnvironment { name: String, available: String },

    // ── Collaborator setup ────────────────────────────────────────────────
    /// The configured LLM provider could not be initialised.
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// Building the HTTP client failed (bad proxy URL, TLS backend).
    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),

    // ── Pdfium binding errors ─────────────────────────────────────────────
    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Install pdfium for your platform (https://github.com/bblanchon/pdfium-binaries)\n\
and either put it on the system library path or set PDFIUM_LIB_DIR to the\n\
directory that contains libpdfium.\n"
    )]
    PdfiumBindingFailed(String),

    // ── State errors ──────────────────────────────────────────────────────
    /// The state store could not be opened.
    #[error(transparent)]
    State(#[from] StateError),
}

/// Problems with the persisted per-book records.
#[derive(Debug, Error)]
pub enum StateError {
    /// Reading or writing a record file failed at the OS level.
    #[error("State I/O on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A record could not be serialised.
    #[error("Failed to serialise record '{book_id}': {detail}")]
    Serialise { book_id: String, detail: String },

    /// The identifier contains characters unsafe for a file name.
    #[error("Invalid book identifier '{0}'")]
    InvalidBookId(String),

    /// A stage flag was set before the stage it depends on.
    #[error("Stage '{stage}' cannot complete before '{requires}'")]
    OrderViolation {
        stage: &'static str,
        requires: &'static str,
    },
}

/// A failed call to an external capability.
#[derive(Debug, Clone, Error)]
pub enum CollaboratorError {
    /// Network blip, rate limit, 5xx: worth retrying.
    #[error("{service}: transient failure: {detail}")]
    Transient { service: String, detail: String },

    /// Bad credentials, malformed request, unparseable response.
    #[error("{service}: {detail}")]
    Permanent { service: String, detail: String },

    /// Every retry of a transient failure was used up.
    #[error("{service}: gave up after {attempts} attempts: {last}")]
    Exhausted {
        service: String,
        attempts: u32,
        last: String,
    },

    /// The PDF itself could not be opened or read.
    #[error("Cannot read PDF '{}': {detail}", path.display())]
    Document { path: PathBuf, detail: String },
}

impl CollaboratorError {
    pub fn transient(service: impl Into<String>, detail: impl fmt::Display) -> Self {
        Self::Transient {
            service: service.into(),
            detail: detail.to_string(),
        }
    }

    pub fn permanent(service: impl Into<String>, detail: impl fmt::Display) -> Self {
        Self::Permanent {
            service: service.into(),
            detail: detail.to_string(),
        }
    }

    /// Whether [`crate::retry::RetryPolicy`] should try again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

// ── Failure taxonomy ─────────────────────────────────────────────────────

/// How a stage failure should be handled by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// External service failed after bounded retries; re-run later.
    Transient,
    /// External service refused the request (credentials, content filter,
    /// unusable reply). Re-running alone will not help.
    Rejected,
    /// The book lacks what the stage needs (no copyright page, no ISBN,
    /// no outline); flagged for manual review.
    DataInsufficiency,
    /// The normalised name collides with a different file.
    NamingConflict,
    /// A persisted record was unreadable and has been ignored.
    StateCorruption,
    /// The PDF or an output file could not be read or written.
    Io,
    /// The stage ran but its record could not be persisted.
    StateWrite,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Rejected => "rejected",
            Self::DataInsufficiency => "data-insufficiency",
            Self::NamingConflict => "naming-conflict",
            Self::StateCorruption => "state-corruption",
            Self::Io => "io",
            Self::StateWrite => "state-write",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure of one stage for one file.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    External(#[from] CollaboratorError),

    #[error("insufficient data: {0}")]
    DataInsufficiency(String),

    #[error("target '{}' already exists and is a different file", target.display())]
    NamingConflict { target: PathBuf },

    /// Some renames of a sibling group failed; see the report for what was
    /// undone.
    #[error("sibling rename failed: {0}")]
    RenameAborted(crate::pipeline::rename::RenameReport),

    #[error("I/O on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed artefact '{}': {detail}", path.display())]
    Malformed { path: PathBuf, detail: String },

    #[error(transparent)]
    State(#[from] StateError),
}

impl StageError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::External(CollaboratorError::Document { .. }) => FailureKind::Io,
            Self::External(CollaboratorError::Permanent { .. }) => FailureKind::Rejected,
            Self::External(_) => FailureKind::Transient,
            Self::DataInsufficiency(_) => FailureKind::DataInsufficiency,
            Self::NamingConflict { .. } => FailureKind::NamingConflict,
            Self::RenameAborted(_) | Self::Io { .. } | Self::Malformed { .. } => FailureKind::Io,
            Self::State(_) => FailureKind::StateWrite,
        }
    }
}
