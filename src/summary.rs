//! End-of-run report: per-file stage outcomes and failures grouped by kind.

use crate::error::FailureKind;
use crate::state::Stage;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// What happened to one stage of one file in this run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum StageOutcome {
    /// Already complete from an earlier run.
    Skipped,
    Completed { elapsed_ms: u64 },
    Failed { kind: FailureKind, message: String },
    /// An earlier stage failed, or the file is awaiting review.
    NotAttempted,
}

impl StageOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Skipped | Self::Completed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    /// Corpus-relative location (`dir/name`) when the run started.
    pub file: String,
    /// Location after this run (differs once renamed).
    pub final_name: String,
    pub book_id: String,
    pub stages: BTreeMap<Stage, StageOutcome>,
    /// Set when the file was skipped because it is on the review list.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_reason: Option<String>,
}

impl FileReport {
    pub fn new(file: impl Into<String>, book_id: impl Into<String>) -> Self {
        let file = file.into();
        Self {
            final_name: file.clone(),
            file,
            book_id: book_id.into(),
            stages: Stage::ALL
                .iter()
                .map(|s| (*s, StageOutcome::NotAttempted))
                .collect(),
            review_reason: None,
        }
    }

    pub fn set(&mut self, stage: Stage, outcome: StageOutcome) {
        self.stages.insert(stage, outcome);
    }

    pub fn outcome(&self, stage: Stage) -> &StageOutcome {
        self.stages.get(&stage).unwrap_or(&StageOutcome::NotAttempted)
    }

    /// Every stage is done, from this run or an earlier one.
    pub fn is_complete(&self) -> bool {
        self.stages.values().all(StageOutcome::is_done)
    }

    /// The failed stage, if any.
    pub fn failure(&self) -> Option<(Stage, FailureKind, &str)> {
        self.stages.iter().find_map(|(stage, o)| match o {
            StageOutcome::Failed { kind, message } => Some((*stage, *kind, message.as_str())),
            _ => None,
        })
    }

    /// Whether anything was actually run for this file.
    pub fn did_work(&self) -> bool {
        self.stages
            .values()
            .any(|o| matches!(o, StageOutcome::Completed { .. } | StageOutcome::Failed { .. }))
    }
}

/// One line of the grouped failure list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureEntry {
    pub file: String,
    /// `None` for failures not tied to a stage (an unreadable record file).
    pub stage: Option<Stage>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub files: Vec<FileReport>,
    /// Record files ignored as unreadable.
    pub corrupt_records: Vec<PathBuf>,
}

impl RunSummary {
    pub fn total(&self) -> usize {
        self.files.len()
    }

    pub fn complete(&self) -> usize {
        self.files.iter().filter(|f| f.is_complete()).count()
    }

    pub fn failed(&self) -> usize {
        self.files.iter().filter(|f| f.failure().is_some()).count()
    }

    pub fn awaiting_review(&self) -> usize {
        self.files.iter().filter(|f| f.review_reason.is_some()).count()
    }

    pub fn report(&self, file: &str) -> Option<&FileReport> {
        self.files.iter().find(|f| f.file == file)
    }

    /// Failures of this run grouped by kind, corrupt records included as
    /// [`FailureKind::StateCorruption`].
    pub fn failures_by_kind(&self) -> BTreeMap<FailureKind, Vec<FailureEntry>> {
        let mut out: BTreeMap<FailureKind, Vec<FailureEntry>> = BTreeMap::new();
        for f in &self.files {
            if let Some((stage, kind, message)) = f.failure() {
                out.entry(kind).or_default().push(FailureEntry {
                    file: f.file.clone(),
                    stage: Some(stage),
                    message: message.to_string(),
                });
            }
        }
        for path in &self.corrupt_records {
            out.entry(FailureKind::StateCorruption)
                .or_default()
                .push(FailureEntry {
                    file: path.display().to_string(),
                    stage: None,
                    message: "unreadable record ignored".into(),
                });
        }
        out
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} file(s): {} complete, {} failed, {} awaiting review ({:.1}s)",
            self.total(),
            self.complete(),
            self.failed(),
            self.awaiting_review(),
            self.elapsed_ms as f64 / 1000.0
        )?;
        for (kind, entries) in self.failures_by_kind() {
            writeln!(f, "  {} ({})", kind, entries.len())?;
            for e in entries {
                match e.stage {
                    Some(stage) => writeln!(f, "    {} [{}]: {}", e.file, stage, e.message)?,
                    None => writeln!(f, "    {}: {}", e.file, e.message)?,
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(file: &str, stage: Stage, kind: FailureKind) -> FileReport {
        let mut r = FileReport::new(file, "NLJR-1");
        for s in Stage::ALL.iter().filter(|s| **s < stage) {
            r.set(*s, StageOutcome::Skipped);
        }
        r.set(
            stage,
            StageOutcome::Failed {
                kind,
                message: "boom".into(),
            },
        );
        r
    }

    #[test]
    fn groups_failures_by_kind() {
        let mut done = FileReport::new("ok.pdf", "NLJR-2");
        for s in Stage::ALL {
            done.set(s, StageOutcome::Completed { elapsed_ms: 1 });
        }
        let summary = RunSummary {
            started_at: Utc::now(),
            elapsed_ms: 1500,
            files: vec![
                done,
                failed("a.pdf", Stage::ParseMetadata, FailureKind::DataInsufficiency),
                failed("b.pdf", Stage::RenameDone, FailureKind::NamingConflict),
                failed("c.pdf", Stage::ParseMetadata, FailureKind::DataInsufficiency),
            ],
            corrupt_records: vec![PathBuf::from("records/NLJR-X.json")],
        };
        assert_eq!(summary.complete(), 1);
        assert_eq!(summary.failed(), 3);

        let groups = summary.failures_by_kind();
        assert_eq!(groups[&FailureKind::DataInsufficiency].len(), 2);
        assert_eq!(groups[&FailureKind::NamingConflict][0].stage, Some(Stage::RenameDone));
        assert_eq!(groups[&FailureKind::StateCorruption][0].stage, None);

        let text = summary.to_string();
        assert!(text.starts_with("4 file(s): 1 complete, 3 failed, 0 awaiting review (1.5s)"));
        assert!(text.contains("    b.pdf [rename_done]: boom"));
    }

    #[test]
    fn serialises_outcomes_with_tags() {
        let r = failed("a.pdf", Stage::RenameDone, FailureKind::NamingConflict);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["stages"]["parse_metadata"]["outcome"], "skipped");
        assert_eq!(json["stages"]["rename_done"]["kind"], "naming-conflict");
        assert_eq!(json["stages"]["trans_toc"]["outcome"], "not-attempted");
        assert!(json.get("review_reason").is_none());
    }
}
