//! The per-book processing record and its stage flags.

use crate::error::StateError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

const BOOK_ID_PREFIX: &str = "NLJR-";

/// The four pipeline stages, in dependency order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    ParseMetadata,
    RenameDone,
    TransToc,
    BuildMd,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::ParseMetadata,
        Stage::RenameDone,
        Stage::TransToc,
        Stage::BuildMd,
    ];

    /// Flag name as persisted in the record.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::ParseMetadata => "parse_metadata",
            Stage::RenameDone => "rename_done",
            Stage::TransToc => "trans_toc",
            Stage::BuildMd => "build_md",
        }
    }

    /// The stage that must be complete before this one may run.
    pub fn requires(&self) -> Option<Stage> {
        match self {
            Stage::ParseMetadata => None,
            Stage::RenameDone => Some(Stage::ParseMetadata),
            Stage::TransToc => Some(Stage::RenameDone),
            Stage::BuildMd => Some(Stage::TransToc),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    /// Accepts the flag name or a short alias (`parse`, `rename`, `toc`, `build`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "parse_metadata" | "parse" | "metadata" => Ok(Stage::ParseMetadata),
            "rename_done" | "rename" => Ok(Stage::RenameDone),
            "trans_toc" | "toc" => Ok(Stage::TransToc),
            "build_md" | "build" | "md" => Ok(Stage::BuildMd),
            other => Err(format!(
                "unknown stage '{other}' (expected parse, rename, toc or build)"
            )),
        }
    }
}

/// Completion flags, serialised as `{"parse_metadata": true, ...}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFlags {
    #[serde(default)]
    pub parse_metadata: bool,
    #[serde(default)]
    pub rename_done: bool,
    #[serde(default)]
    pub trans_toc: bool,
    #[serde(default)]
    pub build_md: bool,
}

impl StageFlags {
    pub fn is_done(&self, stage: Stage) -> bool {
        match stage {
            Stage::ParseMetadata => self.parse_metadata,
            Stage::RenameDone => self.rename_done,
            Stage::TransToc => self.trans_toc,
            Stage::BuildMd => self.build_md,
        }
    }

    fn set(&mut self, stage: Stage, value: bool) {
        match stage {
            Stage::ParseMetadata => self.parse_metadata = value,
            Stage::RenameDone => self.rename_done = value,
            Stage::TransToc => self.trans_toc = value,
            Stage::BuildMd => self.build_md = value,
        }
    }

    pub fn all_done(&self) -> bool {
        Stage::ALL.iter().all(|s| self.is_done(*s))
    }

    /// No later flag is set while an earlier one is clear.
    pub fn is_ordered(&self) -> bool {
        Stage::ALL
            .windows(2)
            .all(|w| !self.is_done(w[1]) || self.is_done(w[0]))
    }
}

/// Durable per-file state: the source of truth for resumability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    /// Stable identifier, generated once and never changed.
    pub book_id: String,

    pub status: StageFlags,

    /// Normalised ISBN-13, empty until the metadata stage finds one.
    #[serde(default)]
    pub norm_isbn: String,

    /// File name when the file was first seen.
    pub standard_name: String,

    /// Directory of the file relative to the corpus root, `/`-separated,
    /// empty at the top level. Books with the same name in different
    /// directories are different books.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rel_dir: String,

    /// Normalised file name chosen by the rename stage.
    #[serde(default)]
    pub safe_title: String,

    /// File name of the metadata record under `library/meta/`.
    #[serde(default)]
    pub meta_json: String,

    /// File name of the translated outline under `library/toc/`.
    #[serde(default)]
    pub toc_file: String,

    /// File name of the Markdown card under `library/`.
    #[serde(default)]
    pub md_file: String,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl ProcessingRecord {
    /// A fresh record for a file seen for the first time.
    pub fn new(file_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            book_id: new_book_id(),
            status: StageFlags::default(),
            norm_isbn: String::new(),
            standard_name: file_name.into(),
            rel_dir: String::new(),
            safe_title: String::new(),
            meta_json: String::new(),
            toc_file: String::new(),
            md_file: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Place the record in a corpus subdirectory.
    pub fn in_dir(mut self, rel_dir: impl Into<String>) -> Self {
        self.rel_dir = rel_dir.into();
        self
    }

    pub fn is_done(&self, stage: Stage) -> bool {
        self.status.is_done(stage)
    }

    /// Set a stage flag. Refuses if the stage it depends on is not done.
    pub fn mark_done(&mut self, stage: Stage) -> Result<(), StateError> {
        if let Some(req) = stage.requires() {
            if !self.status.is_done(req) {
                return Err(StateError::OrderViolation {
                    stage: stage.as_str(),
                    requires: req.as_str(),
                });
            }
        }
        self.status.set(stage, true);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Clear `stage` and every later stage. The only way a flag goes back
    /// to false.
    pub fn invalidate_from(&mut self, stage: Stage) -> bool {
        let mut changed = false;
        for s in Stage::ALL.iter().filter(|s| **s >= stage) {
            if self.status.is_done(*s) {
                self.status.set(*s, false);
                changed = true;
            }
        }
        if changed {
            self.updated_at = Utc::now();
        }
        changed
    }

    /// Clear every flag after the first clear one. Returns whether anything
    /// changed, i.e. whether the record was inconsistent.
    pub fn repair_ordering(&mut self) -> bool {
        match Stage::ALL.iter().find(|s| !self.status.is_done(**s)) {
            Some(first_open) => self.invalidate_from(*first_open),
            None => false,
        }
    }

    /// Copy what a stage handler produced from its working copy.
    ///
    /// Identity fields are never taken from the copy. `norm_isbn` is only
    /// taken while empty, `safe_title` only while the rename stage is open.
    pub fn absorb(&mut self, stage: Stage, work: &ProcessingRecord) {
        if self.norm_isbn.is_empty() {
            self.norm_isbn = work.norm_isbn.clone();
        }
        if !self.status.rename_done {
            self.safe_title = work.safe_title.clone();
        }
        match stage {
            Stage::ParseMetadata => self.meta_json = work.meta_json.clone(),
            Stage::RenameDone => {}
            Stage::TransToc => self.toc_file = work.toc_file.clone(),
            Stage::BuildMd => self.md_file = work.md_file.clone(),
        }
    }

    /// Corpus-relative paths this record answers to: the original name and,
    /// once chosen, the normalised one.
    pub fn locations(&self) -> Vec<String> {
        let mut out = vec![location_key(&self.rel_dir, &self.standard_name)];
        if !self.safe_title.is_empty() {
            out.push(location_key(&self.rel_dir, &self.safe_title));
        }
        out
    }

    /// Whether this record describes the file at corpus-relative `location`.
    pub fn matches_location(&self, location: &str) -> bool {
        self.locations().iter().any(|l| l == location)
    }

    /// Suffix appended to truncated file names to keep them distinct.
    pub fn short_tag(&self) -> String {
        let tail: String = self
            .book_id
            .chars()
            .rev()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(6)
            .collect();
        tail.chars().rev().collect::<String>().to_ascii_lowercase()
    }
}

/// `dir/name`, or just `name` at the corpus top level.
pub fn location_key(rel_dir: &str, file_name: &str) -> String {
    if rel_dir.is_empty() {
        file_name.to_string()
    } else {
        format!("{rel_dir}/{file_name}")
    }
}

/// `NLJR-` followed by 12 upper-case alphanumerics.
pub fn new_book_id() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    format!("{BOOK_ID_PREFIX}{}", raw[..12].to_ascii_uppercase())
}

/// A book identifier must be usable verbatim as a file stem.
pub fn validate_book_id(id: &str) -> Result<(), StateError> {
    let ok = !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(StateError::InvalidBookId(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_record_is_empty() {
        let r = ProcessingRecord::new("book.pdf");
        assert!(r.book_id.starts_with("NLJR-"));
        assert_eq!(r.book_id.len(), 17);
        assert!(validate_book_id(&r.book_id).is_ok());
        assert!(Stage::ALL.iter().all(|s| !r.is_done(*s)));
        assert_eq!(r.standard_name, "book.pdf");
    }

    #[test]
    fn book_ids_are_unique() {
        assert_ne!(new_book_id(), new_book_id());
    }

    #[test]
    fn mark_done_enforces_order() {
        let mut r = ProcessingRecord::new("a.pdf");
        assert!(r.mark_done(Stage::RenameDone).is_err());
        r.mark_done(Stage::ParseMetadata).unwrap();
        r.mark_done(Stage::RenameDone).unwrap();
        assert!(r.mark_done(Stage::BuildMd).is_err());
        assert!(r.status.is_ordered());
    }

    #[test]
    fn invalidate_clears_later_stages() {
        let mut r = ProcessingRecord::new("a.pdf");
        for s in Stage::ALL {
            r.mark_done(s).unwrap();
        }
        assert!(r.invalidate_from(Stage::TransToc));
        assert!(r.is_done(Stage::RenameDone));
        assert!(!r.is_done(Stage::TransToc));
        assert!(!r.is_done(Stage::BuildMd));
        assert!(!r.invalidate_from(Stage::TransToc));
    }

    #[test]
    fn repair_clears_flags_after_gap() {
        let mut r = ProcessingRecord::new("a.pdf");
        r.status = StageFlags {
            parse_metadata: true,
            rename_done: false,
            trans_toc: true,
            build_md: true,
        };
        assert!(!r.status.is_ordered());
        assert!(r.repair_ordering());
        assert!(r.status.is_ordered());
        assert!(r.is_done(Stage::ParseMetadata));
        assert!(!r.is_done(Stage::TransToc));
    }

    #[test]
    fn absorb_keeps_identity_and_isbn() {
        let mut r = ProcessingRecord::new("a.pdf");
        r.norm_isbn = "9780000000002".into();
        let mut work = r.clone();
        work.book_id = "NLJR-TAMPERED00".into();
        work.standard_name = "b.pdf".into();
        work.norm_isbn = "9781111111113".into();
        work.meta_json = "x.json".into();
        r.absorb(Stage::ParseMetadata, &work);
        assert_ne!(r.book_id, "NLJR-TAMPERED00");
        assert_eq!(r.standard_name, "a.pdf");
        assert_eq!(r.norm_isbn, "9780000000002");
        assert_eq!(r.meta_json, "x.json");
    }

    #[test]
    fn safe_title_frozen_after_rename() {
        let mut r = ProcessingRecord::new("a.pdf");
        r.mark_done(Stage::ParseMetadata).unwrap();
        r.safe_title = "A (2020).pdf".into();
        r.mark_done(Stage::RenameDone).unwrap();
        let mut work = r.clone();
        work.safe_title = "B.pdf".into();
        r.absorb(Stage::TransToc, &work);
        assert_eq!(r.safe_title, "A (2020).pdf");
    }

    #[test]
    fn location_includes_the_directory() {
        let mut r = ProcessingRecord::new("book.pdf").in_dir("a/b");
        r.safe_title = "Example (2020).pdf".into();
        assert!(r.matches_location("a/b/book.pdf"));
        assert!(r.matches_location("a/b/Example (2020).pdf"));
        assert!(!r.matches_location("book.pdf"));
        assert!(!r.matches_location("c/book.pdf"));

        let top = ProcessingRecord::new("book.pdf");
        assert!(top.matches_location("book.pdf"));
        let json = serde_json::to_value(&top).unwrap();
        assert!(json.get("rel_dir").is_none());
    }

    #[test]
    fn stage_parsing() {
        assert_eq!("toc".parse::<Stage>().unwrap(), Stage::TransToc);
        assert_eq!("rename_done".parse::<Stage>().unwrap(), Stage::RenameDone);
        assert!("publish".parse::<Stage>().is_err());
    }

    #[test]
    fn status_serialises_with_flag_names() {
        let r = ProcessingRecord::new("a.pdf");
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["status"]["parse_metadata"], false);
        assert_eq!(json["status"]["build_md"], false);
        assert_eq!(json["standard_name"], "a.pdf");
    }

    #[test]
    fn invalid_ids_rejected() {
        assert!(validate_book_id("../etc/passwd").is_err());
        assert!(validate_book_id("").is_err());
        assert!(validate_book_id("NLJR-ABC123").is_ok());
    }
}
