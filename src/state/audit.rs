//! Consistency report over all stored records.
//!
//! Read-only: nothing here deletes or rewrites a record. Duplicate ISBNs
//! usually mean the same book exists twice in the corpus under different
//! names; records without a normalised name after the rename stage point at
//! hand edits gone wrong.

use super::record::{ProcessingRecord, Stage};
use super::store::StateStore;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Default, Serialize)]
pub struct AuditReport {
    pub total: usize,
    pub complete: usize,
    /// Records per pipeline position: how many stopped before each stage.
    pub pending_by_stage: BTreeMap<String, usize>,
    /// ISBN → book ids sharing it.
    pub duplicate_isbns: BTreeMap<String, Vec<String>>,
    /// Book ids marked renamed but carrying no normalised name.
    pub missing_safe_title: Vec<String>,
    pub corrupt_files: Vec<PathBuf>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.duplicate_isbns.is_empty()
            && self.missing_safe_title.is_empty()
            && self.corrupt_files.is_empty()
    }
}

pub async fn audit(store: &dyn StateStore) -> AuditReport {
    let records = store.list().await;
    let mut report = AuditReport {
        total: records.len(),
        corrupt_files: store.corrupt_entries(),
        ..Default::default()
    };

    let mut by_isbn: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for r in &records {
        match next_stage(r) {
            None => report.complete += 1,
            Some(stage) => *report.pending_by_stage.entry(stage.to_string()).or_default() += 1,
        }
        if !r.norm_isbn.is_empty() {
            by_isbn
                .entry(r.norm_isbn.clone())
                .or_default()
                .push(r.book_id.clone());
        }
        if r.is_done(Stage::RenameDone) && r.safe_title.trim().is_empty() {
            report.missing_safe_title.push(r.book_id.clone());
        }
    }
    report.duplicate_isbns = by_isbn.into_iter().filter(|(_, ids)| ids.len() > 1).collect();
    report
}

fn next_stage(r: &ProcessingRecord) -> Option<Stage> {
    Stage::ALL.into_iter().find(|s| !r.is_done(*s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::store::MemoryStateStore;

    #[tokio::test]
    async fn reports_duplicates_and_progress() {
        let store = MemoryStateStore::new();

        let mut a = ProcessingRecord::new("a.pdf");
        a.norm_isbn = "9789351342939".into();
        a.mark_done(Stage::ParseMetadata).unwrap();
        let mut b = ProcessingRecord::new("b.pdf");
        b.norm_isbn = "9789351342939".into();
        for s in Stage::ALL {
            b.mark_done(s).unwrap();
        }
        b.safe_title = "B (2020).pdf".into();
        let mut c = ProcessingRecord::new("c.pdf");
        c.mark_done(Stage::ParseMetadata).unwrap();
        c.mark_done(Stage::RenameDone).unwrap();
        store.insert(a.clone());
        store.insert(b.clone());
        store.insert(c.clone());

        let report = audit(&store).await;
        assert_eq!(report.total, 3);
        assert_eq!(report.complete, 1);
        assert_eq!(report.pending_by_stage["rename_done"], 1);
        assert_eq!(report.pending_by_stage["trans_toc"], 1);
        assert_eq!(report.duplicate_isbns["9789351342939"].len(), 2);
        assert_eq!(report.missing_safe_title, vec![c.book_id]);
        assert!(!report.is_clean());
    }
}
