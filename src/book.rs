//! Book-level data produced by the pipeline stages.
//!
//! [`MetadataRecord`] is what the metadata stage persists under
//! `library/meta/`; [`OutlineNode`] trees are what the TOC stage persists
//! under `library/toc/`. Both are plain serde structs so the files stay
//! readable and hand-editable.

use serde::{Deserialize, Serialize};

/// Bibliographic description of one book.
///
/// Used for the locally extracted draft, the Google Books record, and the
/// merged result alike; [`MetadataRecord::merge`] combines the first two.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataRecord {
    pub title: String,
    pub subtitle: String,
    /// Title in the target language (Simplified Chinese).
    pub translated_title: String,
    pub authors: Vec<String>,
    pub publisher: String,
    /// As published: `2020`, `2020-05` or `2020-05-14`.
    pub published_date: String,
    /// Edition number; `None` or `Some(1)` for a first edition.
    pub edition: Option<u32>,
    /// Normalised ISBN-13 when known.
    pub isbn: String,
    pub categories: Vec<String>,
    pub description: String,
    pub translated_description: String,
    pub language: String,
    pub page_count: Option<u32>,
    /// Google Books volume id.
    pub google_id: String,
    pub cover_url: String,
}

impl MetadataRecord {
    /// Four-digit publication year, if the date carries one.
    pub fn year(&self) -> Option<u32> {
        let digits: String = self
            .published_date
            .chars()
            .skip_while(|c| !c.is_ascii_digit())
            .take_while(|c| c.is_ascii_digit())
            .collect();
        if digits.len() == 4 {
            digits.parse().ok()
        } else {
            None
        }
    }

    /// Edition worth mentioning in a file name (second or later).
    pub fn notable_edition(&self) -> Option<u32> {
        self.edition.filter(|n| *n > 1)
    }

    /// `title: subtitle`, or just the title.
    pub fn full_title(&self) -> String {
        if self.subtitle.trim().is_empty() {
            self.title.trim().to_string()
        } else {
            format!("{}: {}", self.title.trim(), self.subtitle.trim())
        }
    }

    /// Field-by-field merge: a non-empty `remote` value wins; otherwise the
    /// `local` value is kept.
    pub fn merge(local: MetadataRecord, remote: Option<MetadataRecord>) -> MetadataRecord {
        let Some(remote) = remote else {
            return local;
        };
        MetadataRecord {
            title: pick(remote.title, local.title),
            subtitle: pick(remote.subtitle, local.subtitle),
            translated_title: pick(remote.translated_title, local.translated_title),
            authors: pick_list(remote.authors, local.authors),
            publisher: pick(remote.publisher, local.publisher),
            published_date: pick(remote.published_date, local.published_date),
            edition: remote.edition.or(local.edition),
            isbn: pick(remote.isbn, local.isbn),
            categories: pick_list(remote.categories, local.categories),
            description: pick(remote.description, local.description),
            translated_description: pick(remote.translated_description, local.translated_description),
            language: pick(remote.language, local.language),
            page_count: remote.page_count.or(local.page_count),
            google_id: pick(remote.google_id, local.google_id),
            cover_url: pick(remote.cover_url, local.cover_url),
        }
    }
}

fn pick(remote: String, local: String) -> String {
    if remote.trim().is_empty() {
        local
    } else {
        remote
    }
}

fn pick_list(remote: Vec<String>, local: Vec<String>) -> Vec<String> {
    if remote.iter().all(|s| s.trim().is_empty()) {
        local
    } else {
        remote
    }
}

/// One bookmark as reported by a PDF source, in document order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutlineEntry {
    pub label: String,
    /// Depth, 0 for top-level bookmarks.
    pub level: u32,
    /// 1-based target page, when the bookmark has a destination.
    pub page: Option<u32>,
}

/// A node of the translated outline tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutlineNode {
    pub label: String,
    #[serde(default)]
    pub translated_label: String,
    pub level: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<OutlineNode>,
}

/// Build a forest from a flat pre-order list.
///
/// Each entry becomes the child of the nearest preceding entry with a
/// smaller level. Levels are kept exactly as given, so a jump from 0 to 2
/// still yields a level-2 node under the level-0 one.
pub fn build_forest(entries: &[OutlineEntry]) -> Vec<OutlineNode> {
    fn attach(forest: &mut Vec<OutlineNode>, node: OutlineNode) {
        match forest.last_mut() {
            Some(last) if last.level < node.level => attach(&mut last.children, node),
            _ => forest.push(node),
        }
    }

    let mut forest = Vec::new();
    for e in entries {
        attach(
            &mut forest,
            OutlineNode {
                label: e.label.clone(),
                translated_label: String::new(),
                level: e.level,
                page: e.page,
                children: Vec::new(),
            },
        );
    }
    forest
}

/// Pre-order traversal of every node.
pub fn flatten(forest: &[OutlineNode]) -> Vec<&OutlineNode> {
    fn walk<'a>(nodes: &'a [OutlineNode], out: &mut Vec<&'a OutlineNode>) {
        for n in nodes {
            out.push(n);
            walk(&n.children, out);
        }
    }
    let mut out = Vec::new();
    walk(forest, &mut out);
    out
}

/// Pre-order traversal with mutable access.
pub fn for_each_mut(forest: &mut [OutlineNode], f: &mut impl FnMut(&mut OutlineNode)) {
    for n in forest {
        f(n);
        for_each_mut(&mut n.children, f);
    }
}

/// The persisted translated outline of one book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TocDocument {
    pub book_id: String,
    pub nodes: Vec<OutlineNode>,
}

impl TocDocument {
    pub fn node_count(&self) -> usize {
        flatten(&self.nodes).len()
    }

    /// Whether this translation was made from exactly `entries`.
    pub fn matches_source(&self, entries: &[OutlineEntry]) -> bool {
        let nodes = flatten(&self.nodes);
        nodes.len() == entries.len()
            && nodes
                .iter()
                .zip(entries)
                .all(|(n, e)| n.label == e.label && n.level == e.level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entry(label: &str, level: u32) -> OutlineEntry {
        OutlineEntry {
            label: label.into(),
            level,
            page: None,
        }
    }

    #[test]
    fn merge_prefers_non_empty_remote() {
        let local = MetadataRecord {
            publisher: "A".into(),
            categories: vec!["X".into()],
            title: "Local Title".into(),
            ..Default::default()
        };
        let remote = MetadataRecord {
            publisher: "B".into(),
            title: "   ".into(),
            ..Default::default()
        };
        let merged = MetadataRecord::merge(local, Some(remote));
        assert_eq!(merged.publisher, "B");
        assert_eq!(merged.categories, vec!["X".to_string()]);
        assert_eq!(merged.title, "Local Title");
    }

    #[test]
    fn merge_without_remote_is_local() {
        let local = MetadataRecord {
            title: "T".into(),
            ..Default::default()
        };
        assert_eq!(MetadataRecord::merge(local.clone(), None), local);
    }

    #[test]
    fn year_from_dates() {
        let mut m = MetadataRecord::default();
        for (date, year) in [("2020", Some(2020)), ("2019-05-14", Some(2019)), ("c. 1998", Some(1998)), ("", None), ("May", None)] {
            m.published_date = date.into();
            assert_eq!(m.year(), year, "date {date:?}");
        }
    }

    #[test]
    fn forest_keeps_levels_and_order() {
        let entries = vec![
            entry("Part I", 0),
            entry("Chapter 1", 1),
            entry("1.1 Setup", 2),
            entry("Chapter 2", 1),
            entry("Deep jump", 3),
            entry("Index", 0),
        ];
        let forest = build_forest(&entries);
        assert_eq!(forest.len(), 2);
        assert_eq!(forest[0].children.len(), 2);
        assert_eq!(forest[0].children[1].children[0].level, 3);

        let flat: Vec<_> = flatten(&forest)
            .iter()
            .map(|n| (n.label.clone(), n.level))
            .collect();
        let expected: Vec<_> = entries.iter().map(|e| (e.label.clone(), e.level)).collect();
        assert_eq!(flat, expected);
    }

    #[test]
    fn leading_deep_entries_become_roots() {
        let forest = build_forest(&[entry("Orphan", 2), entry("Top", 0)]);
        assert_eq!(forest.len(), 2);
        assert_eq!(forest[0].level, 2);
    }

    #[test]
    fn toc_document_detects_source_changes() {
        let entries = vec![entry("Intro", 0), entry("Setup", 1)];
        let doc = TocDocument {
            book_id: "NLJR-X".into(),
            nodes: build_forest(&entries),
        };
        assert!(doc.matches_source(&entries));
        assert!(!doc.matches_source(&entries[..1]));
        assert!(!doc.matches_source(&[entry("Intro", 0), entry("Setup", 0)]));
        assert_eq!(doc.node_count(), 2);
    }

    fn children_are_deeper(nodes: &[OutlineNode]) -> bool {
        nodes.iter().all(|n| {
            n.children.iter().all(|c| c.level > n.level) && children_are_deeper(&n.children)
        })
    }

    proptest! {
        #[test]
        fn forest_round_trips_any_outline(
            levels in proptest::collection::vec(0u32..5, 0..40),
        ) {
            let entries: Vec<_> = levels
                .iter()
                .enumerate()
                .map(|(i, l)| entry(&format!("E{i}"), *l))
                .collect();
            let forest = build_forest(&entries);

            let doc = TocDocument { book_id: "NLJR-P".into(), nodes: forest };
            prop_assert!(doc.matches_source(&entries));
            prop_assert_eq!(doc.node_count(), entries.len());
            prop_assert!(children_are_deeper(&doc.nodes));
        }
    }
}
