//! Corpus discovery and the manual-review list.

use crate::error::ShelfError;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Every primary PDF under `root`, sorted by path.
///
/// Files whose names end in one of `sibling_suffixes` are variants of another
/// book and are left to the rename stage of their primary. Hidden files and
/// directories (the state directory among them) are skipped. An unreadable
/// subdirectory is logged and skipped rather than aborting the scan.
pub fn scan_corpus(root: &Path, sibling_suffixes: &[String]) -> Result<Vec<PathBuf>, ShelfError> {
    if !root.is_dir() {
        return Err(ShelfError::CorpusNotFound {
            path: root.to_path_buf(),
        });
    }

    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name()));

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("corpus: skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            warn!("corpus: skipping non-UTF-8 file name {:?}", entry.path());
            continue;
        };
        if !name.to_ascii_lowercase().ends_with(".pdf") {
            continue;
        }
        if sibling_suffixes.iter().any(|s| name.ends_with(s.as_str())) {
            debug!("corpus: {} is a sibling variant", name);
            continue;
        }
        files.push(entry.into_path());
    }

    files.sort();
    Ok(files)
}

/// Directory of `path` relative to `root`, `/`-separated; empty for files
/// directly under `root` or outside it.
pub fn relative_dir(root: &Path, path: &Path) -> String {
    path.parent()
        .and_then(|p| p.strip_prefix(root).ok())
        .map(|p| {
            p.components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/")
        })
        .unwrap_or_default()
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().map(|n| n.starts_with('.')).unwrap_or(false)
}

/// Files that need a human before the pipeline touches them again.
///
/// Entries are keyed by the file's corpus-relative location (`dir/name`, or
/// `name` at the top level) as it is named now, renames included.
/// Persisted as `review.txt`, one `location<TAB>reason` per line, so it can
/// be edited by hand: deleting a line releases the file.
pub struct ReviewList {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl ReviewList {
    /// Load the list; a missing file is an empty list.
    pub async fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(text) => parse_review_list(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e),
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// A list that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: PathBuf::new(),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn contains(&self, file_name: &str) -> bool {
        self.lock().contains_key(file_name)
    }

    pub fn reason(&self, file_name: &str) -> Option<String> {
        self.lock().get(file_name).cloned()
    }

    pub fn entries(&self) -> Vec<(String, String)> {
        self.lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Add `file_name` unless already present. Appends a single line.
    pub async fn flag(&self, file_name: &str, reason: &str) -> std::io::Result<()> {
        let reason = reason.replace(['\n', '\r', '\t'], " ");
        {
            let mut entries = self.lock();
            if entries.contains_key(file_name) {
                return Ok(());
            }
            entries.insert(file_name.to_string(), reason.clone());
        }
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut f = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        f.write_all(format!("{file_name}\t{reason}\n").as_bytes())
            .await?;
        f.flush().await
    }

    /// Drop `file_name` from the list, rewriting the file.
    pub async fn release(&self, file_name: &str) -> std::io::Result<()> {
        let text = {
            let mut entries = self.lock();
            if entries.remove(file_name).is_none() {
                return Ok(());
            }
            entries
                .iter()
                .map(|(k, v)| format!("{k}\t{v}\n"))
                .collect::<String>()
        };
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }
        crate::state::store::write_bytes_atomic(&self.path, text.as_bytes()).await
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn parse_review_list(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty() && !l.starts_with('#'))
        .map(|l| match l.split_once('\t') {
            Some((name, reason)) => (name.to_string(), reason.to_string()),
            None => (l.to_string(), String::new()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn suffixes() -> Vec<String> {
        vec!["_dual.pdf".into(), "_translated.pdf".into()]
    }

    #[test]
    fn scan_skips_siblings_hidden_and_non_pdf() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::create_dir_all(root.join(".pdfshelf")).unwrap();
        for name in [
            "b.pdf",
            "a.PDF",
            "a_dual.pdf",
            "notes.txt",
            "sub/c.pdf",
            "sub/c_translated.pdf",
            ".pdfshelf/x.pdf",
            ".hidden.pdf",
        ] {
            std::fs::write(root.join(name), b"%PDF-1.7").unwrap();
        }

        let files = scan_corpus(root, &suffixes()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.strip_prefix(root).unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.PDF", "b.pdf", "sub/c.pdf"]);
    }

    #[test]
    fn relative_dirs_use_forward_slashes() {
        let root = Path::new("/books");
        assert_eq!(relative_dir(root, Path::new("/books/a.pdf")), "");
        assert_eq!(relative_dir(root, Path::new("/books/x/y/a.pdf")), "x/y");
        assert_eq!(relative_dir(root, Path::new("/elsewhere/a.pdf")), "");
    }

    #[test]
    fn missing_corpus_is_fatal() {
        let dir = TempDir::new().unwrap();
        let err = scan_corpus(&dir.path().join("nope"), &suffixes()).unwrap_err();
        assert!(matches!(err, ShelfError::CorpusNotFound { .. }));
    }

    #[tokio::test]
    async fn review_list_persists_and_releases() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("review.txt");

        let list = ReviewList::open(&path).await.unwrap();
        list.flag("a.pdf", "no copyright page\nfound").await.unwrap();
        list.flag("a.pdf", "again").await.unwrap();
        list.flag("b.pdf", "no outline").await.unwrap();

        let reopened = ReviewList::open(&path).await.unwrap();
        assert!(reopened.contains("a.pdf"));
        assert_eq!(reopened.reason("a.pdf").unwrap(), "no copyright page found");
        assert_eq!(reopened.entries().len(), 2);

        reopened.release("a.pdf").await.unwrap();
        let again = ReviewList::open(&path).await.unwrap();
        assert!(!again.contains("a.pdf"));
        assert!(again.contains("b.pdf"));
    }

    #[test]
    fn hand_edited_lines_parse() {
        let parsed = parse_review_list("# comment\nx.pdf\ny.pdf\tbad isbn\n\n");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["x.pdf"], "");
        assert_eq!(parsed["y.pdf"], "bad isbn");
    }
}
