//! Stage 2: normalised file name, applied to the PDF and its siblings.
//!
//! Name format: `Title (Year), NE - 译名.pdf`. Each optional segment is
//! omitted when empty, and the edition only appears from the second one on.
//! Names over the byte limit are shortened translated-title-first, then
//! title, and tagged with a `[xxxxxx]` suffix from the book id so two
//! truncated names stay distinct. Year, edition and extension are never cut.
//!
//! Siblings are files beside the PDF named `<old stem><suffix>` for one of
//! the configured suffixes (`_dual.pdf`, `_translated.pdf`, ...). They follow
//! the primary to `<new stem><suffix>`. The group moves all-or-nothing: if
//! any rename fails, the ones already applied are reversed.

use super::{file_name_of, FileContext, StageEnv};
use crate::book::MetadataRecord;
use crate::error::StageError;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

const EXTENSION: &str = ".pdf";
const FORBIDDEN: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

pub async fn run(env: &StageEnv<'_>, ctx: &mut FileContext) -> Result<(), StageError> {
    let tag = ctx.record.short_tag();
    let book_id = ctx.record.book_id.clone();
    let meta = ctx.metadata(env).await?.clone();

    let dir = ctx
        .path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let old_stem = pdf_stem(&ctx.file_name());
    let siblings = find_siblings(&dir, &old_stem, &env.config.sibling_suffixes);
    let reserve = siblings
        .iter()
        .map(|(_, suffix)| suffix.len())
        .max()
        .unwrap_or(0)
        .max(EXTENSION.len());

    let new_name = normalized_name(&meta, &tag, env.config.max_filename_bytes, reserve)
        .ok_or_else(|| StageError::DataInsufficiency("metadata has no usable title".into()))?;
    ctx.record.safe_title = new_name.clone();

    if !env.config.rename_files {
        info!(book_id = %book_id, "normalised name '{}' recorded (renaming disabled)", new_name);
        return Ok(());
    }

    let new_stem = pdf_stem(&new_name);
    let target = dir.join(&new_name);
    let mut moves = Vec::with_capacity(siblings.len() + 1);
    if target != ctx.path {
        moves.push(RenameMove::new(&ctx.path, &target));
    }
    for (path, suffix) in &siblings {
        let to = dir.join(format!("{new_stem}{suffix}"));
        if &to != path {
            moves.push(RenameMove::new(path, &to));
        }
    }

    for m in &moves {
        if m.to.exists() && !same_name_ignoring_case(&m.from, &m.to) {
            return Err(StageError::NamingConflict {
                target: m.to.clone(),
            });
        }
    }

    let applied = apply_moves(&moves, |from, to| std::fs::rename(from, to)).map_err(|report| {
        error!(book_id = %book_id, "{}", report);
        StageError::RenameAborted(report)
    })?;
    if applied == 0 {
        debug!(book_id = %book_id, "already named '{}'", new_name);
    } else {
        info!(
            book_id = %book_id,
            "renamed '{}' → '{}' ({} sibling(s))",
            file_name_of(&ctx.path),
            new_name,
            siblings.len()
        );
    }
    ctx.path = target;
    Ok(())
}

// ── Name construction ────────────────────────────────────────────────────

/// The normalised file name for `meta`, at most `max_bytes` long even when
/// the `.pdf` extension is replaced by a suffix of `reserve` bytes.
///
/// `None` when the title is empty after sanitising.
pub fn normalized_name(
    meta: &MetadataRecord,
    tag: &str,
    max_bytes: usize,
    reserve: usize,
) -> Option<String> {
    let title = sanitize(&meta.title);
    if title.is_empty() {
        return None;
    }
    let zh = sanitize(&meta.translated_title);

    let mut middle = String::new();
    if let Some(year) = meta.year() {
        middle.push_str(&format!(" ({year})"));
    }
    if let Some(edition) = meta.notable_edition() {
        middle.push_str(&format!(", {edition}E"));
    }

    let budget = max_bytes.saturating_sub(reserve.max(EXTENSION.len()));
    let full = join_stem(&title, &middle, &zh);
    if full.len() <= budget {
        return Some(format!("{full}{EXTENSION}"));
    }

    let tag = format!(" [{tag}]");
    let avail = budget.saturating_sub(tag.len() + middle.len());
    let (title, zh) = if title.len() + ZH_SEPARATOR.len() < avail {
        let zh_budget = avail - title.len() - ZH_SEPARATOR.len();
        (title, truncate_bytes(&zh, zh_budget).trim_end().to_string())
    } else {
        (truncate_bytes(&title, avail).trim_end().to_string(), String::new())
    };
    let stem = join_stem(&title, &middle, &zh);
    Some(format!("{stem}{tag}{EXTENSION}"))
}

const ZH_SEPARATOR: &str = " - ";

fn join_stem(title: &str, middle: &str, zh: &str) -> String {
    if zh.is_empty() {
        format!("{title}{middle}")
    } else {
        format!("{title}{middle}{ZH_SEPARATOR}{zh}")
    }
}

/// Drop characters that are illegal in file names on common filesystems and
/// collapse whitespace.
pub fn sanitize(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .filter(|c| !FORBIDDEN.contains(c) && !c.is_control())
        .collect();
    cleaned
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(['.', ' '])
        .to_string()
}

/// Longest prefix of `s` within `max` bytes, cut at a char boundary.
fn truncate_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// File name without a trailing `.pdf` (any case).
fn pdf_stem(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(EXTENSION) {
        name[..name.len() - EXTENSION.len()].to_string()
    } else {
        name.to_string()
    }
}

/// Existing `<stem><suffix>` files in `dir`, with the suffix that matched.
fn find_siblings(dir: &Path, stem: &str, suffixes: &[String]) -> Vec<(PathBuf, String)> {
    suffixes
        .iter()
        .map(|suffix| (dir.join(format!("{stem}{suffix}")), suffix.clone()))
        .filter(|(path, _)| path.is_file())
        .collect()
}

fn same_name_ignoring_case(a: &Path, b: &Path) -> bool {
    a.parent() == b.parent()
        && file_name_of(a).to_lowercase() == file_name_of(b).to_lowercase()
}

// ── All-or-nothing moves ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameMove {
    pub from: PathBuf,
    pub to: PathBuf,
}

impl RenameMove {
    pub fn new(from: impl Into<PathBuf>, to: impl Into<PathBuf>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

impl fmt::Display for RenameMove {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' → '{}'", file_name_of(&self.from), file_name_of(&self.to))
    }
}

/// What happened to a sibling group whose rename failed part-way.
#[derive(Debug, Clone, Default)]
pub struct RenameReport {
    /// The move that failed and why.
    pub failed: Option<(RenameMove, String)>,
    /// Moves that had succeeded before the failure.
    pub applied: Vec<RenameMove>,
    /// Applied moves that were reversed.
    pub rolled_back: Vec<RenameMove>,
    /// Applied moves whose reversal also failed; these need a human.
    pub rollback_failed: Vec<(RenameMove, String)>,
}

impl RenameReport {
    /// Whether the filesystem is back to where it started.
    pub fn fully_restored(&self) -> bool {
        self.rollback_failed.is_empty()
    }
}

impl fmt::Display for RenameReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.failed {
            Some((m, why)) => write!(f, "{m} failed ({why})")?,
            None => f.write_str("rename failed")?,
        }
        write!(
            f,
            "; {} of {} applied rename(s) rolled back",
            self.rolled_back.len(),
            self.applied.len()
        )?;
        if !self.rollback_failed.is_empty() {
            f.write_str("; NOT restored, fix by hand:")?;
            for (m, why) in &self.rollback_failed {
                write!(f, " {m} ({why})")?;
            }
        }
        Ok(())
    }
}

/// Apply `moves` in order. On the first failure, reverse every move already
/// applied (newest first) and report.
///
/// Returns the number of moves applied.
pub fn apply_moves<F>(moves: &[RenameMove], mut rename: F) -> Result<usize, RenameReport>
where
    F: FnMut(&Path, &Path) -> std::io::Result<()>,
{
    for (i, m) in moves.iter().enumerate() {
        if let Err(e) = rename(&m.from, &m.to) {
            let mut report = RenameReport {
                failed: Some((m.clone(), e.to_string())),
                applied: moves[..i].to_vec(),
                ..RenameReport::default()
            };
            for done in moves[..i].iter().rev() {
                match rename(&done.to, &done.from) {
                    Ok(()) => report.rolled_back.push(done.clone()),
                    Err(e) => report.rollback_failed.push((done.clone(), e.to_string())),
                }
            }
            return Err(report);
        }
    }
    Ok(moves.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn meta(title: &str, date: &str, edition: Option<u32>, zh: &str) -> MetadataRecord {
        MetadataRecord {
            title: title.into(),
            published_date: date.into(),
            edition,
            translated_title: zh.into(),
            ..Default::default()
        }
    }

    #[test]
    fn standard_format() {
        let m = meta("Example", "2020-03-27", None, "示例");
        assert_eq!(
            normalized_name(&m, "abc123", 255, 4).as_deref(),
            Some("Example (2020) - 示例.pdf")
        );
    }

    #[test]
    fn optional_segments() {
        let m = meta("Rust in Action", "2021", Some(2), "Rust 实战");
        assert_eq!(
            normalized_name(&m, "t", 255, 4).as_deref(),
            Some("Rust in Action (2021), 2E - Rust 实战.pdf")
        );
        let m = meta("Rust in Action", "", Some(1), "");
        assert_eq!(
            normalized_name(&m, "t", 255, 4).as_deref(),
            Some("Rust in Action.pdf")
        );
        assert_eq!(normalized_name(&meta("  ", "2020", None, "示例"), "t", 255, 4), None);
    }

    #[test]
    fn forbidden_characters_removed() {
        let m = meta("C/C++: A \"Guide\"?", "2019", None, "指南：入门");
        assert_eq!(
            normalized_name(&m, "t", 255, 4).as_deref(),
            Some("CC++ A Guide (2019) - 指南：入门.pdf")
        );
    }

    #[test]
    fn truncates_translation_before_title() {
        let zh = "很长的中文标题".repeat(10);
        let m = meta("Short Title", "2020", Some(3), &zh);
        let name = normalized_name(&m, "abc123", 80, 4).unwrap();
        assert!(name.len() <= 80, "{name} is {} bytes", name.len());
        assert!(name.starts_with("Short Title (2020), 3E - 很长"));
        assert!(name.ends_with(" [abc123].pdf"));
    }

    #[test]
    fn truncates_title_when_translation_is_not_enough() {
        let title = "Word ".repeat(40);
        let m = meta(&title, "2020", None, "示例");
        let name = normalized_name(&m, "abc123", 64, 4).unwrap();
        assert!(name.len() <= 64);
        assert!(name.contains(" (2020)"));
        assert!(!name.contains("示例"));
        assert!(name.ends_with(" [abc123].pdf"));
    }

    #[test]
    fn reserve_keeps_sibling_names_in_bounds() {
        let m = meta(&"x".repeat(300), "2020", None, "");
        let name = normalized_name(&m, "abc123", 100, "_translated.pdf".len()).unwrap();
        let sibling = format!("{}_translated.pdf", pdf_stem(&name));
        assert!(sibling.len() <= 100);
    }

    #[test]
    fn rollback_restores_applied_moves() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("book.pdf");
        let b = dir.path().join("book_dual.pdf");
        std::fs::write(&a, b"a").unwrap();
        std::fs::write(&b, b"b").unwrap();
        let moves = vec![
            RenameMove::new(&a, dir.path().join("New.pdf")),
            RenameMove::new(&b, dir.path().join("New_dual.pdf")),
        ];

        let mut calls = 0;
        let report = apply_moves(&moves, |from, to| {
            calls += 1;
            if calls == 2 {
                return Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "locked"));
            }
            std::fs::rename(from, to)
        })
        .unwrap_err();

        assert!(a.is_file());
        assert!(b.is_file());
        assert!(!dir.path().join("New.pdf").exists());
        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.rolled_back, vec![moves[0].clone()]);
        assert!(report.fully_restored());
        assert!(report.to_string().contains("1 of 1 applied rename(s) rolled back"));
    }

    #[test]
    fn failed_rollback_is_reported() {
        let moves = vec![RenameMove::new("/a", "/b"), RenameMove::new("/c", "/d")];
        let report = apply_moves(&moves, |from, _| {
            if from == Path::new("/a") {
                Ok(())
            } else {
                Err(std::io::Error::other("nope"))
            }
        })
        .unwrap_err();
        assert!(!report.fully_restored());
        assert!(report.to_string().contains("NOT restored"));
    }

    proptest! {
        #[test]
        fn names_never_exceed_limit(
            title in "\\PC{1,200}",
            zh in "\\PC{0,120}",
            year in 1900u32..2100,
            edition in proptest::option::of(1u32..20),
            max in 64usize..300,
        ) {
            let m = meta(&title, &year.to_string(), edition, &zh);
            if let Some(name) = normalized_name(&m, "abc123", max, "_translated.pdf".len()) {
                prop_assert!(name.ends_with(".pdf"));
                let sibling = format!("{}_translated.pdf", pdf_stem(&name));
                prop_assert!(sibling.len() <= max, "{} > {}", sibling.len(), max);
                let year_tag = format!("({year})");
                prop_assert!(name.contains(&year_tag));
            }
        }
    }
}
