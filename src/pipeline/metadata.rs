//! Stage 1: copyright page → normalised, translated metadata record.
//!
//! The copyright page is found by markers in the first
//! `copyright_scan_pages` pages; text up to and including it is handed to
//! the [`MetadataExtractor`](crate::backends::MetadataExtractor). When no
//! page carries a text layer at all the first `ocr_pages` pages are OCR'd
//! instead. A draft is then enriched from the ISBN lookup and the title is
//! translated.
//!
//! The stage fails with data-insufficiency only when there is neither a
//! copyright page nor a recoverable ISBN. Everything after that is
//! best-effort: a missing lookup hit or a failed title translation leaves the
//! corresponding fields empty.

use super::{write_json, FileContext, StageEnv};
use crate::book::MetadataRecord;
use crate::error::{CollaboratorError, StageError};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

/// Domain hints passed to the translator.
pub const TITLE_HINT: &str = "a book title";
pub const DESCRIPTION_HINT: &str = "a book description";

/// A translated title longer than this (in characters) is retried with the
/// main title alone, without the subtitle.
const MAX_TRANSLATED_TITLE_CHARS: usize = 50;

static COPYRIGHT_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:(?i)copyright)|©|ISBN|版权").unwrap());

static LABELLED_ISBN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)ISBN(?:-1[03])?[:：\s]*([0-9][0-9Xx\-‐]{8,20})").unwrap());

static BARE_ISBN13: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(97[89](?:[\-‐ ]?[0-9]){10})\b").unwrap());

static EDITION_NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(\d{1,2})\s*(?:st|nd|rd|th)?\s+(?:edition|ed\.)").unwrap()
});

static EDITION_AFTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bedition\s*[:：]?\s*(\d{1,2})\b").unwrap());

static EDITION_WORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(first|second|third|fourth|fifth|sixth|seventh|eighth|ninth|tenth|eleventh|twelfth)\s+(?:edition|ed\.)",
    )
    .unwrap()
});

static EDITION_ZH: Lazy<Regex> = Lazy::new(|| Regex::new(r"第\s*(\d{1,2})\s*版").unwrap());

pub async fn run(env: &StageEnv<'_>, ctx: &mut FileContext) -> Result<(), StageError> {
    let collab = env.collab;
    let book_id = ctx.record.book_id.clone();

    let pages = page_texts(env, ctx).await?;
    let copyright_page = find_copyright_page(&pages);
    let text = match copyright_page {
        Some(idx) => {
            debug!(book_id = %book_id, "copyright page is page {}", idx + 1);
            pages[..=idx].join("\n\n")
        }
        None => pages.join("\n\n"),
    };

    let text_isbn = find_isbn(&text);
    if copyright_page.is_none() && text_isbn.is_none() {
        return Err(StageError::DataInsufficiency(format!(
            "no copyright page in the first {} pages and no ISBN in the text",
            pages.len()
        )));
    }

    let draft = match env
        .retry
        .run("metadata-extractor", || collab.extractor.infer_metadata(&text))
        .await
    {
        Ok(draft) => draft,
        Err(e @ CollaboratorError::Permanent { .. }) => {
            warn!(book_id = %book_id, "metadata extraction failed ({}); using pattern fallback", e);
            fallback_draft(&text)
        }
        Err(e) => return Err(e.into()),
    };

    let norm_isbn = normalize_isbn(&draft.isbn)
        .or(text_isbn)
        .unwrap_or_default();
    if norm_isbn.is_empty() {
        warn!(book_id = %book_id, "no valid ISBN found; skipping lookup");
    }

    let remote = if norm_isbn.is_empty() {
        None
    } else {
        match env
            .retry
            .run("book-lookup", || collab.lookup.lookup_by_isbn(&norm_isbn))
            .await
        {
            Ok(found) => {
                if found.is_none() {
                    info!(book_id = %book_id, "ISBN {} unknown to lookup; keeping local metadata", norm_isbn);
                }
                found
            }
            Err(e @ CollaboratorError::Permanent { .. }) => {
                warn!(book_id = %book_id, "lookup rejected ISBN {}: {}", norm_isbn, e);
                None
            }
            Err(e) => return Err(e.into()),
        }
    };

    let mut merged = MetadataRecord::merge(draft, remote);
    if !norm_isbn.is_empty() {
        merged.isbn = norm_isbn.clone();
    }
    if merged.page_count.is_none() {
        match collab.pdf.page_count(&ctx.path).await {
            Ok(n) => merged.page_count = u32::try_from(n).ok(),
            Err(e) => debug!("page count unavailable: {}", e),
        }
    }
    translate_fields(env, &book_id, &mut merged).await;

    let meta_name = format!("{book_id}.json");
    write_json(&env.config.meta_dir().join(&meta_name), &merged).await?;
    info!(
        book_id = %book_id,
        "metadata: '{}' ({}) isbn={}",
        merged.full_title(),
        merged.year().map(|y| y.to_string()).unwrap_or_else(|| "n.d.".into()),
        if norm_isbn.is_empty() { "-" } else { norm_isbn.as_str() }
    );

    ctx.record.meta_json = meta_name;
    ctx.record.norm_isbn = norm_isbn;
    ctx.set_metadata(merged);
    Ok(())
}

/// Text of the leading pages, OCR'd when none has a text layer.
async fn page_texts(env: &StageEnv<'_>, ctx: &FileContext) -> Result<Vec<String>, StageError> {
    let pdf = &env.collab.pdf;
    let scan = env.config.copyright_scan_pages;
    let pages = env
        .retry
        .run("pdf", || pdf.extract_pages(&ctx.path, 0..scan))
        .await?;
    if pages.iter().any(|p| !p.trim().is_empty()) {
        return Ok(pages);
    }

    let n = env.config.ocr_pages.min(pages.len());
    info!(
        book_id = %ctx.record.book_id,
        "no text layer in the first {} pages; running OCR on {}",
        pages.len(),
        n
    );
    let mut out = Vec::with_capacity(n);
    for idx in 0..n {
        let image = pdf.render_page(&ctx.path, idx).await?;
        let text = env
            .retry
            .run("ocr", || env.collab.ocr.recognize(image.clone()))
            .await?;
        out.push(text);
    }
    Ok(out)
}

/// Index of the first page carrying a copyright marker.
pub fn find_copyright_page(pages: &[String]) -> Option<usize> {
    pages.iter().position(|p| COPYRIGHT_MARKER.is_match(p))
}

/// First checksum-valid ISBN in `text`, normalised to ISBN-13.
///
/// Labelled occurrences (`ISBN 978-...`) are preferred over bare 978/979
/// numbers.
pub fn find_isbn(text: &str) -> Option<String> {
    LABELLED_ISBN
        .captures_iter(text)
        .filter_map(|c| normalize_isbn(&c[1]))
        .next()
        .or_else(|| {
            BARE_ISBN13
                .captures_iter(text)
                .filter_map(|c| normalize_isbn(&c[1]))
                .next()
        })
}

/// Strip separators and validate an ISBN-10 or ISBN-13; ISBN-10 is
/// converted to its ISBN-13 form.
pub fn normalize_isbn(raw: &str) -> Option<String> {
    let s: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == 'X' || *c == 'x')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    match s.len() {
        13 if s.bytes().all(|b| b.is_ascii_digit()) && isbn13_check(&s[..12]) == s.as_bytes()[12] => {
            Some(s)
        }
        10 if isbn10_valid(&s) => {
            let body = format!("978{}", &s[..9]);
            let check = isbn13_check(&body) as char;
            Some(format!("{body}{check}"))
        }
        _ => None,
    }
}

/// ASCII check digit for the first twelve digits of an ISBN-13.
fn isbn13_check(first12: &str) -> u8 {
    let sum: u32 = first12
        .bytes()
        .enumerate()
        .map(|(i, b)| {
            let d = u32::from(b - b'0');
            if i % 2 == 0 {
                d
            } else {
                d * 3
            }
        })
        .sum();
    b'0' + ((10 - sum % 10) % 10) as u8
}

fn isbn10_valid(s: &str) -> bool {
    let bytes = s.as_bytes();
    if !bytes[..9].iter().all(u8::is_ascii_digit) {
        return false;
    }
    let last = match bytes[9] {
        b'X' => 10,
        b if b.is_ascii_digit() => u32::from(b - b'0'),
        _ => return false,
    };
    let sum: u32 = bytes[..9]
        .iter()
        .enumerate()
        .map(|(i, b)| (10 - i as u32) * u32::from(b - b'0'))
        .sum::<u32>()
        + last;
    sum % 11 == 0
}

/// Edition number from free text: `3`, `2nd Edition`, `Second Edition`,
/// `Edition 4`, `第2版`.
pub fn parse_edition(text: &str) -> Option<u32> {
    let t = text.trim().to_lowercase();
    if let Ok(n) = t.parse::<u32>() {
        return Some(n).filter(|n| *n > 0);
    }
    let numeric = EDITION_NUMBER
        .captures(&t)
        .or_else(|| EDITION_AFTER.captures(&t))
        .or_else(|| EDITION_ZH.captures(&t))
        .and_then(|c| c[1].parse::<u32>().ok());
    if numeric.is_some() {
        return numeric.filter(|n| *n > 0);
    }
    let word = EDITION_WORD.captures(&t)?;
    let n = match &word[1] {
        "first" => 1,
        "second" => 2,
        "third" => 3,
        "fourth" => 4,
        "fifth" => 5,
        "sixth" => 6,
        "seventh" => 7,
        "eighth" => 8,
        "ninth" => 9,
        "tenth" => 10,
        "eleventh" => 11,
        "twelfth" => 12,
        _ => return None,
    };
    Some(n)
}

/// Draft built from patterns alone, for when the extractor returns prose.
fn fallback_draft(text: &str) -> MetadataRecord {
    MetadataRecord {
        isbn: find_isbn(text).unwrap_or_default(),
        edition: parse_edition(text),
        ..MetadataRecord::default()
    }
}

/// Fill `translated_title` and `translated_description`. Failures are logged
/// and leave the field empty.
async fn translate_fields(env: &StageEnv<'_>, book_id: &str, meta: &mut MetadataRecord) {
    let translator = &env.collab.translator;

    if meta.translated_title.trim().is_empty() && !meta.title.trim().is_empty() {
        let full = meta.full_title();
        match env
            .retry
            .run(translator.name(), || translator.translate(&full, TITLE_HINT))
            .await
        {
            Ok(zh) if zh.chars().count() > MAX_TRANSLATED_TITLE_CHARS && full != meta.title.trim() => {
                let title = meta.title.trim().to_string();
                match env
                    .retry
                    .run(translator.name(), || translator.translate(&title, TITLE_HINT))
                    .await
                {
                    Ok(short) => meta.translated_title = short,
                    Err(e) => {
                        warn!(book_id = %book_id, "title translation failed: {}", e);
                        meta.translated_title = zh;
                    }
                }
            }
            Ok(zh) => meta.translated_title = zh,
            Err(e) => warn!(book_id = %book_id, "title translation failed: {}", e),
        }
    }

    if meta.translated_description.trim().is_empty() && !meta.description.trim().is_empty() {
        let description = meta.description.clone();
        match env
            .retry
            .run(translator.name(), || {
                translator.translate(&description, DESCRIPTION_HINT)
            })
            .await
        {
            Ok(zh) => meta.translated_description = zh,
            Err(e) => debug!("description translation skipped: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isbn13_checksum() {
        assert_eq!(normalize_isbn("978-93-5134-293-9").as_deref(), Some("9789351342939"));
        assert_eq!(normalize_isbn("978-93-5134-293-8"), None);
        assert_eq!(normalize_isbn("12345"), None);
    }

    #[test]
    fn isbn10_converted() {
        // 0-306-40615-2 ↔ 978-0-306-40615-7
        assert_eq!(normalize_isbn("0-306-40615-2").as_deref(), Some("9780306406157"));
        assert_eq!(normalize_isbn("0-8044-2957-X").as_deref(), Some("9780804429573"));
        assert_eq!(normalize_isbn("0-306-40615-3"), None);
    }

    #[test]
    fn finds_labelled_isbn_before_bare_numbers() {
        let text = "Order no. 9780306406157\nISBN: 978-93-5134-293-9 (paperback)";
        assert_eq!(find_isbn(text).as_deref(), Some("9789351342939"));
        assert_eq!(find_isbn("ref 9780306406157 end").as_deref(), Some("9780306406157"));
        assert_eq!(find_isbn("no numbers here"), None);
    }

    #[test]
    fn copyright_markers() {
        let pages = vec![
            "Example".to_string(),
            "".to_string(),
            "COPYRIGHT 2020 Packt".to_string(),
            "ISBN 978".to_string(),
        ];
        assert_eq!(find_copyright_page(&pages), Some(2));
        assert_eq!(find_copyright_page(&["版权所有".to_string()]), Some(0));
        assert_eq!(find_copyright_page(&["© 2019".to_string()]), Some(0));
        assert_eq!(find_copyright_page(&["Chapter 1".to_string()]), None);
    }

    #[test]
    fn editions() {
        assert_eq!(parse_edition("3"), Some(3));
        assert_eq!(parse_edition("2nd Edition"), Some(2));
        assert_eq!(parse_edition("Second edition, 2021"), Some(2));
        assert_eq!(parse_edition("Edition: 4"), Some(4));
        assert_eq!(parse_edition("第3版"), Some(3));
        assert_eq!(parse_edition("Published 2020 edition notes"), None);
        assert_eq!(parse_edition(""), None);
    }

    #[test]
    fn fallback_draft_uses_patterns() {
        let d = fallback_draft("Third Edition\nISBN 978-93-5134-293-9");
        assert_eq!(d.isbn, "9789351342939");
        assert_eq!(d.edition, Some(3));
        assert!(d.title.is_empty());
    }
}
