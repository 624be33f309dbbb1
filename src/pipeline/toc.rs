//! Stage 3: translate the bookmark outline.
//!
//! Labels are split into a structural prefix ("Chapter 3", "Part IV",
//! "Appendix B", "1.2") and the remaining title text. Prefixes get fixed
//! Chinese renderings so numbering stays uniform across the book; only the
//! title text is sent to the translator, in numbered batches. A small
//! glossary overrides whole labels ("Preface" → "前言").
//!
//! The translated forest has exactly the shape of the source: same node
//! count, same order, same levels. A stored translation whose source labels
//! still match the PDF is reused without calling the translator.

use super::{read_json, write_json, FileContext, StageEnv};
use crate::book::{build_forest, flatten, for_each_mut, OutlineNode, TocDocument};
use crate::error::StageError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Instant;
use tracing::{debug, info, warn};

pub const TOC_HINT: &str = "table-of-contents entries of a technical book";

/// Whole-label translations that are never sent to the translator.
const GLOSSARY: &[(&str, &str)] = &[
    ("preface", "前言"),
    ("foreword", "序"),
    ("section", "节"),
    ("appendix", "附录"),
    ("appendices", "附录"),
    ("index", "索引"),
    ("bibliography", "参考文献"),
    ("conventions", "约定"),
    ("faq", "常见问题"),
    ("troubleshooting", "故障排查"),
    ("best practices", "最佳实践"),
    ("quick start", "快速入门"),
    ("hands-on", "实战"),
    ("walkthrough", "分步指南"),
    ("performance tuning", "性能调优"),
    ("security considerations", "安全事项"),
];

/// Structural keywords; longer alternatives first so "case study" wins
/// over shorter matches.
static KEYWORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(case study|key finding|experiment|exercise|appendix|incident|chapter|section|element|module|lesson|try it|phase|part|unit|table|step|lab)\s+",
    )
    .unwrap()
});

/// Number after a keyword: dotted/dashed numbers, letter-number forms,
/// roman numerals, a single letter.
static KEYWORD_NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(\d+(?:\.\d+)+|\d+-\d+|\d+|[A-Z]+-\d+(?:\.\d+)*|[A-Z]+(?:\.\d+)+|[A-Z]+\d+|[IVXLC]+|[A-Z])\.?(?:\s+|[:：]\s*|$)",
    )
    .unwrap()
});

/// A bare leading number without a keyword. Must contain a digit so that
/// titles like "A Tour of Rust" are left alone.
static BARE_NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+(?:\.\d+)+|\d+-\d+|\d+|[A-Z]+-\d+(?:\.\d+)*|[A-Z]+(?:\.\d+)+|[A-Z]+\d+)\.?(?:\s+|[:：]\s*|$)")
        .unwrap()
});

static NUMBERED_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\d+)\s*[.)、．:：]\s*(.*)$").unwrap());

/// Prefixes a model sometimes adds on its own despite the instructions.
static MODEL_PREFIXES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"^第\s*[0-9]+\s*章[：:]\s*",
        r"^第[一二两三四五六七八九十]+部分[：:]\s*",
        r"^附录\s*[0-9A-Z]+[：:]\s*",
        r"^第\s*[0-9]+(?:\.[0-9]+)?\s*节[：:]\s*",
        r"^第\s*[0-9]+(?:-[0-9]+)?\s*课[：:]\s*",
        r"^练习\s*[0-9]+(?:-[0-9]+)?[：:]\s*",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

pub async fn run(env: &StageEnv<'_>, ctx: &mut FileContext) -> Result<(), StageError> {
    let book_id = ctx.record.book_id.clone();
    let pdf = &env.collab.pdf;
    let mut entries = env
        .retry
        .run("pdf", || pdf.extract_outline(&ctx.path))
        .await?;
    for e in &mut entries {
        e.label = clean_label(&e.label);
    }

    if entries.is_empty() && !env.config.allow_empty_outline {
        return Err(StageError::DataInsufficiency("the PDF has no bookmarks".into()));
    }

    let toc_name = format!("{book_id}.json");
    let toc_path = env.config.toc_dir().join(&toc_name);
    match read_json::<TocDocument>(&toc_path).await {
        Ok(Some(stored)) if stored.matches_source(&entries) => {
            info!(book_id = %book_id, "toc: reusing stored translation ({} entries)", entries.len());
            ctx.record.toc_file = toc_name;
            return Ok(());
        }
        Ok(Some(_)) => info!(book_id = %book_id, "toc: outline changed; translating again"),
        Ok(None) => {}
        Err(e) => warn!(book_id = %book_id, "toc: ignoring unreadable stored translation: {}", e),
    }

    let started = Instant::now();
    let mut forest = build_forest(&entries);
    translate_forest(env, &mut forest).await?;
    let doc = TocDocument {
        book_id: book_id.clone(),
        nodes: forest,
    };
    write_json(&toc_path, &doc).await?;
    info!(
        book_id = %book_id,
        "toc: {} entries translated in {:.1}s",
        doc.node_count(),
        started.elapsed().as_secs_f64()
    );

    ctx.record.toc_file = toc_name;
    Ok(())
}

/// Fill `translated_label` on every node of `forest`.
pub async fn translate_forest(env: &StageEnv<'_>, forest: &mut [OutlineNode]) -> Result<(), StageError> {
    let plans: Vec<LabelPlan> = flatten(forest).iter().map(|n| plan_label(&n.label)).collect();

    let pending: Vec<&str> = plans
        .iter()
        .filter_map(|p| match p {
            LabelPlan::Translate { text, .. } => Some(text.as_str()),
            LabelPlan::Fixed(_) => None,
        })
        .collect();
    let mut translated = translate_texts(env, &pending).await?.into_iter();

    let mut results = Vec::with_capacity(plans.len());
    for plan in &plans {
        let out = match plan {
            LabelPlan::Fixed(zh) => zh.clone(),
            LabelPlan::Translate { prefix, text } => {
                let zh = translated.next().unwrap_or_default();
                let zh = strip_model_prefix(&zh);
                let zh = if zh.is_empty() { text.clone() } else { zh };
                match prefix {
                    Some(p) => format!("{p} {zh}"),
                    None => zh,
                }
            }
        };
        results.push(out.trim_end_matches('。').trim().to_string());
    }

    let mut results = results.into_iter();
    for_each_mut(forest, &mut |node| {
        node.translated_label = results.next().unwrap_or_default();
    });
    Ok(())
}

/// Translate `texts` in batches, preserving order and count.
async fn translate_texts(env: &StageEnv<'_>, texts: &[&str]) -> Result<Vec<String>, StageError> {
    let translator = &env.collab.translator;
    let mut out = Vec::with_capacity(texts.len());
    for chunk in texts.chunks(env.config.toc_batch_size.max(1)) {
        if chunk.len() > 1 {
            let numbered = chunk
                .iter()
                .enumerate()
                .map(|(i, t)| format!("{}. {}", i + 1, t))
                .collect::<Vec<_>>()
                .join("\n");
            let reply = env
                .retry
                .run(translator.name(), || translator.translate(&numbered, TOC_HINT))
                .await?;
            if let Some(lines) = parse_numbered_reply(&reply, chunk.len()) {
                out.extend(lines);
                continue;
            }
            debug!(
                "toc: batch of {} came back misaligned; translating one by one",
                chunk.len()
            );
        }
        for text in chunk {
            let zh = env
                .retry
                .run(translator.name(), || translator.translate(text, TOC_HINT))
                .await?;
            out.push(zh);
        }
    }
    Ok(out)
}

/// Lines `1. ...` to `n. ...` in order, or `None` if the reply does not
/// line up with the request.
pub fn parse_numbered_reply(reply: &str, n: usize) -> Option<Vec<String>> {
    let lines: Vec<&str> = reply.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.len() != n {
        return None;
    }
    lines
        .iter()
        .enumerate()
        .map(|(i, line)| {
            let caps = NUMBERED_LINE.captures(line)?;
            let idx: usize = caps[1].parse().ok()?;
            (idx == i + 1).then(|| caps[2].trim().to_string())
        })
        .collect()
}

// ── Label analysis ───────────────────────────────────────────────────────

/// How one outline label gets its translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelPlan {
    /// Known without asking the translator.
    Fixed(String),
    /// `text` goes to the translator; the result is appended to `prefix`.
    Translate { prefix: Option<String>, text: String },
}

pub fn plan_label(label: &str) -> LabelPlan {
    let label = label.trim();
    if let Some(zh) = glossary(label) {
        return LabelPlan::Fixed(zh.to_string());
    }

    let (prefix, rest) = split_prefix(label);
    match prefix {
        Some(p) if rest.is_empty() => LabelPlan::Fixed(p),
        Some(p) => match glossary(rest) {
            Some(zh) => LabelPlan::Fixed(format!("{p} {zh}")),
            None => LabelPlan::Translate {
                prefix: Some(p),
                text: rest.to_string(),
            },
        },
        None => LabelPlan::Translate {
            prefix: None,
            text: label.to_string(),
        },
    }
}

fn glossary(text: &str) -> Option<&'static str> {
    let text = text.trim_end_matches(['.', ':']);
    GLOSSARY
        .iter()
        .find(|(en, _)| text.eq_ignore_ascii_case(en))
        .map(|(_, zh)| *zh)
}

/// Split off a structural prefix, returning its Chinese rendering and the
/// remaining title text.
fn split_prefix(label: &str) -> (Option<String>, &str) {
    if let Some(kw) = KEYWORD.captures(label) {
        let keyword = kw[1].to_ascii_lowercase();
        let after = &label[kw[0].len()..];
        if let Some(num) = KEYWORD_NUMBER.captures(after) {
            let rest = after[num[0].len()..].trim();
            return (Some(format_prefix(&keyword, &num[1])), rest);
        }
        return (None, label);
    }
    if let Some(num) = BARE_NUMBER.captures(label) {
        let rest = label[num[0].len()..].trim();
        return (Some(num[1].to_string()), rest);
    }
    (None, label)
}

/// Chinese rendering of `keyword number`.
pub fn format_prefix(keyword: &str, num: &str) -> String {
    let as_int = num
        .parse::<u32>()
        .ok()
        .or_else(|| roman_to_int(num));
    match keyword {
        "part" => match as_int {
            Some(n) if n < 100 => format!("第{}部分", number_to_zh(n)),
            _ => format!("第{num}部分"),
        },
        "chapter" => match num.parse::<u32>() {
            Ok(n) => format!("第{n:02}章"),
            Err(_) => format!("第{num}章"),
        },
        "section" => format!("第{num}节"),
        "unit" => format!("第{num}单元"),
        "phase" => format!("第{num}阶段"),
        "step" => format!("第{num}步"),
        "appendix" => format!("附录{num}"),
        "exercise" => format!("练习{num}"),
        "lesson" => format!("课程{num}"),
        "table" => format!("表{num}"),
        "lab" | "experiment" => format!("实验{num}"),
        "case study" => format!("案例研究{num}"),
        "incident" => format!("事件{num}"),
        "try it" => format!("试试看{num}"),
        "key finding" => format!("关键发现{num}"),
        "element" => format!("要素{num}"),
        "module" => format!("模块{num}"),
        other => format!("{other} {num}"),
    }
}

/// Chinese numerals for 0..=99.
pub fn number_to_zh(n: u32) -> String {
    const DIGITS: [&str; 11] = ["零", "一", "二", "三", "四", "五", "六", "七", "八", "九", "十"];
    if n <= 10 {
        return DIGITS[n as usize].to_string();
    }
    let (tens, units) = (n / 10, n % 10);
    let mut s = String::new();
    if tens > 1 {
        s.push_str(DIGITS[tens as usize % 10]);
    }
    s.push('十');
    if units > 0 {
        s.push_str(DIGITS[units as usize]);
    }
    s
}

fn roman_to_int(s: &str) -> Option<u32> {
    if s.is_empty() || !s.chars().all(|c| "IVXLC".contains(c)) {
        return None;
    }
    let value = |c: char| -> i64 {
        match c {
            'I' => 1,
            'V' => 5,
            'X' => 10,
            'L' => 50,
            _ => 100,
        }
    };
    let digits: Vec<i64> = s.chars().map(value).collect();
    let total: i64 = digits
        .iter()
        .enumerate()
        .map(|(i, v)| match digits.get(i + 1) {
            Some(next) if next > v => -v,
            _ => *v,
        })
        .sum();
    u32::try_from(total).ok().filter(|n| *n > 0)
}

/// Normalise whitespace and stray XML character references in a label.
pub fn clean_label(s: &str) -> String {
    s.replace("&#10;", " ")
        .replace("&#13;", " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn strip_model_prefix(s: &str) -> String {
    let mut s = s.trim().to_string();
    for re in MODEL_PREFIXES.iter() {
        s = re.replace(&s, "").into_owned();
    }
    s.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translate(prefix: &str, text: &str) -> LabelPlan {
        LabelPlan::Translate {
            prefix: Some(prefix.into()),
            text: text.into(),
        }
    }

    #[test]
    fn glossary_overrides_whole_label() {
        assert_eq!(plan_label("Preface"), LabelPlan::Fixed("前言".into()));
        assert_eq!(plan_label("INDEX"), LabelPlan::Fixed("索引".into()));
        assert_eq!(plan_label("Security Considerations"), LabelPlan::Fixed("安全事项".into()));
    }

    #[test]
    fn keyword_prefixes() {
        assert_eq!(plan_label("Chapter 3 Ownership"), translate("第03章", "Ownership"));
        assert_eq!(plan_label("chapter 12: Async"), translate("第12章", "Async"));
        assert_eq!(plan_label("Part IV Advanced Topics"), translate("第四部分", "Advanced Topics"));
        assert_eq!(plan_label("Part 2"), LabelPlan::Fixed("第二部分".into()));
        assert_eq!(plan_label("Section 2.3 Traits"), translate("第2.3节", "Traits"));
        assert_eq!(plan_label("Appendix B: Tools"), translate("附录B", "Tools"));
        assert_eq!(plan_label("Case Study 1 Payments"), translate("案例研究1", "Payments"));
        assert_eq!(plan_label("Exercise 1-18"), LabelPlan::Fixed("练习1-18".into()));
        assert_eq!(plan_label("Appendix A Index"), LabelPlan::Fixed("附录A 索引".into()));
    }

    #[test]
    fn bare_numbers_kept_verbatim() {
        assert_eq!(plan_label("1.2 Installing Rust"), translate("1.2", "Installing Rust"));
        assert_eq!(plan_label("A.4 Glossary"), translate("A.4", "Glossary"));
        assert_eq!(
            plan_label("A Tour of Rust"),
            LabelPlan::Translate {
                prefix: None,
                text: "A Tour of Rust".into()
            }
        );
        assert_eq!(
            plan_label("Chapters of History"),
            LabelPlan::Translate {
                prefix: None,
                text: "Chapters of History".into()
            }
        );
    }

    #[test]
    fn chinese_numerals() {
        assert_eq!(number_to_zh(1), "一");
        assert_eq!(number_to_zh(10), "十");
        assert_eq!(number_to_zh(14), "十四");
        assert_eq!(number_to_zh(20), "二十");
        assert_eq!(number_to_zh(99), "九十九");
        assert_eq!(roman_to_int("XIV"), Some(14));
        assert_eq!(roman_to_int("IV"), Some(4));
        assert_eq!(roman_to_int("Q"), None);
    }

    #[test]
    fn numbered_reply_alignment() {
        let reply = "1. 所有权\n\n2、借用\n3) 生命周期";
        assert_eq!(
            parse_numbered_reply(reply, 3),
            Some(vec!["所有权".to_string(), "借用".into(), "生命周期".into()])
        );
        assert_eq!(parse_numbered_reply(reply, 2), None);
        assert_eq!(parse_numbered_reply("1. a\n3. b", 2), None);
        assert_eq!(parse_numbered_reply("所有权\n借用", 2), None);
    }

    #[test]
    fn labels_cleaned() {
        assert_eq!(clean_label("Getting&#10;Started \r\n  Now"), "Getting Started Now");
        assert_eq!(clean_label("a&#13;b"), "a b");
    }

    #[test]
    fn model_prefixes_removed() {
        assert_eq!(strip_model_prefix("第3章：所有权"), "所有权");
        assert_eq!(strip_model_prefix("附录B: 工具"), "工具");
        assert_eq!(strip_model_prefix("所有权"), "所有权");
    }
}
