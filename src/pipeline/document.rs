//! Stage 4: the Markdown card for one book.
//!
//! Written to `<library>/<slug>.md`, where the slug is the ASCII-folded
//! title followed by the lower-cased book id. A card that already exists is
//! adopted as-is; it may carry manual edits. The cover is downloaded
//! best-effort to `covers/<book_id>.jpg`; without one the card points at a
//! placeholder image.

use super::{read_json, FileContext, StageEnv};
use crate::backends::CoverQuery;
use crate::book::{flatten, MetadataRecord, TocDocument};
use crate::error::StageError;
use crate::state::store::write_bytes_atomic;
use tracing::{debug, info, warn};

const PLACEHOLDER_COVER: &str = "![封面](covers/placeholder.png ':size=30%')";

pub async fn run(env: &StageEnv<'_>, ctx: &mut FileContext) -> Result<(), StageError> {
    let book_id = ctx.record.book_id.clone();
    let meta = ctx.metadata(env).await?.clone();

    let md_name = format!("{}.md", document_slug(&meta.title, &book_id));
    let md_path = env.config.library_dir.join(&md_name);

    if md_path.exists() {
        info!(book_id = %book_id, "document '{}' already exists; keeping it", md_name);
        ctx.record.md_file = md_name;
        return Ok(());
    }

    let cover = ensure_cover(env, &book_id, &meta).await;

    let outline = if ctx.record.toc_file.is_empty() {
        None
    } else {
        read_json::<TocDocument>(&env.config.toc_dir().join(&ctx.record.toc_file)).await?
    };

    let text = render_markdown(&meta, cover.as_deref(), outline.as_ref(), &ctx.file_name());
    write_bytes_atomic(&md_path, text.as_bytes())
        .await
        .map_err(|e| StageError::io(&md_path, e))?;
    info!(book_id = %book_id, "document written: {}", md_name);

    ctx.record.md_file = md_name;
    Ok(())
}

/// File name of the cover under `covers/`, downloading it if needed.
async fn ensure_cover(env: &StageEnv<'_>, book_id: &str, meta: &MetadataRecord) -> Option<String> {
    let name = format!("{book_id}.jpg");
    let path = env.config.covers_dir().join(&name);
    if path.is_file() {
        return Some(name);
    }

    let query = CoverQuery {
        isbn: &meta.isbn,
        title: &meta.title,
        url: &meta.cover_url,
    };
    let covers = &env.collab.covers;
    match env.retry.run("cover", || covers.fetch_cover(&query)).await {
        Ok(Some(bytes)) => match write_bytes_atomic(&path, &bytes).await {
            Ok(()) => {
                debug!(book_id = %book_id, "cover saved ({} bytes)", bytes.len());
                Some(name)
            }
            Err(e) => {
                warn!(book_id = %book_id, "cannot save cover to {}: {}", path.display(), e);
                None
            }
        },
        Ok(None) => {
            debug!(book_id = %book_id, "no cover available");
            None
        }
        Err(e) => {
            warn!(book_id = %book_id, "cover download failed: {}", e);
            None
        }
    }
}

/// `slugified-title-nljr-xxxxxxxxxxxx`, or just the id when the title has
/// no ASCII letters or digits.
pub fn document_slug(title: &str, book_id: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-');
    let id = book_id.to_ascii_lowercase();
    if slug.is_empty() {
        id
    } else {
        format!("{slug}-{id}")
    }
}

/// The card's Markdown text.
pub fn render_markdown(
    meta: &MetadataRecord,
    cover: Option<&str>,
    outline: Option<&TocDocument>,
    file_name: &str,
) -> String {
    let or_none = |s: &str| {
        if s.trim().is_empty() {
            "无".to_string()
        } else {
            s.trim().to_string()
        }
    };

    let mut md = vec!["## 书籍信息".to_string(), String::new()];
    md.push(format!("- **书名**：{}", meta.full_title()));
    md.push(format!(
        "- **中文译名**：{}",
        if meta.translated_title.trim().is_empty() {
            "暂无数据"
        } else {
            meta.translated_title.trim()
        }
    ));
    if meta.authors.is_empty() {
        md.push("- **作者**：暂无数据".into());
    } else {
        md.push(format!("- **作者**：{}", meta.authors.join(", ")));
    }
    if let Some(edition) = meta.notable_edition() {
        md.push(format!("- **版本**：{edition}"));
    }
    md.push(String::new());

    match cover {
        Some(name) => md.push(format!("![封面](covers/{name})")),
        None => md.push(PLACEHOLDER_COVER.into()),
    }
    md.push(String::new());

    md.push(format!("- **出版社**：{}", or_none(&meta.publisher)));
    md.push(format!("- **出版日期**：{}", or_none(&meta.published_date)));
    md.push(format!("- **图书分类**：{}", or_none(&meta.categories.join(", "))));
    md.push(format!("- **ISBN**：{}", or_none(&meta.isbn)));
    md.push(format!(
        "- **页数**：{}",
        meta.page_count
            .map(|n| n.to_string())
            .unwrap_or_else(|| "无".into())
    ));
    md.push(format!("- **索引文件名**：{file_name}"));
    md.push(String::new());

    let description = [&meta.translated_description, &meta.description]
        .into_iter()
        .map(|s| s.trim())
        .find(|s| !s.is_empty())
        .unwrap_or("暂无简介");
    md.push("### 简介".into());
    md.push(String::new());
    md.push(description.to_string());
    md.push(String::new());

    md.push("### 书目".into());
    md.push("```content".into());
    let tree = outline.map(outline_tree).unwrap_or_default();
    if tree.is_empty() {
        md.push("目录待补充".into());
    } else {
        md.push(tree);
    }
    md.push("```".into());
    md.push(String::new());

    md.join("\n")
}

/// The translated outline as an indented text tree, four spaces per level.
pub fn outline_tree(doc: &TocDocument) -> String {
    flatten(&doc.nodes)
        .iter()
        .map(|n| {
            let label = if n.translated_label.is_empty() {
                &n.label
            } else {
                &n.translated_label
            };
            format!("{}{}", " ".repeat(4 * n.level as usize), label)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
