//! [`PdfSource`] backed by pdfium.
//!
//! ## Why spawn_blocking?
//!
//! pdfium is a C++ library with thread-local state; calling it from a Tokio
//! worker would stall the runtime during text extraction and rendering. Each
//! operation therefore opens the document on a blocking-pool thread, does
//! its work, and returns owned data (`String`s, entries, an image).
//!
//! ## Outline walk
//!
//! Bookmarks are walked explicitly via first-child / next-sibling so the
//! depth of every entry is known. Malformed PDFs can contain bookmark
//! cycles, so the walk is bounded in both depth and entry count.

use super::PdfSource;
use crate::book::OutlineEntry;
use crate::error::{CollaboratorError, ShelfError};
use async_trait::async_trait;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::ops::Range;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const SERVICE: &str = "pdfium";
const MAX_OUTLINE_DEPTH: u32 = 64;
const MAX_OUTLINE_ENTRIES: usize = 20_000;
/// Longest edge of a page rendered for OCR, roughly 200 DPI on a book page.
const OCR_RENDER_PIXELS: i32 = 2200;

#[cfg(target_os = "windows")]
const LIB_NAME: &str = "pdfium.dll";
#[cfg(target_os = "macos")]
const LIB_NAME: &str = "libpdfium.dylib";
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const LIB_NAME: &str = "libpdfium.so";

pub struct PdfiumSource {
    lib_dir: Option<PathBuf>,
}

impl PdfiumSource {
    /// Check that pdfium can be loaded, from `lib_dir` or the system path.
    pub fn bind(lib_dir: Option<&Path>) -> Result<Self, ShelfError> {
        let source = Self {
            lib_dir: lib_dir.map(Path::to_path_buf),
        };
        source.pdfium().map_err(ShelfError::PdfiumBindingFailed)?;
        info!(
            "pdfium bound ({})",
            source
                .lib_dir
                .as_ref()
                .map(|d| d.join(LIB_NAME).display().to_string())
                .unwrap_or_else(|| "system library".into())
        );
        Ok(source)
    }

    fn pdfium(&self) -> Result<Pdfium, String> {
        let bindings = match &self.lib_dir {
            Some(dir) => Pdfium::bind_to_library(&dir.join(LIB_NAME)),
            None => Pdfium::bind_to_system_library(),
        }
        .map_err(|e| e.to_string())?;
        Ok(Pdfium::new(bindings))
    }

    /// Run `f` against the opened document on the blocking pool.
    async fn with_document<T, F>(&self, path: &Path, f: F) -> Result<T, CollaboratorError>
    where
        T: Send + 'static,
        F: FnOnce(&PdfDocument<'_>, &Path) -> Result<T, CollaboratorError> + Send + 'static,
    {
        let lib_dir = self.lib_dir.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let pdfium = PdfiumSource { lib_dir }
                .pdfium()
                .map_err(|e| CollaboratorError::permanent(SERVICE, e))?;
            let document = pdfium
                .load_pdf_from_file(&path, None)
                .map_err(|e| CollaboratorError::Document {
                    path: path.clone(),
                    detail: format!("{e:?}"),
                })?;
            f(&document, &path)
        })
        .await
        .map_err(|e| CollaboratorError::permanent(SERVICE, format!("worker panicked: {e}")))?
    }
}

#[async_trait]
impl PdfSource for PdfiumSource {
    async fn page_count(&self, path: &Path) -> Result<usize, CollaboratorError> {
        self.with_document(path, |doc, _| Ok(doc.pages().len() as usize))
            .await
    }

    async fn extract_pages(
        &self,
        path: &Path,
        pages: Range<usize>,
    ) -> Result<Vec<String>, CollaboratorError> {
        self.with_document(path, move |doc, path| {
            let all = doc.pages();
            let total = all.len() as usize;
            let end = pages.end.min(total);
            let mut out = Vec::with_capacity(end.saturating_sub(pages.start));
            for idx in pages.start..end {
                let text = match all.get(idx as u16) {
                    Ok(page) => match page.text() {
                        Ok(t) => t.all(),
                        Err(e) => {
                            warn!("{}: page {} has no readable text: {:?}", path.display(), idx + 1, e);
                            String::new()
                        }
                    },
                    Err(e) => {
                        return Err(CollaboratorError::Document {
                            path: path.to_path_buf(),
                            detail: format!("page {}: {e:?}", idx + 1),
                        })
                    }
                };
                out.push(text);
            }
            debug!("{}: extracted text of {} pages", path.display(), out.len());
            Ok(out)
        })
        .await
    }

    async fn extract_outline(&self, path: &Path) -> Result<Vec<OutlineEntry>, CollaboratorError> {
        self.with_document(path, |doc, path| {
            let mut out = Vec::new();
            if let Some(first) = doc.bookmarks().root() {
                walk_siblings(first, 0, &mut out);
            }
            if out.len() >= MAX_OUTLINE_ENTRIES {
                warn!(
                    "{}: outline truncated at {} entries (cyclic bookmarks?)",
                    path.display(),
                    MAX_OUTLINE_ENTRIES
                );
            }
            debug!("{}: {} outline entries", path.display(), out.len());
            Ok(out)
        })
        .await
    }

    async fn render_page(&self, path: &Path, page: usize) -> Result<DynamicImage, CollaboratorError> {
        self.with_document(path, move |doc, path| {
            let pages = doc.pages();
            let p = pages.get(page as u16).map_err(|e| CollaboratorError::Document {
                path: path.to_path_buf(),
                detail: format!("page {}: {e:?}", page + 1),
            })?;
            let config = PdfRenderConfig::new()
                .set_target_width(OCR_RENDER_PIXELS)
                .set_maximum_height(OCR_RENDER_PIXELS);
            let bitmap = p
                .render_with_config(&config)
                .map_err(|e| CollaboratorError::Document {
                    path: path.to_path_buf(),
                    detail: format!("rasterising page {}: {e:?}", page + 1),
                })?;
            Ok(bitmap.as_image())
        })
        .await
    }
}

fn walk_siblings(first: PdfBookmark<'_>, level: u32, out: &mut Vec<OutlineEntry>) {
    let mut current = Some(first);
    while let Some(bookmark) = current {
        if out.len() >= MAX_OUTLINE_ENTRIES {
            return;
        }
        let page = bookmark
            .destination()
            .and_then(|d| d.page_index().ok())
            .map(|idx| idx as u32 + 1);
        out.push(OutlineEntry {
            label: bookmark.title().unwrap_or_default(),
            level,
            page,
        });
        if level < MAX_OUTLINE_DEPTH {
            if let Some(child) = bookmark.first_child() {
                walk_siblings(child, level + 1, out);
            }
        }
        current = bookmark.next_sibling();
    }
}
