//! External capabilities the pipeline consumes.
//!
//! Each capability is a narrow `async` trait so the stages never know
//! whether they are talking to pdfium, an OpenAI model, a local Ollama
//! instance, or a test double:
//!
//! | Trait | Default implementation |
//! |-------|------------------------|
//! | [`PdfSource`]         | [`pdfium::PdfiumSource`] |
//! | [`OcrEngine`]         | [`llm::VisionOcr`] (vision LLM over a rendered page) |
//! | [`MetadataExtractor`] | [`llm::LlmMetadataExtractor`] |
//! | [`Translator`]        | [`llm::LlmTranslator`], chained by [`FallbackTranslator`] |
//! | [`BookLookup`]        | [`google_books::GoogleBooks`] |
//! | [`CoverFetcher`]      | [`cover::HttpCoverFetcher`] |
//!
//! [`Collaborators`] bundles one of each for the driver.

pub mod cover;
pub mod encode;
pub mod google_books;
pub mod llm;
pub mod pdfium;

use crate::book::{MetadataRecord, OutlineEntry};
use crate::config::PipelineConfig;
use crate::error::{CollaboratorError, ShelfError};
use async_trait::async_trait;
use image::DynamicImage;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// Text, outline and page images of a PDF file.
#[async_trait]
pub trait PdfSource: Send + Sync {
    async fn page_count(&self, path: &Path) -> Result<usize, CollaboratorError>;

    /// Text of each page in `pages` (0-based, clipped to the document).
    /// A page without a text layer yields an empty string.
    async fn extract_pages(
        &self,
        path: &Path,
        pages: Range<usize>,
    ) -> Result<Vec<String>, CollaboratorError>;

    /// Bookmarks in document order with their depth.
    async fn extract_outline(&self, path: &Path) -> Result<Vec<OutlineEntry>, CollaboratorError>;

    /// Rasterise one page (0-based) for OCR.
    async fn render_page(&self, path: &Path, page: usize) -> Result<DynamicImage, CollaboratorError>;
}

/// Optical recognition for pages without a text layer.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn recognize(&self, page: DynamicImage) -> Result<String, CollaboratorError>;
}

/// Structures raw copyright-page text into a metadata draft.
#[async_trait]
pub trait MetadataExtractor: Send + Sync {
    async fn infer_metadata(&self, raw_text: &str) -> Result<MetadataRecord, CollaboratorError>;
}

/// Canonical bibliographic record by ISBN.
#[async_trait]
pub trait BookLookup: Send + Sync {
    /// `Ok(None)` when the service knows no such ISBN.
    async fn lookup_by_isbn(&self, isbn: &str) -> Result<Option<MetadataRecord>, CollaboratorError>;
}

/// Translation into the library's target language.
#[async_trait]
pub trait Translator: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// `domain_hint` tells the backend what kind of text this is
    /// ("book title", "table of contents", ...).
    async fn translate(&self, text: &str, domain_hint: &str) -> Result<String, CollaboratorError>;
}

/// What a cover can be looked up by.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoverQuery<'a> {
    pub isbn: &'a str,
    pub title: &'a str,
    /// A direct image link, e.g. the Google Books thumbnail.
    pub url: &'a str,
}

/// Cover image download.
#[async_trait]
pub trait CoverFetcher: Send + Sync {
    /// Image bytes, or `None` when no cover exists.
    async fn fetch_cover(&self, query: &CoverQuery<'_>) -> Result<Option<Vec<u8>>, CollaboratorError>;
}

/// Tries `primary`, and on any failure `secondary`.
///
/// Expresses "remote API first, local model when it is down" without the
/// stages having to know there are two backends.
pub struct FallbackTranslator {
    primary: Arc<dyn Translator>,
    secondary: Arc<dyn Translator>,
    name: String,
}

impl FallbackTranslator {
    pub fn new(primary: Arc<dyn Translator>, secondary: Arc<dyn Translator>) -> Self {
        let name = format!("{}→{}", primary.name(), secondary.name());
        Self {
            primary,
            secondary,
            name,
        }
    }
}

#[async_trait]
impl Translator for FallbackTranslator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn translate(&self, text: &str, domain_hint: &str) -> Result<String, CollaboratorError> {
        match self.primary.translate(text, domain_hint).await {
            Ok(out) => Ok(out),
            Err(e) => {
                warn!(
                    "translator '{}' failed ({}); falling back to '{}'",
                    self.primary.name(),
                    e,
                    self.secondary.name()
                );
                self.secondary.translate(text, domain_hint).await
            }
        }
    }
}

/// One implementation of every capability.
#[derive(Clone)]
pub struct Collaborators {
    pub pdf: Arc<dyn PdfSource>,
    pub ocr: Arc<dyn OcrEngine>,
    pub extractor: Arc<dyn MetadataExtractor>,
    pub lookup: Arc<dyn BookLookup>,
    pub translator: Arc<dyn Translator>,
    pub covers: Arc<dyn CoverFetcher>,
}

impl Collaborators {
    /// The production wiring: pdfium, edgequake-llm providers, Google Books
    /// and plain HTTP for covers.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, ShelfError> {
        let pdf = Arc::new(pdfium::PdfiumSource::bind(config.pdfium_lib_dir.as_deref())?);

        let main = llm::resolve_provider(
            config.provider.as_ref(),
            config.provider_name.as_deref(),
            config.model.as_deref(),
        )?;
        let chat = llm::ChatSettings::from_config(config);

        let translator: Arc<dyn Translator> = {
            let primary: Arc<dyn Translator> = match config.translation_provider_name.as_deref() {
                Some(name) => Arc::new(llm::LlmTranslator::new(
                    llm::resolve_provider(None, Some(name), config.translation_model.as_deref())?,
                    chat,
                    name,
                )),
                None => Arc::new(llm::LlmTranslator::new(
                    Arc::clone(&main),
                    chat,
                    config.provider_name.as_deref().unwrap_or("default"),
                )),
            };
            match config.fallback_translation_provider_name.as_deref() {
                Some(name) => {
                    let secondary = Arc::new(llm::LlmTranslator::new(
                        llm::resolve_provider(
                            None,
                            Some(name),
                            config.fallback_translation_model.as_deref(),
                        )?,
                        chat,
                        name,
                    ));
                    Arc::new(FallbackTranslator::new(primary, secondary))
                }
                None => primary,
            }
        };

        let http = google_books::http_client(config)?;

        Ok(Self {
            pdf,
            ocr: Arc::new(llm::VisionOcr::new(Arc::clone(&main), chat)),
            extractor: Arc::new(llm::LlmMetadataExtractor::new(main, chat)),
            lookup: Arc::new(google_books::GoogleBooks::new(
                http.clone(),
                config.google_books_api_key.clone(),
            )),
            translator,
            covers: Arc::new(cover::HttpCoverFetcher::new(http)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed(&'static str, Option<&'static str>, AtomicUsize);

    #[async_trait]
    impl Translator for Fixed {
        fn name(&self) -> &str {
            self.0
        }
        async fn translate(&self, _text: &str, _hint: &str) -> Result<String, CollaboratorError> {
            self.2.fetch_add(1, Ordering::SeqCst);
            self.1
                .map(str::to_string)
                .ok_or_else(|| CollaboratorError::transient(self.0, "offline"))
        }
    }

    #[tokio::test]
    async fn fallback_used_only_on_failure() {
        let remote = Arc::new(Fixed("remote", Some("远程"), AtomicUsize::new(0)));
        let local = Arc::new(Fixed("local", Some("本地"), AtomicUsize::new(0)));
        let t = FallbackTranslator::new(remote.clone(), local.clone());
        assert_eq!(t.translate("x", "title").await.unwrap(), "远程");
        assert_eq!(local.2.load(Ordering::SeqCst), 0);

        let down = Arc::new(Fixed("remote", None, AtomicUsize::new(0)));
        let t = FallbackTranslator::new(down, local.clone());
        assert_eq!(t.translate("x", "title").await.unwrap(), "本地");
        assert_eq!(t.name(), "remote→local");
    }
}
