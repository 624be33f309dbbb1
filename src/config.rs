//! Configuration for a pipeline run.
//!
//! Every knob lives in [`PipelineConfig`], built through
//! [`PipelineConfigBuilder`]. The binary fills the builder from the resolved
//! environment section of the settings file ([`crate::settings::Settings`])
//! and then applies command-line overrides; library users can build one
//! directly.
//!
//! # Directory layout
//!
//! ```text
//! corpus_dir/              the PDFs, renamed in place
//! library_dir/
//!   ├─ meta/<book_id>.json   merged metadata record
//!   ├─ toc/<book_id>.json    translated outline
//!   ├─ covers/<book_id>.jpg  downloaded cover
//!   └─ <slug>.md             one card per book
//! data_dir/                defaults to library_dir/.pdfshelf
//!   ├─ records/<book_id>.json
//!   └─ review.txt
//! ```

use crate::error::ShelfError;
use crate::retry::RetryPolicy;
use crate::settings::Settings;
use edgequake_llm::LLMProvider;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Suffixes that mark a file as a variant of another book rather than a
/// book of its own. A sibling is `<stem><suffix>` next to `<stem>.pdf`.
pub const DEFAULT_SIBLING_SUFFIXES: &[&str] = &[
    "_dual.pdf",
    "_translated.pdf",
    "_dual_智谱4Flash.pdf",
    "_translated_智谱4Flash.pdf",
    "_dual_Kimi+DeepSeek.pdf",
    "_translated_Kimi+DeepSeek.pdf",
    "_translated_Kimi+Qwen.pdf",
    "_dual_Kimi+Qwen.pdf",
    ".no_watermark.zh-CN.mono.pdf",
    ".no_watermark.zh-CN.dual.pdf",
    "_zh.pdf",
    "_cn.pdf",
    "_final.pdf",
    "_bilingual.pdf",
];

/// Configuration for one pipeline run.
///
/// # Example
/// ```rust
/// use pdfshelf::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .corpus_dir("/srv/ebooks")
///     .library_dir("/srv/wiki/books")
///     .max_filename_bytes(200)
///     .build()
///     .unwrap();
/// assert_eq!(config.data_dir(), std::path::Path::new("/srv/wiki/books/.pdfshelf"));
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Directory walked for PDFs. Required.
    pub corpus_dir: PathBuf,

    /// Where metadata, outlines, covers and Markdown cards are written. Required.
    pub library_dir: PathBuf,

    /// State records and the review list. Default: `library_dir/.pdfshelf`.
    pub data_dir: Option<PathBuf>,

    /// Byte limit for a generated file name, extension included. Default: 255.
    ///
    /// 255 is the per-component limit of ext4, APFS and NTFS. Lower it when
    /// the corpus is synced to a filesystem with a tighter bound.
    pub max_filename_bytes: usize,

    /// Recognised sibling suffixes, see [`DEFAULT_SIBLING_SUFFIXES`].
    pub sibling_suffixes: Vec<String>,

    /// How many leading pages are searched for the copyright page. Default: 10.
    pub copyright_scan_pages: usize,

    /// How many leading pages are OCR'd when the PDF has no text layer. Default: 5.
    pub ocr_pages: usize,

    /// Retries per collaborator call on transient failure. Default: 3.
    pub max_retries: u32,

    /// Initial retry delay in milliseconds, doubled per retry. Default: 500.
    pub retry_backoff_ms: u64,

    /// Outline labels sent to the translator per request. Default: 40.
    pub toc_batch_size: usize,

    /// Rename files on disk. When false the rename stage only records the
    /// normalised name. Default: true.
    pub rename_files: bool,

    /// Treat a PDF without bookmarks as a finished (empty) outline instead of
    /// a data-insufficiency failure. Default: false.
    pub allow_empty_outline: bool,

    /// LLM provider used for metadata extraction and OCR (e.g. "openai").
    pub provider_name: Option<String>,

    /// Model for metadata extraction and OCR.
    pub model: Option<String>,

    /// Pre-constructed provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Provider for translation; falls back to the main provider when unset.
    pub translation_provider_name: Option<String>,

    /// Model for translation.
    pub translation_model: Option<String>,

    /// Secondary translation provider, tried when the first one fails.
    pub fallback_translation_provider_name: Option<String>,

    /// Model for the secondary translation provider.
    pub fallback_translation_model: Option<String>,

    /// Sampling temperature for every LLM call. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens per LLM completion. Default: 2048.
    pub max_tokens: usize,

    /// Google Books API key. The public endpoint works without one at a
    /// lower quota.
    pub google_books_api_key: Option<String>,

    /// HTTP(S) proxy for Google Books and cover downloads.
    pub proxy: Option<String>,

    /// Timeout for a single HTTP request in seconds. Default: 30.
    pub http_timeout_secs: u64,

    /// Directory containing the pdfium shared library. System library when unset.
    pub pdfium_lib_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            corpus_dir: PathBuf::new(),
            library_dir: PathBuf::new(),
            data_dir: None,
            max_filename_bytes: 255,
            sibling_suffixes: DEFAULT_SIBLING_SUFFIXES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            copyright_scan_pages: 10,
            ocr_pages: 5,
            max_retries: 3,
            retry_backoff_ms: 500,
            toc_batch_size: 40,
            rename_files: true,
            allow_empty_outline: false,
            provider_name: None,
            model: None,
            provider: None,
            translation_provider_name: None,
            translation_model: None,
            fallback_translation_provider_name: None,
            fallback_translation_model: None,
            temperature: 0.1,
            max_tokens: 2048,
            google_books_api_key: None,
            proxy: None,
            http_timeout_secs: 30,
            pdfium_lib_dir: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("corpus_dir", &self.corpus_dir)
            .field("library_dir", &self.library_dir)
            .field("data_dir", &self.data_dir())
            .field("max_filename_bytes", &self.max_filename_bytes)
            .field("sibling_suffixes", &self.sibling_suffixes.len())
            .field("copyright_scan_pages", &self.copyright_scan_pages)
            .field("max_retries", &self.max_retries)
            .field("toc_batch_size", &self.toc_batch_size)
            .field("rename_files", &self.rename_files)
            .field("allow_empty_outline", &self.allow_empty_outline)
            .field("provider_name", &self.provider_name)
            .field("model", &self.model)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("translation_provider_name", &self.translation_provider_name)
            .field(
                "google_books_api_key",
                &self.google_books_api_key.as_ref().map(|_| "<redacted>"),
            )
            .field("proxy", &self.proxy)
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Start a builder pre-filled from a resolved settings section.
    ///
    /// Recognised keys (all optional): `EBOOKS_PATH`, `WIKI_BASE_PATH`
    /// (alias `LIBRARY_DIR`), `DATA_DIR`, `MAX_FILENAME_BYTES` (alias
    /// `MAX_FILENAME_LENGTH`),
    /// `SIBLING_SUFFIXES`, `COPYRIGHT_SCAN_PAGES`, `OCR_PAGES`, `MAX_RETRIES`,
    /// `RETRY_BACKOFF_MS`, `TOC_BATCH_SIZE`, `RENAME_PDF_FILES`,
    /// `ALLOW_EMPTY_OUTLINE`, `LLM_PROVIDER`, `LLM_MODEL`,
    /// `TRANSLATION_PROVIDER`, `TRANSLATION_MODEL`,
    /// `FALLBACK_TRANSLATION_PROVIDER`, `FALLBACK_TRANSLATION_MODEL`,
    /// `OLLAMA_MODEL`, `GOOGLE_BOOKS_API_KEY`, `PROXY` (or `PROXIES.https` /
    /// `PROXIES.http`), `HTTP_TIMEOUT_SECS`, `PDFIUM_LIB_DIR`.
    pub fn from_settings(settings: &Settings) -> Result<PipelineConfigBuilder, ShelfError> {
        let mut b = Self::builder();

        if let Some(v) = settings.get("EBOOKS_PATH") {
            b = b.corpus_dir(v);
        }
        if let Some(v) = settings.get("WIKI_BASE_PATH").or_else(|| settings.get("LIBRARY_DIR")) {
            b = b.library_dir(v);
        }
        if let Some(v) = settings.get("DATA_DIR") {
            b = b.data_dir(v);
        }
        let name_limit = match settings.parse::<usize>("MAX_FILENAME_BYTES")? {
            Some(n) => Some(n),
            None => settings.parse::<usize>("MAX_FILENAME_LENGTH")?,
        };
        if let Some(n) = name_limit {
            b = b.max_filename_bytes(n);
        }
        if let Some(list) = settings.get_list("SIBLING_SUFFIXES") {
            b = b.sibling_suffixes(list);
        }
        if let Some(n) = settings.parse::<usize>("COPYRIGHT_SCAN_PAGES")? {
            b = b.copyright_scan_pages(n);
        }
        if let Some(n) = settings.parse::<usize>("OCR_PAGES")? {
            b = b.ocr_pages(n);
        }
        if let Some(n) = settings.parse::<u32>("MAX_RETRIES")? {
            b = b.max_retries(n);
        }
        if let Some(n) = settings.parse::<u64>("RETRY_BACKOFF_MS")? {
            b = b.retry_backoff_ms(n);
        }
        if let Some(n) = settings.parse::<usize>("TOC_BATCH_SIZE")? {
            b = b.toc_batch_size(n);
        }
        if let Some(v) = settings.get_bool("RENAME_PDF_FILES")? {
            b = b.rename_files(v);
        }
        if let Some(v) = settings.get_bool("ALLOW_EMPTY_OUTLINE")? {
            b = b.allow_empty_outline(v);
        }
        if let Some(v) = settings.get("LLM_PROVIDER") {
            b = b.provider_name(v);
        }
        if let Some(v) = settings.get("LLM_MODEL") {
            b = b.model(v);
        }
        if let Some(v) = settings.get("TRANSLATION_PROVIDER") {
            b = b.translation_provider_name(v);
        }
        if let Some(v) = settings.get("TRANSLATION_MODEL") {
            b = b.translation_model(v);
        }
        if let Some(v) = settings.get("FALLBACK_TRANSLATION_PROVIDER") {
            b = b.fallback_translation_provider_name(v);
        }
        if let Some(v) = settings
            .get("FALLBACK_TRANSLATION_MODEL")
            .or_else(|| settings.get("OLLAMA_MODEL"))
        {
            b = b.fallback_translation_model(v);
        }
        if let Some(v) = settings.get("GOOGLE_BOOKS_API_KEY") {
            b = b.google_books_api_key(v);
        }
        if let Some(v) = settings
            .get("PROXY")
            .or_else(|| settings.get("PROXIES.https"))
            .or_else(|| settings.get("PROXIES.http"))
        {
            b = b.proxy(v);
        }
        if let Some(n) = settings.parse::<u64>("HTTP_TIMEOUT_SECS")? {
            b = b.http_timeout_secs(n);
        }
        if let Some(v) = settings.get("PDFIUM_LIB_DIR") {
            b = b.pdfium_lib_dir(v);
        }
        Ok(b)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| self.library_dir.join(".pdfshelf"))
    }

    pub fn records_dir(&self) -> PathBuf {
        self.data_dir().join("records")
    }

    pub fn review_list_path(&self) -> PathBuf {
        self.data_dir().join("review.txt")
    }

    pub fn meta_dir(&self) -> PathBuf {
        self.library_dir.join("meta")
    }

    pub fn toc_dir(&self) -> PathBuf {
        self.library_dir.join("toc")
    }

    pub fn covers_dir(&self) -> PathBuf {
        self.library_dir.join("covers")
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_backoff_ms)
    }

    /// Whether `name` is a sibling variant rather than a primary book file.
    pub fn is_sibling_name(&self, name: &str) -> bool {
        self.sibling_suffixes.iter().any(|s| name.ends_with(s.as_str()))
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn corpus_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.config.corpus_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn library_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.config.library_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn data_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.config.data_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn max_filename_bytes(mut self, n: usize) -> Self {
        self.config.max_filename_bytes = n.clamp(64, 4096);
        self
    }

    pub fn sibling_suffixes<I, S>(mut self, suffixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.sibling_suffixes = suffixes
            .into_iter()
            .map(Into::into)
            .filter(|s: &String| !s.is_empty())
            .collect();
        self
    }

    pub fn copyright_scan_pages(mut self, n: usize) -> Self {
        self.config.copyright_scan_pages = n.clamp(1, 50);
        self
    }

    pub fn ocr_pages(mut self, n: usize) -> Self {
        self.config.ocr_pages = n.clamp(1, 20);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n.min(10);
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn toc_batch_size(mut self, n: usize) -> Self {
        self.config.toc_batch_size = n.clamp(1, 200);
        self
    }

    pub fn rename_files(mut self, v: bool) -> Self {
        self.config.rename_files = v;
        self
    }

    pub fn allow_empty_outline(mut self, v: bool) -> Self {
        self.config.allow_empty_outline = v;
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn translation_provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.translation_provider_name = Some(name.into());
        self
    }

    pub fn translation_model(mut self, model: impl Into<String>) -> Self {
        self.config.translation_model = Some(model.into());
        self
    }

    pub fn fallback_translation_provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.fallback_translation_provider_name = Some(name.into());
        self
    }

    pub fn fallback_translation_model(mut self, model: impl Into<String>) -> Self {
        self.config.fallback_translation_model = Some(model.into());
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n.max(64);
        self
    }

    pub fn google_books_api_key(mut self, key: impl Into<String>) -> Self {
        self.config.google_books_api_key = Some(key.into());
        self
    }

    pub fn proxy(mut self, url: impl Into<String>) -> Self {
        self.config.proxy = Some(url.into());
        self
    }

    pub fn http_timeout_secs(mut self, secs: u64) -> Self {
        self.config.http_timeout_secs = secs.max(1);
        self
    }

    pub fn pdfium_lib_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.config.pdfium_lib_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, ShelfError> {
        let c = &self.config;
        if c.corpus_dir.as_os_str().is_empty() {
            return Err(ShelfError::InvalidConfig(
                "corpus directory is not set (EBOOKS_PATH)".into(),
            ));
        }
        if c.library_dir.as_os_str().is_empty() {
            return Err(ShelfError::InvalidConfig(
                "library directory is not set (WIKI_BASE_PATH)".into(),
            ));
        }
        if let Some(bad) = c.sibling_suffixes.iter().find(|s| !s.ends_with(".pdf")) {
            return Err(ShelfError::InvalidConfig(format!(
                "sibling suffix '{bad}' must end with .pdf"
            )));
        }
        if c.ocr_pages > c.copyright_scan_pages {
            return Err(ShelfError::InvalidConfig(format!(
                "OCR pages ({}) cannot exceed copyright scan pages ({})",
                c.ocr_pages, c.copyright_scan_pages
            )));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn minimal() -> PipelineConfigBuilder {
        PipelineConfig::builder()
            .corpus_dir("/books")
            .library_dir("/wiki")
    }

    #[test]
    fn defaults() {
        let c = minimal().build().unwrap();
        assert_eq!(c.max_filename_bytes, 255);
        assert_eq!(c.copyright_scan_pages, 10);
        assert_eq!(c.max_retries, 3);
        assert!(c.rename_files);
        assert!(!c.allow_empty_outline);
        assert_eq!(c.records_dir(), PathBuf::from("/wiki/.pdfshelf/records"));
        assert!(c.is_sibling_name("book_dual.pdf"));
        assert!(!c.is_sibling_name("book.pdf"));
    }

    #[test]
    fn missing_dirs_rejected() {
        assert!(PipelineConfig::builder().library_dir("/wiki").build().is_err());
        assert!(PipelineConfig::builder().corpus_dir("/books").build().is_err());
    }

    #[test]
    fn setters_clamp() {
        let c = minimal()
            .max_filename_bytes(3)
            .toc_batch_size(0)
            .copyright_scan_pages(1000)
            .build()
            .unwrap();
        assert_eq!(c.max_filename_bytes, 64);
        assert_eq!(c.toc_batch_size, 1);
        assert_eq!(c.copyright_scan_pages, 50);
    }

    #[test]
    fn sibling_suffix_must_be_pdf() {
        let err = minimal().sibling_suffixes(["_dual.epub"]).build().unwrap_err();
        assert!(err.to_string().contains("_dual.epub"));
    }

    #[test]
    fn debug_redacts_api_key() {
        let c = minimal().google_books_api_key("secret-key").build().unwrap();
        let dbg = format!("{c:?}");
        assert!(!dbg.contains("secret-key"));
        assert!(dbg.contains("<redacted>"));
    }

    #[test]
    fn from_settings_maps_keys() {
        let mut values = BTreeMap::new();
        values.insert("EBOOKS_PATH".to_string(), "/mnt/ebooks".to_string());
        values.insert("WIKI_BASE_PATH".to_string(), "/mnt/wiki".to_string());
        values.insert("RENAME_PDF_FILES".to_string(), "false".to_string());
        values.insert("MAX_FILENAME_BYTES".to_string(), "200".to_string());
        values.insert("PROXIES.https".to_string(), "http://127.0.0.1:7890".to_string());
        values.insert("SIBLING_SUFFIXES".to_string(), "_dual.pdf, _zh.pdf".to_string());
        let settings = Settings::from_map("test", values);

        let c = PipelineConfig::from_settings(&settings).unwrap().build().unwrap();
        assert_eq!(c.corpus_dir, PathBuf::from("/mnt/ebooks"));
        assert_eq!(c.library_dir, PathBuf::from("/mnt/wiki"));
        assert!(!c.rename_files);
        assert_eq!(c.max_filename_bytes, 200);
        assert_eq!(c.proxy.as_deref(), Some("http://127.0.0.1:7890"));
        assert_eq!(c.sibling_suffixes, vec!["_dual.pdf", "_zh.pdf"]);
    }

    #[test]
    fn from_settings_rejects_bad_numbers() {
        let mut values = BTreeMap::new();
        values.insert("MAX_RETRIES".to_string(), "many".to_string());
        let settings = Settings::from_map("test", values);
        assert!(PipelineConfig::from_settings(&settings).is_err());
    }
}
