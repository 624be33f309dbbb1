//! [`BookLookup`] against the public Google Books volumes API.

use super::BookLookup;
use crate::book::MetadataRecord;
use crate::config::PipelineConfig;
use crate::error::{CollaboratorError, ShelfError};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const SERVICE: &str = "google-books";
const ENDPOINT: &str = "https://www.googleapis.com/books/v1/volumes";

/// Shared HTTP client for Google Books and cover downloads.
pub fn http_client(config: &PipelineConfig) -> Result<reqwest::Client, ShelfError> {
    let mut builder = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.http_timeout_secs))
        .user_agent(concat!("pdfshelf/", env!("CARGO_PKG_VERSION")));
    if let Some(proxy) = config.proxy.as_deref() {
        let proxy = reqwest::Proxy::all(proxy)
            .map_err(|e| ShelfError::HttpClient(format!("proxy '{proxy}': {e}")))?;
        builder = builder.proxy(proxy);
    }
    builder.build().map_err(|e| ShelfError::HttpClient(e.to_string()))
}

/// Map a reqwest failure onto the retry taxonomy.
///
/// Timeouts, connection failures, 429 and 5xx are transient; any other
/// status is permanent.
pub(crate) fn classify_http(service: &str, err: reqwest::Error) -> CollaboratorError {
    if err.is_timeout() || err.is_connect() {
        return CollaboratorError::transient(service, err);
    }
    match err.status() {
        Some(s) if s.as_u16() == 429 || s.is_server_error() => {
            CollaboratorError::transient(service, err)
        }
        Some(_) => CollaboratorError::permanent(service, err),
        None => CollaboratorError::transient(service, err),
    }
}

pub struct GoogleBooks {
    client: reqwest::Client,
    api_key: Option<String>,
}

impl GoogleBooks {
    pub fn new(client: reqwest::Client, api_key: Option<String>) -> Self {
        Self { client, api_key }
    }
}

#[async_trait]
impl BookLookup for GoogleBooks {
    async fn lookup_by_isbn(&self, isbn: &str) -> Result<Option<MetadataRecord>, CollaboratorError> {
        let mut query = vec![("q", format!("isbn:{isbn}"))];
        if let Some(key) = &self.api_key {
            query.push(("key", key.clone()));
        }
        let body = self
            .client
            .get(ENDPOINT)
            .query(&query)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| classify_http(SERVICE, e))?
            .text()
            .await
            .map_err(|e| classify_http(SERVICE, e))?;

        let found = parse_volumes(&body).map_err(|e| CollaboratorError::permanent(SERVICE, e))?;
        debug!(
            "google-books isbn:{} → {}",
            isbn,
            found.as_ref().map(|m| m.title.as_str()).unwrap_or("no match")
        );
        Ok(found)
    }
}

// ── Response shape ───────────────────────────────────────────────────────

#[derive(Deserialize)]
struct Volumes {
    #[serde(default)]
    items: Vec<Volume>,
}

#[derive(Deserialize)]
struct Volume {
    #[serde(default)]
    id: String,
    #[serde(rename = "volumeInfo", default)]
    info: VolumeInfo,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct VolumeInfo {
    title: String,
    subtitle: String,
    authors: Vec<String>,
    publisher: String,
    published_date: String,
    description: String,
    industry_identifiers: Vec<Identifier>,
    page_count: Option<u32>,
    categories: Vec<String>,
    language: String,
    image_links: Option<ImageLinks>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct Identifier {
    #[serde(rename = "type")]
    kind: String,
    identifier: String,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct ImageLinks {
    thumbnail: String,
    small_thumbnail: String,
}

/// First volume of a search response, or `None` for an empty result.
pub fn parse_volumes(body: &str) -> Result<Option<MetadataRecord>, serde_json::Error> {
    let volumes: Volumes = serde_json::from_str(body)?;
    let Some(volume) = volumes.items.into_iter().next() else {
        return Ok(None);
    };
    let info = volume.info;

    let isbn = info
        .industry_identifiers
        .iter()
        .find(|i| i.kind == "ISBN_13")
        .map(|i| i.identifier.clone())
        .unwrap_or_default();
    let cover_url = info
        .image_links
        .map(|l| {
            if l.thumbnail.is_empty() {
                l.small_thumbnail
            } else {
                l.thumbnail
            }
        })
        .unwrap_or_default()
        .replacen("http://", "https://", 1);

    Ok(Some(MetadataRecord {
        title: info.title,
        subtitle: info.subtitle,
        authors: info.authors,
        publisher: info.publisher,
        published_date: info.published_date,
        isbn,
        categories: info.categories,
        description: info.description,
        language: info.language,
        page_count: info.page_count.filter(|n| *n > 0),
        google_id: volume.id,
        cover_url,
        ..MetadataRecord::default()
    }))
}
