//! [`CoverFetcher`] over plain HTTP.
//!
//! Uses the lookup's thumbnail link when there is one, otherwise asks Open
//! Library by ISBN. `default=false` makes Open Library answer 404 instead of
//! a blank placeholder image.

use super::google_books::classify_http;
use super::{CoverFetcher, CoverQuery};
use crate::error::CollaboratorError;
use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

const SERVICE: &str = "cover";

pub struct HttpCoverFetcher {
    client: reqwest::Client,
}

impl HttpCoverFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

/// Where to download the cover for `query` from, if anywhere.
pub fn cover_url(query: &CoverQuery<'_>) -> Option<String> {
    if !query.url.trim().is_empty() {
        return Some(query.url.trim().to_string());
    }
    if !query.isbn.trim().is_empty() {
        return Some(format!(
            "https://covers.openlibrary.org/b/isbn/{}-L.jpg?default=false",
            query.isbn.trim()
        ));
    }
    None
}

#[async_trait]
impl CoverFetcher for HttpCoverFetcher {
    async fn fetch_cover(&self, query: &CoverQuery<'_>) -> Result<Option<Vec<u8>>, CollaboratorError> {
        let Some(url) = cover_url(query) else {
            return Ok(None);
        };
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| classify_http(SERVICE, e))?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!("no cover at {}", url);
            return Ok(None);
        }
        let bytes = response
            .error_for_status()
            .map_err(|e| classify_http(SERVICE, e))?
            .bytes()
            .await
            .map_err(|e| classify_http(SERVICE, e))?;
        if bytes.is_empty() {
            return Ok(None);
        }
        debug!("cover for '{}': {} bytes", query.title, bytes.len());
        Ok(Some(bytes.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_direct_link() {
        let q = CoverQuery {
            isbn: "9789351342939",
            title: "Example",
            url: "https://books.google.com/x.jpg",
        };
        assert_eq!(cover_url(&q).as_deref(), Some("https://books.google.com/x.jpg"));
    }

    #[test]
    fn falls_back_to_isbn() {
        let q = CoverQuery {
            isbn: "9789351342939",
            ..Default::default()
        };
        assert_eq!(
            cover_url(&q).as_deref(),
            Some("https://covers.openlibrary.org/b/isbn/9789351342939-L.jpg?default=false")
        );
        assert_eq!(cover_url(&CoverQuery::default()), None);
    }
}
