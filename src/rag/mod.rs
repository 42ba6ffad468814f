//! Web-search context injection.
//!
//! A query is run against a search surface, the top hit is fetched, and the
//! lot is rendered into one system message appended to the conversation
//! before it reaches the model.

pub mod fetch;
pub mod search;

use async_trait::async_trait;
use log::{ info, warn };
use serde::{ Deserialize, Serialize };
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use crate::cli::Args;
use crate::error::RetrievalError;
use crate::models::chat::Message;
use crate::text::truncate_with_marker;

pub const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

pub const EXCERPT_MAX_CHARS: usize = 2000;
pub const TRUNCATION_MARKER: &str = "... [content truncated]";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub published_date: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedDocument {
    pub url: String,
    pub title: String,
    pub text: String,
    pub main_content: String,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

impl FetchedDocument {
    pub fn failed(url: &str, error: impl Into<String>, status_code: Option<u16>) -> Self {
        Self {
            url: url.to_string(),
            status_code,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>, RetrievalError>;
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Never fails; problems are reported through [`FetchedDocument::error`].
    async fn fetch(&self, url: &str) -> FetchedDocument;
}

/// Result of one augmentation attempt.
#[derive(Debug, Clone)]
pub struct Augmentation {
    /// `None` when the search came back empty.
    pub message: Option<Message>,
    pub result_count: usize,
}

pub struct RetrievalAugmenter {
    search: Arc<dyn SearchProvider>,
    fetcher: Arc<dyn PageFetcher>,
    max_results: usize,
}

impl RetrievalAugmenter {
    pub fn new(
        search: Arc<dyn SearchProvider>,
        fetcher: Arc<dyn PageFetcher>,
        max_results: usize
    ) -> Self {
        Self { search, fetcher, max_results }
    }

    pub fn from_args(args: &Args) -> Self {
        let timeout = Duration::from_secs(args.web_timeout);
        Self::new(
            Arc::new(search::DuckDuckGoSearch::new(args.search_url.clone(), timeout)),
            Arc::new(fetch::WebFetcher::new(timeout)),
            args.search_results
        )
    }

    /// Best-effort search: failures are logged and read as "no results".
    pub async fn search(&self, query: &str, limit: usize) -> Vec<SearchResult> {
        match self.search.search(query, limit).await {
            Ok(results) => results,
            Err(e) => {
                warn!("Web search for '{}' failed: {}", query, e);
                Vec::new()
            }
        }
    }

    pub async fn fetch(&self, url: &str) -> FetchedDocument {
        self.fetcher.fetch(url).await
    }

    /// Searches for `query` and renders the context message.
    ///
    /// Only the top-ranked result is fetched; the rest appear as summaries.
    pub async fn augment(&self, query: &str) -> Result<Augmentation, RetrievalError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(RetrievalError::EmptyQuery);
        }

        let results = self.search.search(query, self.max_results).await?;
        let Some(top) = results.first() else {
            info!("Web search for '{}' returned no results", query);
            return Ok(Augmentation { message: None, result_count: 0 });
        };

        let document = self.fetcher.fetch(&top.url).await;
        if let Some(err) = &document.error {
            warn!("Could not fetch top result {}: {}", top.url, err);
        }

        info!("Augmenting with {} search results for '{}'", results.len(), query);
        Ok(Augmentation {
            message: Some(Message::system(render_context(query, &results, &document))),
            result_count: results.len(),
        })
    }
}

/// Body of the injected system message.
pub fn render_context(query: &str, results: &[SearchResult], top: &FetchedDocument) -> String {
    let mut out = format!("Web search results for \"{}\":\n", query);
    for (rank, result) in results.iter().enumerate() {
        let _ = write!(
            out,
            "\n{}. {}\n   URL: {}\n   {}\n",
            rank + 1,
            result.title,
            result.url,
            result.snippet
        );
    }

    let excerpt = if top.main_content.trim().is_empty() { &top.text } else { &top.main_content };
    if !excerpt.trim().is_empty() {
        let _ = write!(
            out,
            "\nContent from top result ({}):\n{}\n",
            top.url,
            truncate_with_marker(excerpt, EXCERPT_MAX_CHARS, TRUNCATION_MARKER)
        );
    }

    out.push_str("\nUse this information to answer the user's question and cite the URLs you rely on.");
    out
}
