use async_trait::async_trait;
use lazy_static::lazy_static;
use log::debug;
use reqwest::header::{ ACCEPT, USER_AGENT };
use reqwest::Client as HttpClient;
use scraper::{ ElementRef, Html, Selector };
use std::time::Duration;

use super::{ SearchProvider, SearchResult, BROWSER_USER_AGENT };
use crate::error::RetrievalError;

pub const DEFAULT_ENDPOINT: &str = "https://html.duckduckgo.com/html/";

lazy_static! {
    static ref RESULT: Selector = Selector::parse(".result").unwrap();
    static ref TITLE: Selector = Selector::parse(".result__title").unwrap();
    static ref DISPLAY_URL: Selector = Selector::parse(".result__url").unwrap();
    static ref SNIPPET: Selector = Selector::parse(".result__snippet").unwrap();
    static ref LINK: Selector = Selector::parse("a").unwrap();
}

/// Scrapes DuckDuckGo's JavaScript-free results page.
pub struct DuckDuckGoSearch {
    http: HttpClient,
    endpoint: String,
    timeout: Duration,
}

impl DuckDuckGoSearch {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http: HttpClient::new(),
            endpoint: endpoint.into(),
            timeout,
        }
    }
}

#[async_trait]
impl SearchProvider for DuckDuckGoSearch {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>, RetrievalError> {
        let resp = self.http
            .get(&self.endpoint)
            .query(&[("q", query)])
            .header(USER_AGENT, BROWSER_USER_AGENT)
            .header(ACCEPT, "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8")
            .timeout(self.timeout)
            .send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(RetrievalError::Status(status.as_u16()));
        }
        let html = resp.text().await?;
        let results = parse_results(&html, limit);
        debug!("Search for '{}' yielded {} results", query, results.len());
        Ok(results)
    }
}

/// Extracts at most `limit` results from a results page. Entries without
/// any usable URL are skipped.
pub fn parse_results(html: &str, limit: usize) -> Vec<SearchResult> {
    let document = Html::parse_document(html);
    document
        .select(&RESULT)
        .filter_map(parse_result)
        .take(limit)
        .collect()
}

fn parse_result(element: ElementRef<'_>) -> Option<SearchResult> {
    let title_elem = element.select(&TITLE).next();
    let title = title_elem.map(squashed_text).filter(|t| !t.is_empty());

    let redirect = title_elem
        .and_then(|t| t.select(&LINK).next())
        .and_then(|a| a.value().attr("href"))
        .and_then(target_url);
    let displayed = element
        .select(&DISPLAY_URL)
        .next()
        .map(squashed_text)
        .filter(|u| !u.is_empty());
    let url = redirect.or(displayed)?;

    let snippet = element
        .select(&SNIPPET)
        .next()
        .map(squashed_text)
        .filter(|s| !s.is_empty());

    Some(SearchResult {
        title: title.unwrap_or_else(|| "No title".to_string()),
        url,
        snippet: snippet.unwrap_or_else(|| "No description".to_string()),
        published_date: None,
    })
}

/// Result links point at a redirect carrying the destination in `uddg`.
fn target_url(href: &str) -> Option<String> {
    if let Some((_, query)) = href.split_once('?') {
        let found = url::form_urlencoded
            ::parse(query.as_bytes())
            .find(|(key, _)| key == "uddg")
            .map(|(_, value)| value.into_owned());
        if found.is_some() {
            return found;
        }
    }
    if href.starts_with("http://") || href.starts_with("https://") {
        Some(href.to_string())
    } else {
        None
    }
}

fn squashed_text(element: ElementRef<'_>) -> String {
    element.text().flat_map(str::split_whitespace).collect::<Vec<_>>().join(" ")
}
