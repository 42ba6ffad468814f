use async_trait::async_trait;
use lazy_static::lazy_static;
use log::error;
use reqwest::header::USER_AGENT;
use reqwest::Client as HttpClient;
use scraper::{ Html, Selector };
use std::time::Duration;

use super::{ FetchedDocument, PageFetcher, BROWSER_USER_AGENT };
use crate::text::truncate_chars;

pub const MAX_TEXT_CHARS: usize = 5000;
pub const MAX_MAIN_CONTENT_CHARS: usize = 3000;

const SKIPPED_ELEMENTS: [&str; 3] = ["script", "style", "noscript"];

lazy_static! {
    static ref TITLE: Selector = Selector::parse("title").unwrap();
    static ref PARAGRAPH: Selector = Selector::parse("p").unwrap();
}

pub struct WebFetcher {
    http: HttpClient,
    timeout: Duration,
}

impl WebFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self { http: HttpClient::new(), timeout }
    }
}

#[async_trait]
impl PageFetcher for WebFetcher {
    async fn fetch(&self, url: &str) -> FetchedDocument {
        let resp = match
            self.http
                .get(url)
                .header(USER_AGENT, BROWSER_USER_AGENT)
                .timeout(self.timeout)
                .send().await
        {
            Ok(resp) => resp,
            Err(e) => {
                error!("Error fetching URL {}: {}", url, e);
                return FetchedDocument::failed(url, e.to_string(), None);
            }
        };

        let status = resp.status();
        if !status.is_success() {
            error!("Error fetching URL {}: status {}", url, status);
            return FetchedDocument::failed(
                url,
                format!("HTTP status {}", status),
                Some(status.as_u16())
            );
        }

        match resp.text().await {
            Ok(html) => extract_document(url, status.as_u16(), &html),
            Err(e) => {
                error!("Error reading body of {}: {}", url, e);
                FetchedDocument::failed(url, e.to_string(), Some(status.as_u16()))
            }
        }
    }
}

/// Title, visible text and paragraph content of an HTML page.
pub fn extract_document(url: &str, status_code: u16, html: &str) -> FetchedDocument {
    let document = Html::parse_document(html);

    let title = document
        .select(&TITLE)
        .next()
        .map(|t| t.text().collect::<String>().trim().to_string())
        .unwrap_or_default();

    let text = document
        .root_element()
        .descendants()
        .filter_map(|node| {
            let text = node.value().as_text()?;
            let skipped = node.ancestors().any(|ancestor| {
                ancestor
                    .value()
                    .as_element()
                    .map_or(false, |el| SKIPPED_ELEMENTS.contains(&el.name()))
            });
            let trimmed = text.trim();
            if skipped || trimmed.is_empty() {
                None
            } else {
                Some(trimmed)
            }
        })
        .collect::<Vec<_>>()
        .join("\n");

    let main_content = document
        .select(&PARAGRAPH)
        .map(|p| p.text().collect::<String>().trim().to_string())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");

    FetchedDocument {
        url: url.to_string(),
        title,
        text: truncate_chars(&text, MAX_TEXT_CHARS).to_string(),
        main_content: truncate_chars(&main_content, MAX_MAIN_CONTENT_CHARS).to_string(),
        status_code: Some(status_code),
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str =
        r#"<!doctype html>
<html>
<head>
  <title> Ownership in Rust </title>
  <style>body { color: red; }</style>
  <script>var tracking = "should not appear";</script>
</head>
<body>
  <nav>Home</nav>
  <noscript>Enable JavaScript</noscript>
  <p>Each value has an owner.</p>
  <div><p>There can only be one owner at a time.</p></div>
  <p>   </p>
</body>
</html>"#;

    #[test]
    fn extracts_title_text_and_paragraphs() {
        let doc = extract_document("https://example.com/own", 200, PAGE);
        assert_eq!(doc.url, "https://example.com/own");
        assert_eq!(doc.title, "Ownership in Rust");
        assert_eq!(doc.status_code, Some(200));
        assert!(doc.error.is_none());
        assert_eq!(
            doc.main_content,
            "Each value has an owner.\n\nThere can only be one owner at a time."
        );
        assert!(doc.text.contains("Home\n"));
        assert!(!doc.text.contains("tracking"));
        assert!(!doc.text.contains("color: red"));
        assert!(!doc.text.contains("Enable JavaScript"));
    }

    #[test]
    fn bounds_text_and_main_content() {
        let paragraph = "word ".repeat(400);
        let html = format!("<html><body>{}</body></html>", format!("<p>{}</p>", paragraph).repeat(5));
        let doc = extract_document("https://example.com", 200, &html);
        assert_eq!(doc.main_content.chars().count(), MAX_MAIN_CONTENT_CHARS);
        assert!(doc.text.chars().count() <= MAX_TEXT_CHARS);
    }

    #[tokio::test]
    async fn unreachable_page_yields_error_record() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let doc = WebFetcher::new(Duration::from_secs(2)).fetch(&format!("http://{}/", addr)).await;
        assert!(doc.error.is_some());
        assert!(doc.text.is_empty());
        assert!(doc.main_content.is_empty());
        assert_eq!(doc.status_code, None);
    }
}
