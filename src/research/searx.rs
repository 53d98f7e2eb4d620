//! SearxNG-compatible search and page fetching over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::error::ResearchError;
use crate::research::html::strip_html;
use crate::research::{ResearchClient, SearchHit};

#[derive(Debug, Deserialize)]
struct SearxResponse {
    #[serde(default)]
    results: Vec<SearxResult>,
}

#[derive(Debug, Deserialize)]
struct SearxResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    content: String,
}

/// HTTP research client against a SearxNG instance.
pub struct SearxClient {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl SearxClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let base_url: String = base_url.into();
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }
}

fn to_hits(response: SearxResponse, limit: usize) -> Vec<SearchHit> {
    response
        .results
        .into_iter()
        .filter(|r| !r.url.is_empty())
        .take(limit)
        .map(|r| SearchHit {
            title: r.title,
            url: r.url,
            snippet: r.content,
        })
        .collect()
}

#[async_trait]
impl ResearchClient for SearxClient {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, ResearchError> {
        let failed = |reason: String| ResearchError::SearchFailed {
            query: query.to_string(),
            reason,
        };

        let response = self
            .client
            .get(format!("{}/search", self.base_url))
            .query(&[("q", query), ("format", "json")])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("HTTP {}", status.as_u16())));
        }

        let parsed: SearxResponse = response
            .json()
            .await
            .map_err(|e| ResearchError::InvalidResponse(e.to_string()))?;

        let hits = to_hits(parsed, limit);
        tracing::debug!(query, hits = hits.len(), "Search complete");
        Ok(hits)
    }

    async fn fetch_page(&self, url: &str) -> Result<String, ResearchError> {
        let failed = |reason: String| ResearchError::FetchFailed {
            url: url.to_string(),
            reason,
        };

        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("HTTP {}", status.as_u16())));
        }

        let body = response.text().await.map_err(|e| failed(e.to_string()))?;
        Ok(strip_html(&body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn results_map_to_hits_and_respect_limit() {
        let json = r#"{
            "query": "rust",
            "results": [
                {"title": "A", "url": "https://a.example", "content": "alpha"},
                {"title": "No URL", "url": "", "content": "skipped"},
                {"title": "B", "url": "https://b.example", "content": "beta"},
                {"title": "C", "url": "https://c.example"}
            ]
        }"#;
        let parsed: SearxResponse = serde_json::from_str(json).unwrap();
        let hits = to_hits(parsed, 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].snippet, "alpha");
        assert_eq!(hits[1].url, "https://b.example");
    }

    #[test]
    fn missing_results_is_empty() {
        let parsed: SearxResponse = serde_json::from_str("{}").unwrap();
        assert!(to_hits(parsed, 5).is_empty());
    }
}
