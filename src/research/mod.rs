//! Web research collaborator: search and page fetch.

pub mod html;
pub mod searx;

pub use searx::SearxClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ResearchError;

/// One search result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// Search and page-fetch interface consumed by the research phase.
#[async_trait]
pub trait ResearchClient: Send + Sync {
    /// Top `limit` results for `query`.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, ResearchError>;

    /// Plain text of the page at `url`.
    async fn fetch_page(&self, url: &str) -> Result<String, ResearchError>;
}
