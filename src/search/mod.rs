//! Web search adapter
//!
//! Narrow interface over a search provider; results are folded into the LLM
//! prompt when the session has web search enabled. The default backend is
//! Tavily's JSON API.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

const TAVILY_SEARCH_URL: &str = "https://api.tavily.com/search";

/// Minimum snippet length for a result to be worth citing.
const MIN_SNIPPET_CHARS: usize = 20;

/// A single web search hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub snippet: String,
    pub url: String,
}

#[async_trait]
pub trait SearchAdapter: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>>;
}

/// Format results for inclusion in the LLM prompt.
pub fn format_results_for_prompt(results: &[SearchResult], show_urls: bool) -> String {
    if results.is_empty() {
        return "No web search results found.".to_string();
    }
    let mut formatted = String::from("\n\nWeb Search Results:\n");
    for (i, result) in results.iter().enumerate() {
        formatted.push_str(&format!("\n{}. **{}**\n", i + 1, result.title));
        if show_urls {
            formatted.push_str(&format!("   URL: {}\n", result.url));
        }
        formatted.push_str(&format!("   Content: {}\n", result.snippet));
    }
    formatted
}

/// Tavily-backed search adapter.
pub struct TavilySearch {
    client: reqwest::Client,
    api_key: String,
}

impl TavilySearch {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Debug, Deserialize)]
struct TavilyResult {
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    url: String,
}

#[async_trait]
impl SearchAdapter for TavilySearch {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchResult>> {
        info!(%query, max_results, "searching the web");

        let body = json!({
            "api_key": self.api_key,
            "query": query,
            "search_depth": "basic",
            "max_results": max_results,
            "include_answer": false,
            "include_raw_content": false,
        });

        let response = self
            .client
            .post(TAVILY_SEARCH_URL)
            .json(&body)
            .send()
            .await
            .context("Failed to send web search request")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            if status.as_u16() == 429 {
                bail!("Web search API quota exceeded. Please check your billing and rate limits.");
            }
            if status.as_u16() == 403 || status.as_u16() == 401 {
                bail!("Web search API authentication failed. Please check your API key.");
            }
            bail!("Web search failed ({status}): {text}");
        }

        let parsed: TavilyResponse = response
            .json()
            .await
            .context("Failed to parse web search response")?;

        let results: Vec<SearchResult> = parsed
            .results
            .into_iter()
            .filter(|r| r.content.trim().len() > MIN_SNIPPET_CHARS)
            .map(|r| SearchResult {
                title: r.title,
                snippet: r.content,
                url: r.url,
            })
            .collect();

        if results.is_empty() {
            warn!(%query, "no usable web search results");
        } else {
            info!(count = results.len(), "web search complete");
        }

        Ok(results)
    }
}
