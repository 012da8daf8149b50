//! # Search Module
//!
//! Turns one sub-query into one [`EvidenceItem`] by asking the configured web
//! search engines for snippets and source URLs.
//!
//! Two engines are supported:
//! - **Tavily** (default): the Tavily Search API, authenticated with an API key
//! - **DuckDuckGo**: the key-less HTML endpoint, scraped for result links
//!
//! Failures are reported as [`ProviderError`] and are never retried here; the
//! orchestrator decides what a failed sub-query means for the run.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::RunConfig;
use crate::error::ConfigError;
use crate::ledger::SubQuery;

const TAVILY_BASE_URL: &str = "https://api.tavily.com";
const DUCKDUCKGO_BASE_URL: &str = "https://html.duckduckgo.com";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Rough characters-per-token ratio used to cap evidence size.
const CHARS_PER_TOKEN: usize = 4;

// =============================================================================
// ERRORS
// =============================================================================
/// A search provider call that did not yield evidence.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Unauthorized - check the search API key")]
    Unauthorized,

    #[error("Rate limited by search provider")]
    RateLimited,

    #[error("Search request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("HTTP error ({0}): {1}")]
    Http(u16, String),

    #[error("Malformed provider response: {0}")]
    Malformed(String),

    #[error("Search engine {0} is not configured")]
    NotConfigured(SearchEngine),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout
        } else if e.is_decode() {
            ProviderError::Malformed(e.to_string())
        } else {
            ProviderError::Network(e.to_string())
        }
    }
}

/// Map a non-success HTTP status to the matching error.
fn status_error(status: StatusCode, body: String) -> ProviderError {
    match status.as_u16() {
        401 | 403 => ProviderError::Unauthorized,
        429 => ProviderError::RateLimited,
        400 => ProviderError::BadRequest(body),
        code => ProviderError::Http(code, body),
    }
}

// =============================================================================
// SEARCH ENGINES
// =============================================================================
/// Identifier of a search backend, as listed in `SEARCH_ENGINES`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchEngine {
    Tavily,
    #[serde(rename = "duckduckgo")]
    DuckDuckGo,
}

impl SearchEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchEngine::Tavily => "tavily",
            SearchEngine::DuckDuckGo => "duckduckgo",
        }
    }
}

impl fmt::Display for SearchEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchEngine {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tavily" => Ok(SearchEngine::Tavily),
            "duckduckgo" | "ddg" => Ok(SearchEngine::DuckDuckGo),
            other => Err(ConfigError::UnknownSearchEngine(other.to_string())),
        }
    }
}

// =============================================================================
// EVIDENCE
// =============================================================================
/// One snippet/URL record returned by a search engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// The search results gathered for one sub-query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub source_sub_query: SubQuery,
    pub hits: Vec<SearchHit>,
}

impl EvidenceItem {
    pub fn new(source_sub_query: SubQuery, hits: Vec<SearchHit>) -> Self {
        Self { source_sub_query, hits }
    }

    /// Source URLs in the order the provider returned them.
    pub fn urls(&self) -> impl Iterator<Item = &str> {
        self.hits.iter().map(|hit| hit.url.as_str())
    }

    /// Markdown digest handed to the language model.
    pub fn to_markdown(&self) -> String {
        let mut output = format!(
            "## Search Query {}: {}\n\n",
            self.source_sub_query.sequence_number, self.source_sub_query.text
        );

        if self.hits.is_empty() {
            output.push_str("No results found.\n");
            return output;
        }

        for hit in &self.hits {
            output.push_str(&format!("### [{}]({})\n{}\n\n", hit.title, hit.url, hit.snippet));
        }

        output
    }
}

/// A sub-query whose search failed, kept for the run report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchFailure {
    pub query: SubQuery,
    #[serde(serialize_with = "serialize_display")]
    pub error: ProviderError,
}

fn serialize_display<S: serde::Serializer>(error: &ProviderError, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(error)
}

/// Fetches evidence for a single admitted sub-query.
///
/// Implementations must not retry: one call, one outcome.
#[async_trait]
pub trait EvidenceFetcher: Send + Sync {
    /// Search for `query`, requesting at most `config.max_results_per_query`
    /// records from the engines listed in `config`.
    async fn fetch(&self, query: &SubQuery, config: &RunConfig) -> Result<EvidenceItem, ProviderError>;
}

// =============================================================================
// TAVILY
// =============================================================================
#[derive(Debug, Serialize)]
struct TavilyRequest<'a> {
    query: &'a str,
    max_results: usize,
    search_depth: &'static str,
    topic: &'static str,
    include_answer: bool,
    include_raw_content: bool,
}

#[derive(Debug, Deserialize)]
struct TavilyResponse {
    results: Vec<TavilyResult>,
}

#[derive(Debug, Deserialize)]
struct TavilyResult {
    title: String,
    url: String,
    content: String,
}

/// Client for the Tavily Search API.
#[derive(Debug, Clone)]
pub struct TavilyClient {
    api_key: String,
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl TavilyClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            client: Client::new(),
            base_url: TAVILY_BASE_URL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>, ProviderError> {
        let request = TavilyRequest {
            query,
            max_results,
            search_depth: "basic",
            topic: "general",
            include_answer: false,
            include_raw_content: false,
        };

        let response = self
            .client
            .post(format!("{}/search", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }

        let body = response.text().await?;
        let parsed: TavilyResponse =
            serde_json::from_str(&body).map_err(|e| ProviderError::Malformed(e.to_string()))?;

        Ok(parsed
            .results
            .into_iter()
            .map(|r| SearchHit {
                title: r.title,
                url: r.url,
                snippet: r.content,
            })
            .collect())
    }
}

// =============================================================================
// DUCKDUCKGO
// =============================================================================
/// Key-less search through DuckDuckGo's HTML endpoint.
///
/// DuckDuckGo has no free web search API, so result links are scraped from
/// the HTML page. Snippets are not extracted; each hit carries its domain as
/// the title.
#[derive(Debug, Clone)]
pub struct DuckDuckGoClient {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl Default for DuckDuckGoClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DuckDuckGoClient {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            base_url: DUCKDUCKGO_BASE_URL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>, ProviderError> {
        let url = format!("{}/html/?q={}", self.base_url, urlencoding::encode(query));
        debug!(url = %url, "Fetching DuckDuckGo results");

        let response = self
            .client
            .get(&url)
            .header("User-Agent", USER_AGENT)
            .timeout(self.timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }

        let body = response.text().await?;
        Ok(parse_duckduckgo_html(&body, max_results))
    }
}

/// Extract result links from a DuckDuckGo HTML page.
///
/// Result anchors point at a redirect carrying the target in its `uddg=`
/// parameter; the visible `result__url` anchors are used when no redirect
/// links are present.
fn parse_duckduckgo_html(html: &str, max_results: usize) -> Vec<SearchHit> {
    let mut hits = Vec::new();
    let mut seen = HashSet::new();

    let mut push = |url: String, hits: &mut Vec<SearchHit>| {
        if url.contains("duckduckgo.com") || !seen.insert(url.clone()) {
            return;
        }
        hits.push(SearchHit {
            title: extract_domain(&url).unwrap_or_else(|| "Result".to_string()),
            url,
            snippet: String::new(),
        });
    };

    for segment in html.split("uddg=").skip(1) {
        if hits.len() >= max_results {
            break;
        }
        let Some(end) = segment.find(['&', '"', '\'']) else {
            continue;
        };
        if let Ok(url) = urlencoding::decode(&segment[..end]) {
            if url.starts_with("http") {
                push(url.into_owned(), &mut hits);
            }
        }
    }

    if hits.is_empty() {
        for segment in html.split("result__url").skip(1) {
            if hits.len() >= max_results {
                break;
            }
            let Some(href_start) = segment.find("href=\"") else {
                continue;
            };
            let after_href = &segment[href_start + 6..];
            let Some(href_end) = after_href.find('"') else {
                continue;
            };
            let href = &after_href[..href_end];
            let url = if let Some(rest) = href.strip_prefix("//") {
                format!("https://{rest}")
            } else if href.starts_with("http") {
                href.to_string()
            } else {
                continue;
            };
            push(url, &mut hits);
        }
    }

    hits.truncate(max_results);
    hits
}

/// Extract the host from a URL.
fn extract_domain(url: &str) -> Option<String> {
    url.split("//")
        .nth(1)?
        .split('/')
        .next()
        .filter(|host| !host.is_empty())
        .map(|host| host.to_string())
}

// =============================================================================
// WEB EVIDENCE FETCHER
// =============================================================================
/// The production [`EvidenceFetcher`]: consults the run's engines in order.
///
/// Engines are queried until `max_results` distinct URLs are collected. The
/// combined snippet text is then capped at the context token budget by
/// dropping trailing hits (the first hit is always kept).
#[derive(Debug, Clone)]
pub struct WebEvidenceFetcher {
    tavily: Option<TavilyClient>,
    duckduckgo: DuckDuckGoClient,
    max_context_tokens: usize,
}

impl WebEvidenceFetcher {
    pub fn new(tavily: Option<TavilyClient>, duckduckgo: DuckDuckGoClient, max_context_tokens: usize) -> Self {
        Self {
            tavily,
            duckduckgo,
            max_context_tokens,
        }
    }

    async fn search_engine(
        &self,
        engine: SearchEngine,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchHit>, ProviderError> {
        match engine {
            SearchEngine::Tavily => {
                let tavily = self
                    .tavily
                    .as_ref()
                    .ok_or(ProviderError::NotConfigured(SearchEngine::Tavily))?;
                tavily.search(query, max_results).await
            }
            SearchEngine::DuckDuckGo => self.duckduckgo.search(query, max_results).await,
        }
    }

    fn cap_context(&self, hits: Vec<SearchHit>) -> Vec<SearchHit> {
        let budget = self.max_context_tokens.saturating_mul(CHARS_PER_TOKEN);
        let mut used = 0;
        let mut kept = Vec::with_capacity(hits.len());

        for hit in hits {
            let cost = hit.title.len() + hit.url.len() + hit.snippet.len();
            if !kept.is_empty() && used + cost > budget {
                debug!(dropped_url = %hit.url, "Evidence context budget reached");
                break;
            }
            used += cost;
            kept.push(hit);
        }

        kept
    }
}

#[async_trait]
impl EvidenceFetcher for WebEvidenceFetcher {
    async fn fetch(&self, query: &SubQuery, config: &RunConfig) -> Result<EvidenceItem, ProviderError> {
        let max_results = config.max_results_per_query;
        let mut hits: Vec<SearchHit> = Vec::new();
        let mut seen = HashSet::new();

        for engine in config.engines() {
            if hits.len() >= max_results {
                break;
            }

            let found = self
                .search_engine(engine, &query.text, max_results - hits.len())
                .await
                .inspect_err(|e| warn!(engine = %engine, query = %query.text, error = %e, "Search failed"))?;

            hits.extend(found.into_iter().filter(|hit| seen.insert(hit.url.clone())));
        }

        hits.truncate(max_results);
        let hits = self.cap_context(hits);

        info!(
            sequence = query.sequence_number,
            query = %query.text,
            count = hits.len(),
            "Search completed"
        );

        Ok(EvidenceItem::new(query.clone(), hits))
    }
}


/// HTTP tests against a mocked search server
#[cfg(test)]
mod http_tests {
    use super::*;
    use chrono::NaiveDate;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn run_config(engines: Option<Vec<SearchEngine>>, max_results: usize) -> RunConfig {
        RunConfig {
            max_results_per_query: max_results,
            issued_on: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            search_engines: engines,
        }
    }

    fn sub_query(text: &str) -> SubQuery {
        SubQuery {
            text: text.to_string(),
            sequence_number: 1,
        }
    }

    fn tavily_body() -> serde_json::Value {
        serde_json::json!({
            "answer": null,
            "results": [
                {
                    "title": "Quantum annealing - Wikipedia",
                    "url": "https://en.wikipedia.org/wiki/Quantum_annealing",
                    "content": "Quantum annealing is an optimization process.",
                    "score": 0.97
                },
                {
                    "title": "D-Wave",
                    "url": "https://www.dwavesys.com/",
                    "content": "Commercial quantum annealers.",
                    "score": 0.81
                }
            ]
        })
    }

    #[tokio::test]
    async fn test_tavily_search_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .and(header("Authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(tavily_body()))
            .mount(&server)
            .await;

        let client = TavilyClient::new("test-key").with_base_url(server.uri());
        let hits = client.search("quantum annealing", 3).await.unwrap();

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].title, "Quantum annealing - Wikipedia");
        assert_eq!(hits[1].snippet, "Commercial quantum annealers.");
    }

    #[tokio::test]
    async fn test_tavily_unauthorized_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Invalid API key"))
            .expect(1)
            .mount(&server)
            .await;

        let client = TavilyClient::new("bad-key").with_base_url(server.uri());
        let result = client.search("test", 3).await;

        assert_eq!(result, Err(ProviderError::Unauthorized));
    }

    #[tokio::test]
    async fn test_tavily_server_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .expect(1)
            .mount(&server)
            .await;

        let client = TavilyClient::new("key").with_base_url(server.uri());

        assert!(matches!(client.search("test", 3).await, Err(ProviderError::Http(500, _))));
    }

    #[tokio::test]
    async fn test_tavily_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let client = TavilyClient::new("key").with_base_url(server.uri());

        assert_eq!(client.search("test", 3).await, Err(ProviderError::RateLimited));
    }

    #[tokio::test]
    async fn test_tavily_malformed_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not valid json"))
            .mount(&server)
            .await;

        let client = TavilyClient::new("key").with_base_url(server.uri());

        assert!(matches!(client.search("test", 3).await, Err(ProviderError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_fetcher_bounds_results_and_wraps_sub_query() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .and(body_partial_json(serde_json::json!({"query": "quantum annealing", "max_results": 1})))
            .respond_with(ResponseTemplate::new(200).set_body_json(tavily_body()))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = WebEvidenceFetcher::new(
            Some(TavilyClient::new("key").with_base_url(server.uri())),
            DuckDuckGoClient::new(),
            4000,
        );

        let item = fetcher
            .fetch(&sub_query("quantum annealing"), &run_config(None, 1))
            .await
            .unwrap();

        assert_eq!(item.source_sub_query.text, "quantum annealing");
        assert_eq!(item.hits.len(), 1);
    }

    #[tokio::test]
    async fn test_fetcher_consults_engines_in_order_and_dedups() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(tavily_body()))
            .mount(&server)
            .await;
        let ddg_html = concat!(
            "<a href=\"/l/?uddg=https%3A%2F%2Fwww.dwavesys.com%2F&a\">dup</a>",
            "<a href=\"/l/?uddg=https%3A%2F%2Fquantum.example.org%2Fintro&b\">new</a>",
        );
        Mock::given(method("GET"))
            .and(path("/html/"))
            .and(query_param("q", "quantum annealing"))
            .respond_with(ResponseTemplate::new(200).set_body_string(ddg_html))
            .mount(&server)
            .await;

        let fetcher = WebEvidenceFetcher::new(
            Some(TavilyClient::new("key").with_base_url(server.uri())),
            DuckDuckGoClient::new().with_base_url(server.uri()),
            4000,
        );
        let config = run_config(Some(vec![SearchEngine::Tavily, SearchEngine::DuckDuckGo]), 5);

        let item = fetcher.fetch(&sub_query("quantum annealing"), &config).await.unwrap();

        assert_eq!(
            item.urls().collect::<Vec<_>>(),
            [
                "https://en.wikipedia.org/wiki/Quantum_annealing",
                "https://www.dwavesys.com/",
                "https://quantum.example.org/intro",
            ]
        );
    }

    #[tokio::test]
    async fn test_second_engine_only_fills_the_remainder() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .and(body_partial_json(serde_json::json!({"max_results": 3})))
            .respond_with(ResponseTemplate::new(200).set_body_json(tavily_body()))
            .expect(1)
            .mount(&server)
            .await;
        let ddg_html = concat!(
            "<a href=\"/l/?uddg=https%3A%2F%2Fone.example.org%2F&a\">1</a>",
            "<a href=\"/l/?uddg=https%3A%2F%2Ftwo.example.org%2F&b\">2</a>",
            "<a href=\"/l/?uddg=https%3A%2F%2Fthree.example.org%2F&c\">3</a>",
        );
        Mock::given(method("GET"))
            .and(path("/html/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(ddg_html))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = WebEvidenceFetcher::new(
            Some(TavilyClient::new("key").with_base_url(server.uri())),
            DuckDuckGoClient::new().with_base_url(server.uri()),
            4000,
        );
        let config = run_config(Some(vec![SearchEngine::Tavily, SearchEngine::DuckDuckGo]), 3);

        let item = fetcher.fetch(&sub_query("quantum annealing"), &config).await.unwrap();

        // Tavily supplied two records, so DuckDuckGo contributes only one
        assert_eq!(
            item.urls().collect::<Vec<_>>(),
            [
                "https://en.wikipedia.org/wiki/Quantum_annealing",
                "https://www.dwavesys.com/",
                "https://one.example.org/",
            ]
        );
    }

    #[tokio::test]
    async fn test_full_first_engine_skips_the_rest() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .and(body_partial_json(serde_json::json!({"max_results": 2})))
            .respond_with(ResponseTemplate::new(200).set_body_json(tavily_body()))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/html/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(""))
            .expect(0)
            .mount(&server)
            .await;

        let fetcher = WebEvidenceFetcher::new(
            Some(TavilyClient::new("key").with_base_url(server.uri())),
            DuckDuckGoClient::new().with_base_url(server.uri()),
            4000,
        );
        let config = run_config(Some(vec![SearchEngine::Tavily, SearchEngine::DuckDuckGo]), 2);

        let item = fetcher.fetch(&sub_query("quantum annealing"), &config).await.unwrap();

        assert_eq!(item.hits.len(), 2);
    }

    #[tokio::test]
    async fn test_slow_provider_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(tavily_body())
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let client = TavilyClient::new("key")
            .with_base_url(server.uri())
            .with_timeout(Duration::from_millis(50));

        assert_eq!(client.search("test", 3).await, Err(ProviderError::Timeout));
    }

    #[tokio::test]
    async fn test_fetcher_without_tavily_key_fails() {
        let fetcher = WebEvidenceFetcher::new(None, DuckDuckGoClient::new(), 4000);

        let result = fetcher.fetch(&sub_query("anything"), &run_config(None, 3)).await;

        assert_eq!(result, Err(ProviderError::NotConfigured(SearchEngine::Tavily)));
    }
}
