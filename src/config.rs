//! # Configuration Module
//!
//! Loads settings from environment variables (and a `.env` file), validates
//! them before any run starts, and derives the immutable [`RunConfig`] each
//! research run is executed with.

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::search::SearchEngine;

/// Bounds for results requested per sub-query.
pub const MIN_RESULTS_PER_QUERY: usize = 1;
pub const MAX_RESULTS_PER_QUERY: usize = 5;

// =============================================================================
// LLM BACKEND
// =============================================================================
/// Which rig client backs the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmBackend {
    /// OpenAI API, key read from OPENAI_API_KEY
    OpenAI,
    /// Local models served by Ollama
    Ollama,
}

impl FromStr for LlmBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(LlmBackend::OpenAI),
            "ollama" => Ok(LlmBackend::Ollama),
            other => Err(ConfigError::UnknownProvider(other.to_string())),
        }
    }
}

impl fmt::Display for LlmBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmBackend::OpenAI => f.write_str("openai"),
            LlmBackend::Ollama => f.write_str("ollama"),
        }
    }
}

// =============================================================================
// RUN CONFIG
// =============================================================================
/// Settings one research run is executed with. Never changes mid-run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Upper bound on search records requested per sub-query
    pub max_results_per_query: usize,

    /// The date the run was issued on, shown to the planner
    pub issued_on: NaiveDate,

    /// Engines to consult, in order; `None` means Tavily only
    pub search_engines: Option<Vec<SearchEngine>>,
}

impl RunConfig {
    pub fn new(max_results_per_query: usize, issued_on: NaiveDate) -> Self {
        Self {
            max_results_per_query,
            issued_on,
            search_engines: None,
        }
    }

    /// The engines to consult, falling back to Tavily.
    pub fn engines(&self) -> Vec<SearchEngine> {
        match &self.search_engines {
            Some(engines) if !engines.is_empty() => engines.clone(),
            _ => vec![SearchEngine::Tavily],
        }
    }
}

// =============================================================================
// CONFIGURATION STRUCT
// =============================================================================
/// Main configuration for the researcher.
#[derive(Debug, Clone)]
pub struct Config {
    /// LLM backend used for planning and synthesis
    pub provider: LlmBackend,

    /// Model identifier (e.g., "gpt-4o", "llama3.2")
    pub model: String,

    /// Ollama server URL, only used with the ollama backend
    pub ollama_host: String,

    /// Sampling temperature for planner and synthesis calls
    pub temperature: f64,

    /// Tavily API key
    pub tavily_api_key: Option<String>,

    /// Whether OPENAI_API_KEY is present; rig's client reads it itself
    pub openai_key_present: bool,

    /// Search records requested per sub-query (1-5)
    pub max_results_per_query: usize,

    /// Maximum sub-query proposals before the run stops planning
    pub step_ceiling: usize,

    /// Engines to consult, in order
    pub search_engines: Option<Vec<SearchEngine>>,

    /// Token budget for one sub-query's evidence
    pub max_context_tokens: usize,

    /// Per-request timeout for search engine calls, in seconds
    pub search_timeout_secs: u64,

    /// Fetch sub-queries proposed in the same step concurrently
    pub concurrent_fetches: bool,

    /// Log filter for the application
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: LlmBackend::OpenAI,
            model: "gpt-4o".to_string(),
            ollama_host: "http://localhost:11434".to_string(),
            // Low temperature keeps planner JSON well-formed
            temperature: 0.3,
            tavily_api_key: None,
            openai_key_present: false,
            max_results_per_query: 3,
            step_ceiling: 10,
            search_engines: None,
            max_context_tokens: 4000,
            search_timeout_secs: 30,
            concurrent_fetches: true,
            log_level: "info".to_string(),
        }
    }
}

// =============================================================================
// CONFIGURATION LOADING
// =============================================================================
impl Config {
    /// Load configuration from environment variables, after reading `.env`
    /// if one exists.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut config = Config::default();

        if let Ok(val) = env::var("LLM_PROVIDER") {
            config.provider = val.parse().context("LLM_PROVIDER must be 'openai' or 'ollama'")?;
        }

        if let Ok(val) = env::var("RESEARCH_MODEL") {
            config.model = val;
        }

        if let Ok(val) = env::var("OLLAMA_API_BASE_URL") {
            config.ollama_host = val;
        }

        if let Ok(val) = env::var("TEMPERATURE") {
            config.temperature = val
                .parse()
                .context("TEMPERATURE must be a valid floating-point number (e.g., 0.3)")?;
        }

        config.tavily_api_key = env::var("TAVILY_API_KEY").ok().filter(|key| !key.trim().is_empty());
        config.openai_key_present = env::var("OPENAI_API_KEY").is_ok_and(|key| !key.trim().is_empty());

        if let Ok(val) = env::var("MAX_RESULTS") {
            config.max_results_per_query = val
                .parse()
                .context("MAX_RESULTS must be a valid positive integer")?;
        }

        if let Ok(val) = env::var("STEP_CEILING") {
            config.step_ceiling = val
                .parse()
                .context("STEP_CEILING must be a valid positive integer")?;
        }

        if let Ok(val) = env::var("SEARCH_ENGINES") {
            config.search_engines = Some(parse_engine_list(&val)?);
        }

        if let Ok(val) = env::var("MAX_CONTEXT_TOKENS") {
            config.max_context_tokens = val
                .parse()
                .context("MAX_CONTEXT_TOKENS must be a valid positive integer")?;
        }

        if let Ok(val) = env::var("SEARCH_TIMEOUT_SECS") {
            config.search_timeout_secs = val
                .parse()
                .context("SEARCH_TIMEOUT_SECS must be a valid positive integer")?;
        }

        if let Ok(val) = env::var("RUST_LOG") {
            config.log_level = val;
        }

        Ok(config)
    }

    /// Validate the configuration before a run starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_RESULTS_PER_QUERY..=MAX_RESULTS_PER_QUERY).contains(&self.max_results_per_query) {
            return Err(ConfigError::MaxResultsOutOfRange {
                got: self.max_results_per_query,
                min: MIN_RESULTS_PER_QUERY,
                max: MAX_RESULTS_PER_QUERY,
            });
        }

        if self.step_ceiling == 0 {
            return Err(ConfigError::ZeroStepCeiling);
        }

        if self.search_timeout_secs == 0 {
            return Err(ConfigError::ZeroSearchTimeout);
        }

        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::TemperatureOutOfRange(self.temperature));
        }

        if self.model.trim().is_empty() {
            return Err(ConfigError::EmptyModel);
        }

        if self.provider == LlmBackend::OpenAI && !self.openai_key_present {
            return Err(ConfigError::MissingModelCredential);
        }

        if self.run_config().engines().contains(&SearchEngine::Tavily) && self.tavily_api_key.is_none() {
            return Err(ConfigError::MissingSearchCredential);
        }

        Ok(())
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.search_timeout_secs)
    }

    /// Publish the settings rig's clients read from the process environment.
    ///
    /// Must run before the async runtime starts any worker threads.
    pub fn export_model_env(&self) {
        if self.provider == LlmBackend::Ollama {
            env::set_var("OLLAMA_API_BASE_URL", &self.ollama_host);
        }
    }

    /// Settings for a run issued today.
    pub fn run_config(&self) -> RunConfig {
        self.run_config_on(Local::now().date_naive())
    }

    pub fn run_config_on(&self, issued_on: NaiveDate) -> RunConfig {
        RunConfig {
            search_engines: self.search_engines.clone(),
            ..RunConfig::new(self.max_results_per_query, issued_on)
        }
    }
}

/// Parse a comma-separated engine list such as `tavily,duckduckgo`.
pub fn parse_engine_list(raw: &str) -> Result<Vec<SearchEngine>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::parse)
        .collect()
}
