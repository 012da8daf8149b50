//! Error types for a research run.
//!
//! Search failures live next to the engines in [`crate::search::ProviderError`];
//! everything that can end a run is collected here.

use thiserror::Error;

use crate::search::ProviderError;

/// Invalid settings, rejected before a run starts.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("TAVILY_API_KEY is required when the tavily search engine is enabled")]
    MissingSearchCredential,

    #[error("OPENAI_API_KEY is required for the openai provider")]
    MissingModelCredential,

    #[error("Results per search must be between {min} and {max}, got: {got}")]
    MaxResultsOutOfRange { got: usize, min: usize, max: usize },

    #[error("Step ceiling must be at least 1")]
    ZeroStepCeiling,

    #[error("Search timeout must be at least 1 second")]
    ZeroSearchTimeout,

    #[error("Temperature must be between 0.0 and 2.0, got: {0}")]
    TemperatureOutOfRange(f64),

    #[error("Model name cannot be empty")]
    EmptyModel,

    #[error("Unknown search engine: {0}")]
    UnknownSearchEngine(String),

    #[error("Unknown LLM provider: {0}")]
    UnknownProvider(String),

    #[error("Research question cannot be empty")]
    EmptyQuestion,
}

/// The planning service failed or answered with something unusable.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlannerError {
    #[error("Planner call failed: {0}")]
    Call(String),

    #[error("Planner returned invalid output: {0}")]
    InvalidOutput(String),
}

/// The final answer could not be produced in the required shape.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SynthesisError {
    #[error("Cannot synthesize a result without evidence")]
    NoEvidence,

    #[error("Synthesis call failed: {0}")]
    Call(String),

    #[error("Synthesized result is missing required field `{0}`")]
    MissingField(&'static str),

    #[error("Synthesized result is malformed: {0}")]
    Malformed(String),
}

/// Why a run ended in the `Errored` state.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResearchError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Planner error: {0}")]
    Planner(#[from] PlannerError),

    #[error("Synthesis error: {0}")]
    Synthesis(#[from] SynthesisError),

    /// Every admitted sub-query failed (or none was admitted).
    #[error("No evidence gathered from {attempted} search(es){}", last_failure_suffix(.last_failure))]
    NoEvidence {
        attempted: usize,
        last_failure: Option<ProviderError>,
    },

    #[error("Research run was cancelled")]
    Cancelled,
}

fn last_failure_suffix(failure: &Option<ProviderError>) -> String {
    failure
        .as_ref()
        .map(|e| format!("; last failure: {e}"))
        .unwrap_or_default()
}
