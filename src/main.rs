//! # Web Researcher
//!
//! A web research agent built with the Rig framework.
//!
//! Given a question, a language model plans search sub-queries, each unique
//! sub-query is run against a web search engine, and the gathered evidence is
//! synthesized into one answer with a deduplicated list of cited sources.
//!
//! ## Quick Start
//! ```bash
//! export TAVILY_API_KEY=tvly-...
//! export OPENAI_API_KEY=sk-...
//! cargo run -- "What is quantum annealing?"
//! ```

// =============================================================================
// MODULE DECLARATIONS
// =============================================================================

/// Configuration management
mod config;

/// Error types for a research run
mod error;

/// Per-run sub-query deduplication
mod ledger;

/// Web search engines and the evidence fetcher
mod search;

/// Planner and writer model
mod model;

/// Final answer assembly
mod synthesizer;

/// The research state machine
mod orchestrator;

/// Markdown and JSON output
mod report;

// =============================================================================
// IMPORTS
// =============================================================================
use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::{parse_engine_list, Config};
use crate::error::ResearchError;
use crate::model::RigResearchModel;
use crate::orchestrator::ResearchOrchestrator;
use crate::search::{DuckDuckGoClient, TavilyClient, WebEvidenceFetcher};

// =============================================================================
// CLI ARGUMENTS
// =============================================================================
#[derive(Parser, Debug)]
#[command(
    name = "web-researcher",
    version = "0.1.0",
    about = "Researches a question on the web and writes a cited answer",
    long_about = r#"
Web Researcher - plans searches, gathers evidence, and writes a cited answer.

It will:
  1. Ask the model for search sub-queries, skipping any already issued
  2. Run each sub-query against the configured search engines
  3. Synthesize the evidence into a report with its sources

PREREQUISITES:
  TAVILY_API_KEY   for the tavily engine (the default)
  OPENAI_API_KEY   for the openai provider (the default)

EXAMPLES:
  # Basic research question
  web-researcher "What is quantum annealing?"

  # Search DuckDuckGo only, with a local model
  LLM_PROVIDER=ollama web-researcher --engines duckduckgo --model llama3.2 "Rust async runtimes"

  # Machine-readable output
  web-researcher --json "Latest developments in fusion energy"
"#
)]
struct Args {
    /// The research question to investigate
    #[arg(value_name = "QUESTION")]
    question: String,

    /// Model to plan and write with (overrides RESEARCH_MODEL)
    #[arg(short = 'm', long = "model", env = "RESEARCH_MODEL")]
    model: Option<String>,

    /// Search results requested per sub-query (1-5)
    #[arg(short = 'n', long = "max-results")]
    max_results: Option<usize>,

    /// Comma-separated search engines, consulted in order
    #[arg(short = 'e', long = "engines", value_name = "tavily,duckduckgo")]
    engines: Option<String>,

    /// Maximum sub-query proposals before the run stops searching
    #[arg(long = "step-ceiling")]
    step_ceiling: Option<usize>,

    /// Print the result as JSON instead of Markdown
    #[arg(long = "json", default_value = "false")]
    json: bool,

    /// Fetch one sub-query at a time
    #[arg(long = "sequential", default_value = "false")]
    sequential: bool,

    /// Verbose output (debug logging)
    #[arg(short = 'v', long = "verbose", default_value = "false")]
    verbose: bool,
}

impl Args {
    /// Apply command-line overrides on top of the loaded configuration.
    fn apply(&self, config: &mut Config) -> Result<()> {
        if let Some(model) = &self.model {
            config.model = model.clone();
        }
        if let Some(max_results) = self.max_results {
            config.max_results_per_query = max_results;
        }
        if let Some(engines) = &self.engines {
            config.search_engines = Some(parse_engine_list(engines)?);
        }
        if let Some(step_ceiling) = self.step_ceiling {
            config.step_ceiling = step_ceiling;
        }
        if self.sequential {
            config.concurrent_fetches = false;
        }
        Ok(())
    }
}

// =============================================================================
// MAIN FUNCTION
// =============================================================================
/// All environment writes (`.env` loading, rig's settings) happen here, before
/// the Tokio runtime exists.
fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let mut config = Config::from_env()?;
    args.apply(&mut config)?;

    init_logging(&config.log_level, args.verbose)?;

    config.validate()?;
    config.export_model_env();

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(research(args, config))
}

async fn research(args: Args, config: Config) -> Result<ExitCode> {
    info!(
        provider = %config.provider,
        model = %config.model,
        engines = ?config.run_config().engines(),
        "Configuration loaded"
    );

    let fetcher = WebEvidenceFetcher::new(
        config
            .tavily_api_key
            .as_deref()
            .map(|key| TavilyClient::new(key).with_timeout(config.search_timeout())),
        DuckDuckGoClient::new().with_timeout(config.search_timeout()),
        config.max_context_tokens,
    );
    let model = RigResearchModel::new(&config);

    let orchestrator = ResearchOrchestrator::new(Arc::new(model), Arc::new(fetcher))
        .with_step_ceiling(config.step_ceiling)
        .with_concurrent_fetches(config.concurrent_fetches);

    // Ctrl-C cancels the run at its next suspension point
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling research run");
            on_interrupt.cancel();
        }
    });

    let run = orchestrator
        .run_with_cancel(&args.question, config.run_config(), &cancel)
        .await;

    debug!(state = %run.state(), transitions = ?run.transitions, "Run finished");
    eprint!("{}", report::render_query_log(&run));

    if let Some(result) = run.result() {
        if args.json {
            println!("{}", report::render_json(result)?);
        } else {
            println!("{}", report::render_markdown(result));
        }
        info!("Research completed successfully");
        return Ok(ExitCode::SUCCESS);
    }

    if let Some(e) = run.error() {
        error!(question = %run.question, error = %e, "Research failed");
        eprintln!("\nResearch failed: {e}");

        if let ResearchError::NoEvidence { .. } = e {
            eprintln!("\nTip: check your search API key, or try --engines duckduckgo");
        }
    }

    Ok(ExitCode::FAILURE)
}

// =============================================================================
// LOGGING INITIALIZATION
// =============================================================================
/// Install the global tracing subscriber. `--verbose` forces debug output;
/// otherwise `log_level` is read as an `EnvFilter` directive.
fn init_logging(log_level: &str, verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // Logs go to stderr so the report on stdout stays clean
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to set logging subscriber: {}", e))?;

    Ok(())
}
