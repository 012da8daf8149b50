//! # Orchestrator Module
//!
//! The research loop. One call to [`ResearchOrchestrator::run_with_cancel`] takes a
//! question through
//!
//! ```text
//! Idle → GeneratingQueries ⇄ AwaitingEvidence(n) → Synthesizing → Done
//!                      └──────────── any step ──────────→ Errored
//! ```
//!
//! The planner proposes sub-queries, the run's own [`QueryLedger`] admits or
//! suppresses each one, admitted queries are fetched, and once the planner is
//! satisfied (or the proposal ceiling is hit) the evidence is synthesized.
//!
//! All run-scoped state lives in a private `ResearchRun` created per call, so
//! concurrent runs on one orchestrator never share a ledger.

use futures::future::join_all;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RunConfig;
use crate::error::{ConfigError, ResearchError};
use crate::ledger::{Admission, QueryLedger, SubQuery};
use crate::model::{PlannerStep, PlanningContext, ResearchModel};
use crate::search::{EvidenceFetcher, EvidenceItem, FetchFailure, ProviderError};
use crate::synthesizer::{ResearchResult, ResultSynthesizer};

/// Default number of sub-query proposals before planning stops.
pub const DEFAULT_STEP_CEILING: usize = 10;

// =============================================================================
// RUN STATE
// =============================================================================
/// Where a run is in its lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum RunState {
    Idle,
    GeneratingQueries,
    /// Waiting on this many searches
    AwaitingEvidence(usize),
    Synthesizing,
    Done(ResearchResult),
    Errored(ResearchError),
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Idle => f.write_str("Idle"),
            RunState::GeneratingQueries => f.write_str("GeneratingQueries"),
            RunState::AwaitingEvidence(n) => write!(f, "AwaitingEvidence({n})"),
            RunState::Synthesizing => f.write_str("Synthesizing"),
            RunState::Done(_) => f.write_str("Done"),
            RunState::Errored(_) => f.write_str("Errored"),
        }
    }
}

// =============================================================================
// RUN REPORT
// =============================================================================
/// Everything a finished run produced, for presentation and tracing.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub question: String,

    /// The terminal outcome: `Done` carries the result, `Errored` the cause
    pub outcome: Result<ResearchResult, ResearchError>,

    /// Admitted sub-queries in admission order
    pub queries: Vec<SubQuery>,

    /// Proposals rejected as duplicates, in the order they were proposed
    pub suppressed: Vec<String>,

    /// Sub-queries whose search failed
    pub failures: Vec<FetchFailure>,

    /// Every state the run passed through, e.g. `AwaitingEvidence(2)`
    pub transitions: Vec<String>,
}

impl RunReport {
    /// The terminal state of the run.
    pub fn state(&self) -> RunState {
        match &self.outcome {
            Ok(result) => RunState::Done(result.clone()),
            Err(e) => RunState::Errored(e.clone()),
        }
    }

    pub fn result(&self) -> Option<&ResearchResult> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&ResearchError> {
        self.outcome.as_ref().err()
    }
}

// =============================================================================
// RUN-SCOPED STATE
// =============================================================================
struct ResearchRun {
    question: String,
    config: RunConfig,
    ledger: QueryLedger,
    state: RunState,
    transitions: Vec<String>,
    queries: Vec<SubQuery>,
    suppressed: Vec<String>,
    evidence: Vec<EvidenceItem>,
    failures: Vec<FetchFailure>,
    proposals: usize,
}

impl ResearchRun {
    fn new(question: &str, config: RunConfig) -> Self {
        Self {
            question: question.to_string(),
            config,
            ledger: QueryLedger::new(),
            state: RunState::Idle,
            transitions: vec![RunState::Idle.to_string()],
            queries: Vec::new(),
            suppressed: Vec::new(),
            evidence: Vec::new(),
            failures: Vec::new(),
            proposals: 0,
        }
    }

    fn transition(&mut self, next: RunState) {
        debug!(from = %self.state, to = %next, "Run state transition");
        self.transitions.push(next.to_string());
        self.state = next;
    }

    /// Idle → GeneratingQueries. The only place the ledger is reset.
    fn start(&mut self) {
        self.ledger.reset();
        self.transition(RunState::GeneratingQueries);
    }

    fn planning_context(&self, ceiling: usize) -> PlanningContext<'_> {
        PlanningContext {
            question: &self.question,
            run: &self.config,
            issued: &self.queries,
            suppressed: &self.suppressed,
            evidence: &self.evidence,
            failed: &self.failures,
            remaining_proposals: ceiling.saturating_sub(self.proposals),
        }
    }

    fn no_evidence(&self) -> ResearchError {
        ResearchError::NoEvidence {
            attempted: self.queries.len(),
            last_failure: self.failures.last().map(|f| f.error.clone()),
        }
    }

    fn finish(mut self, outcome: Result<ResearchResult, ResearchError>) -> RunReport {
        let terminal = match &outcome {
            Ok(_) => "Done",
            Err(e) => {
                error!(question = %self.question, error = %e, "Research run failed");
                "Errored"
            }
        };
        debug!(from = %self.state, to = terminal, "Run state transition");
        self.transitions.push(terminal.to_string());

        RunReport {
            question: self.question,
            outcome,
            queries: self.queries,
            suppressed: self.suppressed,
            failures: self.failures,
            transitions: self.transitions,
        }
    }
}

/// Await `future` unless the run is cancelled first.
async fn cancellable<F: Future>(cancel: &CancellationToken, future: F) -> Result<F::Output, ResearchError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ResearchError::Cancelled),
        output = future => Ok(output),
    }
}

// =============================================================================
// ORCHESTRATOR
// =============================================================================
/// Drives research runs. Holds only shared, stateless collaborators.
#[derive(Clone)]
pub struct ResearchOrchestrator {
    model: Arc<dyn ResearchModel>,
    fetcher: Arc<dyn EvidenceFetcher>,
    synthesizer: ResultSynthesizer,
    step_ceiling: usize,
    concurrent_fetches: bool,
}

impl ResearchOrchestrator {
    pub fn new(model: Arc<dyn ResearchModel>, fetcher: Arc<dyn EvidenceFetcher>) -> Self {
        Self {
            synthesizer: ResultSynthesizer::new(model.clone()),
            model,
            fetcher,
            step_ceiling: DEFAULT_STEP_CEILING,
            concurrent_fetches: true,
        }
    }

    /// Maximum sub-query proposals per run (at least 1).
    pub fn with_step_ceiling(mut self, step_ceiling: usize) -> Self {
        self.step_ceiling = step_ceiling.max(1);
        self
    }

    /// Whether queries admitted in one planner step are fetched concurrently.
    pub fn with_concurrent_fetches(mut self, concurrent: bool) -> Self {
        self.concurrent_fetches = concurrent;
        self
    }

    /// Run one research session, stopping early if `cancel` fires.
    ///
    /// A cancelled run ends `Errored(Cancelled)` and never carries a result.
    pub async fn run_with_cancel(&self, question: &str, config: RunConfig, cancel: &CancellationToken) -> RunReport {
        let mut run = ResearchRun::new(question, config);

        if question.trim().is_empty() {
            return run.finish(Err(ConfigError::EmptyQuestion.into()));
        }

        info!(question = %question, ceiling = self.step_ceiling, "Starting research run");
        run.start();

        let outcome = self.drive(&mut run, cancel).await;
        run.finish(outcome)
    }

    async fn drive(&self, run: &mut ResearchRun, cancel: &CancellationToken) -> Result<ResearchResult, ResearchError> {
        loop {
            if cancel.is_cancelled() {
                return Err(ResearchError::Cancelled);
            }

            if run.proposals >= self.step_ceiling {
                warn!(ceiling = self.step_ceiling, "Proposal ceiling reached, stopping search");
                break;
            }

            let step = {
                let context = run.planning_context(self.step_ceiling);
                cancellable(cancel, self.model.plan(&context)).await??
            };

            let candidates = match step {
                PlannerStep::Finish => {
                    info!(searches = run.queries.len(), "Planner has enough evidence");
                    break;
                }
                PlannerStep::Search(candidates) => candidates,
            };

            if candidates.is_empty() {
                // An empty proposal still uses a step so the loop terminates
                warn!("Planner proposed no queries");
                run.proposals += 1;
                continue;
            }

            let admitted = self.admit_candidates(run, candidates);
            if admitted.is_empty() {
                continue;
            }

            run.transition(RunState::AwaitingEvidence(admitted.len()));
            let outcomes = cancellable(cancel, self.fetch_all(&admitted, &run.config)).await?;

            for (query, outcome) in admitted.into_iter().zip(outcomes) {
                match outcome {
                    Ok(item) => run.evidence.push(item),
                    Err(error) => {
                        warn!(sequence = query.sequence_number, query = %query.text, error = %error, "Search failed");
                        run.failures.push(FetchFailure { query, error });
                    }
                }
            }

            run.transition(RunState::GeneratingQueries);
        }

        if run.evidence.is_empty() {
            return Err(run.no_evidence());
        }

        run.transition(RunState::Synthesizing);
        let result = cancellable(
            cancel,
            self.synthesizer
                .synthesize(&run.question, run.config.issued_on, &run.evidence),
        )
        .await??;

        info!(
            searches = run.queries.len(),
            failed = run.failures.len(),
            sources = result.visited_urls.len(),
            "Research run complete"
        );

        Ok(result)
    }

    /// Present candidates to the ledger in order, synchronously, before any
    /// fetch is dispatched. Each candidate uses one proposal.
    fn admit_candidates(&self, run: &mut ResearchRun, candidates: Vec<String>) -> Vec<SubQuery> {
        let mut admitted = Vec::new();

        for candidate in candidates {
            if run.proposals >= self.step_ceiling {
                warn!(dropped = %candidate, "Proposal ceiling reached mid-step");
                break;
            }
            run.proposals += 1;

            match run.ledger.admit(&candidate) {
                Admission::Accepted(query) => {
                    info!("Search Query {}: {}", query.sequence_number, query.text);
                    run.queries.push(query.clone());
                    admitted.push(query);
                }
                Admission::Suppressed => run.suppressed.push(candidate),
            }
        }

        admitted
    }

    /// Fetch every admitted query; outcomes come back in admission order.
    async fn fetch_all(&self, queries: &[SubQuery], config: &RunConfig) -> Vec<Result<EvidenceItem, ProviderError>> {
        if self.concurrent_fetches {
            join_all(queries.iter().map(|query| self.fetcher.fetch(query, config))).await
        } else {
            let mut outcomes = Vec::with_capacity(queries.len());
            for query in queries {
                outcomes.push(self.fetcher.fetch(query, config).await);
            }
            outcomes
        }
    }
}
