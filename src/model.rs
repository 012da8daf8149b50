//! # Model Module
//!
//! The language-model side of a research run. The model plays two roles:
//!
//! - **Planner**: looks at the question and the evidence gathered so far and
//!   either proposes more search sub-queries or says it has enough.
//! - **Writer**: turns the gathered evidence into the raw structured answer
//!   that [`crate::synthesizer::ResultSynthesizer`] validates.
//!
//! [`ResearchModel`] is the seam; [`RigResearchModel`] implements it with the
//! Rig framework against OpenAI or a local Ollama server.

use async_trait::async_trait;
use rig::client::{CompletionClient, ProviderClient};
use rig::completion::Prompt;
use rig::providers::{ollama, openai};
use serde::Deserialize;
use tracing::debug;

use crate::config::{Config, LlmBackend, RunConfig};
use crate::error::{PlannerError, SynthesisError};
use crate::ledger::SubQuery;
use crate::search::{EvidenceItem, FetchFailure};

// =============================================================================
// PROMPTS
// =============================================================================
const PLANNER_PREAMBLE: &str = r#"
You are a helpful research assistant and expert in research.
When given a question, generate strong keywords to perform 3-5 web searches.

Each turn you are shown the searches already issued, any proposals that were
rejected as duplicates, and the evidence gathered so far. Decide what to do next:

- To search, reply with {"action": "search", "queries": ["keywords", ...]}
- When the evidence is enough to answer, reply with {"action": "finish"}

Never repeat a query that was already issued. Respond with ONLY the JSON object.
"#;

const WRITER_PREAMBLE: &str = r#"
You are a helpful research assistant and expert in research.
Combine the search results you are given into a comprehensive, well-structured
response to the question. Use only the provided evidence.

OUTPUT FORMAT (respond with ONLY valid JSON):
{
  "title": "A top level Markdown heading that covers the topic of the query and answer",
  "body": "A main section that provides answers for the query and web search",
  "bullets": "A set of bullet points, one per line, that summarize the answers for the query",
  "visited_urls": ["URLs of the search results that were used"]
}
"#;

// =============================================================================
// PLANNER TYPES
// =============================================================================
/// Everything the planner sees on one step.
#[derive(Debug, Clone)]
pub struct PlanningContext<'a> {
    pub question: &'a str,
    pub run: &'a RunConfig,
    pub issued: &'a [SubQuery],
    pub suppressed: &'a [String],
    pub evidence: &'a [EvidenceItem],
    pub failed: &'a [FetchFailure],
    pub remaining_proposals: usize,
}

/// What the planner decided on one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannerStep {
    /// Candidate sub-query texts, in the order they should be admitted
    Search(Vec<String>),
    /// Enough evidence has been gathered
    Finish,
}

/// Writer input: the question plus all evidence in admission order.
#[derive(Debug, Clone)]
pub struct SynthesisRequest<'a> {
    pub question: &'a str,
    pub issued_on: chrono::NaiveDate,
    pub evidence: &'a [EvidenceItem],
}

/// The planning/synthesis service.
#[async_trait]
pub trait ResearchModel: Send + Sync {
    /// Decide the next planner step.
    async fn plan(&self, context: &PlanningContext<'_>) -> Result<PlannerStep, PlannerError>;

    /// Produce the raw structured answer. The returned JSON is validated by
    /// the synthesizer, not here.
    async fn write(&self, request: &SynthesisRequest<'_>) -> Result<serde_json::Value, SynthesisError>;
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum PlannerReply {
    Search {
        #[serde(default)]
        queries: Vec<String>,
    },
    Finish,
}

// =============================================================================
// PROMPT RENDERING
// =============================================================================
pub fn planner_prompt(context: &PlanningContext<'_>) -> String {
    let mut prompt = format!(
        "Today's date: {}\nResults per search: {}\nProposals left: {}\n\nQUESTION:\n{}\n\n",
        context.run.issued_on.format("%Y-%m-%d"),
        context.run.max_results_per_query,
        context.remaining_proposals,
        context.question
    );

    if context.issued.is_empty() {
        prompt.push_str("No searches issued yet.\n");
    } else {
        prompt.push_str("SEARCHES ISSUED:\n");
        for query in context.issued {
            prompt.push_str(&format!("{}. {}\n", query.sequence_number, query.text));
        }
    }

    if !context.suppressed.is_empty() {
        prompt.push_str("\nREJECTED AS DUPLICATES (propose something different):\n");
        for text in context.suppressed {
            prompt.push_str(&format!("- {text}\n"));
        }
    }

    if !context.failed.is_empty() {
        prompt.push_str("\nSEARCHES THAT FAILED:\n");
        for failure in context.failed {
            prompt.push_str(&format!("- {} ({})\n", failure.query.text, failure.error));
        }
    }

    if !context.evidence.is_empty() {
        prompt.push_str("\nEVIDENCE SO FAR:\n\n");
        for item in context.evidence {
            prompt.push_str(&item.to_markdown());
        }
    }

    prompt
}

pub fn writer_prompt(request: &SynthesisRequest<'_>) -> String {
    let mut prompt = format!(
        "Today's date: {}\n\nQUESTION:\n{}\n\nSEARCH RESULTS:\n\n",
        request.issued_on.format("%Y-%m-%d"),
        request.question
    );
    for item in request.evidence {
        prompt.push_str(&item.to_markdown());
    }
    prompt
}

/// Pull the JSON object out of a model reply that may wrap it in a code fence
/// or surrounding prose.
pub fn extract_json(reply: &str) -> &str {
    let fenced = if let Some(rest) = reply.split("```json").nth(1) {
        rest.split("```").next()
    } else {
        reply.split("```").nth(1)
    };
    let candidate = fenced.unwrap_or(reply).trim();

    match (candidate.find('{'), candidate.rfind('}')) {
        (Some(start), Some(end)) if start < end => &candidate[start..=end],
        _ => candidate,
    }
}

pub fn parse_planner_reply(reply: &str) -> Result<PlannerStep, PlannerError> {
    let parsed: PlannerReply = serde_json::from_str(extract_json(reply))
        .map_err(|e| PlannerError::InvalidOutput(e.to_string()))?;

    Ok(match parsed {
        PlannerReply::Search { queries } => PlannerStep::Search(
            queries
                .into_iter()
                .filter(|query| !query.trim().is_empty())
                .collect(),
        ),
        PlannerReply::Finish => PlannerStep::Finish,
    })
}

// =============================================================================
// RIG IMPLEMENTATION
// =============================================================================
enum RigClient {
    OpenAI(openai::Client),
    Ollama(ollama::Client),
}

/// [`ResearchModel`] backed by a Rig provider client.
pub struct RigResearchModel {
    client: RigClient,
    model: String,
    temperature: f64,
}

impl RigResearchModel {
    /// Build the client for the configured backend.
    ///
    /// Both clients read their settings from the environment: OPENAI_API_KEY
    /// (checked by config validation) or OLLAMA_API_BASE_URL (published by
    /// [`Config::export_model_env`] before the runtime starts).
    pub fn new(config: &Config) -> Self {
        let client = match config.provider {
            LlmBackend::OpenAI => RigClient::OpenAI(openai::Client::from_env()),
            LlmBackend::Ollama => RigClient::Ollama(ollama::Client::from_env()),
        };

        Self {
            client,
            model: config.model.clone(),
            temperature: config.temperature,
        }
    }

    async fn complete(&self, preamble: &str, prompt: &str) -> Result<String, String> {
        debug!(model = %self.model, prompt_len = prompt.len(), "Calling language model");

        let reply = match &self.client {
            RigClient::OpenAI(client) => {
                let agent = client
                    .agent(&self.model)
                    .preamble(preamble)
                    .temperature(self.temperature)
                    .build();
                agent.prompt(prompt).await
            }
            RigClient::Ollama(client) => {
                let agent = client
                    .agent(&self.model)
                    .preamble(preamble)
                    .temperature(self.temperature)
                    .build();
                agent.prompt(prompt).await
            }
        };

        reply.map_err(|e| e.to_string())
    }
}

#[async_trait]
impl ResearchModel for RigResearchModel {
    async fn plan(&self, context: &PlanningContext<'_>) -> Result<PlannerStep, PlannerError> {
        let reply = self
            .complete(PLANNER_PREAMBLE, &planner_prompt(context))
            .await
            .map_err(PlannerError::Call)?;

        parse_planner_reply(&reply)
    }

    async fn write(&self, request: &SynthesisRequest<'_>) -> Result<serde_json::Value, SynthesisError> {
        let reply = self
            .complete(WRITER_PREAMBLE, &writer_prompt(request))
            .await
            .map_err(SynthesisError::Call)?;

        serde_json::from_str(extract_json(&reply)).map_err(|e| SynthesisError::Malformed(e.to_string()))
    }
}

// =============================================================================
// UNIT TESTS
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::SearchHit;
    use chrono::NaiveDate;

    fn run() -> RunConfig {
        RunConfig::new(3, NaiveDate::from_ymd_opt(2024, 5, 20).unwrap())
    }

    #[test]
    fn test_parse_planner_search() {
        let step = parse_planner_reply(
            r#"{"action": "search", "queries": ["quantum annealing basics", "  ", "d-wave"]}"#,
        )
        .unwrap();

        assert_eq!(
            step,
            PlannerStep::Search(vec!["quantum annealing basics".to_string(), "d-wave".to_string()])
        );
    }

    #[test]
    fn test_parse_planner_finish_in_code_fence() {
        let reply = "Here is my decision:\n```json\n{\"action\": \"finish\"}\n```";
        assert_eq!(parse_planner_reply(reply).unwrap(), PlannerStep::Finish);
    }

    #[test]
    fn test_parse_planner_rejects_unknown_action() {
        let result = parse_planner_reply(r#"{"action": "dance"}"#);
        assert!(matches!(result, Err(PlannerError::InvalidOutput(_))));

        let result = parse_planner_reply("I think we should search more.");
        assert!(matches!(result, Err(PlannerError::InvalidOutput(_))));
    }

    #[test]
    fn test_extract_json_from_prose() {
        assert_eq!(extract_json("Sure! {\"a\": 1} Hope that helps."), "{\"a\": 1}");
        assert_eq!(extract_json("```\n{\"b\": 2}\n```"), "{\"b\": 2}");
    }

    #[test]
    fn test_planner_prompt_mentions_state() {
        let run = run();
        let issued = vec![SubQuery {
            text: "quantum annealing basics".to_string(),
            sequence_number: 1,
        }];
        let suppressed = vec!["quantum annealing basics".to_string()];
        let evidence = vec![EvidenceItem::new(
            issued[0].clone(),
            vec![SearchHit {
                title: "Wiki".to_string(),
                url: "https://en.wikipedia.org/wiki/Quantum_annealing".to_string(),
                snippet: "An optimization process".to_string(),
            }],
        )];

        let prompt = planner_prompt(&PlanningContext {
            question: "What is quantum annealing?",
            run: &run,
            issued: &issued,
            suppressed: &suppressed,
            evidence: &evidence,
            failed: &[],
            remaining_proposals: 9,
        });

        assert!(prompt.contains("Today's date: 2024-05-20"));
        assert!(prompt.contains("Proposals left: 9"));
        assert!(prompt.contains("1. quantum annealing basics"));
        assert!(prompt.contains("REJECTED AS DUPLICATES"));
        assert!(prompt.contains("https://en.wikipedia.org/wiki/Quantum_annealing"));
        assert!(!prompt.contains("SEARCHES THAT FAILED"));
    }

    #[test]
    fn test_preambles_describe_protocol() {
        assert!(PLANNER_PREAMBLE.contains("3-5"));
        assert!(PLANNER_PREAMBLE.contains("\"action\": \"finish\""));
        assert!(WRITER_PREAMBLE.contains("visited_urls"));
    }
}
