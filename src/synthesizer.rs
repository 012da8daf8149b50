//! # Synthesizer Module
//!
//! Merges every piece of evidence gathered in a run into one validated
//! [`ResearchResult`].
//!
//! The writer model supplies title, body and bullets. The citation list is
//! never taken from the model: it is rebuilt from the evidence itself so that
//! only URLs that were actually visited are cited.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::SynthesisError;
use crate::model::{ResearchModel, SynthesisRequest};
use crate::search::EvidenceItem;

/// Bullet lines built from evidence when the model gives none.
const FALLBACK_BULLETS: usize = 5;

/// The final structured answer of a research run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchResult {
    /// Markdown heading covering the topic (never empty)
    pub title: String,

    /// Main prose answer
    pub body: String,

    /// Newline-delimited summary points
    pub bullets: String,

    /// Unique source URLs in first-seen order
    pub visited_urls: Vec<String>,
}

impl ResearchResult {
    /// Non-blank bullet lines.
    pub fn bullet_lines(&self) -> impl Iterator<Item = &str> {
        self.bullets.lines().map(str::trim).filter(|line| !line.is_empty())
    }
}

/// The writer's raw output before validation. Any `visited_urls` the model
/// sends is ignored.
#[derive(Debug, Deserialize)]
struct ResearchDraft {
    title: Option<String>,
    body: Option<String>,
    #[serde(default)]
    bullets: Option<Bullets>,
}

/// Models answer with either one newline-delimited string or a list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Bullets {
    Text(String),
    List(Vec<String>),
}

impl Bullets {
    fn into_text(self) -> String {
        match self {
            Bullets::Text(text) => text,
            Bullets::List(items) => items
                .iter()
                .map(|item| item.trim())
                .filter(|item| has_content(item))
                .map(|item| {
                    if item.starts_with(['-', '*']) {
                        item.to_string()
                    } else {
                        format!("- {item}")
                    }
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// False for blank lines and bare list markers such as `-` or `* `.
fn has_content(line: &str) -> bool {
    !line.trim().trim_start_matches(['-', '*']).trim().is_empty()
}

/// Union of all evidence URLs, deduplicated in first-seen order.
///
/// Evidence is walked in sub-query sequence order regardless of the order it
/// is passed in.
pub fn collect_visited_urls(evidence: &[EvidenceItem]) -> Vec<String> {
    let mut ordered: Vec<&EvidenceItem> = evidence.iter().collect();
    ordered.sort_by_key(|item| item.source_sub_query.sequence_number);

    let mut seen = HashSet::new();
    ordered
        .into_iter()
        .flat_map(|item| item.urls())
        .filter(|url| seen.insert(*url))
        .map(str::to_string)
        .collect()
}

/// Best-effort summary lines taken from the evidence snippets.
fn fallback_bullets(evidence: &[EvidenceItem]) -> String {
    let lines: Vec<String> = evidence
        .iter()
        .flat_map(|item| item.hits.iter())
        .filter(|hit| !hit.snippet.trim().is_empty())
        .take(FALLBACK_BULLETS)
        .map(|hit| format!("- {} ({})", hit.snippet.trim(), hit.url))
        .collect();

    if lines.is_empty() {
        let queries: Vec<&str> = evidence
            .iter()
            .map(|item| item.source_sub_query.text.as_str())
            .collect();
        return format!("- Searched for: {}", queries.join("; "));
    }

    lines.join("\n")
}

/// Validate a writer draft against the result schema.
pub fn validate_draft(raw: serde_json::Value, evidence: &[EvidenceItem]) -> Result<ResearchResult, SynthesisError> {
    let draft: ResearchDraft =
        serde_json::from_value(raw).map_err(|e| SynthesisError::Malformed(e.to_string()))?;

    // Heading markers are added at render time
    let title = draft
        .title
        .map(|title| title.trim().trim_start_matches('#').trim().to_string())
        .filter(|title| !title.is_empty())
        .ok_or(SynthesisError::MissingField("title"))?;

    let body = draft.body.ok_or(SynthesisError::MissingField("body"))?;

    let bullets = match draft.bullets.map(Bullets::into_text) {
        Some(text) if text.lines().any(has_content) => text,
        _ => {
            warn!("Writer returned no bullets, summarizing evidence instead");
            fallback_bullets(evidence)
        }
    };

    Ok(ResearchResult {
        title,
        body,
        bullets,
        visited_urls: collect_visited_urls(evidence),
    })
}

/// Builds the final result of a run with one writer call.
#[derive(Clone)]
pub struct ResultSynthesizer {
    model: Arc<dyn ResearchModel>,
}

impl ResultSynthesizer {
    pub fn new(model: Arc<dyn ResearchModel>) -> Self {
        Self { model }
    }

    /// Synthesize the answer to `question` from `evidence`.
    ///
    /// Fails without calling the model when there is no evidence. A draft that
    /// does not fit the schema is an error; there is no second attempt.
    pub async fn synthesize(
        &self,
        question: &str,
        issued_on: chrono::NaiveDate,
        evidence: &[EvidenceItem],
    ) -> Result<ResearchResult, SynthesisError> {
        if evidence.is_empty() {
            return Err(SynthesisError::NoEvidence);
        }

        let raw = self
            .model
            .write(&SynthesisRequest {
                question,
                issued_on,
                evidence,
            })
            .await?;

        let result = validate_draft(raw, evidence)?;

        info!(
            title = %result.title,
            sources = result.visited_urls.len(),
            "Synthesis complete"
        );

        Ok(result)
    }
}
