//! # Ledger Module
//!
//! The per-run record of issued search sub-queries.
//!
//! The ledger is the gate every candidate query passes through before any
//! evidence is fetched for it. A text that was already admitted in this run is
//! silently suppressed, so identical sub-queries never cost a second search.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// A search query the ledger admitted, with its position in the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubQuery {
    /// The exact query text sent to the search provider
    pub text: String,

    /// 1-based admission order within the run
    pub sequence_number: usize,
}

/// Outcome of presenting a candidate to [`QueryLedger::admit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// First time this text was seen in the run
    Accepted(SubQuery),

    /// Same text was admitted earlier; nothing changed
    Suppressed,
}

/// Ordered, duplicate-free record of the sub-queries issued during one run.
///
/// Matching is exact: `"Rust"` and `"rust "` are different queries.
#[derive(Debug, Default)]
pub struct QueryLedger {
    admitted: Vec<String>,
}

impl QueryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit `text` unless an equal text was already admitted this run.
    pub fn admit(&mut self, text: &str) -> Admission {
        if self.contains(text) {
            debug!(query = %text, "Suppressed duplicate sub-query");
            return Admission::Suppressed;
        }

        self.admitted.push(text.to_string());

        Admission::Accepted(SubQuery {
            text: text.to_string(),
            sequence_number: self.admitted.len(),
        })
    }

    /// Forget everything; the next admission gets sequence number 1.
    pub fn reset(&mut self) {
        self.admitted.clear();
    }

    pub fn contains(&self, text: &str) -> bool {
        self.admitted.iter().any(|issued| issued == text)
    }
}
