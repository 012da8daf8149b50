//! Terminal presentation of a finished run.

use crate::orchestrator::RunReport;
use crate::synthesizer::ResearchResult;

/// Render a result as a Markdown document.
pub fn render_markdown(result: &ResearchResult) -> String {
    let title = result.title.trim_start_matches('#').trim();
    let mut out = format!("# {title}\n\n## Detailed Information\n\n{}\n", result.body.trim());

    out.push_str("\n## Key Points\n\n");
    for line in result.bullet_lines() {
        if line.starts_with(['-', '*']) {
            out.push_str(line);
        } else {
            out.push_str("- ");
            out.push_str(line);
        }
        out.push('\n');
    }

    out.push_str("\n## Sources\n\n");
    if result.visited_urls.is_empty() {
        out.push_str("_No sources were returned._\n");
    }
    for (i, url) in result.visited_urls.iter().enumerate() {
        out.push_str(&format!("{}. [{url}]({url})\n", i + 1));
    }

    out
}

pub fn render_json(result: &ResearchResult) -> serde_json::Result<String> {
    serde_json::to_string_pretty(result)
}

/// The issued, suppressed and failed sub-queries of a run, one per line.
pub fn render_query_log(report: &RunReport) -> String {
    let mut out = String::new();

    for query in &report.queries {
        out.push_str(&format!("Search Query {}: {}\n", query.sequence_number, query.text));
    }
    for text in &report.suppressed {
        out.push_str(&format!("Suppressed duplicate: {text}\n"));
    }
    for failure in &report.failures {
        out.push_str(&format!(
            "Search Query {} failed: {}\n",
            failure.query.sequence_number, failure.error
        ));
    }

    out
}
