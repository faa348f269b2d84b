//! Parser for the model's XML-ish response format
//!
//! The summarization prompts ask the model to emit `<observation>` blocks
//! (and a single `<summary>` block for end-of-turn requests) with simple
//! named child tags. Real model output is messy - prose around the blocks,
//! missing optional tags, stray whitespace - so extraction is regex-based
//! and tolerant: anything that does not parse is simply skipped. Both entry
//! points are pure functions; producing zero results is a valid outcome,
//! never an error.

use crate::memory::{Observation, SessionSummary};
use regex::Regex;

/// Observation kinds the pipeline accepts. Unknown kinds are coerced to
/// "discovery" rather than dropped - a mislabeled observation is still
/// worth keeping.
pub const OBSERVATION_KINDS: &[&str] = &["discovery", "change", "decision", "problem", "fix"];

/// Extract observations from a model response.
///
/// `content_session_id` is only used for trace context; the parse itself is
/// position-independent and returns observations in document order.
pub fn parse_observations(text: &str, content_session_id: &str) -> Vec<Observation> {
    let block_re = block_regex("observation");
    let mut observations = Vec::new();

    for block in block_re.captures_iter(text) {
        let body = &block[1];

        // A block without a title carries nothing worth filing
        let Some(title) = tag_text(body, "title") else {
            tracing::debug!(
                content_session_id,
                "Skipping observation block without <title>"
            );
            continue;
        };

        let kind = tag_text(body, "type")
            .map(|t| t.to_lowercase())
            .filter(|t| OBSERVATION_KINDS.contains(&t.as_str()))
            .unwrap_or_else(|| "discovery".to_string());

        observations.push(Observation {
            kind,
            title,
            subtitle: tag_text(body, "subtitle"),
            facts: tag_list(body, "facts", "fact"),
            narrative: tag_text(body, "narrative"),
            concepts: tag_list(body, "concepts", "concept"),
            files_read: tag_list(body, "files_read", "file"),
            files_modified: tag_list(body, "files_modified", "file"),
        });
    }

    observations
}

/// Extract the session summary from a model response, if one is present.
///
/// Returns `None` when no `<summary>` block exists or the block is entirely
/// empty; the caller treats that as a materialization failure.
pub fn parse_summary(text: &str, session_db_id: i64) -> Option<SessionSummary> {
    let block_re = block_regex("summary");
    let body = match block_re.captures(text) {
        Some(block) => block[1].to_string(),
        None => {
            tracing::debug!(session_db_id, "No <summary> block in response");
            return None;
        }
    };

    let summary = SessionSummary {
        request: tag_text(&body, "request"),
        investigated: tag_text(&body, "investigated"),
        learned: tag_text(&body, "learned"),
        completed: tag_text(&body, "completed"),
        next_steps: tag_text(&body, "next_steps"),
        notes: tag_text(&body, "notes"),
    };

    // All-empty summaries are as useless as missing ones
    if summary.request.is_none()
        && summary.investigated.is_none()
        && summary.learned.is_none()
        && summary.completed.is_none()
        && summary.next_steps.is_none()
        && summary.notes.is_none()
    {
        return None;
    }

    Some(summary)
}

/// Regex matching `<tag>...</tag>` across lines, capture group 1 = body.
fn block_regex(tag: &str) -> Regex {
    Regex::new(&format!(r"(?s)<{tag}>(.*?)</{tag}>")).expect("static block pattern")
}

/// Text content of the first `<tag>` inside `body`, trimmed; empty → None.
fn tag_text(body: &str, tag: &str) -> Option<String> {
    let re = block_regex(tag);
    let text = re.captures(body)?[1].trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// All `<item>` entries inside the first `<outer>` of `body`.
fn tag_list(body: &str, outer: &str, item: &str) -> Vec<String> {
    let Some(outer_body) = tag_text(body, outer) else {
        return Vec::new();
    };
    block_regex(item)
        .captures_iter(&outer_body)
        .map(|c| c[1].trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
