//! Prompt assembly for the summarization workers
//!
//! A [`Mode`] is a named bundle of prompt fragments and allowed observation
//! kinds; the pipeline treats it as an opaque source of strings. Events are
//! rendered as one XML block each so the model sees tool name, timestamp,
//! working directory and the decoded payloads in a uniform shape.

use crate::memory::RecentObservation;
use crate::parser::OBSERVATION_KINDS;
use crate::queue::{RawSummaryRequest, RawToolEvent};
use chrono::DateTime;

/// Per-field character guidance for session summaries. This is an input to
/// the model, not a validator - outputs that ignore it are stored as-is.
const SUMMARY_LENGTH_GUIDANCE: &str = "\
<length_guidance>
  <request>80-120 characters</request>
  <investigated>150-250 characters</investigated>
  <learned>300-500 characters</learned>
  <completed>150-250 characters</completed>
  <next_steps>80-150 characters</next_steps>
  <notes>0-200 characters</notes>
</length_guidance>";

/// A named prompt configuration
#[derive(Debug, Clone)]
pub struct Mode {
    pub name: String,
    /// System-level preamble for event summarization
    pub preamble: String,
    /// System-level preamble for session summaries
    pub summary_preamble: String,
    /// Observation kinds the mode permits
    pub observation_kinds: Vec<String>,
}

impl Default for Mode {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            preamble: "You observe a coding assistant's tool activity and distill it into \
                       durable memory. For each distinct piece of work below, emit an \
                       <observation> block with <type>, <title>, <subtitle>, <facts> \
                       (containing <fact> items), <narrative>, <concepts> (containing \
                       <concept> items), <files_read> and <files_modified> (containing \
                       <file> items). Merge related events into one observation. If \
                       nothing below is worth remembering, emit no blocks at all."
                .to_string(),
            summary_preamble: "You write the end-of-turn memory entry for a coding \
                               assistant session. Emit exactly one <summary> block with \
                               <request>, <investigated>, <learned>, <completed>, \
                               <next_steps> and <notes> children. Ground every field in \
                               the conversation below; leave a field empty rather than \
                               inventing content."
                .to_string(),
            observation_kinds: OBSERVATION_KINDS.iter().map(|k| k.to_string()).collect(),
        }
    }
}

impl Mode {
    /// Default mode with a replacement event preamble (config override).
    pub fn with_preamble(preamble: Option<String>) -> Self {
        let mut mode = Self::default();
        if let Some(preamble) = preamble {
            mode.preamble = preamble;
        }
        mode
    }
}

/// Build the event-summarization prompt for one per-session sub-batch.
pub fn build_event_prompt(mode: &Mode, events: &[RawToolEvent]) -> String {
    let mut prompt = String::with_capacity(1024);
    prompt.push_str(&mode.preamble);
    prompt.push_str("\n\nAllowed observation types: ");
    prompt.push_str(&mode.observation_kinds.join(", "));
    prompt.push_str("\n\n");

    for event in events {
        prompt.push_str(&render_event(event));
        prompt.push('\n');
    }

    prompt
}

/// Build the session-summary prompt for one request.
pub fn build_summary_prompt(
    mode: &Mode,
    request: &RawSummaryRequest,
    recent: &[RecentObservation],
) -> String {
    let mut prompt = String::with_capacity(1024);
    prompt.push_str(&mode.summary_preamble);
    prompt.push_str("\n\n");
    prompt.push_str(SUMMARY_LENGTH_GUIDANCE);
    prompt.push_str("\n\n");

    if !recent.is_empty() {
        prompt.push_str("<recent_activity>\n");
        for obs in recent {
            prompt.push_str(&format!("  <entry type=\"{}\">{}</entry>\n", obs.kind, obs.text));
        }
        prompt.push_str("</recent_activity>\n\n");
    }

    prompt.push_str("<turn>\n");
    if let Some(user_prompt) = &request.user_prompt {
        prompt.push_str(&format!("  <user_prompt>{}</user_prompt>\n", user_prompt));
    }
    if let Some(message) = &request.last_assistant_message {
        prompt.push_str(&format!(
            "  <last_assistant_message>{}</last_assistant_message>\n",
            message
        ));
    }
    prompt.push_str("</turn>\n");

    prompt
}

/// Render one raw event as an XML block.
fn render_event(event: &RawToolEvent) -> String {
    let timestamp = DateTime::from_timestamp_millis(event.created_at_epoch)
        .map(|t| t.to_rfc3339())
        .unwrap_or_default();

    let mut block = format!(
        "<event tool=\"{}\" timestamp=\"{}\">\n",
        event.tool_name, timestamp
    );
    if let Some(cwd) = &event.cwd {
        block.push_str(&format!("  <cwd>{}</cwd>\n", cwd));
    }
    if let Some(input) = &event.tool_input {
        block.push_str(&format!("  <input>{}</input>\n", input));
    }
    if let Some(response) = &event.tool_response {
        block.push_str(&format!("  <output>{}</output>\n", response));
    }
    block.push_str("</event>");
    block
}
