//! LLM fallback for keep-range selection.
//!
//! When the heuristic packer has no opinion, a small purpose-built agent is
//! asked to pick the ranges. Its only tool is `submit_keep_ranges`, and tool
//! use is forced through the prompt rather than API-level `tool_choice` —
//! some providers reject forced tool choice combined with extended
//! reasoning. The runner makes at most two model calls (the second carries
//! an explicit reminder), honors a caller-supplied abort token linked with
//! an internal timeout, and answers `None` for every failure mode so
//! callers fall back to raw or heuristic output instead of erroring.

use super::ranges::KeepRange;
use crate::errors::ModelError;
use crate::message::Message;
use crate::stores::{GenerateRequest, GenerateResponse, ModelClient, ToolSpec};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Tool name the fallback agent must call.
pub const SUBMIT_RANGES_TOOL: &str = "submit_keep_ranges";

/// Hard cap on model calls per invocation.
const MAX_ATTEMPTS: usize = 2;

/// Options for one fallback invocation.
#[derive(Debug, Clone)]
pub struct FallbackOptions {
    /// Wall-clock budget; expiry aborts the in-flight call.
    pub timeout: Duration,
    /// Output-token budget passed through to the provider.
    pub max_output_tokens: u32,
}

impl Default for FallbackOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            max_output_tokens: 512,
        }
    }
}

/// Runs the single-tool range-selection agent.
pub struct FallbackRunner {
    model: Arc<dyn ModelClient>,
}

#[derive(Debug, Deserialize)]
struct RawRange {
    start: i64,
    end: i64,
}

#[derive(Debug, Deserialize)]
struct RangeArgs {
    ranges: Vec<RawRange>,
}

impl FallbackRunner {
    pub fn new(model: Arc<dyn ModelClient>) -> Self {
        Self { model }
    }

    /// Ask the model which line ranges of `raw_output` to keep.
    ///
    /// Returns `None` on timeout, abort, or two attempts without a usable
    /// tool call — never an error.
    pub async fn select_ranges(
        &self,
        raw_output: &str,
        max_kept_lines: u32,
        options: &FallbackOptions,
        cancel: &CancellationToken,
    ) -> Option<Vec<KeepRange>> {
        // Link the caller's abort signal with our own timeout so an abort
        // mid-call surfaces as a plain `None`.
        let linked = cancel.child_token();
        let attempts = self.run_attempts(raw_output, max_kept_lines, options, &linked);

        match tokio::time::timeout(options.timeout, attempts).await {
            Ok(result) => result,
            Err(_) => {
                // Dropping the future already stopped the work; cancelling
                // the linked token tells the provider to abort its call.
                linked.cancel();
                debug!(timeout_ms = options.timeout.as_millis() as u64, "range fallback timed out");
                None
            }
        }
    }

    async fn run_attempts(
        &self,
        raw_output: &str,
        max_kept_lines: u32,
        options: &FallbackOptions,
        cancel: &CancellationToken,
    ) -> Option<Vec<KeepRange>> {
        for attempt in 0..MAX_ATTEMPTS {
            if cancel.is_cancelled() {
                return None;
            }
            let request = build_request(raw_output, max_kept_lines, options, attempt > 0);
            match self.model.generate(request, cancel).await {
                Ok(response) => {
                    if let Some(ranges) = extract_ranges(&response) {
                        return Some(ranges);
                    }
                    debug!(attempt, "range fallback produced no tool call");
                }
                Err(ModelError::Aborted) => return None,
                Err(err) => {
                    debug!(attempt, error = %err, "range fallback model call failed");
                }
            }
        }
        None
    }
}

fn build_request(
    raw_output: &str,
    max_kept_lines: u32,
    options: &FallbackOptions,
    with_reminder: bool,
) -> GenerateRequest {
    let tool = ToolSpec {
        name: SUBMIT_RANGES_TOOL.to_string(),
        description: "Submit the 1-indexed inclusive line ranges of the command output worth \
                      keeping."
            .to_string(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "ranges": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "start": { "type": "integer" },
                            "end": { "type": "integer" }
                        },
                        "required": ["start", "end"]
                    }
                }
            },
            "required": ["ranges"]
        }),
    };

    let total_lines = raw_output.lines().count();
    let mut prompt = format!(
        "The following command output has {total_lines} lines and must be trimmed to at most \
         {max_kept_lines} kept lines. Select the line ranges that preserve errors, failures and \
         their surrounding context. You MUST answer by calling the `{SUBMIT_RANGES_TOOL}` tool; \
         do not answer in prose.\n\n{raw_output}"
    );
    if with_reminder {
        prompt.push_str(&format!(
            "\n\nReminder: your previous reply contained no tool call. Call \
             `{SUBMIT_RANGES_TOOL}` now with the ranges to keep."
        ));
    }

    GenerateRequest {
        system_prompt: "You trim noisy shell output for a coding agent. You only ever respond \
                        with a single tool call."
            .to_string(),
        messages: vec![Message::user(prompt)],
        tools: vec![tool],
        max_output_tokens: options.max_output_tokens,
    }
}

/// Pull ranges out of the response: a proper tool call first, else a JSON
/// object salvaged from prose (models sometimes print the call as text).
fn extract_ranges(response: &GenerateResponse) -> Option<Vec<KeepRange>> {
    let args = response
        .tool_calls
        .iter()
        .find(|call| call.name == SUBMIT_RANGES_TOOL)
        .map(|call| call.arguments.clone())
        .or_else(|| {
            let json = extract_json_object(&response.text)?;
            serde_json::from_str(&json).ok()
        })?;

    let parsed: RangeArgs = serde_json::from_value(args).ok()?;
    let ranges: Vec<KeepRange> = parsed
        .ranges
        .into_iter()
        .map(|r| KeepRange::new(r.start.max(1) as u32, r.end.max(1) as u32))
        .collect();
    if ranges.is_empty() { None } else { Some(ranges) }
}

/// Extract a JSON object from text that may contain other content.
/// Uses brace-counting to find the outermost JSON object.
fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0;
    let mut end = start;

    for (i, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = start + i + 1;
                    break;
                }
            }
            _ => {}
        }
    }

    if depth == 0 && end > start {
        Some(text[start..end].to_string())
    } else {
        None
    }
}
