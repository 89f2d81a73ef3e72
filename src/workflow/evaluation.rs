//! Evaluator verdicts for the feedback cycle.

use serde::{Deserialize, Serialize};

use crate::workflow::types::{Payload, StageResult};

/// Feedback used when an evaluator's verdict cannot be read.
pub const UNREADABLE_VERDICT_FEEDBACK: &str =
    "Failed to parse evaluation response. Please regenerate the report body.";

/// Verdict produced by the evaluation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub approved: bool,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub feedback: String,
}

impl Evaluation {
    /// Read the verdict from an evaluation stage result.
    ///
    /// Accepts the verdict at the top level of the payload, nested under
    /// `evaluation`, or as JSON text (possibly markdown-wrapped) under
    /// `verdict`. Anything unreadable counts as a rejection so the draft is
    /// regenerated.
    pub fn from_result(result: &StageResult) -> Self {
        read_payload(&result.payload)
            .or_else(|| {
                result
                    .payload
                    .get("evaluation")
                    .and_then(|v| v.as_object())
                    .and_then(read_payload)
            })
            .or_else(|| {
                result
                    .payload
                    .get("verdict")
                    .and_then(|v| v.as_str())
                    .and_then(parse_verdict_text)
            })
            .unwrap_or_else(|| {
                tracing::warn!("Unreadable evaluator verdict, treating as rejection");
                Self {
                    approved: false,
                    score: None,
                    feedback: UNREADABLE_VERDICT_FEEDBACK.to_string(),
                }
            })
    }
}

fn read_payload(payload: &Payload) -> Option<Evaluation> {
    let approved = payload.get("approved")?.as_bool()?;
    let score = payload.get("score").and_then(|v| v.as_f64());
    let feedback = payload
        .get("feedback")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    Some(Evaluation {
        approved,
        score,
        feedback,
    })
}

fn parse_verdict_text(text: &str) -> Option<Evaluation> {
    let json = extract_json_object(text);
    serde_json::from_str::<Evaluation>(&json).ok()
}

/// Locate the JSON object in text written by an evaluator or collaborator.
///
/// A fenced block (```` ```json ```` or bare ```` ``` ````) is unwrapped
/// first, then the first balanced `{...}` span is taken, ignoring braces
/// inside string literals. Text without an object comes back trimmed so the
/// caller's parse error shows what was received.
pub fn extract_json_object(text: &str) -> String {
    let body = unfence(text.trim());
    balanced_object(body).unwrap_or(body).to_string()
}

fn unfence(text: &str) -> &str {
    let Some(open) = text.find("```") else {
        return text;
    };
    let mut inner = &text[open + 3..];
    // Skip a language tag such as `json` on the fence line.
    if let Some(newline) = inner.find('\n')
        && inner[..newline].trim().chars().all(|c| c.is_ascii_alphanumeric())
    {
        inner = &inner[newline + 1..];
    }
    match inner.find("```") {
        Some(close) => inner[..close].trim(),
        None => text,
    }
}

fn balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}
