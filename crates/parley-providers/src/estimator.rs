//! Heuristic token estimation
//!
//! Counts are provisional and always replaced by provider-reported usage once
//! a response completes. The heuristic deliberately overestimates a little.

use parley_session::Message;

use crate::types::{ChatRequest, ModelInfo};

const CHARS_PER_TOKEN: f64 = 4.0;
const CODE_FACTOR: f64 = 1.2;
const MESSAGE_OVERHEAD: u32 = 4;
const REQUEST_OVERHEAD: u32 = 10;

const CODE_MARKERS: &[&str] = &[
    "function ", "class ", "public ", "private ", "const ", "var ", "let ", "def ", "import ",
    "from ", "if (", "for (", "while (", "switch (", "=> ", "->", "::", "();", "[]", "{}", "<>",
    "```",
];

/// Estimate tokens for plain text: 0 for empty text, at least 1 otherwise
pub fn estimate_tokens(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }

    let chars = text.chars().count() as f64;
    let mut estimate = (chars / CHARS_PER_TOKEN).ceil() as u32;

    if looks_like_code(text) {
        estimate = (f64::from(estimate) * CODE_FACTOR) as u32;
    }

    estimate.max(1)
}

pub fn estimate_message_tokens(message: &Message) -> u32 {
    estimate_tokens(&message.content) + MESSAGE_OVERHEAD
}

pub fn estimate_request_tokens(request: &ChatRequest) -> u32 {
    let system = request
        .system_prompt
        .as_deref()
        .filter(|prompt| !prompt.is_empty())
        .map(|prompt| estimate_tokens(prompt) + MESSAGE_OVERHEAD)
        .unwrap_or(0);

    let messages: u32 = request.messages.iter().map(estimate_message_tokens).sum();

    system + messages + REQUEST_OVERHEAD
}

/// Estimated USD cost of a call
pub fn estimate_cost(input_tokens: u32, output_tokens: u32, model: &ModelInfo) -> f64 {
    let input = f64::from(input_tokens) / 1_000_000.0 * model.input_cost_per_million;
    let output = f64::from(output_tokens) / 1_000_000.0 * model.output_cost_per_million;
    input + output
}

fn looks_like_code(text: &str) -> bool {
    let lower = text.to_lowercase();
    CODE_MARKERS
        .iter()
        .filter(|marker| lower.contains(*marker))
        .take(2)
        .count()
        >= 2
}
