//! Classification and logging of received application messages.

use mq_connection::Bytes;
use serde_json::Value;

/// Longest text preview written to the log.
const PREVIEW_CHARS: usize = 120;

/// How a received payload was interpreted.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Text(String),
    Binary(usize),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Json(_) => "json",
            Payload::Text(_) => "text",
            Payload::Binary(_) => "binary",
        }
    }
}

/// JSON objects and arrays first, then UTF-8 text, then raw bytes.
pub fn classify(payload: &Bytes) -> Payload {
    if matches!(payload.first(), Some(b'{' | b'[')) {
        if let Ok(value) = serde_json::from_slice::<Value>(payload) {
            return Payload::Json(value);
        }
    }
    match std::str::from_utf8(payload) {
        Ok(text) => Payload::Text(text.to_string()),
        Err(_) => Payload::Binary(payload.len()),
    }
}

/// Short single-line rendering for logs.
pub fn preview(payload: &Payload) -> String {
    let full = match payload {
        Payload::Json(value) => value.to_string(),
        Payload::Text(text) => text.clone(),
        Payload::Binary(len) => return format!("<{len} bytes>"),
    };
    if full.chars().count() <= PREVIEW_CHARS {
        return full;
    }
    let mut cut: String = full.chars().take(PREVIEW_CHARS).collect();
    cut.push_str("...");
    cut
}

/// Log one received message.
pub fn log_message(topic: &str, payload: &Bytes) -> Payload {
    let classified = classify(payload);
    tracing::info!(
        topic,
        bytes = payload.len(),
        kind = classified.kind(),
        preview = %preview(&classified),
        "message received"
    );
    classified
}
