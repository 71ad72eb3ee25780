//! Client-to-server terminal input
//!
//! Keystrokes and control messages share one stream. A message is only
//! treated as control when it passes a cheap syntactic probe (a leading `{`
//! after trimming) and then fully matches a known shape. Everything else,
//! including malformed JSON, is literal terminal input.

use crate::types::TerminalSize;
use serde_json::{Map, Value};

/// One classified message from the client
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Input<'a> {
    /// `{"type":"resize","cols":<number>,"rows":<number>}`
    Resize(TerminalSize),
    /// Literal input for the shell, exactly as received
    Raw(&'a str),
}

impl<'a> Input<'a> {
    /// Classify a decoded client message
    pub fn classify(text: &'a str) -> Self {
        if !looks_like_control(text) {
            return Input::Raw(text);
        }
        match serde_json::from_str::<Value>(text.trim()) {
            Ok(Value::Object(fields)) => match resize_fields(&fields) {
                Some(size) => Input::Resize(size),
                None => Input::Raw(text),
            },
            _ => Input::Raw(text),
        }
    }
}

fn looks_like_control(text: &str) -> bool {
    text.trim_start().starts_with('{')
}

fn resize_fields(fields: &Map<String, Value>) -> Option<TerminalSize> {
    if fields.get("type").and_then(Value::as_str) != Some("resize") {
        return None;
    }
    let cols = cell_count(fields.get("cols")?)?;
    let rows = cell_count(fields.get("rows")?)?;
    Some(TerminalSize::new(cols, rows))
}

// Any JSON number is accepted; float-to-int casts saturate at the u16 range.
fn cell_count(value: &Value) -> Option<u16> {
    value.as_f64().map(|n| n as u16)
}
