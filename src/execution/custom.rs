//! Custom step payloads.
//!
//! Custom steps carry a JSON document of named sub-operations, the shape
//! older recordings were saved in. Three shapes are accepted:
//!
//! ```json
//! { "open_tab": { "url": "https://example.com" }, "input_text": { "index": 3, "text": "rust" } }
//! [ { "click_element_by_index": { "index": 7 } }, { "done": { "text": "ok" } } ]
//! { "action": "switch_tab", "page_id": 1 }
//! ```
//!
//! Unknown operation names are kept as [`SubOp::Skipped`] so one
//! unsupported entry does not discard the rest of the payload.

use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;

const DEFAULT_SCROLL: i64 = 500;

/// One decoded sub-operation.
#[derive(Debug, Clone, PartialEq)]
pub enum SubOp {
    OpenTab { url: String },
    /// Types into the element at `index`, or the focused element
    InputText { index: Option<u32>, text: String },
    ClickElement { index: u32 },
    Scroll { dy: i64 },
    SwitchTab { index: usize },
    ExtractContent { goal: Option<String> },
    SendKeys { keys: String },
    Wait { duration: Duration },
    SavePdf { path: Option<String> },
    /// Ends the sequence
    Done { text: Option<String>, success: bool },
    Skipped { name: String },
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DecodeError {
    #[error("payload is empty")]
    Empty,

    #[error("payload is not valid JSON: {0}")]
    Json(String),

    #[error("payload must be an object or an array of objects")]
    Shape,

    #[error("operation '{op}': {reason}")]
    Operation { op: String, reason: String },
}

/// Decodes a raw payload into sub-operations, in document order.
pub fn decode(raw: &str) -> Result<Vec<SubOp>, DecodeError> {
    if raw.trim().is_empty() {
        return Err(DecodeError::Empty);
    }
    let doc: Value = serde_json::from_str(raw).map_err(|e| DecodeError::Json(e.to_string()))?;
    decode_value(&doc)
}

fn decode_value(doc: &Value) -> Result<Vec<SubOp>, DecodeError> {
    match doc {
        Value::Array(items) => {
            let mut ops = Vec::new();
            for item in items {
                match item {
                    Value::Object(_) => ops.extend(decode_value(item)?),
                    _ => return Err(DecodeError::Shape),
                }
            }
            Ok(ops)
        }
        Value::Object(map) => match map.get("action") {
            Some(Value::String(action)) => {
                let mut params = map.clone();
                params.remove("action");
                Ok(vec![decode_named(action, &Value::Object(params))?])
            }
            Some(_) => Err(DecodeError::Shape),
            None => map
                .iter()
                .map(|(name, params)| decode_named(name, params))
                .collect(),
        },
        _ => Err(DecodeError::Shape),
    }
}

fn op_error(op: &str, reason: impl Into<String>) -> DecodeError {
    DecodeError::Operation {
        op: op.to_string(),
        reason: reason.into(),
    }
}

fn str_param(params: &Map<String, Value>, key: &str) -> Option<String> {
    params.get(key).and_then(Value::as_str).map(String::from)
}

fn uint_param(params: &Map<String, Value>, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|key| params.get(*key).and_then(Value::as_u64))
}

fn index_param<T: TryFrom<u64>>(name: &str, value: u64) -> Result<T, DecodeError> {
    T::try_from(value).map_err(|_| op_error(name, format!("index {} is out of range", value)))
}

fn decode_named(name: &str, params: &Value) -> Result<SubOp, DecodeError> {
    let empty = Map::new();
    let params = match params {
        Value::Object(map) => map,
        Value::Null => &empty,
        _ => return Err(op_error(name, "parameters must be an object")),
    };

    let op = match name {
        "open_tab" | "go_to_url" => SubOp::OpenTab {
            url: str_param(params, "url").ok_or_else(|| op_error(name, "missing 'url'"))?,
        },
        "input_text" => SubOp::InputText {
            index: uint_param(params, &["index"])
                .map(|i| index_param(name, i))
                .transpose()?,
            text: str_param(params, "text").ok_or_else(|| op_error(name, "missing 'text'"))?,
        },
        "click_element_by_index" | "click_element" => SubOp::ClickElement {
            index: index_param(
                name,
                uint_param(params, &["index"]).ok_or_else(|| op_error(name, "missing 'index'"))?,
            )?,
        },
        "scroll_down" | "scroll_up" => {
            let amount = params
                .get("amount")
                .and_then(Value::as_i64)
                .unwrap_or(DEFAULT_SCROLL);
            let dy = if name == "scroll_up" { amount.saturating_neg() } else { amount };
            SubOp::Scroll { dy }
        }
        "switch_tab" => SubOp::SwitchTab {
            index: index_param(name, uint_param(params, &["page_id", "tab", "index"]).unwrap_or(0))?,
        },
        "extract_content" => SubOp::ExtractContent {
            goal: str_param(params, "goal"),
        },
        "send_keys" | "press_key" => SubOp::SendKeys {
            keys: str_param(params, "keys")
                .or_else(|| str_param(params, "key"))
                .ok_or_else(|| op_error(name, "missing 'keys'"))?,
        },
        "wait" => {
            let seconds = params.get("seconds").and_then(Value::as_f64).unwrap_or(1.0);
            if !seconds.is_finite() || seconds < 0.0 {
                return Err(op_error(name, "'seconds' must be a non-negative number"));
            }
            SubOp::Wait {
                duration: Duration::try_from_secs_f64(seconds)
                    .map_err(|_| op_error(name, "'seconds' out of range"))?,
            }
        }
        "save_pdf" => SubOp::SavePdf {
            path: str_param(params, "path"),
        },
        "done" | "mark_completion" => SubOp::Done {
            text: str_param(params, "text").or_else(|| str_param(params, "message")),
            success: params.get("success").and_then(Value::as_bool).unwrap_or(true),
        },
        other => SubOp::Skipped {
            name: other.to_string(),
        },
    };

    Ok(op)
}
